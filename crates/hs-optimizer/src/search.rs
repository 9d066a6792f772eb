//! Search space definitions and parameter samplers.
//!
//! Parameter names are dotted paths into the parameter tree
//! (`"model.lr"`, `"fit.batch_size"`), so one flat list of dimensions
//! samples into the nested `data` / `model` / `fit` / `shared` layout.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use hs_types::ParamTree;

/// A single dimension of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Dotted path in the parameter tree (e.g. "model.lr").
    pub name: String,
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<Value> },
    /// A constant that is always emitted as is.
    Fixed { value: Value },
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::FloatRange { low, high })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.push(name, ParameterKind::IntRange { low, high })
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::LogUniform { low, high })
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.push(name, ParameterKind::Choice { values })
    }

    pub fn add_fixed(self, name: impl Into<String>, value: Value) -> Self {
        self.push(name, ParameterKind::Fixed { value })
    }

    /// Total number of grid points (returns `None` if any parameter is
    /// continuous without a natural grid).
    pub fn grid_size(&self) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            let dim_size = match &param.kind {
                ParameterKind::IntRange { low, high } => (high - low + 1).max(0) as usize,
                ParameterKind::Choice { values } => values.len(),
                ParameterKind::Fixed { .. } => 1,
                _ => return None,
            };
            total = total.checked_mul(dim_size)?;
        }
        Some(total)
    }
}

// ---------------------------------------------------------------------------
// Samplers
// ---------------------------------------------------------------------------

/// Produces parameter trees from a search space.
pub trait ParameterSampler: Send {
    /// Next parameter tree, or `None` once the sampler is exhausted.
    fn sample(&mut self) -> Option<ParamTree>;

    /// Up to `count` parameter trees.
    fn suggest(&mut self, count: usize) -> Vec<ParamTree> {
        (0..count).map_while(|_| self.sample()).collect()
    }

    /// Human-readable sampler name.
    fn name(&self) -> &str;
}

// ---- Grid search ----

/// Exhaustive grid search over discrete parameter combinations.
#[derive(Debug, Clone)]
pub struct GridSearch {
    cursor: usize,
    combos: Vec<ParamTree>,
}

impl GridSearch {
    /// `float_steps` points are laid out along every continuous dimension.
    pub fn new(space: &SearchSpace, float_steps: usize) -> Self {
        Self {
            cursor: 0,
            combos: Self::build_grid(space, float_steps),
        }
    }

    pub fn len(&self) -> usize {
        self.combos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combos.is_empty()
    }

    fn axis(kind: &ParameterKind, float_steps: usize) -> Vec<Value> {
        let steps = float_steps.max(2);
        let lerp = |i: usize, low: f64, high: f64| {
            let t = i as f64 / (steps - 1) as f64;
            low + t * (high - low)
        };
        match kind {
            ParameterKind::FloatRange { low, high } => {
                (0..steps).map(|i| Value::from(lerp(i, *low, *high))).collect()
            }
            ParameterKind::IntRange { low, high } => (*low..=*high).map(Value::from).collect(),
            ParameterKind::LogUniform { low, high } => (0..steps)
                .map(|i| Value::from(lerp(i, low.ln(), high.ln()).exp()))
                .collect(),
            ParameterKind::Choice { values } => values.clone(),
            ParameterKind::Fixed { value } => vec![value.clone()],
        }
    }

    fn build_grid(space: &SearchSpace, float_steps: usize) -> Vec<ParamTree> {
        // Cartesian product
        let mut result = vec![ParamTree::new()];
        for param in &space.parameters {
            let axis = Self::axis(&param.kind, float_steps);
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for value in &axis {
                    let mut combo = existing.clone();
                    combo.set(&param.name, value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }
        result
    }
}

impl ParameterSampler for GridSearch {
    fn sample(&mut self) -> Option<ParamTree> {
        let next = self.combos.get(self.cursor).cloned();
        if next.is_some() {
            self.cursor += 1;
        }
        next
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self {
            space,
            rng: ChaCha8Rng::from_entropy(),
        }
    }

    /// Reproducible sampling.
    pub fn with_seed(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn sample_value(rng: &mut ChaCha8Rng, kind: &ParameterKind) -> Value {
        match kind {
            ParameterKind::FloatRange { low, high } => Value::from(rng.gen_range(*low..=*high)),
            ParameterKind::IntRange { low, high } => Value::from(rng.gen_range(*low..=*high)),
            ParameterKind::LogUniform { low, high } => {
                let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
                Value::from(log_val.exp())
            }
            ParameterKind::Choice { values } => {
                values.choose(rng).cloned().unwrap_or(Value::Null)
            }
            ParameterKind::Fixed { value } => value.clone(),
        }
    }
}

impl ParameterSampler for RandomSearch {
    fn sample(&mut self) -> Option<ParamTree> {
        let mut tree = ParamTree::new();
        for param in &self.space.parameters {
            tree.set(&param.name, Self::sample_value(&mut self.rng, &param.kind));
        }
        Some(tree)
    }

    fn name(&self) -> &str {
        "random"
    }
}
