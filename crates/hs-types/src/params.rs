//! The nested parameter tree sampled for every trial.
//!
//! Recognized top-level sections are `data`, `model`, `fit` and `shared`.
//! Data and model construction receive *copies* of their section merged with
//! `shared`, so nothing a provider does can leak into another trial.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{HsError, HsResult};

pub const DATA_SECTION: &str = "data";
pub const MODEL_SECTION: &str = "model";
pub const FIT_SECTION: &str = "fit";
pub const SHARED_SECTION: &str = "shared";

pub const DEFAULT_EPOCHS: usize = 500;
pub const DEFAULT_PATIENCE: usize = 10;
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_EARLY_STOP_MONITOR: &str = "val_loss";

/// A nested parameter mapping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamTree(Map<String, Value>);

impl ParamTree {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap a JSON value; only objects are valid parameter trees.
    pub fn from_value(value: Value) -> HsResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(HsError::Config(format!(
                "parameter tree must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of a top-level section. Missing or non-object sections are empty.
    pub fn section(&self, name: &str) -> Map<String, Value> {
        match self.0.get(name) {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    pub fn data(&self) -> Map<String, Value> {
        self.section(DATA_SECTION)
    }

    pub fn model(&self) -> Map<String, Value> {
        self.section(MODEL_SECTION)
    }

    pub fn fit(&self) -> Map<String, Value> {
        self.section(FIT_SECTION)
    }

    pub fn shared(&self) -> Map<String, Value> {
        self.section(SHARED_SECTION)
    }

    /// `section` merged with `shared`; shared keys override section keys.
    pub fn merged_with_shared(&self, section: &str) -> Map<String, Value> {
        let mut merged = self.section(section);
        for (key, value) in self.shared() {
            merged.insert(key, value);
        }
        merged
    }

    /// Look up a value by dotted path, e.g. `"model.lr"`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Set a value by dotted path, creating intermediate objects as needed.
    /// Any non-object value sitting on the path is replaced.
    pub fn set(&mut self, path: &str, value: Value) {
        let parts: Vec<&str> = path.split('.').collect();
        let (last, parents) = match parts.split_last() {
            Some(split) => split,
            None => return,
        };

        let mut current = &mut self.0;
        for part in parents {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            match entry {
                Value::Object(map) => current = map,
                _ => return,
            }
        }
        current.insert(last.to_string(), value);
    }

    /// Copy of this tree with the `fit` defaults filled in, plus the typed
    /// view of the resulting `fit` section.
    pub fn with_fit_defaults(&self) -> HsResult<(ParamTree, FitParams)> {
        let mut fit = match self.0.get(FIT_SECTION) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(HsError::Config(format!(
                    "`fit` must be an object, got {other}"
                )))
            }
        };

        let defaults = [
            ("epochs", Value::from(DEFAULT_EPOCHS)),
            ("patience", Value::from(DEFAULT_PATIENCE)),
            ("batch_size", Value::from(DEFAULT_BATCH_SIZE)),
            ("early_stop_monitor", Value::from(DEFAULT_EARLY_STOP_MONITOR)),
        ];
        for (key, default) in defaults {
            if fit.get(key).map_or(true, Value::is_null) {
                fit.insert(key.to_string(), default);
            }
        }

        let typed: FitParams = serde_json::from_value(Value::Object(fit.clone()))
            .map_err(|e| HsError::Config(format!("invalid `fit` parameters: {e}")))?;

        let mut tree = self.clone();
        tree.0.insert(FIT_SECTION.to_string(), Value::Object(fit));
        Ok((tree, typed))
    }

    /// Typed `fit` section of a tree that already went through
    /// [`ParamTree::with_fit_defaults`].
    pub fn fit_params(&self) -> HsResult<FitParams> {
        serde_json::from_value(Value::Object(self.fit()))
            .map_err(|e| HsError::Config(format!("invalid `fit` parameters: {e}")))
    }
}

impl From<Map<String, Value>> for ParamTree {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Typed view of the `fit` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitParams {
    pub epochs: usize,
    pub patience: usize,
    pub batch_size: usize,
    pub early_stop_monitor: String,
    #[serde(default)]
    pub use_weight: bool,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            patience: DEFAULT_PATIENCE,
            batch_size: DEFAULT_BATCH_SIZE,
            early_stop_monitor: DEFAULT_EARLY_STOP_MONITOR.to_string(),
            use_weight: false,
        }
    }
}
