//! Supplemental evaluation metrics.
//!
//! A metric is either a name resolved through the built-in registry or a
//! user-supplied function carrying its own display name. Every metric is
//! called as `f(y_true, y_pred)` on the whole validation split.

use std::fmt;
use std::sync::Arc;

use hs_types::{config_error, HsResult};

/// Signature shared by every evaluation metric.
pub type MetricFn = Arc<dyn Fn(&[f64], &[f64]) -> f64 + Send + Sync>;

/// Names understood by [`EvalMetric::Named`].
pub const REGISTRY: &[&str] = &[
    "accuracy",
    "f1",
    "mcc",
    "mse",
    "mae",
    "rmse",
    "cor",
    "var_explained",
];

/// A supplemental metric as requested by the caller.
#[derive(Clone)]
pub enum EvalMetric {
    Named(String),
    Custom { name: String, func: MetricFn },
}

impl EvalMetric {
    pub fn named(name: impl Into<String>) -> Self {
        EvalMetric::Named(name.into())
    }

    pub fn custom<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[f64], &[f64]) -> f64 + Send + Sync + 'static,
    {
        EvalMetric::Custom {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EvalMetric::Named(name) => name,
            EvalMetric::Custom { name, .. } => name,
        }
    }

    /// Resolve to a callable; unknown registry names are a configuration error.
    pub fn resolve(&self) -> HsResult<MetricFn> {
        match self {
            EvalMetric::Named(name) => lookup(name).ok_or_else(|| {
                config_error!("unknown eval metric `{name}`, expected one of {REGISTRY:?}")
            }),
            EvalMetric::Custom { func, .. } => Ok(func.clone()),
        }
    }
}

impl fmt::Debug for EvalMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalMetric::Named(name) => f.debug_tuple("Named").field(name).finish(),
            EvalMetric::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

/// Resolve a list of metrics into `(name, fn)` pairs. Duplicate names are
/// rejected.
pub fn resolve_metrics(metrics: &[EvalMetric]) -> HsResult<Vec<(String, MetricFn)>> {
    let mut resolved: Vec<(String, MetricFn)> = Vec::with_capacity(metrics.len());
    for metric in metrics {
        if resolved.iter().any(|(name, _)| name == metric.name()) {
            return Err(config_error!("eval metric `{}` given twice", metric.name()));
        }
        resolved.push((metric.name().to_string(), metric.resolve()?));
    }
    Ok(resolved)
}

fn lookup(name: &str) -> Option<MetricFn> {
    let metric: fn(&[f64], &[f64]) -> f64 = match name {
        "accuracy" => accuracy,
        "f1" => f1,
        "mcc" => mcc,
        "mse" => mse,
        "mae" => mae,
        "rmse" => rmse,
        "cor" => cor,
        "var_explained" => var_explained,
        _ => return None,
    };
    let func: MetricFn = Arc::new(metric);
    Some(func)
}

// ---------------------------------------------------------------------------
// Classification (binary, threshold 0.5)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct Confusion {
    tp: f64,
    tn: f64,
    fp: f64,
    fn_: f64,
}

fn confusion(y_true: &[f64], y_pred: &[f64]) -> Confusion {
    let mut c = Confusion::default();
    for (t, p) in y_true.iter().zip(y_pred) {
        match (*t > 0.5, *p > 0.5) {
            (true, true) => c.tp += 1.0,
            (false, false) => c.tn += 1.0,
            (false, true) => c.fp += 1.0,
            (true, false) => c.fn_ += 1.0,
        }
    }
    c
}

pub fn accuracy(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let c = confusion(y_true, y_pred);
    let total = c.tp + c.tn + c.fp + c.fn_;
    if total == 0.0 {
        return f64::NAN;
    }
    (c.tp + c.tn) / total
}

pub fn f1(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let c = confusion(y_true, y_pred);
    let denom = 2.0 * c.tp + c.fp + c.fn_;
    if denom == 0.0 {
        return 0.0;
    }
    2.0 * c.tp / denom
}

/// Matthews correlation coefficient.
pub fn mcc(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let c = confusion(y_true, y_pred);
    let denom = ((c.tp + c.fp) * (c.tp + c.fn_) * (c.tn + c.fp) * (c.tn + c.fn_)).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (c.tp * c.tn - c.fp * c.fn_) / denom
}

// ---------------------------------------------------------------------------
// Regression
// ---------------------------------------------------------------------------

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

fn variance(values: &[f64]) -> f64 {
    let m = mean(values.iter().copied());
    mean(values.iter().map(|v| (v - m).powi(2)))
}

pub fn mse(y_true: &[f64], y_pred: &[f64]) -> f64 {
    mean(y_true.iter().zip(y_pred).map(|(t, p)| (t - p).powi(2)))
}

pub fn mae(y_true: &[f64], y_pred: &[f64]) -> f64 {
    mean(y_true.iter().zip(y_pred).map(|(t, p)| (t - p).abs()))
}

pub fn rmse(y_true: &[f64], y_pred: &[f64]) -> f64 {
    mse(y_true, y_pred).sqrt()
}

/// Pearson correlation.
pub fn cor(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let mt = mean(y_true.iter().copied());
    let mp = mean(y_pred.iter().copied());
    let (mut cov, mut vt, mut vp) = (0.0, 0.0, 0.0);
    for (t, p) in y_true.iter().zip(y_pred) {
        cov += (t - mt) * (p - mp);
        vt += (t - mt).powi(2);
        vp += (p - mp).powi(2);
    }
    cov / (vt * vp).sqrt()
}

/// Fraction of variance explained: `1 - var(y_true - y_pred) / var(y_true)`.
pub fn var_explained(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let residuals: Vec<f64> = y_true.iter().zip(y_pred).map(|(t, p)| t - p).collect();
    1.0 - variance(&residuals) / variance(y_true)
}
