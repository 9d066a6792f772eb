//! Shapes produced by one training run and stored as a trial's result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{HsError, HsResult};
use crate::params::ParamTree;

/// Queue-assigned trial identifier.
pub type Tid = u64;

/// Metric name -> scalar value.
pub type Metrics = BTreeMap<String, f64>;

/// Random run identifier used to name model and result files.
///
/// Decoupled from [`Tid`] so that storage paths survive a re-submission of
/// the same trial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Result status of a trial, as reported by the worker that ran it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    New,
    Running,
    Ok,
    Fail,
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrialStatus::New => "new",
            TrialStatus::Running => "running",
            TrialStatus::Ok => "ok",
            TrialStatus::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// Whether the loss metric should be minimized or maximized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricMode {
    #[default]
    Min,
    Max,
}

impl MetricMode {
    /// Sign-adjust a metric value so that lower is always better.
    pub fn to_loss(self, value: f64) -> f64 {
        match self {
            MetricMode::Min => value,
            MetricMode::Max => -value,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricMode::Min => "min",
            MetricMode::Max => "max",
        }
    }
}

impl FromStr for MetricMode {
    type Err = HsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min" => Ok(MetricMode::Min),
            "max" => Ok(MetricMode::Max),
            other => Err(HsError::Config(format!(
                "loss_metric_mode must be one of {{min, max}}, got `{other}`"
            ))),
        }
    }
}

// serde_json writes non-finite floats as `null`; read those back as NaN.
fn nullable_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

fn nullable_metrics<'de, D>(deserializer: D) -> Result<Option<Metrics>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Option<f64>>>::deserialize(deserializer)?;
    Ok(raw.map(|metrics| {
        metrics
            .into_iter()
            .map(|(name, value)| (name, value.unwrap_or(f64::NAN)))
            .collect()
    }))
}

#[derive(Deserialize)]
struct RawEpochTable {
    epoch: Vec<usize>,
    #[serde(flatten)]
    series: BTreeMap<String, Vec<Option<f64>>>,
}

impl From<RawEpochTable> for EpochTable {
    fn from(raw: RawEpochTable) -> Self {
        Self {
            epoch: raw.epoch,
            series: raw
                .series
                .into_iter()
                .map(|(name, values)| {
                    let values = values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect();
                    (name, values)
                })
                .collect(),
        }
    }
}

/// Per-epoch series recorded during one fit: an `epoch` index column plus
/// one column per logged metric.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "RawEpochTable")]
pub struct EpochTable {
    pub epoch: Vec<usize>,
    #[serde(flatten)]
    pub series: BTreeMap<String, Vec<f64>>,
}

impl EpochTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one epoch worth of logs.
    pub fn push(&mut self, epoch: usize, logs: &Metrics) {
        self.epoch.push(epoch);
        for (name, value) in logs {
            self.series.entry(name.clone()).or_default().push(*value);
        }
    }

    pub fn len(&self) -> usize {
        self.epoch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epoch.is_empty()
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    /// Every series must have one value per logged epoch.
    pub fn validate(&self) -> HsResult<()> {
        for (name, values) in &self.series {
            if values.len() != self.epoch.len() {
                return Err(HsError::corrupted(format!(
                    "series `{name}` has {} values for {} epochs",
                    values.len(),
                    self.epoch.len()
                )));
            }
        }
        Ok(())
    }

    /// Number of epochs actually run: highest logged epoch index + 1.
    pub fn logged_epochs(&self) -> HsResult<usize> {
        self.epoch
            .iter()
            .max()
            .map(|max| max + 1)
            .ok_or_else(|| HsError::corrupted("history has no logged epochs"))
    }

    /// Final value of every metric series.
    pub fn last_values(&self) -> HsResult<Metrics> {
        self.validate()?;
        self.series
            .iter()
            .map(|(name, values)| {
                values
                    .last()
                    .map(|v| (name.clone(), *v))
                    .ok_or_else(|| HsError::corrupted(format!("series `{name}` is empty")))
            })
            .collect()
    }
}

/// Training history of one fit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainHistory {
    /// Fit parameters the run was started with.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Per-epoch loss and metric series.
    pub loss: EpochTable,
}

/// A single-split history, or one history per cross-validation fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum History {
    KFold(Vec<TrainHistory>),
    Single(TrainHistory),
}

impl History {
    pub fn is_kfold(&self) -> bool {
        matches!(self, History::KFold(_))
    }

    pub fn folds(&self) -> &[TrainHistory] {
        match self {
            History::KFold(folds) => folds,
            History::Single(hist) => std::slice::from_ref(hist),
        }
    }

    /// The epoch count that would have been optimal for an early-stopped run.
    ///
    /// A run that used its whole `epochs` budget returns the budget; otherwise
    /// the last `patience` epochs were spent waiting for an improvement that
    /// never came. For k-fold histories the floor of the mean across folds is
    /// returned.
    pub fn optimal_epochs(&self, epochs: usize, patience: usize) -> HsResult<usize> {
        let optimal_len = |hist: &TrainHistory| -> HsResult<usize> {
            let logged = hist.loss.logged_epochs()?;
            if logged == epochs {
                Ok(epochs)
            } else {
                Ok(logged.saturating_sub(patience))
            }
        };

        match self {
            History::Single(hist) => optimal_len(hist),
            History::KFold(folds) => {
                if folds.is_empty() {
                    return Err(HsError::corrupted("k-fold history has no folds"));
                }
                let total = folds
                    .iter()
                    .map(optimal_len)
                    .sum::<HsResult<usize>>()?;
                Ok(total / folds.len())
            }
        }
    }
}

/// Where the model and the result document of a run were written.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultPaths {
    pub model: Option<PathBuf>,
    pub results: Option<PathBuf>,
}

/// Names of the capabilities and metric a run was produced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultNames {
    pub data: String,
    pub model: String,
    pub loss_metric: String,
    pub loss_metric_mode: MetricMode,
}

/// Phase durations, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Durations {
    pub total: f64,
    pub dataload: f64,
    pub training: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration: Durations,
}

impl Timing {
    pub fn new(start: DateTime<Utc>, data_loaded: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let secs = |from: DateTime<Utc>, to: DateTime<Utc>| {
            (to - from).num_microseconds().unwrap_or(0) as f64 / 1e6
        };
        Self {
            start,
            end,
            duration: Durations {
                total: secs(start, end),
                dataload: secs(start, data_loaded),
                training: secs(data_loaded, end),
            },
        }
    }
}

/// Everything one training run reports back to the trial store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Sign-adjusted loss metric; always minimized downstream.
    #[serde(deserialize_with = "nullable_f64")]
    pub loss: f64,
    pub status: TrialStatus,
    /// Evaluation metrics. Older documents may lack it, in which case it is
    /// summarized from `history` on export.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "nullable_metrics"
    )]
    pub eval: Option<Metrics>,
    pub param: ParamTree,
    pub path: ResultPaths,
    pub name: ResultNames,
    pub history: History,
    pub time: Timing,
}

impl ResultRecord {
    /// Write the record as a pretty-printed JSON document.
    pub fn write_json(&self, path: &Path) -> HsResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> HsResult<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// The record as a JSON object, for flattening into a table row.
    pub fn to_json_map(&self) -> HsResult<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(HsError::Internal(
                "result record did not serialize to an object".to_string(),
            )),
        }
    }
}
