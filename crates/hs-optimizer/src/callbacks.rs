//! Training callbacks driven by a model's `fit` loop.
//!
//! The orchestrator opens and closes a [`CallbackList`] around each fit; the
//! model's `fit` calls [`CallbackList::epoch_end`] once per epoch with that
//! epoch's metrics. The list records every epoch into an [`EpochTable`],
//! which becomes the run's training history.

use chrono::Utc;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use hs_types::{EpochTable, HsResult, MetricMode, Metrics};

/// What the fit loop should do after a callback ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Hook into the fit loop. Only `on_epoch_end` is required.
pub trait TrainingCallback: Send {
    fn name(&self) -> &'static str;

    fn on_train_begin(&mut self) -> HsResult<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Metrics) -> HsResult<CallbackAction>;

    fn on_train_end(&mut self) -> HsResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Early stopping
// ---------------------------------------------------------------------------

/// Stops training once `monitor` has not improved for `patience` epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    monitor: String,
    patience: usize,
    mode: MetricMode,
    best: Option<f64>,
    wait: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    /// The direction is inferred from the monitored name: accuracy-like and
    /// f-measure metrics are maximized, everything else minimized.
    pub fn new(monitor: impl Into<String>, patience: usize) -> Self {
        let monitor = monitor.into();
        let mode = infer_mode(&monitor);
        Self::with_mode(monitor, patience, mode)
    }

    pub fn with_mode(monitor: impl Into<String>, patience: usize, mode: MetricMode) -> Self {
        Self {
            monitor: monitor.into(),
            patience,
            mode,
            best: None,
            wait: 0,
            stopped_epoch: None,
        }
    }

    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    pub fn mode(&self) -> MetricMode {
        self.mode
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    fn improved(&self, current: f64) -> bool {
        match self.best {
            None => true,
            Some(best) => match self.mode {
                MetricMode::Min => current < best,
                MetricMode::Max => current > best,
            },
        }
    }
}

/// Monitor direction from the metric name.
pub fn infer_mode(monitor: &str) -> MetricMode {
    if monitor.contains("acc") || monitor.starts_with("fmeasure") {
        MetricMode::Max
    } else {
        MetricMode::Min
    }
}

impl TrainingCallback for EarlyStopping {
    fn name(&self) -> &'static str {
        "EarlyStopping"
    }

    fn on_train_begin(&mut self) -> HsResult<()> {
        self.best = None;
        self.wait = 0;
        self.stopped_epoch = None;
        Ok(())
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Metrics) -> HsResult<CallbackAction> {
        let Some(current) = logs.get(&self.monitor).copied() else {
            warn!(
                monitor = %self.monitor,
                available = ?logs.keys().collect::<Vec<_>>(),
                "Early stopping requires the monitored metric; skipping epoch"
            );
            return Ok(CallbackAction::Continue);
        };

        if self.improved(current) {
            self.best = Some(current);
            self.wait = 0;
            return Ok(CallbackAction::Continue);
        }

        self.wait += 1;
        if self.wait >= self.patience {
            self.stopped_epoch = Some(epoch);
            info!(epoch, monitor = %self.monitor, "Early stopping");
            return Ok(CallbackAction::Stop);
        }
        Ok(CallbackAction::Continue)
    }
}

// ---------------------------------------------------------------------------
// Progress log
// ---------------------------------------------------------------------------

/// File name of the event log inside a progress directory.
pub const PROGRESS_FILE: &str = "events.jsonl";

/// Appends one JSON line per epoch to `<dir>/events.jsonl`.
#[derive(Debug)]
pub struct ProgressLog {
    dir: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl ProgressLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writer: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl TrainingCallback for ProgressLog {
    fn name(&self) -> &'static str {
        "ProgressLog"
    }

    fn on_train_begin(&mut self) -> HsResult<()> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(PROGRESS_FILE))?;
        self.writer = Some(BufWriter::new(file));
        debug!(dir = %self.dir.display(), "Progress log opened");
        Ok(())
    }

    fn on_epoch_end(&mut self, epoch: usize, logs: &Metrics) -> HsResult<CallbackAction> {
        if let Some(writer) = self.writer.as_mut() {
            let mut event = Map::new();
            event.insert("epoch".to_string(), Value::from(epoch));
            event.insert("wall_time".to_string(), Value::from(Utc::now().to_rfc3339()));
            for (name, value) in logs {
                event.insert(name.clone(), Value::from(*value));
            }
            serde_json::to_writer(&mut *writer, &event)?;
            writer.write_all(b"\n")?;
        }
        Ok(CallbackAction::Continue)
    }

    fn on_train_end(&mut self) -> HsResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Callback list
// ---------------------------------------------------------------------------

/// The callbacks of one fit, plus the epoch history they observed.
#[derive(Default)]
pub struct CallbackList {
    callbacks: Vec<Box<dyn TrainingCallback>>,
    history: EpochTable,
    stopped: bool,
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.callbacks.iter().map(|c| c.name()).collect()
    }

    /// Whether a callback asked to stop.
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn history(&self) -> &EpochTable {
        &self.history
    }

    pub fn into_history(self) -> EpochTable {
        self.history
    }

    pub fn train_begin(&mut self) -> HsResult<()> {
        self.stopped = false;
        for callback in &mut self.callbacks {
            callback.on_train_begin()?;
        }
        Ok(())
    }

    /// Record the epoch, then run every callback. Returns `Stop` if any of
    /// them asked for it.
    pub fn epoch_end(&mut self, epoch: usize, logs: &Metrics) -> HsResult<CallbackAction> {
        self.history.push(epoch, logs);
        let mut action = CallbackAction::Continue;
        for callback in &mut self.callbacks {
            if callback.on_epoch_end(epoch, logs)? == CallbackAction::Stop {
                action = CallbackAction::Stop;
            }
        }
        if action == CallbackAction::Stop {
            self.stopped = true;
        }
        Ok(action)
    }

    pub fn train_end(&mut self) -> HsResult<()> {
        for callback in &mut self.callbacks {
            callback.on_train_end()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CallbackList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackList")
            .field("callbacks", &self.names())
            .field("epochs", &self.history.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs(val_loss: f64) -> Metrics {
        Metrics::from([("loss".to_string(), 1.0), ("val_loss".to_string(), val_loss)])
    }

    #[test]
    fn mode_inference() {
        assert_eq!(infer_mode("val_acc"), MetricMode::Max);
        assert_eq!(infer_mode("accuracy"), MetricMode::Max);
        assert_eq!(infer_mode("fmeasure"), MetricMode::Max);
        assert_eq!(infer_mode("val_loss"), MetricMode::Min);
    }

    #[test]
    fn early_stopping_waits_for_patience() {
        let mut es = EarlyStopping::new("val_loss", 2);
        es.on_train_begin().unwrap();
        assert_eq!(es.on_epoch_end(0, &logs(1.0)).unwrap(), CallbackAction::Continue);
        assert_eq!(es.on_epoch_end(1, &logs(0.5)).unwrap(), CallbackAction::Continue);
        assert_eq!(es.on_epoch_end(2, &logs(0.6)).unwrap(), CallbackAction::Continue);
        assert_eq!(es.on_epoch_end(3, &logs(0.7)).unwrap(), CallbackAction::Stop);
        assert_eq!(es.best(), Some(0.5));
        assert_eq!(es.stopped_epoch(), Some(3));
    }

    #[test]
    fn early_stopping_ignores_missing_monitor() {
        let mut es = EarlyStopping::new("val_auc", 1);
        assert_eq!(es.on_epoch_end(0, &logs(1.0)).unwrap(), CallbackAction::Continue);
        assert_eq!(es.on_epoch_end(1, &logs(2.0)).unwrap(), CallbackAction::Continue);
    }

    #[test]
    fn callback_list_records_history_and_stops() {
        let mut list = CallbackList::new();
        list.push(Box::new(EarlyStopping::new("val_loss", 1)));
        list.train_begin().unwrap();

        let mut epoch = 0;
        while list.epoch_end(epoch, &logs(1.0)).unwrap() == CallbackAction::Continue {
            epoch += 1;
        }
        list.train_end().unwrap();

        assert!(list.stopped());
        assert_eq!(list.history().len(), 2);
        assert_eq!(list.into_history().logged_epochs().unwrap(), 2);
    }

    #[test]
    fn progress_log_writes_one_line_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("tensorboard").join("a=1;rid");
        let mut log = ProgressLog::new(&log_dir);
        log.on_train_begin().unwrap();
        log.on_epoch_end(0, &logs(0.3)).unwrap();
        log.on_epoch_end(1, &logs(0.2)).unwrap();
        log.on_train_end().unwrap();

        let text = std::fs::read_to_string(log_dir.join(PROGRESS_FILE)).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["epoch"], 1);
        assert_eq!(lines[1]["val_loss"], 0.2);
    }
}
