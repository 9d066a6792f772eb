//! Fake providers shared by the unit tests of this crate.

use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hs_types::{HsResult, Metrics, TrainingError};

use crate::callbacks::{CallbackAction, CallbackList};
use crate::data::Dataset;
use crate::provider::{DataProvider, FitOptions, ModelProvider, TrainableModel};

/// `n` rows with one feature each; labels alternate 0/1 and equal the
/// feature parity.
pub struct FakeData {
    pub n: usize,
    pub weighted: bool,
}

impl FakeData {
    pub fn new(n: usize) -> Self {
        Self { n, weighted: false }
    }
}

impl DataProvider for FakeData {
    fn name(&self) -> &str {
        "fake_data"
    }

    fn load(&self, _params: &Map<String, Value>) -> HsResult<(Dataset, Dataset)> {
        let features: Vec<Vec<f64>> = (0..self.n).map(|i| vec![i as f64]).collect();
        let labels: Vec<f64> = (0..self.n).map(|i| (i % 2) as f64).collect();
        let mut train = Dataset::new(features, labels)?;
        if self.weighted {
            train = train.with_sample_weight(vec![1.0; self.n])?;
        }
        let test = train.head(2);
        Ok((train, test))
    }
}

type EpochHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Builds [`FakeModel`]s and counts how often they were fitted.
#[derive(Clone)]
pub struct FakeModelProvider {
    /// Native metric names and the values `evaluate` reports for them.
    pub native: Vec<(String, f64)>,
    /// Epoch after which `val_loss` stops improving.
    pub plateau_at: usize,
    pub fit_calls: Arc<AtomicUsize>,
    pub built_with_rows: Arc<AtomicUsize>,
    /// Called at the start of every fitted epoch.
    pub epoch_hook: Option<EpochHook>,
}

impl FakeModelProvider {
    pub fn new(native: &[(&str, f64)]) -> Self {
        Self {
            native: native.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
            plateau_at: usize::MAX,
            fit_calls: Arc::new(AtomicUsize::new(0)),
            built_with_rows: Arc::new(AtomicUsize::new(0)),
            epoch_hook: None,
        }
    }

    pub fn with_plateau(mut self, epoch: usize) -> Self {
        self.plateau_at = epoch;
        self
    }

    pub fn on_epoch(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.epoch_hook = Some(Arc::new(hook));
        self
    }

    pub fn fits(&self) -> usize {
        self.fit_calls.load(Ordering::SeqCst)
    }
}

impl ModelProvider for FakeModelProvider {
    fn name(&self) -> &str {
        "fake_model"
    }

    fn build(
        &self,
        _params: &Map<String, Value>,
        train_data: &Dataset,
    ) -> HsResult<Box<dyn TrainableModel>> {
        self.built_with_rows.store(train_data.len(), Ordering::SeqCst);
        Ok(Box::new(FakeModel {
            native: self.native.clone(),
            plateau_at: self.plateau_at,
            fit_calls: self.fit_calls.clone(),
            epoch_hook: self.epoch_hook.clone(),
        }))
    }

    fn load(&self, path: &Path) -> HsResult<Box<dyn TrainableModel>> {
        let doc: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if doc["kind"] != "fake" {
            return Err(TrainingError::Model {
                message: format!("{} is not a fake model", path.display()),
            }
            .into());
        }
        Ok(Box::new(FakeModel {
            native: self.native.clone(),
            plateau_at: self.plateau_at,
            fit_calls: self.fit_calls.clone(),
            epoch_hook: self.epoch_hook.clone(),
        }))
    }
}

pub struct FakeModel {
    native: Vec<(String, f64)>,
    plateau_at: usize,
    fit_calls: Arc<AtomicUsize>,
    epoch_hook: Option<EpochHook>,
}

impl TrainableModel for FakeModel {
    fn metrics_names(&self) -> Vec<String> {
        self.native.iter().map(|(n, _)| n.clone()).collect()
    }

    fn fit(
        &mut self,
        train: &Dataset,
        options: &FitOptions<'_>,
        callbacks: &mut CallbackList,
    ) -> HsResult<()> {
        self.fit_calls.fetch_add(1, Ordering::SeqCst);
        if options.use_sample_weight && train.sample_weight.is_none() {
            return Err(TrainingError::Data {
                message: "missing sample weights".to_string(),
            }
            .into());
        }
        for epoch in 0..options.epochs {
            if let Some(hook) = &self.epoch_hook {
                hook(epoch);
            }
            let val_loss = 1.0 / (epoch.min(self.plateau_at) + 1) as f64;
            let logs = Metrics::from([
                ("loss".to_string(), val_loss * 0.9),
                ("val_loss".to_string(), val_loss),
            ]);
            if callbacks.epoch_end(epoch, &logs)? == CallbackAction::Stop {
                break;
            }
        }
        Ok(())
    }

    fn evaluate(&self, _data: &Dataset) -> HsResult<Vec<f64>> {
        Ok(self.native.iter().map(|(_, v)| *v).collect())
    }

    fn predict(&self, features: &[Vec<f64>]) -> HsResult<Vec<f64>> {
        Ok(features
            .iter()
            .map(|row| row.first().map_or(0.0, |x| x % 2.0))
            .collect())
    }

    fn save(&self, path: &Path) -> HsResult<()> {
        std::fs::write(path, json!({"kind": "fake"}).to_string())?;
        Ok(())
    }
}
