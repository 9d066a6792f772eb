//! Data and model capabilities consumed by the orchestrator.

use serde_json::{Map, Value};
use std::path::Path;

use hs_types::HsResult;

use crate::callbacks::CallbackList;
use crate::data::Dataset;

/// Loads the data for one trial.
pub trait DataProvider: Send + Sync {
    /// Recorded in the result document.
    fn name(&self) -> &str;

    /// Returns `(train, test)` for the `data` section merged with `shared`.
    fn load(&self, params: &Map<String, Value>) -> HsResult<(Dataset, Dataset)>;
}

/// Builds and reloads trainable models.
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Build a fresh model from the `model` section merged with `shared`.
    /// `train_data` is the split the model will be fitted on.
    fn build(
        &self,
        params: &Map<String, Value>,
        train_data: &Dataset,
    ) -> HsResult<Box<dyn TrainableModel>>;

    /// Reload a model written by [`TrainableModel::save`].
    fn load(&self, path: &Path) -> HsResult<Box<dyn TrainableModel>>;
}

/// Options passed to [`TrainableModel::fit`].
#[derive(Debug, Clone, Copy)]
pub struct FitOptions<'a> {
    pub batch_size: usize,
    pub epochs: usize,
    pub validation: &'a Dataset,
    /// Fit with `train.sample_weight`.
    pub use_sample_weight: bool,
}

pub trait TrainableModel: Send {
    /// Names of the values returned by [`TrainableModel::evaluate`], in order.
    fn metrics_names(&self) -> Vec<String>;

    /// Train for up to `options.epochs` epochs, driving `callbacks` once per
    /// epoch and stopping early when they return
    /// [`CallbackAction::Stop`](crate::callbacks::CallbackAction::Stop).
    fn fit(
        &mut self,
        train: &Dataset,
        options: &FitOptions<'_>,
        callbacks: &mut CallbackList,
    ) -> HsResult<()>;

    fn evaluate(&self, data: &Dataset) -> HsResult<Vec<f64>>;

    fn predict(&self, features: &[Vec<f64>]) -> HsResult<Vec<f64>>;

    fn save(&self, path: &Path) -> HsResult<()>;
}
