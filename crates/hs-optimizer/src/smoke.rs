//! Pre-flight check for a search setup.

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::info;

use hs_types::{internal_error, HsError, HsResult, ResultRecord, TrialStatus};

use crate::config::MODEL_EXT;
use crate::data::Dataset;
use crate::orchestrator::TrainEvalOrchestrator;
use crate::provider::{DataProvider, TrainableModel};
use crate::search::ParameterSampler;

/// Serves only the first `n_train` training rows of another provider.
struct TruncatedData {
    inner: Arc<dyn DataProvider>,
    n_train: usize,
}

impl DataProvider for TruncatedData {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn load(&self, params: &Map<String, Value>) -> HsResult<(Dataset, Dataset)> {
        let (train, test) = self.inner.load(params)?;
        Ok((train.head(self.n_train), test))
    }
}

/// Outcome of a successful [`smoke_test`].
pub struct SmokeReport {
    pub record: ResultRecord,
    pub model_path: PathBuf,
    pub model: Box<dyn TrainableModel>,
}

impl std::fmt::Debug for SmokeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmokeReport")
            .field("loss", &self.record.loss)
            .field("model_path", &self.model_path)
            .finish()
    }
}

/// Run one cheap trial before launching a real search.
///
/// Samples one parameter tree, forces `fit.epochs = 1`, keeps the first
/// `n_train` training rows and runs with model saving on under `scratch_dir`.
/// Succeeds when the trial status is ok and the newest model written during
/// the run loads back through the model provider.
pub fn smoke_test(
    orchestrator: &TrainEvalOrchestrator,
    space: &mut dyn ParameterSampler,
    n_train: usize,
    scratch_dir: &Path,
) -> HsResult<SmokeReport> {
    // mtime resolution on some filesystems is one second
    let start = SystemTime::now()
        .checked_sub(Duration::from_secs(1))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut config = orchestrator.config().clone();
    config.save_dir = scratch_dir.to_path_buf();
    config.save_model = true;
    let data = Arc::new(TruncatedData {
        inner: orchestrator.data_provider().clone(),
        n_train,
    });
    let smoke = orchestrator.derive(config, data)?;

    let mut param = space
        .sample()
        .ok_or_else(|| HsError::invalid_state(format!("sampler `{}` is exhausted", space.name())))?;
    param.set("fit.epochs", Value::from(1));

    let record = smoke.run(&param)?;
    info!(loss = record.loss, status = %record.status, "Smoke-test trial finished");
    if record.status != TrialStatus::Ok {
        return Err(HsError::invalid_state(format!(
            "smoke-test trial finished with status {}",
            record.status
        )));
    }

    let model_path = newest_model(&smoke.config().train_models_dir(), start)?;
    let model = smoke.model_provider().load(&model_path)?;
    info!(path = %model_path.display(), "Model reloaded");
    Ok(SmokeReport {
        record,
        model_path,
        model,
    })
}

fn newest_model(dir: &Path, since: SystemTime) -> HsResult<PathBuf> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(MODEL_EXT) {
            continue;
        }
        let modified = fs::metadata(&path)?.modified()?;
        if modified < since {
            continue;
        }
        if newest.as_ref().map_or(true, |(t, _)| modified >= *t) {
            newest = Some((modified, path));
        }
    }
    newest
        .map(|(_, path)| path)
        .ok_or_else(|| internal_error!("no model was saved under {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::search::{GridSearch, RandomSearch, SearchSpace};
    use crate::testing::{FakeData, FakeModelProvider};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn orchestrator(model: &FakeModelProvider, cv: Option<usize>) -> TrainEvalOrchestrator {
        let mut config = OrchestratorConfig::new("db", "exp").with_save_model(false);
        config.cv_n_folds = cv;
        TrainEvalOrchestrator::new(config, Arc::new(FakeData::new(100)), Arc::new(model.clone()), &[])
            .unwrap()
    }

    #[test]
    fn runs_one_short_trial_and_reloads_the_model() {
        let scratch = tempfile::tempdir().unwrap();
        let model = FakeModelProvider::new(&[("loss", 0.4)]);
        let mut space = RandomSearch::with_seed(
            SearchSpace::new()
                .add_int("model.units", 1, 4)
                .add_fixed("fit.epochs", json!(100)),
            1,
        );

        let report = smoke_test(&orchestrator(&model, None), &mut space, 10, scratch.path()).unwrap();

        assert_eq!(report.record.param.fit()["epochs"], json!(1));
        assert_eq!(report.record.history.folds()[0].loss.len(), 1);
        // 10 rows, 2 held out
        assert_eq!(model.built_with_rows.load(Ordering::SeqCst), 8);
        assert!(report.model_path.starts_with(scratch.path()));
        assert_eq!(report.model.metrics_names(), vec!["loss".to_string()]);
    }

    #[test]
    fn kfold_models_are_found() {
        let scratch = tempfile::tempdir().unwrap();
        let model = FakeModelProvider::new(&[("loss", 0.4)]);
        let mut space = RandomSearch::with_seed(SearchSpace::new(), 2);
        let report = smoke_test(&orchestrator(&model, Some(2)), &mut space, 10, scratch.path()).unwrap();
        let name = report.model_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.contains("_fold_"), "{name}");
    }

    #[test]
    fn exhausted_sampler_is_an_error() {
        let scratch = tempfile::tempdir().unwrap();
        let model = FakeModelProvider::new(&[("loss", 0.4)]);
        let space = SearchSpace::new().add_choice("model.units", vec![]);
        let mut grid = GridSearch::new(&space, 2);
        assert!(grid.is_empty());
        assert!(smoke_test(&orchestrator(&model, None), &mut grid, 10, scratch.path()).is_err());
        assert_eq!(model.fits(), 0);
    }
}
