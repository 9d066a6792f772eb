//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use hs_types::{config_error, HsResult, MetricMode};

/// Directory name under the platform data dir used when no `save_dir` is set.
pub const DEFAULT_SAVE_SUBDIR: &str = "hyperstore";

/// Extension of saved model files.
pub const MODEL_EXT: &str = "h5";

fn default_loss_metric() -> String {
    "loss".to_string()
}

fn default_valid_split() -> f64 {
    0.2
}

fn default_true() -> bool {
    true
}

/// `<platform data dir>/hyperstore`, or a relative `hyperstore` directory on
/// platforms without one.
pub fn default_save_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_SAVE_SUBDIR)
}

/// How trials are trained, evaluated and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub db_name: String,
    pub exp_name: String,
    /// Metric the trial loss is taken from; must be a native model metric
    /// or a supplemental eval metric.
    #[serde(default = "default_loss_metric")]
    pub loss_metric: String,
    #[serde(default)]
    pub loss_metric_mode: MetricMode,
    /// Fraction of the training data held out for validation.
    #[serde(default = "default_valid_split")]
    pub valid_split: f64,
    /// Run K-fold cross-validation instead of a single split.
    #[serde(default)]
    pub cv_n_folds: Option<usize>,
    #[serde(default)]
    pub stratified: bool,
    /// Seed for the splits.
    #[serde(default)]
    pub random_state: Option<u64>,
    /// Write per-epoch progress logs.
    #[serde(default = "default_true")]
    pub progress_log: bool,
    #[serde(default = "default_true")]
    pub save_model: bool,
    #[serde(default = "default_true")]
    pub save_results: bool,
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
}

impl OrchestratorConfig {
    pub fn new(db_name: impl Into<String>, exp_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            exp_name: exp_name.into(),
            loss_metric: default_loss_metric(),
            loss_metric_mode: MetricMode::Min,
            valid_split: default_valid_split(),
            cv_n_folds: None,
            stratified: false,
            random_state: None,
            progress_log: true,
            save_model: true,
            save_results: true,
            save_dir: default_save_dir(),
        }
    }

    pub fn with_loss_metric(mut self, metric: impl Into<String>, mode: MetricMode) -> Self {
        self.loss_metric = metric.into();
        self.loss_metric_mode = mode;
        self
    }

    pub fn with_valid_split(mut self, valid_split: f64) -> Self {
        self.valid_split = valid_split;
        self
    }

    pub fn with_cv_folds(mut self, n_folds: usize) -> Self {
        self.cv_n_folds = Some(n_folds);
        self
    }

    pub fn with_stratified(mut self, stratified: bool) -> Self {
        self.stratified = stratified;
        self
    }

    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = Some(seed);
        self
    }

    pub fn with_progress_log(mut self, enabled: bool) -> Self {
        self.progress_log = enabled;
        self
    }

    pub fn with_save_model(mut self, enabled: bool) -> Self {
        self.save_model = enabled;
        self
    }

    pub fn with_save_results(mut self, enabled: bool) -> Self {
        self.save_results = enabled;
        self
    }

    pub fn with_save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = dir.into();
        self
    }

    pub fn from_json_file(path: &Path) -> HsResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HsResult<()> {
        if self.db_name.trim().is_empty() {
            return Err(config_error!("db_name is required"));
        }
        if self.exp_name.trim().is_empty() {
            return Err(config_error!("exp_name is required"));
        }
        if self.loss_metric.trim().is_empty() {
            return Err(config_error!("loss_metric is required"));
        }
        if !(self.valid_split > 0.0 && self.valid_split < 1.0) {
            return Err(config_error!(
                "valid_split must be in (0, 1), got {}",
                self.valid_split
            ));
        }
        if let Some(n) = self.cv_n_folds {
            if n < 2 {
                return Err(config_error!("cv_n_folds must be at least 2, got {n}"));
            }
        }
        Ok(())
    }

    /// `<save_dir>/<db_name>/<exp_name>`
    pub fn save_dir_exp(&self) -> PathBuf {
        self.save_dir.join(&self.db_name).join(&self.exp_name)
    }

    pub fn train_models_dir(&self) -> PathBuf {
        self.save_dir_exp().join("train_models")
    }

    pub fn progress_dir(&self) -> PathBuf {
        self.save_dir_exp().join("tensorboard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = OrchestratorConfig::new("db", "exp");
        assert_eq!(config.loss_metric, "loss");
        assert_eq!(config.loss_metric_mode, MetricMode::Min);
        assert_eq!(config.valid_split, 0.2);
        assert!(config.cv_n_folds.is_none());
        assert!(config.save_model && config.save_results && config.progress_log);
        assert!(config.save_dir.ends_with(DEFAULT_SAVE_SUBDIR));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation() {
        let base = OrchestratorConfig::new("db", "exp");
        assert!(base.clone().with_valid_split(0.0).validate().is_err());
        assert!(base.clone().with_valid_split(1.5).validate().is_err());
        assert!(base.clone().with_cv_folds(1).validate().is_err());
        assert!(base.clone().with_cv_folds(5).validate().is_ok());
        assert!(OrchestratorConfig::new("", "exp").validate().is_err());
    }

    #[test]
    fn paths() {
        let config = OrchestratorConfig::new("db", "exp").with_save_dir("/tmp/hs");
        assert_eq!(
            config.train_models_dir(),
            PathBuf::from("/tmp/hs/db/exp/train_models")
        );
        assert_eq!(config.progress_dir(), PathBuf::from("/tmp/hs/db/exp/tensorboard"));
    }

    #[test]
    fn loads_from_json_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.json");
        std::fs::write(
            &path,
            r#"{"db_name": "db", "exp_name": "exp", "loss_metric": "acc",
                "loss_metric_mode": "max", "cv_n_folds": 3}"#,
        )
        .unwrap();
        let config = OrchestratorConfig::from_json_file(&path).unwrap();
        assert_eq!(config.loss_metric_mode, MetricMode::Max);
        assert_eq!(config.cv_n_folds, Some(3));
        assert_eq!(config.valid_split, 0.2);
        assert!(config.save_model);

        std::fs::write(&path, r#"{"db_name": "db", "exp_name": "exp", "loss_metric_mode": "avg"}"#)
            .unwrap();
        assert!(OrchestratorConfig::from_json_file(&path).is_err());
    }
}
