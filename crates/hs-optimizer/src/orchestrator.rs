//! Train-and-evaluate orchestration for a single trial.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Span};

use hs_store::mean_metrics;
use hs_types::{
    config_error, FitParams, History, HsResult, Metrics, ParamTree, ResultNames, ResultPaths,
    ResultRecord, RunId, Timing, TrainHistory, TrainingError, TrialStatus, DATA_SECTION,
    MODEL_SECTION,
};

use crate::callbacks::{CallbackList, EarlyStopping, ProgressLog};
use crate::config::{OrchestratorConfig, MODEL_EXT};
use crate::data::{kfold_split, train_valid_split, Dataset};
use crate::metrics::{resolve_metrics, EvalMetric, MetricFn};
use crate::provider::{DataProvider, FitOptions, ModelProvider, TrainableModel};

/// Upper bound on the length of a progress-log directory name.
pub const MAX_PROGRESS_NAME_LEN: usize = 240;

/// Turns a parameter tree into a [`ResultRecord`] by training and
/// evaluating a model built by the configured providers.
pub struct TrainEvalOrchestrator {
    config: OrchestratorConfig,
    data_provider: Arc<dyn DataProvider>,
    model_provider: Arc<dyn ModelProvider>,
    eval_metrics: Vec<(String, MetricFn)>,
    span: Span,
}

impl fmt::Debug for TrainEvalOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainEvalOrchestrator")
            .field("config", &self.config)
            .field("data", &self.data_provider.name())
            .field("model", &self.model_provider.name())
            .field("eval_metrics", &self.eval_metric_names())
            .finish()
    }
}

impl TrainEvalOrchestrator {
    /// Validates the configuration and resolves `add_eval_metrics` up front,
    /// so bad names fail before any trial runs.
    pub fn new(
        config: OrchestratorConfig,
        data_provider: Arc<dyn DataProvider>,
        model_provider: Arc<dyn ModelProvider>,
        add_eval_metrics: &[EvalMetric],
    ) -> HsResult<Self> {
        config.validate()?;
        let eval_metrics = resolve_metrics(add_eval_metrics)?;
        Ok(Self::from_parts(
            config,
            data_provider,
            model_provider,
            eval_metrics,
        ))
    }

    fn from_parts(
        config: OrchestratorConfig,
        data_provider: Arc<dyn DataProvider>,
        model_provider: Arc<dyn ModelProvider>,
        eval_metrics: Vec<(String, MetricFn)>,
    ) -> Self {
        let span = info_span!(
            "train_eval",
            db = %config.db_name,
            exp = %config.exp_name,
            data = %data_provider.name(),
            model = %model_provider.name(),
        );
        Self {
            config,
            data_provider,
            model_provider,
            eval_metrics,
            span,
        }
    }

    /// Same providers and metrics under a different configuration and data
    /// provider.
    pub(crate) fn derive(
        &self,
        config: OrchestratorConfig,
        data_provider: Arc<dyn DataProvider>,
    ) -> HsResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(
            config,
            data_provider,
            self.model_provider.clone(),
            self.eval_metrics.clone(),
        ))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn data_provider(&self) -> &Arc<dyn DataProvider> {
        &self.data_provider
    }

    pub fn model_provider(&self) -> &Arc<dyn ModelProvider> {
        &self.model_provider
    }

    pub fn eval_metric_names(&self) -> Vec<&str> {
        self.eval_metrics.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// `<save_dir>/<db_name>/<exp_name>`
    pub fn save_dir_exp(&self) -> PathBuf {
        self.config.save_dir_exp()
    }

    /// Run one trial.
    ///
    /// Fills the `fit` defaults, loads data, trains on a single
    /// train/validation split or on every K-fold split, and returns the
    /// assembled record. The record is also written next to the saved
    /// models when `save_results` is on.
    pub fn run(&self, param: &ParamTree) -> HsResult<ResultRecord> {
        let _enter = self.span.enter();
        let time_start = Utc::now();

        let (param, fit) = param.with_fit_defaults()?;

        let rid = RunId::new();
        let tm_dir = self.config.train_models_dir();
        fs::create_dir_all(&tm_dir)?;
        let model_path = self
            .config
            .save_model
            .then(|| tm_dir.join(format!("{rid}.{MODEL_EXT}")));
        let results_path = self
            .config
            .save_results
            .then(|| tm_dir.join(format!("{rid}.json")));
        let progress_dir = self
            .config
            .progress_log
            .then(|| self.config.progress_dir().join(param_file_string(&param, &rid)));
        debug!(%rid, ?fit, "Starting trial");

        info!("Load data...");
        let (train, _) = self
            .data_provider
            .load(&param.merged_with_shared(DATA_SECTION))?;
        let time_data_loaded = Utc::now();
        let model_params = param.merged_with_shared(MODEL_SECTION);

        let (eval, history) = match self.config.cv_n_folds {
            None => {
                let (train_idx, valid_idx) = train_valid_split(
                    &train.labels,
                    self.config.valid_split,
                    self.config.stratified,
                    self.config.random_state,
                )?;
                let train_part = train.subset(&train_idx);
                let mut model = self.model_provider.build(&model_params, &train_part)?;
                self.assert_loss_metric(&*model)?;

                let (eval, hist) = self.train_and_eval_single(
                    &train_part,
                    &train.subset(&valid_idx),
                    &mut *model,
                    &fit,
                    progress_dir,
                )?;
                if let Some(path) = &model_path {
                    model.save(path)?;
                }
                (eval, History::Single(hist))
            }
            Some(n_folds) => {
                let folds = kfold_split(
                    &train.labels,
                    n_folds,
                    self.config.stratified,
                    self.config.random_state,
                )?;
                let mut evals = Vec::with_capacity(n_folds);
                let mut histories = Vec::with_capacity(n_folds);
                for (i, (train_idx, valid_idx)) in folds.iter().enumerate() {
                    info!("Fold {}/{}", i + 1, n_folds);
                    let fold_train = train.subset(train_idx);
                    let mut model = self.model_provider.build(&model_params, &fold_train)?;
                    self.assert_loss_metric(&*model)?;

                    let (eval, hist) = self.train_and_eval_single(
                        &fold_train,
                        &train.subset(valid_idx),
                        &mut *model,
                        &fit,
                        progress_dir.as_ref().map(|d| d.join(format!("fold_{i}"))),
                    )?;
                    if model_path.is_some() {
                        model.save(&fold_model_path(&tm_dir, &rid, i))?;
                    }
                    evals.push(eval);
                    histories.push(hist);
                }
                (mean_metrics(&evals)?, History::KFold(histories))
            }
        };

        let metric = eval.get(&self.config.loss_metric).copied().ok_or_else(|| {
            config_error!(
                "loss_metric `{}` missing from the evaluated metrics {:?}",
                self.config.loss_metric,
                eval.keys().collect::<Vec<_>>()
            )
        })?;
        let loss = self.config.loss_metric_mode.to_loss(metric);
        let time_end = Utc::now();

        let record = ResultRecord {
            loss,
            status: TrialStatus::Ok,
            eval: Some(eval),
            param,
            path: ResultPaths {
                model: model_path,
                results: results_path.clone(),
            },
            name: ResultNames {
                data: self.data_provider.name().to_string(),
                model: self.model_provider.name().to_string(),
                loss_metric: self.config.loss_metric.clone(),
                loss_metric_mode: self.config.loss_metric_mode,
            },
            history,
            time: Timing::new(time_start, time_data_loaded, time_end),
        };

        if let Some(path) = &results_path {
            record.write_json(path)?;
            debug!(path = %path.display(), "Result written");
        }
        info!(loss, total_secs = record.time.duration.total, "Done!");
        Ok(record)
    }

    /// The loss metric must come from the model or the supplemental metrics.
    fn assert_loss_metric(&self, model: &dyn TrainableModel) -> HsResult<()> {
        let model_metrics = model.metrics_names();
        let loss_metric = &self.config.loss_metric;
        if model_metrics.contains(loss_metric)
            || self.eval_metrics.iter().any(|(name, _)| name == loss_metric)
        {
            return Ok(());
        }
        Err(config_error!(
            "loss_metric `{loss_metric}` not in either set of metrics: model.metrics_names: {model_metrics:?}, add_eval_metrics: {:?}",
            self.eval_metric_names()
        ))
    }

    fn callbacks(&self, fit: &FitParams, progress_dir: Option<PathBuf>) -> CallbackList {
        let mut callbacks = CallbackList::new();
        callbacks.push(Box::new(EarlyStopping::new(
            fit.early_stop_monitor.clone(),
            fit.patience,
        )));
        if let Some(dir) = progress_dir {
            callbacks.push(Box::new(ProgressLog::new(dir)));
        }
        callbacks
    }

    fn train_and_eval_single(
        &self,
        train: &Dataset,
        valid: &Dataset,
        model: &mut dyn TrainableModel,
        fit: &FitParams,
        progress_dir: Option<PathBuf>,
    ) -> HsResult<(Metrics, TrainHistory)> {
        if fit.use_weight && train.sample_weight.is_none() {
            return Err(TrainingError::Data {
                message: "fit.use_weight is set but the training data has no sample weights"
                    .to_string(),
            }
            .into());
        }

        let mut callbacks = self.callbacks(fit, progress_dir);
        let options = FitOptions {
            batch_size: fit.batch_size,
            epochs: fit.epochs,
            validation: valid,
            use_sample_weight: fit.use_weight,
        };

        info!(train = train.len(), valid = valid.len(), "Fit...");
        callbacks.train_begin()?;
        model.fit(train, &options, &mut callbacks)?;
        callbacks.train_end()?;

        let mut params = Map::new();
        params.insert("batch_size".to_string(), Value::from(fit.batch_size));
        params.insert("epochs".to_string(), Value::from(fit.epochs));
        params.insert("samples".to_string(), Value::from(train.len()));
        params.insert("do_validation".to_string(), Value::from(!valid.is_empty()));
        params.insert("metrics".to_string(), Value::from(model.metrics_names()));
        let history = TrainHistory {
            params,
            loss: callbacks.into_history(),
        };
        history.loss.validate()?;

        let eval = eval_model(&*model, valid, &self.eval_metrics)?;
        Ok((eval, history))
    }
}

fn fold_model_path(dir: &Path, rid: &RunId, fold: usize) -> PathBuf {
    dir.join(format!("{rid}_fold_{fold}.{MODEL_EXT}"))
}

/// Evaluate `model` on `test`: its native metrics plus every supplemental
/// metric called as `f(labels, predictions)`.
pub fn eval_model(
    model: &dyn TrainableModel,
    test: &Dataset,
    add_eval_metrics: &[(String, MetricFn)],
) -> HsResult<Metrics> {
    info!("Evaluate...");
    let names = model.metrics_names();
    let values = model.evaluate(test)?;
    if names.len() != values.len() {
        return Err(TrainingError::Model {
            message: format!(
                "evaluate returned {} values for metrics {names:?}",
                values.len()
            ),
        }
        .into());
    }
    let model_metrics: Metrics = names.into_iter().zip(values).collect();

    if add_eval_metrics.is_empty() {
        return Ok(model_metrics);
    }
    let y_pred = model.predict(&test.features)?;
    if y_pred.len() != test.labels.len() {
        return Err(TrainingError::Metric {
            message: format!(
                "{} predictions for {} labels",
                y_pred.len(),
                test.labels.len()
            ),
        }
        .into());
    }
    let eval_metrics: Metrics = add_eval_metrics
        .iter()
        .map(|(name, func)| (name.clone(), func(&test.labels, &y_pred)))
        .collect();

    Ok(merge_metrics(model_metrics, eval_metrics))
}

/// Union of both metric maps. On a name collision the native value is kept
/// and the supplemental one dropped.
pub fn merge_metrics(model_metrics: Metrics, eval_metrics: Metrics) -> Metrics {
    let mut merged = model_metrics;
    let mut intersected = Vec::new();
    for (name, value) in eval_metrics {
        match merged.entry(name) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(slot) => intersected.push(slot.key().clone()),
        }
    }
    if !intersected.is_empty() {
        warn!(
            ?intersected,
            "Some metric names intersect. Ignoring the add_eval_metrics ones"
        );
    }
    merged
}

/// Filesystem-safe name for a trial's progress-log directory:
/// `k=v;k=v;...;<rid>`, at most [`MAX_PROGRESS_NAME_LEN`] characters.
///
/// Keys are the leaf names of the parameter tree and floats are shortened to
/// two significant digits. The run id keeps trials with identical parameters
/// apart.
pub fn param_file_string(param: &ParamTree, rid: &RunId) -> String {
    let mut leaves = BTreeMap::new();
    collect_leaves(param.as_map(), &mut leaves);

    let encoded = leaves
        .iter()
        .map(|(key, value)| format!("{key}={}", format_leaf(value)))
        .collect::<Vec<_>>()
        .join(";");
    let safe: String = encoded
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "._-=;,+".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();

    let max_len = MAX_PROGRESS_NAME_LEN.saturating_sub(rid.as_str().len() + 1);
    let head = &safe[..safe.len().min(max_len)];
    format!("{head};{rid}")
}

fn collect_leaves(map: &Map<String, Value>, out: &mut BTreeMap<String, Value>) {
    for (key, value) in map {
        match value {
            Value::Object(inner) => collect_leaves(inner, out),
            leaf => {
                out.insert(key.clone(), leaf.clone());
            }
        }
    }
}

fn format_leaf(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_f64() => n
            .as_f64()
            .and_then(|f| format!("{f:.1e}").parse::<f64>().ok())
            .map_or_else(|| n.to_string(), |f| f.to_string()),
        other => other.to_string(),
    }
}
