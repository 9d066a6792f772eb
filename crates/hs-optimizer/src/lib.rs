//! # hs-optimizer
//!
//! Runs hyperparameter-search trials: samples parameter trees from a search
//! space, trains and evaluates models built by user-supplied data and model
//! providers (single split or K-fold), and reports each outcome back to the
//! job queue shared with [`hs_store::TrialStore`].

pub mod callbacks;
pub mod config;
pub mod data;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod search;
pub mod smoke;
pub mod worker;

#[cfg(test)]
mod testing;

pub use callbacks::{CallbackAction, CallbackList, EarlyStopping, ProgressLog, TrainingCallback};
pub use config::{default_save_dir, OrchestratorConfig, MODEL_EXT};
pub use data::{kfold_split, train_valid_split, Dataset, SplitIndices};
pub use metrics::{resolve_metrics, EvalMetric, MetricFn, REGISTRY};
pub use orchestrator::{
    eval_model, merge_metrics, param_file_string, TrainEvalOrchestrator, MAX_PROGRESS_NAME_LEN,
};
pub use provider::{DataProvider, FitOptions, ModelProvider, TrainableModel};
pub use search::{GridSearch, ParameterDef, ParameterKind, ParameterSampler, RandomSearch, SearchSpace};
pub use smoke::{smoke_test, SmokeReport};
pub use worker::{run_next_job, DEFAULT_HEARTBEAT_INTERVAL};
