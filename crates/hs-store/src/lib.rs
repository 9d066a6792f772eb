//! # hs-store
//!
//! Trial store for hyperparameter search experiments.
//!
//! Wraps a shared job queue: exposes lookups and loss ranking over completed
//! trials, reaps jobs whose workers stopped heartbeating, and flattens
//! heterogeneous single-split and k-fold results into tables that can be
//! exported through Arrow, Parquet or CSV.

pub mod aggregate;
pub mod config;
pub mod memory;
pub mod queue;
pub mod store;
pub mod table;

pub use aggregate::{delete_keys, flatten, mean_metrics, summarize};
pub use config::{StoreConfig, AGGRESSIVE_TIMEOUT_SECS};
pub use memory::MemoryQueue;
pub use queue::{JobQueue, JobSpec, JobState, QueueResult, RunningJob, Trial, WorkerQueue};
pub use store::{ReapReport, TrialStore, DEFAULT_IGNORE_FIELDS};
pub use table::Table;
