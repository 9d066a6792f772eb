//! The job-queue capability a trial store is layered on.
//!
//! The queue is the only shared mutable resource: submissions, heartbeats,
//! completions and deletions all go through it, and each of those is expected
//! to be atomic per job on the backend side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hs_types::{HsError, HsResult, ParamTree, QueueError, ResultRecord, Tid, TrialStatus};

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Scheduling state of a job on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    New,
    Running,
    Done,
    Error,
}

/// A request to evaluate one parameter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub exp_key: String,
    pub param: ParamTree,
}

/// A trial document as stored on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub tid: Tid,
    pub exp_key: String,
    pub state: JobState,
    pub status: TrialStatus,
    /// Parameters the job was submitted with.
    pub spec: ParamTree,
    /// Present once `status` is ok.
    pub result: Option<ResultRecord>,
    pub error: Option<String>,
    pub book_time: Option<DateTime<Utc>>,
    pub refresh_time: Option<DateTime<Utc>>,
    /// Execution metadata owned by the queue backend.
    #[serde(default)]
    pub misc: serde_json::Value,
}

impl Trial {
    pub fn is_ok(&self) -> bool {
        self.status == TrialStatus::Ok
    }

    /// The completed result; fails unless the trial finished ok.
    pub fn result(&self) -> HsResult<&ResultRecord> {
        match (&self.result, self.status) {
            (Some(result), TrialStatus::Ok) => Ok(result),
            (_, status) => Err(HsError::invalid_state(format!(
                "trial {} has status `{status}` and no completed result",
                self.tid
            ))),
        }
    }
}

/// A job currently holding a running slot, with its last heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningJob {
    pub tid: Tid,
    pub exp_key: String,
    pub refresh_time: DateTime<Utc>,
    #[serde(default)]
    pub misc: serde_json::Value,
}

/// Read/delete side of a job queue, as used by a [`crate::TrialStore`].
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. Returns the queue-assigned trial id.
    async fn submit(&self, job: JobSpec) -> QueueResult<Tid>;

    /// All trial documents of an experiment, optionally restricted to `tids`,
    /// in ascending tid order.
    async fn trials(&self, exp_key: &str, tids: Option<&[Tid]>) -> QueueResult<Vec<Trial>>;

    /// Jobs of an experiment currently in the running state.
    async fn jobs_running(&self, exp_key: &str) -> QueueResult<Vec<RunningJob>>;

    /// Delete a running job.
    ///
    /// The delete must be conditional: it only happens if the job is still
    /// running with the same `refresh_time` as in `job`. Returns `false` when
    /// the job was left alone because it heartbeated or finished meanwhile.
    async fn delete(&self, job: &RunningJob) -> QueueResult<bool>;

    /// Number of jobs of an experiment in `state`.
    async fn count_by_state(&self, exp_key: &str, state: JobState) -> QueueResult<usize>;

    /// Current time on the queue server, the clock heartbeats are stamped with.
    async fn server_time(&self) -> QueueResult<DateTime<Utc>>;
}

/// Worker side of a job queue.
#[async_trait]
pub trait WorkerQueue: JobQueue {
    /// Move the oldest new job of an experiment to running and hand it out.
    async fn reserve(&self, exp_key: &str, owner: &str) -> QueueResult<Option<Trial>>;

    /// Stamp a running job with the current server time.
    async fn heartbeat(&self, tid: Tid) -> QueueResult<()>;

    /// Record a successful result.
    async fn complete(&self, tid: Tid, result: ResultRecord) -> QueueResult<()>;

    /// Record a failed run.
    async fn fail(&self, tid: Tid, error: String) -> QueueResult<()>;
}
