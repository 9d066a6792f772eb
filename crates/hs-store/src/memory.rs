//! In-process job queue.
//!
//! Keeps every trial document of one database behind a single mutex, which
//! gives the per-job atomicity the [`JobQueue`] contract asks for. The server
//! clock can be frozen and advanced by hand.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use hs_types::{QueueError, ResultRecord, Tid, TrialStatus};

use crate::queue::{JobQueue, JobSpec, JobState, QueueResult, RunningJob, Trial, WorkerQueue};

#[derive(Debug, Default)]
struct QueueState {
    next_tid: Tid,
    jobs: BTreeMap<Tid, Trial>,
    frozen_now: Option<DateTime<Utc>>,
    failing_deletes: HashSet<Tid>,
}

impl QueueState {
    fn now(&self) -> DateTime<Utc> {
        self.frozen_now.unwrap_or_else(Utc::now)
    }

    fn job_mut(&mut self, tid: Tid) -> QueueResult<&mut Trial> {
        self.jobs.get_mut(&tid).ok_or(QueueError::JobNotFound { tid })
    }
}

/// A job queue held entirely in memory.
#[derive(Debug)]
pub struct MemoryQueue {
    db_name: String,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Stop the server clock at `now`.
    pub fn freeze_time(&self, now: DateTime<Utc>) {
        self.state.lock().frozen_now = Some(now);
    }

    /// Move the server clock forward, freezing it first if needed.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        let now = state.now();
        state.frozen_now = Some(now + by);
    }

    /// Insert a fully formed trial document, replacing any with the same tid.
    pub fn insert(&self, trial: Trial) {
        let mut state = self.state.lock();
        state.next_tid = state.next_tid.max(trial.tid + 1);
        state.jobs.insert(trial.tid, trial);
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next delete of `tid` fail once with `Unavailable`.
    #[cfg(test)]
    pub(crate) fn fail_next_delete(&self, tid: Tid) {
        self.state.lock().failing_deletes.insert(tid);
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn submit(&self, job: JobSpec) -> QueueResult<Tid> {
        let mut state = self.state.lock();
        let tid = state.next_tid;
        state.next_tid += 1;
        state.jobs.insert(
            tid,
            Trial {
                tid,
                exp_key: job.exp_key,
                state: JobState::New,
                status: TrialStatus::New,
                spec: job.param,
                result: None,
                error: None,
                book_time: None,
                refresh_time: None,
                misc: serde_json::Value::Null,
            },
        );
        debug!(tid, db = %self.db_name, "Job submitted");
        Ok(tid)
    }

    async fn trials(&self, exp_key: &str, tids: Option<&[Tid]>) -> QueueResult<Vec<Trial>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter(|t| t.exp_key == exp_key)
            .filter(|t| tids.map_or(true, |tids| tids.contains(&t.tid)))
            .cloned()
            .collect())
    }

    async fn jobs_running(&self, exp_key: &str) -> QueueResult<Vec<RunningJob>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter(|t| t.exp_key == exp_key && t.state == JobState::Running)
            .map(|t| RunningJob {
                tid: t.tid,
                exp_key: t.exp_key.clone(),
                refresh_time: t.refresh_time.or(t.book_time).unwrap_or_else(|| state.now()),
                misc: t.misc.clone(),
            })
            .collect())
    }

    async fn delete(&self, job: &RunningJob) -> QueueResult<bool> {
        let mut state = self.state.lock();
        if state.failing_deletes.remove(&job.tid) {
            return Err(QueueError::Unavailable {
                message: format!("delete of job {} timed out", job.tid),
            });
        }

        let unchanged = match state.jobs.get(&job.tid) {
            Some(current) => {
                current.state == JobState::Running
                    && current.refresh_time.or(current.book_time) == Some(job.refresh_time)
            }
            None => return Err(QueueError::JobNotFound { tid: job.tid }),
        };
        if unchanged {
            state.jobs.remove(&job.tid);
        }
        Ok(unchanged)
    }

    async fn count_by_state(&self, exp_key: &str, job_state: JobState) -> QueueResult<usize> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter(|t| t.exp_key == exp_key && t.state == job_state)
            .count())
    }

    async fn server_time(&self) -> QueueResult<DateTime<Utc>> {
        Ok(self.state.lock().now())
    }
}

#[async_trait]
impl WorkerQueue for MemoryQueue {
    async fn reserve(&self, exp_key: &str, owner: &str) -> QueueResult<Option<Trial>> {
        let mut state = self.state.lock();
        let now = state.now();
        let next = state
            .jobs
            .values_mut()
            .find(|t| t.exp_key == exp_key && t.state == JobState::New);

        Ok(next.map(|trial| {
            trial.state = JobState::Running;
            trial.status = TrialStatus::Running;
            trial.book_time = Some(now);
            trial.refresh_time = Some(now);
            trial.misc = serde_json::json!({ "owner": owner });
            trial.clone()
        }))
    }

    async fn heartbeat(&self, tid: Tid) -> QueueResult<()> {
        let mut state = self.state.lock();
        let now = state.now();
        let job = state.job_mut(tid)?;
        if job.state != JobState::Running {
            return Err(QueueError::Rejected {
                reason: format!("job {tid} is not running"),
            });
        }
        job.refresh_time = Some(now);
        Ok(())
    }

    async fn complete(&self, tid: Tid, result: ResultRecord) -> QueueResult<()> {
        let mut state = self.state.lock();
        let now = state.now();
        let job = state.job_mut(tid)?;
        job.state = JobState::Done;
        job.status = result.status;
        job.result = Some(result);
        job.refresh_time = Some(now);
        Ok(())
    }

    async fn fail(&self, tid: Tid, error: String) -> QueueResult<()> {
        let mut state = self.state.lock();
        let now = state.now();
        let job = state.job_mut(tid)?;
        job.state = JobState::Error;
        job.status = TrialStatus::Fail;
        job.error = Some(error);
        job.refresh_time = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_types::ParamTree;

    fn job(exp: &str) -> JobSpec {
        JobSpec {
            exp_key: exp.to_string(),
            param: ParamTree::new(),
        }
    }

    #[tokio::test]
    async fn tids_are_assigned_in_order() {
        let queue = MemoryQueue::new("db");
        assert_eq!(queue.submit(job("a")).await.unwrap(), 0);
        assert_eq!(queue.submit(job("b")).await.unwrap(), 1);
        assert_eq!(queue.trials("a", None).await.unwrap().len(), 1);
        assert_eq!(queue.count_by_state("b", JobState::New).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reserve_heartbeat_and_finish() {
        let queue = MemoryQueue::new("db");
        let t0 = Utc::now();
        queue.freeze_time(t0);
        let tid = queue.submit(job("exp")).await.unwrap();

        let reserved = queue.reserve("exp", "worker-0").await.unwrap().unwrap();
        assert_eq!(reserved.tid, tid);
        assert_eq!(reserved.state, JobState::Running);
        assert!(queue.reserve("exp", "worker-1").await.unwrap().is_none());

        queue.advance(Duration::seconds(30));
        queue.heartbeat(tid).await.unwrap();
        let running = queue.jobs_running("exp").await.unwrap();
        assert_eq!(running[0].refresh_time, t0 + Duration::seconds(30));

        queue.fail(tid, "boom".to_string()).await.unwrap();
        assert!(queue.heartbeat(tid).await.is_err());
        assert_eq!(queue.count_by_state("exp", JobState::Error).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_is_conditional_on_heartbeat() {
        let queue = MemoryQueue::new("db");
        queue.freeze_time(Utc::now());
        let tid = queue.submit(job("exp")).await.unwrap();
        queue.reserve("exp", "w").await.unwrap();
        let observed = queue.jobs_running("exp").await.unwrap().remove(0);

        queue.advance(Duration::seconds(5));
        queue.heartbeat(tid).await.unwrap();
        assert!(!queue.delete(&observed).await.unwrap());
        assert_eq!(queue.len(), 1);

        let fresh = queue.jobs_running("exp").await.unwrap().remove(0);
        assert!(queue.delete(&fresh).await.unwrap());
        assert!(queue.is_empty());
    }
}
