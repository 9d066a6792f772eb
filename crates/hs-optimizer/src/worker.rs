//! One worker step: pull a job off the queue, run it, report back.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use hs_store::WorkerQueue;
use hs_types::{internal_error, HsResult, Tid, TrialStatus};

use crate::orchestrator::TrainEvalOrchestrator;

/// Heartbeat period used while a trial trains.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Reserve the next new job of `exp_key`, run it and record the outcome.
///
/// Training runs on the blocking pool while this task heartbeats the job
/// every `heartbeat_every`, so a healthy trial longer than the store's kill
/// timeout is not reaped. Returns `None` when no job was waiting. A failing
/// trial is recorded on the queue as `fail` and reported as such; only queue
/// errors are returned as `Err`.
pub async fn run_next_job(
    queue: &dyn WorkerQueue,
    orchestrator: &Arc<TrainEvalOrchestrator>,
    exp_key: &str,
    owner: &str,
    heartbeat_every: Duration,
) -> HsResult<Option<(Tid, TrialStatus)>> {
    let Some(trial) = queue.reserve(exp_key, owner).await? else {
        return Ok(None);
    };
    let tid = trial.tid;
    info!(tid, owner, "Reserved job");
    queue.heartbeat(tid).await?;

    let orch = Arc::clone(orchestrator);
    let param = trial.spec;
    let mut training = tokio::task::spawn_blocking(move || orch.run(&param));

    let mut ticker = tokio::time::interval(heartbeat_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick fires immediately
    ticker.tick().await;

    let joined = loop {
        tokio::select! {
            joined = &mut training => break joined,
            _ = ticker.tick() => {
                match queue.heartbeat(tid).await {
                    Ok(()) => debug!(tid, "Heartbeat"),
                    Err(e) => warn!(tid, "Heartbeat failed: {}", e),
                }
            }
        }
    };
    let outcome = joined
        .map_err(|e| internal_error!("trial {tid} did not finish: {e}"))
        .and_then(|result| result);

    match outcome {
        Ok(record) => {
            let status = record.status;
            queue.complete(tid, record).await?;
            Ok(Some((tid, status)))
        }
        Err(err) => {
            warn!(tid, error = %err, "Trial failed");
            queue.fail(tid, err.to_string()).await?;
            Ok(Some((tid, TrialStatus::Fail)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::testing::{FakeData, FakeModelProvider};
    use hs_store::{JobQueue, JobSpec, JobState, MemoryQueue, StoreConfig, TrialStore};
    use hs_types::{MetricMode, ParamTree};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    const BEAT: Duration = Duration::from_millis(2);

    fn orchestrator_with(
        dir: &std::path::Path,
        loss_metric: &str,
        model: FakeModelProvider,
    ) -> Arc<TrainEvalOrchestrator> {
        let config = OrchestratorConfig::new("db", "exp")
            .with_save_dir(dir)
            .with_loss_metric(loss_metric, MetricMode::Min);
        let orch =
            TrainEvalOrchestrator::new(config, Arc::new(FakeData::new(20)), Arc::new(model), &[])
                .unwrap();
        Arc::new(orch)
    }

    fn orchestrator(dir: &std::path::Path, loss_metric: &str) -> Arc<TrainEvalOrchestrator> {
        orchestrator_with(dir, loss_metric, FakeModelProvider::new(&[("loss", 0.3)]))
    }

    fn job(epochs: u64) -> JobSpec {
        JobSpec {
            exp_key: "exp".to_string(),
            param: ParamTree::from_value(json!({"fit": {"epochs": epochs}})).unwrap(),
        }
    }

    #[tokio::test]
    async fn completes_jobs_and_store_sees_results() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryQueue::new("db"));
        queue.submit(job(2)).await.unwrap();
        queue.submit(job(3)).await.unwrap();
        let orch = orchestrator(dir.path(), "loss");

        let first = run_next_job(queue.as_ref(), &orch, "exp", "w0", BEAT).await.unwrap();
        assert_eq!(first, Some((0, TrialStatus::Ok)));
        let second = run_next_job(queue.as_ref(), &orch, "exp", "w0", BEAT).await.unwrap();
        assert_eq!(second, Some((1, TrialStatus::Ok)));
        assert_eq!(run_next_job(queue.as_ref(), &orch, "exp", "w0", BEAT).await.unwrap(), None);

        let store = TrialStore::open(queue.clone(), StoreConfig::new("db", "exp"))
            .await
            .unwrap();
        assert_eq!(store.valid_tid(), vec![0, 1]);
        assert_eq!(store.optimal_epochs(1).unwrap(), 3);
        assert_eq!(store.as_df(&["history"], ".").unwrap().num_rows(), 2);
    }

    #[tokio::test]
    async fn failures_are_recorded_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryQueue::new("db"));
        queue.submit(job(1)).await.unwrap();
        let orch = orchestrator(dir.path(), "auc");

        let outcome = run_next_job(queue.as_ref(), &orch, "exp", "w0", BEAT).await.unwrap();
        assert_eq!(outcome, Some((0, TrialStatus::Fail)));
        assert_eq!(queue.count_by_state("exp", JobState::Error).await.unwrap(), 1);

        let trials = queue.trials("exp", None).await.unwrap();
        assert!(trials[0].error.as_deref().unwrap_or_default().contains("auc"));
    }

    #[tokio::test]
    async fn long_trial_outlives_the_kill_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryQueue::new("db"));
        queue.freeze_time(chrono::Utc::now());
        queue.submit(job(6)).await.unwrap();

        // each epoch moves the queue clock 25s; six epochs are well past 60s
        let clock = queue.clone();
        let model = FakeModelProvider::new(&[("loss", 0.3)]).on_epoch(move |_| {
            clock.advance(chrono::Duration::seconds(25));
            std::thread::sleep(Duration::from_millis(50));
        });
        let orch = orchestrator_with(dir.path(), "loss", model);

        let config = StoreConfig::new("db", "exp").with_kill_timeout(60);
        let mut store = TrialStore::open(queue.clone(), config).await.unwrap();
        let done = AtomicBool::new(false);
        let work = async {
            let outcome = run_next_job(queue.as_ref(), &orch, "exp", "w0", BEAT).await;
            done.store(true, Ordering::SeqCst);
            outcome
        };
        let reaper = async {
            while !done.load(Ordering::SeqCst) {
                store.count_by_state(JobState::Running).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        let (outcome, ()) = tokio::join!(work, reaper);

        assert_eq!(outcome.unwrap(), Some((0, TrialStatus::Ok)));
        assert_eq!(queue.count_by_state("exp", JobState::Done).await.unwrap(), 1);
    }
}
