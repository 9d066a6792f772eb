//! Trial store: the local view of one experiment on a shared job queue.
//!
//! The store holds a queue handle and a reaping policy. Its trial list is a
//! read-only snapshot of the queue, replaced on every [`TrialStore::refresh`];
//! callers that need to see freshly finished trials must refresh first.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{info, warn, Instrument, Span};

use hs_types::{HsError, HsResult, ParamTree, Tid, TrialError, TrialStatus};

use crate::aggregate::{delete_keys, flatten, summarize};
use crate::config::{StoreConfig, AGGRESSIVE_TIMEOUT_SECS};
use crate::queue::{JobQueue, JobSpec, JobState, RunningJob, Trial};
use crate::table::Table;

/// Fields left out of [`TrialStore::as_df`] unless asked otherwise.
pub const DEFAULT_IGNORE_FIELDS: &[&str] = &["history"];

/// Columns [`TrialStore::as_df`] puts first.
const RESULT_FIRST_COLUMNS: &[&str] = &["tid", "loss", "status"];

/// Outcome of one reaping pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReapReport {
    /// Queue server time the pass was evaluated against.
    pub server_time: DateTime<Utc>,
    /// Jobs whose last heartbeat is older than this are stale.
    pub horizon: DateTime<Utc>,
    pub dry_run: bool,
    /// Number of running jobs seen.
    pub running_total: usize,
    /// Running jobs found past the horizon.
    pub stale: Vec<RunningJob>,
    /// Jobs actually removed from the queue.
    pub deleted: Vec<Tid>,
    /// Stale jobs the queue refused to delete because they heartbeated or
    /// finished in the meantime.
    pub kept_alive: Vec<Tid>,
    /// Deletes that errored; they are retried by the next pass.
    pub failed: Vec<Tid>,
}

impl ReapReport {
    pub fn stale_tids(&self) -> Vec<Tid> {
        self.stale.iter().map(|job| job.tid).collect()
    }
}

/// Trials of one experiment in one database.
pub struct TrialStore {
    queue: Arc<dyn JobQueue>,
    config: StoreConfig,
    trials: Vec<Trial>,
    span: Span,
}

impl std::fmt::Debug for TrialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialStore")
            .field("config", &self.config)
            .field("trials", &self.trials.len())
            .finish()
    }
}

impl TrialStore {
    /// Open a store on `queue` and load the current snapshot.
    pub async fn open(queue: Arc<dyn JobQueue>, config: StoreConfig) -> HsResult<Self> {
        config.validate()?;
        let span = tracing::info_span!(
            "trial_store",
            db = %config.db_name,
            exp = %config.exp_name
        );

        if config.has_aggressive_timeout() {
            span.in_scope(|| {
                warn!(
                    "kill_timeout < {} -> Very short time for each job to complete before it gets killed!",
                    AGGRESSIVE_TIMEOUT_SECS
                )
            });
        }

        let mut store = Self {
            queue,
            config,
            trials: Vec::new(),
            span,
        };
        store.refresh().await?;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The current snapshot, in ascending tid order.
    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// Result status of every trial in the snapshot.
    pub fn statuses(&self) -> Vec<TrialStatus> {
        self.trials.iter().map(|t| t.status).collect()
    }

    // -- Queue synchronization ---------------------------------------------

    /// Replace the snapshot with every trial of the experiment.
    pub async fn refresh(&mut self) -> HsResult<()> {
        self.refresh_tids(None).await
    }

    /// Replace the snapshot with the trials in `tids` (all when `None`).
    pub async fn refresh_tids(&mut self, tids: Option<&[Tid]>) -> HsResult<()> {
        let trials = self
            .queue
            .trials(&self.config.exp_name, tids)
            .instrument(self.span.clone())
            .await?;
        self.trials = trials;
        Ok(())
    }

    /// Enqueue a parameter tree as a new job.
    pub async fn submit(&self, param: ParamTree) -> HsResult<Tid> {
        let job = JobSpec {
            exp_key: self.config.exp_name.clone(),
            param,
        };
        let tid = self.queue.submit(job).instrument(self.span.clone()).await?;
        Ok(tid)
    }

    /// Delete jobs stalled in the running state.
    ///
    /// A running job whose last heartbeat is more than `timeout_last_refresh`
    /// seconds older than the queue server's clock is deleted, or only
    /// reported when `dry_run` is set. The snapshot is resynchronized
    /// afterwards in every case.
    pub async fn delete_running(
        &mut self,
        timeout_last_refresh: u64,
        dry_run: bool,
    ) -> HsResult<ReapReport> {
        let span = self.span.clone();
        self.reap(timeout_last_refresh, dry_run).instrument(span).await
    }

    async fn reap(&mut self, timeout_last_refresh: u64, dry_run: bool) -> HsResult<ReapReport> {
        let exp_key = self.config.exp_name.clone();
        let running_all = self.queue.jobs_running(&exp_key).await?;
        let server_time = self.queue.server_time().await?;
        let timeout = i64::try_from(timeout_last_refresh)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        let horizon = server_time
            .checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let running_total = running_all.len();
        let stale: Vec<RunningJob> = running_all
            .into_iter()
            .filter(|job| job.refresh_time < horizon)
            .collect();

        let mut report = ReapReport {
            server_time,
            horizon,
            dry_run,
            running_total,
            stale,
            deleted: Vec::new(),
            kept_alive: Vec::new(),
            failed: Vec::new(),
        };

        if report.stale.is_empty() {
            self.refresh().await?;
            return Ok(report);
        }

        if dry_run {
            warn!("Dry run. Not removing anything.");
        }
        info!(
            "Removing {}/{} running jobs. # all jobs: {}",
            report.stale.len(),
            running_total,
            self.trials.len()
        );
        info!("Current utc time: {}", server_time);
        info!("Time horizon: {}", horizon);

        for job in &report.stale {
            info!(tid = job.tid, refresh_time = %job.refresh_time, "Removing job");
            if dry_run {
                continue;
            }
            match self.queue.delete(job).await {
                Ok(true) => {
                    info!(tid = job.tid, "Job deleted");
                    report.deleted.push(job.tid);
                }
                Ok(false) => {
                    info!(tid = job.tid, "Job heartbeated or finished meanwhile; keeping it");
                    report.kept_alive.push(job.tid);
                }
                Err(e) => {
                    warn!(tid = job.tid, "Failed to delete job, retrying next pass: {}", e);
                    report.failed.push(job.tid);
                }
            }
        }

        self.refresh().await?;
        Ok(report)
    }

    /// Count jobs in `state` straight from the queue, reaping stalled jobs
    /// first when a kill timeout is configured.
    pub async fn count_by_state_unsynced(&mut self, state: JobState) -> HsResult<usize> {
        if let Some(timeout) = self.config.kill_timeout {
            self.delete_running(timeout, false).await?;
        }
        let count = self
            .queue
            .count_by_state(&self.config.exp_name, state)
            .instrument(self.span.clone())
            .await?;
        Ok(count)
    }

    /// Like [`TrialStore::count_by_state_unsynced`], but also resynchronizes
    /// the snapshot.
    pub async fn count_by_state(&mut self, state: JobState) -> HsResult<usize> {
        let count = self.count_by_state_unsynced(state).await?;
        self.refresh().await?;
        Ok(count)
    }

    // -- Snapshot queries ---------------------------------------------------

    pub fn get_trial(&self, tid: Tid) -> HsResult<&Trial> {
        self.trials
            .iter()
            .find(|t| t.tid == tid)
            .ok_or_else(|| TrialError::NotFound { tid }.into())
    }

    /// Parameters recorded in a completed trial's result.
    pub fn get_param(&self, tid: Tid) -> HsResult<&ParamTree> {
        Ok(&self.get_trial(tid)?.result()?.param)
    }

    /// Tids of all trials with status ok, in snapshot order.
    pub fn valid_tid(&self) -> Vec<Tid> {
        self.trials.iter().filter(|t| t.is_ok()).map(|t| t.tid).collect()
    }

    /// Tid of the `rank`-th best ok trial (0 = lowest loss). Ties keep
    /// snapshot order.
    pub fn best_trial_tid(&self, rank: usize) -> HsResult<Tid> {
        let mut candidates = Vec::new();
        for trial in self.trials.iter().filter(|t| t.is_ok()) {
            let loss = trial.result()?.loss;
            if loss.is_nan() {
                return Err(TrialError::NanLoss { tid: trial.tid }.into());
            }
            candidates.push((trial.tid, loss));
        }

        // stable sort; 0.0 and -0.0 compare equal
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        candidates.get(rank).map(|(tid, _)| *tid).ok_or_else(|| {
            HsError::invalid_state(format!(
                "rank {rank} requested but only {} trials are ok",
                candidates.len()
            ))
        })
    }

    /// Epoch count that would have been optimal for a trial's early-stopped
    /// training run.
    pub fn optimal_epochs(&self, tid: Tid) -> HsResult<usize> {
        let result = self.get_trial(tid)?.result()?;
        let fit = result.param.fit_params()?;
        result.history.optimal_epochs(fit.epochs, fit.patience)
    }

    /// Per-epoch history of the given trials (all ok trials when `None`),
    /// one row per epoch with columns `tid, [fold], epoch, ...metrics`.
    pub fn train_history(&self, tids: Option<&[Tid]>) -> HsResult<Table> {
        let wanted = match tids {
            Some(tids) => tids.to_vec(),
            None => self.valid_tid(),
        };

        let mut rows = Vec::new();
        let mut has_folds = false;
        for trial in self.trials.iter().filter(|t| wanted.contains(&t.tid)) {
            let history = &trial.result()?.history;
            has_folds |= history.is_kfold();
            for (fold, hist) in history.folds().iter().enumerate() {
                hist.loss.validate()?;
                for (i, epoch) in hist.loss.epoch.iter().enumerate() {
                    let mut row = Map::new();
                    row.insert("tid".to_string(), Value::from(trial.tid));
                    if history.is_kfold() {
                        row.insert("fold".to_string(), Value::from(fold));
                    }
                    row.insert("epoch".to_string(), Value::from(*epoch));
                    for (name, values) in &hist.loss.series {
                        row.insert(name.clone(), Value::from(values[i]));
                    }
                    rows.push(row);
                }
            }
        }

        let first: &[&str] = if has_folds {
            &["tid", "fold", "epoch"]
        } else {
            &["tid", "epoch"]
        };
        Ok(Table::from_rows(rows, first))
    }

    /// Results of all ok trials as JSON objects tagged with their `tid`.
    ///
    /// With `verbose`, trials that are not ok are reported in the log; they
    /// are never an error here.
    pub fn get_ok_results(&self, verbose: bool) -> HsResult<Vec<Map<String, Value>>> {
        let _guard = self.span.enter();
        let not_ok: Vec<&Trial> = self.trials.iter().filter(|t| !t.is_ok()).collect();

        if verbose && !not_ok.is_empty() {
            warn!("{}/{} trials were not ok.", not_ok.len(), self.trials.len());
            warn!(
                "Trials: {:?}",
                not_ok.iter().map(|t| t.tid).collect::<Vec<_>>()
            );
            warn!(
                "Statuses: {:?}",
                not_ok.iter().map(|t| t.status.to_string()).collect::<Vec<_>>()
            );
        }

        self.trials
            .iter()
            .filter(|t| t.is_ok())
            .map(|t| -> HsResult<Map<String, Value>> {
                let mut record = t.result()?.clone();
                if record.eval.is_none() {
                    record.eval = Some(summarize(&record.history)?);
                }
                let mut map = Map::new();
                map.insert("tid".to_string(), Value::from(t.tid));
                map.extend(record.to_json_map()?);
                Ok(map)
            })
            .collect()
    }

    /// One flat row per ok trial. Nested fields are flattened into
    /// `separator`-joined column names and `tid, loss, status` lead.
    pub fn as_df(&self, ignore_fields: &[&str], separator: &str) -> HsResult<Table> {
        let rows = self
            .get_ok_results(true)?
            .iter()
            .map(|result| flatten(&delete_keys(result, ignore_fields), separator))
            .collect();
        Ok(Table::from_rows(rows, RESULT_FIRST_COLUMNS))
    }
}
