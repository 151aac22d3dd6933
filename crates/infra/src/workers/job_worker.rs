//! Worker loop: reserve → invoke → record the outcome.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chrono::{DateTime, Utc};
use jobrelay_core::{JobId, JobRecord, RetryPolicy};

use crate::invoke::Invoker;
use crate::reservation::{ReservationManager, ReserveError};
use crate::store::{JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Reserve(#[from] ReserveError),

    #[error("failed to record job outcome: {0}")]
    Record(#[from] JobStoreError),
}

/// What one turn of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing to run (empty pop, dropped or foreign message).
    Idle,
    Succeeded(JobId),
    Rescheduled { job_id: JobId, run_at: DateTime<Utc> },
    PermanentlyFailed(JobId),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_permanently_failed: u64,
    pub idle_polls: u64,
    pub uptime_secs: u64,
}

pub struct JobWorker {
    name: String,
    reservations: Arc<ReservationManager>,
    invoker: Invoker,
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
    stats: Arc<Mutex<WorkerStats>>,
}

impl JobWorker {
    pub fn new(
        name: impl Into<String>,
        reservations: Arc<ReservationManager>,
        invoker: Invoker,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            name: name.into(),
            reservations,
            invoker,
            store,
            retry: RetryPolicy::default(),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, update: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    /// Reserve and run at most one job.
    pub async fn work_off_one(&self, cancel: &CancellationToken) -> Result<WorkOutcome, WorkerError> {
        let Some(mut reserved) = self.reservations.reserve(&self.name, cancel).await? else {
            self.record(|s| s.idle_polls += 1);
            return Ok(WorkOutcome::Idle);
        };

        let job_id = reserved
            .job()
            .id
            .ok_or(WorkerError::Record(JobStoreError::Unpersisted))?;
        debug!(worker = %self.name, job_id = %job_id, "running job");

        let result = self.invoker.invoke(&mut reserved).await;
        self.record(|s| s.jobs_processed += 1);

        match result {
            Ok(()) => {
                self.store.delete(job_id).await?;
                self.record(|s| s.jobs_succeeded += 1);
                debug!(worker = %self.name, job_id = %job_id, "job completed");
                Ok(WorkOutcome::Succeeded(job_id))
            }
            Err(err) => {
                self.record(|s| s.jobs_failed += 1);
                self.record_failure(reserved.into_job(), job_id, &err).await
            }
        }
    }

    /// Persist a failed attempt: reschedule with backoff, or give up.
    async fn record_failure(
        &self,
        mut job: JobRecord,
        job_id: JobId,
        err: &anyhow::Error,
    ) -> Result<WorkOutcome, WorkerError> {
        let now = self.store.now().await?;
        job.attempts = job.attempts.saturating_add(1);
        job.last_error = Some(format!("{err:#}"));
        job.lock = None;

        if self.retry.should_retry(job.attempts) {
            let run_at = self.retry.next_run_at(now, job.attempts);
            job.run_at = run_at;
            self.store.update(&job).await?;
            warn!(
                worker = %self.name,
                job_id = %job_id,
                attempts = job.attempts,
                run_at = %run_at,
                error = %err,
                "job failed, rescheduled"
            );
            Ok(WorkOutcome::Rescheduled { job_id, run_at })
        } else {
            job.failed_at = Some(now);
            self.store.update(&job).await?;
            self.record(|s| s.jobs_permanently_failed += 1);
            error!(
                worker = %self.name,
                job_id = %job_id,
                attempts = job.attempts,
                error = %err,
                "job permanently failed"
            );
            Ok(WorkOutcome::PermanentlyFailed(job_id))
        }
    }

    /// Work until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker = %self.name, "job worker started");
        let started = Instant::now();

        while !cancel.is_cancelled() {
            match self.work_off_one(&cancel).await {
                Ok(_) => {}
                Err(WorkerError::Reserve(ReserveError::Cancelled)) => break,
                Err(e) => {
                    error!(worker = %self.name, error = %e, "job worker turn failed");
                    let pause = self.reservations.config().idle_delay;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
            self.record(|s| s.uptime_secs = started.elapsed().as_secs());
        }

        info!(worker = %self.name, "job worker stopped");
    }

    /// Run on a background task.
    pub fn spawn(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let stats = Arc::clone(&self.stats);
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        WorkerHandle {
            cancel,
            join: Some(join),
            stats,
        }
    }
}

impl std::fmt::Debug for JobWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWorker")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Request shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "job worker task ended abnormally");
            }
        }
    }
}
