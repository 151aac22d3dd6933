//! Reservation manager.
//!
//! Turns one popped notification into a decision about its job: run it now
//! (lock it and hand it back with the message still unacked), drop the
//! message, or drop it and schedule a recheck for when the current lock
//! holder should have finished.
//!
//! ## Acknowledgement
//!
//! Every popped message is acked exactly once:
//! - immediately, when `reserve` does not return a job
//! - later by [`crate::invoke::Invoker`], when it does
//!
//! Errors while deciding propagate with the message unacked, leaving it for
//! redelivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use jobrelay_core::{JobRecord, Notification};

use crate::broker::{Broker, BrokerError, Delivery};
use crate::handlers::HandlerRegistry;
use crate::invoke::ReservedJob;
use crate::lock::ExclusiveLock;
use crate::notifier::{Notifier, NotifyError};
use crate::store::{JobStore, JobStoreError};

/// Lower bound for the pause after an empty pop.
pub const MIN_IDLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ReserveError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Broker(BrokerError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("external handler failed: {0}")]
    Handler(anyhow::Error),

    #[error("reservation cancelled")]
    Cancelled,
}

impl From<BrokerError> for ReserveError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Cancelled => ReserveError::Cancelled,
            other => ReserveError::Broker(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationConfig {
    /// A lock older than this is presumed abandoned.
    pub max_run_duration: chrono::Duration,
    /// How long one pop waits for a message.
    pub pop_wait: Duration,
    /// Pause after an empty pop, never below [`MIN_IDLE_DELAY`].
    pub idle_delay: Duration,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            max_run_duration: chrono::Duration::hours(4),
            pop_wait: Duration::from_secs(5),
            idle_delay: MIN_IDLE_DELAY,
        }
    }
}

impl ReservationConfig {
    pub fn with_max_run_duration(mut self, max_run: chrono::Duration) -> Self {
        self.max_run_duration = max_run;
        self
    }

    pub fn with_pop_wait(mut self, wait: Duration) -> Self {
        self.pop_wait = wait;
        self
    }

    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay.max(MIN_IDLE_DELAY);
        self
    }
}

/// What the lock decision found, captured for the caller of `acquire`.
#[derive(Debug)]
enum Verdict {
    PermanentlyFailed,
    Superseded,
    Available,
    LockHeld {
        row: JobRecord,
        recheck_at: DateTime<Utc>,
    },
    LockAbandoned {
        previous_owner: String,
        age: chrono::Duration,
    },
}

impl Verdict {
    fn judge(
        row: &JobRecord,
        notification: &Notification,
        now: DateTime<Utc>,
        max_run: chrono::Duration,
    ) -> Self {
        if row.has_failed() {
            return Verdict::PermanentlyFailed;
        }
        if !notification.matches(row) {
            return Verdict::Superseded;
        }
        match &row.lock {
            None => Verdict::Available,
            Some(lock) if lock.is_stale(now, max_run) => Verdict::LockAbandoned {
                previous_owner: lock.locked_by.clone(),
                age: lock.age(now),
            },
            Some(lock) => Verdict::LockHeld {
                row: row.clone(),
                recheck_at: lock.expires_at(max_run),
            },
        }
    }

    fn takes_lock(&self) -> bool {
        matches!(self, Verdict::Available | Verdict::LockAbandoned { .. })
    }
}

pub struct ReservationManager {
    broker: Arc<dyn Broker>,
    lock: ExclusiveLock,
    notifier: Notifier,
    handlers: HandlerRegistry,
    config: ReservationConfig,
}

impl ReservationManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        notifier: Notifier,
        config: ReservationConfig,
    ) -> Self {
        Self {
            broker,
            lock: ExclusiveLock::new(store),
            notifier,
            handlers: HandlerRegistry::new(),
            config,
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn config(&self) -> &ReservationConfig {
        &self.config
    }

    /// Pop one notification and decide what `worker` should do with its job.
    ///
    /// Returns the locked job when `worker` should run it. Cancellation is
    /// observed while waiting on the broker (and during the idle pause), not
    /// once a message is being decided.
    #[instrument(skip(self, cancel), fields(worker = %worker), err)]
    pub async fn reserve(
        &self,
        worker: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ReservedJob>, ReserveError> {
        let Some(delivery) = self.broker.pop(self.config.pop_wait, cancel).await? else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReserveError::Cancelled),
                _ = tokio::time::sleep(self.config.idle_delay) => {}
            }
            return Ok(None);
        };

        if self
            .handlers
            .dispatch(&delivery)
            .await
            .map_err(ReserveError::Handler)?
        {
            delivery.ack().await?;
            return Ok(None);
        }

        let notification = match Notification::from_bytes(delivery.payload()) {
            Ok(n) => n,
            Err(e) => {
                warn!(
                    tag = %delivery.tag(),
                    source = %delivery.source(),
                    error = %e,
                    "dropping undecodable broker message"
                );
                delivery.ack().await?;
                return Ok(None);
            }
        };

        self.decide(worker, notification, delivery).await
    }

    async fn decide(
        &self,
        worker: &str,
        notification: Notification,
        delivery: Delivery,
    ) -> Result<Option<ReservedJob>, ReserveError> {
        let job_id = notification.job_id;
        let max_run = self.config.max_run_duration;
        let mut verdict = None;

        let locked = self
            .lock
            .acquire(job_id, worker, |row, now| {
                let v = Verdict::judge(row, &notification, now, max_run);
                let take = v.takes_lock();
                verdict = Some(v);
                Ok::<_, ReserveError>(take)
            })
            .await?;

        if let Some(job) = locked {
            if let Some(Verdict::LockAbandoned { previous_owner, age }) = &verdict {
                warn!(
                    job_id = %job_id,
                    previous_owner = %previous_owner,
                    lock_age_secs = age.num_seconds(),
                    "taking over abandoned job lock"
                );
            }
            return Ok(Some(ReservedJob::new(job, delivery)));
        }

        delivery.ack().await?;

        match verdict {
            None => debug!(job_id = %job_id, "job no longer exists, dropping notification"),
            Some(Verdict::PermanentlyFailed) => {
                debug!(job_id = %job_id, "job has permanently failed, dropping notification")
            }
            Some(Verdict::Superseded) => debug!(
                job_id = %job_id,
                fingerprint = %notification.fingerprint,
                "notification superseded by a newer job version"
            ),
            Some(Verdict::LockHeld { row, recheck_at }) => {
                debug!(
                    job_id = %job_id,
                    recheck_at = %recheck_at,
                    "job locked by a live worker, scheduling recheck"
                );
                self.notifier.publish(&row, Some(recheck_at)).await?;
            }
            // Only reachable if the stamp itself vanished, which `acquire` reports as an error.
            Some(Verdict::Available) | Some(Verdict::LockAbandoned { .. }) => {}
        }
        Ok(None)
    }
}

impl std::fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationManager")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .finish()
    }
}
