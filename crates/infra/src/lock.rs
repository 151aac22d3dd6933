//! Exclusive lock primitive.
//!
//! The only place row-level mutual exclusion on job rows is implemented.
//! Every caller that needs to stamp `locked_at`/`locked_by` without racing
//! another worker goes through [`ExclusiveLock::acquire`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use jobrelay_core::{JobId, JobLock, JobRecord};

use crate::store::{JobStore, JobStoreError};

#[derive(Clone)]
pub struct ExclusiveLock {
    store: Arc<dyn JobStore>,
}

impl ExclusiveLock {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Lock `job_id` for `owner` if `decide` accepts the row.
    ///
    /// `decide` sees the row as persisted before any stamp, plus the store's
    /// current time. While it runs, every other `acquire` on the same id
    /// waits.
    ///
    /// - no such row: `Ok(None)`
    /// - `decide` returns `Ok(true)`: the row is stamped with
    ///   `(store time, owner)` and returned
    /// - `decide` returns `Ok(false)`: nothing is written, `Ok(None)`
    /// - `decide` fails: the transaction is rolled back and the error returned
    pub async fn acquire<F, E>(
        &self,
        job_id: JobId,
        owner: &str,
        decide: F,
    ) -> Result<Option<JobRecord>, E>
    where
        F: FnOnce(&JobRecord, DateTime<Utc>) -> Result<bool, E> + Send,
        E: From<JobStoreError> + Send,
    {
        let Some(mut row_lock) = self.store.lock_row(job_id).await? else {
            debug!(job_id = %job_id, "lock target not found");
            return Ok(None);
        };

        let now = match row_lock.store_time().await {
            Ok(now) => now,
            Err(e) => {
                if let Err(rollback) = row_lock.abort().await {
                    warn!(job_id = %job_id, error = %rollback, "rollback after clock failure failed");
                }
                return Err(e.into());
            }
        };

        match decide(row_lock.row(), now) {
            Ok(true) => {
                let stamped = row_lock.stamp(JobLock::new(now, owner)).await?;
                debug!(job_id = %job_id, owner = %owner, locked_at = %now, "job locked");
                Ok(Some(stamped))
            }
            Ok(false) => {
                row_lock.release().await?;
                Ok(None)
            }
            Err(e) => {
                if let Err(rollback) = row_lock.abort().await {
                    warn!(job_id = %job_id, error = %rollback, "rollback after rejected decision failed");
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ExclusiveLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveLock").finish_non_exhaustive()
    }
}
