//! The job row as seen by the reservation protocol.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::fingerprint::{Fingerprint, fingerprint};
use crate::id::JobId;

/// Lock ownership stamped onto a job row by a worker.
///
/// `locked_at` and `locked_by` are stored as two nullable columns, but they
/// are always set or cleared together, so they travel as one value here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub locked_at: DateTime<Utc>,
    pub locked_by: String,
}

impl JobLock {
    pub fn new(locked_at: DateTime<Utc>, locked_by: impl Into<String>) -> Self {
        Self {
            locked_at,
            locked_by: locked_by.into(),
        }
    }

    /// How long the lock has been held at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.locked_at
    }

    /// A lock older than `max_run` is presumed abandoned by a crashed worker.
    pub fn is_stale(&self, now: DateTime<Utc>, max_run: Duration) -> bool {
        self.age(now) >= max_run
    }

    /// When a healthy lock becomes stale. Saturates at the end of time.
    pub fn expires_at(&self, max_run: Duration) -> DateTime<Utc> {
        self.locked_at
            .checked_add_signed(max_run)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// A background job row.
///
/// `id` is `None` until the job store has inserted the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Option<JobId>,
    /// Numeric priority as used by the application (mapped to a broker
    /// priority when publishing).
    pub priority: i32,
    /// Number of failed attempts so far.
    pub attempts: u32,
    /// Opaque payload; only the performer knows how to run it.
    pub payload: Vec<u8>,
    /// Job is eligible to run from this instant.
    pub run_at: DateTime<Utc>,
    /// Bumped by the store on every persisted mutation.
    pub last_modified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub lock: Option<JobLock>,
    /// Set once the job has permanently failed.
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Build an unpersisted job that runs as soon as possible.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            priority: 0,
            attempts: 0,
            payload: payload.into(),
            run_at: now,
            last_modified_at: now,
            created_at: now,
            lock: None,
            failed_at: None,
            last_error: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }

    /// The store-assigned identity, or an error for an unsaved job.
    pub fn persisted_id(&self) -> DomainResult<JobId> {
        self.id.ok_or(DomainError::UnpersistedJob)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn has_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Fingerprint of the row's current persisted version.
    pub fn fingerprint(&self) -> DomainResult<Fingerprint> {
        Ok(fingerprint(self.persisted_id()?, &self.last_modified_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsaved_job_has_no_fingerprint() {
        let job = JobRecord::new(b"noop".to_vec());
        assert_eq!(job.fingerprint(), Err(DomainError::UnpersistedJob));
    }

    #[test]
    fn lock_staleness_is_inclusive_at_max_run() {
        let locked_at = Utc::now();
        let lock = JobLock::new(locked_at, "worker-1");
        let max_run = Duration::seconds(600);

        assert!(!lock.is_stale(locked_at + Duration::seconds(5), max_run));
        assert!(!lock.is_stale(locked_at + Duration::seconds(599), max_run));
        assert!(lock.is_stale(locked_at + Duration::seconds(600), max_run));
        assert_eq!(lock.expires_at(max_run), locked_at + max_run);
    }

    #[test]
    fn huge_max_run_saturates_expiry() {
        let locked_at = Utc::now();
        let lock = JobLock::new(locked_at, "worker-1");

        assert_eq!(lock.expires_at(Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(!lock.is_stale(locked_at + Duration::days(365), Duration::MAX));
    }
}
