//! Job store abstraction (the durable source of truth).
//!
//! ## Components
//!
//! - `JobStore`: row CRUD, store-side clock, and exclusive row locks
//! - `RowLock`: an open transaction holding one row's exclusive lock
//! - `CommitHook`: observers fired after every committed (or rolled back) write
//!
//! The store never decides *whether* to lock a row; that is the job of
//! [`crate::lock::ExclusiveLock`], which is the only caller of
//! [`JobStore::lock_row`].

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobrelay_core::{JobId, JobLock, JobRecord};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job has not been persisted")]
    Unpersisted,
    #[error("store clock unavailable: {0}")]
    Clock(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    Created,
    Updated,
    Destroyed,
    /// The write was attempted but its transaction did not commit.
    RolledBack,
}

/// Who made the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOrigin {
    /// Ordinary persistence (enqueue, reschedule, failure bookkeeping).
    Business,
    /// Lock stamping by a reserving worker. Never re-announced.
    Internal,
}

/// Fired after a write reaches its final state.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub kind: CommitKind,
    pub origin: MutationOrigin,
    pub job: JobRecord,
}

impl CommitEvent {
    pub fn business(kind: CommitKind, job: JobRecord) -> Self {
        Self {
            kind,
            origin: MutationOrigin::Business,
            job,
        }
    }

    pub fn internal(job: JobRecord) -> Self {
        Self {
            kind: CommitKind::Updated,
            origin: MutationOrigin::Internal,
            job,
        }
    }
}

/// Observer of committed writes.
///
/// Hooks run after the transaction has ended; they cannot fail the write.
#[async_trait]
pub trait CommitHook: Send + Sync {
    async fn on_commit(&self, event: &CommitEvent);
}

/// Registered commit hooks, shared between a store and its open row locks.
#[derive(Default)]
pub struct CommitHooks {
    hooks: RwLock<Vec<Arc<dyn CommitHook>>>,
}

impl CommitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Arc<dyn CommitHook>) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every hook in registration order.
    pub async fn fire(&self, event: CommitEvent) {
        // Snapshot so no lock is held across the awaits below.
        let hooks: Vec<_> = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook.on_commit(&event).await;
        }
    }
}

impl std::fmt::Debug for CommitHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitHooks")
            .field("registered", &self.len())
            .finish()
    }
}

/// An open transaction holding the exclusive lock on one job row.
///
/// Dropping a `RowLock` without calling one of the finishing methods rolls
/// the transaction back.
#[async_trait]
pub trait RowLock: Send {
    /// The row as persisted when the lock was taken.
    fn row(&self) -> &JobRecord;

    /// Current time according to the store.
    async fn store_time(&mut self) -> Result<DateTime<Utc>, JobStoreError>;

    /// Write `lock` onto the row, commit, and return the updated row.
    ///
    /// Fires an [`MutationOrigin::Internal`] commit event.
    async fn stamp(self: Box<Self>, lock: JobLock) -> Result<JobRecord, JobStoreError>;

    /// Commit without writing anything.
    async fn release(self: Box<Self>) -> Result<(), JobStoreError>;

    /// Roll back.
    async fn abort(self: Box<Self>) -> Result<(), JobStoreError>;
}

/// Durable job storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. The store assigns the id and `last_modified_at`.
    async fn insert(&self, job: JobRecord) -> Result<JobRecord, JobStoreError>;

    /// Persist changes to an existing job, bumping `last_modified_at`.
    async fn update(&self, job: &JobRecord) -> Result<JobRecord, JobStoreError>;

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError>;

    async fn find(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Every job that has not permanently failed, oldest first.
    async fn list_dispatchable(&self) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Current time according to the store.
    async fn now(&self) -> Result<DateTime<Utc>, JobStoreError>;

    /// Open a transaction and take the exclusive lock on `job_id`.
    ///
    /// Blocks while another caller holds the same row. Returns `None` when
    /// no such row exists.
    async fn lock_row(&self, job_id: JobId) -> Result<Option<Box<dyn RowLock>>, JobStoreError>;

    /// Subscribe to committed writes.
    fn on_commit(&self, hook: Arc<dyn CommitHook>);
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, job: JobRecord) -> Result<JobRecord, JobStoreError> {
        (**self).insert(job).await
    }

    async fn update(&self, job: &JobRecord) -> Result<JobRecord, JobStoreError> {
        (**self).update(job).await
    }

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).delete(job_id).await
    }

    async fn find(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).find(job_id).await
    }

    async fn list_dispatchable(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_dispatchable().await
    }

    async fn now(&self) -> Result<DateTime<Utc>, JobStoreError> {
        (**self).now().await
    }

    async fn lock_row(&self, job_id: JobId) -> Result<Option<Box<dyn RowLock>>, JobStoreError> {
        (**self).lock_row(job_id).await
    }

    fn on_commit(&self, hook: Arc<dyn CommitHook>) {
        (**self).on_commit(hook)
    }
}
