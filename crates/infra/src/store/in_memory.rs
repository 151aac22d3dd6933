//! In-memory job store for tests/dev.
//!
//! Row-level exclusion is modelled with one async mutex per row, held for the
//! lifetime of a [`RowLock`] and briefly by every business write, so a write
//! to a locked row waits for the lock holder exactly as it would against a
//! database row lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use jobrelay_core::{JobId, JobLock, JobRecord};

use super::{CommitEvent, CommitHook, CommitHooks, CommitKind, JobStore, JobStoreError, RowLock};

/// Where the store reads "now" from.
#[derive(Debug, Clone)]
enum StoreClock {
    System,
    Frozen(DateTime<Utc>),
    Broken(String),
}

#[derive(Debug)]
struct Inner {
    rows: RwLock<HashMap<JobId, JobRecord>>,
    row_mutexes: Mutex<HashMap<JobId, Arc<AsyncMutex<()>>>>,
    next_id: AtomicI64,
    clock: RwLock<StoreClock>,
    hooks: CommitHooks,
}

impl Inner {
    fn now(&self) -> Result<DateTime<Utc>, JobStoreError> {
        let clock = self
            .clock
            .read()
            .map_err(|_| JobStoreError::Storage("clock lock poisoned".to_string()))?;
        match &*clock {
            StoreClock::System => Ok(Utc::now()),
            StoreClock::Frozen(at) => Ok(*at),
            StoreClock::Broken(reason) => Err(JobStoreError::Clock(reason.clone())),
        }
    }

    fn row_mutex(&self, job_id: JobId) -> Result<Arc<AsyncMutex<()>>, JobStoreError> {
        let mut mutexes = self
            .row_mutexes
            .lock()
            .map_err(|_| JobStoreError::Storage("row lock table poisoned".to_string()))?;
        Ok(mutexes.entry(job_id).or_default().clone())
    }

    fn read_row(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let rows = self
            .rows
            .read()
            .map_err(|_| JobStoreError::Storage("rows lock poisoned".to_string()))?;
        Ok(rows.get(&job_id).cloned())
    }

    fn write_row(&self, job: JobRecord) -> Result<(), JobStoreError> {
        let job_id = job.id.ok_or(JobStoreError::Unpersisted)?;
        let mut rows = self
            .rows
            .write()
            .map_err(|_| JobStoreError::Storage("rows lock poisoned".to_string()))?;
        rows.insert(job_id, job);
        Ok(())
    }
}

/// In-memory job store.
///
/// Cloning yields another handle to the same rows.
#[derive(Debug, Clone)]
pub struct InMemoryJobStore {
    inner: Arc<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                rows: RwLock::new(HashMap::new()),
                row_mutexes: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                clock: RwLock::new(StoreClock::System),
                hooks: CommitHooks::new(),
            }),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Pin the store clock to `at`.
    pub fn freeze_time(&self, at: DateTime<Utc>) {
        self.set_clock(StoreClock::Frozen(at));
    }

    /// Move a frozen clock forward (freezing it at system time first if needed).
    pub fn advance(&self, by: Duration) {
        let next = match self.inner.now() {
            Ok(now) => now + by,
            Err(_) => Utc::now() + by,
        };
        self.set_clock(StoreClock::Frozen(next));
    }

    /// Make every subsequent clock read fail with `reason`.
    pub fn break_clock(&self, reason: impl Into<String>) {
        self.set_clock(StoreClock::Broken(reason.into()));
    }

    /// Go back to the system clock.
    pub fn use_system_time(&self) {
        self.set_clock(StoreClock::System);
    }

    pub fn len(&self) -> usize {
        self.inner.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_clock(&self, clock: StoreClock) {
        if let Ok(mut current) = self.inner.clock.write() {
            *current = clock;
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, mut job: JobRecord) -> Result<JobRecord, JobStoreError> {
        let now = self.inner.now()?;
        let job_id = match job.id {
            Some(id) => {
                if self.inner.read_row(id)?.is_some() {
                    return Err(JobStoreError::Storage(format!("job already exists: {}", id)));
                }
                self.inner.next_id.fetch_max(id.get() + 1, Ordering::SeqCst);
                id
            }
            None => JobId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst)),
        };

        job.id = Some(job_id);
        job.created_at = now;
        job.last_modified_at = now;
        self.inner.write_row(job.clone())?;

        self.inner
            .hooks
            .fire(CommitEvent::business(CommitKind::Created, job.clone()))
            .await;
        Ok(job)
    }

    async fn update(&self, job: &JobRecord) -> Result<JobRecord, JobStoreError> {
        let job_id = job.id.ok_or(JobStoreError::Unpersisted)?;
        let mutex = self.inner.row_mutex(job_id)?;

        let saved = {
            let _row_guard = mutex.lock().await;
            if self.inner.read_row(job_id)?.is_none() {
                return Err(JobStoreError::NotFound(job_id));
            }
            let mut saved = job.clone();
            saved.last_modified_at = self.inner.now()?;
            self.inner.write_row(saved.clone())?;
            saved
        };

        self.inner
            .hooks
            .fire(CommitEvent::business(CommitKind::Updated, saved.clone()))
            .await;
        Ok(saved)
    }

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mutex = self.inner.row_mutex(job_id)?;

        let removed = {
            let _row_guard = mutex.lock().await;
            let mut rows = self
                .inner
                .rows
                .write()
                .map_err(|_| JobStoreError::Storage("rows lock poisoned".to_string()))?;
            rows.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))?
        };

        if let Ok(mut mutexes) = self.inner.row_mutexes.lock() {
            mutexes.remove(&job_id);
        }

        self.inner
            .hooks
            .fire(CommitEvent::business(CommitKind::Destroyed, removed))
            .await;
        Ok(())
    }

    async fn find(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        self.inner.read_row(job_id)
    }

    async fn list_dispatchable(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = self
            .inner
            .rows
            .read()
            .map_err(|_| JobStoreError::Storage("rows lock poisoned".to_string()))?;
        let mut result: Vec<_> = rows.values().filter(|j| !j.has_failed()).cloned().collect();
        result.sort_by_key(|j| j.id);
        Ok(result)
    }

    async fn now(&self) -> Result<DateTime<Utc>, JobStoreError> {
        self.inner.now()
    }

    async fn lock_row(&self, job_id: JobId) -> Result<Option<Box<dyn RowLock>>, JobStoreError> {
        if self.inner.read_row(job_id)?.is_none() {
            return Ok(None);
        }

        let guard = self.inner.row_mutex(job_id)?.lock_owned().await;

        // The row may have been deleted while we waited for the lock.
        let Some(row) = self.inner.read_row(job_id)? else {
            return Ok(None);
        };

        Ok(Some(Box::new(InMemoryRowLock {
            inner: Arc::clone(&self.inner),
            guard,
            row,
        })))
    }

    fn on_commit(&self, hook: Arc<dyn CommitHook>) {
        self.inner.hooks.register(hook);
    }
}

struct InMemoryRowLock {
    inner: Arc<Inner>,
    guard: OwnedMutexGuard<()>,
    row: JobRecord,
}

#[async_trait]
impl RowLock for InMemoryRowLock {
    fn row(&self) -> &JobRecord {
        &self.row
    }

    async fn store_time(&mut self) -> Result<DateTime<Utc>, JobStoreError> {
        self.inner.now()
    }

    async fn stamp(self: Box<Self>, lock: JobLock) -> Result<JobRecord, JobStoreError> {
        let InMemoryRowLock { inner, guard, mut row } = *self;

        row.last_modified_at = lock.locked_at;
        row.lock = Some(lock);
        inner.write_row(row.clone())?;
        drop(guard);

        inner.hooks.fire(CommitEvent::internal(row.clone())).await;
        Ok(row)
    }

    async fn release(self: Box<Self>) -> Result<(), JobStoreError> {
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), JobStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MutationOrigin;
    use std::time::Duration as StdDuration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(CommitKind, MutationOrigin)>>,
    }

    #[async_trait]
    impl CommitHook for Recorder {
        async fn on_commit(&self, event: &CommitEvent) {
            self.events.lock().unwrap().push((event.kind, event.origin));
        }
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_timestamps() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        store.freeze_time(t0);

        let a = store.insert(JobRecord::new(b"a".to_vec())).await.unwrap();
        let b = store.insert(JobRecord::new(b"b".to_vec())).await.unwrap();

        assert_eq!(a.id, Some(JobId::new(1)));
        assert_eq!(b.id, Some(JobId::new(2)));
        assert_eq!(a.last_modified_at, t0);
        assert_eq!(store.find(JobId::new(1)).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn update_bumps_last_modified_at() {
        let store = InMemoryJobStore::new();
        store.freeze_time(Utc::now());
        let mut job = store.insert(JobRecord::new(Vec::new())).await.unwrap();
        let before = job.last_modified_at;

        store.advance(Duration::seconds(2));
        job.run_at = job.run_at + Duration::seconds(10);
        let saved = store.update(&job).await.unwrap();

        assert_eq!(saved.last_modified_at, before + Duration::seconds(2));
        assert_ne!(saved.fingerprint().unwrap(), job.fingerprint().unwrap());
    }

    #[tokio::test]
    async fn update_and_delete_of_missing_rows_fail() {
        let store = InMemoryJobStore::new();
        let mut ghost = JobRecord::new(Vec::new());
        assert_eq!(store.update(&ghost).await, Err(JobStoreError::Unpersisted));

        ghost.id = Some(JobId::new(404));
        assert_eq!(
            store.update(&ghost).await,
            Err(JobStoreError::NotFound(JobId::new(404)))
        );
        assert_eq!(
            store.delete(JobId::new(404)).await,
            Err(JobStoreError::NotFound(JobId::new(404)))
        );
    }

    #[tokio::test]
    async fn hooks_see_every_commit_with_its_origin() {
        let store = InMemoryJobStore::new();
        let recorder = Arc::new(Recorder::default());
        store.on_commit(recorder.clone());

        let job = store.insert(JobRecord::new(Vec::new())).await.unwrap();
        let id = job.id.unwrap();
        store.update(&job).await.unwrap();
        let lock = store.lock_row(id).await.unwrap().unwrap();
        lock.stamp(JobLock::new(Utc::now(), "w")).await.unwrap();
        store.delete(id).await.unwrap();

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                (CommitKind::Created, MutationOrigin::Business),
                (CommitKind::Updated, MutationOrigin::Business),
                (CommitKind::Updated, MutationOrigin::Internal),
                (CommitKind::Destroyed, MutationOrigin::Business),
            ]
        );
    }

    #[tokio::test]
    async fn lock_row_blocks_business_writes_until_released() {
        let store = InMemoryJobStore::new();
        let job = store.insert(JobRecord::new(Vec::new())).await.unwrap();
        let id = job.id.unwrap();

        let lock = store.lock_row(id).await.unwrap().unwrap();

        let writer = {
            let store = store.clone();
            let job = job.clone();
            tokio::spawn(async move { store.update(&job).await })
        };

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!writer.is_finished());

        lock.release().await.unwrap();
        assert!(writer.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn lock_row_on_missing_job_is_none() {
        let store = InMemoryJobStore::new();
        assert!(store.lock_row(JobId::new(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn broken_clock_surfaces_as_clock_error() {
        let store = InMemoryJobStore::new();
        let job = store.insert(JobRecord::new(Vec::new())).await.unwrap();
        store.break_clock("no time");

        let mut lock = store.lock_row(job.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(
            lock.store_time().await,
            Err(JobStoreError::Clock("no time".to_string()))
        );
    }

    #[tokio::test]
    async fn list_dispatchable_skips_failed_jobs() {
        let store = InMemoryJobStore::new();
        let ok = store.insert(JobRecord::new(Vec::new())).await.unwrap();
        let mut failed = store.insert(JobRecord::new(Vec::new())).await.unwrap();
        failed.failed_at = Some(Utc::now());
        store.update(&failed).await.unwrap();

        let ids: Vec<_> = store
            .list_dispatchable()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![ok.id]);
    }
}
