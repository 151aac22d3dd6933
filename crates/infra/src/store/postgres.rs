//! Postgres-backed job store.
//!
//! Row exclusion uses `SELECT ... FOR UPDATE` inside a transaction, so the
//! lock is released by the database when the holder commits, rolls back, or
//! loses its connection.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (any code) | `Storage` |
//! | PoolClosed | `Storage` |
//! | RowNotFound | `NotFound` where the caller knows the id, else `Storage` |
//! | Other | `Storage` |
//!
//! Reading `clock_timestamp()` maps to `Clock` instead, so callers can tell a
//! broken store clock apart from a failed write.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument, warn};

use jobrelay_core::{JobId, JobLock, JobRecord};

use super::{CommitEvent, CommitHook, CommitHooks, CommitKind, JobStore, JobStoreError, RowLock};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id               BIGSERIAL PRIMARY KEY,
    priority         INTEGER     NOT NULL DEFAULT 0,
    attempts         INTEGER     NOT NULL DEFAULT 0,
    payload          BYTEA       NOT NULL,
    run_at           TIMESTAMPTZ NOT NULL,
    last_modified_at TIMESTAMPTZ NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL,
    locked_at        TIMESTAMPTZ,
    locked_by        TEXT,
    failed_at        TIMESTAMPTZ,
    last_error       TEXT,
    CONSTRAINT jobs_lock_pair CHECK ((locked_at IS NULL) = (locked_by IS NULL))
)
"#;

const COLUMNS: &str = "id, priority, attempts, payload, run_at, last_modified_at, created_at, \
                       locked_at, locked_by, failed_at, last_error";

/// Postgres-backed job store.
///
/// `last_modified_at` is always written from `clock_timestamp()`, so every
/// fingerprint is derived from the database clock rather than a worker's.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    hooks: Arc<CommitHooks>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            hooks: Arc::new(CommitHooks::new()),
        }
    }

    /// Connect using a database URL.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `jobs` table if it does not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Commit `tx`, firing `kind` on success and `RolledBack` otherwise.
    async fn commit_and_fire(
        &self,
        tx: Transaction<'static, Postgres>,
        kind: CommitKind,
        job: JobRecord,
        operation: &str,
    ) -> Result<(), JobStoreError> {
        match tx.commit().await {
            Ok(()) => {
                self.hooks.fire(CommitEvent::business(kind, job)).await;
                Ok(())
            }
            Err(e) => {
                self.hooks
                    .fire(CommitEvent::business(CommitKind::RolledBack, job))
                    .await;
                Err(map_sqlx_error(operation, e))
            }
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(priority = job.priority, job_id = tracing::field::Empty), err)]
    async fn insert(&self, job: JobRecord) -> Result<JobRecord, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_insert", e))?;

        let (locked_at, locked_by) = split_lock(&job.lock);
        let sql = format!(
            r#"
            INSERT INTO jobs (
                id, priority, attempts, payload, run_at,
                last_modified_at, created_at,
                locked_at, locked_by, failed_at, last_error
            )
            VALUES (
                COALESCE($1, nextval(pg_get_serial_sequence('jobs', 'id'))),
                $2, $3, $4, $5,
                clock_timestamp(), clock_timestamp(),
                $6, $7, $8, $9
            )
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job.id.map(|id| id.get()))
            .bind(job.priority)
            .bind(job.attempts as i32)
            .bind(&job.payload)
            .bind(job.run_at)
            .bind(locked_at)
            .bind(locked_by)
            .bind(job.failed_at)
            .bind(&job.last_error)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;

        let saved = decode_row(&row)?;
        if let Some(id) = saved.id {
            Span::current().record("job_id", id.get());
        }
        self.commit_and_fire(tx, CommitKind::Created, saved.clone(), "commit_insert")
            .await?;
        Ok(saved)
    }

    #[instrument(skip(self, job), fields(job_id = ?job.id), err)]
    async fn update(&self, job: &JobRecord) -> Result<JobRecord, JobStoreError> {
        let job_id = job.id.ok_or(JobStoreError::Unpersisted)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_update", e))?;

        let (locked_at, locked_by) = split_lock(&job.lock);
        let sql = format!(
            r#"
            UPDATE jobs SET
                priority = $2,
                attempts = $3,
                payload = $4,
                run_at = $5,
                locked_at = $6,
                locked_by = $7,
                failed_at = $8,
                last_error = $9,
                last_modified_at = clock_timestamp()
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .bind(job.priority)
            .bind(job.attempts as i32)
            .bind(&job.payload)
            .bind(job.run_at)
            .bind(locked_at)
            .bind(locked_by)
            .bind(job.failed_at)
            .bind(&job.last_error)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let saved = decode_row(&row)?;
        self.commit_and_fire(tx, CommitKind::Updated, saved.clone(), "commit_update")
            .await?;
        Ok(saved)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_delete", e))?;

        let sql = format!("DELETE FROM jobs WHERE id = $1 RETURNING {COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let removed = decode_row(&row)?;
        self.commit_and_fire(tx, CommitKind::Destroyed, removed, "commit_delete")
            .await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn find(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;
        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), fields(job_count = tracing::field::Empty), err)]
    async fn list_dispatchable(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE failed_at IS NULL ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dispatchable", e))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(decode_row(row)?);
        }
        Span::current().record("job_count", jobs.len());
        Ok(jobs)
    }

    async fn now(&self) -> Result<DateTime<Utc>, JobStoreError> {
        sqlx::query_scalar::<_, DateTime<Utc>>("SELECT clock_timestamp()")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| JobStoreError::Clock(e.to_string()))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn lock_row(&self, job_id: JobId) -> Result<Option<Box<dyn RowLock>>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_lock_row", e))?;

        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_row", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };

        let row = decode_row(&row)?;
        Ok(Some(Box::new(PgRowLock {
            tx,
            row,
            hooks: Arc::clone(&self.hooks),
        })))
    }

    fn on_commit(&self, hook: Arc<dyn CommitHook>) {
        self.hooks.register(hook);
    }
}

/// Open `FOR UPDATE` transaction on one row.
struct PgRowLock {
    tx: Transaction<'static, Postgres>,
    row: JobRecord,
    hooks: Arc<CommitHooks>,
}

#[async_trait]
impl RowLock for PgRowLock {
    fn row(&self) -> &JobRecord {
        &self.row
    }

    async fn store_time(&mut self) -> Result<DateTime<Utc>, JobStoreError> {
        sqlx::query_scalar::<_, DateTime<Utc>>("SELECT clock_timestamp()")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| JobStoreError::Clock(e.to_string()))
    }

    async fn stamp(self: Box<Self>, lock: JobLock) -> Result<JobRecord, JobStoreError> {
        let PgRowLock { mut tx, row, hooks } = *self;
        let job_id = row.id.ok_or(JobStoreError::Unpersisted)?;

        let sql = format!(
            r#"
            UPDATE jobs SET
                locked_at = $2,
                locked_by = $3,
                last_modified_at = $2
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        );
        let updated = sqlx::query(&sql)
            .bind(job_id.get())
            .bind(lock.locked_at)
            .bind(&lock.locked_by)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("stamp", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;
        let updated = decode_row(&updated)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_stamp", e))?;

        hooks.fire(CommitEvent::internal(updated.clone())).await;
        Ok(updated)
    }

    async fn release(self: Box<Self>) -> Result<(), JobStoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_release", e))
    }

    async fn abort(self: Box<Self>) -> Result<(), JobStoreError> {
        let job_id = self.row.id;
        self.tx.rollback().await.map_err(|e| {
            warn!(job_id = ?job_id, error = %e, "row lock rollback failed");
            map_sqlx_error("rollback", e)
        })
    }
}

fn split_lock(lock: &Option<JobLock>) -> (Option<DateTime<Utc>>, Option<String>) {
    match lock {
        Some(l) => (Some(l.locked_at), Some(l.locked_by.clone())),
        None => (None, None),
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, JobStoreError> {
    let row = <JobRow as sqlx::FromRow<'_, sqlx::postgres::PgRow>>::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {}", e)))?;
    Ok(row.into())
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {} [{}]: {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            JobStoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

struct JobRow {
    id: i64,
    priority: i32,
    attempts: i32,
    payload: Vec<u8>,
    run_at: DateTime<Utc>,
    last_modified_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    failed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            payload: row.try_get("payload")?,
            run_at: row.try_get("run_at")?,
            last_modified_at: row.try_get("last_modified_at")?,
            created_at: row.try_get("created_at")?,
            locked_at: row.try_get("locked_at")?,
            locked_by: row.try_get("locked_by")?,
            failed_at: row.try_get("failed_at")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        let lock = match (row.locked_at, row.locked_by) {
            (Some(locked_at), Some(locked_by)) => Some(JobLock::new(locked_at, locked_by)),
            _ => None,
        };
        JobRecord {
            id: Some(JobId::new(row.id)),
            priority: row.priority,
            attempts: row.attempts.max(0) as u32,
            payload: row.payload,
            run_at: row.run_at,
            last_modified_at: row.last_modified_at,
            created_at: row.created_at,
            lock,
            failed_at: row.failed_at,
            last_error: row.last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn job_row_pairs_lock_columns() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let row = JobRow {
            id: 7,
            priority: 3,
            attempts: 2,
            payload: b"x".to_vec(),
            run_at: at,
            last_modified_at: at,
            created_at: at,
            locked_at: Some(at),
            locked_by: Some("worker-1".to_string()),
            failed_at: None,
            last_error: None,
        };

        let job: JobRecord = row.into();
        assert_eq!(job.id, Some(JobId::new(7)));
        assert_eq!(job.attempts, 2);
        assert_eq!(job.lock, Some(JobLock::new(at, "worker-1")));
    }

    #[test]
    fn split_lock_round_trips_through_columns() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        assert_eq!(split_lock(&None), (None, None));
        assert_eq!(
            split_lock(&Some(JobLock::new(at, "w"))),
            (Some(at), Some("w".to_string()))
        );
    }

    #[test]
    fn pool_closed_maps_to_storage() {
        let err = map_sqlx_error("find", sqlx::Error::PoolClosed);
        assert!(matches!(err, JobStoreError::Storage(msg) if msg.contains("find")));
    }
}
