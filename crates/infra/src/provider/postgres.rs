//! Postgres-backed provider.
//!
//! Jobs live in a single `queue_jobs` table. The full job is kept as JSONB; the
//! columns the claim query filters on are stored alongside it.
//!
//! ## Claiming
//!
//! `pop` selects the oldest claimable rows with `FOR UPDATE SKIP LOCKED` and
//! stamps their lease in the same statement. Concurrent workers therefore skip
//! each other's rows instead of blocking, and never receive the same job while
//! its lease is active.
//!
//! ## Runtime
//!
//! `Provider` is synchronous. Calls made from a multi-thread tokio runtime run
//! the query through `block_in_place`; calls made from a plain thread use the
//! runtime handle captured when the provider was built.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{Span, instrument};

use taskdrain_core::{Clock, Job, JobId, JobRecord, Lease, SystemClock};

use super::{Batch, Provider, ProviderError};

/// Statements creating the job table, applied by [`PostgresProvider::migrate`].
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queue_jobs (
        id UUID PRIMARY KEY,
        sequence BIGSERIAL NOT NULL,
        queue TEXT NOT NULL,
        payload JSONB NOT NULL,
        job JSONB NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_tries INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL,
        available_at TIMESTAMPTZ NOT NULL,
        locked_until TIMESTAMPTZ,
        failed BOOLEAN NOT NULL DEFAULT FALSE,
        timed_out BOOLEAN NOT NULL DEFAULT FALSE,
        last_error TEXT,
        failed_at TIMESTAMPTZ
    )
    "#,
    r#"
    ALTER TABLE queue_jobs
        ADD COLUMN IF NOT EXISTS timed_out BOOLEAN NOT NULL DEFAULT FALSE
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS queue_jobs_claim_idx
        ON queue_jobs (queue, sequence)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS queue_jobs_failed_idx
        ON queue_jobs (queue, failed_at)
        WHERE failed
    "#,
];

const COLUMNS: &str = r#"
    id,
    sequence,
    job,
    attempts,
    created_at,
    available_at,
    locked_until,
    failed,
    timed_out,
    last_error,
    failed_at
"#;

/// Rows that can still be claimed at some point.
const NOT_EXHAUSTED: &str = "NOT (failed AND NOT timed_out AND attempts >= max_tries)";

#[derive(Debug, Clone)]
pub struct PostgresProvider {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    lease_for: Duration,
    handle: Option<Handle>,
}

impl PostgresProvider {
    /// Build a provider over `pool`.
    ///
    /// When called inside a tokio runtime, that runtime's handle is kept for
    /// calls later made from threads outside it.
    pub fn new(pool: PgPool, lease_for: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
            lease_for,
            handle: Handle::try_current().ok(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), ProviderError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(queue = %job.queue), err)]
    pub async fn insert_job(&self, job: Job) -> Result<JobId, ProviderError> {
        job.validate()?;
        let id = job.id.unwrap_or_default();
        let record = JobRecord::new(id, job, 0, self.clock.now());

        let payload = to_json(&record.job.payload)?;
        let body = to_json(&record.job)?;

        sqlx::query(
            r#"
            INSERT INTO queue_jobs (
                id, queue, payload, job, attempts, max_tries, created_at, available_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id.as_uuid())
        .bind(record.queue())
        .bind(payload)
        .bind(body)
        .bind(record.job.attempts as i32)
        .bind(record.job.tries.unwrap_or(1) as i32)
        .bind(record.created_at)
        .bind(record.available_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ProviderError::AlreadyExists(id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(id)
    }

    #[instrument(skip(self), fields(leased = tracing::field::Empty), err)]
    pub async fn claim(&self, queue: &str, count: usize) -> Result<Vec<JobRecord>, ProviderError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let locked_until = now + to_chrono(self.lease_for);

        let rows = sqlx::query(&format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM queue_jobs
                WHERE queue = $1
                  AND (locked_until IS NULL OR locked_until <= $2)
                  AND {NOT_EXHAUSTED}
                  AND available_at <= $2
                ORDER BY sequence ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs
            SET locked_until = $4,
                failed = FALSE,
                timed_out = FALSE,
                attempts = attempts + 1
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(now)
        .bind(count as i64)
        .bind(locked_until)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        // UPDATE .. RETURNING does not preserve the CTE's ordering.
        let mut records = decode_rows(rows)?;
        records.sort_by_key(|r| r.sequence);

        Span::current().record("leased", records.len());
        Ok(records)
    }

    #[instrument(skip(self), err)]
    pub async fn count_pending(&self, queue: &str) -> Result<usize, ProviderError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT COUNT(*) AS pending
            FROM queue_jobs
            WHERE queue = $1
              AND (locked_until IS NULL OR locked_until <= $2)
              AND {NOT_EXHAUSTED}
            "#
        ))
        .bind(queue)
        .bind(self.clock.now())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_pending", e))?;

        let pending: i64 = row
            .try_get("pending")
            .map_err(|e| ProviderError::Storage(format!("failed to read pending count: {e}")))?;
        Ok(pending.max(0) as usize)
    }

    #[instrument(skip(self), err)]
    pub async fn earliest_available(&self, queue: &str) -> Result<Option<DateTime<Utc>>, ProviderError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT MIN(GREATEST(available_at, COALESCE(locked_until, available_at))) AS next_at
            FROM queue_jobs
            WHERE queue = $1
              AND {NOT_EXHAUSTED}
            "#
        ))
        .bind(queue)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("earliest_available", e))?;

        row.try_get("next_at")
            .map_err(|e| ProviderError::Storage(format!("failed to read next available time: {e}")))
    }

    #[instrument(skip(self, job), err)]
    pub async fn contains(&self, job: &Job, queue: &str) -> Result<bool, ProviderError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM queue_jobs
                WHERE queue = $1
                  AND payload = $2
                  AND {NOT_EXHAUSTED}
            ) AS present
            "#
        ))
        .bind(queue)
        .bind(to_json(&job.payload)?)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("contains", e))?;

        row.try_get("present")
            .map_err(|e| ProviderError::Storage(format!("failed to read presence flag: {e}")))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn delete(&self, id: JobId) -> Result<(), ProviderError> {
        let result = sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn load(&self, id: JobId) -> Result<Option<JobRecord>, ProviderError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM queue_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load", e))?;

        row.map(|r| JobRow::decode(&r)?.into_record()).transpose()
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    pub async fn record_failure(&self, id: JobId, error: &str) -> Result<(), ProviderError> {
        let now = self.clock.now();
        let lease_for = self.lease_for;
        self.update_locked(id, "record_failure", |record| {
            record.fail(now, error, lease_for)
        })
        .await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    pub async fn record_timeout(&self, id: JobId, error: &str) -> Result<(), ProviderError> {
        let now = self.clock.now();
        let lease_for = self.lease_for;
        self.update_locked(id, "record_timeout", |record| {
            record.time_out(now, error, lease_for)
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn requeue(&self, id: JobId) -> Result<(), ProviderError> {
        let now = self.clock.now();
        self.update_locked(id, "requeue", |record| record.reset(now)).await
    }

    #[instrument(skip(self), err)]
    pub async fn list_failed(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>, ProviderError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM queue_jobs
            WHERE queue = $1 AND failed
            ORDER BY failed_at ASC, sequence ASC
            LIMIT $2
            "#
        ))
        .bind(queue)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_failed", e))?;

        decode_rows(rows)
    }

    /// Load a row under `FOR UPDATE`, apply `change` and write the lease back.
    async fn update_locked<F>(&self, id: JobId, operation: &str, change: F) -> Result<(), ProviderError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM queue_jobs WHERE id = $1 FOR UPDATE"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(ProviderError::NotFound(id));
        };

        let mut record = JobRow::decode(&row)?.into_record()?;
        change(&mut record);
        write_state(&mut tx, &record, operation).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    /// Run a query future to completion from synchronous code.
    fn block<F>(&self, fut: F) -> Result<F::Output, ProviderError>
    where
        F: Future,
    {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                Ok(tokio::task::block_in_place(|| handle.block_on(fut)))
            }
            Ok(_) => Err(ProviderError::Unavailable(
                "PostgresProvider cannot block inside a current-thread runtime".to_string(),
            )),
            Err(_) => {
                let handle = self.handle.as_ref().ok_or_else(|| {
                    ProviderError::Unavailable(
                        "PostgresProvider requires a tokio runtime handle".to_string(),
                    )
                })?;
                Ok(handle.block_on(fut))
            }
        }
    }
}

impl Provider for PostgresProvider {
    fn push(&self, job: Job) -> Result<JobId, ProviderError> {
        self.block(self.insert_job(job))?
    }

    fn pop(&self, queue: &str, count: usize) -> Result<Batch, ProviderError> {
        let records = self.block(self.claim(queue, count))??;
        Ok(Batch::new(records.into_iter().map(|r| r.job).collect()))
    }

    fn pending_count(&self, queue: &str) -> Result<usize, ProviderError> {
        self.block(self.count_pending(queue))?
    }

    fn next_available_at(&self, queue: &str) -> Result<Option<DateTime<Utc>>, ProviderError> {
        self.block(self.earliest_available(queue))?
    }

    fn in_queue(&self, job: &Job, queue: &str) -> Result<bool, ProviderError> {
        self.block(self.contains(job, queue))?
    }

    fn release(&self, id: JobId) -> Result<(), ProviderError> {
        self.block(self.delete(id))?
    }

    fn mark_failed(&self, id: JobId, error: &str) -> Result<(), ProviderError> {
        self.block(self.record_failure(id, error))?
    }

    fn mark_timed_out(&self, id: JobId, error: &str) -> Result<(), ProviderError> {
        self.block(self.record_timeout(id, error))?
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, ProviderError> {
        self.block(self.load(id))?
    }

    fn failed_jobs(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>, ProviderError> {
        self.block(self.list_failed(queue, limit))?
    }

    fn retry_failed(&self, id: JobId) -> Result<(), ProviderError> {
        self.block(self.requeue(id))?
    }

    fn forget(&self, id: JobId) -> Result<(), ProviderError> {
        self.block(self.delete(id))?
    }
}

async fn write_state(
    tx: &mut Transaction<'_, Postgres>,
    record: &JobRecord,
    operation: &str,
) -> Result<(), ProviderError> {
    sqlx::query(
        r#"
        UPDATE queue_jobs
        SET attempts = $2,
            available_at = $3,
            locked_until = $4,
            failed = $5,
            timed_out = $6,
            last_error = $7,
            failed_at = $8
        WHERE id = $1
        "#,
    )
    .bind(record.id.as_uuid())
    .bind(record.job.attempts as i32)
    .bind(record.available_at)
    .bind(record.lease.locked_until)
    .bind(record.lease.failed)
    .bind(record.lease.timed_out)
    .bind(record.last_error.as_deref())
    .bind(record.failed_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;

    Ok(())
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue, ProviderError> {
    serde_json::to_value(value).map_err(|e| ProviderError::Storage(format!("failed to encode job: {e}")))
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<JobRecord>, ProviderError> {
    rows.iter()
        .map(|row| JobRow::decode(row)?.into_record())
        .collect()
}

/// Map SQLx errors to ProviderError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ProviderError {
    match err {
        sqlx::Error::Database(db_err) => {
            ProviderError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            ProviderError::Unavailable(format!("connection pool unavailable in {}", operation))
        }
        sqlx::Error::Io(e) => ProviderError::Unavailable(format!("io error in {}: {}", operation, e)),
        _ => ProviderError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    sequence: i64,
    job: JsonValue,
    attempts: i32,
    created_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
    failed: bool,
    timed_out: bool,
    last_error: Option<String>,
    failed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn decode(row: &PgRow) -> Result<Self, ProviderError> {
        let read = |e: sqlx::Error| ProviderError::Storage(format!("failed to decode job row: {e}"));
        Ok(JobRow {
            id: row.try_get("id").map_err(read)?,
            sequence: row.try_get("sequence").map_err(read)?,
            job: row.try_get("job").map_err(read)?,
            attempts: row.try_get("attempts").map_err(read)?,
            created_at: row.try_get("created_at").map_err(read)?,
            available_at: row.try_get("available_at").map_err(read)?,
            locked_until: row.try_get("locked_until").map_err(read)?,
            failed: row.try_get("failed").map_err(read)?,
            timed_out: row.try_get("timed_out").map_err(read)?,
            last_error: row.try_get("last_error").map_err(read)?,
            failed_at: row.try_get("failed_at").map_err(read)?,
        })
    }

    /// The table's columns are authoritative over the copy inside `job`.
    fn into_record(self) -> Result<JobRecord, ProviderError> {
        let id = JobId::from_uuid(self.id);
        let mut job: Job = serde_json::from_value(self.job)
            .map_err(|e| ProviderError::Storage(format!("failed to decode job {id}: {e}")))?;
        job.id = Some(id);
        job.attempts = self.attempts.max(0) as u32;

        Ok(JobRecord {
            id,
            job,
            sequence: self.sequence.max(0) as u64,
            created_at: self.created_at,
            available_at: self.available_at,
            lease: Lease {
                locked_until: self.locked_until,
                failed: self.failed,
                timed_out: self.timed_out,
            },
            last_error: self.last_error,
            failed_at: self.failed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    //! These tests need a reachable database:
    //! `DATABASE_URL=postgres://... cargo test -p taskdrain-infra -- --ignored`

    use super::*;

    async fn provider() -> PostgresProvider {
        taskdrain_observability::init_for_tests("taskdrain_infra=debug,info");
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect");
        let provider = PostgresProvider::new(pool, Duration::from_secs(60));
        provider.migrate().await.expect("migrate");
        provider
    }

    fn unique_queue() -> String {
        format!("test-{}", JobId::new())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore]
    async fn claim_leases_in_insertion_order() {
        let provider = provider().await;
        let queue = unique_queue();

        let mut ids = Vec::new();
        for n in 0..3 {
            let job = Job::typed("test", serde_json::json!({ "n": n })).on_queue(&queue);
            ids.push(provider.push(job).unwrap());
        }

        let batch = provider.pop(&queue, 10).unwrap();
        assert_eq!(batch.job_ids(), ids.as_slice());
        assert!(provider.pop(&queue, 10).unwrap().is_empty());
        assert_eq!(provider.pending_count(&queue).unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore]
    async fn failed_job_is_kept_until_retried() {
        let provider = provider().await;
        let queue = unique_queue();
        let job = Job::typed("test", serde_json::json!({})).on_queue(&queue);
        let id = provider.push(job.clone()).unwrap();

        provider.pop(&queue, 1).unwrap();
        provider.mark_failed(id, "boom").unwrap();

        let failed = provider.failed_jobs(&queue, 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("boom"));
        assert!(!provider.in_queue(&job, &queue).unwrap());

        provider.retry_failed(id).unwrap();
        assert_eq!(provider.pending_count(&queue).unwrap(), 1);

        provider.forget(id).unwrap();
        assert!(provider.get(id).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore]
    async fn timed_out_job_stays_live_and_reports_its_lease_expiry() {
        let provider = provider().await;
        let queue = unique_queue();
        let id = provider
            .push(Job::typed("test", serde_json::json!({})).on_queue(&queue))
            .unwrap();

        provider.pop(&queue, 1).unwrap();
        provider.mark_timed_out(id, "job timed out").unwrap();

        let record = provider.get(id).unwrap().unwrap();
        assert!(record.lease.timed_out);
        assert!(!record.is_exhausted());
        assert_eq!(provider.next_available_at(&queue).unwrap(), record.lease.locked_until);

        provider.forget(id).unwrap();
        assert_eq!(provider.next_available_at(&queue).unwrap(), None);
    }
}
