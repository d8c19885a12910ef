//! Job queue primitives.
//!
//! `attempts` counts claims: it is incremented when a worker takes the job,
//! so a job that fails twice and then succeeds ends with `attempts = 3`.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use ngt_schemas::JobStatus;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::{secs, LeaseLost};

const JOB_COLUMNS: &str = r#"
    id, job_type, payload, status, attempts, max_attempts, source, request_text,
    available_at, lease_owner, lease_expires_at, heartbeat_at, result, last_error,
    created_at, updated_at, started_at, completed_at, archived_at
"#;

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub max_attempts: i32,
    pub source: Option<String>,
    pub request_text: Option<String>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: Value, max_attempts: i32) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts,
            source: None,
            request_text: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub source: Option<String>,
    pub request_text: Option<String>,
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

fn job_from_row(row: &PgRow) -> Result<JobRow> {
    let status: String = row.try_get("status")?;
    Ok(JobRow {
        id: row.try_get("id")?,
        job_type: row.try_get("job_type")?,
        payload: row.try_get("payload")?,
        status: JobStatus::parse(&status).ok_or_else(|| anyhow!("invalid job status: {status}"))?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        source: row.try_get("source")?,
        request_text: row.try_get("request_text")?,
        available_at: row.try_get("available_at")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        result: row.try_get("result")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        archived_at: row.try_get("archived_at")?,
    })
}

fn lease_lost(job_id: i64, worker_id: &str) -> anyhow::Error {
    LeaseLost {
        entity: "job",
        id: job_id,
        worker_id: worker_id.to_string(),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

pub async fn job_enqueue(pool: &PgPool, job: &NewJob) -> Result<i64> {
    if job.job_type.trim().is_empty() {
        bail!("job_type must not be empty");
    }
    if job.max_attempts < 1 {
        bail!("max_attempts must be >= 1 (got {})", job.max_attempts);
    }

    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into jobs (job_type, payload, max_attempts, source, request_text)
        values ($1, $2, $3, $4, $5)
        returning id
        "#,
    )
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(job.max_attempts)
    .bind(&job.source)
    .bind(&job.request_text)
    .fetch_one(pool)
    .await
    .context("job_enqueue failed")?;

    Ok(id)
}

/// Enqueue only when no non-archived `queued|running` job of this type exists.
///
/// Serialized per job type with a transaction-scoped advisory lock so two
/// concurrent callers cannot both see "idle".
pub async fn job_enqueue_if_idle(pool: &PgPool, job: &NewJob) -> Result<Option<i64>> {
    let mut tx = pool.begin().await.context("job_enqueue_if_idle begin failed")?;

    sqlx::query("select pg_advisory_xact_lock(hashtext('jobs'), hashtext($1))")
        .bind(&job.job_type)
        .execute(&mut *tx)
        .await
        .context("job_enqueue_if_idle lock failed")?;

    let (busy,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from jobs
            where job_type = $1
              and archived_at is null
              and status in ('queued', 'running')
        )
        "#,
    )
    .bind(&job.job_type)
    .fetch_one(&mut *tx)
    .await
    .context("job_enqueue_if_idle check failed")?;

    if busy {
        tx.rollback().await.ok();
        return Ok(None);
    }

    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into jobs (job_type, payload, max_attempts, source, request_text)
        values ($1, $2, $3, $4, $5)
        returning id
        "#,
    )
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(job.max_attempts.max(1))
    .bind(&job.source)
    .bind(&job.request_text)
    .fetch_one(&mut *tx)
    .await
    .context("job_enqueue_if_idle insert failed")?;

    tx.commit().await.context("job_enqueue_if_idle commit failed")?;
    Ok(Some(id))
}

// ---------------------------------------------------------------------------
// Claim / lease
// ---------------------------------------------------------------------------

/// Claim the next runnable job for `worker_id`.
///
/// Runnable: `queued` with `available_at` passed, or `running` with an
/// expired lease and attempts left. Jobs whose lease expired on their final
/// attempt are finalized as `failed` first.
pub async fn job_claim_next(pool: &PgPool, worker_id: &str, lease: Duration) -> Result<Option<JobRow>> {
    let swept = sqlx::query(
        r#"
        update jobs
        set status = 'failed',
            last_error = case
                when last_error is null then 'lease expired on final attempt'
                else last_error || '; lease expired on final attempt'
            end,
            lease_owner = null,
            lease_expires_at = null,
            completed_at = now(),
            updated_at = now()
        where status = 'running'
          and archived_at is null
          and lease_expires_at <= now()
          and attempts >= max_attempts
        "#,
    )
    .execute(pool)
    .await
    .context("job_claim_next sweep failed")?
    .rows_affected();
    if swept > 0 {
        tracing::warn!(swept, "jobs failed after lease expired on final attempt");
    }

    let row = sqlx::query(
        r#"
        update jobs j
        set status = 'running',
            attempts = j.attempts + 1,
            lease_owner = $1,
            lease_expires_at = now() + make_interval(secs => $2),
            heartbeat_at = now(),
            started_at = now(),
            completed_at = null,
            updated_at = now()
        from (
            select id
            from jobs
            where archived_at is null
              and (
                (status = 'queued' and available_at <= now())
                or (status = 'running' and lease_expires_at <= now() and attempts < max_attempts)
              )
            order by available_at asc, id asc
            for update skip locked
            limit 1
        ) c
        where j.id = c.id
        returning j.*
        "#,
    )
    .bind(worker_id)
    .bind(secs(lease))
    .fetch_optional(pool)
    .await
    .context("job_claim_next claim failed")?;

    row.as_ref().map(job_from_row).transpose()
}

/// Extend the lease. Requires a non-expired lease owned by `worker_id`.
pub async fn job_heartbeat(pool: &PgPool, job_id: i64, worker_id: &str, lease: Duration) -> Result<()> {
    let res = sqlx::query(
        r#"
        update jobs
        set lease_expires_at = now() + make_interval(secs => $3),
            heartbeat_at = now(),
            updated_at = now()
        where id = $1
          and status = 'running'
          and lease_owner = $2
          and lease_expires_at > now()
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(secs(lease))
    .execute(pool)
    .await
    .context("job_heartbeat failed")?;

    if res.rows_affected() == 0 {
        return Err(lease_lost(job_id, worker_id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Finalize
// ---------------------------------------------------------------------------

pub async fn job_complete(pool: &PgPool, job_id: i64, worker_id: &str, result: &Value) -> Result<()> {
    let res = sqlx::query(
        r#"
        update jobs
        set status = 'completed',
            result = $3,
            lease_owner = null,
            lease_expires_at = null,
            completed_at = now(),
            updated_at = now()
        where id = $1
          and status = 'running'
          and lease_owner = $2
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(result)
    .execute(pool)
    .await
    .context("job_complete failed")?;

    if res.rows_affected() == 0 {
        return Err(lease_lost(job_id, worker_id));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailOutcome {
    /// Back to `queued`, runnable again at `available_at`.
    Retrying { available_at: DateTime<Utc> },
    /// Attempts exhausted (or terminal failure requested).
    Failed,
}

/// Record a failed attempt; retries while `attempts < max_attempts`.
pub async fn job_fail(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    error: &str,
    retry_delay: Duration,
) -> Result<JobFailOutcome> {
    let row = sqlx::query(
        r#"
        update jobs
        set status = case when attempts < max_attempts then 'queued' else 'failed' end,
            available_at = case
                when attempts < max_attempts then now() + make_interval(secs => $4)
                else available_at
            end,
            completed_at = case when attempts < max_attempts then null else now() end,
            last_error = $3,
            lease_owner = null,
            lease_expires_at = null,
            updated_at = now()
        where id = $1
          and status = 'running'
          and lease_owner = $2
        returning status, available_at
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(error)
    .bind(secs(retry_delay))
    .fetch_optional(pool)
    .await
    .context("job_fail failed")?;

    let Some(row) = row else {
        return Err(lease_lost(job_id, worker_id));
    };
    let status: String = row.try_get("status")?;
    if status == JobStatus::Queued.as_str() {
        Ok(JobFailOutcome::Retrying {
            available_at: row.try_get("available_at")?,
        })
    } else {
        Ok(JobFailOutcome::Failed)
    }
}

/// Fail without retry (unknown job type, invalid payload).
pub async fn job_fail_terminal(pool: &PgPool, job_id: i64, worker_id: &str, error: &str) -> Result<()> {
    let res = sqlx::query(
        r#"
        update jobs
        set status = 'failed',
            last_error = $3,
            lease_owner = null,
            lease_expires_at = null,
            completed_at = now(),
            updated_at = now()
        where id = $1
          and status = 'running'
          and lease_owner = $2
        "#,
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(error)
    .execute(pool)
    .await
    .context("job_fail_terminal failed")?;

    if res.rows_affected() == 0 {
        return Err(lease_lost(job_id, worker_id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

/// Soft-delete. Archived jobs are never claimed. Returns false when the job
/// does not exist or is already archived.
pub async fn job_archive(pool: &PgPool, job_id: i64) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update jobs
        set archived_at = now(), updated_at = now()
        where id = $1 and archived_at is null
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await
    .context("job_archive failed")?;
    Ok(res.rows_affected() == 1)
}

/// Failed jobs only: enqueue a fresh copy and archive the original.
pub async fn job_rerun(pool: &PgPool, job_id: i64) -> Result<i64> {
    let mut tx = pool.begin().await.context("job_rerun begin failed")?;

    let row = sqlx::query(
        r#"
        select job_type, payload, max_attempts, source, request_text, status, archived_at
        from jobs
        where id = $1
        for update
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await
    .context("job_rerun load failed")?
    .ok_or_else(|| anyhow!("job {job_id} not found"))?;

    let status: String = row.try_get("status")?;
    let archived_at: Option<DateTime<Utc>> = row.try_get("archived_at")?;
    if status != JobStatus::Failed.as_str() {
        bail!("job {job_id} is {status}; only failed jobs can be rerun");
    }
    if archived_at.is_some() {
        bail!("job {job_id} is archived");
    }

    let (new_id,): (i64,) = sqlx::query_as(
        r#"
        insert into jobs (job_type, payload, max_attempts, source, request_text)
        values ($1, $2, $3, $4, $5)
        returning id
        "#,
    )
    .bind(row.try_get::<String, _>("job_type")?)
    .bind(row.try_get::<Value, _>("payload")?)
    .bind(row.try_get::<i32, _>("max_attempts")?)
    .bind(row.try_get::<Option<String>, _>("source")?)
    .bind(row.try_get::<Option<String>, _>("request_text")?)
    .fetch_one(&mut *tx)
    .await
    .context("job_rerun insert failed")?;

    sqlx::query("update jobs set archived_at = now(), updated_at = now() where id = $1")
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .context("job_rerun archive failed")?;

    tx.commit().await.context("job_rerun commit failed")?;
    Ok(new_id)
}

// ---------------------------------------------------------------------------
// Read API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub include_archived: bool,
    /// Defaults to 100 when `None`.
    pub limit: Option<i64>,
}

/// Newest first.
pub async fn job_list(pool: &PgPool, filter: &JobFilter) -> Result<Vec<JobRow>> {
    let sql = format!(
        r#"
        select {JOB_COLUMNS}
        from jobs
        where ($1::text is null or status = $1)
          and ($2::text is null or job_type = $2)
          and ($3 or archived_at is null)
        order by id desc
        limit $4
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.job_type.as_deref())
        .bind(filter.include_archived)
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(pool)
        .await
        .context("job_list failed")?;

    rows.iter().map(job_from_row).collect()
}

pub async fn job_fetch(pool: &PgPool, job_id: i64) -> Result<Option<JobRow>> {
    let sql = format!("select {JOB_COLUMNS} from jobs where id = $1");
    let row = sqlx::query(&sql)
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .context("job_fetch failed")?;
    row.as_ref().map(job_from_row).transpose()
}
