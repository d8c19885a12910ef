//! ngt-db
//!
//! Durable store for the worker processes (Postgres via sqlx):
//! - `jobs`: lease-based job queue primitives
//! - `orders`: order persistence, claims, lease-fenced transitions, events
//! - `executions`: idempotent execution ingestion + correction resolver
//! - `heartbeat`: worker heartbeats and liveness
//!
//! Claims and lease renewals are single conditional statements. Every write a
//! worker makes under a lease is fenced on `lease_owner`; a fence miss is
//! reported as the typed [`LeaseLost`] error.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod executions;
pub mod heartbeat;
pub mod jobs;
pub mod orders;

pub use executions::{
    execution_ingest, trade_executions, trade_fetch, trade_list, IngestOutcome,
    TradeExecutionRow, TradeRow,
};
pub use heartbeat::{heartbeat_upsert, liveness_light, worker_statuses, LivenessLight, WorkerStatusRow};
pub use jobs::{
    job_archive, job_claim_next, job_complete, job_enqueue, job_enqueue_if_idle, job_fail,
    job_fail_terminal, job_fetch, job_heartbeat, job_list, job_rerun, JobFailOutcome, JobFilter,
    JobRow, NewJob,
};
pub use orders::{
    order_append_note, order_apply, order_claim_for_submit, order_claim_for_tracking,
    order_enqueue, order_events, order_fetch, order_fetch_by_ref, order_heartbeat, order_list,
    new_order_ref,
    order_mark_cancel_sent, order_record_retry, order_record_venue_ids, order_release,
    order_request_cancel, order_resolve, orders_mark_stale_reconcile_required,
    orders_non_terminal, Actor, CancelOutcome, ClaimedOrder, EnqueueOutcome, NewOrder,
    OrderEventRow, OrderFilter, OrderRow, Resolution,
};

pub const ENV_DB_URL: &str = "NGT_DATABASE_URL";

/// Connect to Postgres using NGT_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url, 10).await
}

pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    /// Core tables present (`jobs`, `orders`, `trade_executions`, `worker_heartbeats`).
    pub has_schema: bool,
}

/// Connectivity + schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (tables,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from information_schema.tables
        where table_schema = 'public'
          and table_name in ('jobs', 'orders', 'trade_executions', 'worker_heartbeats')
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_schema: tables == 4,
    })
}

// ---------------------------------------------------------------------------
// LeaseLost
// ---------------------------------------------------------------------------

/// A lease-fenced write found the row no longer owned by the caller.
///
/// Workers treat this as a crash of the unit of work: stop writing, do not
/// retry in-process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseLost {
    /// `"job"` or `"order"`.
    pub entity: &'static str,
    pub id: i64,
    pub worker_id: String,
}

impl std::fmt::Display for LeaseLost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lease lost: {} {} is no longer held by worker {}",
            self.entity, self.id, self.worker_id
        )
    }
}

impl std::error::Error for LeaseLost {}

/// True when `err` (or anything it wraps) is a [`LeaseLost`].
pub fn is_lease_lost(err: &anyhow::Error) -> bool {
    err.downcast_ref::<LeaseLost>().is_some()
}

/// Detect a Postgres unique constraint violation by name.
pub(crate) fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

pub(crate) fn secs(d: std::time::Duration) -> f64 {
    d.as_secs_f64()
}
