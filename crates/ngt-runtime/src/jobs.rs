//! Job Queue Engine.
//!
//! Claims one job at a time, runs its handler while a lease keeper renews the
//! lease, then completes or fails it. A lost lease drops the handler future
//! and finalizes nothing; the job is picked up again once the lease expires.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ngt_config::{WorkerSettings, MAX_WINDOW_HOURS};
use ngt_db::{JobFailOutcome, JobRow};
use ngt_execution::VenueClient;
use ngt_schemas::{WorkerKind, WorkerState};
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;

use crate::heartbeat::{new_worker_id, HeartbeatReporter};
use crate::orders::reconcile_with_venue;
use crate::shutdown::Shutdown;

pub const JOB_EXECUTIONS_SYNC: &str = "executions.sync";
pub const JOB_ORDERS_RECONCILE: &str = "orders.reconcile";

/// Shared dependencies handed to every handler.
#[derive(Clone)]
pub struct JobContext {
    pub pool: PgPool,
    pub venue: Arc<dyn VenueClient>,
    pub settings: WorkerSettings,
}

/// A job handler. Side effects must be safe to repeat: a handler may run
/// again after a crash or a lost lease.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext, job: &JobRow) -> Result<Value>;
}

/// Handler error that must not be retried (bad payload and the like).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentJobError(pub String);

impl std::fmt::Display for PermanentJobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "permanent job error: {}", self.0)
    }
}

impl std::error::Error for PermanentJobError {}

/// Fixed mapping from job type to handler.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: BTreeMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `executions.sync` and `orders.reconcile`.
    pub fn with_builtin() -> Self {
        let mut r = Self::new();
        r.register(JOB_EXECUTIONS_SYNC, Arc::new(ExecutionsSync));
        r.register(JOB_ORDERS_RECONCILE, Arc::new(OrdersReconcile));
        r
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// How one claimed job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { job_id: i64, result: Value },
    Retrying { job_id: i64, error: String },
    Failed { job_id: i64, error: String },
    UnknownType { job_id: i64, job_type: String },
    LeaseLost { job_id: i64 },
}

impl JobOutcome {
    pub fn job_id(&self) -> i64 {
        match self {
            JobOutcome::Completed { job_id, .. }
            | JobOutcome::Retrying { job_id, .. }
            | JobOutcome::Failed { job_id, .. }
            | JobOutcome::UnknownType { job_id, .. }
            | JobOutcome::LeaseLost { job_id } => *job_id,
        }
    }
}

pub struct JobEngine {
    ctx: JobContext,
    registry: JobRegistry,
    worker_id: String,
    heartbeat: HeartbeatReporter,
}

impl JobEngine {
    pub fn new(ctx: JobContext, registry: JobRegistry) -> Self {
        Self {
            heartbeat: HeartbeatReporter::new(ctx.pool.clone(), WorkerKind::Jobs),
            worker_id: new_worker_id(WorkerKind::Jobs),
            ctx,
            registry,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and run at most one job.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        let settings = &self.ctx.settings.jobs;
        let Some(job) =
            ngt_db::job_claim_next(&self.ctx.pool, &self.worker_id, settings.lease()).await?
        else {
            return Ok(None);
        };
        tracing::info!(
            job_id = job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            worker = %self.worker_id,
            "job claimed"
        );

        let Some(handler) = self.registry.get(&job.job_type) else {
            let error = format!("unknown job type: {}", job.job_type);
            tracing::error!(job_id = job.id, job_type = %job.job_type, "no handler registered; failing without retry");
            let lost = self
                .finalize(&job, |pool, id, w| async move {
                    ngt_db::job_fail_terminal(&pool, id, &w, &error).await
                })
                .await?;
            return Ok(Some(lost.unwrap_or(JobOutcome::UnknownType {
                job_id: job.id,
                job_type: job.job_type.clone(),
            })));
        };

        let Some(res) = self.run_leased(handler.as_ref(), &job).await? else {
            tracing::warn!(job_id = job.id, worker = %self.worker_id, "lease lost; handler abandoned");
            return Ok(Some(JobOutcome::LeaseLost { job_id: job.id }));
        };

        let outcome = match res {
            Ok(result) => {
                let done = result.clone();
                let lost = self
                    .finalize(&job, |pool, id, w| async move {
                        ngt_db::job_complete(&pool, id, &w, &done).await
                    })
                    .await?;
                tracing::info!(job_id = job.id, job_type = %job.job_type, "job completed");
                lost.unwrap_or(JobOutcome::Completed {
                    job_id: job.id,
                    result,
                })
            }
            Err(err) => {
                let error = format!("{err:#}");
                if err.downcast_ref::<PermanentJobError>().is_some() {
                    tracing::error!(job_id = job.id, error = %error, "job failed permanently");
                    let msg = error.clone();
                    let lost = self
                        .finalize(&job, |pool, id, w| async move {
                            ngt_db::job_fail_terminal(&pool, id, &w, &msg).await
                        })
                        .await?;
                    lost.unwrap_or(JobOutcome::Failed {
                        job_id: job.id,
                        error,
                    })
                } else {
                    self.record_failure(&job, error).await?
                }
            }
        };
        Ok(Some(outcome))
    }

    async fn record_failure(&self, job: &JobRow, error: String) -> Result<JobOutcome> {
        let retry_delay = self.ctx.settings.jobs.retry_delay();
        match ngt_db::job_fail(&self.ctx.pool, job.id, &self.worker_id, &error, retry_delay).await
        {
            Ok(JobFailOutcome::Retrying { available_at }) => {
                tracing::warn!(
                    job_id = job.id,
                    attempt = job.attempts,
                    available_at = %available_at,
                    error = %error,
                    "job attempt failed; will retry"
                );
                Ok(JobOutcome::Retrying {
                    job_id: job.id,
                    error,
                })
            }
            Ok(JobFailOutcome::Failed) => {
                tracing::error!(
                    job_id = job.id,
                    attempts = job.attempts,
                    error = %error,
                    "job failed; attempts exhausted"
                );
                Ok(JobOutcome::Failed {
                    job_id: job.id,
                    error,
                })
            }
            Err(e) if ngt_db::is_lease_lost(&e) => Ok(JobOutcome::LeaseLost { job_id: job.id }),
            Err(e) => Err(e),
        }
    }

    /// Run a fenced finalizing write; `Some(LeaseLost)` when the fence fails.
    async fn finalize<F, Fut>(&self, job: &JobRow, write: F) -> Result<Option<JobOutcome>>
    where
        F: FnOnce(PgPool, i64, String) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        match write(self.ctx.pool.clone(), job.id, self.worker_id.clone()).await {
            Ok(()) => Ok(None),
            Err(e) if ngt_db::is_lease_lost(&e) => {
                tracing::warn!(job_id = job.id, worker = %self.worker_id, "lease lost before finalizing");
                Ok(Some(JobOutcome::LeaseLost { job_id: job.id }))
            }
            Err(e) => Err(e),
        }
    }

    /// Drive the handler while renewing the lease. `None` when the lease was
    /// lost; the handler future is dropped at that point.
    async fn run_leased(
        &self,
        handler: &dyn JobHandler,
        job: &JobRow,
    ) -> Result<Option<Result<Value>>> {
        let settings = &self.ctx.settings.jobs;
        let work = handler.run(&self.ctx, job);
        tokio::pin!(work);

        let mut beat = tokio::time::interval(settings.heartbeat());
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the claim already set the lease.
        beat.tick().await;

        loop {
            tokio::select! {
                res = &mut work => return Ok(Some(res)),
                _ = beat.tick() => {
                    match ngt_db::job_heartbeat(&self.ctx.pool, job.id, &self.worker_id, settings.lease()).await {
                        Ok(()) => tracing::debug!(job_id = job.id, "job lease renewed"),
                        Err(e) if ngt_db::is_lease_lost(&e) => return Ok(None),
                        Err(e) => {
                            tracing::warn!(job_id = job.id, error = %format!("{e:#}"), "job lease renewal failed");
                        }
                    }
                }
            }
        }
    }

    /// Drain claimable jobs. Returns how many were processed.
    pub async fn run_pass(&self, shutdown: &Shutdown) -> Result<usize> {
        let drain = async {
            let mut n = 0;
            while !shutdown.is_triggered() {
                match self.run_once().await? {
                    Some(_) => n += 1,
                    None => break,
                }
            }
            Ok::<_, anyhow::Error>(n)
        };
        self.heartbeat
            .while_running(self.ctx.settings.jobs.heartbeat(), "pass in progress", drain)
            .await
    }

    /// Run until shutdown (or one pass with `once`).
    pub async fn run(&self, mut shutdown: Shutdown, once: bool) -> Result<()> {
        self.heartbeat
            .report(
                WorkerState::Starting,
                format!(
                    "worker_id={} types={}",
                    self.worker_id,
                    self.registry.job_types().join(",")
                ),
            )
            .await;

        loop {
            match self.run_pass(&shutdown).await {
                Ok(n) => {
                    self.heartbeat
                        .report(WorkerState::Running, format!("processed={n}"))
                        .await;
                }
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "job pass failed");
                    self.heartbeat
                        .report(WorkerState::Error, format!("{err:#}"))
                        .await;
                }
            }

            if once || shutdown.sleep(self.ctx.settings.jobs.poll()).await {
                break;
            }
        }

        self.heartbeat.report(WorkerState::Stopped, "worker exiting").await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// `executions.sync`: pull recent executions from the venue and ingest each.
///
/// Payload: `{"window_hours": n}` (optional; defaults to
/// `executions.window_hours`).
pub struct ExecutionsSync;

fn window_from_payload(payload: &Value, default: chrono::Duration) -> Result<chrono::Duration> {
    match payload.get("window_hours") {
        None | Some(Value::Null) => Ok(default),
        Some(v) => match v.as_u64() {
            Some(h) if (1..=u64::from(MAX_WINDOW_HOURS)).contains(&h) => i64::try_from(h)
                .ok()
                .and_then(chrono::Duration::try_hours)
                .ok_or_else(|| PermanentJobError(format!("window_hours {h} out of range")).into()),
            _ => Err(PermanentJobError(format!(
                "window_hours must be an integer in 1..={MAX_WINDOW_HOURS}, got {v}"
            ))
            .into()),
        },
    }
}

#[async_trait]
impl JobHandler for ExecutionsSync {
    async fn run(&self, ctx: &JobContext, job: &JobRow) -> Result<Value> {
        let exec = &ctx.settings.executions;
        let window = window_from_payload(&job.payload, exec.window())?;
        let parser = exec.parser();

        let executions = ctx
            .venue
            .list_recent_executions(window)
            .await
            .context("executions.sync: list_recent_executions failed")?;

        let mut ingested = 0usize;
        let mut duplicates = 0usize;
        for raw in &executions {
            let out = ngt_db::execution_ingest(&ctx.pool, raw, &parser)
                .await
                .with_context(|| format!("ingest of exec_id {} failed", raw.exec_id))?;
            if out.duplicate {
                duplicates += 1;
            } else {
                ingested += 1;
            }
        }

        tracing::info!(
            job_id = job.id,
            fetched = executions.len(),
            ingested,
            duplicates,
            "executions synced"
        );
        Ok(json!({
            "window_hours": window.num_hours(),
            "fetched": executions.len(),
            "ingested": ingested,
            "duplicates": duplicates,
        }))
    }
}

/// `orders.reconcile`: reconcile orders not held by a live lease.
pub struct OrdersReconcile;

#[async_trait]
impl JobHandler for OrdersReconcile {
    async fn run(&self, ctx: &JobContext, _job: &JobRow) -> Result<Value> {
        let summary = reconcile_with_venue(&ctx.pool, ctx.venue.as_ref(), &ctx.settings).await?;
        serde_json::to_value(&summary).context("reconcile summary not serializable")
    }
}
