//! Worker heartbeats: one row per worker kind, upserted on a timer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ngt_schemas::{WorkerKind, WorkerState};
use sqlx::PgPool;

/// Heartbeat age (seconds) up to which a running worker is green.
pub const GREEN_MAX_AGE_SECS: f64 = 12.0;
/// Heartbeat age (seconds) up to which a running worker is yellow.
pub const YELLOW_MAX_AGE_SECS: f64 = 30.0;

pub async fn heartbeat_upsert(
    pool: &PgPool,
    kind: WorkerKind,
    state: WorkerState,
    details: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into worker_heartbeats (worker_kind, status, details, heartbeat_at, updated_at)
        values ($1, $2, $3, now(), now())
        on conflict (worker_kind) do update
          set status = excluded.status,
              details = excluded.details,
              heartbeat_at = excluded.heartbeat_at,
              updated_at = excluded.updated_at
        "#,
    )
    .bind(kind.as_str())
    .bind(state.as_str())
    .bind(details)
    .execute(pool)
    .await
    .with_context(|| format!("heartbeat_upsert failed for {}", kind.as_str()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessLight {
    Green,
    Yellow,
    Red,
}

impl LivenessLight {
    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessLight::Green => "green",
            LivenessLight::Yellow => "yellow",
            LivenessLight::Red => "red",
        }
    }
}

/// Traffic light for one worker. Anything not `running`, or never seen, is red.
pub fn liveness_light(status: Option<&str>, age_secs: Option<f64>) -> LivenessLight {
    match (status, age_secs) {
        (Some("running"), Some(age)) if age <= GREEN_MAX_AGE_SECS => LivenessLight::Green,
        (Some("running"), Some(age)) if age <= YELLOW_MAX_AGE_SECS => LivenessLight::Yellow,
        _ => LivenessLight::Red,
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStatusRow {
    pub kind: WorkerKind,
    pub status: Option<String>,
    pub details: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Measured against the database clock.
    pub age_secs: Option<f64>,
    pub light: LivenessLight,
}

/// One row per known worker kind, including kinds that never reported.
pub async fn worker_statuses(pool: &PgPool) -> Result<Vec<WorkerStatusRow>> {
    let mut out = Vec::with_capacity(WorkerKind::ALL.len());
    for kind in WorkerKind::ALL {
        let row: Option<(String, Option<String>, DateTime<Utc>, f64)> = sqlx::query_as(
            r#"
            select status, details, heartbeat_at,
                   extract(epoch from (now() - heartbeat_at))::float8
            from worker_heartbeats
            where worker_kind = $1
            "#,
        )
        .bind(kind.as_str())
        .fetch_optional(pool)
        .await
        .context("worker_statuses query failed")?;

        out.push(match row {
            Some((status, details, heartbeat_at, age)) => WorkerStatusRow {
                kind,
                light: liveness_light(Some(&status), Some(age)),
                status: Some(status),
                details,
                heartbeat_at: Some(heartbeat_at),
                age_secs: Some(age),
            },
            None => WorkerStatusRow {
                kind,
                status: None,
                details: None,
                heartbeat_at: None,
                age_secs: None,
                light: LivenessLight::Red,
            },
        });
    }
    Ok(out)
}
