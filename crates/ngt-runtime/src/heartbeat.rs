use std::future::Future;
use std::time::Duration;

use ngt_schemas::{WorkerKind, WorkerState};
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;

/// Longest gap between `running` reports while a pass is in progress; well
/// inside the green liveness window.
pub const PASS_HEARTBEAT_MAX: Duration = Duration::from_secs(5);

/// Writes this process's row in `worker_heartbeats`. Failures are logged and
/// never stop the worker.
#[derive(Clone, Debug)]
pub struct HeartbeatReporter {
    pool: PgPool,
    kind: WorkerKind,
}

impl HeartbeatReporter {
    pub fn new(pool: PgPool, kind: WorkerKind) -> Self {
        Self { pool, kind }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub async fn report(&self, state: WorkerState, details: impl AsRef<str>) {
        let details = details.as_ref();
        if let Err(err) =
            ngt_db::heartbeat_upsert(&self.pool, self.kind, state, Some(details)).await
        {
            tracing::warn!(
                worker = self.kind.as_str(),
                state = state.as_str(),
                error = %format!("{err:#}"),
                "failed to persist worker heartbeat"
            );
        }
    }

    /// Drive `work` to completion, reporting `running` every `every` (capped
    /// at [`PASS_HEARTBEAT_MAX`]) until it finishes.
    pub async fn while_running<F: Future>(&self, every: Duration, details: &str, work: F) -> F::Output {
        tokio::pin!(work);
        let mut beat = tokio::time::interval(every.clamp(Duration::from_millis(1), PASS_HEARTBEAT_MAX));
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        beat.tick().await;

        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = beat.tick() => self.report(WorkerState::Running, details).await,
            }
        }
    }
}

/// Unique id used as `lease_owner`: kind, pid and a random suffix.
pub fn new_worker_id(kind: WorkerKind) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", kind.as_str(), std::process::id(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_are_unique_and_tagged() {
        let a = new_worker_id(WorkerKind::Orders);
        let b = new_worker_id(WorkerKind::Orders);
        assert_ne!(a, b);
        assert!(a.starts_with("orders-"));
        assert!(new_worker_id(WorkerKind::Jobs).starts_with("jobs-"));
    }

    #[tokio::test]
    async fn work_finishes_even_when_reports_fail() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(20))
            .connect_lazy("postgres://ngt@127.0.0.1:1/ngt")
            .unwrap();
        let reporter = HeartbeatReporter::new(pool, WorkerKind::Jobs);
        let out = reporter
            .while_running(Duration::from_millis(5), "busy", async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                7
            })
            .await;
        assert_eq!(out, 7);
    }
}
