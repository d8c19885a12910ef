use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ngt_db::{JobFilter, JobRow, NewJob};
use ngt_runtime::{JobContext, JobHandler, JobOutcome, JobRegistry, JOB_EXECUTIONS_SYNC};
use ngt_schemas::JobStatus;
use ngt_testkit::Harness;
use serde_json::{json, Value};

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn sync_job_fails_twice_then_completes_on_third_attempt() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;

    // Something to ingest once the venue is back.
    let order = h.enqueue_buy(4, 1).await?;
    h.order_manager("orders-sync-1").run_pass().await?;
    h.venue.fill(&order.order_ref, 4, 50_000_000).expect("order is live");
    // Replace the job the pass scheduled with one whose attempts we control.
    let scheduled = JobFilter {
        job_type: Some(JOB_EXECUTIONS_SYNC.to_string()),
        ..JobFilter::default()
    };
    for j in ngt_db::job_list(&h.pool, &scheduled).await? {
        if !j.status.is_terminal() {
            ngt_db::job_archive(&h.pool, j.id).await?;
        }
    }

    let id = ngt_db::job_enqueue(&h.pool, &NewJob::new(JOB_EXECUTIONS_SYNC, json!({}), 3)).await?;
    let engine = h.job_engine("jobs-sync-1");

    h.venue.set_available(false);
    for _ in 0..2 {
        match engine.run_once().await? {
            Some(JobOutcome::Retrying { job_id, error }) => {
                assert_eq!(job_id, id);
                assert!(error.contains("venue unavailable"), "{error}");
            }
            other => panic!("expected a retry, got {other:?}"),
        }
    }
    let mid = ngt_db::job_fetch(&h.pool, id).await?.expect("job exists");
    assert_eq!(mid.status, JobStatus::Queued);
    assert!(mid.last_error.is_some());

    h.venue.set_available(true);
    match engine.run_once().await? {
        Some(JobOutcome::Completed { job_id, result }) => {
            assert_eq!(job_id, id);
            assert_eq!(result["ingested"], 1);
        }
        other => panic!("expected completion, got {other:?}"),
    }

    let done = ngt_db::job_fetch(&h.pool, id).await?.expect("job exists");
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 3);
    assert!(done.lease_owner.is_none());

    // Re-running the same sync is a no-op for the store.
    let again = ngt_db::job_enqueue(&h.pool, &NewJob::new(JOB_EXECUTIONS_SYNC, json!({}), 1)).await?;
    let trades_before = ngt_db::trade_list(&h.pool, Some(&order.account), None).await?;
    match engine.run_once().await? {
        Some(JobOutcome::Completed { job_id, result }) => {
            assert_eq!(job_id, again);
            assert_eq!(result["ingested"], 0);
            assert_eq!(result["duplicates"], 1);
        }
        other => panic!("expected completion, got {other:?}"),
    }
    let trades_after = ngt_db::trade_list(&h.pool, Some(&order.account), None).await?;
    assert_eq!(trades_before.len(), 1);
    assert_eq!(trades_after[0].total_quantity, trades_before[0].total_quantity);
    assert_eq!(trades_after[0].execution_count, trades_before[0].execution_count);
    Ok(())
}

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn unknown_job_type_fails_without_retry() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let id = ngt_db::job_enqueue(&h.pool, &NewJob::new("reports.nightly", json!({}), 5)).await?;

    let outcome = h.job_engine("jobs-unknown-1").run_once().await?;
    assert!(matches!(outcome, Some(JobOutcome::UnknownType { job_id, .. }) if job_id == id));

    let row = ngt_db::job_fetch(&h.pool, id).await?.expect("job exists");
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.attempts, 1);
    assert!(row.last_error.unwrap_or_default().contains("unknown job type"));
    Ok(())
}

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn invalid_payload_fails_permanently() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let id = ngt_db::job_enqueue(
        &h.pool,
        &NewJob::new(JOB_EXECUTIONS_SYNC, json!({"window_hours": "all"}), 3),
    )
    .await?;

    let outcome = h.job_engine("jobs-payload-1").run_once().await?;
    assert!(matches!(outcome, Some(JobOutcome::Failed { job_id, .. }) if job_id == id));
    let row = ngt_db::job_fetch(&h.pool, id).await?.expect("job exists");
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.attempts, 1);
    Ok(())
}

struct Slow(Duration);

#[async_trait]
impl JobHandler for Slow {
    async fn run(&self, _ctx: &JobContext, job: &JobRow) -> anyhow::Result<Value> {
        tokio::time::sleep(self.0).await;
        Ok(json!({"slept_ms": self.0.as_millis() as u64, "job": job.id}))
    }
}

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn lease_keeper_holds_the_job_past_its_lease() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let job_type = format!("test.slow.{}", uuid::Uuid::new_v4().simple());
    let id = ngt_db::job_enqueue(&h.pool, &NewJob::new(job_type.as_str(), json!({}), 3)).await?;

    let mut registry = JobRegistry::new();
    // Lease is 2s with a 1s heartbeat; the handler outlives the first lease.
    registry.register(job_type.as_str(), Arc::new(Slow(Duration::from_millis(3500))));
    let a = h.job_engine_with("jobs-keeper-a", registry.clone());
    let b = h.job_engine_with("jobs-keeper-b", registry);

    let steal = async {
        tokio::time::sleep(Duration::from_millis(2600)).await;
        b.run_once().await
    };
    let (held, stolen) = tokio::join!(a.run_once(), steal);

    assert!(matches!(held?, Some(JobOutcome::Completed { job_id, .. }) if job_id == id));
    assert!(stolen?.is_none(), "a renewed lease must not be reclaimed");

    let row = ngt_db::job_fetch(&h.pool, id).await?.expect("job exists");
    assert_eq!(row.status, JobStatus::Completed);
    assert_eq!(row.attempts, 1);
    Ok(())
}
