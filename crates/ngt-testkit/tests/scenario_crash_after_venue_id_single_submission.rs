use ngt_schemas::OrderStatus;
use ngt_testkit::{wait_for_crash_lease, Harness};

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn recovery_adopts_the_venue_order_instead_of_resubmitting() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let order = h.enqueue_buy(10, 1).await?;

    let (crashed, ids) = h.submit_then_crash("orders-dead-1").await?;
    assert_eq!(crashed.status, OrderStatus::Submitting);
    assert_eq!(crashed.venue_order_id.as_deref(), Some(ids.venue_order_id.as_str()));

    // The venue filled the order while no worker was watching.
    h.venue.fill(&order.order_ref, 10, 101_000_000).expect("venue order is live");
    wait_for_crash_lease().await;

    let pass = h.order_manager("orders-live-1").run_pass().await?;
    assert_eq!(pass.stale_marked, 1);

    let done = h.order(order.id).await?;
    assert_eq!(done.status, OrderStatus::Filled);
    assert_eq!(done.filled_quantity, 10);
    assert_eq!(done.avg_fill_price_micros, Some(101_000_000));
    assert_eq!(h.venue.submissions(&order.order_ref), 1, "exactly one venue submission");

    let events = h.event_types(order.id).await?;
    assert!(events.contains(&"lease_expired".to_string()), "{events:?}");
    assert!(!events.contains(&"retry".to_string()), "{events:?}");
    assert_eq!(events.iter().filter(|e| *e == "fill").count(), 1, "{events:?}");
    assert_eq!(events.last().map(String::as_str), Some("fill"));
    Ok(())
}

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn startup_reconciliation_restores_a_live_order() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let order = h.enqueue_buy(10, 1).await?;

    let (_, ids) = h.submit_then_crash("orders-dead-2").await?;
    wait_for_crash_lease().await;

    let manager = h.order_manager("orders-live-2");
    let summary = manager.startup_reconcile().await?;
    assert_eq!(summary.stale_marked, 1);
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.unmatched, 0);

    let row = h.order(order.id).await?;
    assert_eq!(row.status, OrderStatus::Submitted);
    assert_eq!(row.venue_order_id.as_deref(), Some(ids.venue_order_id.as_str()));
    assert!(row.lease_owner.is_none());

    // Reconciled orders are tracked like any other live order.
    h.venue.fill(&order.order_ref, 10, 99_500_000).expect("venue order is live");
    let pass = manager.run_pass().await?;
    assert_eq!(pass.tracked, 1);
    assert_eq!(h.order(order.id).await?.status, OrderStatus::Filled);
    assert_eq!(h.venue.submissions(&order.order_ref), 1);

    let events = h.event_types(order.id).await?;
    assert_eq!(
        events,
        vec![
            "enqueued",
            "claimed",
            "venue_ids_recorded",
            "lease_expired",
            "reconciled",
            "fill"
        ]
    );
    Ok(())
}
