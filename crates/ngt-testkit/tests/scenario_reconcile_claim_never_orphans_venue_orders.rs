use ngt_db::{Actor, CancelOutcome};
use ngt_execution::inputs_from_venue;
use ngt_runtime::PARTIAL_FILL_NOT_RESUBMITTED;
use ngt_schemas::{OrderStatus, VenueOrderStatus};
use ngt_testkit::{wait_for_crash_lease, Harness};

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn partially_filled_order_lost_by_venue_is_not_resubmitted() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let order = h.enqueue_buy(10, 3).await?;

    // The dead worker sees 3/10 filled before its lease runs out.
    let dead = "orders-dead-partial";
    h.submit_then_crash(dead).await?;
    h.venue.fill(&order.order_ref, 3, 100_000_000).expect("venue order is live");
    let view = h.venue.order(&order.order_ref).expect("venue order");
    let row = h.order(order.id).await?;
    for input in inputs_from_venue(&row.machine(), &view) {
        ngt_db::order_apply(&h.pool, order.id, Actor::Worker(dead), &input, None).await?;
    }
    assert_eq!(h.order(order.id).await?.status, OrderStatus::PartiallyFilled);

    assert!(h.venue.forget(&order.order_ref));
    wait_for_crash_lease().await;

    let pass = h.order_manager("orders-live-partial").run_pass().await?;
    assert_eq!(pass.stale_marked, 1);

    let row = h.order(order.id).await?;
    assert_eq!(row.status, OrderStatus::Failed);
    assert_eq!(row.last_error.as_deref(), Some(PARTIAL_FILL_NOT_RESUBMITTED));
    assert_eq!(row.filled_quantity, 3);
    assert_eq!(row.retry_count, 0);
    assert_eq!(h.venue.submissions(&order.order_ref), 1, "no second venue order");
    assert!(h.venue.order(&order.order_ref).is_none());

    let events = h.event_types(order.id).await?;
    assert!(!events.contains(&"retry".to_string()), "{events:?}");
    Ok(())
}

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn cancel_requested_during_crash_reaches_the_venue() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let order = h.enqueue_buy(10, 1).await?;

    let (_, ids) = h.submit_then_crash("orders-dead-cancel").await?;
    assert_eq!(
        ngt_db::order_request_cancel(&h.pool, order.id).await?,
        CancelOutcome::Requested
    );
    wait_for_crash_lease().await;

    let pass = h.order_manager("orders-live-cancel").run_pass().await?;
    assert_eq!(pass.stale_marked, 1);

    assert_eq!(h.venue.cancels(&ids.venue_order_id), 1, "cancel sent exactly once");
    let venue_order = h.venue.order(&order.order_ref).expect("venue order");
    assert_eq!(venue_order.status, VenueOrderStatus::Cancelled);

    let row = h.order(order.id).await?;
    assert_eq!(row.status, OrderStatus::Cancelled);
    assert!(row.cancel_sent_at.is_some());
    assert_eq!(h.venue.submissions(&order.order_ref), 1);

    let events = h.event_types(order.id).await?;
    assert!(events.contains(&"cancel_sent".to_string()), "{events:?}");
    Ok(())
}

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn cancel_requested_and_venue_holds_nothing_cancels_locally() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let order = h.enqueue_buy(10, 1).await?;

    h.submit_then_crash("orders-dead-cancel-absent").await?;
    ngt_db::order_request_cancel(&h.pool, order.id).await?;
    assert!(h.venue.forget(&order.order_ref));
    wait_for_crash_lease().await;

    h.order_manager("orders-live-cancel-absent").run_pass().await?;

    let row = h.order(order.id).await?;
    assert_eq!(row.status, OrderStatus::Cancelled);
    assert_eq!(row.retry_count, 0);
    assert_eq!(h.venue.submissions(&order.order_ref), 1, "nothing resubmitted");
    Ok(())
}
