use ngt_broker_paper::SubmitFault;
use ngt_db::CancelOutcome;
use ngt_schemas::OrderStatus;
use ngt_testkit::Harness;

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn lost_submit_reply_is_reconciled_not_resubmitted() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let order = h.enqueue_buy(10, 1).await?;

    h.venue.fail_next_submit(SubmitFault::AfterAccept);
    let manager = h.order_manager("orders-fault-1");
    manager.run_pass().await?;

    // The reply was lost but the venue has the order: the same pass looked it up.
    let row = h.order(order.id).await?;
    assert_eq!(row.status, OrderStatus::Submitted);
    assert_eq!(row.retry_count, 0);
    assert_eq!(h.venue.submissions(&order.order_ref), 1);
    let vid = h.venue.order(&order.order_ref).map(|o| o.venue_order_id);
    assert_eq!(row.venue_order_id, vid);

    let events = h.event_types(order.id).await?;
    assert!(events.contains(&"reconcile_required".to_string()), "{events:?}");
    assert!(!events.contains(&"retry".to_string()), "{events:?}");

    h.venue.fill(&order.order_ref, 10, 20_000_000).expect("order is live");
    manager.run_pass().await?;
    assert_eq!(h.order(order.id).await?.status, OrderStatus::Filled);
    assert_eq!(h.venue.submissions(&order.order_ref), 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn refused_connection_consumes_one_retry_after_confirmed_absence() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let order = h.enqueue_buy(10, 1).await?;

    h.venue.fail_next_submit(SubmitFault::BeforeAccept);
    h.order_manager("orders-fault-2").run_pass().await?;

    let row = h.order(order.id).await?;
    assert_eq!(row.status, OrderStatus::Submitted);
    assert_eq!(row.retry_count, 1);
    assert_eq!(h.venue.submissions(&order.order_ref), 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn venue_rejection_is_terminal() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let order = h.enqueue_buy(10, 3).await?;

    h.venue.reject_next_submit("insufficient buying power");
    let manager = h.order_manager("orders-reject-1");
    manager.run_pass().await?;

    let row = h.order(order.id).await?;
    assert_eq!(row.status, OrderStatus::Rejected);
    assert_eq!(row.last_error.as_deref(), Some("insufficient buying power"));

    let pass = manager.run_pass().await?;
    assert_eq!(pass.processed(), 0);
    assert_eq!(h.venue.submissions(&order.order_ref), 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires NGT_DATABASE_URL; run: cargo test -p ngt-testkit -- --include-ignored"]
async fn cancel_of_live_order_is_sent_once_by_the_tracker() -> anyhow::Result<()> {
    let _g = ngt_testkit::serial();
    let h = Harness::start().await?;
    let order = h.enqueue_buy(10, 1).await?;
    let manager = h.order_manager("orders-cancel-1");

    // Submitted and released after the tracking budget.
    manager.run_pass().await?;
    h.venue.fill(&order.order_ref, 4, 30_000_000).expect("order is live");
    assert_eq!(ngt_db::order_request_cancel(&h.pool, order.id).await?, CancelOutcome::Requested);
    assert_eq!(
        ngt_db::order_request_cancel(&h.pool, order.id).await?,
        CancelOutcome::AlreadyRequested
    );

    let pass = manager.run_pass().await?;
    assert_eq!(pass.tracked, 1);

    let row = h.order(order.id).await?;
    assert_eq!(row.status, OrderStatus::Cancelled);
    assert_eq!(row.filled_quantity, 4);
    assert!(row.cancel_sent_at.is_some());
    let vid = row.venue_order_id.expect("venue id");
    assert_eq!(h.venue.cancels(&vid), 1);

    // A queued order is cancelled locally without touching the venue.
    let queued = h.enqueue_buy(1, 1).await?;
    assert_eq!(ngt_db::order_request_cancel(&h.pool, queued.id).await?, CancelOutcome::Cancelled);
    assert_eq!(h.order(queued.id).await?.status, OrderStatus::Cancelled);
    assert_eq!(h.venue.submissions(&queued.order_ref), 0);
    Ok(())
}
