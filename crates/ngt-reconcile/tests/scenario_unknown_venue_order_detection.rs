use chrono::{TimeZone, Utc};
use ngt_execution::SuffixExecIdParser;
use ngt_reconcile::*;
use ngt_schemas::{OrderStatus, Side, VenueOrder, VenueOrderStatus};

fn venue_order(order_ref: Option<&str>, venue_id: &str) -> VenueOrder {
    VenueOrder {
        order_ref: order_ref.map(String::from),
        venue_order_id: venue_id.into(),
        perm_id: None,
        account: "DU1".into(),
        instrument: "SPY".into(),
        side: Side::Sell,
        quantity: 1,
        filled_quantity: 0,
        avg_fill_price_micros: None,
        status: VenueOrderStatus::Submitted,
        reason: None,
        updated_at: Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap(),
    }
}

#[test]
fn scenario_venue_only_order_is_reported_not_applied() {
    let snap = VenueSnapshot {
        open_orders: vec![venue_order(Some("manual-1"), "77"), venue_order(None, "12")],
        executions: vec![],
    };

    let p = plan(&[], &snap, &SuffixExecIdParser::default());

    assert!(p.actions.is_empty());
    let ids: Vec<&str> = p
        .unknown_venue_orders
        .iter()
        .map(|v| v.venue_order_id.as_str())
        .collect();
    assert_eq!(ids, vec!["12", "77"]);
}

#[test]
fn scenario_crashed_submit_found_open_by_venue_id() {
    // Crash after the venue id was persisted, before acknowledgment.
    let local = LocalOrder {
        order_id: 42,
        order_ref: "X-1".into(),
        account: "DU1".into(),
        instrument: "SPY".into(),
        side: Side::Sell,
        quantity: 1,
        filled_quantity: 0,
        status: OrderStatus::ReconcileRequired,
        venue_order_id: Some("12".into()),
        venue_perm_id: None,
    };
    let snap = VenueSnapshot {
        open_orders: vec![venue_order(None, "12")],
        executions: vec![],
    };

    let p = plan(&[local], &snap, &SuffixExecIdParser::default());

    assert_eq!(p.applied(), 1);
    assert!(p.unknown_venue_orders.is_empty());
    match &p.actions[0] {
        ReconcileAction::Apply { matched_by, source, .. } => {
            assert_eq!(*matched_by, MatchedBy::VenueOrderId);
            assert_eq!(*source, MatchSource::OpenOrder);
        }
        other => panic!("unexpected {other:?}"),
    }
}
