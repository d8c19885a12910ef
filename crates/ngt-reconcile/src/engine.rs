use std::collections::BTreeSet;

use ngt_execution::{progress_from_executions, ExecIdParser, ExecutionFill};
use ngt_schemas::{OrderStatus, RawExecution, VenueOrder, VenueOrderStatus};

use crate::{LocalOrder, MatchSource, MatchedBy, ReconcileAction, ReconcilePlan, VenueSnapshot};

const CLOSED_FROM_EXECUTIONS: &str = "no open order at venue; closed from executions";

fn match_open_order<'a>(
    local: &LocalOrder,
    open: &'a [VenueOrder],
) -> Option<(&'a VenueOrder, MatchedBy)> {
    let same_account = |v: &&VenueOrder| v.account == local.account;

    if let Some(v) = open
        .iter()
        .filter(same_account)
        .find(|v| v.order_ref.as_deref() == Some(local.order_ref.as_str()))
    {
        return Some((v, MatchedBy::OrderRef));
    }
    if let Some(id) = local.venue_order_id.as_deref() {
        if let Some(v) = open.iter().filter(same_account).find(|v| v.venue_order_id == id) {
            return Some((v, MatchedBy::VenueOrderId));
        }
    }
    if let Some(perm) = local.venue_perm_id.filter(|p| *p != 0) {
        if let Some(v) = open.iter().filter(same_account).find(|v| v.perm_id == Some(perm)) {
            return Some((v, MatchedBy::PermId));
        }
    }
    None
}

fn select<'a>(
    execs: &[&'a RawExecution],
    pred: impl Fn(&RawExecution) -> bool,
) -> Vec<&'a RawExecution> {
    execs.iter().copied().filter(|e| pred(*e)).collect()
}

fn match_executions<'a>(
    local: &LocalOrder,
    execs: &'a [RawExecution],
) -> Option<(Vec<&'a RawExecution>, MatchedBy)> {
    let mine: Vec<&RawExecution> = execs.iter().filter(|e| e.account == local.account).collect();

    let by_ref = select(&mine, |e| e.order_ref.as_deref() == Some(local.order_ref.as_str()));
    if !by_ref.is_empty() {
        return Some((by_ref, MatchedBy::OrderRef));
    }
    if let Some(id) = local.venue_order_id.as_deref() {
        let by_id = select(&mine, |e| e.venue_order_id.as_deref() == Some(id));
        if !by_id.is_empty() {
            return Some((by_id, MatchedBy::VenueOrderId));
        }
    }
    if let Some(perm) = local.venue_perm_id.filter(|p| *p != 0) {
        let by_perm = select(&mine, |e| e.perm_id == Some(perm));
        if !by_perm.is_empty() {
            return Some((by_perm, MatchedBy::PermId));
        }
    }
    None
}

/// Rebuild a venue view for an order that is no longer open, from its
/// canonical executions.
fn view_from_executions(
    local: &LocalOrder,
    execs: &[&RawExecution],
    parser: &dyn ExecIdParser,
) -> Option<VenueOrder> {
    let fills: Vec<ExecutionFill> = execs
        .iter()
        .map(|e| {
            let parts = parser.parse(&e.exec_id);
            ExecutionFill {
                exec_id_base: parts.base,
                exec_revision: parts.revision,
                quantity: e.quantity,
                price_micros: e.price_micros,
                executed_at: e.executed_at,
            }
        })
        .collect();
    let last = progress_from_executions(&fills).pop()?;
    let filled = last.cumulative_quantity.min(local.quantity);

    let (status, reason) = if filled >= local.quantity {
        (VenueOrderStatus::Filled, None)
    } else {
        (VenueOrderStatus::Inactive, Some(CLOSED_FROM_EXECUTIONS.to_string()))
    };
    let first = execs.first()?;

    Some(VenueOrder {
        order_ref: Some(local.order_ref.clone()),
        venue_order_id: local
            .venue_order_id
            .clone()
            .or_else(|| execs.iter().find_map(|e| e.venue_order_id.clone()))
            .unwrap_or_default(),
        perm_id: local
            .venue_perm_id
            .or_else(|| execs.iter().find_map(|e| e.perm_id.filter(|p| *p != 0))),
        account: local.account.clone(),
        instrument: first.instrument.clone(),
        side: first.side,
        quantity: local.quantity,
        filled_quantity: filled,
        avg_fill_price_micros: last.avg_price_micros,
        status,
        reason,
        updated_at: last.at,
    })
}

/// Deterministic reconciliation plan:
/// - every `reconcile_required` order gets exactly one action
/// - matching prefers open orders, then executions; within each, by
///   `order_ref`, venue order id, perm id
/// - venue open orders matching no local non-terminal order are reported
pub fn plan(
    local: &[LocalOrder],
    snapshot: &VenueSnapshot,
    parser: &dyn ExecIdParser,
) -> ReconcilePlan {
    let mut actions = Vec::new();
    let mut claimed_venue_ids: BTreeSet<&str> = BTreeSet::new();

    for order in local {
        if let Some((v, _)) = match_open_order(order, &snapshot.open_orders) {
            claimed_venue_ids.insert(v.venue_order_id.as_str());
        }
        if order.status != OrderStatus::ReconcileRequired {
            continue;
        }

        let action = if let Some((v, by)) = match_open_order(order, &snapshot.open_orders) {
            ReconcileAction::Apply {
                order_id: order.order_id,
                view: v.clone(),
                matched_by: by,
                source: MatchSource::OpenOrder,
            }
        } else if let Some((view, by)) = match_executions(order, &snapshot.executions)
            .and_then(|(execs, by)| view_from_executions(order, &execs, parser).map(|v| (v, by)))
        {
            ReconcileAction::Apply {
                order_id: order.order_id,
                view,
                matched_by: by,
                source: MatchSource::Executions,
            }
        } else {
            ReconcileAction::Unmatched {
                order_id: order.order_id,
            }
        };
        actions.push(action);
    }

    let mut unknown_venue_orders: Vec<VenueOrder> = snapshot
        .open_orders
        .iter()
        .filter(|v| !claimed_venue_ids.contains(v.venue_order_id.as_str()))
        .cloned()
        .collect();

    // Stable ordering (deterministic output).
    actions.sort_by_key(ReconcileAction::order_id);
    unknown_venue_orders.sort_by(|a, b| a.venue_order_id.cmp(&b.venue_order_id));

    ReconcilePlan {
        actions,
        unknown_venue_orders,
    }
}
