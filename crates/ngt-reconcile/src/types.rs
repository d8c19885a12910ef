use ngt_schemas::{OrderStatus, RawExecution, Side, VenueOrder};
use serde::{Deserialize, Serialize};

/// A non-terminal local order as seen by the planner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalOrder {
    pub order_id: i64,
    pub order_ref: String,
    pub account: String,
    pub instrument: String,
    pub side: Side,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub status: OrderStatus,
    pub venue_order_id: Option<String>,
    pub venue_perm_id: Option<i64>,
}

/// What the venue reported at reconciliation time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VenueSnapshot {
    pub open_orders: Vec<VenueOrder>,
    pub executions: Vec<RawExecution>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    OrderRef,
    VenueOrderId,
    PermId,
}

impl MatchedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchedBy::OrderRef => "order_ref",
            MatchedBy::VenueOrderId => "venue_order_id",
            MatchedBy::PermId => "perm_id",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    OpenOrder,
    /// No open order; the view was rebuilt from canonical executions.
    Executions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Apply `view` to the order through the state machine.
    Apply {
        order_id: i64,
        view: VenueOrder,
        matched_by: MatchedBy,
        source: MatchSource,
    },
    /// Venue shows nothing for this order; it stays `reconcile_required`.
    Unmatched { order_id: i64 },
}

impl ReconcileAction {
    pub fn order_id(&self) -> i64 {
        match self {
            ReconcileAction::Apply { order_id, .. } | ReconcileAction::Unmatched { order_id } => {
                *order_id
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// One entry per `reconcile_required` order, sorted by `order_id`.
    pub actions: Vec<ReconcileAction>,
    /// Venue open orders no local order accounts for, sorted by venue id.
    pub unknown_venue_orders: Vec<VenueOrder>,
}

impl ReconcilePlan {
    pub fn applied(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, ReconcileAction::Apply { .. }))
            .count()
    }

    pub fn unmatched(&self) -> usize {
        self.actions.len() - self.applied()
    }
}
