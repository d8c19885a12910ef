//! Order lifecycle state machine.
//!
//! # Design
//!
//! [`OrderMachine`] mirrors the persisted columns of one `orders` row that
//! drive lifecycle decisions. Every input is applied via
//! [`OrderMachine::apply`], which enforces three invariants:
//!
//! 1. **Legal transitions only.** Illegal inputs return [`TransitionError`];
//!    the machine is left untouched.
//! 2. **Idempotent no-ops.** Duplicate acknowledgments, stale fills and fills
//!    that do not advance the cumulative quantity return `Ok(None)`.
//! 3. **Monotonic fills.** `filled_quantity` never decreases and never exceeds
//!    `quantity`.
//!
//! Each accepted input yields exactly one [`Transition`], which the store
//! persists together with exactly one `order_events` row.
//!
//! # State diagram (simplified)
//!
//! ```text
//!   Queued ──Claim──► Submitting ──Ack──► Submitted ──Fill──► PartiallyFilled ─┐
//!     ▲                   │                   │                    │  ▲        │
//!     │                   │ Reject            │ Fill(all)          │  └─Fill──┘
//!  Requeue                ▼                   ▼                    ▼
//!     │               Rejected (term.)     Filled (term.) ◄──Fill(rest)
//!     │
//!  ReconcileRequired ◄── RequireReconcile (any non-terminal)
//!     │  Claim ─► Submitting        Reconcile(venue view) ─► venue's state
//!
//!   Cancel / Fail: any non-terminal ─► Cancelled / Failed (term.)
//! ```

use chrono::{DateTime, Utc};
use ngt_schemas::{OrderStatus, VenueOrder, VenueOrderStatus};

use super::fills::FillProgress;

// ---------------------------------------------------------------------------
// OrderInput
// ---------------------------------------------------------------------------

/// Inputs that drive an [`OrderMachine`].
#[derive(Debug, Clone, PartialEq)]
pub enum OrderInput {
    /// A worker claimed the row for submission (`queued` / `reconcile_required`).
    Claim,
    /// The venue acknowledged the order (idempotent once live).
    Acknowledge,
    /// Cumulative fill progress reported by the venue.
    Fill(FillProgress),
    /// The venue refused the order. Never retried.
    Reject { reason: String },
    Cancel { reason: Option<String> },
    Fail { reason: String },
    /// Local state can no longer be trusted (ack timeout, transient submit
    /// error, expired lease).
    RequireReconcile { reason: String },
    /// Operator clearance back to `queued`.
    Requeue,
    /// Apply the venue's authoritative view to a `reconcile_required` order.
    Reconcile(VenueOrder),
}

impl OrderInput {
    fn name(&self) -> &'static str {
        match self {
            OrderInput::Claim => "claim",
            OrderInput::Acknowledge => "acknowledge",
            OrderInput::Fill(_) => "fill",
            OrderInput::Reject { .. } => "reject",
            OrderInput::Cancel { .. } => "cancel",
            OrderInput::Fail { .. } => "fail",
            OrderInput::RequireReconcile { .. } => "require_reconcile",
            OrderInput::Requeue => "requeue",
            OrderInput::Reconcile(_) => "reconcile",
        }
    }
}

// ---------------------------------------------------------------------------
// Transition / TransitionError
// ---------------------------------------------------------------------------

/// One accepted state change, persisted as one `order_events` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: OrderStatus,
    pub to: OrderStatus,
    /// `claimed`, `acknowledged`, `fill`, `rejected`, `cancelled`, `failed`,
    /// `reconcile_required`, `requeued`, `reconciled`.
    pub event_type: &'static str,
    /// Quantity newly filled by this transition (0 when none).
    pub fill_delta: i64,
    pub message: Option<String>,
}

/// Returned when an input cannot legally be applied in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: OrderStatus,
    pub input: &'static str,
    pub detail: Option<String>,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal order transition: {} + {}", self.from, self.input)?;
        if let Some(d) = &self.detail {
            write!(f, " ({d})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// OrderMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderMachine {
    pub status: OrderStatus,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub avg_fill_price_micros: Option<i64>,
    /// Venue time of the latest applied fill.
    pub last_fill_at: Option<DateTime<Utc>>,
}

impl OrderMachine {
    /// A freshly enqueued order.
    pub fn new(quantity: i64) -> Self {
        Self {
            status: OrderStatus::Queued,
            quantity,
            filled_quantity: 0,
            avg_fill_price_micros: None,
            last_fill_at: None,
        }
    }

    /// Apply one input.
    ///
    /// Returns `Ok(Some(_))` when state changed, `Ok(None)` for a no-op.
    ///
    /// # Errors
    /// [`TransitionError`] for inputs that are illegal in the current state
    /// (including a fill that would exceed the order quantity).
    pub fn apply(&mut self, input: &OrderInput) -> Result<Option<Transition>, TransitionError> {
        use OrderInput as I;
        use OrderStatus as S;

        let from = self.status;
        let illegal = |detail: Option<String>| TransitionError {
            from,
            input: input.name(),
            detail,
        };

        match (from, input) {
            (S::Queued | S::ReconcileRequired, I::Claim) => Ok(Some(self.go(S::Submitting, "claimed", 0, None))),

            (S::Submitting, I::Acknowledge) => Ok(Some(self.go(S::Submitted, "acknowledged", 0, None))),
            (S::Submitted | S::PartiallyFilled, I::Acknowledge) => Ok(None),

            (S::Submitting | S::Submitted | S::PartiallyFilled, I::Fill(p)) => {
                let Some(delta) = self.absorb_fill(p).map_err(|d| illegal(Some(d)))? else {
                    return Ok(None);
                };
                let to = if self.filled_quantity == self.quantity {
                    S::Filled
                } else {
                    S::PartiallyFilled
                };
                Ok(Some(self.go(to, "fill", delta, None)))
            }
            // Late duplicate after completion.
            (S::Filled, I::Fill(_)) => Ok(None),

            (S::Submitting | S::Submitted, I::Reject { reason }) => {
                Ok(Some(self.go(S::Rejected, "rejected", 0, Some(reason.clone()))))
            }

            (s, I::Cancel { reason }) if !s.is_terminal() => {
                Ok(Some(self.go(S::Cancelled, "cancelled", 0, reason.clone())))
            }

            (s, I::Fail { reason }) if !s.is_terminal() => {
                Ok(Some(self.go(S::Failed, "failed", 0, Some(reason.clone()))))
            }

            (S::ReconcileRequired, I::RequireReconcile { .. }) => Ok(None),
            (s, I::RequireReconcile { reason }) if !s.is_terminal() => Ok(Some(self.go(
                S::ReconcileRequired,
                "reconcile_required",
                0,
                Some(reason.clone()),
            ))),

            (S::ReconcileRequired, I::Requeue) => Ok(Some(self.go(S::Queued, "requeued", 0, None))),

            (S::ReconcileRequired, I::Reconcile(view)) => {
                let progress = FillProgress {
                    cumulative_quantity: view.filled_quantity,
                    avg_price_micros: view.avg_fill_price_micros,
                    at: view.updated_at,
                };
                let delta = self
                    .absorb_fill(&progress)
                    .map_err(|d| illegal(Some(d)))?
                    .unwrap_or(0);
                let to = self.status_for_view(view);
                let message = view
                    .reason
                    .clone()
                    .or_else(|| Some(format!("venue reports {:?}", view.status)));
                Ok(Some(self.go(to, "reconciled", delta, message)))
            }

            _ => Err(illegal(None)),
        }
    }

    fn go(
        &mut self,
        to: OrderStatus,
        event_type: &'static str,
        fill_delta: i64,
        message: Option<String>,
    ) -> Transition {
        let from = self.status;
        self.status = to;
        Transition {
            from,
            to,
            event_type,
            fill_delta,
            message,
        }
    }

    /// Folds a cumulative progress report into the fill columns.
    ///
    /// `Ok(None)`: stale or non-advancing. `Err`: overfill.
    fn absorb_fill(&mut self, p: &FillProgress) -> Result<Option<i64>, String> {
        if let Some(last) = self.last_fill_at {
            if p.at < last {
                return Ok(None);
            }
        }
        if p.cumulative_quantity <= self.filled_quantity {
            return Ok(None);
        }
        if p.cumulative_quantity > self.quantity {
            return Err(format!(
                "cumulative fill {} exceeds order quantity {}",
                p.cumulative_quantity, self.quantity
            ));
        }
        let delta = p.cumulative_quantity - self.filled_quantity;
        self.filled_quantity = p.cumulative_quantity;
        if p.avg_price_micros.is_some() {
            self.avg_fill_price_micros = p.avg_price_micros;
        }
        self.last_fill_at = Some(p.at);
        Ok(Some(delta))
    }

    fn status_for_view(&self, view: &VenueOrder) -> OrderStatus {
        match view.status {
            VenueOrderStatus::PendingSubmit | VenueOrderStatus::Submitted => {
                if self.filled_quantity > 0 {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::Submitted
                }
            }
            VenueOrderStatus::Filled => OrderStatus::Filled,
            VenueOrderStatus::Cancelled | VenueOrderStatus::Inactive => OrderStatus::Cancelled,
            VenueOrderStatus::Rejected if self.filled_quantity > 0 => OrderStatus::Cancelled,
            VenueOrderStatus::Rejected => OrderStatus::Rejected,
        }
    }
}

// ---------------------------------------------------------------------------
// Venue view → inputs (live tracking)
// ---------------------------------------------------------------------------

/// Translate a venue snapshot of a live order into the inputs that bring
/// `machine` up to date, in application order.
///
/// Used while tracking (`submitting|submitted|partially_filled`); each input
/// yields its own event so fills keep their individual `fill` rows.
pub fn inputs_from_venue(machine: &OrderMachine, view: &VenueOrder) -> Vec<OrderInput> {
    let mut out = Vec::new();
    if machine.status.is_terminal() {
        return out;
    }

    let refused = view.status == VenueOrderStatus::Rejected && view.filled_quantity == 0;
    if machine.status == OrderStatus::Submitting
        && view.status != VenueOrderStatus::PendingSubmit
        && !refused
    {
        out.push(OrderInput::Acknowledge);
    }

    if view.filled_quantity > machine.filled_quantity {
        out.push(OrderInput::Fill(FillProgress {
            cumulative_quantity: view.filled_quantity,
            avg_price_micros: view.avg_fill_price_micros,
            at: view.updated_at,
        }));
    }

    match view.status {
        VenueOrderStatus::Rejected if refused => out.push(OrderInput::Reject {
            reason: view
                .reason
                .clone()
                .unwrap_or_else(|| "rejected by venue".to_string()),
        }),
        VenueOrderStatus::Rejected | VenueOrderStatus::Cancelled | VenueOrderStatus::Inactive => {
            if view.filled_quantity < machine.quantity {
                out.push(OrderInput::Cancel {
                    reason: view.reason.clone(),
                })
            }
        }
        VenueOrderStatus::PendingSubmit | VenueOrderStatus::Submitted | VenueOrderStatus::Filled => {}
    }
    out
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ngt_schemas::Side;

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, sec).unwrap()
    }

    fn fill(cum: i64, sec: u32) -> OrderInput {
        OrderInput::Fill(FillProgress {
            cumulative_quantity: cum,
            avg_price_micros: Some(187_250_000),
            at: at(sec),
        })
    }

    fn submitted(qty: i64) -> OrderMachine {
        let mut m = OrderMachine::new(qty);
        m.apply(&OrderInput::Claim).unwrap();
        m.apply(&OrderInput::Acknowledge).unwrap();
        m
    }

    fn view(status: VenueOrderStatus, filled: i64) -> VenueOrder {
        VenueOrder {
            order_ref: Some("X-1".into()),
            venue_order_id: "101".into(),
            perm_id: Some(9001),
            account: "DU1".into(),
            instrument: "AAPL".into(),
            side: Side::Buy,
            quantity: 10,
            filled_quantity: filled,
            avg_fill_price_micros: (filled > 0).then_some(187_000_000),
            status,
            reason: None,
            updated_at: at(40),
        }
    }

    #[test]
    fn claim_ack_partial_then_full() {
        let mut m = submitted(10);
        assert_eq!(m.status, OrderStatus::Submitted);

        let t1 = m.apply(&fill(3, 1)).unwrap().unwrap();
        assert_eq!((t1.to, t1.fill_delta, t1.event_type), (OrderStatus::PartiallyFilled, 3, "fill"));

        let t2 = m.apply(&fill(10, 2)).unwrap().unwrap();
        assert_eq!((t2.from, t2.to, t2.fill_delta), (OrderStatus::PartiallyFilled, OrderStatus::Filled, 7));
        assert_eq!(m.filled_quantity, 10);
        assert!(m.status.is_terminal());
    }

    #[test]
    fn partially_filled_may_repeat() {
        let mut m = submitted(10);
        m.apply(&fill(2, 1)).unwrap();
        let t = m.apply(&fill(5, 2)).unwrap().unwrap();
        assert_eq!((t.from, t.to), (OrderStatus::PartiallyFilled, OrderStatus::PartiallyFilled));
    }

    #[test]
    fn duplicate_ack_is_noop() {
        let mut m = submitted(10);
        assert_eq!(m.apply(&OrderInput::Acknowledge).unwrap(), None);
    }

    #[test]
    fn stale_and_non_advancing_fills_are_ignored() {
        let mut m = submitted(10);
        m.apply(&fill(5, 10)).unwrap();
        // Older venue timestamp, even with higher quantity.
        assert_eq!(m.apply(&fill(8, 5)).unwrap(), None);
        // Same quantity replayed.
        assert_eq!(m.apply(&fill(5, 11)).unwrap(), None);
        // Lower quantity never decreases filled_quantity.
        assert_eq!(m.apply(&fill(4, 12)).unwrap(), None);
        assert_eq!(m.filled_quantity, 5);
        assert_eq!(m.last_fill_at, Some(at(10)));
    }

    #[test]
    fn overfill_is_illegal_and_leaves_state_untouched() {
        let mut m = submitted(10);
        let err = m.apply(&fill(11, 1)).unwrap_err();
        assert_eq!(err.from, OrderStatus::Submitted);
        assert_eq!(m.filled_quantity, 0);
        assert_eq!(m.status, OrderStatus::Submitted);
    }

    #[test]
    fn late_fill_on_filled_order_is_noop() {
        let mut m = submitted(10);
        m.apply(&fill(10, 1)).unwrap();
        assert_eq!(m.apply(&fill(10, 2)).unwrap(), None);
    }

    #[test]
    fn terminal_states_refuse_further_inputs() {
        let mut m = OrderMachine::new(10);
        m.apply(&OrderInput::Claim).unwrap();
        m.apply(&OrderInput::Reject { reason: "no permissions".into() }).unwrap();
        assert_eq!(m.status, OrderStatus::Rejected);

        for input in [
            OrderInput::Claim,
            OrderInput::Cancel { reason: None },
            OrderInput::RequireReconcile { reason: "x".into() },
            OrderInput::Fail { reason: "x".into() },
        ] {
            assert!(m.apply(&input).is_err(), "{input:?}");
        }
        assert_eq!(m.status, OrderStatus::Rejected);
    }

    #[test]
    fn reject_after_ack_only_from_submitting_or_submitted() {
        let mut m = submitted(10);
        m.apply(&fill(1, 1)).unwrap();
        let err = m.apply(&OrderInput::Reject { reason: "late".into() }).unwrap_err();
        assert_eq!(err.from, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn reconcile_required_is_reachable_from_every_non_terminal_state() {
        for st in OrderStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            let mut m = OrderMachine::new(10);
            m.status = st;
            let out = m
                .apply(&OrderInput::RequireReconcile { reason: "ack timeout".into() })
                .unwrap();
            if st == OrderStatus::ReconcileRequired {
                assert_eq!(out, None);
            } else {
                assert_eq!(out.unwrap().to, OrderStatus::ReconcileRequired);
            }
        }
    }

    #[test]
    fn requeue_and_reclaim_from_reconcile_required() {
        let mut m = OrderMachine::new(10);
        m.apply(&OrderInput::Claim).unwrap();
        m.apply(&OrderInput::RequireReconcile { reason: "crash".into() }).unwrap();

        let mut reclaim = m.clone();
        let t = reclaim.apply(&OrderInput::Claim).unwrap().unwrap();
        assert_eq!((t.from, t.to), (OrderStatus::ReconcileRequired, OrderStatus::Submitting));

        let t = m.apply(&OrderInput::Requeue).unwrap().unwrap();
        assert_eq!(t.to, OrderStatus::Queued);
        assert!(m.apply(&OrderInput::Requeue).is_err());
    }

    #[test]
    fn reconcile_applies_venue_view_with_single_event() {
        let mut m = submitted(10);
        m.apply(&OrderInput::RequireReconcile { reason: "lease expired".into() }).unwrap();

        let t = m
            .apply(&OrderInput::Reconcile(view(VenueOrderStatus::Submitted, 4)))
            .unwrap()
            .unwrap();
        assert_eq!(t.event_type, "reconciled");
        assert_eq!((t.to, t.fill_delta), (OrderStatus::PartiallyFilled, 4));
        assert_eq!(m.avg_fill_price_micros, Some(187_000_000));

        let mut done = submitted(10);
        done.apply(&OrderInput::RequireReconcile { reason: "r".into() }).unwrap();
        let t = done
            .apply(&OrderInput::Reconcile(view(VenueOrderStatus::Filled, 10)))
            .unwrap()
            .unwrap();
        assert_eq!((t.to, t.fill_delta), (OrderStatus::Filled, 10));
    }

    #[test]
    fn reconcile_with_partial_and_dead_venue_order_closes_as_cancelled() {
        let mut m = OrderMachine::new(10);
        m.status = OrderStatus::ReconcileRequired;
        let t = m
            .apply(&OrderInput::Reconcile(view(VenueOrderStatus::Inactive, 3)))
            .unwrap()
            .unwrap();
        assert_eq!(t.to, OrderStatus::Cancelled);
        assert_eq!(m.filled_quantity, 3);
    }

    #[test]
    fn inputs_from_venue_ack_then_fill() {
        let mut m = OrderMachine::new(10);
        m.apply(&OrderInput::Claim).unwrap();
        let inputs = inputs_from_venue(&m, &view(VenueOrderStatus::Filled, 10));
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0], OrderInput::Acknowledge);

        let mut events = Vec::new();
        for i in &inputs {
            events.extend(m.apply(i).unwrap());
        }
        let kinds: Vec<_> = events.iter().map(|t| t.event_type).collect();
        assert_eq!(kinds, vec!["acknowledged", "fill"]);
        assert_eq!(m.status, OrderStatus::Filled);
    }

    #[test]
    fn inputs_from_venue_pending_submit_is_silent() {
        let mut m = OrderMachine::new(10);
        m.apply(&OrderInput::Claim).unwrap();
        assert!(inputs_from_venue(&m, &view(VenueOrderStatus::PendingSubmit, 0)).is_empty());
    }

    #[test]
    fn inputs_from_venue_rejection_without_fills() {
        let mut m = OrderMachine::new(10);
        m.apply(&OrderInput::Claim).unwrap();
        let mut v = view(VenueOrderStatus::Rejected, 0);
        v.reason = Some("insufficient margin".into());
        let inputs = inputs_from_venue(&m, &v);
        assert_eq!(
            inputs,
            vec![OrderInput::Reject { reason: "insufficient margin".into() }]
        );
    }

    #[test]
    fn inputs_from_venue_cancel_after_partial() {
        let m = submitted(10);
        let inputs = inputs_from_venue(&m, &view(VenueOrderStatus::Cancelled, 6));
        assert!(matches!(inputs[0], OrderInput::Fill(_)));
        assert!(matches!(inputs[1], OrderInput::Cancel { .. }));
    }
}
