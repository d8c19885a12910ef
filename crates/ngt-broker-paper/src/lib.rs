//! Deterministic in-memory "paper" venue.
//!
//! Design decisions (kept simple/deterministic):
//! - Venue order ids count up from 1001; perm ids are the order id plus a
//!   fixed offset.
//! - A repeated `order_ref` for a live order returns the existing ids and is
//!   not a new submission.
//! - Fills are never generated on their own. Tests drive them with `fill`
//!   and `correct_execution`.
//! - Execution ids look like `{perm:08x}.{seq:08x}.01.{rev:02x}`, so the
//!   default suffix parser reads the trailing segment as the revision.
//! - The venue clock starts at a fixed instant and advances one second per
//!   recorded change. No randomness, no wall clock.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ngt_execution::{
    progress_from_executions, ExecIdParser, ExecutionFill, SubmitRequest, SuffixExecIdParser,
    VenueClient, VenueError,
};
use ngt_schemas::{RawExecution, Side, VenueOrder, VenueOrderIds, VenueOrderStatus};
use serde_json::json;

pub mod types;

pub use types::{SubmitFault, PAPER_EPOCH_SECS};
use types::{paper_epoch, FIRST_ORDER_ID, PERM_ID_OFFSET};

#[derive(Debug)]
struct State {
    clock: DateTime<Utc>,
    next_order_id: i64,
    next_exec_seq: i64,
    available: bool,
    hold_acks: bool,
    reject_next: Option<String>,
    fault_next: Option<SubmitFault>,
    /// Keyed by venue order id.
    orders: BTreeMap<String, VenueOrder>,
    /// order_ref -> venue order id of the latest order with that ref.
    by_ref: BTreeMap<String, String>,
    executions: Vec<RawExecution>,
    submissions: BTreeMap<String, usize>,
    cancels: BTreeMap<String, usize>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            clock: paper_epoch(),
            next_order_id: FIRST_ORDER_ID,
            next_exec_seq: 1,
            available: true,
            hold_acks: false,
            reject_next: None,
            fault_next: None,
            orders: BTreeMap::new(),
            by_ref: BTreeMap::new(),
            executions: Vec::new(),
            submissions: BTreeMap::new(),
            cancels: BTreeMap::new(),
        }
    }
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += Duration::seconds(1);
        self.clock
    }

    fn order_by_ref_mut(&mut self, order_ref: &str) -> Option<&mut VenueOrder> {
        let vid = self.by_ref.get(order_ref)?;
        self.orders.get_mut(vid)
    }

    fn accept(&mut self, req: &SubmitRequest, status: VenueOrderStatus, reason: Option<String>) -> VenueOrderIds {
        let n = self.next_order_id;
        self.next_order_id += 1;
        let at = self.tick();
        let ids = VenueOrderIds {
            venue_order_id: n.to_string(),
            perm_id: Some(n + PERM_ID_OFFSET),
        };
        self.orders.insert(
            ids.venue_order_id.clone(),
            VenueOrder {
                order_ref: Some(req.order_ref.clone()),
                venue_order_id: ids.venue_order_id.clone(),
                perm_id: ids.perm_id,
                account: req.account.clone(),
                instrument: req.instrument.clone(),
                side: req.side,
                quantity: req.quantity,
                filled_quantity: 0,
                avg_fill_price_micros: None,
                status,
                reason,
                updated_at: at,
            },
        );
        self.by_ref.insert(req.order_ref.clone(), ids.venue_order_id.clone());
        *self.submissions.entry(req.order_ref.clone()).or_default() += 1;
        ids
    }

    /// Rebuild an order's fill state from its canonical executions.
    fn refresh_fills(&mut self, venue_order_id: &str) {
        let parser = SuffixExecIdParser::default();
        let fills: Vec<ExecutionFill> = self
            .executions
            .iter()
            .filter(|e| e.venue_order_id.as_deref() == Some(venue_order_id))
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
        let last = progress_from_executions(&fills).pop();

        let Some(order) = self.orders.get_mut(venue_order_id) else {
            return;
        };
        match last {
            Some(p) => {
                order.filled_quantity = p.cumulative_quantity.min(order.quantity);
                order.avg_fill_price_micros = p.avg_price_micros;
                order.updated_at = p.at;
            }
            None => {
                order.filled_quantity = 0;
                order.avg_fill_price_micros = None;
            }
        }
        if order.filled_quantity >= order.quantity {
            order.status = VenueOrderStatus::Filled;
        } else if order.status == VenueOrderStatus::Filled {
            order.status = VenueOrderStatus::Submitted;
        }
    }
}

/// Shared-state paper venue. Cheap to wrap in `Arc` and hand to several
/// workers; scripting methods take `&self`.
#[derive(Debug, Default)]
pub struct PaperVenue {
    state: Mutex<State>,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), VenueError> {
        if self.state().available {
            Ok(())
        } else {
            Err(VenueError::Transient("paper venue offline".to_string()))
        }
    }

    // -----------------------------------------------------------------------
    // Scripting
    // -----------------------------------------------------------------------

    /// While offline every call fails with `VenueError::Transient`.
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    pub fn advance_clock(&self, by: Duration) {
        self.state().clock += by;
    }

    /// New orders stay `PendingSubmit` until [`PaperVenue::ack`].
    pub fn hold_acks(&self, hold: bool) {
        self.state().hold_acks = hold;
    }

    pub fn ack(&self, order_ref: &str) -> bool {
        let mut st = self.state();
        let at = st.tick();
        match st.order_by_ref_mut(order_ref) {
            Some(o) if o.status == VenueOrderStatus::PendingSubmit => {
                o.status = VenueOrderStatus::Submitted;
                o.updated_at = at;
                true
            }
            _ => false,
        }
    }

    /// The next submit is recorded as rejected with `reason`.
    pub fn reject_next_submit(&self, reason: impl Into<String>) {
        self.state().reject_next = Some(reason.into());
    }

    pub fn fail_next_submit(&self, fault: SubmitFault) {
        self.state().fault_next = Some(fault);
    }

    /// Report a fill of `quantity` at `price_micros` for the live order with
    /// this `order_ref`. Returns the execution id.
    pub fn fill(&self, order_ref: &str, quantity: i64, price_micros: i64) -> Option<String> {
        let mut st = self.state();
        let vid = st.by_ref.get(order_ref)?.clone();
        let order = st.orders.get(&vid)?.clone();
        if !order.status.is_live() || order.filled_quantity + quantity > order.quantity {
            return None;
        }

        let seq = st.next_exec_seq;
        st.next_exec_seq += 1;
        let at = st.tick();
        let exec_id = format!("{:08x}.{:08x}.01.01", order.perm_id.unwrap_or_default(), seq);
        st.executions.push(RawExecution {
            account: order.account.clone(),
            exec_id: exec_id.clone(),
            perm_id: order.perm_id,
            order_ref: order.order_ref.clone(),
            client_id: Some(0),
            venue_order_id: Some(vid.clone()),
            instrument: order.instrument.clone(),
            side: order.side,
            quantity,
            price_micros,
            executed_at: at,
            raw_payload: json!({"venue": "paper", "exec_id": exec_id}),
        });
        if let Some(o) = st.orders.get_mut(&vid) {
            if o.status == VenueOrderStatus::PendingSubmit {
                o.status = VenueOrderStatus::Submitted;
            }
        }
        st.refresh_fills(&vid);
        Some(exec_id)
    }

    /// Publish a corrected revision of an earlier execution. The new record
    /// keeps the original's base and time and bumps the revision suffix.
    pub fn correct_execution(&self, exec_id: &str, quantity: i64, price_micros: i64) -> Option<String> {
        let mut st = self.state();
        let parser = SuffixExecIdParser::default();
        let parts = parser.parse(exec_id);
        let latest = st
            .executions
            .iter()
            .filter(|e| parser.parse(&e.exec_id).base == parts.base)
            .max_by_key(|e| parser.parse(&e.exec_id).revision)?
            .clone();

        let revision = parser.parse(&latest.exec_id).revision + 1;
        let corrected_id = format!("{}.{:02x}", parts.base, revision);
        let vid = latest.venue_order_id.clone();
        st.executions.push(RawExecution {
            exec_id: corrected_id.clone(),
            quantity,
            price_micros,
            raw_payload: json!({"venue": "paper", "exec_id": corrected_id, "corrects": latest.exec_id}),
            ..latest
        });
        if let Some(vid) = vid {
            st.refresh_fills(&vid);
        }
        Some(corrected_id)
    }

    /// Drop every trace of the order with this `order_ref`, as if the venue
    /// never received it.
    pub fn forget(&self, order_ref: &str) -> bool {
        let mut st = self.state();
        let Some(vid) = st.by_ref.remove(order_ref) else {
            return false;
        };
        st.orders.remove(&vid);
        st.executions.retain(|e| e.venue_order_id.as_deref() != Some(vid.as_str()));
        true
    }

    /// The venue stops working the order (e.g. day order expired).
    pub fn expire(&self, order_ref: &str) -> bool {
        let mut st = self.state();
        let at = st.tick();
        match st.order_by_ref_mut(order_ref) {
            Some(o) if o.status.is_live() => {
                o.status = VenueOrderStatus::Inactive;
                o.reason = Some("expired".to_string());
                o.updated_at = at;
                true
            }
            _ => false,
        }
    }

    /// An open order placed outside this system (no `order_ref`).
    pub fn place_external(&self, account: &str, instrument: &str, side: Side, quantity: i64) -> VenueOrder {
        let mut st = self.state();
        let n = st.next_order_id;
        st.next_order_id += 1;
        let at = st.tick();
        let order = VenueOrder {
            order_ref: None,
            venue_order_id: n.to_string(),
            perm_id: Some(n + PERM_ID_OFFSET),
            account: account.to_string(),
            instrument: instrument.to_string(),
            side,
            quantity,
            filled_quantity: 0,
            avg_fill_price_micros: None,
            status: VenueOrderStatus::Submitted,
            reason: None,
            updated_at: at,
        };
        st.orders.insert(order.venue_order_id.clone(), order.clone());
        order
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Orders the venue actually accepted (or rejected) for this ref.
    pub fn submissions(&self, order_ref: &str) -> usize {
        self.state().submissions.get(order_ref).copied().unwrap_or(0)
    }

    pub fn total_submissions(&self) -> usize {
        self.state().submissions.values().sum()
    }

    pub fn cancels(&self, venue_order_id: &str) -> usize {
        self.state().cancels.get(venue_order_id).copied().unwrap_or(0)
    }

    pub fn order(&self, order_ref: &str) -> Option<VenueOrder> {
        let st = self.state();
        st.by_ref.get(order_ref).and_then(|vid| st.orders.get(vid)).cloned()
    }

    pub fn executions(&self) -> Vec<RawExecution> {
        self.state().executions.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state().clock
    }
}

#[async_trait]
impl VenueClient for PaperVenue {
    async fn submit(&self, req: &SubmitRequest) -> Result<VenueOrderIds, VenueError> {
        self.check_available()?;
        let mut st = self.state();

        if let Some(existing) = st.by_ref.get(&req.order_ref).and_then(|vid| st.orders.get(vid)) {
            if existing.status.is_live() {
                return Ok(VenueOrderIds {
                    venue_order_id: existing.venue_order_id.clone(),
                    perm_id: existing.perm_id,
                });
            }
            return Err(VenueError::Rejected(format!(
                "duplicate order_ref {} ({:?})",
                req.order_ref, existing.status
            )));
        }

        if req.quantity <= 0 {
            return Err(VenueError::Rejected(format!("invalid quantity {}", req.quantity)));
        }

        match st.fault_next.take() {
            Some(SubmitFault::BeforeAccept) => {
                return Err(VenueError::Transient("connection refused".to_string()));
            }
            Some(SubmitFault::AfterAccept) => {
                let status = if st.hold_acks {
                    VenueOrderStatus::PendingSubmit
                } else {
                    VenueOrderStatus::Submitted
                };
                let ids = st.accept(req, status, None);
                tracing::debug!(order_ref = %req.order_ref, venue_order_id = %ids.venue_order_id, "paper submit accepted, reply dropped");
                return Err(VenueError::Transient("connection reset after send".to_string()));
            }
            None => {}
        }

        if let Some(reason) = st.reject_next.take() {
            st.accept(req, VenueOrderStatus::Rejected, Some(reason.clone()));
            return Err(VenueError::Rejected(reason));
        }

        let status = if st.hold_acks {
            VenueOrderStatus::PendingSubmit
        } else {
            VenueOrderStatus::Submitted
        };
        Ok(st.accept(req, status, None))
    }

    async fn cancel(&self, venue_order_id: &str) -> Result<(), VenueError> {
        self.check_available()?;
        let mut st = self.state();
        *st.cancels.entry(venue_order_id.to_string()).or_default() += 1;
        let at = st.tick();
        let order = st
            .orders
            .get_mut(venue_order_id)
            .ok_or_else(|| VenueError::Rejected(format!("unknown order {venue_order_id}")))?;
        if order.status.is_live() {
            order.status = VenueOrderStatus::Cancelled;
            order.reason = Some("cancelled by client".to_string());
            order.updated_at = at;
        }
        Ok(())
    }

    async fn lookup_order(&self, order_ref: &str) -> Result<Option<VenueOrder>, VenueError> {
        self.check_available()?;
        Ok(self.order(order_ref))
    }

    async fn list_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError> {
        self.check_available()?;
        let st = self.state();
        Ok(st.orders.values().filter(|o| o.status.is_live()).cloned().collect())
    }

    async fn list_recent_executions(&self, window: Duration) -> Result<Vec<RawExecution>, VenueError> {
        self.check_available()?;
        let st = self.state();
        let since = st.clock.checked_sub_signed(window);
        Ok(st
            .executions
            .iter()
            .filter(|e| since.map_or(true, |since| e.executed_at >= since))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(order_ref: &str, qty: i64) -> SubmitRequest {
        SubmitRequest {
            order_ref: order_ref.to_string(),
            account: "DU100".to_string(),
            instrument: "AAPL".to_string(),
            sec_type: "STK".to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            side: Side::Buy,
            quantity: qty,
            order_type: "MKT".to_string(),
            tif: "DAY".to_string(),
        }
    }

    #[tokio::test]
    async fn resubmitting_a_live_ref_returns_the_same_order() {
        let v = PaperVenue::new();
        let a = v.submit(&req("r1", 10)).await.unwrap();
        let b = v.submit(&req("r1", 10)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.venue_order_id, "1001");
        assert_eq!(v.submissions("r1"), 1);
        assert_eq!(v.list_open_orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fills_accumulate_until_filled() {
        let v = PaperVenue::new();
        v.submit(&req("r1", 10)).await.unwrap();
        v.fill("r1", 3, 100_000_000).unwrap();
        let o = v.lookup_order("r1").await.unwrap().unwrap();
        assert_eq!((o.filled_quantity, o.status), (3, VenueOrderStatus::Submitted));

        v.fill("r1", 7, 110_000_000).unwrap();
        let o = v.lookup_order("r1").await.unwrap().unwrap();
        assert_eq!((o.filled_quantity, o.status), (10, VenueOrderStatus::Filled));
        assert_eq!(o.avg_fill_price_micros, Some(107_000_000));
        assert!(v.fill("r1", 1, 1).is_none(), "no fills past quantity");
        assert!(v.list_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrections_replace_the_original_quantity() {
        let v = PaperVenue::new();
        v.submit(&req("r1", 10)).await.unwrap();
        let e1 = v.fill("r1", 10, 100_000_000).unwrap();
        assert!(e1.ends_with(".01"));

        let e2 = v.correct_execution(&e1, 6, 100_000_000).unwrap();
        assert!(e2.ends_with(".02"), "{e2}");
        assert_eq!(v.executions().len(), 2);

        let o = v.order("r1").unwrap();
        assert_eq!(o.filled_quantity, 6);
        assert_eq!(o.status, VenueOrderStatus::Submitted);
    }

    #[tokio::test]
    async fn fault_after_accept_leaves_a_live_order() {
        let v = PaperVenue::new();
        v.fail_next_submit(SubmitFault::AfterAccept);
        let err = v.submit(&req("r1", 5)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(v.lookup_order("r1").await.unwrap().is_some());

        v.fail_next_submit(SubmitFault::BeforeAccept);
        assert!(v.submit(&req("r2", 5)).await.unwrap_err().is_transient());
        assert!(v.lookup_order("r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejection_is_recorded_and_not_retryable() {
        let v = PaperVenue::new();
        v.reject_next_submit("insufficient margin");
        let err = v.submit(&req("r1", 5)).await.unwrap_err();
        assert_eq!(err, VenueError::Rejected("insufficient margin".to_string()));
        assert_eq!(v.order("r1").unwrap().status, VenueOrderStatus::Rejected);
        assert!(matches!(v.submit(&req("r1", 5)).await, Err(VenueError::Rejected(_))));
    }

    #[tokio::test]
    async fn offline_venue_fails_transiently() {
        let v = PaperVenue::new();
        v.set_available(false);
        assert!(v.list_open_orders().await.unwrap_err().is_transient());
        v.set_available(true);
        assert!(v.list_open_orders().await.is_ok());
    }

    #[tokio::test]
    async fn recent_executions_respect_the_window() {
        let v = PaperVenue::new();
        v.submit(&req("r1", 10)).await.unwrap();
        v.fill("r1", 1, 1_000_000).unwrap();
        v.advance_clock(Duration::minutes(5));
        v.fill("r1", 1, 1_000_000).unwrap();
        let all = v.list_recent_executions(Duration::hours(1)).await.unwrap();
        assert_eq!(all.len(), 2);
        let last = v.list_recent_executions(Duration::seconds(0)).await.unwrap();
        assert_eq!(last.len(), 1);
        let everything = v.list_recent_executions(Duration::MAX).await.unwrap();
        assert_eq!(everything.len(), 2);
    }
}
