//! Order Lifecycle Manager.
//!
//! One pass: mark expired in-flight leases `reconcile_required`, then claim
//! orders one at a time (submit claims first, then tracking claims) up to
//! `orders.batch_size`. Every write is lease-fenced; a `LeaseLost` ends work
//! on that order without further writes.
//!
//! Submit path:
//! 1. claimed from `reconcile_required`: look the order up at the venue by
//!    `order_ref`. Found: adopt the venue's view and track it (a pending
//!    cancel is sent from there). Confirmed absent: cancel if requested, fail
//!    if it has fills or no retries left, else retry. Venue error: back to
//!    `reconcile_required`.
//!    Claimed from `queued` with a cancel request: cancelled locally.
//! 2. submit tagged with `order_ref`; persist venue ids before anything else.
//! 3. track until terminal or the order timeout, then release the lease.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ngt_config::WorkerSettings;
use ngt_db::{Actor, ClaimedOrder, NewJob, OrderRow};
use ngt_execution::{
    inputs_from_venue, OrderInput, SubmitRequest, VenueClient, VenueError,
};
use ngt_reconcile::{LocalOrder, ReconcileAction, VenueSnapshot};
use ngt_schemas::{OrderStatus, VenueOrder, VenueOrderIds, WorkerKind, WorkerState};
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;

use crate::heartbeat::{new_worker_id, HeartbeatReporter};
use crate::jobs::JOB_EXECUTIONS_SYNC;
use crate::shutdown::Shutdown;

/// Venue polling cadence while tracking one order.
pub const TRACK_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub const RETRIES_EXHAUSTED: &str = "retries exhausted after venue confirmed no live order";

/// Orders with fills are never resubmitted; a new venue order would execute
/// the full quantity again.
pub const PARTIAL_FILL_NOT_RESUBMITTED: &str =
    "venue confirmed no live order after a partial fill; not resubmitted";

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub stale_marked: usize,
    pub executions_seen: usize,
    pub executions_ingested: usize,
    pub applied: usize,
    pub unmatched: usize,
    pub unknown_venue_orders: Vec<String>,
}

fn local_order(row: &OrderRow) -> LocalOrder {
    LocalOrder {
        order_id: row.id,
        order_ref: row.order_ref.clone(),
        account: row.account.clone(),
        instrument: row.instrument.clone(),
        side: row.side,
        quantity: row.quantity,
        filled_quantity: row.filled_quantity,
        status: row.status,
        venue_order_id: row.venue_order_id.clone(),
        venue_perm_id: row.venue_perm_id,
    }
}

/// Bring `reconcile_required` orders in line with the venue.
///
/// Marks expired in-flight leases first, ingests recent executions, then
/// applies the plan. Orders currently leased by a live worker are skipped.
pub async fn reconcile_with_venue(
    pool: &PgPool,
    venue: &dyn VenueClient,
    settings: &WorkerSettings,
) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary {
        stale_marked: ngt_db::orders_mark_stale_reconcile_required(pool).await?.len(),
        ..ReconcileSummary::default()
    };

    let open_orders = venue
        .list_open_orders()
        .await
        .context("reconcile: list_open_orders failed")?;
    let executions = venue
        .list_recent_executions(settings.executions.window())
        .await
        .context("reconcile: list_recent_executions failed")?;

    let parser = settings.executions.parser();
    summary.executions_seen = executions.len();
    for exec in &executions {
        let out = ngt_db::execution_ingest(pool, exec, &parser).await?;
        if !out.duplicate {
            summary.executions_ingested += 1;
        }
    }

    let local: Vec<LocalOrder> = ngt_db::orders_non_terminal(pool)
        .await?
        .iter()
        .map(local_order)
        .collect();
    let snapshot = VenueSnapshot {
        open_orders,
        executions,
    };
    let plan = ngt_reconcile::plan(&local, &snapshot, &parser);

    for action in &plan.actions {
        match action {
            ReconcileAction::Apply {
                order_id,
                view,
                matched_by,
                source,
            } => {
                let payload = json!({
                    "matched_by": matched_by.as_str(),
                    "source": source,
                    "view": view,
                });
                match ngt_db::order_apply(
                    pool,
                    *order_id,
                    Actor::Unleased,
                    &OrderInput::Reconcile(view.clone()),
                    Some(&payload),
                )
                .await
                {
                    Ok(t) => {
                        summary.applied += 1;
                        tracing::info!(
                            order_id,
                            matched_by = matched_by.as_str(),
                            to = t.as_ref().map(|t| t.to.as_str()).unwrap_or("unchanged"),
                            "order reconciled against venue"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(order_id, error = %format!("{err:#}"), "reconcile apply skipped");
                    }
                }
            }
            ReconcileAction::Unmatched { order_id } => {
                summary.unmatched += 1;
                ngt_db::order_append_note(
                    pool,
                    *order_id,
                    "reconcile_unmatched",
                    "no venue order or execution matched; awaiting venue lookup or operator",
                    None,
                )
                .await?;
            }
        }
    }

    for unknown in &plan.unknown_venue_orders {
        tracing::warn!(
            venue_order_id = %unknown.venue_order_id,
            perm_id = ?unknown.perm_id,
            account = %unknown.account,
            instrument = %unknown.instrument,
            "venue open order has no local counterpart"
        );
        summary.unknown_venue_orders.push(unknown.venue_order_id.clone());
    }

    Ok(summary)
}

// ---------------------------------------------------------------------------
// OrderManager
// ---------------------------------------------------------------------------

/// Venue request for a stored order, tagged with its `order_ref`.
pub fn submit_request(order: &OrderRow) -> SubmitRequest {
    SubmitRequest {
        order_ref: order.order_ref.clone(),
        account: order.account.clone(),
        instrument: order.instrument.clone(),
        sec_type: order.sec_type.clone(),
        exchange: order.exchange.clone(),
        currency: order.currency.clone(),
        side: order.side,
        quantity: order.quantity,
        order_type: order.order_type.clone(),
        tif: order.tif.clone(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub submitted: usize,
    pub tracked: usize,
    pub stale_marked: usize,
}

impl PassSummary {
    pub fn processed(&self) -> usize {
        self.submitted + self.tracked
    }
}

/// How work on one claimed order ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Done,
    LeaseLost,
}

pub struct OrderManager {
    pool: PgPool,
    venue: Arc<dyn VenueClient>,
    settings: WorkerSettings,
    worker_id: String,
    heartbeat: HeartbeatReporter,
    track_poll: Duration,
}

impl OrderManager {
    pub fn new(pool: PgPool, venue: Arc<dyn VenueClient>, settings: WorkerSettings) -> Self {
        Self {
            heartbeat: HeartbeatReporter::new(pool.clone(), WorkerKind::Orders),
            worker_id: new_worker_id(WorkerKind::Orders),
            pool,
            venue,
            settings,
            track_poll: TRACK_POLL_INTERVAL,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_track_poll(mut self, every: Duration) -> Self {
        self.track_poll = every;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn startup_reconcile(&self) -> Result<ReconcileSummary> {
        let summary = reconcile_with_venue(&self.pool, self.venue.as_ref(), &self.settings).await?;
        tracing::info!(
            worker = %self.worker_id,
            stale_marked = summary.stale_marked,
            executions_ingested = summary.executions_ingested,
            applied = summary.applied,
            unmatched = summary.unmatched,
            unknown = summary.unknown_venue_orders.len(),
            "startup reconciliation finished"
        );
        Ok(summary)
    }

    /// Run until shutdown (or one pass with `once`).
    pub async fn run(&self, mut shutdown: Shutdown, once: bool) -> Result<()> {
        self.heartbeat
            .report(WorkerState::Starting, format!("worker_id={}", self.worker_id))
            .await;

        if let Err(err) = self.startup_reconcile().await {
            tracing::warn!(error = %format!("{err:#}"), "startup reconciliation incomplete; reconcile_required orders will be looked up individually");
        }

        loop {
            let processed = match self.run_pass().await {
                Ok(pass) => {
                    self.heartbeat
                        .report(
                            WorkerState::Running,
                            format!(
                                "processed={} submitted={} tracked={}",
                                pass.processed(),
                                pass.submitted,
                                pass.tracked
                            ),
                        )
                        .await;
                    pass.processed()
                }
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "order pass failed");
                    self.heartbeat
                        .report(WorkerState::Error, format!("{err:#}"))
                        .await;
                    0
                }
            };

            if once || shutdown.is_triggered() {
                break;
            }
            if processed == 0 && shutdown.sleep(self.settings.orders.poll()).await {
                break;
            }
        }

        self.heartbeat.report(WorkerState::Stopped, "worker exiting").await;
        Ok(())
    }

    /// One bounded pass over claimable orders. The worker heartbeat stays
    /// fresh while orders are tracked.
    pub async fn run_pass(&self) -> Result<PassSummary> {
        self.heartbeat
            .while_running(self.settings.orders.heartbeat(), "pass in progress", self.pass())
            .await
    }

    async fn pass(&self) -> Result<PassSummary> {
        let mut pass = PassSummary {
            stale_marked: ngt_db::orders_mark_stale_reconcile_required(&self.pool).await?.len(),
            ..PassSummary::default()
        };
        let lease = self.settings.orders.lease();

        while pass.processed() < self.settings.orders.batch_size as usize {
            if let Some(claimed) =
                ngt_db::order_claim_for_submit(&self.pool, &self.worker_id, lease).await?
            {
                pass.submitted += 1;
                self.guard(claimed.order.id, self.process_submit(claimed).await)?;
                continue;
            }
            if let Some(claimed) =
                ngt_db::order_claim_for_tracking(&self.pool, &self.worker_id, lease).await?
            {
                pass.tracked += 1;
                let started = Instant::now();
                self.guard(claimed.order.id, self.track(&claimed.order, started).await)?;
                continue;
            }
            break;
        }

        if pass.processed() > 0 {
            let mut job = NewJob::new(
                JOB_EXECUTIONS_SYNC,
                json!({}),
                self.settings.jobs.default_max_attempts,
            );
            job.source = Some("worker:orders".to_string());
            job.request_text = Some("sync executions after order processing".to_string());
            if let Some(job_id) = ngt_db::job_enqueue_if_idle(&self.pool, &job).await? {
                tracing::debug!(job_id, "executions.sync scheduled");
            }
        }
        Ok(pass)
    }

    /// Per-order errors end that order's turn; they never stop the pass.
    fn guard(&self, order_id: i64, res: Result<Finish>) -> Result<()> {
        match res {
            Ok(Finish::Done) => {}
            Ok(Finish::LeaseLost) => {
                tracing::warn!(order_id, worker = %self.worker_id, "lease lost; stopped writing");
            }
            Err(err) if ngt_db::is_lease_lost(&err) => {
                tracing::warn!(order_id, worker = %self.worker_id, "lease lost; stopped writing");
            }
            Err(err) => {
                tracing::error!(order_id, error = %format!("{err:#}"), "order processing failed");
            }
        }
        Ok(())
    }

    async fn apply(&self, order_id: i64, input: OrderInput, payload: Option<&serde_json::Value>) -> Result<Finish> {
        match ngt_db::order_apply(&self.pool, order_id, Actor::Worker(&self.worker_id), &input, payload).await {
            Ok(_) => Ok(Finish::Done),
            Err(err) if ngt_db::is_lease_lost(&err) => Ok(Finish::LeaseLost),
            Err(err) => Err(err),
        }
    }

    async fn process_submit(&self, claimed: ClaimedOrder) -> Result<Finish> {
        let order = claimed.order;
        let started = Instant::now();
        tracing::info!(
            order_id = order.id,
            order_ref = %order.order_ref,
            from = claimed.claimed_from.as_str(),
            "order claimed for submit"
        );

        // Reconcile claims consult the venue before any local cancel.
        if claimed.claimed_from != OrderStatus::ReconcileRequired && order.cancel_requested {
            return self
                .apply(
                    order.id,
                    OrderInput::Cancel {
                        reason: Some("cancel requested before submission".to_string()),
                    },
                    None,
                )
                .await;
        }

        if claimed.claimed_from == OrderStatus::ReconcileRequired {
            match self.venue.lookup_order(&order.order_ref).await {
                Ok(Some(view)) => {
                    tracing::info!(order_id = order.id, venue_order_id = %view.venue_order_id, "venue holds the order; adopting its state");
                    if self.absorb_view(&order, &view).await? == Finish::LeaseLost {
                        return Ok(Finish::LeaseLost);
                    }
                    return self.track(&order, started).await;
                }
                Ok(None) => {
                    if order.cancel_requested {
                        return self
                            .apply(
                                order.id,
                                OrderInput::Cancel {
                                    reason: Some("cancel requested; venue holds no live order".to_string()),
                                },
                                None,
                            )
                            .await;
                    }
                    if order.filled_quantity > 0 {
                        tracing::warn!(
                            order_id = order.id,
                            filled = order.filled_quantity,
                            quantity = order.quantity,
                            "venue lost a partially filled order; failing for operator review"
                        );
                        return self
                            .apply(
                                order.id,
                                OrderInput::Fail {
                                    reason: PARTIAL_FILL_NOT_RESUBMITTED.to_string(),
                                },
                                None,
                            )
                            .await;
                    }
                    if !order.retries_left() {
                        return self
                            .apply(
                                order.id,
                                OrderInput::Fail {
                                    reason: RETRIES_EXHAUSTED.to_string(),
                                },
                                None,
                            )
                            .await;
                    }
                    let n = ngt_db::order_record_retry(&self.pool, order.id, &self.worker_id).await?;
                    tracing::info!(order_id = order.id, retry = n, "venue confirmed absence; resubmitting");
                }
                Err(err) => {
                    return self
                        .apply(
                            order.id,
                            OrderInput::RequireReconcile {
                                reason: format!("venue lookup failed: {err}"),
                            },
                            None,
                        )
                        .await;
                }
            }
        }

        let req = submit_request(&order);

        match self.venue.submit(&req).await {
            Ok(ids) => {
                ngt_db::order_record_venue_ids(&self.pool, order.id, &self.worker_id, &ids).await?;
                tracing::info!(
                    order_id = order.id,
                    order_ref = %order.order_ref,
                    venue_order_id = %ids.venue_order_id,
                    "order submitted"
                );
            }
            Err(VenueError::Rejected(reason)) => {
                tracing::warn!(order_id = order.id, reason = %reason, "venue rejected order");
                return self.apply(order.id, OrderInput::Reject { reason }, None).await;
            }
            Err(err @ VenueError::Transient(_)) => {
                tracing::warn!(order_id = order.id, error = %err, "submit outcome unknown");
                return self
                    .apply(
                        order.id,
                        OrderInput::RequireReconcile {
                            reason: format!("submit outcome unknown: {err}"),
                        },
                        None,
                    )
                    .await;
            }
        }

        self.track(&order, started).await
    }

    /// Apply whatever the venue view implies for the current row state.
    async fn absorb_view(&self, order: &OrderRow, view: &VenueOrder) -> Result<Finish> {
        let Some(current) = ngt_db::order_fetch(&self.pool, order.id).await? else {
            return Ok(Finish::Done);
        };
        if current.venue_order_id.as_deref() != Some(view.venue_order_id.as_str()) {
            let ids = VenueOrderIds {
                venue_order_id: view.venue_order_id.clone(),
                perm_id: view.perm_id,
            };
            match ngt_db::order_record_venue_ids(&self.pool, order.id, &self.worker_id, &ids).await {
                Ok(()) => {}
                Err(err) if ngt_db::is_lease_lost(&err) => return Ok(Finish::LeaseLost),
                Err(err) => return Err(err),
            }
        }
        let payload = serde_json::to_value(view).context("venue view not serializable")?;
        for input in inputs_from_venue(&current.machine(), view) {
            if self.apply(order.id, input, Some(&payload)).await? == Finish::LeaseLost {
                return Ok(Finish::LeaseLost);
            }
        }
        Ok(Finish::Done)
    }

    /// Follow one leased order at the venue until it is terminal or the
    /// tracking budget is spent; then release the lease.
    async fn track(&self, order: &OrderRow, started: Instant) -> Result<Finish> {
        let o = &self.settings.orders;
        let mut last_beat = Instant::now();

        loop {
            if last_beat.elapsed() >= o.heartbeat() {
                match ngt_db::order_heartbeat(&self.pool, order.id, &self.worker_id, o.lease()).await {
                    Ok(()) => last_beat = Instant::now(),
                    Err(err) if ngt_db::is_lease_lost(&err) => return Ok(Finish::LeaseLost),
                    Err(err) => return Err(err),
                }
            }

            let Some(current) = ngt_db::order_fetch(&self.pool, order.id).await? else {
                return Ok(Finish::Done);
            };
            if current.status.is_terminal() || current.status == OrderStatus::ReconcileRequired {
                return Ok(Finish::Done);
            }
            if current.lease_owner.as_deref() != Some(self.worker_id.as_str()) {
                return Ok(Finish::LeaseLost);
            }

            if current.cancel_requested && current.cancel_sent_at.is_none() {
                if let Some(vid) = current.venue_order_id.as_deref() {
                    match self.venue.cancel(vid).await {
                        Ok(()) => {
                            ngt_db::order_mark_cancel_sent(&self.pool, order.id, &self.worker_id).await?;
                            tracing::info!(order_id = order.id, venue_order_id = vid, "cancel sent");
                        }
                        Err(VenueError::Rejected(reason)) => {
                            ngt_db::order_mark_cancel_sent(&self.pool, order.id, &self.worker_id).await?;
                            tracing::warn!(order_id = order.id, reason = %reason, "venue refused cancel");
                        }
                        Err(err) => {
                            tracing::warn!(order_id = order.id, error = %err, "cancel not sent; will retry");
                        }
                    }
                }
            }

            match self.venue.lookup_order(&order.order_ref).await {
                Ok(Some(view)) => {
                    if self.absorb_view(&current, &view).await? == Finish::LeaseLost {
                        return Ok(Finish::LeaseLost);
                    }
                }
                Ok(None) => {
                    return self
                        .apply(
                            order.id,
                            OrderInput::RequireReconcile {
                                reason: "venue no longer reports the order".to_string(),
                            },
                            None,
                        )
                        .await;
                }
                Err(err) => {
                    tracing::warn!(order_id = order.id, error = %err, "venue lookup failed while tracking");
                }
            }

            let Some(after) = ngt_db::order_fetch(&self.pool, order.id).await? else {
                return Ok(Finish::Done);
            };
            if after.status.is_terminal() || after.status == OrderStatus::ReconcileRequired {
                tracing::info!(order_id = order.id, status = after.status.as_str(), filled = after.filled_quantity, "order tracking finished");
                return Ok(Finish::Done);
            }

            let elapsed = started.elapsed();
            if after.status == OrderStatus::Submitting && elapsed >= o.ack_timeout() {
                return self
                    .apply(
                        order.id,
                        OrderInput::RequireReconcile {
                            reason: format!(
                                "no venue acknowledgment within {}s",
                                o.ack_timeout_seconds
                            ),
                        },
                        None,
                    )
                    .await;
            }
            if elapsed >= o.order_timeout() {
                ngt_db::order_release(&self.pool, order.id, &self.worker_id).await?;
                tracing::info!(
                    order_id = order.id,
                    status = after.status.as_str(),
                    "tracking budget spent; order left live for a later claim"
                );
                return Ok(Finish::Done);
            }

            tokio::time::sleep(self.track_poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_counts_both_claim_kinds() {
        let pass = PassSummary {
            submitted: 2,
            tracked: 3,
            stale_marked: 1,
        };
        assert_eq!(pass.processed(), 5);
        assert_eq!(PassSummary::default().processed(), 0);
    }

    #[test]
    fn reconcile_summary_serializes_flat() {
        let s = ReconcileSummary {
            applied: 1,
            unknown_venue_orders: vec!["1003".into()],
            ..ReconcileSummary::default()
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["applied"], 1);
        assert_eq!(v["unknown_venue_orders"][0], "1003");
        assert_eq!(v["stale_marked"], 0);
    }
}
