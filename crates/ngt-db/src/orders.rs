//! Order persistence, claims and lease-fenced transitions.
//!
//! Every status change goes through [`ngt_execution::OrderMachine`] inside a
//! transaction that holds the order row lock, and writes the new row state
//! plus exactly one `order_events` row. Events carry a per-order `seq`
//! assigned under that lock.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use ngt_execution::{OrderInput, OrderMachine, Transition};
use ngt_schemas::{OrderStatus, Side, VenueOrderIds};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::{is_unique_constraint_violation, secs, LeaseLost};

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub account: String,
    pub instrument: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
    pub side: Side,
    pub quantity: i64,
    pub order_type: String,
    pub tif: String,
    /// Idempotency token; unique per account, immutable.
    pub order_ref: String,
    pub max_retries: i32,
    pub source: Option<String>,
    pub request_text: Option<String>,
}

impl NewOrder {
    /// Market DAY order on SMART in USD.
    pub fn market(
        account: impl Into<String>,
        instrument: impl Into<String>,
        side: Side,
        quantity: i64,
        order_ref: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            instrument: instrument.into(),
            sec_type: "STK".to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            side,
            quantity,
            order_type: "MKT".to_string(),
            tif: "DAY".to_string(),
            order_ref: order_ref.into(),
            max_retries: 1,
            source: None,
            request_text: None,
        }
    }
}

/// Fresh idempotency token for callers that do not supply one.
pub fn new_order_ref() -> String {
    format!("ngt-{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: i64,
    pub account: String,
    pub instrument: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
    pub side: Side,
    pub quantity: i64,
    pub order_type: String,
    pub tif: String,
    pub order_ref: String,
    pub status: OrderStatus,
    pub venue_order_id: Option<String>,
    pub venue_perm_id: Option<i64>,
    pub filled_quantity: i64,
    pub avg_fill_price_micros: Option<i64>,
    pub last_fill_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub reconcile_required: bool,
    pub cancel_requested: bool,
    pub cancel_sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub source: Option<String>,
    pub request_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrderRow {
    pub fn machine(&self) -> OrderMachine {
        OrderMachine {
            status: self.status,
            quantity: self.quantity,
            filled_quantity: self.filled_quantity,
            avg_fill_price_micros: self.avg_fill_price_micros,
            last_fill_at: self.last_fill_at,
        }
    }

    pub fn retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

fn order_from_row(row: &PgRow) -> Result<OrderRow> {
    let status: String = row.try_get("status")?;
    let side: String = row.try_get("side")?;
    Ok(OrderRow {
        id: row.try_get("id")?,
        account: row.try_get("account")?,
        instrument: row.try_get("instrument")?,
        sec_type: row.try_get("sec_type")?,
        exchange: row.try_get("exchange")?,
        currency: row.try_get("currency")?,
        side: Side::parse(&side).ok_or_else(|| anyhow!("invalid order side: {side}"))?,
        quantity: row.try_get("quantity")?,
        order_type: row.try_get("order_type")?,
        tif: row.try_get("tif")?,
        order_ref: row.try_get("order_ref")?,
        status: OrderStatus::parse(&status).ok_or_else(|| anyhow!("invalid order status: {status}"))?,
        venue_order_id: row.try_get("venue_order_id")?,
        venue_perm_id: row.try_get("venue_perm_id")?,
        filled_quantity: row.try_get("filled_quantity")?,
        avg_fill_price_micros: row.try_get("avg_fill_price_micros")?,
        last_fill_at: row.try_get("last_fill_at")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        reconcile_required: row.try_get("reconcile_required")?,
        cancel_requested: row.try_get("cancel_requested")?,
        cancel_sent_at: row.try_get("cancel_sent_at")?,
        last_error: row.try_get("last_error")?,
        source: row.try_get("source")?,
        request_text: row.try_get("request_text")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        submitted_at: row.try_get("submitted_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct OrderEventRow {
    pub id: i64,
    pub order_id: i64,
    pub seq: i32,
    pub event_type: String,
    pub from_status: Option<String>,
    pub status: String,
    pub fill_delta: i64,
    pub filled_quantity: i64,
    pub avg_fill_price_micros: Option<i64>,
    pub message: Option<String>,
    pub venue_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Who is writing. Worker writes are fenced on the lease; everything else
/// (operator, startup reconciliation) requires that no live lease is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor<'a> {
    Worker(&'a str),
    Unleased,
}

fn lease_lost(order_id: i64, worker_id: &str) -> anyhow::Error {
    LeaseLost {
        entity: "order",
        id: order_id,
        worker_id: worker_id.to_string(),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Locked row helpers
// ---------------------------------------------------------------------------

struct Locked {
    row: OrderRow,
    lease_live: bool,
}

async fn lock_order(tx: &mut Transaction<'_, Postgres>, order_id: i64) -> Result<Locked> {
    let row = sqlx::query(
        r#"
        select o.*,
               (o.lease_owner is not null and o.lease_expires_at > now()) as lease_live
        from orders o
        where o.id = $1
        for update
        "#,
    )
    .bind(order_id)
    .fetch_optional(&mut **tx)
    .await
    .context("order lock failed")?
    .ok_or_else(|| anyhow!("order {order_id} not found"))?;

    Ok(Locked {
        lease_live: row.try_get("lease_live")?,
        row: order_from_row(&row)?,
    })
}

fn check_actor(locked: &Locked, actor: Actor<'_>) -> Result<()> {
    match actor {
        Actor::Worker(w) => {
            if locked.lease_live && locked.row.lease_owner.as_deref() == Some(w) {
                Ok(())
            } else {
                Err(lease_lost(locked.row.id, w))
            }
        }
        Actor::Unleased => {
            if locked.lease_live {
                bail!(
                    "order {} is leased by {}",
                    locked.row.id,
                    locked.row.lease_owner.as_deref().unwrap_or("?")
                );
            }
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn append_event(
    tx: &mut Transaction<'_, Postgres>,
    order_id: i64,
    event_type: &str,
    from_status: Option<OrderStatus>,
    status: OrderStatus,
    fill_delta: i64,
    filled_quantity: i64,
    avg_fill_price_micros: Option<i64>,
    message: Option<&str>,
    venue_payload: Option<&Value>,
) -> Result<i32> {
    let (seq,): (i32,) = sqlx::query_as(
        r#"
        insert into order_events (
          order_id, seq, event_type, from_status, status, fill_delta,
          filled_quantity, avg_fill_price_micros, message, venue_payload
        )
        select $1,
               coalesce((select max(seq) from order_events where order_id = $1), 0) + 1,
               $2, $3, $4, $5, $6, $7, $8, $9
        returning seq
        "#,
    )
    .bind(order_id)
    .bind(event_type)
    .bind(from_status.map(|s| s.as_str()))
    .bind(status.as_str())
    .bind(fill_delta)
    .bind(filled_quantity)
    .bind(avg_fill_price_micros)
    .bind(message)
    .bind(venue_payload)
    .fetch_one(&mut **tx)
    .await
    .context("order event append failed")?;
    Ok(seq)
}

/// Apply `input` to a locked row and persist the transition + its event.
/// `event_type` overrides the machine's event name.
async fn transition_locked(
    tx: &mut Transaction<'_, Postgres>,
    row: &OrderRow,
    input: &OrderInput,
    event_type: Option<&'static str>,
    venue_payload: Option<&Value>,
) -> Result<Option<Transition>> {
    let mut machine = row.machine();
    let Some(mut t) = machine.apply(input)? else {
        return Ok(None);
    };
    if let Some(name) = event_type {
        t.event_type = name;
    }

    let (view_id, view_perm) = match input {
        OrderInput::Reconcile(v) => (
            Some(v.venue_order_id.clone()).filter(|s| !s.is_empty()),
            v.perm_id.filter(|p| *p != 0),
        ),
        _ => (None, None),
    };
    let error_text = match t.to {
        OrderStatus::Rejected | OrderStatus::Failed | OrderStatus::ReconcileRequired => {
            t.message.clone()
        }
        _ => None,
    };
    let release = t.to.is_terminal() || t.to == OrderStatus::ReconcileRequired;

    sqlx::query(
        r#"
        update orders
        set status = $2,
            filled_quantity = $3,
            avg_fill_price_micros = $4,
            last_fill_at = $5,
            reconcile_required = ($2 = 'reconcile_required'),
            last_error = coalesce($6, last_error),
            venue_order_id = coalesce(venue_order_id, $7),
            venue_perm_id = coalesce(venue_perm_id, $8),
            submitted_at = case when $2 = 'submitted' then coalesce(submitted_at, now()) else submitted_at end,
            completed_at = case when $9 then now() else completed_at end,
            lease_owner = case when $10 then null else lease_owner end,
            lease_expires_at = case when $10 then null else lease_expires_at end,
            updated_at = now()
        where id = $1
        "#,
    )
    .bind(row.id)
    .bind(t.to.as_str())
    .bind(machine.filled_quantity)
    .bind(machine.avg_fill_price_micros)
    .bind(machine.last_fill_at)
    .bind(error_text.as_deref())
    .bind(view_id)
    .bind(view_perm)
    .bind(t.to.is_terminal())
    .bind(release)
    .execute(&mut **tx)
    .await
    .context("order transition update failed")?;

    append_event(
        tx,
        row.id,
        t.event_type,
        Some(t.from),
        t.to,
        t.fill_delta,
        machine.filled_quantity,
        machine.avg_fill_price_micros,
        t.message.as_deref(),
        venue_payload,
    )
    .await?;

    Ok(Some(t))
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(i64),
    /// Same (account, order_ref) already exists; nothing written.
    Existing(i64),
}

impl EnqueueOutcome {
    pub fn id(&self) -> i64 {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Existing(id) => *id,
        }
    }
}

/// Idempotent on (account, order_ref).
pub async fn order_enqueue(pool: &PgPool, order: &NewOrder) -> Result<EnqueueOutcome> {
    if order.quantity <= 0 {
        bail!("order quantity must be positive (got {})", order.quantity);
    }
    if order.order_ref.trim().is_empty() || order.account.trim().is_empty() {
        bail!("order account and order_ref must not be empty");
    }
    if order.max_retries < 0 {
        bail!("max_retries must be >= 0");
    }

    let mut tx = pool.begin().await.context("order_enqueue begin failed")?;
    let inserted = sqlx::query(
        r#"
        insert into orders (
          account, instrument, sec_type, exchange, currency, side, quantity,
          order_type, tif, order_ref, max_retries, source, request_text
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        on conflict on constraint uq_orders_account_ref do nothing
        returning id
        "#,
    )
    .bind(&order.account)
    .bind(&order.instrument)
    .bind(&order.sec_type)
    .bind(&order.exchange)
    .bind(&order.currency)
    .bind(order.side.as_str())
    .bind(order.quantity)
    .bind(&order.order_type)
    .bind(&order.tif)
    .bind(&order.order_ref)
    .bind(order.max_retries)
    .bind(&order.source)
    .bind(&order.request_text)
    .fetch_optional(&mut *tx)
    .await;

    let inserted = match inserted {
        Ok(r) => r,
        Err(e) if is_unique_constraint_violation(&e, "uq_orders_account_ref") => None,
        Err(e) => return Err(anyhow::Error::new(e).context("order_enqueue insert failed")),
    };

    let outcome = match inserted {
        Some(r) => {
            let id: i64 = r.try_get("id")?;
            append_event(
                &mut tx,
                id,
                "enqueued",
                None,
                OrderStatus::Queued,
                0,
                0,
                None,
                order.request_text.as_deref(),
                None,
            )
            .await?;
            EnqueueOutcome::Created(id)
        }
        None => {
            let (id,): (i64,) =
                sqlx::query_as("select id from orders where account = $1 and order_ref = $2")
                    .bind(&order.account)
                    .bind(&order.order_ref)
                    .fetch_one(&mut *tx)
                    .await
                    .context("order_enqueue lookup failed")?;
            EnqueueOutcome::Existing(id)
        }
    };

    tx.commit().await.context("order_enqueue commit failed")?;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClaimedOrder {
    /// Row state after the claim.
    pub order: OrderRow,
    /// Status before the claim (`queued` or `reconcile_required` for submit
    /// claims; unchanged for tracking claims).
    pub claimed_from: OrderStatus,
}

/// Claim one `queued|reconcile_required` order with a free lease, move it to
/// `submitting` and record the claim event.
pub async fn order_claim_for_submit(
    pool: &PgPool,
    worker_id: &str,
    lease: Duration,
) -> Result<Option<ClaimedOrder>> {
    let mut tx = pool.begin().await.context("order_claim_for_submit begin failed")?;

    let row = sqlx::query(
        r#"
        update orders o
        set status = 'submitting',
            reconcile_required = false,
            lease_owner = $1,
            lease_expires_at = now() + make_interval(secs => $2),
            heartbeat_at = now(),
            updated_at = now()
        from (
            select id, status as prev_status
            from orders
            where status in ('queued', 'reconcile_required')
              and (lease_owner is null or lease_expires_at <= now())
            order by created_at asc, id asc
            for update skip locked
            limit 1
        ) c
        where o.id = c.id
        returning o.*, c.prev_status
        "#,
    )
    .bind(worker_id)
    .bind(secs(lease))
    .fetch_optional(&mut *tx)
    .await
    .context("order_claim_for_submit claim failed")?;

    let Some(row) = row else {
        tx.rollback().await.ok();
        return Ok(None);
    };

    let order = order_from_row(&row)?;
    let prev: String = row.try_get("prev_status")?;
    let claimed_from =
        OrderStatus::parse(&prev).ok_or_else(|| anyhow!("invalid order status: {prev}"))?;

    let mut before = order.machine();
    before.status = claimed_from;
    let t = before
        .apply(&OrderInput::Claim)?
        .ok_or_else(|| anyhow!("claim of order {} produced no transition", order.id))?;
    append_event(
        &mut tx,
        order.id,
        t.event_type,
        Some(t.from),
        t.to,
        0,
        order.filled_quantity,
        order.avg_fill_price_micros,
        Some(worker_id),
        None,
    )
    .await?;

    tx.commit().await.context("order_claim_for_submit commit failed")?;
    Ok(Some(ClaimedOrder { order, claimed_from }))
}

/// Claim one live (`submitted|partially_filled`) order whose lease is free
/// for tracking. Status is unchanged; no event is written.
pub async fn order_claim_for_tracking(
    pool: &PgPool,
    worker_id: &str,
    lease: Duration,
) -> Result<Option<ClaimedOrder>> {
    let row = sqlx::query(
        r#"
        update orders o
        set lease_owner = $1,
            lease_expires_at = now() + make_interval(secs => $2),
            heartbeat_at = now(),
            updated_at = now()
        from (
            select id
            from orders
            where status in ('submitted', 'partially_filled')
              and lease_owner is null
            order by updated_at asc, id asc
            for update skip locked
            limit 1
        ) c
        where o.id = c.id
        returning o.*
        "#,
    )
    .bind(worker_id)
    .bind(secs(lease))
    .fetch_optional(pool)
    .await
    .context("order_claim_for_tracking failed")?;

    row.as_ref()
        .map(|r| {
            let order = order_from_row(r)?;
            Ok(ClaimedOrder {
                claimed_from: order.status,
                order,
            })
        })
        .transpose()
}

pub async fn order_heartbeat(pool: &PgPool, order_id: i64, worker_id: &str, lease: Duration) -> Result<()> {
    let res = sqlx::query(
        r#"
        update orders
        set lease_expires_at = now() + make_interval(secs => $3),
            heartbeat_at = now(),
            updated_at = now()
        where id = $1
          and lease_owner = $2
          and lease_expires_at > now()
        "#,
    )
    .bind(order_id)
    .bind(worker_id)
    .bind(secs(lease))
    .execute(pool)
    .await
    .context("order_heartbeat failed")?;

    if res.rows_affected() == 0 {
        return Err(lease_lost(order_id, worker_id));
    }
    Ok(())
}

/// Give up the lease, leaving the order in its current state. No-op when
/// the caller no longer owns it.
pub async fn order_release(pool: &PgPool, order_id: i64, worker_id: &str) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update orders
        set lease_owner = null, lease_expires_at = null, updated_at = now()
        where id = $1 and lease_owner = $2
        "#,
    )
    .bind(order_id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("order_release failed")?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Lease-fenced writes
// ---------------------------------------------------------------------------

/// Apply one state-machine input to the order.
///
/// `Ok(None)` for no-op inputs. Illegal inputs surface the machine's
/// `TransitionError` (recover with `downcast_ref`).
pub async fn order_apply(
    pool: &PgPool,
    order_id: i64,
    actor: Actor<'_>,
    input: &OrderInput,
    venue_payload: Option<&Value>,
) -> Result<Option<Transition>> {
    let mut tx = pool.begin().await.context("order_apply begin failed")?;
    let locked = lock_order(&mut tx, order_id).await?;
    check_actor(&locked, actor)?;

    let t = transition_locked(&mut tx, &locked.row, input, None, venue_payload).await?;
    tx.commit().await.context("order_apply commit failed")?;
    Ok(t)
}

/// Persist venue identifiers right after submit, before acknowledgment.
pub async fn order_record_venue_ids(
    pool: &PgPool,
    order_id: i64,
    worker_id: &str,
    ids: &VenueOrderIds,
) -> Result<()> {
    let mut tx = pool.begin().await.context("order_record_venue_ids begin failed")?;
    let locked = lock_order(&mut tx, order_id).await?;
    check_actor(&locked, Actor::Worker(worker_id))?;

    sqlx::query(
        r#"
        update orders
        set venue_order_id = $2, venue_perm_id = coalesce($3, venue_perm_id), updated_at = now()
        where id = $1
        "#,
    )
    .bind(order_id)
    .bind(&ids.venue_order_id)
    .bind(ids.perm_id)
    .execute(&mut *tx)
    .await
    .context("order_record_venue_ids update failed")?;

    let row = &locked.row;
    append_event(
        &mut tx,
        order_id,
        "venue_ids_recorded",
        Some(row.status),
        row.status,
        0,
        row.filled_quantity,
        row.avg_fill_price_micros,
        Some(&format!(
            "venue_order_id={} perm_id={}",
            ids.venue_order_id,
            ids.perm_id.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
        )),
        None,
    )
    .await?;

    tx.commit().await.context("order_record_venue_ids commit failed")?;
    Ok(())
}

/// Venue confirmed it holds no order for this `order_ref`: consume one retry.
/// Returns the new `retry_count`. Fails when no retries are left or when the
/// order already has fills (a resubmit would execute the full quantity again).
pub async fn order_record_retry(pool: &PgPool, order_id: i64, worker_id: &str) -> Result<i32> {
    let mut tx = pool.begin().await.context("order_record_retry begin failed")?;
    let locked = lock_order(&mut tx, order_id).await?;
    check_actor(&locked, Actor::Worker(worker_id))?;
    let row = &locked.row;
    if !row.retries_left() {
        bail!(
            "order {order_id} has no retries left ({}/{})",
            row.retry_count,
            row.max_retries
        );
    }
    if row.filled_quantity > 0 {
        bail!(
            "order {order_id} already filled {}/{}; not resubmitting",
            row.filled_quantity,
            row.quantity
        );
    }

    let Some((retry_count,)): Option<(i32,)> = sqlx::query_as(
        r#"
        update orders
        set retry_count = retry_count + 1,
            venue_order_id = null,
            venue_perm_id = null,
            updated_at = now()
        where id = $1 and filled_quantity = 0
        returning retry_count
        "#,
    )
    .bind(order_id)
    .fetch_optional(&mut *tx)
    .await
    .context("order_record_retry update failed")?
    else {
        bail!("order {order_id} has fills; not resubmitting");
    };

    append_event(
        &mut tx,
        order_id,
        "retry",
        Some(row.status),
        row.status,
        0,
        row.filled_quantity,
        row.avg_fill_price_micros,
        Some(&format!(
            "venue confirmed no live order; retry {retry_count}/{}",
            row.max_retries
        )),
        None,
    )
    .await?;

    tx.commit().await.context("order_record_retry commit failed")?;
    Ok(retry_count)
}

/// Record that the tracking worker sent the cancel for this order.
pub async fn order_mark_cancel_sent(pool: &PgPool, order_id: i64, worker_id: &str) -> Result<()> {
    let mut tx = pool.begin().await.context("order_mark_cancel_sent begin failed")?;
    let locked = lock_order(&mut tx, order_id).await?;
    check_actor(&locked, Actor::Worker(worker_id))?;

    sqlx::query("update orders set cancel_sent_at = now(), updated_at = now() where id = $1")
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .context("order_mark_cancel_sent update failed")?;

    let row = &locked.row;
    append_event(
        &mut tx,
        order_id,
        "cancel_sent",
        Some(row.status),
        row.status,
        0,
        row.filled_quantity,
        row.avg_fill_price_micros,
        row.venue_order_id.as_deref(),
        None,
    )
    .await?;
    tx.commit().await.context("order_mark_cancel_sent commit failed")?;
    Ok(())
}

/// Append an event that records an observation without changing status
/// (e.g. `reconcile_unmatched`).
pub async fn order_append_note(
    pool: &PgPool,
    order_id: i64,
    event_type: &str,
    message: &str,
    venue_payload: Option<&Value>,
) -> Result<i32> {
    let mut tx = pool.begin().await.context("order_append_note begin failed")?;
    let locked = lock_order(&mut tx, order_id).await?;
    let row = &locked.row;
    let seq = append_event(
        &mut tx,
        order_id,
        event_type,
        Some(row.status),
        row.status,
        0,
        row.filled_quantity,
        row.avg_fill_price_micros,
        Some(message),
        venue_payload,
    )
    .await?;
    tx.commit().await.context("order_append_note commit failed")?;
    Ok(seq)
}

// ---------------------------------------------------------------------------
// Cancel / operator clearance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Still queued and unleased: cancelled locally, nothing was sent.
    Cancelled,
    /// Flagged; the tracking worker sends the venue cancel.
    Requested,
    AlreadyRequested,
    AlreadyTerminal(OrderStatus),
}

pub async fn order_request_cancel(pool: &PgPool, order_id: i64) -> Result<CancelOutcome> {
    let mut tx = pool.begin().await.context("order_request_cancel begin failed")?;
    let locked = lock_order(&mut tx, order_id).await?;
    let row = &locked.row;

    let outcome = if row.status.is_terminal() {
        CancelOutcome::AlreadyTerminal(row.status)
    } else if row.status == OrderStatus::Queued && !locked.lease_live {
        transition_locked(
            &mut tx,
            row,
            &OrderInput::Cancel {
                reason: Some("cancelled before submission".to_string()),
            },
            None,
            None,
        )
        .await?;
        CancelOutcome::Cancelled
    } else if row.cancel_requested {
        CancelOutcome::AlreadyRequested
    } else {
        sqlx::query("update orders set cancel_requested = true, updated_at = now() where id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await
            .context("order_request_cancel update failed")?;
        append_event(
            &mut tx,
            order_id,
            "cancel_requested",
            Some(row.status),
            row.status,
            0,
            row.filled_quantity,
            row.avg_fill_price_micros,
            None,
            None,
        )
        .await?;
        CancelOutcome::Requested
    };

    tx.commit().await.context("order_request_cancel commit failed")?;
    Ok(outcome)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Back to `queued`; the next claim submits again with the same `order_ref`.
    Requeue,
    Fail(String),
    /// Operator asserts the venue holds no live order.
    Cancel,
}

/// Operator clearance of a `reconcile_required` order.
pub async fn order_resolve(pool: &PgPool, order_id: i64, resolution: &Resolution) -> Result<Transition> {
    let mut tx = pool.begin().await.context("order_resolve begin failed")?;
    let locked = lock_order(&mut tx, order_id).await?;
    check_actor(&locked, Actor::Unleased)?;
    if locked.row.status != OrderStatus::ReconcileRequired {
        bail!(
            "order {order_id} is {}; only reconcile_required orders can be resolved",
            locked.row.status
        );
    }

    if *resolution == Resolution::Requeue && locked.row.filled_quantity > 0 {
        bail!(
            "order {order_id} already filled {}/{}; requeue would resubmit the full quantity",
            locked.row.filled_quantity,
            locked.row.quantity
        );
    }

    let input = match resolution {
        Resolution::Requeue => OrderInput::Requeue,
        Resolution::Fail(reason) => OrderInput::Fail {
            reason: format!("operator: {reason}"),
        },
        Resolution::Cancel => OrderInput::Cancel {
            reason: Some("operator: no live venue order".to_string()),
        },
    };
    let t = transition_locked(&mut tx, &locked.row, &input, None, None)
        .await?
        .ok_or_else(|| anyhow!("resolution of order {order_id} produced no transition"))?;

    tx.commit().await.context("order_resolve commit failed")?;
    Ok(t)
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Every in-flight order whose lease is held but expired becomes
/// `reconcile_required` (event `lease_expired`). Returns affected ids.
pub async fn orders_mark_stale_reconcile_required(pool: &PgPool) -> Result<Vec<i64>> {
    let mut tx = pool.begin().await.context("orders_mark_stale begin failed")?;

    let ids: Vec<(i64,)> = sqlx::query_as(
        r#"
        select id
        from orders
        where status in ('submitting', 'submitted', 'partially_filled')
          and lease_owner is not null
          and lease_expires_at <= now()
        order by id
        for update skip locked
        "#,
    )
    .fetch_all(&mut *tx)
    .await
    .context("orders_mark_stale select failed")?;

    let mut marked = Vec::with_capacity(ids.len());
    for (id,) in ids {
        let locked = lock_order(&mut tx, id).await?;
        let reason = format!(
            "lease held by {} expired while {}",
            locked.row.lease_owner.as_deref().unwrap_or("?"),
            locked.row.status
        );
        let t = transition_locked(
            &mut tx,
            &locked.row,
            &OrderInput::RequireReconcile { reason },
            Some("lease_expired"),
            None,
        )
        .await?;
        if t.is_some() {
            marked.push(id);
        }
    }

    if !marked.is_empty() {
        tracing::warn!(count = marked.len(), ids = ?marked, "orders with expired leases marked reconcile_required");
    }

    tx.commit().await.context("orders_mark_stale commit failed")?;
    Ok(marked)
}

/// All non-terminal orders, oldest first (reconciliation input).
pub async fn orders_non_terminal(pool: &PgPool) -> Result<Vec<OrderRow>> {
    let rows = sqlx::query(
        r#"
        select *
        from orders
        where status not in ('filled', 'cancelled', 'rejected', 'failed')
        order by id
        "#,
    )
    .fetch_all(pool)
    .await
    .context("orders_non_terminal failed")?;
    rows.iter().map(order_from_row).collect()
}

// ---------------------------------------------------------------------------
// Read API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub account: Option<String>,
    /// Defaults to 100 when `None`.
    pub limit: Option<i64>,
}

/// Newest first.
pub async fn order_list(pool: &PgPool, filter: &OrderFilter) -> Result<Vec<OrderRow>> {
    let rows = sqlx::query(
        r#"
        select *
        from orders
        where ($1::text is null or status = $1)
          and ($2::text is null or account = $2)
        order by id desc
        limit $3
        "#,
    )
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.account.as_deref())
    .bind(filter.limit.unwrap_or(100))
    .fetch_all(pool)
    .await
    .context("order_list failed")?;
    rows.iter().map(order_from_row).collect()
}

pub async fn order_fetch(pool: &PgPool, order_id: i64) -> Result<Option<OrderRow>> {
    let row = sqlx::query("select * from orders where id = $1")
        .bind(order_id)
        .fetch_optional(pool)
        .await
        .context("order_fetch failed")?;
    row.as_ref().map(order_from_row).transpose()
}

pub async fn order_fetch_by_ref(pool: &PgPool, account: &str, order_ref: &str) -> Result<Option<OrderRow>> {
    let row = sqlx::query("select * from orders where account = $1 and order_ref = $2")
        .bind(account)
        .bind(order_ref)
        .fetch_optional(pool)
        .await
        .context("order_fetch_by_ref failed")?;
    row.as_ref().map(order_from_row).transpose()
}

/// Full history in `seq` order.
pub async fn order_events(pool: &PgPool, order_id: i64) -> Result<Vec<OrderEventRow>> {
    let rows = sqlx::query(
        r#"
        select id, order_id, seq, event_type, from_status, status, fill_delta,
               filled_quantity, avg_fill_price_micros, message, venue_payload, created_at
        from order_events
        where order_id = $1
        order by seq asc
        "#,
    )
    .bind(order_id)
    .fetch_all(pool)
    .await
    .context("order_events failed")?;

    rows.iter()
        .map(|r| {
            Ok(OrderEventRow {
                id: r.try_get("id")?,
                order_id: r.try_get("order_id")?,
                seq: r.try_get("seq")?,
                event_type: r.try_get("event_type")?,
                from_status: r.try_get("from_status")?,
                status: r.try_get("status")?,
                fill_delta: r.try_get("fill_delta")?,
                filled_quantity: r.try_get("filled_quantity")?,
                avg_fill_price_micros: r.try_get("avg_fill_price_micros")?,
                message: r.try_get("message")?,
                venue_payload: r.try_get("venue_payload")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .collect()
}
