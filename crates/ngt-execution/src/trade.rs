//! Trade resolution keys and aggregates.
//!
//! A trade groups the executions of one venue order. The parent is resolved
//! from the strongest identifier an execution carries:
//!
//! 1. a nonzero venue permanent id,
//! 2. the client `order_ref`,
//! 3. a composite of account, client id, venue order id, instrument, side and
//!    the execution's UTC date.
//!
//! Aggregates are recomputed from canonical executions only.

use chrono::{DateTime, NaiveDate, Utc};
use ngt_schemas::{RawExecution, Side};

// ---------------------------------------------------------------------------
// TradeKey
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeKey {
    PermId(i64),
    OrderRef(String),
    Composite {
        client_id: Option<i64>,
        venue_order_id: Option<String>,
        instrument: String,
        side: Side,
        date: NaiveDate,
    },
}

impl TradeKey {
    /// Lookup candidates in priority order; the first is used to create the
    /// trade when none matches.
    pub fn candidates(exec: &RawExecution) -> Vec<TradeKey> {
        let mut out = Vec::with_capacity(3);
        if let Some(perm) = exec.perm_id.filter(|p| *p != 0) {
            out.push(TradeKey::PermId(perm));
        }
        if let Some(r) = exec.order_ref.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            out.push(TradeKey::OrderRef(r.to_string()));
        }
        out.push(TradeKey::Composite {
            client_id: exec.client_id,
            venue_order_id: exec.venue_order_id.clone(),
            instrument: exec.instrument.clone(),
            side: exec.side,
            date: exec.executed_at.date_naive(),
        });
        out
    }

    /// Stable text form stored in `trades.resolution_key` (unique per account).
    pub fn resolution_key(&self) -> String {
        match self {
            TradeKey::PermId(p) => format!("perm:{p}"),
            TradeKey::OrderRef(r) => format!("ref:{r}"),
            TradeKey::Composite {
                client_id,
                venue_order_id,
                instrument,
                side,
                date,
            } => format!(
                "cmp:{}|{}|{}|{}|{}",
                client_id.map(|c| c.to_string()).unwrap_or_default(),
                venue_order_id.as_deref().unwrap_or(""),
                instrument,
                side.as_str(),
                date.format("%Y-%m-%d"),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// One canonical execution as input to trade aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalExecution {
    pub quantity: i64,
    pub price_micros: i64,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeAggregate {
    pub total_quantity: i64,
    pub avg_price_micros: Option<i64>,
    pub first_execution_at: Option<DateTime<Utc>>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub execution_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeStatus {
    Partial,
    Filled,
    /// Not linked to a local order.
    External,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Partial => "partial",
            TradeStatus::Filled => "filled",
            TradeStatus::External => "external",
        }
    }

    /// `order_quantity` is the linked local order's quantity, if any.
    pub fn classify(order_quantity: Option<i64>, total_quantity: i64) -> Self {
        match order_quantity {
            None => TradeStatus::External,
            Some(q) if total_quantity >= q => TradeStatus::Filled,
            Some(_) => TradeStatus::Partial,
        }
    }
}

pub fn aggregate(execs: &[CanonicalExecution]) -> TradeAggregate {
    let legs: Vec<(i64, i64)> = execs.iter().map(|e| (e.quantity, e.price_micros)).collect();
    TradeAggregate {
        total_quantity: legs.iter().map(|(q, _)| q).sum(),
        avg_price_micros: vwap_micros(&legs),
        first_execution_at: execs.iter().map(|e| e.executed_at).min(),
        last_execution_at: execs.iter().map(|e| e.executed_at).max(),
        execution_count: execs.len() as i64,
    }
}

/// Volume-weighted average of `(quantity, price_micros)` legs, rounded half
/// away from zero. `None` when total quantity is zero.
pub fn vwap_micros(legs: &[(i64, i64)]) -> Option<i64> {
    let qty: i128 = legs.iter().map(|(q, _)| *q as i128).sum();
    if qty == 0 {
        return None;
    }
    let notional: i128 = legs.iter().map(|(q, p)| *q as i128 * *p as i128).sum();
    let half = qty.abs() / 2;
    let rounded = if (notional >= 0) == (qty > 0) {
        (notional.abs() + half) / qty.abs()
    } else {
        -((notional.abs() + half) / qty.abs())
    };
    i64::try_from(rounded).ok()
}
