//! Shared domain and wire types for the ngtrader core.
//!
//! Status enums round-trip through the lowercase strings stored in Postgres
//! (`as_str` / `parse`). Venue records are the broker-agnostic shapes the
//! `VenueClient` trait speaks; prices are integer micros everywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// Case-insensitive; also accepts the venue shorthands `BOT` / `SLD`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "BOT" => Some(Side::Buy),
            "SELL" | "SLD" => Some(Side::Sell),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// OrderStatus
// ---------------------------------------------------------------------------

/// Persisted lifecycle state of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Queued,
    Submitting,
    Submitted,
    PartiallyFilled,
    /// **Terminal.**
    Filled,
    /// **Terminal.**
    Cancelled,
    /// **Terminal.**
    Rejected,
    /// **Terminal.**
    Failed,
    /// Local state is not trusted until the venue's view has been applied.
    ReconcileRequired,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 9] = [
        OrderStatus::Queued,
        OrderStatus::Submitting,
        OrderStatus::Submitted,
        OrderStatus::PartiallyFilled,
        OrderStatus::Filled,
        OrderStatus::Cancelled,
        OrderStatus::Rejected,
        OrderStatus::Failed,
        OrderStatus::ReconcileRequired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Queued => "queued",
            OrderStatus::Submitting => "submitting",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Failed => "failed",
            OrderStatus::ReconcileRequired => "reconcile_required",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Failed
        )
    }

    /// States in which the venue may hold a live order for this row.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            OrderStatus::Submitting | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Worker heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Jobs,
    Orders,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 2] = [WorkerKind::Orders, WorkerKind::Jobs];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Jobs => "jobs",
            WorkerKind::Orders => "orders",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Stopped,
    Error,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopped => "stopped",
            WorkerState::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Venue records
// ---------------------------------------------------------------------------

/// Identifiers the venue assigns on submit. Persisted before acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueOrderIds {
    pub venue_order_id: String,
    pub perm_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueOrderStatus {
    /// Sent, not yet acknowledged.
    PendingSubmit,
    Submitted,
    Filled,
    Cancelled,
    Rejected,
    /// Venue no longer works the order (expired, deactivated).
    Inactive,
}

impl VenueOrderStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, VenueOrderStatus::PendingSubmit | VenueOrderStatus::Submitted)
    }
}

/// The venue's authoritative view of one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueOrder {
    pub order_ref: Option<String>,
    pub venue_order_id: String,
    pub perm_id: Option<i64>,
    pub account: String,
    pub instrument: String,
    pub side: Side,
    pub quantity: i64,
    /// Cumulative.
    pub filled_quantity: i64,
    pub avg_fill_price_micros: Option<i64>,
    pub status: VenueOrderStatus,
    /// Rejection / cancellation reason when the venue supplies one.
    pub reason: Option<String>,
    /// Venue time of the latest state change (last fill when filled).
    pub updated_at: DateTime<Utc>,
}

/// One raw fill record exactly as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExecution {
    pub account: String,
    /// Raw execution id including any correction suffix.
    pub exec_id: String,
    pub perm_id: Option<i64>,
    pub order_ref: Option<String>,
    /// Submitting API client id.
    pub client_id: Option<i64>,
    pub venue_order_id: Option<String>,
    pub instrument: String,
    pub side: Side,
    pub quantity: i64,
    pub price_micros: i64,
    pub executed_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_round_trips_through_db_strings() {
        for st in OrderStatus::ALL {
            assert_eq!(OrderStatus::parse(st.as_str()), Some(st));
        }
        assert_eq!(OrderStatus::parse("FILLED"), None);
    }

    #[test]
    fn terminal_and_in_flight_are_disjoint() {
        for st in OrderStatus::ALL {
            assert!(!(st.is_terminal() && st.is_in_flight()), "{st}");
        }
        assert!(!OrderStatus::ReconcileRequired.is_terminal());
        assert!(!OrderStatus::Queued.is_in_flight());
    }

    #[test]
    fn side_accepts_venue_shorthand() {
        assert_eq!(Side::parse("bot"), Some(Side::Buy));
        assert_eq!(Side::parse(" SLD "), Some(Side::Sell));
        assert_eq!(Side::parse("short"), None);
    }
}
