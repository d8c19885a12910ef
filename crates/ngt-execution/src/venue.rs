//! Venue boundary.
//!
//! [`VenueClient`] is the only way the core talks to a trading venue. Every
//! submission is tagged with the order's `order_ref`; implementations must
//! treat a repeated `order_ref` for a live order as the same order.

use async_trait::async_trait;
use chrono::Duration;
use ngt_schemas::{RawExecution, Side, VenueOrder, VenueOrderIds};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub order_ref: String,
    pub account: String,
    pub instrument: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
    pub side: Side,
    pub quantity: i64,
    /// `MKT` / `LMT` …; limit prices are outside the core.
    pub order_type: String,
    pub tif: String,
}

// ---------------------------------------------------------------------------
// VenueError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VenueError {
    /// Connectivity or timeout. The request may or may not have taken effect.
    Transient(String),
    /// The venue refused the request. Terminal; reason surfaced verbatim.
    Rejected(String),
}

impl VenueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transient(_))
    }
}

impl std::fmt::Display for VenueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VenueError::Transient(m) => write!(f, "venue unavailable: {m}"),
            VenueError::Rejected(m) => write!(f, "venue rejected: {m}"),
        }
    }
}

impl std::error::Error for VenueError {}

// ---------------------------------------------------------------------------
// VenueClient
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Place an order. Returns the venue identifiers as soon as they are
    /// assigned; acknowledgment is observed separately via `lookup_order`.
    async fn submit(&self, req: &SubmitRequest) -> Result<VenueOrderIds, VenueError>;

    async fn cancel(&self, venue_order_id: &str) -> Result<(), VenueError>;

    /// `Ok(None)` is confirmed absence: the venue holds no order with this
    /// reference, live or recently completed.
    async fn lookup_order(&self, order_ref: &str) -> Result<Option<VenueOrder>, VenueError>;

    async fn list_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError>;

    async fn list_recent_executions(
        &self,
        window: Duration,
    ) -> Result<Vec<RawExecution>, VenueError>;
}
