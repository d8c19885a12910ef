use chrono::{DateTime, Utc};

/// Scripted failure for the next `submit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitFault {
    /// Connection fails before the venue sees the order.
    BeforeAccept,
    /// The venue accepts the order, then the reply is lost.
    AfterAccept,
}

/// Venue clock start for a fresh [`crate::PaperVenue`]: 2026-01-05T14:30:00Z.
pub const PAPER_EPOCH_SECS: i64 = 1_767_623_400;

pub(crate) fn paper_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(PAPER_EPOCH_SECS, 0).unwrap_or_default()
}

/// First venue order id; perm ids are offset from it.
pub(crate) const FIRST_ORDER_ID: i64 = 1001;
pub(crate) const PERM_ID_OFFSET: i64 = 9_000_000;
