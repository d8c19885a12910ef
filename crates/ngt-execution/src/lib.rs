//! ngt-execution
//!
//! Pure order and execution logic, no I/O:
//! - `oms`: order lifecycle state machine and fill sequencing
//! - `exec_id`: pluggable execution-id correction parsing
//! - `trade`: trade resolution keys and canonical aggregates
//! - `venue`: the `VenueClient` boundary and its error taxonomy
//! - `prices`: integer-micros helpers

pub mod exec_id;
pub mod oms;
pub mod trade;
pub mod venue;

mod prices;

pub use exec_id::{ExecIdParser, ExecIdParts, SuffixExecIdParser};
pub use oms::{
    canonical_fills, inputs_from_venue, progress_from_executions, ExecutionFill, FillProgress,
    OrderInput, OrderMachine, Transition, TransitionError,
};
pub use prices::{format_micros, parse_price_micros, PricingError, MICROS_PER_UNIT};
pub use trade::{aggregate, vwap_micros, CanonicalExecution, TradeAggregate, TradeKey, TradeStatus};
pub use venue::{SubmitRequest, VenueClient, VenueError};
