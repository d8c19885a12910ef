//! ngt-reconcile
//!
//! Startup reconciliation planner. Given the local non-terminal orders and a
//! venue snapshot (open orders + recent executions), decide per
//! `reconcile_required` order whether the venue's view can be applied or the
//! order must wait for operator action.
//!
//! Deterministic, pure logic. No IO. No venue calls.

mod engine;
mod types;

pub use engine::plan;
pub use types::*;
