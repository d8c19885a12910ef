//! Order lifecycle: the pure state machine and fill sequencing.
//!
//! Illegal inputs return a [`TransitionError`]; the manager records them on
//! the order and moves it to `reconcile_required` rather than guessing.

pub mod fills;
pub mod state_machine;

pub use fills::{canonical_fills, progress_from_executions, ExecutionFill, FillProgress};
pub use state_machine::{inputs_from_venue, OrderInput, OrderMachine, Transition, TransitionError};
