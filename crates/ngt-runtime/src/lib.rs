//! ngt-runtime
//!
//! Worker loops over the durable store:
//! - [`JobEngine`]: job queue worker with registry and lease keeper
//! - [`OrderManager`]: order claim/submit/track plus startup reconciliation
//! - [`HeartbeatReporter`]: per-worker liveness rows
//! - cooperative shutdown over a `watch` channel

mod heartbeat;
mod jobs;
mod orders;
mod shutdown;

pub use heartbeat::{new_worker_id, HeartbeatReporter, PASS_HEARTBEAT_MAX};
pub use jobs::{
    ExecutionsSync, JobContext, JobEngine, JobHandler, JobOutcome, JobRegistry, OrdersReconcile,
    PermanentJobError, JOB_EXECUTIONS_SYNC, JOB_ORDERS_RECONCILE,
};
pub use orders::{
    reconcile_with_venue, submit_request, OrderManager, PassSummary, ReconcileSummary,
    PARTIAL_FILL_NOT_RESUBMITTED, RETRIES_EXHAUSTED, TRACK_POLL_INTERVAL,
};
pub use shutdown::{shutdown_channel, spawn_signal_listener, Shutdown, ShutdownTrigger};
