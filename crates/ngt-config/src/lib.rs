//! ngt-config
//!
//! Layered YAML configuration for the worker processes:
//! - docs are merged in order (base → environment → local overrides)
//! - literal secrets are refused (config carries env var names only)
//! - the merged config is hashed over its canonical JSON form
//! - per-worker unused-key report
//! - typed, validated [`WorkerSettings`]

mod consumption;
mod layering;
mod settings;

pub use consumption::{
    consumed_pointers_for_worker, report_unused_keys, UnusedKeyPolicy, UnusedKeyReport,
};
pub use layering::{load_layered_yaml, load_layered_yaml_from_strings, LoadedConfig};
pub use settings::{
    ExecutionSettings, JobSettings, OrderSettings, VenueSettings, WorkerSettings,
    MAX_POLL_SECONDS, MAX_WINDOW_HOURS, SUPPORTED_VENUES,
};
