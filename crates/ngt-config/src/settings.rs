//! Typed worker settings read from the merged config.
//!
//! Every field has a default so an empty config is valid; `validate` rejects
//! combinations the workers cannot run with.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use ngt_execution::SuffixExecIdParser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::LoadedConfig;

/// Upper bound for `*.poll_seconds`.
pub const MAX_POLL_SECONDS: f64 = 3600.0;

/// Upper bound for `executions.window_hours` and `executions.sync` payloads.
pub const MAX_WINDOW_HOURS: u32 = 24 * 366;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    pub poll_seconds: f64,
    pub lease_seconds: u64,
    pub heartbeat_seconds: u64,
    pub retry_delay_seconds: u64,
    pub default_max_attempts: i32,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            poll_seconds: 2.0,
            lease_seconds: 30,
            heartbeat_seconds: 10,
            retry_delay_seconds: 5,
            default_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderSettings {
    pub poll_seconds: f64,
    pub lease_seconds: u64,
    pub heartbeat_seconds: u64,
    /// Wait for venue acknowledgment before `reconcile_required`.
    pub ack_timeout_seconds: u64,
    /// Tracking budget per claim; the lease is released afterwards.
    pub order_timeout_seconds: u64,
    pub default_max_retries: i32,
    /// Orders handled per pass.
    pub batch_size: u32,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            poll_seconds: 2.0,
            lease_seconds: 60,
            heartbeat_seconds: 10,
            ack_timeout_seconds: 15,
            order_timeout_seconds: 45,
            default_max_retries: 1,
            batch_size: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub id_separator: char,
    pub revision_radix: u32,
    pub min_segments: usize,
    /// How far back `list_recent_executions` looks.
    pub window_hours: u32,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        let p = SuffixExecIdParser::default();
        Self {
            id_separator: p.separator,
            revision_radix: p.radix,
            min_segments: p.min_segments,
            window_hours: 24,
        }
    }
}

impl ExecutionSettings {
    pub fn parser(&self) -> SuffixExecIdParser {
        SuffixExecIdParser {
            separator: self.id_separator,
            radix: self.revision_radix,
            min_segments: self.min_segments,
        }
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.window_hours))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VenueSettings {
    pub kind: String,
}

impl Default for VenueSettings {
    fn default() -> Self {
        Self {
            kind: "paper".to_string(),
        }
    }
}

pub const SUPPORTED_VENUES: &[&str] = &["paper"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub jobs: JobSettings,
    pub orders: OrderSettings,
    pub executions: ExecutionSettings,
    pub venue: VenueSettings,
}

impl WorkerSettings {
    pub fn from_config_json(v: &Value) -> Result<Self> {
        let settings: WorkerSettings =
            serde_json::from_value(v.clone()).context("config does not match worker settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_loaded(cfg: &LoadedConfig) -> Result<Self> {
        Self::from_config_json(&cfg.config_json)
    }

    pub fn validate(&self) -> Result<()> {
        let j = &self.jobs;
        check_loop("jobs", j.poll_seconds, j.lease_seconds, j.heartbeat_seconds)?;
        if j.default_max_attempts < 1 {
            bail!("CONFIG_INVALID jobs.default_max_attempts must be >= 1");
        }

        let o = &self.orders;
        check_loop("orders", o.poll_seconds, o.lease_seconds, o.heartbeat_seconds)?;
        if o.default_max_retries < 0 {
            bail!("CONFIG_INVALID orders.default_max_retries must be >= 0");
        }
        if o.batch_size == 0 {
            bail!("CONFIG_INVALID orders.batch_size must be >= 1");
        }
        if o.ack_timeout_seconds == 0 || o.ack_timeout_seconds > o.order_timeout_seconds {
            bail!(
                "CONFIG_INVALID orders.ack_timeout_seconds ({}) must be in 1..=order_timeout_seconds ({})",
                o.ack_timeout_seconds,
                o.order_timeout_seconds
            );
        }

        let e = &self.executions;
        if !(2..=36).contains(&e.revision_radix) {
            bail!("CONFIG_INVALID executions.revision_radix must be in 2..=36");
        }
        if e.min_segments < 2 {
            bail!("CONFIG_INVALID executions.min_segments must be >= 2");
        }
        if e.window_hours == 0 || e.window_hours > MAX_WINDOW_HOURS {
            bail!("CONFIG_INVALID executions.window_hours must be in 1..={MAX_WINDOW_HOURS}");
        }

        if !SUPPORTED_VENUES.contains(&self.venue.kind.as_str()) {
            bail!(
                "CONFIG_INVALID venue.kind {:?} not supported (expected one of {:?})",
                self.venue.kind,
                SUPPORTED_VENUES
            );
        }
        Ok(())
    }
}

fn check_loop(section: &str, poll: f64, lease: u64, heartbeat: u64) -> Result<()> {
    if !(poll.is_finite() && poll > 0.0 && poll <= MAX_POLL_SECONDS) {
        bail!("CONFIG_INVALID {section}.poll_seconds must be in (0, {MAX_POLL_SECONDS}]");
    }
    if heartbeat == 0 || heartbeat >= lease {
        bail!(
            "CONFIG_INVALID {section}.heartbeat_seconds ({heartbeat}) must be in 1..lease_seconds ({lease})"
        );
    }
    Ok(())
}

// Durations as the runtime consumes them.
impl JobSettings {
    pub fn poll(&self) -> Duration {
        Duration::from_secs_f64(self.poll_seconds)
    }
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

impl OrderSettings {
    pub fn poll(&self) -> Duration {
        Duration::from_secs_f64(self.poll_seconds)
    }
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_seconds)
    }
    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_config_yields_defaults() {
        let s = WorkerSettings::from_config_json(&json!({})).unwrap();
        assert_eq!(s, WorkerSettings::default());
        assert_eq!(s.jobs.retry_delay(), Duration::from_secs(5));
        assert_eq!(s.orders.order_timeout(), Duration::from_secs(45));
        assert_eq!(s.executions.parser(), SuffixExecIdParser::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let s = WorkerSettings::from_config_json(&json!({
            "orders": {"lease_seconds": 120},
            "executions": {"id_separator": "-", "revision_radix": 10}
        }))
        .unwrap();
        assert_eq!(s.orders.lease_seconds, 120);
        assert_eq!(s.orders.heartbeat_seconds, 10);
        assert_eq!(s.executions.parser().separator, '-');
    }

    #[test]
    fn heartbeat_must_be_shorter_than_lease() {
        let err = WorkerSettings::from_config_json(&json!({
            "jobs": {"lease_seconds": 10, "heartbeat_seconds": 10}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("jobs.heartbeat_seconds"), "{err}");
    }

    #[test]
    fn poll_interval_must_be_positive() {
        let err =
            WorkerSettings::from_config_json(&json!({"orders": {"poll_seconds": 0.0}})).unwrap_err();
        assert!(err.to_string().contains("orders.poll_seconds"), "{err}");
    }

    #[test]
    fn huge_intervals_are_refused_not_panicked_on() {
        for cfg in [
            json!({"jobs": {"poll_seconds": 1e300}}),
            json!({"orders": {"poll_seconds": MAX_POLL_SECONDS + 1.0}}),
        ] {
            let err = WorkerSettings::from_config_json(&cfg).unwrap_err();
            assert!(err.to_string().contains("poll_seconds"), "{err}");
        }
        let err = WorkerSettings::from_config_json(&json!({"executions": {"window_hours": u32::MAX}}))
            .unwrap_err();
        assert!(err.to_string().contains("executions.window_hours"), "{err}");

        let s = WorkerSettings::from_config_json(&json!({
            "jobs": {"poll_seconds": MAX_POLL_SECONDS},
            "executions": {"window_hours": MAX_WINDOW_HOURS}
        }))
        .unwrap();
        assert_eq!(s.jobs.poll(), Duration::from_secs(3600));
    }

    #[test]
    fn unknown_venue_kind_is_refused() {
        let err =
            WorkerSettings::from_config_json(&json!({"venue": {"kind": "ibkr"}})).unwrap_err();
        assert!(err.to_string().contains("venue.kind"), "{err}");
    }

    #[test]
    fn wrong_types_are_reported() {
        let err = WorkerSettings::from_config_json(&json!({"jobs": {"lease_seconds": "thirty"}}))
            .unwrap_err();
        assert!(format!("{err:#}").contains("worker settings"), "{err:#}");
    }
}
