//! Command handler modules for the `ngt` binary.
//!
//! Shared utilities used by multiple command paths live here.

pub mod executions;
pub mod jobs;
pub mod orders;
pub mod worker;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ngt_config::{report_unused_keys, UnusedKeyPolicy, WorkerSettings};
use ngt_schemas::WorkerKind;
use serde_json::Value;
use std::fs;

pub const ENV_NAME: &str = "NGT_ENV";

/// `.env.<env>` first, then `.env.local`. Missing files are ignored;
/// variables already set are never overridden.
pub fn load_env(env: Option<&str>) {
    let env = env
        .map(str::to_string)
        .or_else(|| std::env::var(ENV_NAME).ok())
        .filter(|e| !e.trim().is_empty());
    if let Some(e) = env {
        let _ = dotenvy::from_filename(format!(".env.{}", e.trim()));
    }
    let _ = dotenvy::from_filename(".env.local");
}

/// Settings for one worker kind. No paths means built-in defaults.
pub fn load_settings(paths: &[String], kind: WorkerKind) -> Result<WorkerSettings> {
    if paths.is_empty() {
        let s = WorkerSettings::default();
        s.validate()?;
        return Ok(s);
    }

    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = ngt_config::load_layered_yaml(&path_refs)?;

    let report = report_unused_keys(kind, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    for p in report.unused_leaf_pointers.iter().take(50) {
        tracing::warn!(worker = kind.as_str(), pointer = %p, "CONFIG_UNUSED_KEY");
    }

    let settings = WorkerSettings::from_loaded(&loaded)?;
    tracing::info!(
        worker = kind.as_str(),
        config_hash = %loaded.config_hash,
        layers = paths.len(),
        "config loaded"
    );
    Ok(settings)
}

/// Load a JSON payload from either an inline string or a file path.
pub fn load_payload(payload: Option<String>, payload_file: Option<String>) -> Result<Value> {
    if let Some(p) = payload_file {
        let bytes = fs::read(&p).with_context(|| format!("read payload-file failed: {}", p))?;
        let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(&bytes);
        let raw = String::from_utf8(bytes.to_vec()).context("payload-file must be UTF-8 text")?;
        let v: Value =
            serde_json::from_str(raw.trim()).context("payload-file must contain valid JSON")?;
        return Ok(v);
    }

    match payload {
        Some(raw) => serde_json::from_str(raw.trim()).context("--payload must be valid JSON"),
        None => Ok(Value::Object(Default::default())),
    }
}

pub fn opt_dt(dt: &Option<DateTime<Utc>>) -> String {
    dt.as_ref().map(|d| d.to_rfc3339()).unwrap_or_default()
}

pub fn opt_str(s: &Option<String>) -> &str {
    s.as_deref().unwrap_or("")
}

pub fn opt_num<T: ToString>(n: &Option<T>) -> String {
    n.as_ref().map(|v| v.to_string()).unwrap_or_default()
}
