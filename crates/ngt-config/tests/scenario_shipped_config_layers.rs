//! The YAML layers shipped under `config/` load, validate and match the
//! built-in defaults.

use ngt_config::{load_layered_yaml, WorkerSettings};

fn shipped(name: &str) -> String {
    format!("{}/../../config/{name}", env!("CARGO_MANIFEST_DIR"))
}

#[test]
fn base_layer_spells_out_the_defaults() {
    let base = shipped("base.yaml");
    let loaded = load_layered_yaml(&[base.as_str()]).unwrap();
    let settings = WorkerSettings::from_loaded(&loaded).unwrap();
    assert_eq!(settings, WorkerSettings::default());
}

#[test]
fn paper_layer_overrides_loop_timings_only() {
    let base = shipped("base.yaml");
    let paper = shipped("paper.yaml");
    let loaded = load_layered_yaml(&[base.as_str(), paper.as_str()]).unwrap();
    let settings = WorkerSettings::from_loaded(&loaded).unwrap();

    let defaults = WorkerSettings::default();
    assert_eq!(settings.orders.poll_seconds, 0.5);
    assert_eq!(settings.orders.order_timeout_seconds, 20);
    assert_eq!(settings.orders.lease_seconds, defaults.orders.lease_seconds);
    assert_eq!(settings.executions, defaults.executions);
    assert_eq!(settings.venue.kind, "paper");
}
