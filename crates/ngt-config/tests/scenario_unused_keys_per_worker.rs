use ngt_config::{load_layered_yaml_from_strings, report_unused_keys, UnusedKeyPolicy};
use ngt_schemas::WorkerKind;

const YAML: &str = r#"
jobs:
  lease_seconds: 30
  default_max_attempts: 3
orders:
  lease_seconds: 60
executions:
  window_hours: 24
venue:
  kind: paper
legacy:
  poll: 5
"#;

#[test]
fn warn_reports_sections_the_worker_does_not_read() {
    let cfg = load_layered_yaml_from_strings(&[YAML]).unwrap();

    let jobs = report_unused_keys(WorkerKind::Jobs, &cfg.config_json, UnusedKeyPolicy::Warn).unwrap();
    assert_eq!(
        jobs.unused_leaf_pointers,
        vec!["/legacy/poll".to_string(), "/orders/lease_seconds".to_string()]
    );

    let orders =
        report_unused_keys(WorkerKind::Orders, &cfg.config_json, UnusedKeyPolicy::Warn).unwrap();
    assert_eq!(
        orders.unused_leaf_pointers,
        vec!["/jobs/lease_seconds".to_string(), "/legacy/poll".to_string()]
    );
    assert_eq!(orders.worker, "orders");
}

#[test]
fn fail_policy_errors_with_stable_code() {
    let cfg = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let err = report_unused_keys(WorkerKind::Jobs, &cfg.config_json, UnusedKeyPolicy::Fail)
        .unwrap_err();
    assert!(err.to_string().starts_with("CONFIG_UNUSED_KEYS (worker=jobs)"), "{err}");
}

#[test]
fn consumed_only_config_is_clean() {
    let cfg = load_layered_yaml_from_strings(&["orders:\n  batch_size: 5\nvenue:\n  kind: paper\n"])
        .unwrap();
    let r = report_unused_keys(WorkerKind::Orders, &cfg.config_json, UnusedKeyPolicy::Fail).unwrap();
    assert!(r.is_clean());
}
