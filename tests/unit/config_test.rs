//! Tests for configuration validation and loading

use std::collections::HashMap;
use std::time::Duration;

use prometheus_scheduler_core::config::{IntervalSettings, LeaseSettings, QueueSettings, SchedulerConfig};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn test_default_config_is_valid() {
    let cfg = SchedulerConfig::default();
    assert!(cfg.validate().is_ok());
    assert!(cfg.interval.is_none());
    assert_eq!(cfg.queue.batch_size, 100);
    assert_eq!(cfg.listener.channel, "scheduler");
}

#[test]
fn test_interval_defaults_match_runtime_defaults() {
    let settings = IntervalSettings::default();
    let runtime = settings.to_interval_config();
    assert_eq!(runtime.start_delay, Duration::from_millis(50));
    assert_eq!(runtime.max_delay, Duration::from_secs(5));
    assert_eq!(runtime.idle_threshold, 3);
}

#[test]
fn test_interval_max_below_start_is_invalid() {
    let settings = IntervalSettings {
        start_delay_ms: 500,
        max_delay_ms: 100,
        ..IntervalSettings::default()
    };
    assert!(settings.validate().is_err());
}

#[test]
fn test_lease_renew_must_precede_expiry() {
    let invalid = LeaseSettings {
        ttl_ms: 1_000,
        renew_interval_ms: 1_000,
    };
    assert!(invalid.validate().is_err());

    let valid = LeaseSettings {
        ttl_ms: 1_000,
        renew_interval_ms: 200,
    };
    assert!(valid.validate().is_ok());
    assert_eq!(valid.to_lease_config().ttl, Duration::from_secs(1));
}

#[test]
fn test_queue_batch_size_zero_is_invalid() {
    let invalid = QueueSettings {
        batch_size: 0,
        ..QueueSettings::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_from_json_partial_sections_use_defaults() {
    let cfg = SchedulerConfig::from_json_str(
        r#"{
            "queue": { "batch_size": 25 },
            "interval": { "start_delay_ms": 10, "max_delay_ms": 1000 }
        }"#,
    )
    .unwrap();

    assert_eq!(cfg.queue.batch_size, 25);
    assert_eq!(cfg.queue.no_rate_limit_cache_ms, 60_000);
    let interval = cfg.interval.unwrap();
    assert_eq!(interval.start_delay_ms, 10);
    assert_eq!(interval.idle_threshold, 3);
    assert_eq!(cfg.operation.description, "queue-processor");
}

#[test]
fn test_from_json_rejects_invalid_section() {
    let err = SchedulerConfig::from_json_str(r#"{"operation": {"timeout_ms": 0}}"#).unwrap_err();
    assert!(err.starts_with("operation invalid"), "{err}");
}

#[test]
fn test_from_json_parse_error() {
    let err = SchedulerConfig::from_json_str("{").unwrap_err();
    assert!(err.starts_with("parse error"), "{err}");
}

#[test]
fn test_from_lookup_overrides_defaults() {
    let cfg = SchedulerConfig::from_lookup(lookup(&[
        ("SCHEDULER_QUEUE_BATCH_SIZE", "10"),
        ("SCHEDULER_LEASE_TTL_MS", "4000"),
        ("SCHEDULER_LEASE_RENEW_MS", "1000"),
        ("SCHEDULER_INTERVAL_START_MS", "20"),
        ("SCHEDULER_LISTENER_ENABLED", "false"),
    ]))
    .unwrap();

    assert_eq!(cfg.queue.batch_size, 10);
    assert_eq!(cfg.lease.ttl_ms, 4_000);
    assert_eq!(cfg.interval.map(|i| i.start_delay_ms), Some(20));
    assert!(!cfg.listener.enabled);
}

#[test]
fn test_from_lookup_without_vars_is_default() {
    let cfg = SchedulerConfig::from_lookup(|_| None).unwrap();
    assert_eq!(cfg, SchedulerConfig::default());
}

#[test]
fn test_from_lookup_reports_bad_value() {
    let err = SchedulerConfig::from_lookup(lookup(&[("SCHEDULER_QUEUE_BATCH_SIZE", "many")])).unwrap_err();
    assert!(format!("{err:#}").contains("SCHEDULER_QUEUE_BATCH_SIZE=many"));
}

#[test]
fn test_from_lookup_validates() {
    let err = SchedulerConfig::from_lookup(lookup(&[("SCHEDULER_QUEUE_BATCH_SIZE", "0")])).unwrap_err();
    assert!(format!("{err:#}").contains("batch_size"));
}
