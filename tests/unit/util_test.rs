//! Tests for utility functions

use std::time::Duration;

use prometheus_scheduler_core::core::parse_window;
use prometheus_scheduler_core::util::TtlCache;

#[test]
fn test_ttl_cache_get_and_contains() {
    let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
    cache.insert("step-1".to_string(), 7);
    assert_eq!(cache.get(&"step-1".to_string()), Some(7));
    assert!(!cache.contains(&"step-2".to_string()));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_init_tracing_is_idempotent() {
    prometheus_scheduler_core::util::init_tracing();
    prometheus_scheduler_core::util::init_tracing();
}

#[test]
fn test_parse_window_units() {
    assert_eq!(parse_window("1m").unwrap(), Duration::from_secs(60));
    assert_eq!(parse_window("2 hours").unwrap(), Duration::from_secs(7_200));
    assert_eq!(parse_window("DAY").unwrap(), Duration::from_secs(86_400));
    assert!(parse_window("soon").is_err());
}
