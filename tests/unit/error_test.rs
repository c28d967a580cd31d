//! Tests for error types

use std::time::Duration;

use prometheus_scheduler_core::core::{AppResult, SchedulerError};

#[test]
fn test_backend_error() {
    let err = SchedulerError::Backend("connection failed".to_string());
    assert_eq!(format!("{err}"), "backend error: connection failed");
    assert!(err.is_transient());
}

#[test]
fn test_timeout_error() {
    let err = SchedulerError::Timeout(Duration::from_millis(250));
    assert_eq!(format!("{err}"), "operation timed out after 250ms");
    assert!(err.is_transient());
}

#[test]
fn test_cancelled_is_not_transient() {
    assert!(!SchedulerError::Cancelled.is_transient());
    assert!(!SchedulerError::ListenerClosed.is_transient());
}

#[test]
fn test_evaluation_error() {
    let err = SchedulerError::Evaluation("KEY returned 3".to_string());
    assert_eq!(format!("{err}"), "evaluation error: KEY returned 3");
    assert!(!err.is_transient());
}

#[test]
fn test_serialization_error_from_serde() {
    let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
    let err: SchedulerError = parse.unwrap_err().into();
    assert!(matches!(err, SchedulerError::Serialization(_)));
    assert!(format!("{err}").starts_with("serialization error:"));
}

#[test]
fn test_app_result_wraps_scheduler_error() {
    fn fails() -> AppResult<()> {
        Err(SchedulerError::InvalidConfig("batch_size must be greater than 0".into()).into())
    }
    let err = fails().unwrap_err();
    assert!(err.downcast_ref::<SchedulerError>().is_some());
    assert_eq!(
        err.to_string(),
        "invalid configuration: batch_size must be greater than 0"
    );
}
