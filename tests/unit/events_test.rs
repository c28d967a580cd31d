//! Tests for diagnostic event sinks

use prometheus_scheduler_core::core::{
    DiagnosticEvent, EventReason, EventSeverity, EventSink, InMemoryEventSink, TracingEventSink,
};

fn event(step_run_id: &str, reason: EventReason) -> DiagnosticEvent {
    DiagnosticEvent::new("t1", step_run_id, reason, EventSeverity::Info, "msg")
}

#[test]
fn test_in_memory_sink_keeps_order() {
    let sink = InMemoryEventSink::new(10);
    sink.emit(vec![event("a", EventReason::Assigned), event("b", EventReason::RequeuedNoWorker)]);

    let ids: Vec<String> = sink.events().into_iter().map(|e| e.step_run_id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(sink.with_reason(EventReason::Assigned).len(), 1);
}

#[test]
fn test_in_memory_sink_is_bounded() {
    let sink = InMemoryEventSink::new(2);
    sink.emit(vec![
        event("a", EventReason::Assigned),
        event("b", EventReason::Assigned),
        event("c", EventReason::Assigned),
    ]);

    let ids: Vec<String> = sink.events().into_iter().map(|e| e.step_run_id).collect();
    assert_eq!(ids, vec!["b", "c"]);
}

#[test]
fn test_event_ids_are_unique() {
    let a = event("a", EventReason::Assigned);
    let b = event("a", EventReason::Assigned);
    assert_ne!(a.event_id, b.event_id);
}

#[test]
fn test_event_serializes_reason() {
    let json = serde_json::to_value(event("a", EventReason::RequeuedRateLimit)).unwrap();
    assert_eq!(json["reason"], "REQUEUED_RATE_LIMIT");
    assert_eq!(json["severity"], "INFO");
}

#[test]
fn test_tracing_sink_accepts_every_severity() {
    prometheus_scheduler_core::util::init_tracing();
    TracingEventSink.emit(vec![
        DiagnosticEvent::new("t1", "a", EventReason::Assigned, EventSeverity::Info, "ok"),
        DiagnosticEvent::new("t1", "b", EventReason::RateLimitConflict, EventSeverity::Warning, "conflict"),
        DiagnosticEvent::new("t1", "c", EventReason::RateLimitInvalid, EventSeverity::Critical, "bad"),
    ]);
}
