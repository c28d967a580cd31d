//! Diagnostic event sinks.
//!
//! Assignment outcomes and rate-limit conflicts are reported as fire-and-forget
//! [`DiagnosticEvent`]s. Sinks must never block the caller.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why an event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventReason {
    /// Step run bound to a worker.
    Assigned,
    /// No worker was available; the item stays queued.
    RequeuedNoWorker,
    /// A rate-limit key blocked the item; it stays queued.
    RequeuedRateLimit,
    /// Step runs computed different parameters for the same rate-limit key.
    RateLimitConflict,
    /// Dynamic rate-limit evaluation produced an unusable value.
    RateLimitInvalid,
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    /// Normal progress.
    Info,
    /// Degraded but handled.
    Warning,
    /// Requires operator attention.
    Critical,
}

/// Structured diagnostic event tied to a step run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    /// Event identifier.
    pub event_id: Uuid,
    /// Tenant owning the step run.
    pub tenant_id: String,
    /// Related step run.
    pub step_run_id: String,
    /// Reason code.
    pub reason: EventReason,
    /// Severity.
    pub severity: EventSeverity,
    /// Human readable message.
    pub message: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticEvent {
    /// Build an event stamped with the current time.
    pub fn new(
        tenant_id: impl Into<String>,
        step_run_id: impl Into<String>,
        reason: EventReason,
        severity: EventSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            step_run_id: step_run_id.into(),
            reason,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Event sink abstraction.
pub trait EventSink: Send + Sync {
    /// Record a batch of events without blocking.
    fn emit(&self, events: Vec<DiagnosticEvent>);
}

/// In-memory sink with a bounded buffer, for tests and development.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<DiagnosticEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a sink keeping at most `max_events`.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Snapshot of stored events, oldest first.
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events with the given reason.
    pub fn with_reason(&self, reason: EventReason) -> Vec<DiagnosticEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, events: Vec<DiagnosticEvent>) {
        let mut buf = self.events.lock();
        for event in events {
            if buf.len() >= self.max_events {
                buf.pop_front();
            }
            buf.push_back(event);
        }
    }
}

/// Sink that logs each event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, events: Vec<DiagnosticEvent>) {
        for e in events {
            match e.severity {
                EventSeverity::Info => tracing::info!(
                    tenant_id = %e.tenant_id,
                    step_run_id = %e.step_run_id,
                    reason = ?e.reason,
                    "{}", e.message
                ),
                EventSeverity::Warning => tracing::warn!(
                    tenant_id = %e.tenant_id,
                    step_run_id = %e.step_run_id,
                    reason = ?e.reason,
                    "{}", e.message
                ),
                EventSeverity::Critical => tracing::error!(
                    tenant_id = %e.tenant_id,
                    step_run_id = %e.step_run_id,
                    reason = ?e.reason,
                    "{}", e.message
                ),
            }
        }
    }
}
