//! Error types for scheduler operations.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Backend-specific failure with context (lock contention, lost connection).
    #[error("backend error: {0}")]
    Backend(String),
    /// A unit of work exceeded its time budget.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The owning context was cancelled.
    #[error("operation cancelled")]
    Cancelled,
    /// An expression evaluator returned unusable output.
    #[error("evaluation error: {0}")]
    Evaluation(String),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A notification payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The underlying notification connection is gone.
    #[error("listener closed")]
    ListenerClosed,
}

impl SchedulerError {
    /// Whether the failure is expected to clear on the next trigger.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout(_))
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
