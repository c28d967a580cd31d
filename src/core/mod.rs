//! Core scheduling primitives: intervals, serial operations, queues, rate
//! limits, leases, and the notification listener.

pub mod error;
pub mod events;
pub mod expression;
pub mod interval;
pub mod lease;
pub mod listener;
pub mod operation_pool;
pub mod queue;
pub mod rate_limit;
pub mod scheduler;
pub mod serial_operation;

pub use error::{AppResult, SchedulerError};
pub use events::{DiagnosticEvent, EventReason, EventSeverity, EventSink, InMemoryEventSink, TracingEventSink};
pub use expression::{evaluate_rate_limit_expressions, EvaluatedValue, ExpressionEvaluator, RateLimitExpression};
pub use interval::{ActivityGauge, Interval, IntervalConfig, IntervalSettingsRepository};
pub use lease::{Lease, LeaseConfig, LeaseKeeper, LeaseKind, LeaseManager, LeaseRepository};
pub use listener::{MultiplexedListener, NotificationChannel, Subscription, TopicMessage};
pub use operation_pool::{Gauge, MembershipSource, OperationPool, PoolInterval};
pub use queue::{
    AssignResults, AssignedItem, CommitBatch, CursorGuard, ProcessedResults, QueueBatch, QueueItem, QueueRepository,
    RateLimitedItem, StepRunStatus, TenantQueue,
};
pub use rate_limit::{
    parse_window, reconcile_dynamic_limits, ExpressionEval, ExpressionKind, RateLimitDefinition, RateLimitKind,
    RateLimitRepository, RateLimitResolver, RateLimitState, StepRateLimit, StepRunRateLimits,
};
pub use scheduler::{AssignInput, Assigner, QueueCheck, QueueProcessor, Scheduler, QUEUE_CHECK_TOPIC};
pub use serial_operation::{FnOperation, OperationMethod, SerialOperation};
