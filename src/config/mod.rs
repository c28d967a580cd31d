//! Configuration models for the scheduler, its intervals, leases, and listener.

pub mod scheduler;

pub use scheduler::{
    IntervalSettings, LeaseSettings, ListenerSettings, OperationConfig, QueueSettings, SchedulerConfig,
};
