//! # Prometheus Scheduler Core
//!
//! Scheduling primitives for a multi-tenant workflow engine that assigns
//! queued step runs to workers.
//!
//! The crate provides the pieces a scheduler replica runs on top of a shared
//! transactional store:
//!
//! - **Adaptive intervals**: per-resource wake-up delays that back off while
//!   a tenant is idle and snap back on activity, persisted across restarts.
//! - **Serial operations**: at most one execution per resource, with
//!   triggers arriving mid-run coalesced into a single follow-up run.
//! - **Queue processing**: cursor-based listing that prunes duplicated and
//!   finalized items, rate-limit resolution (static and dynamic), and a
//!   single-transaction commit of assignment outcomes.
//! - **Leases**: exclusive, time-bounded ownership of workers and queues
//!   across replicas.
//! - **Multiplexed listener**: many logical topics over one notification
//!   channel.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_scheduler_core::builders::{build_scheduler, SchedulerComponents};
//! use prometheus_scheduler_core::config::SchedulerConfig;
//! use prometheus_scheduler_core::core::TracingEventSink;
//! use prometheus_scheduler_core::infra::InMemoryStore;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let components = SchedulerComponents::with_store(store, Arc::new(TracingEventSink), my_assigner);
//! let scheduler = build_scheduler(&SchedulerConfig::default(), components)?;
//! scheduler.start().await?;
//! scheduler.notify_queue_check("tenant-1").await?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling primitives.
pub mod core;
/// Configuration models for operations, intervals, leases, and the listener.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Infrastructure adapters for storage and notifications.
pub mod infra;
/// Shared utilities.
pub mod util;
