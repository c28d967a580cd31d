//! Builders to construct a scheduler from configuration.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::core::events::EventSink;
use crate::core::interval::IntervalSettingsRepository;
use crate::core::lease::{LeaseManager, LeaseRepository};
use crate::core::listener::{MultiplexedListener, NotificationChannel};
use crate::core::operation_pool::{MembershipSource, OperationPool, PoolInterval};
use crate::core::queue::QueueRepository;
use crate::core::rate_limit::RateLimitRepository;
use crate::core::scheduler::{Assigner, QueueProcessor, Scheduler};
use crate::core::serial_operation::OperationMethod;
use crate::core::SchedulerError;

/// Collaborators a scheduler is assembled from.
#[derive(Clone)]
pub struct SchedulerComponents {
    /// Queue items and step runs.
    pub queue_store: Arc<dyn QueueRepository>,
    /// Rate-limit declarations and state.
    pub rate_limits: Arc<dyn RateLimitRepository>,
    /// Tenant membership.
    pub membership: Arc<dyn MembershipSource>,
    /// Persisted interval delays. Intervals start at `start_delay` when absent.
    pub interval_settings: Option<Arc<dyn IntervalSettingsRepository>>,
    /// Diagnostic event sink.
    pub events: Arc<dyn EventSink>,
    /// Worker-selection algorithm.
    pub assigner: Arc<dyn Assigner>,
    /// Notification transport for `queue-check` wake-ups.
    pub notifier: Option<Arc<dyn NotificationChannel>>,
}

impl SchedulerComponents {
    /// Use one store for every repository role.
    pub fn with_store<S>(store: Arc<S>, events: Arc<dyn EventSink>, assigner: Arc<dyn Assigner>) -> Self
    where
        S: QueueRepository
            + RateLimitRepository
            + MembershipSource
            + IntervalSettingsRepository
            + 'static,
    {
        Self {
            queue_store: Arc::clone(&store) as Arc<dyn QueueRepository>,
            rate_limits: Arc::clone(&store) as Arc<dyn RateLimitRepository>,
            membership: Arc::clone(&store) as Arc<dyn MembershipSource>,
            interval_settings: Some(store as Arc<dyn IntervalSettingsRepository>),
            events,
            assigner,
            notifier: None,
        }
    }

    /// Attach a notification transport.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationChannel>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

/// Build a scheduler from validated configuration.
pub fn build_scheduler(
    cfg: &SchedulerConfig,
    components: SchedulerComponents,
) -> Result<Scheduler, SchedulerError> {
    cfg.validate().map_err(SchedulerError::InvalidConfig)?;

    let token = CancellationToken::new();
    let processor = Arc::new(QueueProcessor::new(
        components.queue_store,
        components.rate_limits,
        components.events,
        components.assigner,
        cfg.queue.batch_size,
        cfg.queue.no_rate_limit_ttl(),
    ));

    let mut pool = OperationPool::new(
        cfg.operation.description.clone(),
        cfg.operation.timeout(),
        Arc::clone(&processor) as Arc<dyn OperationMethod>,
    )
    .with_membership(components.membership, cfg.operation.membership_refresh())
    .with_token(token.child_token());

    if let Some(interval) = &cfg.interval {
        pool = pool.with_interval(PoolInterval {
            config: interval.to_interval_config(),
            settings: components.interval_settings,
            gauge: processor.gauge(),
        });
    }

    let listener = match (&components.notifier, cfg.listener.enabled) {
        (Some(notifier), true) => Some(Arc::new(
            MultiplexedListener::new(cfg.listener.channel.clone(), Arc::clone(notifier))
                .with_token(token.child_token()),
        )),
        (None, true) => {
            debug!("listener enabled without a notifier, queue-check wake-ups are local");
            None
        }
        _ => None,
    };

    Ok(Scheduler::new(Arc::new(pool), processor, listener, token))
}

/// Build a lease manager with the configured TTL.
pub fn build_lease_manager(
    cfg: &SchedulerConfig,
    repository: Arc<dyn LeaseRepository>,
) -> Result<LeaseManager, SchedulerError> {
    cfg.lease.validate().map_err(SchedulerError::InvalidConfig)?;
    Ok(LeaseManager::new(repository, cfg.lease.to_lease_config()))
}
