//! Scheduling loop glue.
//!
//! [`QueueProcessor`] is the per-tenant unit of work: list, resolve rate
//! limits, hand the batch to an external [`Assigner`], commit. [`Scheduler`]
//! runs it through an [`OperationPool`] keyed by tenant id and wakes tenants
//! on `queue-check` notifications.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::events::EventSink;
use crate::core::interval::ActivityGauge;
use crate::core::listener::MultiplexedListener;
use crate::core::operation_pool::{Gauge, OperationPool};
use crate::core::queue::{AssignResults, QueueItem, QueueRepository, TenantQueue};
use crate::core::rate_limit::{RateLimitRepository, StepRunRateLimits};
use crate::core::serial_operation::OperationMethod;
use crate::core::SchedulerError;

/// Topic carrying tenant wake-ups.
pub const QUEUE_CHECK_TOPIC: &str = "queue-check";

/// Payload of a `queue-check` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCheck {
    /// Tenant with new work.
    pub tenant_id: String,
}

/// One batch handed to the assigner.
#[derive(Debug, Clone)]
pub struct AssignInput {
    /// Tenant id.
    pub tenant_id: String,
    /// Queue name.
    pub queue: String,
    /// Valid items, ascending by id.
    pub items: Vec<QueueItem>,
    /// Units each step run consumes per rate-limit key.
    pub rate_limits: StepRunRateLimits,
}

/// External worker-selection algorithm.
#[async_trait]
pub trait Assigner: Send + Sync {
    /// Decide the outcome of every item in `input`.
    async fn assign(&self, input: AssignInput) -> Result<AssignResults, SchedulerError>;
}

/// Per-tenant queue processing step.
pub struct QueueProcessor {
    store: Arc<dyn QueueRepository>,
    rate_limits: Arc<dyn RateLimitRepository>,
    events: Arc<dyn EventSink>,
    assigner: Arc<dyn Assigner>,
    batch_size: usize,
    no_limit_ttl: Duration,
    queues: RwLock<HashMap<(String, String), Arc<TenantQueue>>>,
    activity: RwLock<HashMap<String, Arc<ActivityGauge>>>,
}

impl QueueProcessor {
    /// Create a processor listing at most `batch_size` items per queue and
    /// iteration.
    pub fn new(
        store: Arc<dyn QueueRepository>,
        rate_limits: Arc<dyn RateLimitRepository>,
        events: Arc<dyn EventSink>,
        assigner: Arc<dyn Assigner>,
        batch_size: usize,
        no_limit_ttl: Duration,
    ) -> Self {
        Self {
            store,
            rate_limits,
            events,
            assigner,
            batch_size: batch_size.max(1),
            no_limit_ttl,
            queues: RwLock::new(HashMap::new()),
            activity: RwLock::new(HashMap::new()),
        }
    }

    /// Queue handle for `(tenant_id, queue)`, created on first use so the
    /// listing cursor survives across iterations.
    pub fn tenant_queue(&self, tenant_id: &str, queue: &str) -> Arc<TenantQueue> {
        let key = (tenant_id.to_string(), queue.to_string());
        if let Some(q) = self.queues.read().get(&key) {
            return Arc::clone(q);
        }
        let mut queues = self.queues.write();
        Arc::clone(queues.entry(key).or_insert_with(|| {
            Arc::new(TenantQueue::new(
                tenant_id,
                queue,
                Arc::clone(&self.store),
                Arc::clone(&self.rate_limits),
                Arc::clone(&self.events),
                self.no_limit_ttl,
            ))
        }))
    }

    fn activity(&self, tenant_id: &str) -> Arc<ActivityGauge> {
        if let Some(g) = self.activity.read().get(tenant_id) {
            return Arc::clone(g);
        }
        Arc::clone(
            self.activity
                .write()
                .entry(tenant_id.to_string())
                .or_default(),
        )
    }

    /// Gauge reporting rows processed per tenant since the last sample.
    pub fn gauge(self: &Arc<Self>) -> Gauge {
        let processor = Arc::clone(self);
        Arc::new(move |tenant_id: &str| {
            processor
                .activity
                .read()
                .get(tenant_id)
                .map_or(0, |g| g.take())
        })
    }

    /// Drop the cached queue handles and activity gauge of `tenant_id`.
    pub fn forget_tenant(&self, tenant_id: &str) {
        let removed = {
            let mut queues = self.queues.write();
            let before = queues.len();
            queues.retain(|(tenant, _), _| tenant != tenant_id);
            before - queues.len()
        };
        self.activity.write().remove(tenant_id);
        debug!(%tenant_id, queues = removed, "forgot tenant state");
    }

    /// Number of `(tenant, queue)` handles currently cached.
    pub fn cached_queue_count(&self) -> usize {
        self.queues.read().len()
    }

    /// Whether an activity gauge exists for `tenant_id`.
    pub fn tracks_tenant(&self, tenant_id: &str) -> bool {
        self.activity.read().contains_key(tenant_id)
    }

    /// Process every queue of `tenant_id` once. Returns `true` when a queue
    /// produced a full batch that made progress.
    ///
    /// A failure anywhere between listing and commit leaves the queue's
    /// cursor where it was, so the next run lists the same items again.
    pub async fn process_tenant(&self, tenant_id: &str) -> Result<bool, SchedulerError> {
        let queues = self.store.list_queues(tenant_id).await?;
        let activity = self.activity(tenant_id);
        let mut more = false;

        for queue in queues {
            let tq = self.tenant_queue(tenant_id, &queue);
            let guard = tq.cursor_guard();
            let batch = tq.list_queue_batch(self.batch_size).await?;
            let full = batch.listed >= self.batch_size;
            let pruned = batch.pruned();
            if batch.items.is_empty() {
                guard.release();
                // a full batch of stale rows was cancelled, more may follow
                more |= full && pruned > 0;
                continue;
            }

            let rate_limits = tq.get_step_run_rate_limits(&batch.items).await?;
            let results = self
                .assigner
                .assign(AssignInput {
                    tenant_id: tenant_id.to_string(),
                    queue: queue.clone(),
                    items: batch.items,
                    rate_limits,
                })
                .await?;

            let processed = results.processed_count();
            let outcome = tq.mark_queue_items_processed(results).await?;
            guard.release();
            activity.record(processed);

            debug!(
                %tenant_id,
                %queue,
                listed = batch.listed,
                pruned,
                processed,
                assigned = outcome.succeeded.len(),
                failed = outcome.failed.len(),
                "queue processed"
            );

            // an all-unassigned full batch would relist the same rows
            more |= full && processed + pruned > 0;
        }
        Ok(more)
    }
}

#[async_trait]
impl OperationMethod for QueueProcessor {
    async fn run(&self, resource_id: &str) -> Result<bool, SchedulerError> {
        self.process_tenant(resource_id).await
    }

    fn forget(&self, resource_id: &str) {
        self.forget_tenant(resource_id);
    }
}

/// Tenant scheduler: one serial queue-processing operation per tenant.
pub struct Scheduler {
    pool: Arc<OperationPool>,
    processor: Arc<QueueProcessor>,
    listener: Option<Arc<MultiplexedListener>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Assemble a scheduler. `token` should be the parent of the pool's and
    /// listener's tokens.
    pub fn new(
        pool: Arc<OperationPool>,
        processor: Arc<QueueProcessor>,
        listener: Option<Arc<MultiplexedListener>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            pool,
            processor,
            listener,
            token,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Operation pool keyed by tenant id.
    pub const fn pool(&self) -> &Arc<OperationPool> {
        &self.pool
    }

    /// Queue processor run for each tenant.
    pub const fn processor(&self) -> &Arc<QueueProcessor> {
        &self.processor
    }

    /// Load the tenant set, start the membership loop, and subscribe to
    /// `queue-check` when a listener is configured.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.token.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        self.pool.refresh().await?;
        let mut tasks = vec![self.pool.start()];

        if let Some(listener) = &self.listener {
            let mut sub = listener.subscribe(QUEUE_CHECK_TOPIC).await?;
            let pool = Arc::clone(&self.pool);
            let token = self.token.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        () = token.cancelled() => break,
                        msg = sub.recv() => match msg {
                            Some(msg) => msg,
                            None => break,
                        },
                    };
                    match serde_json::from_value::<QueueCheck>(msg.payload) {
                        Ok(check) => pool.run_or_continue(&check.tenant_id).await,
                        Err(e) => warn!(error = %e, "malformed queue-check payload"),
                    }
                }
                debug!("queue-check loop exited");
            }));
        }

        self.tasks.lock().extend(tasks);
        info!(pool = %self.pool.description(), tenants = self.pool.resource_ids().len(), "scheduler started");
        Ok(())
    }

    /// Wake `tenant_id`. Published on `queue-check` when a listener is
    /// configured so every replica sees it, triggered locally otherwise.
    pub async fn notify_queue_check(&self, tenant_id: &str) -> Result<(), SchedulerError> {
        match &self.listener {
            Some(listener) => {
                listener
                    .publish(
                        QUEUE_CHECK_TOPIC,
                        &QueueCheck {
                            tenant_id: tenant_id.to_string(),
                        },
                    )
                    .await
            }
            None => {
                self.pool.run_or_continue(tenant_id).await;
                Ok(())
            }
        }
    }

    /// Stop every operation, the membership loop and the listener.
    pub fn stop(&self) {
        self.token.cancel();
        self.pool.stop();
        if let Some(listener) = &self.listener {
            listener.cancel();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(pool = %self.pool.description(), "scheduler stopped");
    }
}
