//! Pool of serial operations keyed by resource id.
//!
//! The pool lazily creates one [`SerialOperation`] per resource, reconciles
//! its membership against a [`MembershipSource`] on a fixed cadence, and
//! stops entries whose resource disappeared.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::interval::{Interval, IntervalConfig, IntervalSettingsRepository};
use crate::core::serial_operation::{OperationMethod, SerialOperation};
use crate::core::SchedulerError;

/// Live list of resource ids (tenants, queues, partitions).
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Return every resource id that should currently have an operation.
    async fn list_resource_ids(&self) -> Result<Vec<String>, SchedulerError>;
}

/// Gauge reporting units processed for a resource since the last call.
pub type Gauge = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Interval settings shared by every operation in a pool.
#[derive(Clone)]
pub struct PoolInterval {
    /// Interval tuning.
    pub config: IntervalConfig,
    /// Persisted interval store.
    pub settings: Option<Arc<dyn IntervalSettingsRepository>>,
    /// Activity gauge feeding backoff decisions.
    pub gauge: Gauge,
}

/// Collection of serial operations with membership reconciliation.
pub struct OperationPool {
    description: String,
    timeout: Duration,
    refresh_every: Duration,
    method: Arc<dyn OperationMethod>,
    membership: Option<Arc<dyn MembershipSource>>,
    interval: Option<PoolInterval>,
    ops: RwLock<HashMap<String, Arc<SerialOperation>>>,
    token: CancellationToken,
}

impl OperationPool {
    /// Create a pool. `description` doubles as the operation id under which
    /// interval settings are persisted.
    pub fn new(
        description: impl Into<String>,
        timeout: Duration,
        method: Arc<dyn OperationMethod>,
    ) -> Self {
        Self {
            description: description.into(),
            timeout,
            refresh_every: Duration::from_secs(1),
            method,
            membership: None,
            interval: None,
            ops: RwLock::new(HashMap::new()),
            token: CancellationToken::new(),
        }
    }

    /// Reconcile against `source` every `every` once started.
    #[must_use]
    pub fn with_membership(mut self, source: Arc<dyn MembershipSource>, every: Duration) -> Self {
        self.membership = Some(source);
        self.refresh_every = every;
        self
    }

    /// Attach an adaptive interval to every operation created by the pool.
    #[must_use]
    pub fn with_interval(mut self, interval: PoolInterval) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Root the pool under an existing cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Pool description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Ids with a live operation, sorted.
    pub fn resource_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ops.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Operation for `id`, if one exists.
    pub fn get(&self, id: &str) -> Option<Arc<SerialOperation>> {
        self.ops.read().get(id).cloned()
    }

    /// Trigger the operation for `id`, creating it on first use.
    pub async fn run_or_continue(&self, id: &str) {
        if self.token.is_cancelled() {
            return;
        }
        let op = self.get_or_create(id).await;
        op.trigger_or_continue();
    }

    async fn get_or_create(&self, id: &str) -> Arc<SerialOperation> {
        if let Some(op) = self.get(id) {
            return op;
        }

        let op = self.build_operation(id).await;

        let (op, created) = {
            let mut ops = self.ops.write();
            match ops.get(id) {
                // lost a creation race; the fresh one is never started
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    ops.insert(id.to_string(), Arc::clone(&op));
                    (op, true)
                }
            }
        };

        if created {
            debug!(pool = %self.description, resource_id = %id, "created operation");
            if let Some(interval) = &self.interval {
                let gauge = Arc::clone(&interval.gauge);
                op.start(move |resource_id| gauge(resource_id));
            }
        }
        op
    }

    async fn build_operation(&self, id: &str) -> Arc<SerialOperation> {
        let op = SerialOperation::new(
            id,
            self.description.clone(),
            self.timeout,
            Arc::clone(&self.method),
            self.token.child_token(),
        );

        let Some(pool_interval) = &self.interval else {
            return Arc::new(op);
        };

        let interval = match &pool_interval.settings {
            Some(settings) => {
                Interval::load(
                    self.description.clone(),
                    id,
                    pool_interval.config.clone(),
                    Arc::clone(settings),
                )
                .await
            }
            None => Interval::new(self.description.clone(), id, pool_interval.config.clone()),
        };
        Arc::new(op.with_interval(Arc::new(interval)))
    }

    /// Reconcile the pool against `ids`: create operations for new ids and
    /// stop and evict the ones no longer present, letting the method drop
    /// whatever it kept for them.
    pub async fn set_resources(&self, ids: &[String]) {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();

        let removed: Vec<Arc<SerialOperation>> = {
            let mut ops = self.ops.write();
            let stale: Vec<String> = ops
                .keys()
                .filter(|id| !wanted.contains(id.as_str()))
                .cloned()
                .collect();
            stale.iter().filter_map(|id| ops.remove(id)).collect()
        };
        for op in removed {
            info!(pool = %self.description, resource_id = %op.id(), "resource gone, stopping operation");
            op.stop();
            self.method.forget(op.id());
        }

        for id in ids {
            if self.token.is_cancelled() {
                return;
            }
            self.get_or_create(id).await;
        }
    }

    /// Pull the membership source once and reconcile.
    pub async fn refresh(&self) -> Result<(), SchedulerError> {
        let Some(source) = &self.membership else {
            return Ok(());
        };
        let ids = source.list_resource_ids().await?;
        self.set_resources(&ids).await;
        Ok(())
    }

    /// Spawn the membership reconciliation loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.refresh_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = pool.token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.refresh().await {
                            warn!(pool = %pool.description, error = %e, "membership refresh failed");
                        }
                    }
                }
            }
            debug!(pool = %pool.description, "membership loop exited");
        })
    }

    /// Stop every operation and the reconciliation loop.
    pub fn stop(&self) {
        self.token.cancel();
        let ops: Vec<Arc<SerialOperation>> = self.ops.write().drain().map(|(_, op)| op).collect();
        for op in ops {
            op.stop();
        }
    }
}
