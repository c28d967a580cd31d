//! Lease coordination across scheduler replicas.
//!
//! A lease is a time-bounded exclusive marker over `(tenant, kind, resource)`.
//! [`LeaseManager`] wraps a [`LeaseRepository`] and applies the configured
//! TTL; [`LeaseKeeper`] is the caller-side loop that renews leases before
//! they expire and gives up the ones whose resource disappeared.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::operation_pool::MembershipSource;
use crate::core::SchedulerError;

/// Class of resource a lease covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseKind {
    /// A worker available for assignment.
    Worker,
    /// A named queue.
    Queue,
    /// A concurrency-strategy partition.
    ConcurrencyStrategy,
}

/// Exclusive ownership marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Lease identity, stable across extensions.
    pub id: i64,
    /// Resource class.
    pub kind: LeaseKind,
    /// Resource identifier.
    pub resource_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Storage contract for leases.
///
/// `acquire_or_extend_leases` must run in one transaction that locks the
/// targeted rows, so two callers never both obtain a live lease for the
/// same `(tenant, kind, resource)`.
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Acquire leases for free or expired resources and extend the ones
    /// whose id is in `existing_lease_ids`. Resources held by another live
    /// lease are left out of the result.
    async fn acquire_or_extend_leases(
        &self,
        tenant_id: &str,
        kind: LeaseKind,
        resource_ids: &[String],
        existing_lease_ids: &[i64],
        expires_at: DateTime<Utc>,
    ) -> Result<Vec<Lease>, SchedulerError>;

    /// Drop the given leases. Unknown ids are ignored.
    async fn release_leases(&self, lease_ids: &[i64]) -> Result<(), SchedulerError>;
}

/// Lease TTL and renewal cadence.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Lifetime granted on acquire or extend.
    pub ttl: Duration,
    /// How often [`LeaseKeeper`] renews.
    pub renew_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(5),
        }
    }
}

/// Applies the configured TTL on top of a [`LeaseRepository`].
pub struct LeaseManager {
    repository: Arc<dyn LeaseRepository>,
    config: LeaseConfig,
}

impl LeaseManager {
    /// Create a manager.
    pub fn new(repository: Arc<dyn LeaseRepository>, config: LeaseConfig) -> Self {
        Self { repository, config }
    }

    /// Lease configuration.
    pub const fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Acquire or extend leases on `resource_ids`. The result may be a
    /// subset of the request when another holder owns some resources.
    pub async fn acquire_or_extend(
        &self,
        tenant_id: &str,
        kind: LeaseKind,
        resource_ids: &[String],
        existing: &[Lease],
    ) -> Result<Vec<Lease>, SchedulerError> {
        if resource_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .map_err(|e| SchedulerError::InvalidConfig(format!("lease ttl: {e}")))?;
        let expires_at = Utc::now() + ttl;
        let existing_ids: Vec<i64> = existing.iter().map(|l| l.id).collect();

        let leases = self
            .repository
            .acquire_or_extend_leases(tenant_id, kind, resource_ids, &existing_ids, expires_at)
            .await?;

        if leases.len() < resource_ids.len() {
            debug!(
                %tenant_id,
                ?kind,
                requested = resource_ids.len(),
                granted = leases.len(),
                "partial lease acquisition"
            );
        }
        Ok(leases)
    }

    /// Release leases. Idempotent.
    pub async fn release(&self, leases: &[Lease]) -> Result<(), SchedulerError> {
        if leases.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = leases.iter().map(|l| l.id).collect();
        self.repository.release_leases(&ids).await
    }
}

/// Renewal loop keeping leases over a live set of resources.
pub struct LeaseKeeper {
    manager: Arc<LeaseManager>,
    tenant_id: String,
    kind: LeaseKind,
    candidates: Arc<dyn MembershipSource>,
    held: Mutex<Vec<Lease>>,
    tx: watch::Sender<Vec<Lease>>,
}

impl LeaseKeeper {
    /// Create a keeper for `(tenant_id, kind)` over the ids `candidates` lists.
    pub fn new(
        manager: Arc<LeaseManager>,
        tenant_id: impl Into<String>,
        kind: LeaseKind,
        candidates: Arc<dyn MembershipSource>,
    ) -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            manager,
            tenant_id: tenant_id.into(),
            kind,
            candidates,
            held: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// Receive the held lease set after every renewal.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Lease>> {
        self.tx.subscribe()
    }

    /// Leases currently held.
    pub fn held(&self) -> Vec<Lease> {
        self.held.lock().clone()
    }

    /// Run one renewal round and return the held set.
    pub async fn tick(&self) -> Result<Vec<Lease>, SchedulerError> {
        let ids = self.candidates.list_resource_ids().await?;
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();

        let current = self.held();
        let (keep, gone): (Vec<Lease>, Vec<Lease>) = current
            .into_iter()
            .partition(|l| wanted.contains(l.resource_id.as_str()));

        if !gone.is_empty() {
            info!(tenant_id = %self.tenant_id, kind = ?self.kind, count = gone.len(), "releasing leases for vanished resources");
            self.manager.release(&gone).await?;
        }

        let leases = self
            .manager
            .acquire_or_extend(&self.tenant_id, self.kind, &ids, &keep)
            .await?;

        *self.held.lock() = leases.clone();
        self.tx.send_replace(leases.clone());
        Ok(leases)
    }

    /// Spawn the renewal loop. On cancellation every held lease is released.
    pub fn start(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let keeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keeper.manager.config().renew_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = keeper.tick().await {
                            warn!(tenant_id = %keeper.tenant_id, kind = ?keeper.kind, error = %e, "lease renewal failed");
                        }
                    }
                }
            }

            let held = std::mem::take(&mut *keeper.held.lock());
            if let Err(e) = keeper.manager.release(&held).await {
                warn!(tenant_id = %keeper.tenant_id, error = %e, "failed to release leases on shutdown");
            }
            keeper.tx.send_replace(Vec::new());
        })
    }
}
