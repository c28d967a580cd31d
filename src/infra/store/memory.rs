//! In-memory transactional store.
//!
//! Every trait method takes the state lock once, so each call behaves like
//! a single transaction with all rows locked. Used by tests, benchmarks, and
//! single-replica development setups.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::core::interval::IntervalSettingsRepository;
use crate::core::lease::{Lease, LeaseKind, LeaseRepository};
use crate::core::operation_pool::MembershipSource;
use crate::core::queue::{CommitBatch, QueueItem, QueueRepository, StepRunStatus};
use crate::core::rate_limit::{
    ExpressionEval, RateLimitDefinition, RateLimitRepository, RateLimitState, StepRateLimit,
};
use crate::core::SchedulerError;

#[derive(Debug, Clone)]
struct StoredItem {
    item: QueueItem,
    is_queued: bool,
}

#[derive(Debug, Clone)]
struct StepRunRecord {
    status: StepRunStatus,
    worker_id: Option<String>,
}

#[derive(Default)]
struct StoreState {
    next_item_id: i64,
    items: BTreeMap<i64, StoredItem>,
    step_runs: HashMap<String, StepRunRecord>,
    tenants: BTreeSet<String>,
    queues: HashMap<String, BTreeSet<String>>,
    next_lease_id: i64,
    leases: HashMap<(String, LeaseKind, String), Lease>,
    step_rate_limits: HashMap<String, Vec<StepRateLimit>>,
    expression_evals: HashMap<String, Vec<ExpressionEval>>,
    rate_limits: HashMap<(String, String), RateLimitState>,
    intervals: HashMap<(String, String), Duration>,
}

/// Store implementing every repository trait in memory.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every repository call fail with a backend error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn check(&self) -> Result<(), SchedulerError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(SchedulerError::Backend("store unavailable".into()));
        }
        Ok(())
    }

    /// Register a tenant for membership listing.
    pub fn add_tenant(&self, tenant_id: &str) {
        self.state.lock().tenants.insert(tenant_id.to_string());
    }

    /// Remove a tenant from membership listing.
    pub fn remove_tenant(&self, tenant_id: &str) {
        self.state.lock().tenants.remove(tenant_id);
    }

    /// Enqueue a step run with default priority and a five minute
    /// scheduling timeout.
    pub fn enqueue(&self, tenant_id: &str, queue: &str, step_run_id: &str, step_id: &str) -> QueueItem {
        self.enqueue_item(QueueItem {
            id: 0,
            tenant_id: tenant_id.to_string(),
            queue: queue.to_string(),
            step_run_id: step_run_id.to_string(),
            step_id: step_id.to_string(),
            priority: 1,
            is_retry: false,
            desired_worker_id: None,
            schedule_timeout_at: Utc::now() + chrono::Duration::minutes(5),
        })
    }

    /// Enqueue `item` under a freshly generated id. The step run is created
    /// in `PendingAssignment` if unknown.
    pub fn enqueue_item(&self, mut item: QueueItem) -> QueueItem {
        let mut state = self.state.lock();
        state.next_item_id += 1;
        item.id = state.next_item_id;
        state.tenants.insert(item.tenant_id.clone());
        state
            .queues
            .entry(item.tenant_id.clone())
            .or_default()
            .insert(item.queue.clone());
        state
            .step_runs
            .entry(item.step_run_id.clone())
            .or_insert(StepRunRecord {
                status: StepRunStatus::PendingAssignment,
                worker_id: None,
            });
        state.items.insert(
            item.id,
            StoredItem {
                item: item.clone(),
                is_queued: true,
            },
        );
        item
    }

    /// Force a step run status.
    pub fn set_step_run_status(&self, step_run_id: &str, status: StepRunStatus) {
        self.state
            .lock()
            .step_runs
            .entry(step_run_id.to_string())
            .and_modify(|r| r.status = status)
            .or_insert(StepRunRecord {
                status,
                worker_id: None,
            });
    }

    /// Current status of a step run.
    pub fn step_run_status(&self, step_run_id: &str) -> Option<StepRunStatus> {
        self.state.lock().step_runs.get(step_run_id).map(|r| r.status)
    }

    /// Worker a step run is assigned to.
    pub fn step_run_worker(&self, step_run_id: &str) -> Option<String> {
        self.state
            .lock()
            .step_runs
            .get(step_run_id)
            .and_then(|r| r.worker_id.clone())
    }

    /// Items still queued for `(tenant_id, queue)`, ascending by id.
    pub fn queued_items(&self, tenant_id: &str, queue: &str) -> Vec<QueueItem> {
        self.state
            .lock()
            .items
            .values()
            .filter(|s| s.is_queued && s.item.tenant_id == tenant_id && s.item.queue == queue)
            .map(|s| s.item.clone())
            .collect()
    }

    /// Declare a rate limit on a step.
    pub fn declare_step_rate_limit(&self, tenant_id: &str, limit: StepRateLimit) {
        self.state
            .lock()
            .step_rate_limits
            .entry(tenant_id.to_string())
            .or_default()
            .push(limit);
    }

    /// Store evaluated dynamic rate-limit expressions.
    pub fn insert_expression_evals(&self, evals: Vec<ExpressionEval>) {
        let mut state = self.state.lock();
        for eval in evals {
            state
                .expression_evals
                .entry(eval.step_run_id.clone())
                .or_default()
                .push(eval);
        }
    }

    /// Persistent state of a rate-limit key.
    pub fn rate_limit(&self, tenant_id: &str, key: &str) -> Option<RateLimitState> {
        self.state
            .lock()
            .rate_limits
            .get(&(tenant_id.to_string(), key.to_string()))
            .cloned()
    }

    /// Every stored lease, expired or not.
    pub fn leases(&self) -> Vec<Lease> {
        self.state.lock().leases.values().cloned().collect()
    }
}

#[async_trait]
impl QueueRepository for InMemoryStore {
    async fn list_queues(&self, tenant_id: &str) -> Result<Vec<String>, SchedulerError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .queues
            .get(tenant_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_queue_items(
        &self,
        tenant_id: &str,
        queue: &str,
        gt_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, SchedulerError> {
        self.check()?;
        let state = self.state.lock();
        let start = gt_id.map_or(i64::MIN, |id| id.saturating_add(1));
        Ok(state
            .items
            .range(start..)
            .map(|(_, s)| s)
            .filter(|s| s.is_queued && s.item.tenant_id == tenant_id && s.item.queue == queue)
            .take(limit)
            .map(|s| s.item.clone())
            .collect())
    }

    async fn step_run_statuses(
        &self,
        _tenant_id: &str,
        step_run_ids: &[String],
    ) -> Result<HashMap<String, StepRunStatus>, SchedulerError> {
        self.check()?;
        let state = self.state.lock();
        Ok(step_run_ids
            .iter()
            .filter_map(|id| state.step_runs.get(id).map(|r| (id.clone(), r.status)))
            .collect())
    }

    async fn cancel_queue_items(&self, item_ids: &[i64]) -> Result<(), SchedulerError> {
        self.check()?;
        let mut state = self.state.lock();
        for id in item_ids {
            if let Some(stored) = state.items.get_mut(id) {
                stored.is_queued = false;
            }
        }
        Ok(())
    }

    async fn commit_assignments(
        &self,
        _tenant_id: &str,
        batch: &CommitBatch,
    ) -> Result<Vec<String>, SchedulerError> {
        self.check()?;
        let mut state = self.state.lock();

        for step_run_id in &batch.timed_out_step_run_ids {
            if let Some(run) = state.step_runs.get_mut(step_run_id) {
                if !run.status.is_final() {
                    run.status = StepRunStatus::Cancelling;
                }
            }
        }

        let mut applied = Vec::with_capacity(batch.assignments.len());
        for (step_run_id, worker_id) in &batch.assignments {
            if let Some(run) = state.step_runs.get_mut(step_run_id) {
                if run.status == StepRunStatus::PendingAssignment {
                    run.status = StepRunStatus::Assigned;
                    run.worker_id = Some(worker_id.clone());
                    applied.push(step_run_id.clone());
                }
            }
        }

        for id in &batch.processed_item_ids {
            if let Some(stored) = state.items.get_mut(id) {
                stored.is_queued = false;
            }
        }
        Ok(applied)
    }

    async fn min_unprocessed_queue_item_id(
        &self,
        tenant_id: &str,
        queue: &str,
    ) -> Result<Option<i64>, SchedulerError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .items
            .values()
            .find(|s| s.is_queued && s.item.tenant_id == tenant_id && s.item.queue == queue)
            .map(|s| s.item.id))
    }
}

#[async_trait]
impl LeaseRepository for InMemoryStore {
    async fn acquire_or_extend_leases(
        &self,
        tenant_id: &str,
        kind: LeaseKind,
        resource_ids: &[String],
        existing_lease_ids: &[i64],
        expires_at: DateTime<Utc>,
    ) -> Result<Vec<Lease>, SchedulerError> {
        self.check()?;
        let now = Utc::now();
        let existing: HashSet<i64> = existing_lease_ids.iter().copied().collect();
        let mut state = self.state.lock();
        let mut granted = Vec::with_capacity(resource_ids.len());
        let mut seen = HashSet::with_capacity(resource_ids.len());

        for resource_id in resource_ids {
            if !seen.insert(resource_id.as_str()) {
                continue;
            }
            let key = (tenant_id.to_string(), kind, resource_id.clone());
            let live_id = state
                .leases
                .get(&key)
                .filter(|l| !l.is_expired(now))
                .map(|l| l.id);

            match live_id {
                Some(id) if existing.contains(&id) => {
                    if let Some(lease) = state.leases.get_mut(&key) {
                        lease.expires_at = expires_at;
                        granted.push(lease.clone());
                    }
                }
                // held by someone else
                Some(_) => {}
                None => {
                    state.next_lease_id += 1;
                    let lease = Lease {
                        id: state.next_lease_id,
                        kind,
                        resource_id: resource_id.clone(),
                        tenant_id: tenant_id.to_string(),
                        expires_at,
                    };
                    state.leases.insert(key, lease.clone());
                    granted.push(lease);
                }
            }
        }
        Ok(granted)
    }

    async fn release_leases(&self, lease_ids: &[i64]) -> Result<(), SchedulerError> {
        self.check()?;
        let ids: HashSet<i64> = lease_ids.iter().copied().collect();
        self.state.lock().leases.retain(|_, l| !ids.contains(&l.id));
        Ok(())
    }
}

#[async_trait]
impl RateLimitRepository for InMemoryStore {
    async fn list_step_rate_limits(
        &self,
        tenant_id: &str,
        step_ids: &[String],
    ) -> Result<Vec<StepRateLimit>, SchedulerError> {
        self.check()?;
        let wanted: HashSet<&str> = step_ids.iter().map(String::as_str).collect();
        Ok(self
            .state
            .lock()
            .step_rate_limits
            .get(tenant_id)
            .map(|limits| {
                limits
                    .iter()
                    .filter(|l| wanted.contains(l.step_id.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_expression_evals(
        &self,
        step_run_ids: &[String],
    ) -> Result<Vec<ExpressionEval>, SchedulerError> {
        self.check()?;
        let state = self.state.lock();
        Ok(step_run_ids
            .iter()
            .filter_map(|id| state.expression_evals.get(id))
            .flatten()
            .cloned()
            .collect())
    }

    async fn upsert_rate_limits(
        &self,
        tenant_id: &str,
        limits: &[RateLimitDefinition],
    ) -> Result<(), SchedulerError> {
        self.check()?;
        let mut state = self.state.lock();
        for def in limits {
            state
                .rate_limits
                .entry((tenant_id.to_string(), def.key.clone()))
                .and_modify(|s| {
                    s.limit_value = def.limit_value;
                    s.window.clone_from(&def.window);
                    s.value = s.value.min(def.limit_value);
                })
                .or_insert_with(|| RateLimitState {
                    tenant_id: tenant_id.to_string(),
                    key: def.key.clone(),
                    limit_value: def.limit_value,
                    window: def.window.clone(),
                    value: def.limit_value,
                });
        }
        Ok(())
    }
}

#[async_trait]
impl IntervalSettingsRepository for InMemoryStore {
    async fn read_interval(
        &self,
        operation_id: &str,
        resource_id: &str,
    ) -> Result<Option<Duration>, SchedulerError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .intervals
            .get(&(operation_id.to_string(), resource_id.to_string()))
            .copied())
    }

    async fn set_interval(
        &self,
        operation_id: &str,
        resource_id: &str,
        delay: Duration,
    ) -> Result<Duration, SchedulerError> {
        self.check()?;
        self.state
            .lock()
            .intervals
            .insert((operation_id.to_string(), resource_id.to_string()), delay);
        Ok(delay)
    }
}

#[async_trait]
impl MembershipSource for InMemoryStore {
    async fn list_resource_ids(&self) -> Result<Vec<String>, SchedulerError> {
        self.check()?;
        Ok(self.state.lock().tenants.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_respects_gt_id_and_limit() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.enqueue("t1", "default", &format!("sr{i}"), "step");
        }
        store.enqueue("t1", "other", "sr-other", "step");

        let first = store.list_queue_items("t1", "default", None, 2).await.unwrap();
        assert_eq!(first.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1, 2]);

        let rest = store.list_queue_items("t1", "default", Some(2), 10).await.unwrap();
        assert_eq!(rest.iter().map(|i| i.id).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn commit_only_assigns_pending_runs() {
        let store = InMemoryStore::new();
        let a = store.enqueue("t1", "q", "sr-a", "step");
        let b = store.enqueue("t1", "q", "sr-b", "step");
        store.set_step_run_status("sr-b", StepRunStatus::Cancelled);

        let applied = store
            .commit_assignments(
                "t1",
                &CommitBatch {
                    timed_out_step_run_ids: vec![],
                    assignments: vec![("sr-a".into(), "w1".into()), ("sr-b".into(), "w1".into())],
                    processed_item_ids: vec![a.id, b.id],
                },
            )
            .await
            .unwrap();

        assert_eq!(applied, vec!["sr-a".to_string()]);
        assert_eq!(store.step_run_worker("sr-a").as_deref(), Some("w1"));
        assert!(store.queued_items("t1", "q").is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let err = store.list_queues("t1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
