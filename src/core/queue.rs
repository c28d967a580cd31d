//! Queue item lifecycle: listing, pruning, rate limits, and commit.
//!
//! [`TenantQueue`] is the per `(tenant, queue)` view used by the scheduling
//! loop. Listing resumes from a cursor so already-cleared ids are not
//! rescanned, invalid entries are cancelled on every call, and assignment
//! outcomes are committed in one transaction with observability side
//! effects spawned afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::events::{DiagnosticEvent, EventReason, EventSeverity, EventSink};
use crate::core::rate_limit::{RateLimitRepository, RateLimitResolver, StepRunRateLimits};
use crate::core::SchedulerError;

/// Step run lifecycle status as seen by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepRunStatus {
    /// Created, not yet queued.
    Pending,
    /// Queued, waiting for a worker.
    PendingAssignment,
    /// Bound to a worker.
    Assigned,
    /// Executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancellation requested.
    Cancelling,
    /// Cancelled.
    Cancelled,
}

impl StepRunStatus {
    /// Terminal statuses make a queued item stale.
    pub const fn is_final(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Cancelling
        )
    }
}

/// Pending unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Monotonic id, strictly increasing within a queue.
    pub id: i64,
    /// Owning tenant.
    pub tenant_id: String,
    /// Queue name.
    pub queue: String,
    /// Step run to assign.
    pub step_run_id: String,
    /// Step definition.
    pub step_id: String,
    /// Higher runs first, at the assigner's discretion.
    pub priority: i32,
    /// Whether this is a retry of an earlier attempt.
    pub is_retry: bool,
    /// Sticky worker preference.
    pub desired_worker_id: Option<String>,
    /// Past this instant the item times out instead of being assigned.
    pub schedule_timeout_at: DateTime<Utc>,
}

/// Queue item bound to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedItem {
    /// Assigned item.
    pub queue_item: QueueItem,
    /// Chosen worker.
    pub worker_id: String,
}

/// Queue item blocked by a rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitedItem {
    /// Blocked item.
    pub queue_item: QueueItem,
    /// Key that was exhausted.
    pub exceeded_key: String,
    /// Units the item needed.
    pub exceeded_units: i32,
    /// Units left on the key.
    pub exceeded_value: i64,
}

/// Outcome of one assignment round, produced by the external assigner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignResults {
    /// Items bound to a worker.
    pub assigned: Vec<AssignedItem>,
    /// Items with no available worker.
    pub unassigned: Vec<QueueItem>,
    /// Items past `schedule_timeout_at`.
    pub scheduling_timed_out: Vec<QueueItem>,
    /// Items blocked by a rate-limit key.
    pub rate_limited: Vec<RateLimitedItem>,
}

impl AssignResults {
    /// Number of rows the commit removes from the queue.
    pub fn processed_count(&self) -> usize {
        self.assigned.len() + self.scheduling_timed_out.len()
    }
}

/// Commit outcome for assigned items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedResults {
    /// Assignments that were applied.
    pub succeeded: Vec<AssignedItem>,
    /// Assignments whose step run changed state concurrently.
    pub failed: Vec<AssignedItem>,
}

/// Writes applied by one commit transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBatch {
    /// Step runs to move to cancelling.
    pub timed_out_step_run_ids: Vec<String>,
    /// `(step_run_id, worker_id)` pairs to move to assigned.
    pub assignments: Vec<(String, String)>,
    /// Queue items to remove.
    pub processed_item_ids: Vec<i64>,
}

/// Storage contract for queue items and their step runs.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Queue names with items for `tenant_id`.
    async fn list_queues(&self, tenant_id: &str) -> Result<Vec<String>, SchedulerError>;

    /// Up to `limit` queued items with `id > gt_id`, ascending by id.
    async fn list_queue_items(
        &self,
        tenant_id: &str,
        queue: &str,
        gt_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, SchedulerError>;

    /// Current status of each step run. Unknown ids are absent.
    async fn step_run_statuses(
        &self,
        tenant_id: &str,
        step_run_ids: &[String],
    ) -> Result<HashMap<String, StepRunStatus>, SchedulerError>;

    /// Remove items from the queue without assigning them.
    async fn cancel_queue_items(&self, item_ids: &[i64]) -> Result<(), SchedulerError>;

    /// Apply `batch` in a single transaction and return the step run ids
    /// that actually transitioned to assigned.
    async fn commit_assignments(
        &self,
        tenant_id: &str,
        batch: &CommitBatch,
    ) -> Result<Vec<String>, SchedulerError>;

    /// Smallest id still queued, if any.
    async fn min_unprocessed_queue_item_id(
        &self,
        tenant_id: &str,
        queue: &str,
    ) -> Result<Option<i64>, SchedulerError>;
}

/// Result of one listing call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBatch {
    /// Valid items, ascending by id.
    pub items: Vec<QueueItem>,
    /// Rows the store returned, pruned ones included.
    pub listed: usize,
}

impl QueueBatch {
    /// Rows cancelled as duplicated or stale.
    pub fn pruned(&self) -> usize {
        self.listed - self.items.len()
    }
}

/// Restores a queue's listing cursor on drop unless released.
///
/// Held across list, assign and commit so that an error, a timeout or a
/// cancellation between listing and commit lets the next cycle list the
/// same items again.
#[must_use = "dropping the guard restores the cursor immediately"]
pub struct CursorGuard {
    cursor: Arc<RwLock<Option<i64>>>,
    restore_to: Option<i64>,
    armed: bool,
}

impl CursorGuard {
    /// Keep the cursor where it is now.
    pub fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!(restore_to = ?self.restore_to, "cycle aborted, rewinding queue cursor");
            // a post-commit refresh may have moved it lower meanwhile
            let mut cursor = self.cursor.write();
            *cursor = (*cursor).min(self.restore_to);
        }
    }
}

/// Per `(tenant, queue)` handle over the queue repository.
pub struct TenantQueue {
    tenant_id: String,
    queue: String,
    store: Arc<dyn QueueRepository>,
    events: Arc<dyn EventSink>,
    rate_limits: RateLimitResolver,
    cursor: Arc<RwLock<Option<i64>>>,
}

impl TenantQueue {
    /// Create a queue handle. `no_limit_ttl` bounds how long a step is
    /// remembered as having no rate limit.
    pub fn new(
        tenant_id: impl Into<String>,
        queue: impl Into<String>,
        store: Arc<dyn QueueRepository>,
        rate_limits: Arc<dyn RateLimitRepository>,
        events: Arc<dyn EventSink>,
        no_limit_ttl: Duration,
    ) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            rate_limits: RateLimitResolver::new(
                tenant_id.clone(),
                rate_limits,
                Arc::clone(&events),
                no_limit_ttl,
            ),
            tenant_id,
            queue: queue.into(),
            store,
            events,
            cursor: Arc::new(RwLock::new(None)),
        }
    }

    /// Tenant id.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Queue name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Listing resumes after this id.
    pub fn cursor(&self) -> Option<i64> {
        *self.cursor.read()
    }

    /// Capture the cursor so it can be restored if the cycle that follows
    /// fails before its commit.
    pub fn cursor_guard(&self) -> CursorGuard {
        CursorGuard {
            cursor: Arc::clone(&self.cursor),
            restore_to: self.cursor(),
            armed: true,
        }
    }

    /// List up to `limit` valid items past the cursor.
    ///
    /// Duplicated step runs (all but the first occurrence) and step runs in a
    /// terminal status are cancelled out of the queue and left out of the
    /// result.
    pub async fn list_queue_items(&self, limit: usize) -> Result<Vec<QueueItem>, SchedulerError> {
        Ok(self.list_queue_batch(limit).await?.items)
    }

    /// Like [`Self::list_queue_items`], also reporting how many rows the
    /// store returned before pruning. The cursor is left where it was when
    /// pruning fails.
    pub async fn list_queue_batch(&self, limit: usize) -> Result<QueueBatch, SchedulerError> {
        let guard = self.cursor_guard();
        let gt_id = guard.restore_to;
        let items = self
            .store
            .list_queue_items(&self.tenant_id, &self.queue, gt_id, limit)
            .await?;

        let listed = items.len();
        let Some(last) = items.last() else {
            guard.release();
            return Ok(QueueBatch { items, listed });
        };
        {
            let mut cursor = self.cursor.write();
            if cursor.is_none_or(|c| c < last.id) {
                *cursor = Some(last.id);
            }
        }

        let items = self.prune_invalid(items).await?;
        guard.release();
        Ok(QueueBatch { items, listed })
    }

    async fn prune_invalid(&self, items: Vec<QueueItem>) -> Result<Vec<QueueItem>, SchedulerError> {
        let step_run_ids: Vec<String> = items
            .iter()
            .map(|i| i.step_run_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let statuses = self
            .store
            .step_run_statuses(&self.tenant_id, &step_run_ids)
            .await?;

        let mut seen: HashSet<&str> = HashSet::with_capacity(items.len());
        let mut invalid: Vec<i64> = Vec::new();
        let mut valid_ids: HashSet<i64> = HashSet::with_capacity(items.len());

        for item in &items {
            if !seen.insert(item.step_run_id.as_str()) {
                debug!(tenant_id = %self.tenant_id, queue = %self.queue, step_run_id = %item.step_run_id, "duplicate queue item");
                invalid.push(item.id);
                continue;
            }
            match statuses.get(&item.step_run_id) {
                Some(status) if !status.is_final() => {
                    valid_ids.insert(item.id);
                }
                status => {
                    debug!(
                        tenant_id = %self.tenant_id,
                        queue = %self.queue,
                        step_run_id = %item.step_run_id,
                        ?status,
                        "stale queue item"
                    );
                    invalid.push(item.id);
                }
            }
        }

        if !invalid.is_empty() {
            self.store.cancel_queue_items(&invalid).await?;
            debug!(tenant_id = %self.tenant_id, queue = %self.queue, count = invalid.len(), "cancelled invalid queue items");
        }

        Ok(items.into_iter().filter(|i| valid_ids.contains(&i.id)).collect())
    }

    /// Rate-limit units each step run needs: `step_run_id -> key -> units`.
    pub async fn get_step_run_rate_limits(
        &self,
        items: &[QueueItem],
    ) -> Result<StepRunRateLimits, SchedulerError> {
        self.rate_limits.resolve(items).await
    }

    /// Commit an assignment round.
    ///
    /// Timed-out step runs move to cancelling, assigned ones move to
    /// assigned, and both leave the queue, all in one transaction.
    /// Assignments the store did not apply come back in
    /// [`ProcessedResults::failed`]. The cursor refresh and diagnostic
    /// events run after the commit and never affect its result.
    pub async fn mark_queue_items_processed(
        &self,
        results: AssignResults,
    ) -> Result<ProcessedResults, SchedulerError> {
        let batch = CommitBatch {
            timed_out_step_run_ids: results
                .scheduling_timed_out
                .iter()
                .map(|i| i.step_run_id.clone())
                .collect(),
            assignments: results
                .assigned
                .iter()
                .map(|a| (a.queue_item.step_run_id.clone(), a.worker_id.clone()))
                .collect(),
            processed_item_ids: results
                .assigned
                .iter()
                .map(|a| a.queue_item.id)
                .chain(results.scheduling_timed_out.iter().map(|i| i.id))
                .collect(),
        };

        let applied: HashSet<String> = if batch.processed_item_ids.is_empty() {
            HashSet::new()
        } else {
            self.store
                .commit_assignments(&self.tenant_id, &batch)
                .await?
                .into_iter()
                .collect()
        };

        let (succeeded, failed): (Vec<AssignedItem>, Vec<AssignedItem>) = results
            .assigned
            .iter()
            .cloned()
            .partition(|a| applied.contains(&a.queue_item.step_run_id));

        if !failed.is_empty() {
            warn!(
                tenant_id = %self.tenant_id,
                queue = %self.queue,
                count = failed.len(),
                "assignments not applied, step runs changed concurrently"
            );
        }

        self.spawn_post_commit(&succeeded, &results);

        Ok(ProcessedResults { succeeded, failed })
    }

    fn spawn_post_commit(&self, succeeded: &[AssignedItem], results: &AssignResults) {
        let events = self.outcome_events(succeeded, results);
        let sink = Arc::clone(&self.events);
        let store = Arc::clone(&self.store);
        let cursor = Arc::clone(&self.cursor);
        let tenant_id = self.tenant_id.clone();
        let queue = self.queue.clone();

        tokio::spawn(async move {
            if let Err(e) = refresh_cursor(store.as_ref(), &cursor, &tenant_id, &queue).await {
                warn!(%tenant_id, %queue, error = %e, "failed to refresh queue cursor");
            }
            if !events.is_empty() {
                sink.emit(events);
            }
        });
    }

    fn outcome_events(&self, succeeded: &[AssignedItem], results: &AssignResults) -> Vec<DiagnosticEvent> {
        let assigned = succeeded.iter().map(|a| {
            DiagnosticEvent::new(
                &self.tenant_id,
                &a.queue_item.step_run_id,
                EventReason::Assigned,
                EventSeverity::Info,
                format!("assigned to worker {}", a.worker_id),
            )
        });
        let unassigned = results.unassigned.iter().map(|i| {
            DiagnosticEvent::new(
                &self.tenant_id,
                &i.step_run_id,
                EventReason::RequeuedNoWorker,
                EventSeverity::Warning,
                "no worker available, requeued",
            )
        });
        let rate_limited = results.rate_limited.iter().map(|r| {
            DiagnosticEvent::new(
                &self.tenant_id,
                &r.queue_item.step_run_id,
                EventReason::RequeuedRateLimit,
                EventSeverity::Warning,
                format!(
                    "rate limit `{}` exceeded: needs {} units, {} left",
                    r.exceeded_key, r.exceeded_units, r.exceeded_value
                ),
            )
        });
        assigned.chain(unassigned).chain(rate_limited).collect()
    }

    /// Move the cursor to just before the smallest still-queued id.
    pub async fn refresh_cursor(&self) -> Result<(), SchedulerError> {
        refresh_cursor(self.store.as_ref(), &self.cursor, &self.tenant_id, &self.queue).await
    }
}

async fn refresh_cursor(
    store: &dyn QueueRepository,
    cursor: &RwLock<Option<i64>>,
    tenant_id: &str,
    queue: &str,
) -> Result<(), SchedulerError> {
    if let Some(min_id) = store.min_unprocessed_queue_item_id(tenant_id, queue).await? {
        *cursor.write() = Some(min_id - 1);
    }
    Ok(())
}
