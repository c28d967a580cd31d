//! Integration tests for lease acquisition, extension and release
//!
//! These tests validate:
//! - Concurrent acquirers never both hold a live lease on one resource
//! - Extension requires presenting the held lease id
//! - Expired leases can be taken over
//! - LeaseKeeper renews, drops vanished resources and releases on shutdown

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use prometheus_scheduler_core::builders::build_lease_manager;
use prometheus_scheduler_core::config::SchedulerConfig;
use prometheus_scheduler_core::core::{
    LeaseConfig, LeaseKeeper, LeaseKind, LeaseManager, LeaseRepository, MembershipSource, SchedulerError,
};
use prometheus_scheduler_core::infra::InMemoryStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// HELPERS
// ============================================================================

fn manager(store: &Arc<InMemoryStore>, ttl: Duration) -> Arc<LeaseManager> {
    Arc::new(LeaseManager::new(
        Arc::clone(store) as Arc<dyn LeaseRepository>,
        LeaseConfig {
            ttl,
            renew_interval: ttl / 4,
        },
    ))
}

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

#[derive(Default)]
struct Candidates {
    ids: Mutex<Vec<String>>,
}

impl Candidates {
    fn set(&self, names: &[&str]) {
        *self.ids.lock() = ids(names);
    }
}

#[async_trait]
impl MembershipSource for Candidates {
    async fn list_resource_ids(&self) -> Result<Vec<String>, SchedulerError> {
        Ok(self.ids.lock().clone())
    }
}

// ============================================================================
// LEASE MANAGER
// ============================================================================

#[tokio::test]
async fn test_concurrent_acquire_grants_each_resource_once() {
    let store = Arc::new(InMemoryStore::new());
    let resources = ids(&["q1", "q2", "q3", "q4"]);

    let acquirers: Vec<_> = (0..8)
        .map(|_| {
            let mgr = manager(&store, Duration::from_secs(30));
            let resources = resources.clone();
            tokio::spawn(async move {
                mgr.acquire_or_extend("t1", LeaseKind::Queue, &resources, &[])
                    .await
                    .unwrap()
            })
        })
        .collect();

    let granted: Vec<_> = join_all(acquirers)
        .await
        .into_iter()
        .flat_map(Result::unwrap)
        .collect();

    assert_eq!(granted.len(), 4);
    let held: HashSet<&str> = granted.iter().map(|l| l.resource_id.as_str()).collect();
    assert_eq!(held.len(), 4);
}

#[tokio::test]
async fn test_extend_requires_holding_the_lease() {
    let store = Arc::new(InMemoryStore::new());
    let mgr = manager(&store, Duration::from_secs(30));
    let resources = ids(&["w1"]);

    let first = mgr
        .acquire_or_extend("t1", LeaseKind::Worker, &resources, &[])
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    // another replica without the lease id gets nothing
    let other = mgr
        .acquire_or_extend("t1", LeaseKind::Worker, &resources, &[])
        .await
        .unwrap();
    assert!(other.is_empty());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let extended = mgr
        .acquire_or_extend("t1", LeaseKind::Worker, &resources, &first)
        .await
        .unwrap();
    assert_eq!(extended.len(), 1);
    assert_eq!(extended[0].id, first[0].id);
    assert!(extended[0].expires_at > first[0].expires_at);
}

#[tokio::test]
async fn test_leases_are_scoped_by_kind_and_tenant() {
    let store = Arc::new(InMemoryStore::new());
    let mgr = manager(&store, Duration::from_secs(30));
    let resources = ids(&["r1"]);

    let a = mgr.acquire_or_extend("t1", LeaseKind::Queue, &resources, &[]).await.unwrap();
    let b = mgr.acquire_or_extend("t1", LeaseKind::Worker, &resources, &[]).await.unwrap();
    let c = mgr.acquire_or_extend("t2", LeaseKind::Queue, &resources, &[]).await.unwrap();

    assert_eq!((a.len(), b.len(), c.len()), (1, 1, 1));
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let store = Arc::new(InMemoryStore::new());
    let short = manager(&store, Duration::from_millis(20));
    let resources = ids(&["q1"]);

    let old = short
        .acquire_or_extend("t1", LeaseKind::Queue, &resources, &[])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let taker = manager(&store, Duration::from_secs(30));
    let new = taker
        .acquire_or_extend("t1", LeaseKind::Queue, &resources, &[])
        .await
        .unwrap();
    assert_eq!(new.len(), 1);
    assert_ne!(new[0].id, old[0].id);

    // the previous holder can no longer extend
    let stale = short
        .acquire_or_extend("t1", LeaseKind::Queue, &resources, &old)
        .await
        .unwrap();
    assert!(stale.is_empty());
}

#[tokio::test]
async fn test_release_frees_resource_and_is_idempotent() {
    let store = Arc::new(InMemoryStore::new());
    let mgr = manager(&store, Duration::from_secs(30));
    let resources = ids(&["q1"]);

    let held = mgr.acquire_or_extend("t1", LeaseKind::Queue, &resources, &[]).await.unwrap();
    mgr.release(&held).await.unwrap();
    mgr.release(&held).await.unwrap();
    assert!(store.leases().is_empty());

    let again = mgr.acquire_or_extend("t1", LeaseKind::Queue, &resources, &[]).await.unwrap();
    assert_eq!(again.len(), 1);
}

#[tokio::test]
async fn test_build_lease_manager_uses_configured_ttl() {
    let store = Arc::new(InMemoryStore::new());
    let mut cfg = SchedulerConfig::default();
    cfg.lease.ttl_ms = 2_000;
    cfg.lease.renew_interval_ms = 500;

    let mgr = build_lease_manager(&cfg, store).unwrap();
    assert_eq!(mgr.config().ttl, Duration::from_secs(2));

    cfg.lease.renew_interval_ms = 5_000;
    let err = build_lease_manager(&cfg, Arc::new(InMemoryStore::new())).err().unwrap();
    assert!(matches!(err, SchedulerError::InvalidConfig(_)));
}

// ============================================================================
// LEASE KEEPER
// ============================================================================

#[tokio::test]
async fn test_keeper_tracks_candidates() {
    let store = Arc::new(InMemoryStore::new());
    let candidates = Arc::new(Candidates::default());
    candidates.set(&["q1", "q2"]);
    let keeper = LeaseKeeper::new(manager(&store, Duration::from_secs(30)), "t1", LeaseKind::Queue, candidates.clone());

    let held = keeper.tick().await.unwrap();
    assert_eq!(held.len(), 2);

    candidates.set(&["q2", "q3"]);
    let held = keeper.tick().await.unwrap();
    let names: HashSet<String> = held.iter().map(|l| l.resource_id.clone()).collect();
    assert_eq!(names, ["q2", "q3"].iter().map(|s| (*s).to_string()).collect());

    let stored: HashSet<String> = store.leases().into_iter().map(|l| l.resource_id).collect();
    assert!(!stored.contains("q1"));
}

#[tokio::test]
async fn test_keeper_releases_on_cancel() {
    let store = Arc::new(InMemoryStore::new());
    let candidates = Arc::new(Candidates::default());
    candidates.set(&["q1"]);
    let keeper = Arc::new(LeaseKeeper::new(
        manager(&store, Duration::from_millis(400)),
        "t1",
        LeaseKind::Queue,
        candidates,
    ));
    let mut updates = keeper.subscribe();

    let token = CancellationToken::new();
    let handle = keeper.start(token.clone());

    updates.changed().await.unwrap();
    assert_eq!(updates.borrow().len(), 1);
    assert_eq!(store.leases().len(), 1);

    token.cancel();
    handle.await.unwrap();
    assert!(keeper.held().is_empty());
    assert!(store.leases().is_empty());
}
