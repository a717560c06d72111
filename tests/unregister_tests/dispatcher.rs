//! Integration tests for the dispatcher driving the reconciler
//!
//! These stories run the full worker pool against the in-memory cluster with
//! tokio's clock paused, so requeue delays elapse instantly while keeping
//! their order.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use unregistrar::backoff::BackoffTracker;
use unregistrar::controller::{reconcile, Context};
use unregistrar::crd::ResourceKey;
use unregistrar::dispatcher::{Dispatcher, DispatcherConfig, WorkQueue};
use unregistrar::events::reasons;
use unregistrar::retry::RetryConfig;

use super::fake_cluster::{Call, FakeCluster, Op, RecordedEvents};

// =============================================================================
// Test Fixtures
// =============================================================================

struct Running {
    cluster: Arc<FakeCluster>,
    events: Arc<RecordedEvents>,
    queue: Arc<WorkQueue<ResourceKey>>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

fn start(cluster: Arc<FakeCluster>, workers: usize) -> Running {
    let events = Arc::new(RecordedEvents::default());
    let shutdown = CancellationToken::new();
    let ctx = Arc::new(
        Context::new(Arc::clone(&cluster) as _, Arc::clone(&events) as _)
            .with_backoff(BackoffTracker::new(Duration::from_millis(100)))
            .with_conflict_retry(RetryConfig {
                jitter: 0.0,
                ..RetryConfig::conflict()
            })
            .with_shutdown(shutdown.clone()),
    );

    let dispatcher = Dispatcher::new(DispatcherConfig::with_max_workers(workers));
    let queue = dispatcher.queue();
    let handle = tokio::spawn(dispatcher.run(
        move |key| reconcile(key, Arc::clone(&ctx)),
        shutdown.clone(),
    ));

    Running {
        cluster,
        events,
        queue,
        shutdown,
        handle,
    }
}

impl Running {
    async fn wait_until(&self, what: &str, done: impl Fn(&FakeCluster) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(600), async {
            while !done(&self.cluster) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(30), self.handle)
            .await
            .expect("dispatcher stops after shutdown")
            .expect("dispatcher task does not panic");
    }
}

fn unregistered(key: &ResourceKey) -> impl Fn(&FakeCluster) -> bool + '_ {
    move |cluster| cluster.status(key).is_some_and(|s| s.unregistered)
}

// =============================================================================
// Dispatcher Stories
// =============================================================================

/// Story: A batch of requests is drained by a small pool
///
/// One request fails twice before succeeding. The dispatcher requeues it
/// with growing delays while the others finish, and every volume is
/// protected before it is deleted.
#[tokio::test(start_paused = true)]
async fn story_batch_drains_with_one_flaky_request() {
    let cluster = FakeCluster::new();
    let keys: Vec<ResourceKey> = (0..5)
        .map(|i| cluster.seed("team-a", &format!("uv{i}"), &format!("pvc{i}"), &format!("pv{i}")))
        .collect();
    cluster.fail(Op::ReplaceVolume, "pv0", 2);

    let running = start(cluster, 2);
    for key in &keys {
        running.queue.add(key.clone());
    }

    for key in &keys {
        running.wait_until("request to finish", unregistered(key)).await;
    }

    for i in 0..5 {
        assert!(!running.cluster.has_claim("team-a", &format!("pvc{i}")));
        assert!(!running.cluster.has_volume(&format!("pv{i}")));
    }
    assert_eq!(
        running.events.reasons_for("uv0"),
        vec![
            reasons::UNREGISTER_FAILED.to_string(),
            reasons::UNREGISTER_FAILED.to_string(),
            reasons::UNREGISTER_SUCCEEDED.to_string(),
        ]
    );

    let calls = running.cluster.calls();
    for i in 0..5 {
        let protect = calls.iter().position(|c| {
            matches!(c, Call::SetReclaimPolicy { volume, .. } if *volume == format!("pv{i}"))
        });
        let delete = calls.iter().position(
            |c| matches!(c, Call::DeleteClaim { name, .. } if *name == format!("pvc{i}")),
        );
        assert!(protect.is_some() && protect < delete, "pv{i} protected first");
    }

    running.stop().await;
}

/// Story: A request is announced many times while it is being worked on
///
/// The duplicates collapse, and the claim and volume are each deleted once.
#[tokio::test(start_paused = true)]
async fn repeated_notifications_delete_once() {
    let cluster = FakeCluster::new();
    let key = cluster.seed("team-a", "uv1", "pvc1", "pv-123");
    cluster.slow("pv-123", Duration::from_millis(50));

    let running = start(cluster, 4);
    for _ in 0..10 {
        running.queue.add(key.clone());
    }
    running.wait_until("request to finish", unregistered(&key)).await;
    for _ in 0..10 {
        running.queue.add(key.clone());
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let deletes = running
        .cluster
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::DeleteClaim { .. } | Call::DeleteVolume { .. }))
        .count();
    assert_eq!(deletes, 2);
    assert_eq!(
        running.events.reasons_for("uv1"),
        vec![reasons::UNREGISTER_SUCCEEDED.to_string()]
    );

    running.stop().await;
}

/// Story: The operator shuts down while a request is still backing off
///
/// The pending requeue is dropped and the pool stops without finishing it.
#[tokio::test(start_paused = true)]
async fn shutdown_drops_pending_requeues() {
    let cluster = FakeCluster::new();
    let key = cluster.seed("team-a", "uv1", "pvc1", "pv-123");
    cluster.fail(Op::ReplaceVolume, "pv-123", u32::MAX);

    let running = start(cluster, 1);
    running.queue.add(key.clone());
    running
        .wait_until("first failure", |c| {
            c.status(&key).is_some_and(|s| !s.error.is_empty())
        })
        .await;

    let cluster = Arc::clone(&running.cluster);
    running.stop().await;

    assert!(cluster.has_claim("team-a", "pvc1"));
    assert!(cluster.has_volume("pv-123"));
}
