//! Integration tests for single reconciliations
//!
//! Each story seeds the in-memory cluster, runs the reconciler one attempt at
//! a time and inspects what reached the cluster. Crash stories fail one step,
//! then show the next attempt converging on the same end state an
//! uninterrupted run would have reached.

use std::sync::Arc;
use std::time::Duration;

use unregistrar::controller::{reconcile, MISSING_PVC_NAME};
use unregistrar::crd::{ResourceKey, UnregisterVolumeStatus};
use unregistrar::dispatcher::Outcome;
use unregistrar::events::reasons;

use super::fake_cluster::{context, Call, FakeCluster, Op, RecordedEvents};

// =============================================================================
// Test Fixtures
// =============================================================================

const MIN: Duration = Duration::from_secs(1);

struct Harness {
    cluster: Arc<FakeCluster>,
    events: Arc<RecordedEvents>,
    ctx: Arc<unregistrar::controller::Context>,
}

impl Harness {
    fn new() -> Self {
        let cluster = FakeCluster::new();
        let events = Arc::new(RecordedEvents::default());
        let ctx = context(Arc::clone(&cluster), Arc::clone(&events));
        Self {
            cluster,
            events,
            ctx,
        }
    }

    async fn reconcile(&self, key: &ResourceKey) -> Outcome {
        reconcile(key.clone(), Arc::clone(&self.ctx)).await
    }

    fn mutations(&self) -> Vec<Call> {
        self.cluster
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::UpdateStatus { .. }))
            .collect()
    }

    fn assert_unregistered(&self, key: &ResourceKey, namespace: &str, pvc: &str, pv: &str) {
        assert!(!self.cluster.has_claim(namespace, pvc));
        assert!(!self.cluster.has_volume(pv));
        let status = self.cluster.status(key).expect("status written");
        assert!(status.unregistered);
        assert!(status.error.is_empty(), "{}", status.error);
        assert_eq!(
            status.resolved.map(|r| r.volume_name).as_deref(),
            Some(pv)
        );
        assert!(!self.ctx.backoff.contains(key));
    }
}

fn retain(pv: &str) -> Call {
    Call::SetReclaimPolicy {
        volume: pv.to_string(),
        policy: "Retain".to_string(),
    }
}

fn delete_claim(namespace: &str, pvc: &str) -> Call {
    Call::DeleteClaim {
        namespace: namespace.to_string(),
        name: pvc.to_string(),
    }
}

fn delete_volume(pv: &str) -> Call {
    Call::DeleteVolume {
        name: pv.to_string(),
    }
}

// =============================================================================
// Happy Path Stories
// =============================================================================

/// Story: An administrator unregisters a bound claim
///
/// The volume is switched to Retain first, then the claim and the volume are
/// deleted, and the request is marked unregistered with a success event. A
/// second pass over the finished request does nothing at all.
#[tokio::test]
async fn story_unregister_bound_claim_then_noop() {
    let h = Harness::new();
    let key = h.cluster.seed("team-a", "uv1", "pvc1", "pv-123");

    assert_eq!(h.reconcile(&key).await, Outcome::Done);

    assert_eq!(
        h.mutations(),
        vec![
            retain("pv-123"),
            delete_claim("team-a", "pvc1"),
            delete_volume("pv-123"),
        ]
    );
    h.assert_unregistered(&key, "team-a", "pvc1", "pv-123");
    assert_eq!(
        h.events.reasons_for("uv1"),
        vec![reasons::UNREGISTER_SUCCEEDED.to_string()]
    );

    let before = h.cluster.calls().len();
    assert_eq!(h.reconcile(&key).await, Outcome::Done);
    assert_eq!(h.cluster.calls().len(), before);
    assert_eq!(h.events.reasons_for("uv1").len(), 1);
}

/// Story: A request deleted before it was ever processed is simply dropped
#[tokio::test]
async fn deleted_request_is_done_without_side_effects() {
    let h = Harness::new();
    let key = ResourceKey::new("team-a", "gone");

    assert_eq!(h.reconcile(&key).await, Outcome::Done);
    assert!(h.cluster.calls().is_empty());
    assert!(!h.ctx.backoff.contains(&key));
}

// =============================================================================
// Crash and Resume Stories
// =============================================================================

/// Story: The reclaim policy update fails; nothing is deleted
///
/// The claim and volume stay exactly as they were, the failure is recorded
/// on the request, and the next attempt completes the whole workflow.
#[tokio::test]
async fn crash_before_protect_deletes_nothing() {
    let h = Harness::new();
    let key = h.cluster.seed("team-a", "uv1", "pvc1", "pv-123");
    h.cluster.fail(Op::ReplaceVolume, "pv-123", 1);

    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN));
    assert!(h.mutations().is_empty());
    assert!(h.cluster.has_claim("team-a", "pvc1"));
    assert!(h.cluster.has_volume("pv-123"));
    let status = h.cluster.status(&key).expect("failure recorded");
    assert!(!status.unregistered);
    assert!(status.error.contains("Retain"), "{}", status.error);
    assert_eq!(
        h.events.reasons_for("uv1"),
        vec![reasons::UNREGISTER_FAILED.to_string()]
    );

    assert_eq!(h.reconcile(&key).await, Outcome::Done);
    h.assert_unregistered(&key, "team-a", "pvc1", "pv-123");
}

/// Story: The controller crashes after protecting the volume
///
/// The retry sees the policy already at Retain and skips the write.
#[tokio::test]
async fn crash_after_protect_does_not_rewrite_policy() {
    let h = Harness::new();
    let key = h.cluster.seed("team-a", "uv1", "pvc1", "pv-123");
    h.cluster.fail(Op::DeleteClaim, "pvc1", 1);

    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN));
    assert_eq!(h.mutations(), vec![retain("pv-123")]);

    assert_eq!(h.reconcile(&key).await, Outcome::Done);
    assert_eq!(
        h.mutations(),
        vec![
            retain("pv-123"),
            delete_claim("team-a", "pvc1"),
            delete_volume("pv-123"),
        ]
    );
    h.assert_unregistered(&key, "team-a", "pvc1", "pv-123");
}

/// Story: The claim is already gone when the controller comes back
///
/// The volume is found through its claimRef, and the retry finishes by
/// deleting it.
#[tokio::test]
async fn crash_after_claim_delete_resumes_through_claim_ref() {
    let h = Harness::new();
    let key = h.cluster.seed("team-a", "uv1", "pvc1", "pv-123");
    h.cluster.fail(Op::DeleteVolume, "pv-123", 1);

    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN));
    assert!(!h.cluster.has_claim("team-a", "pvc1"));
    assert!(h.cluster.has_volume("pv-123"));

    assert_eq!(h.reconcile(&key).await, Outcome::Done);
    assert_eq!(
        h.mutations(),
        vec![
            retain("pv-123"),
            delete_claim("team-a", "pvc1"),
            delete_volume("pv-123"),
        ]
    );
    h.assert_unregistered(&key, "team-a", "pvc1", "pv-123");
}

/// Story: Someone edits the request while the controller writes its status
///
/// The conflicting write is retried against a fresh read and lands.
#[tokio::test]
async fn conflicting_status_write_is_retried() {
    let h = Harness::new();
    let key = h.cluster.seed("team-a", "uv1", "pvc1", "pv-123");
    h.cluster.conflict(Op::UpdateStatus, "uv1", 1);

    assert_eq!(h.reconcile(&key).await, Outcome::Done);
    h.assert_unregistered(&key, "team-a", "pvc1", "pv-123");
}

/// Story: The controller stops after both deletes, before marking the request
///
/// The failed write is reported in status. Neither the claim nor the volume
/// can be found on the next attempt, and the volume name recorded before the
/// deletes shows the work is already done.
#[tokio::test]
async fn crash_before_final_status_converges() {
    let h = Harness::new();
    let key = h.cluster.seed("team-a", "uv1", "pvc1", "pv-123");
    // the first status write records the volume; fail the one after it
    h.cluster.fail_after(Op::UpdateStatus, "uv1", 1, 1);

    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN));
    assert!(!h.cluster.has_claim("team-a", "pvc1"));
    assert!(!h.cluster.has_volume("pv-123"));
    let status = h.cluster.status(&key).expect("failure recorded");
    assert!(!status.unregistered);
    assert!(
        status.error.starts_with("Failed to record unregistered status"),
        "{}",
        status.error
    );
    assert!(status.resolved.is_some());
    assert_eq!(
        h.events.reasons_for("uv1"),
        vec![reasons::UNREGISTER_FAILED.to_string()]
    );

    assert_eq!(h.reconcile(&key).await, Outcome::Done);
    assert_eq!(
        h.mutations(),
        vec![
            retain("pv-123"),
            delete_claim("team-a", "pvc1"),
            delete_volume("pv-123"),
        ]
    );
    h.assert_unregistered(&key, "team-a", "pvc1", "pv-123");
}

/// Story: The volume keeps changing under the controller
///
/// A couple of conflicts on the policy update are absorbed within the same
/// attempt.
#[tokio::test]
async fn transient_volume_conflicts_are_absorbed() {
    let h = Harness::new();
    let key = h.cluster.seed("team-a", "uv1", "pvc1", "pv-123");
    h.cluster.conflict(Op::ReplaceVolume, "pv-123", 2);

    assert_eq!(h.reconcile(&key).await, Outcome::Done);
    h.assert_unregistered(&key, "team-a", "pvc1", "pv-123");
}

// =============================================================================
// Failure Stories
// =============================================================================

/// Story: A request without a claim name is rejected on every attempt
///
/// Nothing outside the request is touched, and each attempt waits twice as
/// long as the one before.
#[tokio::test]
async fn missing_claim_name_backs_off() {
    let h = Harness::new();
    let key = h.cluster.seed_request("team-a", "empty", "");

    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN));
    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN * 2));
    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN * 4));

    assert!(h.mutations().is_empty());
    assert_eq!(
        h.cluster.status(&key),
        Some(UnregisterVolumeStatus::failed(MISSING_PVC_NAME))
    );
}

/// Story: The claim never existed
#[tokio::test]
async fn unknown_claim_is_reported() {
    let h = Harness::new();
    let key = h.cluster.seed_request("team-a", "uv1", "ghost");

    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN));
    let status = h.cluster.status(&key).expect("failure recorded");
    assert!(status.error.contains("Unable to get PVC"), "{}", status.error);
    assert!(h.mutations().is_empty());
}

/// Story: The request is deleted while it is backing off
///
/// Its backoff entry is dropped along with it.
#[tokio::test]
async fn request_deleted_during_backoff_is_forgotten() {
    let h = Harness::new();
    let key = h.cluster.seed("team-a", "uv1", "pvc1", "pv-123");
    h.cluster.fail(Op::ReplaceVolume, "pv-123", 1);

    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN));
    assert!(h.ctx.backoff.contains(&key));

    h.cluster.remove_request(&key);
    assert_eq!(h.reconcile(&key).await, Outcome::Done);
    assert!(!h.ctx.backoff.contains(&key));
}

/// Story: The API server drops a few reads
///
/// Each failed read costs one attempt and doubles the wait before the next.
#[tokio::test]
async fn transient_read_failures_requeue_then_finish() {
    let h = Harness::new();
    let key = h.cluster.seed("team-a", "uv1", "pvc1", "pv-123");
    h.cluster.fail(Op::GetRequest, "uv1", 1);
    h.cluster.fail(Op::GetClaim, "pvc1", 1);
    h.cluster.fail(Op::GetVolume, "pv-123", 1);

    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN));
    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN * 2));
    assert_eq!(h.reconcile(&key).await, Outcome::RequeueAfter(MIN * 4));
    assert!(h.mutations().is_empty());

    assert_eq!(h.reconcile(&key).await, Outcome::Done);
    h.assert_unregistered(&key, "team-a", "pvc1", "pv-123");
}

/// Story: One broken request does not hold up another
#[tokio::test]
async fn failures_are_isolated_per_request() {
    let h = Harness::new();
    let broken = h.cluster.seed("team-a", "broken", "pvc-a", "pv-a");
    let healthy = h.cluster.seed("team-b", "healthy", "pvc-b", "pv-b");
    h.cluster.fail(Op::ReplaceVolume, "pv-a", u32::MAX);

    assert_eq!(h.reconcile(&broken).await, Outcome::RequeueAfter(MIN));
    assert_eq!(h.reconcile(&broken).await, Outcome::RequeueAfter(MIN * 2));
    assert_eq!(h.reconcile(&healthy).await, Outcome::Done);

    h.assert_unregistered(&healthy, "team-b", "pvc-b", "pv-b");
    assert!(h.cluster.has_claim("team-a", "pvc-a"));
    assert_eq!(h.ctx.backoff.get(&broken), Some(MIN * 4));
    assert!(!h.ctx.backoff.contains(&healthy));
}
