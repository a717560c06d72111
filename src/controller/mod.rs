//! Reconciliation of UnregisterVolume resources
//!
//! One call to [`reconcile`] is one attempt for one resource key: load the
//! request, run the workflow from the top, write status, emit an event, and
//! tell the dispatcher whether to requeue. Every failure is absorbed here and
//! turned into a status message plus a requeue; nothing escapes to the worker.

pub mod client;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub use client::{KubeVolumeClient, VolumeClient, FIELD_MANAGER};
pub use workflow::{Step, StepFailure, Unregistered, Workflow, MISSING_PVC_NAME};

use crate::backoff::BackoffTracker;
use crate::crd::{ResourceKey, UnregisterVolume, UnregisterVolumeStatus};
use crate::dispatcher::Outcome;
use crate::events::{actions, reasons, EventPublisher};
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::Error;

/// Shared state for every reconciliation
///
/// Built once by the binary and handed to each worker behind an `Arc`.
///
/// ```ignore
/// let ctx = Context::new(Arc::new(KubeVolumeClient::new(client.clone())), events)
///     .with_backoff(BackoffTracker::default().with_max_delay(Duration::from_secs(300)))
///     .with_shutdown(token.clone());
/// ```
pub struct Context {
    /// Cluster access (trait object for testability)
    pub client: Arc<dyn VolumeClient>,
    /// Event sink for success and failure events
    pub events: Arc<dyn EventPublisher>,
    /// Per-key requeue delays
    pub backoff: Arc<BackoffTracker>,
    /// Retry policy for the reclaim-policy update
    pub conflict_retry: RetryConfig,
    /// Process-wide shutdown signal, checked between workflow steps
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a context with default backoff and conflict-retry policies
    pub fn new(client: Arc<dyn VolumeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            client,
            events,
            backoff: Arc::new(BackoffTracker::default()),
            conflict_retry: RetryConfig::conflict(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use `backoff` for requeue delays
    pub fn with_backoff(mut self, backoff: BackoffTracker) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Override the conflict-retry policy
    pub fn with_conflict_retry(mut self, retry: RetryConfig) -> Self {
        self.conflict_retry = retry;
        self
    }

    /// Observe `token` for shutdown
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }
}

/// Reconcile the UnregisterVolume identified by `key`
///
/// Returns [`Outcome::Done`] when the request no longer needs attention
/// (deleted, already unregistered, or just completed) and
/// [`Outcome::RequeueAfter`] with the key's backoff delay otherwise.
#[instrument(skip_all, fields(request = %key))]
pub async fn reconcile(key: ResourceKey, ctx: Arc<Context>) -> Outcome {
    let request = match ctx.client.get_request(&key).await {
        Ok(request) => request,
        Err(e) if e.is_not_found() => {
            debug!("request no longer exists");
            ctx.backoff.forget(&key);
            return Outcome::Done;
        }
        Err(e) => {
            warn!(error = %e, "failed to read request");
            let delay = ctx.backoff.get_or_init(&key);
            ctx.backoff.double(&key);
            return Outcome::RequeueAfter(delay);
        }
    };

    if request.is_unregistered() {
        debug!("request already unregistered");
        ctx.backoff.forget(&key);
        return Outcome::Done;
    }

    let delay = ctx.backoff.get_or_init(&key);
    let workflow = Workflow::new(ctx.client.as_ref(), &ctx.conflict_retry, &ctx.shutdown);

    match workflow.run(&request).await {
        Ok(done) => finish(&key, &request, &done, &ctx, delay).await,
        Err(StepFailure {
            source: Error::Cancelled,
            step,
            ..
        }) => {
            info!(%step, "shutdown requested, abandoning attempt");
            Outcome::RequeueAfter(delay)
        }
        Err(failure) => {
            warn!(
                step = %failure.step,
                error = %failure.source,
                delay_ms = delay.as_millis() as u64,
                "unregister attempt failed"
            );
            record_failure(&key, &request, &failure.message, &ctx).await;
            Outcome::RequeueAfter(delay)
        }
    }
}

async fn finish(
    key: &ResourceKey,
    request: &UnregisterVolume,
    done: &Unregistered,
    ctx: &Context,
    delay: Duration,
) -> Outcome {
    let client = ctx.client.as_ref();
    let marked = retry_on_conflict(&ctx.conflict_retry, "mark-unregistered", move || async move {
        let current = client.get_request(key).await?;
        client
            .update_request_status(&current, &UnregisterVolumeStatus::succeeded())
            .await
    })
    .await;

    if let Err(e) = marked {
        error!(error = %e, "workflow finished but status update failed");
        record_failure(
            key,
            request,
            &format!("Failed to record unregistered status: {e}"),
            ctx,
        )
        .await;
        return Outcome::RequeueAfter(delay);
    }

    info!(
        claim = %done.claim,
        volume = %done.volume,
        "volume unregistered"
    );
    publish(
        ctx,
        request,
        EventType::Normal,
        reasons::UNREGISTER_SUCCEEDED,
        format!(
            "Unregistered PV {:?} and PVC {:?} in namespace {:?}",
            done.volume, done.claim, done.namespace
        ),
    )
    .await;

    ctx.backoff.reset(key);
    ctx.backoff.forget(key);
    Outcome::Done
}

/// Persist `message` in status (best-effort), emit a warning, grow the backoff
///
/// The workflow may have written status during this attempt, so the request
/// is read again before the conditional write.
async fn record_failure(
    key: &ResourceKey,
    request: &UnregisterVolume,
    message: &str,
    ctx: &Context,
) {
    let client = ctx.client.as_ref();
    let status = UnregisterVolumeStatus::failed(message);
    let status = &status;
    let recorded = retry_on_conflict(&ctx.conflict_retry, "record-failure", move || async move {
        let current = client.get_request(key).await?;
        client.update_request_status(&current, status).await
    })
    .await;

    if let Err(e) = recorded {
        warn!(error = %e, "failed to record error in status");
    }

    publish(
        ctx,
        request,
        EventType::Warning,
        reasons::UNREGISTER_FAILED,
        message.to_string(),
    )
    .await;

    let next = ctx.backoff.double(key);
    debug!(next_delay_ms = next.as_millis() as u64, "backoff increased");
}

async fn publish(
    ctx: &Context,
    request: &UnregisterVolume,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let reference: ObjectReference = request.object_ref(&());
    ctx.events
        .publish(&reference, type_, reason, actions::UNREGISTER, Some(note))
        .await;
}
