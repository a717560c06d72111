//! The unregister workflow
//!
//! Five steps, always run from the top on every attempt:
//!
//! 1. Validate the spec
//! 2. Resolve the claim to its bound volume
//! 3. Set the volume's reclaim policy to `Retain`
//! 4. Delete the claim
//! 5. Delete the volume
//!
//! There is no persisted cursor. Each step is safe to repeat: step 3 is a
//! conditional update that is skipped once the policy is already `Retain`, and
//! steps 4 and 5 treat "not found" as done. A crash between any two steps is
//! repaired by simply running the workflow again.
//!
//! Step 3 must finish before either delete is issued; with the policy at
//! `Retain` the storage backend detaches the volume instead of destroying it.
//! Step 3 also records the resolved volume in the request's status. When the
//! claim is already gone, step 2 finds the volume through its claimRef, and
//! when the volume is gone too the recorded name shows the deletes already
//! happened.

use std::fmt;

use k8s_openapi::api::core::v1::PersistentVolume;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::VolumeClient;
use crate::crd::{ResolvedVolume, UnregisterVolume, UnregisterVolumeStatus};
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::Error;

/// Reclaim policy that preserves the storage extent on volume deletion
pub const RECLAIM_RETAIN: &str = "Retain";

/// Status message recorded when `spec.pvcName` is empty
pub const MISSING_PVC_NAME: &str = "PVC name not specified in spec";

/// Position of an attempt in the unregister state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Checking the request spec
    Validating,
    /// Reading the claim and its bound volume
    Resolving,
    /// Setting the volume's reclaim policy to Retain
    Protecting,
    /// Deleting the claim
    ClaimDeleting,
    /// Deleting the volume
    VolumeDeleting,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validating => write!(f, "Validating"),
            Self::Resolving => write!(f, "Resolving"),
            Self::Protecting => write!(f, "Protecting"),
            Self::ClaimDeleting => write!(f, "ClaimDeleting"),
            Self::VolumeDeleting => write!(f, "VolumeDeleting"),
        }
    }
}

/// A workflow step that failed, with the status message to record
#[derive(Debug)]
pub struct StepFailure {
    /// Step that failed
    pub step: Step,
    /// Human-readable message for `status.error` and the warning event
    pub message: String,
    /// Underlying error
    pub source: Error,
}

impl StepFailure {
    fn new(step: Step, message: impl Into<String>, source: Error) -> Self {
        Self {
            step,
            message: message.into(),
            source,
        }
    }
}

/// Objects touched by a completed workflow run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unregistered {
    /// Namespace of the claim
    pub namespace: String,
    /// Deleted claim
    pub claim: String,
    /// Deleted volume
    pub volume: String,
}

enum Resolution {
    /// The volume still exists and must be protected and deleted
    Present(String),
    /// An earlier attempt deleted both the claim and this volume
    Deleted(String),
}

/// Executes the workflow for one request
pub struct Workflow<'a> {
    client: &'a dyn VolumeClient,
    conflict_retry: &'a RetryConfig,
    shutdown: &'a CancellationToken,
}

impl<'a> Workflow<'a> {
    /// Create a workflow over `client`
    pub fn new(
        client: &'a dyn VolumeClient,
        conflict_retry: &'a RetryConfig,
        shutdown: &'a CancellationToken,
    ) -> Self {
        Self {
            client,
            conflict_retry,
            shutdown,
        }
    }

    /// Run every step in order, stopping at the first failure
    pub async fn run(&self, request: &UnregisterVolume) -> Result<Unregistered, StepFailure> {
        let namespace = request.metadata.namespace.as_deref().unwrap_or_default();

        let claim = validate(request)?;
        self.checkpoint(Step::Resolving)?;

        let volume = match self.resolve_volume(request, namespace, claim).await? {
            Resolution::Present(volume) => volume,
            Resolution::Deleted(volume) => {
                info!(claim, volume = %volume, "PVC and PV already deleted");
                return Ok(Unregistered {
                    namespace: namespace.to_string(),
                    claim: claim.to_string(),
                    volume,
                });
            }
        };
        self.checkpoint(Step::Protecting)?;

        self.protect_volume(&volume).await?;
        self.record_resolution(request, claim, &volume).await?;
        self.checkpoint(Step::ClaimDeleting)?;

        self.delete_claim(namespace, claim).await?;
        self.checkpoint(Step::VolumeDeleting)?;

        self.delete_volume(&volume).await?;

        Ok(Unregistered {
            namespace: namespace.to_string(),
            claim: claim.to_string(),
            volume,
        })
    }

    fn checkpoint(&self, next: Step) -> Result<(), StepFailure> {
        if self.shutdown.is_cancelled() {
            return Err(StepFailure::new(
                next,
                "shutdown requested before step started",
                Error::Cancelled,
            ));
        }
        Ok(())
    }

    async fn resolve_volume(
        &self,
        request: &UnregisterVolume,
        namespace: &str,
        claim: &str,
    ) -> Result<Resolution, StepFailure> {
        let pvc = match self.client.get_claim(namespace, claim).await {
            Ok(pvc) => pvc,
            Err(e) if e.is_not_found() => {
                return self.resolve_orphaned(request, namespace, claim, e).await
            }
            Err(e) => {
                return Err(StepFailure::new(
                    Step::Resolving,
                    format!("Unable to get PVC {claim:?} in namespace {namespace:?}: {e}"),
                    e,
                ))
            }
        };

        let volume = pvc
            .spec
            .and_then(|s| s.volume_name)
            .filter(|v| !v.is_empty());

        match volume {
            Some(volume) => {
                debug!(claim, volume = %volume, "resolved claim to volume");
                Ok(Resolution::Present(volume))
            }
            None => Err(StepFailure::new(
                Step::Resolving,
                format!("PVC {claim:?} in namespace {namespace:?} is not bound to a volume"),
                Error::internal_with_context("workflow", "claim has no volumeName"),
            )),
        }
    }

    /// The claim is gone; a previous attempt may have deleted it before the
    /// volume. Pick the volume up again through its claimRef, or fall back to
    /// the name recorded in status once the volume is gone as well.
    async fn resolve_orphaned(
        &self,
        request: &UnregisterVolume,
        namespace: &str,
        claim: &str,
        not_found: Error,
    ) -> Result<Resolution, StepFailure> {
        let found = self
            .client
            .find_volume_for_claim(namespace, claim)
            .await
            .map_err(|e| {
                StepFailure::new(
                    Step::Resolving,
                    format!("Unable to look up PV for deleted PVC {claim:?} in namespace {namespace:?}: {e}"),
                    e,
                )
            })?;

        if let Some(volume) = found.and_then(|pv| pv.metadata.name) {
            info!(claim, volume = %volume, "PVC already deleted, resuming with its volume");
            return Ok(Resolution::Present(volume));
        }

        match request.resolved_volume(claim) {
            Some(volume) => Ok(Resolution::Deleted(volume.to_string())),
            None => Err(StepFailure::new(
                Step::Resolving,
                format!("Unable to get PVC {claim:?} in namespace {namespace:?}: {not_found}"),
                not_found,
            )),
        }
    }

    async fn protect_volume(&self, volume: &str) -> Result<(), StepFailure> {
        let client = self.client;
        retry_on_conflict(self.conflict_retry, "protect-volume", move || async move {
            let mut pv = client.get_volume(volume).await?;
            if has_retain_policy(&pv) {
                debug!(volume, "reclaim policy already Retain");
                return Ok(());
            }
            pv.spec.get_or_insert_with(Default::default).persistent_volume_reclaim_policy =
                Some(RECLAIM_RETAIN.to_string());
            client.replace_volume(&pv).await?;
            info!(volume, "set reclaim policy to Retain");
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| {
            StepFailure::new(
                Step::Protecting,
                format!("Unable to set reclaim policy Retain on PV {volume:?}: {e}"),
                e,
            )
        })
    }

    /// Store the claim's volume in status before anything is deleted
    async fn record_resolution(
        &self,
        request: &UnregisterVolume,
        claim: &str,
        volume: &str,
    ) -> Result<(), StepFailure> {
        if request.resolved_volume(claim) == Some(volume) {
            return Ok(());
        }

        let client = self.client;
        let key = request.key();
        let key = &key;
        let resolved = ResolvedVolume {
            pvc_name: claim.to_string(),
            volume_name: volume.to_string(),
        };
        let resolved = &resolved;
        retry_on_conflict(self.conflict_retry, "record-volume", move || async move {
            let current = client.get_request(key).await?;
            let status = UnregisterVolumeStatus {
                resolved: Some(resolved.clone()),
                ..current.status.clone().unwrap_or_default()
            };
            client.update_request_status(&current, &status).await
        })
        .await
        .map_err(|e| {
            StepFailure::new(
                Step::Protecting,
                format!("Unable to record PV {volume:?} in status: {e}"),
                e,
            )
        })
    }

    async fn delete_claim(&self, namespace: &str, claim: &str) -> Result<(), StepFailure> {
        match self.client.delete_claim(namespace, claim).await {
            Ok(()) => {
                info!(claim, namespace, "deleted PVC");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(claim, namespace, "PVC already deleted");
                Ok(())
            }
            Err(e) => Err(StepFailure::new(
                Step::ClaimDeleting,
                format!("Failed to delete PVC {claim:?} in namespace {namespace:?}: {e}"),
                e,
            )),
        }
    }

    async fn delete_volume(&self, volume: &str) -> Result<(), StepFailure> {
        match self.client.delete_volume(volume).await {
            Ok(()) => {
                info!(volume, "deleted PV");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(volume, "PV already deleted");
                Ok(())
            }
            Err(e) => Err(StepFailure::new(
                Step::VolumeDeleting,
                format!("Failed to delete PV {volume:?}: {e}"),
                e,
            )),
        }
    }
}

/// Check the request spec and return the claim name
pub fn validate(request: &UnregisterVolume) -> Result<&str, StepFailure> {
    let claim = request.spec.pvc_name.as_str();
    if claim.is_empty() {
        return Err(StepFailure::new(
            Step::Validating,
            MISSING_PVC_NAME,
            Error::validation_for(request.key().to_string(), MISSING_PVC_NAME),
        ));
    }
    Ok(claim)
}

/// True if the volume's reclaim policy is already Retain
pub fn has_retain_policy(pv: &PersistentVolume) -> bool {
    pv.spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        == Some(RECLAIM_RETAIN)
}
