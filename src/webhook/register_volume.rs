//! RegisterVolume validation
//!
//! A storage volume can back at most one claim. Importing a volume whose CSI
//! handle is already on a Bound PersistentVolume for some other claim is
//! rejected.

use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::DynamicObject;
use tracing::{error, info, warn};

use super::{decode, Verdict, VolumeLister};
use crate::crd::RegisterVolume;

const PHASE_BOUND: &str = "Bound";

pub(super) async fn review(
    object: &DynamicObject,
    request_namespace: Option<&str>,
    volumes: &dyn VolumeLister,
) -> Verdict {
    let mut request: RegisterVolume = match decode(object) {
        Ok(rv) => rv,
        Err(e) => {
            error!(error = %e, "error deserializing RegisterVolume");
            return Verdict::Invalid(e.to_string());
        }
    };
    if request.metadata.namespace.is_none() {
        request.metadata.namespace = request_namespace.map(str::to_string);
    }

    info!(
        register_volume = ?request.metadata.name,
        volume_id = %request.spec.volume_id,
        "validating RegisterVolume"
    );

    match volumes.list_volumes().await {
        Ok(pvs) => validate(&request, &pvs),
        Err(e) => {
            warn!(error = %e, "failed to list PersistentVolumes, allowing RegisterVolume");
            Verdict::Allow
        }
    }
}

/// Deny `request` if its volume is Bound to a claim other than the one it names
pub fn validate(request: &RegisterVolume, volumes: &[PersistentVolume]) -> Verdict {
    let namespace = request.metadata.namespace.as_deref().unwrap_or_default();

    for pv in volumes {
        let Some(spec) = pv.spec.as_ref() else { continue };
        let handle = spec.csi.as_ref().map(|csi| csi.volume_handle.as_str());
        if handle != Some(request.spec.volume_id.as_str()) {
            continue;
        }
        let bound = pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(PHASE_BOUND);
        if !bound {
            continue;
        }
        let Some(claim) = spec.claim_ref.as_ref() else { continue };
        let claim_name = claim.name.as_deref().unwrap_or_default();
        let claim_namespace = claim.namespace.as_deref().unwrap_or_default();

        if claim_name != request.spec.pvc_name || claim_namespace != namespace {
            return Verdict::Deny(format!(
                "VolumeID: {} is already attached to PV: {} and bound to PVC: {} in namespace: {}",
                request.spec.volume_id,
                pv.metadata.name.as_deref().unwrap_or_default(),
                claim_name,
                claim_namespace
            ));
        }
    }
    Verdict::Allow
}
