//! UnregisterVolume Custom Resource Definition
//!
//! An UnregisterVolume asks the operator to detach the volume behind a
//! PersistentVolumeClaim from the cluster while keeping the backing storage
//! extent intact. The requester owns the object; the controller only writes
//! its status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ResourceKey;

/// Request to unregister the volume bound to a PersistentVolumeClaim
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "unregistrar.dev",
    version = "v1alpha1",
    kind = "UnregisterVolume",
    plural = "unregistervolumes",
    shortname = "urv",
    status = "UnregisterVolumeStatus",
    namespaced,
    printcolumn = r#"{"name":"PVC","type":"string","jsonPath":".spec.pvcName"}"#,
    printcolumn = r#"{"name":"Unregistered","type":"boolean","jsonPath":".status.unregistered"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".status.error"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterVolumeSpec {
    /// Name of the PersistentVolumeClaim, in the same namespace, to unregister
    #[serde(default)]
    pub pvc_name: String,
}

/// Status written by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterVolumeStatus {
    /// True once the claim and volume are gone; terminal
    #[serde(default)]
    pub unregistered: bool,

    /// Last failure message, empty after success
    #[serde(default)]
    pub error: String,

    /// Volume found behind the claim, recorded before anything is deleted.
    /// Status writes that leave this unset keep the stored value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<ResolvedVolume>,
}

/// Claim-to-volume binding observed by an earlier attempt
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVolume {
    /// Claim the volume was bound to
    pub pvc_name: String,
    /// Name of the bound PersistentVolume
    pub volume_name: String,
}

impl UnregisterVolumeStatus {
    /// Status recorded after a failed attempt
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            unregistered: false,
            error: message.into(),
            resolved: None,
        }
    }

    /// Terminal success status
    pub fn succeeded() -> Self {
        Self {
            unregistered: true,
            error: String::new(),
            resolved: None,
        }
    }
}

impl UnregisterVolume {
    /// Stable (namespace, name) key of this request
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default(),
        )
    }

    /// True once the controller has finished with this request
    pub fn is_unregistered(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.unregistered)
    }

    /// Volume an earlier attempt resolved for `claim`, if any
    pub fn resolved_volume(&self, claim: &str) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.resolved.as_ref())
            .filter(|r| r.pvc_name == claim)
            .map(|r| r.volume_name.as_str())
    }
}
