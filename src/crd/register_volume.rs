//! RegisterVolume Custom Resource Definition
//!
//! Only the admission webhook reads this type: it rejects a RegisterVolume
//! whose storage volume is already bound to a different claim.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Request to import an existing storage volume as a PersistentVolumeClaim
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "unregistrar.dev",
    version = "v1alpha1",
    kind = "RegisterVolume",
    plural = "registervolumes",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RegisterVolumeSpec {
    /// Name of the claim to create for the volume
    #[serde(default)]
    pub pvc_name: String,

    /// Storage-backend identifier of the volume (the CSI volume handle)
    #[serde(default, rename = "volumeID")]
    pub volume_id: String,
}
