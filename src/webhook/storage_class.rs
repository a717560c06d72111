//! StorageClass validation

use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::DynamicObject;
use tracing::{error, info};

use super::{decode, Verdict};

/// In-tree vSphere provisioner
pub const IN_TREE_PROVISIONER: &str = "kubernetes.io/vsphere-volume";

/// vSphere CSI provisioner
pub const CSI_PROVISIONER: &str = "csi.vsphere.vmware.com";

/// Parameters reserved for in-tree to CSI migration
pub const MIGRATION_PARAMETERS: [&str; 8] = [
    "csimigration",
    "diskformat-migrationparam",
    "hostfailurestotolerate-migrationparam",
    "forceprovisioning-migrationparam",
    "cachereservation-migrationparam",
    "diskstripes-migrationparam",
    "objectspacereservation-migrationparam",
    "iopslimit-migrationparam",
];

/// Denial reason for volume expansion on the in-tree provisioner
pub const VOLUME_EXPANSION_DENIED: &str =
    "AllowVolumeExpansion can not be set to true on the in-tree vSphere StorageClass";

/// Denial reason for migration parameters on the CSI provisioner
pub const MIGRATION_PARAM_DENIED: &str =
    "Invalid StorageClass Parameters. Migration specific parameters should not be used in the StorageClass";

pub(super) fn review(object: &DynamicObject) -> Verdict {
    match decode::<StorageClass>(object) {
        Ok(sc) => validate(&sc),
        Err(e) => {
            error!(error = %e, "error deserializing StorageClass");
            Verdict::Invalid(e.to_string())
        }
    }
}

/// Check a StorageClass against the provisioner rules
pub fn validate(sc: &StorageClass) -> Verdict {
    let name = sc.metadata.name.as_deref().unwrap_or_default();

    let verdict = match sc.provisioner.as_str() {
        IN_TREE_PROVISIONER if sc.allow_volume_expansion == Some(true) => {
            Verdict::Deny(VOLUME_EXPANSION_DENIED.to_string())
        }
        CSI_PROVISIONER if has_migration_parameter(sc) => {
            Verdict::Deny(MIGRATION_PARAM_DENIED.to_string())
        }
        _ => Verdict::Allow,
    };

    info!(
        storage_class = %name,
        passed = verdict == Verdict::Allow,
        "validated StorageClass"
    );
    verdict
}

fn has_migration_parameter(sc: &StorageClass) -> bool {
    sc.parameters
        .as_ref()
        .is_some_and(|params| params.keys().any(|k| MIGRATION_PARAMETERS.contains(&k.as_str())))
}
