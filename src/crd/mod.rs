//! Custom Resource Definitions for unregistrar

mod register_volume;
mod unregister_volume;

pub use register_volume::{RegisterVolume, RegisterVolumeSpec};
pub use unregister_volume::{
    ResolvedVolume, UnregisterVolume, UnregisterVolumeSpec, UnregisterVolumeStatus,
};

use std::fmt;

/// Stable identity of a namespaced resource: `(namespace, name)`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Namespace of the resource
    pub namespace: String,
    /// Name of the resource
    pub name: String,
}

impl ResourceKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
