//! Orchestration API access for the unregister workflow
//!
//! The reconciler only talks to the cluster through [`VolumeClient`], so tests
//! can drive it against mocks or an in-memory cluster. [`KubeVolumeClient`] is
//! the production implementation over kube-rs; it classifies API failures
//! into `Error::NotFound` / `Error::Conflict` so callers never inspect HTTP
//! status codes.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::{ResourceKey, UnregisterVolume, UnregisterVolumeStatus};
use crate::Error;

/// Field manager used for status writes
pub const FIELD_MANAGER: &str = crate::CONTROLLER_NAME;

const KIND_REQUEST: &str = "UnregisterVolume";
const KIND_CLAIM: &str = "PersistentVolumeClaim";
const KIND_VOLUME: &str = "PersistentVolume";

/// Trait abstracting the Kubernetes operations the workflow needs
///
/// Reads return `Error::NotFound` for absent objects. Conditional writes
/// return `Error::Conflict` when the object changed since it was read.
/// Deletes return `Error::NotFound` when the object is already gone.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VolumeClient: Send + Sync {
    /// Fetch the UnregisterVolume identified by `key`
    async fn get_request(&self, key: &ResourceKey) -> Result<UnregisterVolume, Error>;

    /// Write `status` onto `request`, conditional on its resourceVersion
    async fn update_request_status(
        &self,
        request: &UnregisterVolume,
        status: &UnregisterVolumeStatus,
    ) -> Result<(), Error>;

    /// Fetch a PersistentVolumeClaim
    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<PersistentVolumeClaim, Error>;

    /// Find the PersistentVolume whose claimRef names `namespace/name`.
    ///
    /// Used once the claim itself is gone: a volume with reclaim policy
    /// `Retain` keeps its claimRef after the claim is deleted.
    async fn find_volume_for_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolume>, Error>;

    /// Fetch a PersistentVolume
    async fn get_volume(&self, name: &str) -> Result<PersistentVolume, Error>;

    /// Replace a PersistentVolume, conditional on its resourceVersion
    async fn replace_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume, Error>;

    /// Delete a PersistentVolumeClaim immediately
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete a PersistentVolume immediately
    async fn delete_volume(&self, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct KubeVolumeClient {
    client: Client,
}

impl KubeVolumeClient {
    /// Create a new KubeVolumeClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// List every PersistentVolume in the cluster
    pub async fn list_volumes(&self) -> Result<Vec<PersistentVolume>, Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    fn immediate() -> DeleteParams {
        DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        }
    }
}

#[async_trait]
impl VolumeClient for KubeVolumeClient {
    async fn get_request(&self, key: &ResourceKey) -> Result<UnregisterVolume, Error> {
        let api: Api<UnregisterVolume> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get(&key.name)
            .await
            .map_err(|e| Error::from_kube(KIND_REQUEST, &key.to_string(), e))
    }

    async fn update_request_status(
        &self,
        request: &UnregisterVolume,
        status: &UnregisterVolumeStatus,
    ) -> Result<(), Error> {
        let key = request.key();
        let api: Api<UnregisterVolume> = Api::namespaced(self.client.clone(), &key.namespace);

        // A resourceVersion in a merge patch turns it into a conditional write
        let status_patch = serde_json::json!({
            "metadata": { "resourceVersion": request.metadata.resource_version },
            "status": status,
        });

        api.patch_status(
            &key.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await
        .map_err(|e| Error::from_kube(KIND_REQUEST, &key.to_string(), e))?;

        Ok(())
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(KIND_CLAIM, &format!("{namespace}/{name}"), e))
    }

    async fn find_volume_for_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolume>, Error> {
        let volumes = self.list_volumes().await?;
        Ok(volumes.into_iter().find(|pv| claims(pv, namespace, name)))
    }

    async fn get_volume(&self, name: &str) -> Result<PersistentVolume, Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(KIND_VOLUME, name, e))
    }

    async fn replace_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume, Error> {
        let name = volume
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal_with_context("client", "PersistentVolume has no name"))?;
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.replace(name, &PostParams::default(), volume)
            .await
            .map_err(|e| Error::from_kube(KIND_VOLUME, name, e))
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &Self::immediate())
            .await
            .map_err(|e| Error::from_kube(KIND_CLAIM, &format!("{namespace}/{name}"), e))?;
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), Error> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.delete(name, &Self::immediate())
            .await
            .map_err(|e| Error::from_kube(KIND_VOLUME, name, e))?;
        Ok(())
    }
}

/// True if `pv`'s claimRef points at `namespace/name`
pub fn claims(pv: &PersistentVolume, namespace: &str, name: &str) -> bool {
    pv.spec
        .as_ref()
        .and_then(|s| s.claim_ref.as_ref())
        .is_some_and(|r| {
            r.namespace.as_deref() == Some(namespace) && r.name.as_deref() == Some(name)
        })
}
