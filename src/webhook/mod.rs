//! Validating admission webhook
//!
//! Two stateless checks run at admission time, alongside the controller:
//! - `POST /validate-storageclass` rejects StorageClasses that the vSphere
//!   provisioners cannot honor
//! - `POST /validate-registervolume` rejects RegisterVolume requests whose
//!   volume is already bound to a different claim
//!
//! The request's kind is parsed into [`AdmissionKind`] and matched
//! exhaustively; a review whose kind does not belong to the endpoint it was
//! sent to is allowed unchanged.

pub mod register_volume;
pub mod storage_class;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use crate::controller::KubeVolumeClient;
use crate::Error;

/// Lists PersistentVolumes for the RegisterVolume check
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VolumeLister: Send + Sync {
    /// Every PersistentVolume in the cluster
    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>, Error>;
}

#[async_trait]
impl VolumeLister for KubeVolumeClient {
    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>, Error> {
        KubeVolumeClient::list_volumes(self).await
    }
}

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// PersistentVolume lookups for RegisterVolume validation
    pub volumes: Arc<dyn VolumeLister>,
}

impl WebhookState {
    /// Create webhook state over `volumes`
    pub fn new(volumes: Arc<dyn VolumeLister>) -> Self {
        Self { volumes }
    }
}

/// Object kinds this webhook validates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionKind {
    /// storage.k8s.io/v1 StorageClass
    StorageClass,
    /// RegisterVolume custom resource
    RegisterVolume,
}

impl AdmissionKind {
    /// Parse the `kind` of an admission request
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "StorageClass" => Some(Self::StorageClass),
            "RegisterVolume" => Some(Self::RegisterVolume),
            _ => None,
        }
    }
}

/// Result of validating one object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Admit the object
    Allow,
    /// Reject the object with a reason
    Deny(String),
    /// The object could not be decoded
    Invalid(String),
}

/// Create the webhook router
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate-storageclass", post(validate_storage_class))
        .route("/validate-registervolume", post(validate_register_volume))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

async fn validate_storage_class(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(admit(&state, body, AdmissionKind::StorageClass).await.into_review())
}

async fn validate_register_volume(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(admit(&state, body, AdmissionKind::RegisterVolume).await.into_review())
}

async fn admit(
    state: &WebhookState,
    body: AdmissionReview<DynamicObject>,
    endpoint: AdmissionKind,
) -> AdmissionResponse {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return AdmissionResponse::invalid(e.to_string());
        }
    };
    let response = AdmissionResponse::from(&request);

    if AdmissionKind::parse(&request.kind.kind) != Some(endpoint) {
        debug!(uid = %request.uid, kind = %request.kind.kind, ?endpoint, "kind not handled here, allowing");
        return response;
    }

    let Some(object) = request.object.as_ref() else {
        debug!(uid = %request.uid, "no object in request, allowing");
        return response;
    };

    let verdict = match endpoint {
        AdmissionKind::StorageClass => storage_class::review(object),
        AdmissionKind::RegisterVolume => {
            register_volume::review(object, request.namespace.as_deref(), state.volumes.as_ref())
                .await
        }
    };

    match verdict {
        Verdict::Allow => response,
        Verdict::Deny(reason) => {
            info!(uid = %request.uid, kind = ?endpoint, %reason, "denied");
            response.deny(reason)
        }
        Verdict::Invalid(message) => {
            let mut invalid = AdmissionResponse::invalid(message);
            invalid.uid = request.uid;
            invalid
        }
    }
}

/// Decode an admitted object into a typed resource
pub(crate) fn decode<T: serde::de::DeserializeOwned>(object: &DynamicObject) -> Result<T, Error> {
    let value = serde_json::to_value(object).map_err(|e| Error::serialization(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::serialization(e.to_string()))
}

/// Where and how to serve the webhook
#[derive(Clone, Debug)]
pub struct ServeConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// PEM certificate and key; plain HTTP when absent
    pub tls: Option<(PathBuf, PathBuf)>,
}

/// Serve the webhook until `shutdown` fires
pub async fn serve(
    state: Arc<WebhookState>,
    config: ServeConfig,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let app = webhook_router(state);

    match config.tls {
        Some((cert, key)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| Error::internal_with_context("webhook", format!("TLS config error: {e}")))?;

            let handle = axum_server::Handle::new();
            let stopper = handle.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                stopper.graceful_shutdown(Some(Duration::from_secs(10)));
            });

            info!(addr = %config.addr, "Starting HTTPS admission webhook");
            axum_server::bind_rustls(config.addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::internal_with_context("webhook", format!("server error: {e}")))
        }
        None => {
            let listener = tokio::net::TcpListener::bind(config.addr)
                .await
                .map_err(|e| Error::internal_with_context("webhook", format!("bind {}: {e}", config.addr)))?;

            info!(addr = %config.addr, "Starting HTTP admission webhook");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .map_err(|e| Error::internal_with_context("webhook", format!("server error: {e}")))
        }
    }
}
