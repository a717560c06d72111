//! Unregistrar - Kubernetes operator that unregisters persistent volumes
//!
//! An `UnregisterVolume` names a PersistentVolumeClaim. The controller sets
//! the bound PersistentVolume's reclaim policy to `Retain`, deletes the claim
//! and the volume, and marks the request unregistered. The storage extent
//! behind the volume survives; only its registration with the cluster goes.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (UnregisterVolume, RegisterVolume)
//! - [`controller`] - Reconciler and the unregister workflow
//! - [`dispatcher`] - Work queue and bounded worker pool
//! - [`backoff`] - Per-resource requeue delays
//! - [`retry`] - In-call retry with exponential backoff and jitter
//! - [`events`] - Kubernetes Event recording
//! - [`webhook`] - Validating admission webhook
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod backoff;
pub mod controller;
pub mod crd;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod retry;
pub mod telemetry;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name the controller reports in Events and uses as its field manager prefix
pub const CONTROLLER_NAME: &str = "unregistrar-controller";

/// Default port for the admission webhook
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;
