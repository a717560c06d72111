//! Error types for the unregistrar operator
//!
//! Errors carry the resource kind and name they concern so that status
//! messages and logs identify exactly which object a workflow step failed on.
//! The reconciler never lets these escape: every variant is turned into a
//! status message plus a requeue decision at the reconcile boundary.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for unregistrar operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is neither a not-found nor a conflict
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The addressed object does not exist
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Object kind (e.g. "PersistentVolumeClaim")
        kind: String,
        /// Object name, namespaced objects use `namespace/name`
        name: String,
    },

    /// Conditional update lost against a concurrent writer
    #[error("conflict updating {kind} {name:?}: object was modified")]
    Conflict {
        /// Object kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Validation error for a resource spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource key of the invalid object
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Work was abandoned because the process is shutting down
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "workflow", "dispatcher")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error for the given kind and name
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a validation error for a specific resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a raw kube-rs error for the object `kind`/`name`.
    ///
    /// HTTP 404 becomes [`Error::NotFound`] and 409 becomes [`Error::Conflict`]
    /// so callers can branch on the two outcomes the workflow treats specially.
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, name),
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(kind, name),
            other => Self::Kube { source: other },
        }
    }

    /// True if the addressed object did not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True if a conditional update lost against a concurrent writer
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}
