//! Error types for VICE analysis orchestration

use thiserror::Error;

/// Main error type for VICE operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Malformed job data (non-absolute paths, missing ports, bad ids)
    #[error("validation error: {0}")]
    Validation(String),

    /// Launch rejected by the concurrency limit
    #[error("admission rejected: {0}")]
    Admission(String),

    /// User is not allowed to act on an analysis
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An external lookup (user id, analysis status, limits) failed
    #[error("lookup error: {0}")]
    Lookup(String),

    /// A data-staging instance misbehaved
    #[error("staging error [{instance}]: {message}")]
    Staging {
        /// Base URL of the staging instance
        instance: String,
        /// Description of what failed
        message: String,
    },

    /// Outbound HTTP request failed
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A named object or job does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an admission error with the given message
    pub fn admission(msg: impl Into<String>) -> Self {
        Self::Admission(msg.into())
    }

    /// Create a permission error with the given message
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a lookup error with the given message
    pub fn lookup(msg: impl Into<String>) -> Self {
        Self::Lookup(msg.into())
    }

    /// Create a staging error for one instance
    pub fn staging(instance: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Staging {
            instance: instance.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for a Kubernetes 404 response
    pub fn is_kube_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// True when an outbound request failed before reaching the server.
    ///
    /// Only these are safe to resend for non-idempotent calls.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Error::Http(e) if e.is_connect())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
