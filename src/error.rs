//! Error taxonomy surfaced to the host
//!
//! Every failure the bridge reports maps to exactly one [`ErrorKind`]. The
//! kind is the only stable contract with the host; messages are for humans.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::provider::ProviderFailure;
use crate::storage::StorageError;

/// Stable error classification exposed to the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigError,
    NotConfiguredError,
    AlreadyInProgressError,
    UserCancelledError,
    ProviderError,
    InternalError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::ConfigError => "ConfigError",
            ErrorKind::NotConfiguredError => "NotConfiguredError",
            ErrorKind::AlreadyInProgressError => "AlreadyInProgressError",
            ErrorKind::UserCancelledError => "UserCancelledError",
            ErrorKind::ProviderError => "ProviderError",
            ErrorKind::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Missing or malformed configuration. Not retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An operation that needs configuration ran before `configure`.
    #[error("bridge options have not been set; call configure first")]
    NotConfigured,

    /// Another acquisition flow is still running on this bridge.
    #[error("an authentication flow is already in progress")]
    AlreadyInProgress,

    /// The user declined or abandoned interactive sign-in.
    #[error("user cancelled the sign-in")]
    UserCancelled,

    /// The identity provider rejected the request. Code and description are
    /// the provider's own, unmodified.
    #[error("identity provider error '{code}': {description}")]
    Provider { code: String, description: String },

    /// Anything unexpected inside the bridge.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Config(_) => ErrorKind::ConfigError,
            BridgeError::NotConfigured => ErrorKind::NotConfiguredError,
            BridgeError::AlreadyInProgress => ErrorKind::AlreadyInProgressError,
            BridgeError::UserCancelled => ErrorKind::UserCancelledError,
            BridgeError::Provider { .. } => ErrorKind::ProviderError,
            BridgeError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Provider error code, only present for [`BridgeError::Provider`].
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            BridgeError::Provider { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<ProviderFailure> for BridgeError {
    fn from(failure: ProviderFailure) -> Self {
        match failure {
            ProviderFailure::Cancelled => BridgeError::UserCancelled,
            ProviderFailure::Rejected { code, description } => {
                BridgeError::Provider { code, description }
            }
        }
    }
}

impl From<StorageError> for BridgeError {
    fn from(err: StorageError) -> Self {
        BridgeError::Internal(format!("secure storage: {}", err))
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
