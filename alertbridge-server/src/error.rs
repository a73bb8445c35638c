//! Error types shared by the engine and its collaborators.

use reqwest::StatusCode;
use thiserror::Error;

/// Failure reported by a remote service: the alert gateway or the request
/// source receiving automatic reviews.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Network failure, 5xx or rate limiting. Safe to retry.
    #[error("transient error during {operation}: {message}")]
    Transient { operation: String, message: String },

    /// The service rejected the call (e.g. unknown responder).
    #[error("remote service rejected {operation}: {message}")]
    Permanent { operation: String, message: String },
}

impl GatewayError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Map an unsuccessful HTTP status to an error. Server errors, timeouts
    /// and rate limiting are transient; everything else is permanent.
    pub fn from_status(operation: &str, status: StatusCode, body: &str) -> Self {
        let message = format!("{} - {}", status, body);
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            Self::transient(operation, message)
        } else {
            Self::permanent(operation, message)
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Failure reported by a plugin data repository.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// The backing store could not be read or written.
    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    /// A stored record could not be decoded.
    #[error("corrupted {what} in plugin data store")]
    Corruption { what: String },
}

impl RepositoryError {
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }
}

/// Why handling a request snapshot stopped early.
///
/// In every case the plugin data reflects exactly the steps that completed,
/// so the same snapshot can be delivered again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] RepositoryError),

    #[error("deadline expired during {operation}")]
    Timeout { operation: &'static str },

    /// The dispatcher could not run the snapshot at all.
    #[error("dispatch failed: {reason}")]
    Dispatch { reason: &'static str },
}

impl EngineError {
    /// Whether redelivering the snapshot later can be expected to succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Gateway(e) => e.is_retryable(),
            Self::Store(RepositoryError::Storage { .. }) => true,
            Self::Store(RepositoryError::Corruption { .. }) => false,
            Self::Timeout { .. } => true,
            Self::Dispatch { .. } => false,
        }
    }
}
