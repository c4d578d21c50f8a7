//! Pulse core error types.
//!
//! Store failures are transient by default: components swallow them, keep
//! their last-known-good state, and retry on the next tick. Only caller
//! mistakes (wrong host, unknown session) are surfaced as hard errors.

use crate::store::StoreError;
use thiserror::Error;

/// Pulse core error type.
#[derive(Debug, Error)]
pub enum PulseError {
    /// Remote store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Document could not be encoded for the store.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session document does not exist.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Caller is not allowed to mutate the session (not the host).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Viewer operation against a session that is not broadcasting.
    #[error("Session is not broadcasting: {0}")]
    NotBroadcasting(String),

    /// Internal error (channel closed, task gone).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PulseError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Transient errors are logged and absorbed by the periodic loops;
    /// everything else is a caller error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            PulseError::Store(e) => e.is_transient(),
            PulseError::Internal(_) => true,
            PulseError::Serialization(_)
            | PulseError::Config(_)
            | PulseError::SessionNotFound(_)
            | PulseError::PermissionDenied(_)
            | PulseError::NotBroadcasting(_) => false,
        }
    }
}

impl From<serde_json::Error> for PulseError {
    fn from(err: serde_json::Error) -> Self {
        PulseError::Serialization(err.to_string())
    }
}

impl From<common::error::PulseCommonError> for PulseError {
    fn from(err: common::error::PulseCommonError) -> Self {
        PulseError::Config(err.to_string())
    }
}
