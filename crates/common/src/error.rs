//! Common error types for Pulse Link components.

use thiserror::Error;

/// Errors raised while constructing shared types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PulseCommonError {
    /// Identifier is empty or contains characters reserved by store keys
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

/// Result type alias using `PulseCommonError`
pub type Result<T> = std::result::Result<T, PulseCommonError>;
