//! Identifier types for Pulse Link components.
//!
//! Identifiers are supplied by the external auth/config collaborator and are
//! embedded in store keys (`peer:{id}:status`), so `:` and whitespace are
//! rejected at construction.

use crate::error::{PulseCommonError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn validate(kind: &str, raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(PulseCommonError::InvalidId(format!("{kind} is empty")));
    }
    if raw.chars().any(|c| c == ':' || c.is_whitespace()) {
        return Err(PulseCommonError::InvalidId(format!(
            "{kind} contains reserved characters: {raw:?}"
        )));
    }
    Ok(())
}

/// Unique identifier for a user (and the device reporting on their behalf).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

/// A peer is a user's device reporting status into the shared store.
pub type PeerId = UserId;

impl UserId {
    /// Create a user ID after validating it is usable as a key segment.
    ///
    /// # Errors
    ///
    /// Returns `PulseCommonError::InvalidId` for empty IDs or IDs containing
    /// `:` or whitespace.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        validate("user id", &raw)?;
        Ok(Self(raw))
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = PulseCommonError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

/// Unique identifier for a broadcast session (room)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random session ID
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing session ID.
    ///
    /// # Errors
    ///
    /// Returns `PulseCommonError::InvalidId` for empty IDs or IDs containing
    /// `:` or whitespace.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        validate("session id", &raw)?;
        Ok(Self(raw))
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = PulseCommonError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}
