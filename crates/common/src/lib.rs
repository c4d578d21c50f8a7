//! Common utilities and types shared across Pulse Link components.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for identifier types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
