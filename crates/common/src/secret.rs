//! Secret types for values that must never reach logs.
//!
//! Re-exports [`secrecy`] so every crate wraps credentials the same way.
//! The store URL may embed a password (`redis://:password@host:6379`), so
//! it is always held as a [`SecretString`].
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let url = SecretString::from("redis://:hunter2@localhost:6379");
//! assert!(!format!("{url:?}").contains("hunter2"));
//! assert!(url.expose_secret().starts_with("redis://"));
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
