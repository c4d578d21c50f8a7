//! # Pulse Test Utilities
//!
//! Shared test utilities for Pulse Link integration tests.
//!
//! ## Modules
//!
//! - `flaky_store` - `RemoteStore` wrapper with failure injection and delays
//! - `fixtures` - Identifiers and pre-built store documents
//! - `collectors` - Helpers for draining broadcast channels
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pulse_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let memory = InMemoryStore::new();
//!     let store = FlakyStore::new(Arc::new(memory.clone()));
//!     store.fail_next(StoreOp::Transact, 1);
//!
//!     TestPeer::new("partner").active().write(&memory).await;
//!     // Run your test...
//! }
//! ```

pub mod collectors;
pub mod fixtures;
pub mod flaky_store;

// Re-export commonly used items
pub use collectors::*;
pub use fixtures::*;
pub use flaky_store::*;
