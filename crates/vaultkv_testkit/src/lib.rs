//! # vaultkv Testkit
//!
//! Test utilities for vaultkv.
//!
//! This crate provides:
//! - Test fixtures and vault helpers
//! - A scriptable backend for delaying, failing and counting calls
//! - Recording and vetoing extensions for pipeline tests
//! - Property-based test generators using proptest
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vaultkv_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_vault() {
//!     let vault = TestVault::memory().await;
//!     vault.backend.delay_next(Call::Put, [Duration::from_millis(10)]);
//!     let _ = vault.set("a", 1);
//!     assert_eq!(vault.get("a").await.unwrap(), Some(1.into()));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backends;
pub mod extensions;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backends::*;
    pub use crate::extensions::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use backends::*;
pub use extensions::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
