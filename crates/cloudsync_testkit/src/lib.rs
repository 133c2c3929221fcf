//! # CloudSync Testkit
//!
//! Test utilities for CloudSync.
//!
//! This crate provides:
//! - [`MemoryCloud`], an in-memory remote store with token expiry and
//!   fault injection
//! - Engine fixtures wired to a `MemoryCloud` and memory collaborators
//! - Record generators
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cloudsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_engine() {
//!     let test = TestEngine::memory(PET_SCOPES);
//!     test.cloud.put(record("Dog", "rex", "DogZone", "woof"));
//!     test.prepare().await.unwrap();
//!     test.fetch_changes().await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cloud;
pub mod fixtures;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cloud::*;
    pub use crate::fixtures::*;
}

pub use cloud::*;
pub use fixtures::*;
