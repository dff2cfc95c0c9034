//! # TableTalk Testkit
//!
//! Test utilities for the TableTalk sync engine.
//!
//! This crate provides:
//! - Wire-level fixtures building the raw rows the remote store serves
//! - A scriptable backend for driving the engine through failure modes
//! - Property-based generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tabletalk_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn connects_and_loads() {
//!     let backend = ScriptedBackend::new();
//!     let session = session_id();
//!     backend.stage_snapshot(SnapshotFixture::new(&session).build());
//!     // ... hand a clone to the engine
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use backend::*;
pub use fixtures::*;
pub use generators::*;
