//! # foldsync Testkit
//!
//! Test utilities for foldsync.
//!
//! This crate provides:
//! - A `yrs` text document implementing the engine's document model
//! - Restartable test instances and temporary on-disk engines
//! - A sloppy sync simulator that delivers files in any order
//! - A crash harness for the move state machine
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use foldsync_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_engine() {
//!     with_temp_engine(|engine, root| {
//!         let doc = engine.create_document(root, None).unwrap();
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod model;
pub mod sync;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::model::*;
    pub use crate::sync::*;
}

pub use crash::{MoveCrashHarness, MoveCrashResult, CRASH_STATES};
pub use fixtures::*;
pub use model::{TextEditor, YrsDocument, YrsModel};
pub use sync::{DevicePair, SyncLink, Transfer};
