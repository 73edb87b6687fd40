//! # opsync testkit
//!
//! Test utilities for opsync.
//!
//! This crate provides:
//! - Operation builders and unique ids
//! - [`TestLog`], an operation log on a manual clock whose journal survives
//!   reopening, and [`RecordingNotifier`]
//! - Backends that simulate torn writes and failing syncs
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use opsync_testkit::prelude::*;
//!
//! let log = TestLog::new();
//! log.push_as("alice", "phone", vec![deal_op("op1", "alice", 1, "D1")]).unwrap();
//! assert_eq!(log.pull_ids("alice", "tablet"), vec!["op1"]);
//!
//! let log = log.reopen();
//! assert_eq!(log.pull_ids("alice", "tablet"), vec!["op1"]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
