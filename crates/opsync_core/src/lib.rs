//! # opsync core
//!
//! Operation-log synchronization engine.
//!
//! Devices push immutable operations into their user's append-only log, pull
//! what they have not confirmed, and confirm what they applied. Once every
//! active device confirmed an operation and its grace period passed,
//! retention prunes it.
//!
//! This crate provides:
//! - [`OperationLog`], the engine: push, pull, confirm, get, search, reset,
//!   retention sweeps and compaction
//! - A crash-safe [`journal`] of commit groups over an
//!   [`opsync_storage::StorageBackend`]
//! - The tracked-entity index ([`EntityIndex`]) and payload search index
//!   ([`SearchIndex`])
//! - Per-device cursors ([`DeviceCursor`]) with set-based confirmation
//! - The realtime notifier ([`RealtimeNotifier`])
//!
//! ## Guarantees
//!
//! - Pushing the same operation id twice appends it once
//! - A user's operations are delivered in `(created_at, id)` order
//! - A confirmed operation is never delivered to that device again, unless
//!   the device resets its cursor
//! - A batch is visible entirely or not at all, and survives a crash once
//!   the push returned

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod clock;
mod config;
mod context;
mod cursor;
mod error;
mod index;
pub mod journal;
mod notifier;
mod oplog;
mod retention;
mod search;
mod stats;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OplogConfig;
pub use context::CallContext;
pub use cursor::DeviceCursor;
pub use error::{OplogError, OplogResult};
pub use index::{EntityIndex, HashEntityIndex};
pub use journal::{BackendJournal, Journal, JournalRecord, Replay};
pub use notifier::{
    ListenerId, Notifier, NotifierStats, NullNotifier, RealtimeNotifier, Subscription,
    UpdateListener, UpdateSignal,
};
pub use oplog::{
    CompactionReport, ConfirmOutcome, OperationLog, PullOptions, PullOutcome, PushOptions,
    PushOutcome,
};
pub use retention::{plan as plan_retention, PrunePlan, RetentionPolicy, SweepReport};
pub use search::{SearchIndex, SubstringSearchIndex};
pub use stats::{DeviceSummary, OplogStats, StatsSnapshot, UserSummary};
pub use store::{sort_by_order_key, StoredOperation, UserLog};
