//! Durable journal backing the operation store.
//!
//! Every state change of the operation log (appends, device registrations,
//! confirmations, resets, prunes) is written as a **commit group**: a `BEGIN`
//! frame, the change records, and a `COMMIT` frame. The `COMMIT` frame is
//! appended only after the rest of the group is durable.
//!
//! ## Frame Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is the CBOR encoding of a [`JournalRecord`].
//!
//! ## Recovery Policy
//!
//! Tolerated, treated as a clean end of the journal and cut off on replay:
//! - a truncated header or payload at the end
//! - a trailing group without its `COMMIT` frame
//!
//! Fatal, the log refuses to open:
//! - CRC mismatch
//! - invalid magic, unknown record type or a future format version
//!
//! ## Invariants
//!
//! - Records of a group are applied on replay only if its `COMMIT` is present
//! - A failed commit leaves the journal at its previous length, or the
//!   journal refuses further commits until it is cut back to that length
//! - Replay is idempotent: replaying twice yields the same state

mod reader;
mod record;
mod writer;

pub use reader::{Frame, FrameIter};
pub use record::{compute_crc32, JournalRecord, JournalRecordType, JOURNAL_MAGIC, JOURNAL_VERSION};
pub use writer::BackendJournal;

use crate::error::OplogResult;

/// File name of the journal inside a data directory.
pub const JOURNAL_FILE_NAME: &str = "oplog.journal";

/// Committed records recovered from a journal.
#[derive(Debug, Default)]
pub struct Replay {
    /// Records of committed groups, in commit order, without group markers.
    pub records: Vec<JournalRecord>,
    /// Number of committed groups.
    pub groups: u64,
    /// Highest committed group number.
    pub last_group: u64,
    /// Bytes discarded from a torn tail.
    pub discarded_bytes: u64,
}

/// Durable, atomic persistence of commit groups.
///
/// This is the storage capability the operation log writes through. Tests can
/// substitute failing or recording journals.
pub trait Journal: Send + Sync {
    /// Durably writes `records` as one commit group and returns its number.
    ///
    /// Either the whole group becomes durable or the call fails and nothing
    /// of it is replayed later.
    fn commit(&self, records: Vec<JournalRecord>) -> OplogResult<u64>;

    /// Reads back every committed record, repairing a torn tail.
    fn replay(&self) -> OplogResult<Replay>;

    /// Atomically replaces the whole journal with `records` as one group.
    fn rewrite(&self, records: Vec<JournalRecord>) -> OplogResult<()>;

    /// Flushes pending writes to durable media.
    fn sync(&self) -> OplogResult<()>;

    /// Returns the journal size in bytes.
    fn size(&self) -> OplogResult<u64>;
}
