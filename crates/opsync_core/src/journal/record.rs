//! Journal record types and framing.

use crate::cursor::DeviceCursor;
use crate::error::{OplogError, OplogResult};
use opsync_protocol::{from_cbor, to_cbor, DeviceId, Operation, OperationId, UserId};
use serde::{Deserialize, Serialize};

/// Magic bytes identifying a journal frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"OPSJ";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Type byte of a journal frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalRecordType {
    /// Opens a commit group.
    Begin = 1,
    /// Operation appended to a user's log.
    Append = 2,
    /// Device registered with a user.
    Register = 3,
    /// Device confirmed sequences.
    Confirm = 4,
    /// Device cursor reset.
    ResetCursor = 5,
    /// Operations pruned by retention.
    Prune = 6,
    /// Full cursor state, written by compaction.
    CursorState = 7,
    /// Log head and prune counters, written by compaction.
    LogHead = 8,
    /// Closes a commit group.
    Commit = 9,
}

impl JournalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Append),
            3 => Some(Self::Register),
            4 => Some(Self::Confirm),
            5 => Some(Self::ResetCursor),
            6 => Some(Self::Prune),
            7 => Some(Self::CursorState),
            8 => Some(Self::LogHead),
            9 => Some(Self::Commit),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Upper-case label used by dumps.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Begin => "BEGIN",
            Self::Append => "APPEND",
            Self::Register => "REGISTER",
            Self::Confirm => "CONFIRM",
            Self::ResetCursor => "RESET",
            Self::Prune => "PRUNE",
            Self::CursorState => "CURSOR",
            Self::LogHead => "HEAD",
            Self::Commit => "COMMIT",
        }
    }
}

/// A durable record of one state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// Opens commit group `group`.
    Begin {
        /// Commit group number.
        group: u64,
    },
    /// An operation appended to `user`'s log at `sequence`.
    Append {
        /// Log owner.
        user: UserId,
        /// Delivery position.
        sequence: u64,
        /// Wall time of the append.
        appended_at_ms: u64,
        /// The operation.
        operation: Operation,
    },
    /// First contact from a device.
    Register {
        /// Log owner.
        user: UserId,
        /// The device.
        device: DeviceId,
        /// Log head at registration.
        registered_at: u64,
        /// Wall time of registration.
        seen_ms: u64,
        /// Whether history had already been pruned.
        history_gap: bool,
    },
    /// Sequences confirmed by a device.
    Confirm {
        /// Log owner.
        user: UserId,
        /// The device.
        device: DeviceId,
        /// Newly confirmed sequences.
        sequences: Vec<u64>,
        /// Wall time of the confirm.
        seen_ms: u64,
    },
    /// A device cursor reset to the start of the live log.
    ResetCursor {
        /// Log owner.
        user: UserId,
        /// The device.
        device: DeviceId,
        /// Wall time of the reset.
        seen_ms: u64,
    },
    /// Operations removed by retention.
    Prune {
        /// Log owner.
        user: UserId,
        /// Pruned sequences.
        sequences: Vec<u64>,
        /// Stale devices that never confirmed some pruned sequence.
        gapped: Vec<DeviceId>,
    },
    /// Complete cursor state.
    CursorState {
        /// Log owner.
        user: UserId,
        /// The device.
        device: DeviceId,
        /// Cursor contents.
        cursor: DeviceCursor,
    },
    /// Counters of a user's log that outlive the pruned operations.
    LogHead {
        /// Log owner.
        user: UserId,
        /// Highest sequence ever assigned.
        head: u64,
        /// Number of operations pruned so far.
        pruned_total: u64,
        /// Ids of pruned operations, kept so re-pushes stay idempotent.
        #[serde(default)]
        pruned_ids: Vec<OperationId>,
    },
    /// Closes commit group `group`.
    Commit {
        /// Commit group number.
        group: u64,
    },
}

impl JournalRecord {
    /// Returns the record type.
    pub fn record_type(&self) -> JournalRecordType {
        match self {
            JournalRecord::Begin { .. } => JournalRecordType::Begin,
            JournalRecord::Append { .. } => JournalRecordType::Append,
            JournalRecord::Register { .. } => JournalRecordType::Register,
            JournalRecord::Confirm { .. } => JournalRecordType::Confirm,
            JournalRecord::ResetCursor { .. } => JournalRecordType::ResetCursor,
            JournalRecord::Prune { .. } => JournalRecordType::Prune,
            JournalRecord::CursorState { .. } => JournalRecordType::CursorState,
            JournalRecord::LogHead { .. } => JournalRecordType::LogHead,
            JournalRecord::Commit { .. } => JournalRecordType::Commit,
        }
    }

    /// Returns the user this record belongs to, if any.
    pub fn user(&self) -> Option<&UserId> {
        match self {
            JournalRecord::Begin { .. } | JournalRecord::Commit { .. } => None,
            JournalRecord::Append { user, .. }
            | JournalRecord::Register { user, .. }
            | JournalRecord::Confirm { user, .. }
            | JournalRecord::ResetCursor { user, .. }
            | JournalRecord::Prune { user, .. }
            | JournalRecord::CursorState { user, .. }
            | JournalRecord::LogHead { user, .. } => Some(user),
        }
    }

    /// Encodes the record into a complete frame.
    ///
    /// ```text
    /// | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
    /// ```
    pub fn encode_frame(&self) -> OplogResult<Vec<u8>> {
        let payload = to_cbor(self)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| OplogError::invalid_argument("journal record exceeds 4 GiB"))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        frame.push(self.record_type().as_byte());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);

        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    /// Decodes a record payload and checks it matches the frame's type byte.
    pub fn decode_payload(record_type: JournalRecordType, payload: &[u8]) -> OplogResult<Self> {
        let record: JournalRecord = from_cbor(payload)?;
        if record.record_type() != record_type {
            return Err(OplogError::JournalCorrupted(format!(
                "frame type {} does not match payload {}",
                record_type.label(),
                record.record_type().label()
            )));
        }
        Ok(record)
    }
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}
