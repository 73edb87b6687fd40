//! Frame-by-frame journal reader.

use crate::error::{OplogError, OplogResult};
use crate::journal::record::{
    compute_crc32, JournalRecord, JournalRecordType, CRC_SIZE, HEADER_SIZE, JOURNAL_MAGIC,
    JOURNAL_VERSION,
};
use opsync_storage::StorageBackend;

/// One decoded journal frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Offset of the frame in the journal.
    pub offset: u64,
    /// Total frame length including header and checksum.
    pub len: u64,
    /// The decoded record.
    pub record: JournalRecord,
}

impl Frame {
    /// Offset just past this frame.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Iterator over the frames of a journal.
///
/// Yields `Err` once on corruption and stops. A truncated frame at the end is
/// a clean stop; [`FrameIter::stopped_at`] then reports where readable data
/// ends.
pub struct FrameIter<'a> {
    backend: &'a dyn StorageBackend,
    offset: u64,
    size: u64,
    finished: bool,
}

impl<'a> FrameIter<'a> {
    /// Starts reading at `offset`.
    pub fn new(backend: &'a dyn StorageBackend, offset: u64) -> OplogResult<Self> {
        let size = backend.size()?;
        Ok(Self {
            backend,
            offset,
            size,
            finished: false,
        })
    }

    /// Offset of the first byte not consumed as a complete frame.
    pub fn stopped_at(&self) -> u64 {
        self.offset
    }

    /// Size of the journal when iteration started.
    pub fn journal_size(&self) -> u64 {
        self.size
    }

    fn read_next(&mut self) -> OplogResult<Option<Frame>> {
        let start = self.offset;
        if self.size.saturating_sub(start) < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let header = self.backend.read_at(start, HEADER_SIZE)?;
        if header[0..4] != JOURNAL_MAGIC {
            return Err(OplogError::JournalCorrupted(format!(
                "invalid magic at offset {start}"
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > JOURNAL_VERSION {
            return Err(OplogError::JournalCorrupted(format!(
                "unsupported version {version} at offset {start}"
            )));
        }

        let type_byte = header[6];
        let record_type = JournalRecordType::from_byte(type_byte).ok_or_else(|| {
            OplogError::JournalCorrupted(format!(
                "unknown record type {type_byte} at offset {start}"
            ))
        })?;

        let payload_len =
            u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = (HEADER_SIZE + payload_len + CRC_SIZE) as u64;
        if self.size - start < total_len {
            return Ok(None);
        }

        let body = self
            .backend
            .read_at(start + HEADER_SIZE as u64, payload_len + CRC_SIZE)?;
        let (payload, crc_bytes) = body.split_at(payload_len);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

        let mut checked = header;
        checked.extend_from_slice(payload);
        let computed = compute_crc32(&checked);
        if stored != computed {
            return Err(OplogError::ChecksumMismatch {
                offset: start,
                expected: stored,
                actual: computed,
            });
        }

        let record = JournalRecord::decode_payload(record_type, payload)?;
        self.offset = start + total_len;

        Ok(Some(Frame {
            offset: start,
            len: total_len,
            record,
        }))
    }
}

impl Iterator for FrameIter<'_> {
    type Item = OplogResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_next() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
