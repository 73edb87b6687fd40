//! Dump journal command implementation.

use super::{journal_path, CliResult};
use opsync_core::journal::{Frame, FrameIter, JournalRecord};
use opsync_storage::FileBackend;
use serde::Serialize;
use std::path::Path;

/// Journal frame representation for output.
#[derive(Debug, Serialize)]
pub struct FrameInfo {
    /// Offset in the journal file.
    pub offset: u64,
    /// Frame length in bytes.
    pub len: u64,
    /// Record type.
    pub record_type: String,
    /// Commit group (BEGIN and COMMIT only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<u64>,
    /// Log owner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Device (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Sequence of an appended operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Number of sequences confirmed or pruned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_count: Option<usize>,
    /// Operation id (APPEND only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    /// Payload type (APPEND only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<String>,
    /// Payload size in bytes (APPEND only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<usize>,
}

/// Frames read by a dump.
#[derive(Debug, Serialize)]
pub struct DumpResult {
    /// Frames in journal order.
    pub frames: Vec<FrameInfo>,
    /// Why reading stopped early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs the dump-journal command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    start_offset: u64,
    user: Option<&str>,
    format: &str,
) -> CliResult<()> {
    let result = dump(path, limit, start_offset, user)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Reads up to `limit` frames starting at `start_offset`.
///
/// With `user` set, only that user's records are kept and group markers are
/// skipped.
pub fn dump(
    path: &Path,
    limit: Option<usize>,
    start_offset: u64,
    user: Option<&str>,
) -> CliResult<DumpResult> {
    let backend = FileBackend::open(&journal_path(path)?)?;
    let max_frames = limit.unwrap_or(usize::MAX);
    let mut frames = Vec::new();
    let mut error = None;

    for frame in FrameIter::new(&backend, start_offset)? {
        if frames.len() >= max_frames {
            break;
        }
        match frame {
            Ok(frame) => {
                let owner = frame.record.user().map(|u| u.as_str());
                if user.is_some() && owner != user {
                    continue;
                }
                frames.push(frame_info(frame));
            }
            Err(err) => {
                error = Some(err.to_string());
                break;
            }
        }
    }

    Ok(DumpResult { frames, error })
}

fn frame_info(frame: Frame) -> FrameInfo {
    let mut info = FrameInfo {
        offset: frame.offset,
        len: frame.len,
        record_type: frame.record.record_type().label().to_string(),
        group: None,
        user: frame.record.user().map(ToString::to_string),
        device: None,
        sequence: None,
        sequence_count: None,
        operation_id: None,
        payload_type: None,
        payload_size: None,
    };

    match frame.record {
        JournalRecord::Begin { group } | JournalRecord::Commit { group } => {
            info.group = Some(group);
        }
        JournalRecord::Append {
            sequence,
            operation,
            ..
        } => {
            info.sequence = Some(sequence);
            info.payload_size = Some(operation.payload_size());
            info.operation_id = Some(operation.id.to_string());
            info.payload_type = Some(operation.payload_type);
        }
        JournalRecord::Register { device, .. }
        | JournalRecord::ResetCursor { device, .. }
        | JournalRecord::CursorState { device, .. } => {
            info.device = Some(device.to_string());
        }
        JournalRecord::Confirm {
            device, sequences, ..
        } => {
            info.device = Some(device.to_string());
            info.sequence_count = Some(sequences.len());
        }
        JournalRecord::Prune { sequences, .. } => {
            info.sequence_count = Some(sequences.len());
        }
        JournalRecord::LogHead { head, .. } => {
            info.sequence = Some(head);
        }
    }

    info
}

fn print_text_output(result: &DumpResult) {
    println!("Journal Frames ({} total)", result.frames.len());
    println!("================");
    println!();

    for frame in &result.frames {
        print!("[{:08}] {:8}", frame.offset, frame.record_type);

        if let Some(group) = frame.group {
            print!(" group={}", group);
        }
        if let Some(ref user) = frame.user {
            print!(" user={}", user);
        }
        if let Some(ref device) = frame.device {
            print!(" device={}", device);
        }
        if let Some(seq) = frame.sequence {
            print!(" seq={}", seq);
        }
        if let Some(count) = frame.sequence_count {
            print!(" sequences={}", count);
        }
        if let Some(ref id) = frame.operation_id {
            print!(" op={}", id);
        }
        if let Some(ref payload_type) = frame.payload_type {
            print!(" type={}", payload_type);
        }
        if let Some(size) = frame.payload_size {
            print!(" payload={} bytes", size);
        }

        println!();
    }

    if let Some(ref error) = result.error {
        println!();
        println!("stopped: {}", error);
    }
}
