//! Verify command implementation.

use super::{open_snapshot, read_journal, CliError, CliResult};
use opsync_core::journal::{FrameIter, JournalRecord};
use opsync_core::OplogConfig;
use opsync_storage::InMemoryBackend;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of frames checked.
    pub frames_checked: usize,
    /// Number of complete commit groups.
    pub committed_groups: usize,
    /// Groups abandoned before their COMMIT, including a torn tail.
    pub abandoned_groups: usize,
    /// Bytes after the last committed group; recovery cuts them off.
    pub torn_tail_bytes: u64,
    /// Problems that stop the log from opening.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Returns true if the journal opens cleanly.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> CliResult<()> {
    println!("Verifying journal at {:?}", path);
    println!();

    let result = verify(path)?;
    println!("  Frames checked:   {}", result.frames_checked);
    println!("  Committed groups: {}", result.committed_groups);
    if result.abandoned_groups > 0 {
        println!("  Abandoned groups: {}", result.abandoned_groups);
    }
    if result.torn_tail_bytes > 0 {
        println!(
            "  Torn tail:        {} bytes (discarded on next open)",
            result.torn_tail_bytes
        );
    }
    for error in &result.errors {
        println!("  ERROR: {}", error);
    }

    println!();
    if result.is_ok() {
        println!("✓ Journal verification passed");
        Ok(())
    } else {
        println!("✗ Journal verification failed");
        Err(CliError::VerificationFailed(result.errors.len()))
    }
}

/// Checks framing, checksums and group structure, then replays the journal.
pub fn verify(path: &Path) -> CliResult<VerifyResult> {
    let bytes = read_journal(path)?;
    let mut result = verify_bytes(bytes.clone())?;

    if result.is_ok() {
        if let Err(err) = open_snapshot(bytes, OplogConfig::default()) {
            result.errors.push(format!("replay failed: {err}"));
        }
    }
    Ok(result)
}

fn verify_bytes(bytes: Vec<u8>) -> CliResult<VerifyResult> {
    let size = bytes.len() as u64;
    let backend = InMemoryBackend::with_data(bytes);
    let mut result = VerifyResult::default();
    let mut open_group: Option<u64> = None;
    let mut last_group = 0u64;
    let mut committed_end = 0u64;

    let mut frames = FrameIter::new(&backend, 0)?;
    for frame in frames.by_ref() {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                result.errors.push(err.to_string());
                return Ok(result);
            }
        };
        result.frames_checked += 1;

        match frame.record {
            JournalRecord::Begin { group } => {
                if open_group.replace(group).is_some() {
                    result.abandoned_groups += 1;
                }
                if group <= last_group {
                    result.errors.push(format!(
                        "group {group} at offset {} does not follow group {last_group}",
                        frame.offset
                    ));
                }
            }
            JournalRecord::Commit { group } => {
                if open_group.take() == Some(group) {
                    result.committed_groups += 1;
                    last_group = group;
                    committed_end = frame.end();
                } else {
                    result.errors.push(format!(
                        "COMMIT for group {group} at offset {} has no matching BEGIN",
                        frame.offset
                    ));
                }
            }
            record => {
                if open_group.is_none() {
                    result.errors.push(format!(
                        "{} record at offset {} outside a commit group",
                        record.record_type().label(),
                        frame.offset
                    ));
                }
            }
        }
    }

    if open_group.is_some() {
        result.abandoned_groups += 1;
    }
    result.torn_tail_bytes = size - committed_end;
    Ok(result)
}
