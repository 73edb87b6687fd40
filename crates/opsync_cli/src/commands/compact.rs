//! Compact command implementation.

use super::{open_journal, open_snapshot, read_journal, CliResult};
use opsync_core::{CallContext, CompactionReport, OplogConfig};
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> CliResult<()> {
    println!("Compacting journal at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let report = compact(path, dry_run)?;

    println!("Compaction Analysis:");
    println!("  Users:       {}", report.users);
    println!("  Operations:  {}", report.operations);
    println!();
    println!("  Size before: {} bytes", report.bytes_before);
    println!("  Size after:  {} bytes", report.bytes_after);
    let saved = report.bytes_before.saturating_sub(report.bytes_after);
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        saved,
        if report.bytes_before > 0 {
            (saved as f64 / report.bytes_before as f64) * 100.0
        } else {
            0.0
        }
    );

    if !dry_run {
        println!();
        println!("✓ Compaction complete");
    }

    Ok(())
}

/// Rewrites the journal as the minimal record set of the current state.
///
/// A dry run compacts an in-memory copy instead.
pub fn compact(path: &Path, dry_run: bool) -> CliResult<CompactionReport> {
    let log = if dry_run {
        open_snapshot(read_journal(path)?, OplogConfig::default())?
    } else {
        open_journal(path, OplogConfig::default())?
    };
    let report = log.compact(&CallContext::background())?;
    log.sync()?;
    Ok(report)
}
