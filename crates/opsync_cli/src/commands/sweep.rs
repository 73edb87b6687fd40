//! Sweep command implementation.

use super::{open_journal, open_snapshot, read_journal, CliResult};
use opsync_core::{CallContext, OplogConfig, SweepReport};
use std::path::Path;
use std::time::Duration;

/// Runs the sweep command.
pub fn run(
    path: &Path,
    grace_secs: Option<u64>,
    stale_days: Option<u64>,
    dry_run: bool,
) -> CliResult<()> {
    let config = sweep_config(grace_secs, stale_days);
    println!("Sweeping journal at {:?}", path);
    println!(
        "  grace: {:?}, stale after: {:?}",
        config.retention_grace, config.device_stale_after
    );
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let report = sweep(path, config, dry_run)?;
    println!("  Users examined:  {}", report.users);
    println!("  Pruned:          {}", report.pruned);
    println!("  Gapped devices:  {}", report.gapped_devices);

    Ok(())
}

/// Builds the retention settings from command-line overrides.
pub fn sweep_config(grace_secs: Option<u64>, stale_days: Option<u64>) -> OplogConfig {
    let mut config = OplogConfig::default();
    if let Some(secs) = grace_secs {
        config = config.with_retention_grace(Duration::from_secs(secs));
    }
    if let Some(days) = stale_days {
        let secs = days.saturating_mul(24 * 60 * 60);
        config = config.with_device_stale_after(Duration::from_secs(secs));
    }
    config
}

/// Prunes every operation confirmed by all active devices.
///
/// A dry run sweeps an in-memory copy instead.
pub fn sweep(path: &Path, config: OplogConfig, dry_run: bool) -> CliResult<SweepReport> {
    let log = if dry_run {
        open_snapshot(read_journal(path)?, config)?
    } else {
        open_journal(path, config)?
    };
    let report = log.sweep(&CallContext::background())?;
    log.sync()?;
    Ok(report)
}
