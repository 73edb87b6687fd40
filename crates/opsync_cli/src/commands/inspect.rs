//! Inspect command implementation.

use super::{open_snapshot, read_journal, CliResult};
use opsync_core::journal::JournalRecord;
use opsync_core::{BackendJournal, OplogConfig, UserSummary};
use opsync_storage::InMemoryBackend;
use serde::Serialize;
use std::path::Path;

/// Journal inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory.
    pub path: String,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Number of complete frames.
    pub frame_count: usize,
    /// Number of committed groups.
    pub group_count: usize,
    /// Live operations across all users.
    pub live_operations: usize,
    /// Pruned operations across all users.
    pub pruned_operations: u64,
    /// Per-user state, ordered by user id.
    pub users: Vec<UserInfo>,
}

/// State of one user's log.
#[derive(Debug, Serialize)]
pub struct UserInfo {
    /// User id.
    pub user: String,
    /// Highest sequence assigned.
    pub head: u64,
    /// Live operations.
    pub live_operations: usize,
    /// Operations pruned so far.
    pub pruned_total: u64,
    /// Number of registered devices.
    pub device_count: usize,
    /// Device details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<DeviceInfo>>,
}

/// Delivery state of one device.
#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    /// Device id.
    pub device: String,
    /// Contiguous confirmation watermark.
    pub confirmed_through: u64,
    /// Live operations not yet confirmed.
    pub pending: usize,
    /// Highest sequence delivered.
    pub last_pulled: u64,
    /// Wall time of the last activity (Unix millis).
    pub last_seen_ms: u64,
    /// The device may have missed pruned operations.
    pub history_gap: bool,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_devices: bool, format: &str) -> CliResult<()> {
    let result = inspect(path, show_devices)?;

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

/// Collects the inspection result without modifying the journal.
pub fn inspect(path: &Path, show_devices: bool) -> CliResult<InspectResult> {
    let bytes = read_journal(path)?;
    let journal_size = bytes.len() as u64;

    let scan = BackendJournal::new(Box::new(InMemoryBackend::with_data(bytes.clone())));
    let mut frame_count = 0;
    let mut group_count = 0;
    for frame in scan.frames()? {
        let frame = frame?;
        frame_count += 1;
        if matches!(frame.record, JournalRecord::Commit { .. }) {
            group_count += 1;
        }
    }

    let log = open_snapshot(bytes, OplogConfig::default())?;
    let users: Vec<UserInfo> = log
        .users()
        .iter()
        .filter_map(|user| log.user_summary(user))
        .map(|summary| user_info(summary, show_devices))
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        journal_size,
        frame_count,
        group_count,
        live_operations: users.iter().map(|u| u.live_operations).sum(),
        pruned_operations: users.iter().map(|u| u.pruned_total).sum(),
        users,
    })
}

fn user_info(summary: UserSummary, show_devices: bool) -> UserInfo {
    let device_count = summary.devices.len();
    let devices = show_devices.then(|| {
        summary
            .devices
            .into_iter()
            .map(|d| DeviceInfo {
                device: d.device.to_string(),
                confirmed_through: d.confirmed_through,
                pending: d.pending,
                last_pulled: d.last_pulled,
                last_seen_ms: d.last_seen_ms,
                history_gap: d.history_gap,
            })
            .collect()
    });

    UserInfo {
        user: summary.user.to_string(),
        head: summary.head,
        live_operations: summary.live_operations,
        pruned_total: summary.pruned_total,
        device_count,
        devices,
    }
}

fn print_text_output(result: &InspectResult) {
    println!("opsync journal: {}", result.path);
    println!("================");
    println!();
    println!("Journal:");
    println!("  Size:    {} bytes", result.journal_size);
    println!("  Frames:  {}", result.frame_count);
    println!("  Groups:  {}", result.group_count);
    println!();
    println!("Operations:");
    println!("  Live:    {}", result.live_operations);
    println!("  Pruned:  {}", result.pruned_operations);
    println!();
    println!("Users ({}):", result.users.len());

    for user in &result.users {
        println!(
            "  {:20} head={} live={} pruned={} devices={}",
            user.user, user.head, user.live_operations, user.pruned_total, user.device_count
        );
        for device in user.devices.iter().flatten() {
            print!(
                "    {:18} confirmed_through={} pending={} last_pulled={}",
                device.device, device.confirmed_through, device.pending, device.last_pulled
            );
            if device.history_gap {
                print!(" HISTORY-GAP");
            }
            println!();
        }
    }
}
