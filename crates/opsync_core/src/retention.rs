//! Acknowledgment-driven retention.
//!
//! An operation is pruned when all of the following hold:
//! - it was appended at least `retention_grace` ago
//! - every non-stale device of the user confirmed it
//! - the user has at least one non-stale device
//!
//! Stale devices (unseen for longer than `device_stale_after`) do not block
//! pruning. A stale device that never confirmed a pruned operation gets its
//! history gap flag set, and so does any device registered after a prune.

use crate::config::OplogConfig;
use crate::cursor::DeviceCursor;
use crate::store::UserLog;
use opsync_protocol::DeviceId;

/// Time thresholds of a retention sweep, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Minimum age since append.
    pub grace_ms: u64,
    /// Inactivity after which a device stops blocking pruning.
    pub stale_after_ms: u64,
}

impl RetentionPolicy {
    /// Derives the policy from the log configuration.
    pub fn from_config(config: &OplogConfig) -> Self {
        Self {
            grace_ms: duration_ms(config.retention_grace),
            stale_after_ms: duration_ms(config.device_stale_after),
        }
    }
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Operations a sweep will remove from one user's log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    /// Sequences to prune, ascending.
    pub sequences: Vec<u64>,
    /// Stale devices that never confirmed at least one of them.
    pub gapped: Vec<DeviceId>,
}

impl PrunePlan {
    /// Returns true if nothing is to be pruned.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

/// Returns true if some live operation of `log` is past the grace period.
pub fn any_due(policy: RetentionPolicy, now_ms: u64, log: &UserLog) -> bool {
    log.iter()
        .any(|stored| now_ms.saturating_sub(stored.appended_at_ms) >= policy.grace_ms)
}

/// Computes what a sweep at `now_ms` prunes from `log`.
pub fn plan<'a, I>(policy: RetentionPolicy, now_ms: u64, log: &UserLog, cursors: I) -> PrunePlan
where
    I: IntoIterator<Item = (&'a DeviceId, &'a DeviceCursor)>,
{
    let (active, stale): (Vec<_>, Vec<_>) = cursors
        .into_iter()
        .partition(|(_, cursor)| !cursor.is_stale(now_ms, policy.stale_after_ms));

    if active.is_empty() {
        return PrunePlan::default();
    }

    let sequences: Vec<u64> = log
        .iter()
        .filter(|stored| now_ms.saturating_sub(stored.appended_at_ms) >= policy.grace_ms)
        .filter(|stored| {
            active
                .iter()
                .all(|(_, cursor)| cursor.is_confirmed(stored.sequence))
        })
        .map(|stored| stored.sequence)
        .collect();

    if sequences.is_empty() {
        return PrunePlan::default();
    }

    let mut gapped: Vec<DeviceId> = stale
        .into_iter()
        .filter(|(_, cursor)| sequences.iter().any(|&seq| !cursor.is_confirmed(seq)))
        .map(|(device, _)| device.clone())
        .collect();
    gapped.sort();

    PrunePlan { sequences, gapped }
}

/// Totals of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Users whose logs were examined.
    pub users: usize,
    /// Operations pruned.
    pub pruned: usize,
    /// Devices newly flagged with a history gap.
    pub gapped_devices: usize,
}

impl SweepReport {
    /// Adds another report into this one.
    pub fn merge(&mut self, other: SweepReport) {
        self.users += other.users;
        self.pruned += other.pruned;
        self.gapped_devices += other.gapped_devices;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoredOperation;
    use opsync_protocol::Operation;
    use std::sync::Arc;

    const DAY: u64 = 86_400_000;

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            grace_ms: DAY,
            stale_after_ms: 30 * DAY,
        }
    }

    fn log_with(appended: &[u64]) -> UserLog {
        let mut log = UserLog::new();
        for (i, &at) in appended.iter().enumerate() {
            let seq = i as u64 + 1;
            log.insert(StoredOperation {
                sequence: seq,
                appended_at_ms: at,
                operation: Arc::new(Operation::new(
                    format!("op{seq}"),
                    "alice",
                    at,
                    "deal",
                    Vec::new(),
                )),
            });
        }
        log
    }

    fn confirmed(seen_ms: u64, seqs: &[u64]) -> DeviceCursor {
        let mut cursor = DeviceCursor::new(0, seen_ms, false);
        cursor.confirm_sequences(seqs.iter().copied());
        cursor
    }

    #[test]
    fn one_of_two_confirmations_never_prunes() {
        let log = log_with(&[0]);
        let a = DeviceId::from("a");
        let b = DeviceId::from("b");
        let ca = confirmed(10 * DAY, &[1]);
        let cb = confirmed(10 * DAY, &[]);

        let plan = plan(policy(), 10 * DAY, &log, [(&a, &ca), (&b, &cb)]);
        assert!(plan.is_empty());
    }

    #[test]
    fn all_confirmations_prune() {
        let log = log_with(&[0, 0]);
        let a = DeviceId::from("a");
        let b = DeviceId::from("b");
        let ca = confirmed(10 * DAY, &[1, 2]);
        let cb = confirmed(10 * DAY, &[1]);

        let plan = plan(policy(), 10 * DAY, &log, [(&a, &ca), (&b, &cb)]);
        assert_eq!(plan.sequences, vec![1]);
        assert!(plan.gapped.is_empty());
    }

    #[test]
    fn grace_period_holds_back_young_operations() {
        let log = log_with(&[0, 10 * DAY]);
        let a = DeviceId::from("a");
        let ca = confirmed(10 * DAY, &[1, 2]);

        let plan = plan(policy(), 10 * DAY + 1, &log, [(&a, &ca)]);
        assert_eq!(plan.sequences, vec![1]);
    }

    #[test]
    fn stale_device_does_not_block_but_is_gapped() {
        let log = log_with(&[0]);
        let active = DeviceId::from("active");
        let gone = DeviceId::from("gone");
        let ca = confirmed(40 * DAY, &[1]);
        let cg = confirmed(0, &[]);

        let plan = plan(policy(), 40 * DAY, &log, [(&active, &ca), (&gone, &cg)]);
        assert_eq!(plan.sequences, vec![1]);
        assert_eq!(plan.gapped, vec![gone]);
    }

    #[test]
    fn no_active_device_prunes_nothing() {
        let log = log_with(&[0]);
        let gone = DeviceId::from("gone");
        let cg = confirmed(0, &[1]);

        assert!(plan(policy(), 40 * DAY, &log, [(&gone, &cg)]).is_empty());
        assert!(plan(policy(), 40 * DAY, &log, std::iter::empty()).is_empty());
    }
}
