//! Per-device delivery and acknowledgment state.
//!
//! Confirmation is set-based: a device may confirm any live sequence in any
//! order. Confirmed sequences are kept as a watermark plus a sparse set above
//! it; whenever the set becomes contiguous with the watermark it is folded in,
//! so steady in-order confirmation keeps the set empty.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Delivery state of one device of one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCursor {
    /// Every sequence `<= confirmed_through` is confirmed or gone.
    pub confirmed_through: u64,
    /// Confirmed sequences above the watermark.
    pub confirmed_ahead: BTreeSet<u64>,
    /// Highest sequence ever delivered by a pull.
    pub last_pulled: u64,
    /// Wall time of the last push, pull or confirm from the device.
    pub last_seen_ms: u64,
    /// Log head when the device was first seen.
    pub registered_at: u64,
    /// The device may have missed pruned operations.
    pub history_gap: bool,
}

impl DeviceCursor {
    /// Creates the cursor of a device seen for the first time.
    pub fn new(registered_at: u64, seen_ms: u64, history_gap: bool) -> Self {
        Self {
            registered_at,
            last_seen_ms: seen_ms,
            history_gap,
            ..Self::default()
        }
    }

    /// Returns true if `sequence` is confirmed (or no longer exists).
    pub fn is_confirmed(&self, sequence: u64) -> bool {
        sequence <= self.confirmed_through || self.confirmed_ahead.contains(&sequence)
    }

    /// Marks `sequences` confirmed and returns the ones that were not yet,
    /// in ascending order.
    pub fn confirm_sequences<I>(&mut self, sequences: I) -> Vec<u64>
    where
        I: IntoIterator<Item = u64>,
    {
        let mut newly: Vec<u64> = sequences
            .into_iter()
            .filter(|&seq| seq > 0 && !self.is_confirmed(seq))
            .collect();
        newly.sort_unstable();
        newly.dedup();

        self.confirmed_ahead.extend(newly.iter().copied());
        self.compact();
        newly
    }

    /// Settles sequences that were removed from the log.
    ///
    /// They no longer block the watermark. Returns true if any of them had
    /// not been confirmed, meaning the device never acknowledged it.
    pub fn settle<I>(&mut self, gone: I) -> bool
    where
        I: IntoIterator<Item = u64>,
    {
        let missed = self.confirm_sequences(gone);
        !missed.is_empty()
    }

    /// Treats every sequence up to `floor` as gone.
    ///
    /// Used when the log holds nothing at or below `floor`, so the watermark
    /// can skip it without confirming each sequence.
    pub fn settle_through(&mut self, floor: u64) {
        if floor > self.confirmed_through {
            self.confirmed_through = floor;
            self.compact();
        }
    }

    /// Forgets all confirmations and the history gap.
    pub fn reset(&mut self) {
        self.confirmed_through = 0;
        self.confirmed_ahead.clear();
        self.last_pulled = 0;
        self.history_gap = false;
    }

    /// Records activity at `now_ms`. Wall time never moves backwards here.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_seen_ms = self.last_seen_ms.max(now_ms);
    }

    /// Records that sequences up to `sequence` were delivered.
    pub fn mark_pulled(&mut self, sequence: u64) {
        self.last_pulled = self.last_pulled.max(sequence);
    }

    /// Returns true if the device was unseen for longer than `stale_after_ms`.
    pub fn is_stale(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) > stale_after_ms
    }

    fn compact(&mut self) {
        while self.confirmed_ahead.remove(&(self.confirmed_through + 1)) {
            self.confirmed_through += 1;
        }
        // Entries at or below the watermark are redundant.
        let above = self.confirmed_ahead.split_off(&(self.confirmed_through + 1));
        self.confirmed_ahead = above;
    }
}
