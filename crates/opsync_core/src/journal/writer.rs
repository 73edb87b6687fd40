//! Journal over a [`StorageBackend`].

use crate::error::{OplogError, OplogResult};
use crate::journal::reader::FrameIter;
use crate::journal::record::JournalRecord;
use crate::journal::{Journal, Replay};
use opsync_storage::StorageBackend;
use parking_lot::Mutex;

/// A [`Journal`] writing framed commit groups to a storage backend.
///
/// A group is written in two steps: `BEGIN` and the records first, then the
/// `COMMIT` frame once the body is durable. A failed sync therefore never
/// leaves a `COMMIT` behind for a group whose body may be lost.
///
/// If a failed group cannot be cut off again, the journal refuses every
/// commit until the cut succeeds or the journal is replayed.
pub struct BackendJournal {
    backend: Box<dyn StorageBackend>,
    /// Holding the lock serializes commits.
    state: Mutex<WriterState>,
    sync_on_commit: bool,
}

#[derive(Debug)]
struct WriterState {
    next_group: u64,
    /// Length to cut the journal back to before the next commit.
    repair_to: Option<u64>,
}

impl BackendJournal {
    /// Creates a journal over `backend`. Commits are synced by default.
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(WriterState {
                next_group: 1,
                repair_to: None,
            }),
            sync_on_commit: true,
        }
    }

    /// Sets whether each commit is synced to durable media before returning.
    ///
    /// Without syncing, commits are only flushed to the operating system.
    pub fn with_sync_on_commit(mut self, enabled: bool) -> Self {
        self.sync_on_commit = enabled;
        self
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Returns an iterator over every frame, committed or not.
    pub fn frames(&self) -> OplogResult<FrameIter<'_>> {
        FrameIter::new(self.backend.as_ref(), 0)
    }

    /// Returns true if a failed group is still waiting to be cut off.
    pub fn needs_repair(&self) -> bool {
        self.state.lock().repair_to.is_some()
    }

    fn encode_body(group: u64, records: Vec<JournalRecord>) -> OplogResult<Vec<u8>> {
        let mut bytes = JournalRecord::Begin { group }.encode_frame()?;
        for record in records {
            if matches!(
                record,
                JournalRecord::Begin { .. } | JournalRecord::Commit { .. }
            ) {
                return Err(OplogError::internal("group markers inside a commit group"));
            }
            bytes.extend_from_slice(&record.encode_frame()?);
        }
        Ok(bytes)
    }

    fn encode_group(group: u64, records: Vec<JournalRecord>) -> OplogResult<Vec<u8>> {
        let mut bytes = Self::encode_body(group, records)?;
        bytes.extend_from_slice(&JournalRecord::Commit { group }.encode_frame()?);
        Ok(bytes)
    }

    fn write_group(&self, body: &[u8], commit: &[u8]) -> OplogResult<()> {
        self.backend.append(body)?;
        self.persist()?;
        self.backend.append(commit)?;
        self.persist()
    }

    fn persist(&self) -> OplogResult<()> {
        if self.sync_on_commit {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(())
    }

    fn cut_to(&self, len: u64) -> OplogResult<()> {
        if self.backend.size()? > len {
            self.backend.truncate(len)?;
        }
        Ok(())
    }

    /// Cuts off a previously failed group, if any.
    fn repair(&self, state: &mut WriterState) -> OplogResult<()> {
        let Some(len) = state.repair_to else {
            return Ok(());
        };
        match self.cut_to(len) {
            Ok(()) => {
                state.repair_to = None;
                tracing::info!(len, "partial commit group cut off");
                Ok(())
            }
            Err(err) => Err(OplogError::StorageUnavailable(format!(
                "journal holds a failed commit group past offset {len}: {err}"
            ))),
        }
    }
}

impl Journal for BackendJournal {
    fn commit(&self, records: Vec<JournalRecord>) -> OplogResult<u64> {
        let mut state = self.state.lock();
        self.repair(&mut state)?;

        let group = state.next_group;
        let body = Self::encode_body(group, records)?;
        let commit = JournalRecord::Commit { group }.encode_frame()?;

        let prior = self.backend.size()?;
        if let Err(err) = self.write_group(&body, &commit) {
            // Replay must never see this group, even if the COMMIT frame
            // reached the backend before a failed sync.
            if let Err(cleanup) = self.cut_to(prior) {
                tracing::warn!(
                    group,
                    error = %cleanup,
                    "failed to cut off partial commit group; refusing commits until it is"
                );
                state.repair_to = Some(prior);
            }
            return Err(err);
        }

        state.next_group += 1;
        tracing::trace!(
            group,
            bytes = body.len() + commit.len(),
            "journal group committed"
        );
        Ok(group)
    }

    fn replay(&self) -> OplogResult<Replay> {
        let mut state = self.state.lock();
        let mut replay = Replay::default();
        let mut open: Option<(u64, Vec<JournalRecord>)> = None;
        let mut committed_end = 0u64;

        let mut frames = FrameIter::new(self.backend.as_ref(), 0)?;
        for frame in frames.by_ref() {
            let frame = frame?;
            match frame.record {
                JournalRecord::Begin { group } => {
                    if let Some((abandoned, records)) = open.take() {
                        tracing::warn!(
                            group = abandoned,
                            records = records.len(),
                            offset = frame.offset,
                            "discarding commit group without COMMIT"
                        );
                    }
                    open = Some((group, Vec::new()));
                }
                JournalRecord::Commit { group } => match open.take() {
                    Some((begun, records)) if begun == group => {
                        replay.records.extend(records);
                        replay.groups += 1;
                        replay.last_group = replay.last_group.max(group);
                        committed_end = frame.end();
                    }
                    _ => {
                        return Err(OplogError::JournalCorrupted(format!(
                            "COMMIT for group {group} at offset {} has no matching BEGIN",
                            frame.offset
                        )));
                    }
                },
                record => match open.as_mut() {
                    Some((_, records)) => records.push(record),
                    None => {
                        return Err(OplogError::JournalCorrupted(format!(
                            "{} record at offset {} outside a commit group",
                            record.record_type().label(),
                            frame.offset
                        )));
                    }
                },
            }
        }

        let size = frames.journal_size();
        if committed_end < size {
            replay.discarded_bytes = size - committed_end;
            tracing::warn!(
                discarded = replay.discarded_bytes,
                committed_end,
                "truncating torn journal tail"
            );
            self.backend.truncate(committed_end)?;
        }

        state.next_group = replay.last_group + 1;
        state.repair_to = None;
        tracing::debug!(
            groups = replay.groups,
            records = replay.records.len(),
            "journal replayed"
        );
        Ok(replay)
    }

    fn rewrite(&self, records: Vec<JournalRecord>) -> OplogResult<()> {
        let mut state = self.state.lock();
        let group = state.next_group;
        let bytes = Self::encode_group(group, records)?;
        self.backend.replace(&bytes)?;
        state.next_group += 1;
        state.repair_to = None;
        tracing::info!(group, bytes = bytes.len(), "journal rewritten");
        Ok(())
    }

    fn sync(&self) -> OplogResult<()> {
        self.backend.sync()?;
        Ok(())
    }

    fn size(&self) -> OplogResult<u64> {
        Ok(self.backend.size()?)
    }
}

impl std::fmt::Debug for BackendJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendJournal")
            .field("sync_on_commit", &self.sync_on_commit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_protocol::{DeviceId, UserId};
    use opsync_storage::{InMemoryBackend, StorageError, StorageResult};
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn reset(device: &str) -> JournalRecord {
        JournalRecord::ResetCursor {
            user: UserId::from("alice"),
            device: DeviceId::from(device),
            seen_ms: 1,
        }
    }

    fn journal_over(data: Vec<u8>) -> BackendJournal {
        BackendJournal::new(Box::new(InMemoryBackend::with_data(data)))
    }

    #[test]
    fn commit_then_replay() {
        let journal = BackendJournal::new(Box::new(InMemoryBackend::new()));
        assert_eq!(journal.commit(vec![reset("a")]).unwrap(), 1);
        assert_eq!(journal.commit(vec![reset("b"), reset("c")]).unwrap(), 2);

        let replay = journal.replay().unwrap();
        assert_eq!(replay.groups, 2);
        assert_eq!(replay.last_group, 2);
        assert_eq!(replay.records, vec![reset("a"), reset("b"), reset("c")]);
        assert_eq!(replay.discarded_bytes, 0);
    }

    #[test]
    fn group_numbers_continue_after_replay() {
        let journal = BackendJournal::new(Box::new(InMemoryBackend::new()));
        journal.commit(vec![reset("a")]).unwrap();
        let data = journal.backend().read_all().unwrap();

        let reopened = journal_over(data);
        reopened.replay().unwrap();
        assert_eq!(reopened.commit(vec![reset("b")]).unwrap(), 2);
    }

    #[test]
    fn torn_group_is_discarded_and_truncated() {
        let journal = BackendJournal::new(Box::new(InMemoryBackend::new()));
        journal.commit(vec![reset("a")]).unwrap();
        let committed = journal.size().unwrap();
        journal.commit(vec![reset("b")]).unwrap();

        // Drop the final COMMIT frame and a few bytes more.
        let mut data = journal.backend().read_all().unwrap();
        data.truncate(data.len() - 20);
        let torn = journal_over(data);

        let replay = torn.replay().unwrap();
        assert_eq!(replay.records, vec![reset("a")]);
        assert!(replay.discarded_bytes > 0);
        assert_eq!(torn.size().unwrap(), committed);

        // Replaying the repaired journal is stable.
        let again = torn.replay().unwrap();
        assert_eq!(again.records, vec![reset("a")]);
        assert_eq!(again.discarded_bytes, 0);
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let journal = BackendJournal::new(Box::new(InMemoryBackend::new()));
        journal.commit(vec![reset("a")]).unwrap();
        let mut data = journal.backend().read_all().unwrap();
        data[20] ^= 0xFF;

        let damaged = journal_over(data);
        assert!(matches!(
            damaged.replay(),
            Err(OplogError::ChecksumMismatch { .. }) | Err(OplogError::Codec(_))
        ));
    }

    #[test]
    fn failed_commit_leaves_journal_unchanged() {
        let journal = BackendJournal::new(Box::new(InMemoryBackend::new()));
        journal.commit(vec![reset("a")]).unwrap();
        let before = journal.size().unwrap();

        let backend = InMemoryBackend::with_data(journal.backend().read_all().unwrap());
        backend.set_unavailable(true);
        let failing = BackendJournal::new(Box::new(backend));

        let err = failing.commit(vec![reset("b")]).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(failing.size().unwrap(), before);
    }

    /// Memory backend whose syncs and truncations can be made to fail.
    /// Clones share state.
    #[derive(Clone, Default)]
    struct FlakyBackend(Arc<Flaky>);

    #[derive(Default)]
    struct Flaky {
        bytes: InMemoryBackend,
        fail_sync: AtomicBool,
        fail_truncate: AtomicBool,
    }

    impl FlakyBackend {
        fn failing(&self, sync: bool, truncate: bool) {
            self.0.fail_sync.store(sync, Ordering::SeqCst);
            self.0.fail_truncate.store(truncate, Ordering::SeqCst);
        }

        fn data(&self) -> Vec<u8> {
            self.0.bytes.data()
        }
    }

    fn refused(what: &str) -> StorageError {
        StorageError::Io(io::Error::other(format!("{what} failed")))
    }

    impl StorageBackend for FlakyBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.0.bytes.read_at(offset, len)
        }

        fn append(&self, data: &[u8]) -> StorageResult<u64> {
            self.0.bytes.append(data)
        }

        fn flush(&self) -> StorageResult<()> {
            self.sync()
        }

        fn sync(&self) -> StorageResult<()> {
            if self.0.fail_sync.load(Ordering::SeqCst) {
                return Err(refused("sync"));
            }
            self.0.bytes.sync()
        }

        fn size(&self) -> StorageResult<u64> {
            self.0.bytes.size()
        }

        fn truncate(&self, new_size: u64) -> StorageResult<()> {
            if self.0.fail_truncate.load(Ordering::SeqCst) {
                return Err(refused("truncate"));
            }
            self.0.bytes.truncate(new_size)
        }

        fn replace(&self, data: &[u8]) -> StorageResult<()> {
            self.0.bytes.replace(data)
        }
    }

    #[test]
    fn failed_sync_never_leaves_a_commit_frame() {
        let backend = FlakyBackend::default();
        let journal = BackendJournal::new(Box::new(backend.clone()));
        journal.commit(vec![reset("a")]).unwrap();
        let committed = journal.size().unwrap();

        backend.failing(true, true);
        assert!(journal.commit(vec![reset("b")]).unwrap_err().is_retryable());
        assert!(journal.needs_repair());
        assert!(journal.size().unwrap() > committed);

        // The orphaned body is discarded by a replay from the same bytes.
        let copy = journal_over(backend.data());
        assert_eq!(copy.replay().unwrap().records, vec![reset("a")]);
    }

    #[test]
    fn commits_wait_for_the_failed_group_to_be_cut() {
        let backend = FlakyBackend::default();
        let journal = BackendJournal::new(Box::new(backend.clone()));
        journal.commit(vec![reset("a")]).unwrap();
        let committed = journal.size().unwrap();

        backend.failing(true, true);
        journal.commit(vec![reset("b")]).unwrap_err();
        let orphaned = journal.size().unwrap();

        backend.failing(false, true);
        let err = journal.commit(vec![reset("c")]).unwrap_err();
        assert!(matches!(err, OplogError::StorageUnavailable(_)));
        assert_eq!(journal.size().unwrap(), orphaned);

        backend.failing(false, false);
        assert_eq!(journal.commit(vec![reset("c")]).unwrap(), 2);
        assert!(!journal.needs_repair());
        assert!(journal.size().unwrap() > committed);

        let replay = journal.replay().unwrap();
        assert_eq!(replay.records, vec![reset("a"), reset("c")]);
        assert_eq!(replay.last_group, 2);
    }

    #[test]
    fn rewrite_replaces_content() {
        let journal = BackendJournal::new(Box::new(InMemoryBackend::new()));
        journal.commit(vec![reset("a")]).unwrap();
        journal.commit(vec![reset("b")]).unwrap();

        journal.rewrite(vec![reset("c")]).unwrap();
        let replay = journal.replay().unwrap();
        assert_eq!(replay.records, vec![reset("c")]);
        assert_eq!(replay.groups, 1);
    }

    #[test]
    fn record_outside_group_is_corruption() {
        let data = reset("a").encode_frame().unwrap();
        let journal = journal_over(data);
        assert!(matches!(
            journal.replay(),
            Err(OplogError::JournalCorrupted(_))
        ));
    }
}
