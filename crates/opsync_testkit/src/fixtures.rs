//! Test fixtures and operation log helpers.
//!
//! Provides operation builders, a recording notifier and operation logs
//! that can be dropped and reopened over the same journal.

use crate::crash::SharedBackend;
use opsync_core::journal::JOURNAL_FILE_NAME;
use opsync_core::{
    BackendJournal, CallContext, ManualClock, Notifier, OperationLog, OplogConfig, OplogResult,
    PullOptions, PushOptions, PushOutcome,
};
use opsync_protocol::{DeviceId, Operation, OperationId, PushedOperation, UserId};
use opsync_storage::FileBackend;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Wall time every [`TestLog`] clock starts at.
pub const START_MS: u64 = 1_700_000_000_000;

/// Returns a fresh random operation id.
pub fn new_operation_id() -> OperationId {
    OperationId::new(uuid::Uuid::new_v4().to_string())
}

/// Creates an operation with a text payload naming its id.
pub fn op(id: &str, author: &str, created_at: u64) -> Operation {
    Operation::new(id, author, created_at, "note", format!("note {id}").into_bytes())
}

/// Creates a `deal` operation tracking the deal entity `deal`.
pub fn deal_op(id: &str, author: &str, created_at: u64, deal: &str) -> Operation {
    Operation::new(
        id,
        author,
        created_at,
        "deal",
        format!(r#"{{"deal":"{deal}","id":"{id}"}}"#).into_bytes(),
    )
    .tracking("deal", deal)
}

/// Returns the ids of `operations` as string slices.
pub fn ids_of(operations: &[Operation]) -> Vec<&str> {
    operations.iter().map(|op| op.id.as_str()).collect()
}

/// A [`Notifier`] that records every call.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(UserId, Vec<DeviceId>)>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded `(user, ignoring_devices)` calls in order.
    pub fn calls(&self) -> Vec<(UserId, Vec<DeviceId>)> {
        self.calls.lock().clone()
    }

    /// Returns how many times `user` was notified.
    pub fn count_for(&self, user: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(notified, _)| notified.as_str() == user)
            .count()
    }

    /// Forgets all recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify_update(&self, user: &UserId, ignoring_devices: &[DeviceId]) {
        self.calls
            .lock()
            .push((user.clone(), ignoring_devices.to_vec()));
    }
}

/// An operation log over a journal that outlives it.
///
/// The clock, notifier and journal bytes are kept across
/// [`TestLog::reopen`], which simulates a process restart.
pub struct TestLog {
    /// The log under test.
    pub log: OperationLog,
    /// The log's clock.
    pub clock: Arc<ManualClock>,
    /// The log's notifier.
    pub notifier: Arc<RecordingNotifier>,
    backend: SharedBackend,
    config: OplogConfig,
}

impl TestLog {
    /// Opens an empty log with the default configuration.
    pub fn new() -> Self {
        Self::with_config(OplogConfig::default())
    }

    /// Opens an empty log with `config`.
    pub fn with_config(config: OplogConfig) -> Self {
        Self::over(SharedBackend::new(), config)
    }

    /// Opens a log over existing journal bytes.
    pub fn over(backend: SharedBackend, config: OplogConfig) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let notifier = Arc::new(RecordingNotifier::new());
        let log = open_log(&backend, &config, &clock, &notifier).expect("failed to open log");
        Self {
            log,
            clock,
            notifier,
            backend,
            config,
        }
    }

    /// Drops the log and opens a new one over the same journal.
    pub fn reopen(self) -> Self {
        self.try_reopen().expect("failed to reopen log")
    }

    /// Like [`TestLog::reopen`], returning the open error.
    pub fn try_reopen(self) -> OplogResult<Self> {
        let Self {
            log,
            clock,
            notifier,
            backend,
            config,
        } = self;
        drop(log);
        let log = open_log(&backend, &config, &clock, &notifier)?;
        Ok(Self {
            log,
            clock,
            notifier,
            backend,
            config,
        })
    }

    /// Returns the journal backend.
    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Advances the clock.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Pushes `operations` for `user` from `device` with default options.
    pub fn push_as(
        &self,
        user: &str,
        device: &str,
        operations: Vec<Operation>,
    ) -> OplogResult<PushOutcome> {
        let pushed = operations.into_iter().map(PushedOperation::from).collect();
        self.log.push(
            &CallContext::background(),
            &UserId::from(user),
            &DeviceId::from(device),
            pushed,
            PushOptions::new(),
        )
    }

    /// Pulls for `device` and returns the delivered ids.
    pub fn pull_ids(&self, user: &str, device: &str) -> Vec<String> {
        self.log
            .pull(
                &CallContext::background(),
                &UserId::from(user),
                &DeviceId::from(device),
                PullOptions::new(),
            )
            .expect("pull failed")
            .operations
            .into_iter()
            .map(|op| op.id.as_str().to_owned())
            .collect()
    }

    /// Confirms `ids` for `device` and returns how many were new.
    pub fn confirm_ids(&self, user: &str, device: &str, ids: &[&str]) -> usize {
        let ids: Vec<OperationId> = ids.iter().map(|id| OperationId::from(*id)).collect();
        self.log
            .confirm(
                &CallContext::background(),
                &UserId::from(user),
                &DeviceId::from(device),
                &ids,
            )
            .expect("confirm failed")
            .newly_confirmed
    }

    /// Pulls for `device` and confirms everything delivered.
    pub fn sync_device(&self, user: &str, device: &str) -> Vec<String> {
        let pulled = self.pull_ids(user, device);
        let refs: Vec<&str> = pulled.iter().map(String::as_str).collect();
        self.confirm_ids(user, device, &refs);
        pulled
    }
}

impl Default for TestLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestLog {
    type Target = OperationLog;

    fn deref(&self) -> &Self::Target {
        &self.log
    }
}

fn open_log(
    backend: &SharedBackend,
    config: &OplogConfig,
    clock: &Arc<ManualClock>,
    notifier: &Arc<RecordingNotifier>,
) -> OplogResult<OperationLog> {
    let journal = BackendJournal::new(Box::new(backend.clone()));
    let log = OperationLog::open(config.clone(), Arc::new(journal), notifier.clone())?;
    Ok(log.with_clock(clock.clone()))
}

/// A temporary directory holding a journal file.
pub struct TempJournal {
    dir: TempDir,
}

impl TempJournal {
    /// Creates an empty temporary directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp directory"),
        }
    }

    /// Returns the journal file path.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join(JOURNAL_FILE_NAME)
    }

    /// Returns the directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Opens a file-backed log. Drop it before opening another one; the
    /// journal file is locked while open.
    pub fn open(&self, config: OplogConfig, clock: Arc<ManualClock>) -> OplogResult<OperationLog> {
        let backend = FileBackend::open(&self.path())?;
        let journal = BackendJournal::new(Box::new(backend));
        let notifier = Arc::new(RecordingNotifier::new());
        let log = OperationLog::open(config, Arc::new(journal), notifier)?;
        Ok(log.with_clock(clock))
    }

    /// Returns the size of the journal file, or 0 if absent.
    pub fn file_size(&self) -> u64 {
        std::fs::metadata(self.path()).map(|m| m.len()).unwrap_or(0)
    }

    /// Reads the journal file.
    pub fn read(&self) -> Vec<u8> {
        std::fs::read(self.path()).unwrap_or_default()
    }

    /// Overwrites the journal file.
    pub fn write(&self, bytes: &[u8]) {
        std::fs::write(self.path(), bytes).expect("failed to write journal");
    }
}

impl Default for TempJournal {
    fn default() -> Self {
        Self::new()
    }
}
