//! CLI command implementations.

pub mod compact;
pub mod dump_journal;
pub mod inspect;
pub mod sweep;
pub mod verify;

use opsync_core::journal::JOURNAL_FILE_NAME;
use opsync_core::{BackendJournal, NullNotifier, OperationLog, OplogConfig, OplogError};
use opsync_storage::{FileBackend, InMemoryBackend, StorageBackend, StorageError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No journal file in the data directory.
    #[error("journal not found at {0}")]
    JournalNotFound(PathBuf),

    /// The journal failed verification.
    #[error("journal verification failed: {0} issue(s)")]
    VerificationFailed(usize),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The operation log refused to open or run.
    #[error(transparent)]
    Oplog(#[from] OplogError),

    /// JSON output failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns the journal path inside `dir`, failing if it does not exist.
pub fn journal_path(dir: &Path) -> CliResult<PathBuf> {
    let path = dir.join(JOURNAL_FILE_NAME);
    if !path.is_file() {
        return Err(CliError::JournalNotFound(path));
    }
    Ok(path)
}

/// Reads the whole journal of `dir`. Holds the journal lock while reading.
pub fn read_journal(dir: &Path) -> CliResult<Vec<u8>> {
    let path = journal_path(dir)?;
    let backend = FileBackend::open(&path)?;
    let bytes = backend.read_all()?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "journal read");
    Ok(bytes)
}

/// Opens an operation log over an in-memory copy of `bytes`.
///
/// Nothing done to the returned log reaches the journal file.
pub fn open_snapshot(bytes: Vec<u8>, config: OplogConfig) -> CliResult<OperationLog> {
    let journal = BackendJournal::new(Box::new(InMemoryBackend::with_data(bytes)));
    Ok(OperationLog::open(
        config,
        Arc::new(journal),
        Arc::new(NullNotifier),
    )?)
}

/// Opens the operation log of `dir` for writing.
pub fn open_journal(dir: &Path, config: OplogConfig) -> CliResult<OperationLog> {
    let path = journal_path(dir)?;
    tracing::debug!(path = %path.display(), "opening journal for writing");
    let backend = FileBackend::open(&path)?;
    let journal = BackendJournal::new(Box::new(backend));
    Ok(OperationLog::open(
        config,
        Arc::new(journal),
        Arc::new(NullNotifier),
    )?)
}
