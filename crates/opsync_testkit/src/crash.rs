//! Crash simulation for journal recovery tests.
//!
//! [`SharedBackend`] lets a test drop an operation log and reopen it over the
//! same bytes. [`CrashableBackend`] cuts a write short after a byte budget or
//! fails syncs, the way a power loss or a full disk would.
//!
//! ## Usage
//!
//! ```rust
//! use opsync_testkit::crash::{CrashableBackend, SharedBackend};
//! use opsync_storage::StorageBackend;
//!
//! let shared = SharedBackend::new();
//! let backend = CrashableBackend::new(shared.clone());
//! backend.crash_after(4);
//! assert!(backend.append(b"commit group").is_err());
//! assert_eq!(shared.size().unwrap(), 4);
//! ```

use opsync_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// In-memory bytes shared by every clone.
#[derive(Debug, Clone, Default)]
pub struct SharedBackend {
    inner: Arc<InMemoryBackend>,
}

impl SharedBackend {
    /// Creates an empty shared backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared backend holding `data`.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(InMemoryBackend::with_data(data)),
        }
    }

    /// Returns a copy of the stored bytes.
    pub fn data(&self) -> Vec<u8> {
        self.inner.data()
    }

    /// Makes writes fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.set_unavailable(unavailable);
    }
}

impl StorageBackend for SharedBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        self.inner.append(data)
    }

    fn flush(&self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn sync(&self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn replace(&self, data: &[u8]) -> StorageResult<()> {
        self.inner.replace(data)
    }
}

/// A backend wrapper that can simulate crashes.
///
/// Once crashed, every write fails until [`CrashableBackend::reset`]. A torn
/// write leaves its prefix in the inner backend and also refuses truncation,
/// so the partial bytes stay behind as a real crash would leave them.
#[derive(Debug)]
pub struct CrashableBackend<B = SharedBackend> {
    inner: B,
    crash_after_bytes: AtomicU64,
    bytes_written: AtomicU64,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
}

impl<B: StorageBackend> CrashableBackend<B> {
    /// Wraps `inner`.
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            crash_after_bytes: AtomicU64::new(u64::MAX),
            bytes_written: AtomicU64::new(0),
            crashed: AtomicBool::new(false),
            fail_on_sync: AtomicBool::new(false),
        }
    }

    /// Crashes once `bytes` more bytes have been written.
    pub fn crash_after(&self, bytes: u64) {
        self.bytes_written.store(0, Ordering::SeqCst);
        self.crash_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Makes flush and sync fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Clears the crash state.
    pub fn reset(&self) {
        self.crash_after_bytes.store(u64::MAX, Ordering::SeqCst);
        self.bytes_written.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.fail_on_sync.store(false, Ordering::SeqCst);
    }

    /// Returns true if a simulated crash happened.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    fn crash(&self, what: &str) -> StorageError {
        self.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("simulated crash during {what}"),
        ))
    }
}

impl<B: StorageBackend> StorageBackend for CrashableBackend<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        if self.has_crashed() {
            return Err(self.crash("write"));
        }
        let len = data.len() as u64;
        let written = self.bytes_written.fetch_add(len, Ordering::SeqCst);
        let threshold = self.crash_after_bytes.load(Ordering::SeqCst);

        if written.saturating_add(len) > threshold {
            let partial = threshold.saturating_sub(written) as usize;
            if partial > 0 {
                self.inner.append(&data[..partial])?;
            }
            return Err(self.crash("partial write"));
        }

        self.inner.append(data)
    }

    fn flush(&self) -> StorageResult<()> {
        if self.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.crash("flush"));
        }
        self.inner.flush()
    }

    fn sync(&self) -> StorageResult<()> {
        if self.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.crash("sync"));
        }
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(self.crash("truncate"));
        }
        self.inner.truncate(new_size)
    }

    fn replace(&self, data: &[u8]) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(self.crash("replace"));
        }
        self.inner.replace(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_bytes() {
        let a = SharedBackend::new();
        let b = a.clone();
        a.append(b"xyz").unwrap();
        assert_eq!(b.data(), b"xyz");
    }

    #[test]
    fn torn_write_keeps_prefix() {
        let shared = SharedBackend::new();
        let backend = CrashableBackend::new(shared.clone());
        backend.append(b"abc").unwrap();
        backend.crash_after(2);

        assert!(backend.append(b"defg").is_err());
        assert!(backend.has_crashed());
        assert_eq!(shared.data(), b"abcde");
        assert!(backend.truncate(3).is_err());

        backend.reset();
        backend.truncate(3).unwrap();
        assert_eq!(shared.data(), b"abc");
    }
}
