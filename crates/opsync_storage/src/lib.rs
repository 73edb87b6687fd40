//! # opsync storage
//!
//! Byte-level storage capability underneath the opsync operation journal.
//!
//! Backends are **opaque append-only byte stores**. They know nothing about
//! journal framing, operations or users; `opsync_core` owns every byte format
//! written through them.
//!
//! ## Design Principles
//!
//! - A single `append` call is the unit the journal relies on for commit groups
//! - All methods take `&self`; backends synchronize internally
//! - `replace` swaps the whole content atomically (used by compaction)
//! - Must be `Send + Sync` to be shared by the engine's request threads
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral servers
//! - [`FileBackend`] - Single journal file with an exclusive advisory lock
//!
//! ## Example
//!
//! ```rust
//! use opsync_storage::{StorageBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! let offset = backend.append(b"commit group").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"commit");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
