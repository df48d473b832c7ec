//! # foldsync Storage
//!
//! Directory-oriented storage abstraction for foldsync.
//!
//! Storage implementations are **opaque byte stores** keyed by path. They
//! know nothing about update files, packs, snapshots or move records; the
//! replication engine owns all format interpretation.
//!
//! ## Design Principles
//!
//! - Every write is durable when the call returns (data synced)
//! - Missing files and directories are reported distinctly from I/O failure
//! - Removal is idempotent: removing something absent is not an error
//! - Must be `Send + Sync` so background tasks can share one handle
//!
//! ## Available Implementations
//!
//! - [`LocalStorage`] - OS filesystem, used against real (cloud-synced) roots
//! - [`MemoryStorage`] - For tests and crash simulation
//!
//! ## Example
//!
//! ```rust
//! use foldsync_storage::{MemoryStorage, Storage};
//! use std::path::Path;
//!
//! let storage = MemoryStorage::new();
//! storage.write_new(Path::new("/root/a.bin"), b"hello").unwrap();
//! assert_eq!(storage.read(Path::new("/root/a.bin")).unwrap(), b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod storage;

pub use error::{StorageError, StorageResult};
pub use file::LocalStorage;
pub use memory::MemoryStorage;
pub use storage::{copy_tree, DirEntry, Storage};
