//! # evlog storage
//!
//! Lowest layer of the segment store. A [`StorageBackend`] is an opaque,
//! append-only byte store; a [`Volume`] is a named collection of backends
//! living under one root (a directory on disk, or a map in memory).
//!
//! Nothing in this crate knows about blocks, WAL records or metadata.
//! Those formats are owned by `evlog_core`.
//!
//! ## Example
//!
//! ```rust
//! use evlog_storage::{MemoryVolume, StorageBackend, Volume};
//!
//! let volume = MemoryVolume::new();
//! let mut backend = volume.open("block-1.dat").unwrap();
//! let offset = backend.append(b"entry").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"entry");
//! assert_eq!(volume.list().unwrap(), vec!["block-1.dat".to_string()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod volume;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use volume::{FileVolume, MemoryVolume, Volume};
