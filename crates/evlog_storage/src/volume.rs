//! Named backend collections.
//!
//! A segment server owns exactly one volume. Block files, the shared WAL and
//! the metadata stores all live in it under fixed names.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// A root under which backends are opened by name.
pub trait Volume: Send + Sync + std::fmt::Debug {
    /// Opens the backend called `name`, creating it empty when absent.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name or an I/O error.
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Whether a backend called `name` exists.
    fn exists(&self, name: &str) -> bool;

    /// Removes the backend called `name`. Removing a missing name is a no-op.
    ///
    /// # Errors
    ///
    /// Fails on an I/O error.
    fn remove(&self, name: &str) -> StorageResult<()>;

    /// Names of all backends, sorted.
    ///
    /// # Errors
    ///
    /// Fails on an I/O error.
    fn list(&self) -> StorageResult<Vec<String>>;
}

fn check_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && name != LOCK_FILE
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

/// A directory on disk, held with an exclusive advisory lock.
///
/// ```text
/// <root>/
/// ├─ LOCK
/// ├─ wal.log
/// ├─ meta.sync
/// ├─ meta.async
/// └─ block-00000000000000001001.dat
/// ```
#[derive(Debug)]
pub struct FileVolume {
    root: PathBuf,
    _lock: File,
}

impl FileVolume {
    /// Opens (creating if needed) the volume rooted at `root`.
    ///
    /// # Errors
    ///
    /// [`StorageError::Locked`] if another process holds the volume, or an
    /// I/O error.
    pub fn open_dir(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(root.display().to_string()));
        }
        Ok(Self {
            root: root.to_path_buf(),
            _lock: lock,
        })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sync_root(&self) -> StorageResult<()> {
        #[cfg(unix)]
        {
            File::open(&self.root)?.sync_all()?;
        }
        Ok(())
    }
}

impl Volume for FileVolume {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        check_name(name)?;
        let path = self.root.join(name);
        let created = !path.exists();
        let backend = FileBackend::open(&path)?;
        if created {
            self.sync_root()?;
        }
        Ok(Box::new(backend))
    }

    fn exists(&self, name: &str) -> bool {
        check_name(name).is_ok() && self.root.join(name).is_file()
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        check_name(name)?;
        match fs::remove_file(self.root.join(name)) {
            Ok(()) => self.sync_root(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if check_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// A volume that lives on the heap.
///
/// Reopening a name hands back a backend sharing the earlier buffer.
#[derive(Debug, Default)]
pub struct MemoryVolume {
    files: Mutex<BTreeMap<String, InMemoryBackend>>,
}

impl MemoryVolume {
    /// Creates an empty volume.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Volume for MemoryVolume {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        check_name(name)?;
        let backend = self.files.lock().entry(name.to_string()).or_default().clone();
        Ok(Box::new(backend))
    }

    fn exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        Ok(self.files.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_volume_lists_and_removes() {
        let dir = tempdir().unwrap();
        let volume = FileVolume::open_dir(dir.path()).unwrap();

        volume.open("b.dat").unwrap().append(b"x").unwrap();
        volume.open("a.dat").unwrap();
        assert_eq!(volume.list().unwrap(), vec!["a.dat", "b.dat"]);
        assert!(volume.exists("b.dat"));

        volume.remove("b.dat").unwrap();
        volume.remove("b.dat").unwrap();
        assert!(!volume.exists("b.dat"));
        assert_eq!(volume.list().unwrap(), vec!["a.dat"]);
    }

    #[test]
    fn file_volume_is_exclusive() {
        let dir = tempdir().unwrap();
        let _held = FileVolume::open_dir(dir.path()).unwrap();
        assert!(matches!(
            FileVolume::open_dir(dir.path()),
            Err(StorageError::Locked(_))
        ));
    }

    #[test]
    fn rejects_path_like_names() {
        let volume = MemoryVolume::new();
        for bad in ["", "../x", "a/b", "LOCK", ".hidden"] {
            assert!(matches!(volume.open(bad), Err(StorageError::InvalidName(_))));
        }
    }

    #[test]
    fn memory_volume_reopen_sees_prior_writes() {
        let volume = MemoryVolume::new();
        volume.open("wal.log").unwrap().append(b"abc").unwrap();
        let again = volume.open("wal.log").unwrap();
        assert_eq!(again.read_at(0, 3).unwrap(), b"abc");

        volume.remove("wal.log").unwrap();
        assert_eq!(volume.open("wal.log").unwrap().size().unwrap(), 0);
    }
}
