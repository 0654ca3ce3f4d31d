//! Metadata stores.
//!
//! Both stores are small key/value maps persisted as an append-only log in
//! the volume. They differ only in when bytes reach disk:
//!
//! - [`SyncStore`] writes and fsyncs before `put`/`delete` return. Block
//!   membership and raft hard state live here.
//! - [`AsyncStore`] buffers writes until [`AsyncStore::flush`] or close.
//!   Soft state whose loss is tolerable lives here.
//!
//! Values are CBOR encoded with `ciborium`.

mod log;

use crate::error::{CoreError, CoreResult};
use crate::types::{BlockId, Peer};
use self::log::KvLog;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use evlog_storage::StorageBackend;
use tracing::debug;

/// Backend name of the sync store.
pub const SYNC_STORE_FILE: &str = "meta.sync";
/// Backend name of the async store.
pub const ASYNC_STORE_FILE: &str = "meta.async";

/// Key layout.
pub mod keys {
    use super::BlockId;

    /// Prefix shared by every key of every block.
    pub const BLOCK_PREFIX: &str = "block/";

    /// Capacity, peers and WAL start of a block.
    #[must_use]
    pub fn block_meta(id: BlockId) -> String {
        format!("{BLOCK_PREFIX}{:020}/meta", id.as_u64())
    }

    /// Raft term and vote of a replica.
    #[must_use]
    pub fn hard_state(id: BlockId) -> String {
        format!("{BLOCK_PREFIX}{:020}/hardstate", id.as_u64())
    }

    /// Pending-evacuation marker of a block.
    #[must_use]
    pub fn inactive(id: BlockId) -> String {
        format!("{BLOCK_PREFIX}{:020}/inactive", id.as_u64())
    }

    /// Every key belonging to a block.
    #[must_use]
    pub fn block_scope(id: BlockId) -> String {
        format!("{BLOCK_PREFIX}{:020}/", id.as_u64())
    }

    /// Block id of a [`block_meta`] key.
    #[must_use]
    pub fn parse_block_meta(key: &str) -> Option<BlockId> {
        key.strip_prefix(BLOCK_PREFIX)?
            .strip_suffix("/meta")?
            .parse()
            .ok()
            .map(BlockId::new)
    }
}

/// Durable description of a block hosted on this server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Capacity in bytes.
    pub capacity: u64,
    /// WAL size when the block was created. Older WAL records carrying the
    /// same id belong to a removed block.
    pub wal_start: u64,
    /// Raft group, empty until the block is activated.
    pub peers: Vec<Peer>,
}

fn to_cbor<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| CoreError::invalid_argument(format!("metadata encode: {e}")))?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes)
        .map_err(|e| CoreError::meta_corruption(format!("value of {key}: {e}")))
}

struct Inner {
    log: KvLog,
    closed: bool,
}

fn open_inner(backend: Box<dyn StorageBackend>) -> CoreResult<Mutex<Inner>> {
    Ok(Mutex::new(Inner {
        log: KvLog::open(backend)?,
        closed: false,
    }))
}

macro_rules! read_api {
    () => {
        /// Decoded value of `key`.
        ///
        /// # Errors
        ///
        /// [`CoreError::MetaCorruption`] if the stored bytes do not decode.
        pub fn get<T: DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
            let inner = self.inner.lock();
            inner.log.get(key).map(|b| from_cbor(key, b)).transpose()
        }

        /// Keys starting with `prefix`, sorted.
        #[must_use]
        pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
            self.inner.lock().log.keys_with_prefix(prefix)
        }
    };
}

/// Metadata that must be durable before it is acknowledged.
pub struct SyncStore {
    inner: Mutex<Inner>,
}

impl SyncStore {
    /// Opens the store over `backend`.
    ///
    /// # Errors
    ///
    /// Corruption or storage errors.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        Ok(Self {
            inner: open_inner(backend)?,
        })
    }

    read_api!();

    /// Stores `value` under `key` and fsyncs.
    ///
    /// # Errors
    ///
    /// [`CoreError::Closed`] after close, encode or storage errors.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> CoreResult<()> {
        let bytes = to_cbor(value)?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CoreError::Closed("sync metadata store"));
        }
        inner.log.stage_put(key, bytes);
        inner.log.write_pending(true)
    }

    /// Removes every key starting with `prefix` and fsyncs.
    ///
    /// # Errors
    ///
    /// [`CoreError::Closed`] after close, or storage errors.
    pub fn delete_prefix(&self, prefix: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CoreError::Closed("sync metadata store"));
        }
        for key in inner.log.keys_with_prefix(prefix) {
            inner.log.stage_delete(&key);
        }
        inner.log.write_pending(true)
    }

    /// Refuses further writes.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        debug!("sync metadata store closed");
    }
}

/// Metadata whose durability may lag.
pub struct AsyncStore {
    inner: Mutex<Inner>,
}

impl AsyncStore {
    /// Opens the store over `backend`.
    ///
    /// # Errors
    ///
    /// Corruption or storage errors.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        Ok(Self {
            inner: open_inner(backend)?,
        })
    }

    read_api!();

    /// Stores `value` under `key` in memory; it reaches disk on the next
    /// flush.
    ///
    /// # Errors
    ///
    /// [`CoreError::Closed`] after close, or encode errors.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> CoreResult<()> {
        let bytes = to_cbor(value)?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CoreError::Closed("async metadata store"));
        }
        inner.log.stage_put(key, bytes);
        Ok(())
    }

    /// Removes every key starting with `prefix`.
    ///
    /// # Errors
    ///
    /// [`CoreError::Closed`] after close.
    pub fn delete_prefix(&self, prefix: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CoreError::Closed("async metadata store"));
        }
        for key in inner.log.keys_with_prefix(prefix) {
            inner.log.stage_delete(&key);
        }
        Ok(())
    }

    /// Writes buffered changes and syncs.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn flush(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.log.has_pending() {
            inner.log.write_pending(true)?;
        }
        Ok(())
    }

    /// Flushes and refuses further writes.
    ///
    /// # Errors
    ///
    /// Storage errors from the final flush.
    pub fn close(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.log.write_pending(true)?;
        debug!("async metadata store closed");
        Ok(())
    }
}

impl std::fmt::Debug for SyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStore").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for AsyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evlog_storage::{InMemoryBackend, MemoryVolume, Volume};

    #[derive(Debug, PartialEq, serde::Serialize, Deserialize)]
    struct HardState {
        term: u64,
        vote: Option<u64>,
    }

    #[test]
    fn sync_store_survives_reopen() {
        let volume = MemoryVolume::new();
        {
            let store = SyncStore::open(volume.open(SYNC_STORE_FILE).unwrap()).unwrap();
            store.put("a", &HardState { term: 1, vote: None }).unwrap();
            store.put("a", &HardState { term: 2, vote: Some(9) }).unwrap();
            store.put("b", &7u64).unwrap();
            store.delete_prefix("b").unwrap();
        }
        let store = SyncStore::open(volume.open(SYNC_STORE_FILE).unwrap()).unwrap();
        assert_eq!(
            store.get::<HardState>("a").unwrap(),
            Some(HardState { term: 2, vote: Some(9) })
        );
        assert_eq!(store.get::<u64>("b").unwrap(), None);
    }

    #[test]
    fn async_store_persists_on_flush_only() {
        let backend = InMemoryBackend::new();
        let store = AsyncStore::open(Box::new(backend.clone())).unwrap();
        store.put(&keys::inactive(BlockId::new(4)), &true).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert_eq!(store.get::<bool>(&keys::inactive(BlockId::new(4))).unwrap(), Some(true));

        store.flush().unwrap();
        let reopened = AsyncStore::open(Box::new(backend.clone())).unwrap();
        assert_eq!(
            reopened.get::<bool>(&keys::inactive(BlockId::new(4))).unwrap(),
            Some(true)
        );
    }

    #[test]
    fn closed_stores_refuse_writes() {
        let sync = SyncStore::open(Box::new(InMemoryBackend::new())).unwrap();
        sync.close();
        assert!(matches!(sync.put("k", &1u8), Err(CoreError::Closed(_))));

        let backend = InMemoryBackend::new();
        let lazy = AsyncStore::open(Box::new(backend.clone())).unwrap();
        lazy.put("k", &1u8).unwrap();
        lazy.close().unwrap();
        assert!(backend.size().unwrap() > 0);
        assert!(matches!(lazy.put("k", &2u8), Err(CoreError::Closed(_))));
    }

    #[test]
    fn prefix_scan_is_scoped_to_block() {
        let store = SyncStore::open(Box::new(InMemoryBackend::new())).unwrap();
        let a = BlockId::new(1);
        let b = BlockId::new(10);
        store.put(&keys::block_meta(a), &1u8).unwrap();
        store.put(&keys::hard_state(a), &1u8).unwrap();
        store.put(&keys::block_meta(b), &1u8).unwrap();

        assert_eq!(store.keys_with_prefix(&keys::block_scope(a)).len(), 2);
        store.delete_prefix(&keys::block_scope(a)).unwrap();
        assert_eq!(store.keys_with_prefix(keys::BLOCK_PREFIX), vec![keys::block_meta(b)]);
    }

    #[test]
    fn meta_keys_parse_back() {
        let id = BlockId::new(1001);
        assert_eq!(keys::parse_block_meta(&keys::block_meta(id)), Some(id));
        assert_eq!(keys::parse_block_meta(&keys::hard_state(id)), None);
    }

    #[test]
    fn torn_record_is_dropped() {
        let backend = InMemoryBackend::new();
        {
            let store = SyncStore::open(Box::new(backend.clone())).unwrap();
            store.put("x", &1u32).unwrap();
            store.put("y", &2u32).unwrap();
        }
        let mut raw = backend.clone();
        let size = raw.size().unwrap();
        raw.truncate(size - 2).unwrap();

        let store = SyncStore::open(Box::new(backend)).unwrap();
        assert_eq!(store.get::<u32>("x").unwrap(), Some(1));
        assert_eq!(store.get::<u32>("y").unwrap(), None);
    }
}
