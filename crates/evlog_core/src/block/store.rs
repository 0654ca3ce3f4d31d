//! File-backed block.

use super::record::{
    check_crc, decode_head, decode_header, encode_header, encode_record, RecordKind, HEADER_SIZE,
    RECORD_PREFIX,
};
use super::seek::{seek, stime_key, SeekKeyFlag};
use crate::error::{CoreError, CoreResult};
use crate::types::{now_millis, BlockId};
use evlog_codec::Entry;
use evlog_storage::{StorageBackend, Volume};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

const FILE_PREFIX: &str = "block-";
const FILE_SUFFIX: &str = ".dat";

/// Invoked once, after the append that archives a block.
pub type ArchivedCallback = Arc<dyn Fn(Statistics) + Send + Sync>;

/// Snapshot of a block's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    /// Block id.
    pub id: BlockId,
    /// Capacity in bytes.
    pub capacity: u64,
    /// Bytes used, headers included.
    pub size: u64,
    /// Number of entries.
    pub entry_count: u64,
    /// Whether appends are refused.
    pub archived: bool,
    /// Store time of the first entry.
    pub first_entry_stime: Option<i64>,
    /// Store time of the last entry.
    pub last_entry_stime: Option<i64>,
}

/// An entry as read back from a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Sequence number inside the block.
    pub seq: u64,
    /// Store time in milliseconds.
    pub stime: i64,
    /// The entry.
    pub entry: Entry,
}

/// Name of the file holding block `id`.
#[must_use]
pub fn block_file_name(id: BlockId) -> String {
    format!("{FILE_PREFIX}{:020}{FILE_SUFFIX}", id.as_u64())
}

/// Inverse of [`block_file_name`].
#[must_use]
pub fn parse_block_file_name(name: &str) -> Option<BlockId> {
    let digits = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    if digits.len() != 20 {
        return None;
    }
    digits.parse::<u64>().ok().map(BlockId::new)
}

fn stime_of(key: &[u8; 8]) -> i64 {
    (u64::from_be_bytes(*key) ^ (1 << 63)) as i64
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    len: usize,
}

struct BlockState {
    backend: Box<dyn StorageBackend>,
    slots: Vec<Slot>,
    keys: Vec<[u8; 8]>,
    size: u64,
    archived: bool,
    last_mark: u64,
}

/// An append-only, capacity-bounded sequence of entries.
///
/// Sequence numbers start at 0 and are gapless. Every entry carries a store
/// time that never decreases, which makes the store-time key column sorted
/// and seekable.
///
/// Once an append would push the block past its capacity the block writes
/// an archive marker, invokes the archived callback and refuses every later
/// append with [`CoreError::SegmentFull`].
pub struct Block {
    id: BlockId,
    capacity: u64,
    state: RwLock<BlockState>,
    on_archived: RwLock<Option<ArchivedCallback>>,
}

impl Block {
    /// Creates block `id` in `volume`.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadyExists`] if the block file exists, or a storage
    /// error.
    pub fn create(volume: &dyn Volume, id: BlockId, capacity: u64) -> CoreResult<Self> {
        let name = block_file_name(id);
        if volume.exists(&name) {
            return Err(CoreError::AlreadyExists(id));
        }
        let mut backend = volume.open(&name)?;
        backend.append(&encode_header(id, capacity))?;
        backend.sync()?;
        debug!(block_id = %id, capacity, "block created");
        Ok(Self::from_state(
            id,
            capacity,
            BlockState {
                backend,
                slots: Vec::new(),
                keys: Vec::new(),
                size: HEADER_SIZE as u64,
                archived: false,
                last_mark: 0,
            },
        ))
    }

    /// Opens block `id` and rebuilds its index.
    ///
    /// A torn record at the tail is cut off. Checksum failures are fatal.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if no file exists, corruption errors, or a
    /// storage error.
    pub fn open(volume: &dyn Volume, id: BlockId) -> CoreResult<Self> {
        let name = block_file_name(id);
        if !volume.exists(&name) {
            return Err(CoreError::not_found(format!("block {id}")));
        }
        let mut backend = volume.open(&name)?;
        let file_size = backend.size()?;
        let (stored_id, capacity) = decode_header(&backend.read_at(0, HEADER_SIZE.min(file_size as usize))?)?;
        if stored_id != id {
            return Err(CoreError::block_corruption(format!(
                "file {name} holds block {stored_id}"
            )));
        }

        let mut state = BlockState {
            backend,
            slots: Vec::new(),
            keys: Vec::new(),
            size: HEADER_SIZE as u64,
            archived: false,
            last_mark: 0,
        };
        let mut offset = HEADER_SIZE as u64;
        while offset + RECORD_PREFIX as u64 <= file_size {
            let head = decode_head(&state.backend.read_at(offset, RECORD_PREFIX)?, offset)?;
            let total = head.total_len() as u64;
            if offset + total > file_size {
                break;
            }
            check_crc(&state.backend.read_at(offset, total as usize)?)?;
            match head.kind {
                RecordKind::Entry => {
                    if head.seq != state.slots.len() as u64 {
                        return Err(CoreError::block_corruption(format!(
                            "block {id}: expected seq {} at offset {offset}, found {}",
                            state.slots.len(),
                            head.seq
                        )));
                    }
                    state.slots.push(Slot {
                        offset: offset + RECORD_PREFIX as u64,
                        len: head.payload_len,
                    });
                    state.keys.push(stime_key(head.stime));
                }
                RecordKind::Archived => state.archived = true,
            }
            state.last_mark = state.last_mark.max(head.mark);
            offset += total;
        }
        if offset < file_size {
            warn!(block_id = %id, valid = offset, file_size, "truncating torn block tail");
            state.backend.truncate(offset)?;
        }
        state.size = offset;

        debug!(
            block_id = %id,
            entries = state.slots.len(),
            archived = state.archived,
            "block recovered"
        );
        Ok(Self::from_state(id, capacity, state))
    }

    /// Deletes the file of block `id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if removal fails.
    pub fn destroy(volume: &dyn Volume, id: BlockId) -> CoreResult<()> {
        volume.remove(&block_file_name(id))?;
        info!(block_id = %id, "block file removed");
        Ok(())
    }

    fn from_state(id: BlockId, capacity: u64, state: BlockState) -> Self {
        Self {
            id,
            capacity,
            state: RwLock::new(state),
            on_archived: RwLock::new(None),
        }
    }

    /// Block id.
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Installs the archived callback.
    pub fn set_archived_callback(&self, callback: ArchivedCallback) {
        *self.on_archived.write() = Some(callback);
    }

    /// Appends `entries` stamped with the current time.
    ///
    /// # Errors
    ///
    /// [`CoreError::SegmentFull`] when archived or out of room, or a storage
    /// error.
    pub fn append(&self, entries: &[Entry]) -> CoreResult<Vec<u64>> {
        self.apply(0, now_millis(), entries)
    }

    /// Appends `entries` produced by raft log index `mark`.
    ///
    /// The stored time is `max(stime, last stored time)`. Replicas applying
    /// the same command therefore store identical bytes.
    ///
    /// # Errors
    ///
    /// Same as [`Block::append`].
    pub fn apply(&self, mark: u64, stime: i64, entries: &[Entry]) -> CoreResult<Vec<u64>> {
        let mut state = self.state.write();
        if state.archived {
            return Err(CoreError::SegmentFull { block: self.id });
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let stime = state
            .keys
            .last()
            .map_or(stime, |last| stime.max(stime_of(last)));
        let first_seq = state.slots.len() as u64;
        let mut batch = Vec::new();
        let mut placed = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let payload = entry.encode();
            placed.push(Slot {
                offset: (batch.len() + RECORD_PREFIX) as u64,
                len: payload.len(),
            });
            batch.extend_from_slice(&encode_record(
                RecordKind::Entry,
                mark,
                first_seq + i as u64,
                stime,
                &payload,
            ));
        }

        if state.size + batch.len() as u64 > self.capacity {
            let marker = encode_record(RecordKind::Archived, mark, first_seq, stime, &[]);
            state.backend.append(&marker)?;
            state.backend.flush()?;
            state.size += marker.len() as u64;
            state.archived = true;
            state.last_mark = state.last_mark.max(mark);
            let stats = self.stats_locked(&state);
            drop(state);

            info!(
                block_id = %self.id,
                entries = stats.entry_count,
                size = stats.size,
                "block archived"
            );
            let callback = self.on_archived.read().clone();
            if let Some(callback) = callback {
                callback(stats);
            }
            return Err(CoreError::SegmentFull { block: self.id });
        }

        let base = state.backend.append(&batch)?;
        state.backend.flush()?;
        state.size += batch.len() as u64;
        state.last_mark = state.last_mark.max(mark);
        let key = stime_key(stime);
        for slot in placed {
            state.slots.push(Slot {
                offset: base + slot.offset,
                len: slot.len,
            });
            state.keys.push(key);
        }
        Ok((first_seq..first_seq + entries.len() as u64).collect())
    }

    /// Reads up to `num` entries starting at `seq`.
    ///
    /// # Errors
    ///
    /// [`CoreError::OffsetOnEnd`] if `seq` is not below the entry count,
    /// decode or storage errors.
    pub fn read(&self, seq: u64, num: usize) -> CoreResult<Vec<StoredEntry>> {
        let state = self.state.read();
        let count = state.slots.len() as u64;
        if seq >= count {
            return Err(CoreError::OffsetOnEnd {
                block: self.id,
                seq,
            });
        }
        let end = count.min(seq.saturating_add(num as u64));
        let mut out = Vec::with_capacity((end - seq) as usize);
        for i in seq..end {
            let slot = state.slots[i as usize];
            let bytes = state.backend.read_at(slot.offset, slot.len)?;
            out.push(StoredEntry {
                seq: i,
                stime: stime_of(&state.keys[i as usize]),
                entry: Entry::decode(&bytes)?,
            });
        }
        Ok(out)
    }

    /// Searches the store-time key column from position `start`.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] when no position satisfies `flag`.
    pub fn seek(&self, start: u64, key: &[u8], flag: SeekKeyFlag) -> CoreResult<u64> {
        let state = self.state.read();
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        seek(&state.keys, start, key, flag)
            .map(|pos| pos as u64)
            .ok_or_else(|| CoreError::not_found(format!("no key matches {flag:?} in block {}", self.id)))
    }

    /// Current counters.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        self.stats_locked(&self.state.read())
    }

    /// Number of entries.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.state.read().slots.len() as u64
    }

    /// Whether appends are refused.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.state.read().archived
    }

    /// Highest raft index reflected in the block.
    #[must_use]
    pub fn last_mark(&self) -> u64 {
        self.state.read().last_mark
    }

    /// Forces block data to stable storage.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.state.write().backend.sync()?;
        Ok(())
    }

    fn stats_locked(&self, state: &BlockState) -> Statistics {
        Statistics {
            id: self.id,
            capacity: self.capacity,
            size: state.size,
            entry_count: state.slots.len() as u64,
            archived: state.archived,
            first_entry_stime: state.keys.first().map(stime_of),
            last_entry_stime: state.keys.last().map(stime_of),
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("entries", &self.entry_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evlog_codec::{Ordinal, Value};
    use evlog_storage::{FileVolume, MemoryVolume};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn entry(id: &str) -> Entry {
        Entry::new()
            .with(Ordinal::Id, Value::Text(id.into()))
            .with(Ordinal::Data, Value::Bytes(vec![7; 32]))
    }

    #[test]
    fn sequences_are_contiguous() {
        let volume = MemoryVolume::new();
        let block = Block::create(&volume, BlockId::new(1), 1 << 20).unwrap();

        assert_eq!(block.append(&[entry("a"), entry("b")]).unwrap(), vec![0, 1]);
        assert_eq!(block.append(&[]).unwrap(), Vec::<u64>::new());
        assert_eq!(block.append(&[entry("c")]).unwrap(), vec![2]);

        let read = block.read(0, 10).unwrap();
        let ids: Vec<_> = read.iter().map(|e| e.entry.get(Ordinal::Id).cloned()).collect();
        assert_eq!(
            ids,
            vec![
                Some(Value::Text("a".into())),
                Some(Value::Text("b".into())),
                Some(Value::Text("c".into()))
            ]
        );
        assert_eq!(read[2].seq, 2);
    }

    #[test]
    fn read_at_tail_is_offset_on_end() {
        let volume = MemoryVolume::new();
        let block = Block::create(&volume, BlockId::new(1), 1 << 20).unwrap();
        assert!(matches!(block.read(0, 1), Err(CoreError::OffsetOnEnd { seq: 0, .. })));
        block.append(&[entry("a")]).unwrap();
        assert_eq!(block.read(0, 5).unwrap().len(), 1);
        assert!(matches!(block.read(1, 1), Err(CoreError::OffsetOnEnd { seq: 1, .. })));
    }

    #[test]
    fn create_twice_fails() {
        let volume = MemoryVolume::new();
        Block::create(&volume, BlockId::new(3), 100).unwrap();
        assert!(matches!(
            Block::create(&volume, BlockId::new(3), 100),
            Err(CoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn archives_exactly_once() {
        let volume = MemoryVolume::new();
        let block = Block::create(&volume, BlockId::new(9), 600).unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        block.set_archived_callback(Arc::new(move |stats| sink.lock().push(stats)));

        let mut appended = 0;
        loop {
            match block.append(&[entry("x")]) {
                Ok(_) => appended += 1,
                Err(e) => {
                    assert!(e.is_segment_full());
                    break;
                }
            }
        }
        assert!(appended > 0);
        assert!(block.append(&[entry("y")]).unwrap_err().is_segment_full());

        let fired = fired.lock();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].archived);
        assert_eq!(fired[0].entry_count, appended);
        assert!(block.is_archived());
    }

    #[test]
    fn store_time_never_decreases() {
        let volume = MemoryVolume::new();
        let block = Block::create(&volume, BlockId::new(2), 1 << 20).unwrap();
        block.apply(1, 500, &[entry("a")]).unwrap();
        block.apply(2, 100, &[entry("b")]).unwrap();
        block.apply(3, 900, &[entry("c")]).unwrap();

        let stimes: Vec<_> = block.read(0, 3).unwrap().iter().map(|e| e.stime).collect();
        assert_eq!(stimes, vec![500, 500, 900]);
        assert_eq!(block.last_mark(), 3);

        let stats = block.statistics();
        assert_eq!(stats.first_entry_stime, Some(500));
        assert_eq!(stats.last_entry_stime, Some(900));
    }

    #[test]
    fn seek_by_store_time() {
        let volume = MemoryVolume::new();
        let block = Block::create(&volume, BlockId::new(2), 1 << 20).unwrap();
        for (i, t) in [100, 200, 200, 300].iter().enumerate() {
            block.apply(i as u64 + 1, *t, &[entry("e")]).unwrap();
        }
        let before = |t| block.seek(0, &stime_key(t), SeekKeyFlag::BeforeKey);
        assert_eq!(before(200).unwrap(), 0);
        assert_eq!(before(250).unwrap(), 2);
        assert!(matches!(before(100), Err(CoreError::NotFound { .. })));
        assert_eq!(
            block.seek(0, &stime_key(200), SeekKeyFlag::OrNext).unwrap(),
            1
        );
    }

    #[test]
    fn reopen_restores_entries_and_archive_state() {
        let dir = tempdir().unwrap();
        let id = BlockId::new(1001);
        {
            let volume = FileVolume::open_dir(dir.path()).unwrap();
            let block = Block::create(&volume, id, 400).unwrap();
            block.apply(4, 10, &[entry("a"), entry("b")]).unwrap();
            while block.apply(5, 20, &[entry("c")]).is_ok() {}
            block.sync().unwrap();
        }
        let volume = FileVolume::open_dir(dir.path()).unwrap();
        let block = Block::open(&volume, id).unwrap();
        assert!(block.is_archived());
        assert_eq!(block.last_mark(), 5);
        assert_eq!(block.read(0, 2).unwrap()[1].entry, entry("b"));
        assert_eq!(block.capacity(), 400);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let volume = MemoryVolume::new();
        let id = BlockId::new(5);
        let size_after_one = {
            let block = Block::create(&volume, id, 1 << 20).unwrap();
            block.append(&[entry("a")]).unwrap();
            let size = block.statistics().size;
            block.append(&[entry("b")]).unwrap();
            size
        };
        {
            let mut backend = volume.open(&block_file_name(id)).unwrap();
            let size = backend.size().unwrap();
            backend.truncate(size - 3).unwrap();
        }
        let block = Block::open(&volume, id).unwrap();
        assert_eq!(block.entry_count(), 1);
        assert_eq!(block.statistics().size, size_after_one);
        assert_eq!(block.append(&[entry("c")]).unwrap(), vec![1]);
    }

    #[test]
    fn flipped_byte_is_fatal() {
        let volume = MemoryVolume::new();
        let id = BlockId::new(6);
        Block::create(&volume, id, 1 << 20)
            .unwrap()
            .append(&[entry("a")])
            .unwrap();
        let mut raw = volume.open(&block_file_name(id)).unwrap();
        let data = raw.read_from(0).unwrap();
        let mut corrupt = data.clone();
        let last = corrupt.len() - 6;
        corrupt[last] ^= 0xFF;
        raw.truncate(0).unwrap();
        raw.append(&corrupt).unwrap();
        assert!(matches!(
            Block::open(&volume, id),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn file_names_round_trip() {
        let name = block_file_name(BlockId::new(1001));
        assert_eq!(name, "block-00000000000000001001.dat");
        assert_eq!(parse_block_file_name(&name), Some(BlockId::new(1001)));
        assert_eq!(parse_block_file_name("wal.log"), None);
        assert_eq!(parse_block_file_name("block-1.dat"), None);
    }

    proptest! {
        #[test]
        fn batches_get_gapless_sequences(sizes in prop::collection::vec(1usize..5, 1..12)) {
            let volume = MemoryVolume::new();
            let block = Block::create(&volume, BlockId::new(1), 1 << 24).unwrap();
            let mut next = 0u64;
            for n in sizes {
                let batch: Vec<_> = (0..n).map(|i| entry(&i.to_string())).collect();
                let seqs = block.append(&batch).unwrap();
                prop_assert_eq!(seqs, (next..next + n as u64).collect::<Vec<_>>());
                next += n as u64;
            }
            prop_assert_eq!(block.entry_count(), next);
        }
    }
}
