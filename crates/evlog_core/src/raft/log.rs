//! In-memory index of a replica's raft log.

use super::message::LogEntry;
use crate::error::{CoreError, CoreResult};
use crate::types::{BlockId, LogIndex, Term};
use crate::wal::Wal;

#[derive(Debug, Clone, Copy)]
struct Slot {
    term: Term,
    offset: u64,
}

/// Term and WAL offset of every entry of one replica's log.
///
/// Indices start at 1. Entry bodies stay in the WAL and are read back on
/// demand.
#[derive(Debug, Default)]
pub struct RaftLog {
    slots: Vec<Slot>,
}

impl RaftLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last entry, 0 when empty.
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        self.slots.len() as LogIndex
    }

    /// Term of the last entry, 0 when empty.
    #[must_use]
    pub fn last_term(&self) -> Term {
        self.slots.last().map_or(0, |s| s.term)
    }

    /// Term at `index`. Index 0 has term 0; indices past the end have none.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.slots.get(index as usize - 1).map(|s| s.term)
    }

    /// Records the entry at `index`, dropping any entries at or after it.
    ///
    /// # Errors
    ///
    /// [`CoreError::WalCorruption`] if `index` would leave a gap.
    pub fn put(&mut self, index: LogIndex, term: Term, offset: u64) -> CoreResult<()> {
        if index == 0 || index > self.last_index() + 1 {
            return Err(CoreError::wal_corruption(format!(
                "log index {index} does not follow {}",
                self.last_index()
            )));
        }
        self.slots.truncate(index as usize - 1);
        self.slots.push(Slot { term, offset });
        Ok(())
    }

    /// Drops entries from `index` on.
    pub fn truncate_from(&mut self, index: LogIndex) {
        self.slots.truncate(index.saturating_sub(1) as usize);
    }

    /// First index of the run of entries sharing the term at `index`.
    #[must_use]
    pub fn first_index_of_term_at(&self, index: LogIndex) -> LogIndex {
        let Some(term) = self.term_at(index) else {
            return self.last_index() + 1;
        };
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Reads entries `[from, from + max)` back from the WAL.
    ///
    /// # Errors
    ///
    /// WAL read errors, or corruption if a record does not belong to
    /// `block`.
    pub fn entries(
        &self,
        wal: &Wal,
        block: BlockId,
        from: LogIndex,
        max: usize,
    ) -> CoreResult<Vec<LogEntry>> {
        let mut out = Vec::new();
        let mut index = from.max(1);
        while index <= self.last_index() && out.len() < max {
            out.push(self.entry(wal, block, index)?);
            index += 1;
        }
        Ok(out)
    }

    /// Reads one entry back from the WAL.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] past the end, WAL errors, or corruption if
    /// the record does not match.
    pub fn entry(&self, wal: &Wal, block: BlockId, index: LogIndex) -> CoreResult<LogEntry> {
        let slot = index
            .checked_sub(1)
            .and_then(|i| self.slots.get(i as usize))
            .ok_or_else(|| CoreError::not_found(format!("log index {index} of {block}")))?;
        let record = wal.read(slot.offset)?;
        if record.block != block || record.index != index || record.term != slot.term {
            return Err(CoreError::wal_corruption(format!(
                "record at offset {} is {}/{}@{}, expected {block}/{index}@{}",
                slot.offset, record.block, record.index, record.term, slot.term
            )));
        }
        Ok(LogEntry {
            term: record.term,
            index,
            command: record.data,
        })
    }
}
