//! Streaming WAL reader used by recovery.

use super::record::{decode_framed, parse_header, WalRecord, CRC_SIZE, HEADER_SIZE};
use crate::error::CoreResult;
use evlog_storage::StorageBackend;

const CHUNK_SIZE: usize = 64 * 1024;

/// Iterates `(offset, record)` pairs from the start of a WAL.
///
/// Memory use is one chunk plus the largest record. An incomplete header
/// or body at the tail ends iteration cleanly and leaves
/// [`WalIterator::valid_len`] pointing at the first byte of the torn
/// record. Bad magic, unknown types and checksum mismatches are returned as
/// errors.
pub struct WalIterator<'a> {
    backend: &'a dyn StorageBackend,
    total: u64,
    /// Offset of `buf[0]` in the WAL.
    buf_start: u64,
    buf: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<'a> WalIterator<'a> {
    /// Starts reading at offset 0.
    ///
    /// # Errors
    ///
    /// Fails if the backend size cannot be read.
    pub fn new(backend: &'a dyn StorageBackend) -> CoreResult<Self> {
        Ok(Self {
            total: backend.size()?,
            backend,
            buf_start: 0,
            buf: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    /// Offset just past the last complete record returned.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.buf_start + self.pos as u64
    }

    /// Makes `need` bytes available at `pos`. Returns `false` at end of log.
    fn fill(&mut self, need: usize) -> CoreResult<bool> {
        let have = self.buf.len() - self.pos;
        if have >= need {
            return Ok(true);
        }
        let consumed = self.buf_start + self.buf.len() as u64;
        let left = self.total - consumed;
        if (have as u64) + left < need as u64 {
            return Ok(false);
        }
        self.buf.drain(..self.pos);
        self.buf_start += self.pos as u64;
        self.pos = 0;
        let want = (need - have).max(CHUNK_SIZE).min(left as usize);
        let chunk = self.backend.read_at(consumed, want)?;
        self.buf.extend_from_slice(&chunk);
        Ok(true)
    }

    fn next_record(&mut self) -> CoreResult<Option<(u64, WalRecord)>> {
        let at = self.valid_len();
        if !self.fill(HEADER_SIZE)? {
            return Ok(None);
        }
        let header = parse_header(&self.buf[self.pos..self.pos + HEADER_SIZE], at)?;
        let total = HEADER_SIZE + header.payload_len + CRC_SIZE;
        if !self.fill(total)? {
            return Ok(None);
        }
        let record = decode_framed(&self.buf[self.pos..self.pos + total], header)?;
        self.pos += total;
        Ok(Some((at, record)))
    }
}

impl Iterator for WalIterator<'_> {
    type Item = CoreResult<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::types::BlockId;
    use evlog_storage::InMemoryBackend;

    fn record(index: u64, len: usize) -> WalRecord {
        WalRecord {
            block: BlockId::new(1),
            term: 1,
            index,
            data: vec![index as u8; len],
        }
    }

    fn backend_with(records: &[WalRecord]) -> InMemoryBackend {
        let mut backend = InMemoryBackend::new();
        for r in records {
            backend.append(&r.encode().unwrap()).unwrap();
        }
        backend
    }

    #[test]
    fn yields_records_with_offsets() {
        let records = [record(1, 3), record(2, 0), record(3, 100)];
        let backend = backend_with(&records);
        let got: Vec<_> = WalIterator::new(&backend)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].0, 0);
        assert_eq!(got[1].0, records[0].encode().unwrap().len() as u64);
        assert_eq!(got[2].1, records[2]);
    }

    #[test]
    fn records_larger_than_a_chunk() {
        let records = [record(1, CHUNK_SIZE * 2 + 5), record(2, 7)];
        let backend = backend_with(&records);
        let got: Vec<_> = WalIterator::new(&backend)
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(got, records);
    }

    #[test]
    fn torn_tail_stops_cleanly() {
        let backend = backend_with(&[record(1, 4), record(2, 4)]);
        let full = backend.snapshot();
        let first_len = record(1, 4).encode().unwrap().len() as u64;
        let torn = InMemoryBackend::with_data(full[..full.len() - 2].to_vec());

        let mut iter = WalIterator::new(&torn).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().1.index, 1);
        assert!(iter.next().is_none());
        assert_eq!(iter.valid_len(), first_len);
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let backend = backend_with(&[record(1, 4)]);
        let mut data = backend.snapshot();
        data[HEADER_SIZE + 2] ^= 0x55;
        let corrupt = InMemoryBackend::with_data(data);
        let mut iter = WalIterator::new(&corrupt).unwrap();
        assert!(matches!(
            iter.next(),
            Some(Err(CoreError::ChecksumMismatch { .. }))
        ));
        assert!(iter.next().is_none());
    }
}
