//! On-disk layout of a block file.
//!
//! ```text
//! header: | magic "EVBK" (4) | version u16 | block id u64 | capacity u64 | crc32 (4) |
//! record: | len u32 | kind u8 | mark u64 | seq u64 | stime i64 | payload (len) | crc32 (4) |
//! ```
//!
//! All integers are little-endian. A record's CRC covers every byte before
//! it. `mark` is the raft log index that produced the record, or 0.

use crate::checksum::crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::BlockId;

pub(crate) const BLOCK_MAGIC: [u8; 4] = *b"EVBK";
pub(crate) const BLOCK_VERSION: u16 = 1;
pub(crate) const HEADER_SIZE: usize = 4 + 2 + 8 + 8 + 4;
pub(crate) const RECORD_PREFIX: usize = 4 + 1 + 8 + 8 + 8;
pub(crate) const RECORD_OVERHEAD: usize = RECORD_PREFIX + 4;

/// Kind byte of a block record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordKind {
    /// An appended entry.
    Entry = 1,
    /// The block stopped accepting appends.
    Archived = 2,
}

impl RecordKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Entry),
            2 => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Fixed part of a decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHead {
    pub kind: RecordKind,
    pub mark: u64,
    pub seq: u64,
    pub stime: i64,
    pub payload_len: usize,
}

impl RecordHead {
    pub fn total_len(&self) -> usize {
        RECORD_OVERHEAD + self.payload_len
    }
}

pub(crate) fn encode_header(id: BlockId, capacity: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    buf.extend_from_slice(&BLOCK_MAGIC);
    buf.extend_from_slice(&BLOCK_VERSION.to_le_bytes());
    buf.extend_from_slice(&id.as_u64().to_le_bytes());
    buf.extend_from_slice(&capacity.to_le_bytes());
    let crc = crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Returns `(id, capacity)`.
pub(crate) fn decode_header(buf: &[u8]) -> CoreResult<(BlockId, u64)> {
    if buf.len() < HEADER_SIZE {
        return Err(CoreError::block_corruption("short block header"));
    }
    if buf[0..4] != BLOCK_MAGIC {
        return Err(CoreError::block_corruption("bad block magic"));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != BLOCK_VERSION {
        return Err(CoreError::block_corruption(format!(
            "unsupported block version {version}"
        )));
    }
    check_crc(&buf[..HEADER_SIZE])?;
    let id = BlockId::new(read_u64(buf, 6));
    let capacity = read_u64(buf, 14);
    Ok((id, capacity))
}

pub(crate) fn encode_record(kind: RecordKind, mark: u64, seq: u64, stime: i64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(&mark.to_le_bytes());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&stime.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Parses the fixed prefix of a record. `buf` must hold `RECORD_PREFIX`
/// bytes.
pub(crate) fn decode_head(buf: &[u8], at: u64) -> CoreResult<RecordHead> {
    let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let kind = RecordKind::from_byte(buf[4]).ok_or_else(|| {
        CoreError::block_corruption(format!("unknown record kind {} at offset {at}", buf[4]))
    })?;
    Ok(RecordHead {
        kind,
        mark: read_u64(buf, 5),
        seq: read_u64(buf, 13),
        stime: read_u64(buf, 21) as i64,
        payload_len,
    })
}

/// Verifies the trailing CRC of a full record or header.
pub(crate) fn check_crc(buf: &[u8]) -> CoreResult<()> {
    let split = buf.len() - 4;
    let stored = u32::from_le_bytes([buf[split], buf[split + 1], buf[split + 2], buf[split + 3]]);
    let actual = crc32(&buf[..split]);
    if stored != actual {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual,
        });
    }
    Ok(())
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encodes_id_and_capacity() {
        let buf = encode_header(BlockId::new(7), 4096);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(decode_header(&buf).unwrap(), (BlockId::new(7), 4096));

        let mut bad = buf;
        bad[10] ^= 1;
        assert!(matches!(
            decode_header(&bad),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn record_head_matches_fields() {
        let buf = encode_record(RecordKind::Entry, 9, 3, -12, b"abc");
        assert_eq!(buf.len(), RECORD_OVERHEAD + 3);
        let head = decode_head(&buf, 0).unwrap();
        assert_eq!(head.kind, RecordKind::Entry);
        assert_eq!((head.mark, head.seq, head.stime), (9, 3, -12));
        assert_eq!(head.total_len(), buf.len());
        check_crc(&buf).unwrap();
        assert_eq!(&buf[RECORD_PREFIX..RECORD_PREFIX + 3], b"abc");
    }

    #[test]
    fn unknown_kind_is_corruption() {
        let mut buf = encode_record(RecordKind::Archived, 0, 0, 0, b"");
        buf[4] = 77;
        assert!(matches!(
            decode_head(&buf, 0),
            Err(CoreError::BlockCorruption { .. })
        ));
    }
}
