//! WAL record framing.

use crate::checksum::crc32;
use crate::error::{CoreError, CoreResult};
use crate::types::{BlockId, LogIndex, Term};

/// Magic bytes opening every WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"EVWL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;
pub(crate) const CRC_SIZE: usize = 4;

const PAYLOAD_FIXED: usize = 24;

/// Type byte of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// A raft log entry for one block.
    RaftEntry = 1,
}

impl WalRecordType {
    /// Parses a type byte.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::RaftEntry),
            _ => None,
        }
    }
}

/// One raft log entry of one block.
///
/// Every block on the node shares the WAL; `block` says whose log the entry
/// belongs to. A later record with the same block and index supersedes an
/// earlier one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Owning block.
    pub block: BlockId,
    /// Term the entry was created in.
    pub term: Term,
    /// Position in the block's raft log.
    pub index: LogIndex,
    /// Encoded command.
    pub data: Vec<u8>,
}

impl WalRecord {
    /// Framed bytes of this record.
    ///
    /// # Errors
    ///
    /// Fails if the payload does not fit a 4-byte length.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload_len = u32::try_from(PAYLOAD_FIXED + self.data.len())
            .map_err(|_| CoreError::invalid_argument("WAL record payload too large"))?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload_len as usize + CRC_SIZE);
        buf.extend_from_slice(&WAL_MAGIC);
        buf.extend_from_slice(&WAL_VERSION.to_le_bytes());
        buf.push(WalRecordType::RaftEntry as u8);
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&self.block.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.data);
        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a payload of the given type.
    ///
    /// # Errors
    ///
    /// [`CoreError::WalCorruption`] if the payload is too short.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> CoreResult<Self> {
        match record_type {
            WalRecordType::RaftEntry => {
                if payload.len() < PAYLOAD_FIXED {
                    return Err(CoreError::wal_corruption(format!(
                        "raft entry payload of {} bytes",
                        payload.len()
                    )));
                }
                let word = |at: usize| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&payload[at..at + 8]);
                    u64::from_le_bytes(raw)
                };
                Ok(Self {
                    block: BlockId::new(word(0)),
                    term: word(8),
                    index: word(16),
                    data: payload[PAYLOAD_FIXED..].to_vec(),
                })
            }
        }
    }
}

/// Validated header fields.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub record_type: WalRecordType,
    pub payload_len: usize,
}

pub(crate) fn parse_header(header: &[u8], at: u64) -> CoreResult<Header> {
    if header[0..4] != WAL_MAGIC {
        return Err(CoreError::wal_corruption(format!("invalid magic at offset {at}")));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > WAL_VERSION {
        return Err(CoreError::wal_corruption(format!(
            "unsupported version {version} at offset {at}"
        )));
    }
    let record_type = WalRecordType::from_byte(header[6]).ok_or_else(|| {
        CoreError::wal_corruption(format!("unknown record type {} at offset {at}", header[6]))
    })?;
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
    Ok(Header {
        record_type,
        payload_len,
    })
}

/// Checks the CRC of a complete record and decodes it.
pub(crate) fn decode_framed(frame: &[u8], header: Header) -> CoreResult<WalRecord> {
    let body_end = HEADER_SIZE + header.payload_len;
    let stored = u32::from_le_bytes([
        frame[body_end],
        frame[body_end + 1],
        frame[body_end + 2],
        frame[body_end + 3],
    ]);
    let actual = crc32(&frame[..body_end]);
    if stored != actual {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual,
        });
    }
    WalRecord::decode_payload(header.record_type, &frame[HEADER_SIZE..body_end])
}
