//! Log-structured key/value file shared by both metadata stores.
//!
//! ```text
//! | body_len u32 | op u8 | key_len u16 | key | value | crc32 (4) |
//! ```
//!
//! The CRC covers `body_len` and the body. Opening replays every record
//! into a sorted map; the last write to a key wins.

use crate::checksum::crc32;
use crate::error::{CoreError, CoreResult};
use evlog_storage::StorageBackend;
use std::collections::BTreeMap;
use tracing::warn;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;
const LEN_SIZE: usize = 4;
const CRC_SIZE: usize = 4;

pub(crate) struct KvLog {
    backend: Box<dyn StorageBackend>,
    map: BTreeMap<String, Vec<u8>>,
    pending: Vec<u8>,
}

impl KvLog {
    pub fn open(mut backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let data = backend.read_from(0)?;
        let mut map = BTreeMap::new();
        let mut pos = 0usize;
        while pos + LEN_SIZE <= data.len() {
            let body_len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
            let end = pos + LEN_SIZE + body_len + CRC_SIZE;
            if end > data.len() {
                break;
            }
            let crc_at = end - CRC_SIZE;
            let stored = u32::from_le_bytes([data[crc_at], data[crc_at + 1], data[crc_at + 2], data[crc_at + 3]]);
            let actual = crc32(&data[pos..crc_at]);
            if stored != actual {
                return Err(CoreError::ChecksumMismatch {
                    expected: stored,
                    actual,
                });
            }
            apply(&mut map, &data[pos + LEN_SIZE..crc_at], pos)?;
            pos = end;
        }
        if pos < data.len() {
            warn!(valid = pos, size = data.len(), "truncating torn metadata tail");
            backend.truncate(pos as u64)?;
        }
        Ok(Self {
            backend,
            map,
            pending: Vec::new(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.map.get(key).map(Vec::as_slice)
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Updates the map and stages the record. Nothing reaches the backend
    /// until [`KvLog::write_pending`].
    pub fn stage_put(&mut self, key: &str, value: Vec<u8>) {
        encode(&mut self.pending, OP_PUT, key, &value);
        self.map.insert(key.to_string(), value);
    }

    pub fn stage_delete(&mut self, key: &str) {
        if self.map.remove(key).is_some() {
            encode(&mut self.pending, OP_DELETE, key, &[]);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn write_pending(&mut self, sync: bool) -> CoreResult<()> {
        if !self.pending.is_empty() {
            self.backend.append(&self.pending)?;
            self.pending.clear();
        }
        if sync {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(())
    }
}

fn encode(buf: &mut Vec<u8>, op: u8, key: &str, value: &[u8]) {
    let start = buf.len();
    let body_len = 1 + 2 + key.len() + value.len();
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    buf.push(op);
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(value);
    let crc = crc32(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

fn apply(map: &mut BTreeMap<String, Vec<u8>>, body: &[u8], at: usize) -> CoreResult<()> {
    if body.len() < 3 {
        return Err(CoreError::meta_corruption(format!("short record at offset {at}")));
    }
    let key_len = usize::from(u16::from_le_bytes([body[1], body[2]]));
    let key_end = 3 + key_len;
    if key_end > body.len() {
        return Err(CoreError::meta_corruption(format!("key overruns record at offset {at}")));
    }
    let key = std::str::from_utf8(&body[3..key_end])
        .map_err(|_| CoreError::meta_corruption(format!("non utf-8 key at offset {at}")))?
        .to_string();
    match body[0] {
        OP_PUT => {
            map.insert(key, body[key_end..].to_vec());
        }
        OP_DELETE => {
            map.remove(&key);
        }
        op => {
            return Err(CoreError::meta_corruption(format!("unknown op {op} at offset {at}")));
        }
    }
    Ok(())
}
