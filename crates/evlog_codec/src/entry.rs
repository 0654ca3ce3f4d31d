//! Internal entry representation and its binary form.

use crate::error::{CodecError, CodecResult};
use bytes::{Buf, BufMut};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

const ENTRY_VERSION: u8 = 1;

const TAG_TEXT: u8 = 0;
const TAG_BYTES: u8 = 1;
const TAG_TIME: u8 = 2;

/// Fixed attribute slots of an entry.
///
/// Discriminants are persisted; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Ordinal {
    /// Event identifier.
    Id = 0,
    /// Event source URI reference.
    Source = 1,
    /// CloudEvents spec version.
    SpecVersion = 2,
    /// Event type.
    Type = 3,
    /// Payload.
    Data = 4,
    /// `datacontenttype` attribute.
    DataContentType = 5,
    /// `dataschema` attribute.
    DataSchema = 6,
    /// `subject` attribute.
    Subject = 7,
    /// `time` attribute.
    Time = 8,
}

impl Ordinal {
    /// Number of slots.
    pub const COUNT: usize = 9;

    /// All slots in numeric order.
    pub const ALL: [Ordinal; Self::COUNT] = [
        Ordinal::Id,
        Ordinal::Source,
        Ordinal::SpecVersion,
        Ordinal::Type,
        Ordinal::Data,
        Ordinal::DataContentType,
        Ordinal::DataSchema,
        Ordinal::Subject,
        Ordinal::Time,
    ];

    /// Slot for a raw persisted number.
    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A value held in a fixed slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// A point in time.
    Time(DateTime<Utc>),
}

impl Value {
    /// Text content, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Value::Text(s) => 4 + s.len(),
            Value::Bytes(b) => 4 + b.len(),
            Value::Time(_) => 12,
        }
    }
}

/// One stored record.
///
/// Equality is field-for-field, so an entry read back from a block compares
/// equal to the entry that was appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    fields: [Option<Value>; Ordinal::COUNT],
    extensions: BTreeMap<String, Vec<u8>>,
}

impl Entry {
    /// Creates an entry with every slot empty.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value in `ordinal`, if set.
    #[must_use]
    pub fn get(&self, ordinal: Ordinal) -> Option<&Value> {
        self.fields[ordinal.index()].as_ref()
    }

    /// Sets `ordinal` to `value`, returning the previous value.
    pub fn set(&mut self, ordinal: Ordinal, value: Value) -> Option<Value> {
        self.fields[ordinal.index()].replace(value)
    }

    /// Builder form of [`Entry::set`].
    #[must_use]
    pub fn with(mut self, ordinal: Ordinal, value: Value) -> Self {
        self.set(ordinal, value);
        self
    }

    /// Iterates set slots in ordinal order.
    pub fn fields(&self) -> impl Iterator<Item = (Ordinal, &Value)> {
        Ordinal::ALL
            .iter()
            .filter_map(|&o| self.get(o).map(|v| (o, v)))
    }

    /// Number of set slots.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.iter().filter(|f| f.is_some()).count()
    }

    /// Extension attribute `name`.
    #[must_use]
    pub fn extension(&self, name: &str) -> Option<&[u8]> {
        self.extensions.get(name).map(Vec::as_slice)
    }

    /// Sets extension attribute `name`.
    pub fn set_extension(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.extensions.insert(name.into(), value.into());
    }

    /// Extension attributes, sorted by name.
    #[must_use]
    pub fn extensions(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.extensions
    }

    /// Size of [`Entry::encode`]'s output without producing it.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let fields: usize = self.fields().map(|(_, v)| 2 + v.encoded_len()).sum();
        let exts: usize = self
            .extensions
            .iter()
            .map(|(k, v)| 2 + k.len() + 4 + v.len())
            .sum();
        1 + 1 + fields + 4 + exts
    }

    /// Binary form.
    ///
    /// ```text
    /// | version u8 | nfields u8 | { ordinal u8 | tag u8 | value }* |
    /// | next u32 | { name_len u16 | name | value_len u32 | value }* |
    /// ```
    ///
    /// Integers are little-endian. Text and bytes values are `len u32 | data`;
    /// a time value is `secs i64 | nanos u32`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_u8(ENTRY_VERSION);
        buf.put_u8(self.field_count() as u8);
        for (ordinal, value) in self.fields() {
            buf.put_u8(ordinal as u8);
            match value {
                Value::Text(s) => {
                    buf.put_u8(TAG_TEXT);
                    buf.put_u32_le(s.len() as u32);
                    buf.put_slice(s.as_bytes());
                }
                Value::Bytes(b) => {
                    buf.put_u8(TAG_BYTES);
                    buf.put_u32_le(b.len() as u32);
                    buf.put_slice(b);
                }
                Value::Time(t) => {
                    buf.put_u8(TAG_TIME);
                    buf.put_i64_le(t.timestamp());
                    buf.put_u32_le(t.timestamp_subsec_nanos());
                }
            }
        }
        buf.put_u32_le(self.extensions.len() as u32);
        for (name, value) in &self.extensions {
            buf.put_u16_le(name.len() as u16);
            buf.put_slice(name.as_bytes());
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(value);
        }
        buf
    }

    /// Parses the output of [`Entry::encode`].
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] on truncated, unknown or trailing input.
    pub fn decode(mut input: &[u8]) -> CodecResult<Self> {
        let buf = &mut input;
        need(buf, 2)?;
        let version = buf.get_u8();
        if version != ENTRY_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let mut entry = Entry::new();
        let nfields = buf.get_u8();
        for _ in 0..nfields {
            need(buf, 2)?;
            let raw = buf.get_u8();
            let ordinal = Ordinal::from_u8(raw).ok_or(CodecError::UnknownOrdinal(raw))?;
            let value = match buf.get_u8() {
                TAG_TEXT => Value::Text(take_string(buf, "field")?),
                TAG_BYTES => Value::Bytes(take_bytes(buf)?),
                TAG_TIME => {
                    need(buf, 12)?;
                    let secs = buf.get_i64_le();
                    let nanos = buf.get_u32_le();
                    let t = DateTime::from_timestamp(secs, nanos)
                        .ok_or(CodecError::InvalidTimestamp { secs, nanos })?;
                    Value::Time(t)
                }
                tag => return Err(CodecError::UnknownValueTag { ordinal: raw, tag }),
            };
            entry.set(ordinal, value);
        }

        need(buf, 4)?;
        let next = buf.get_u32_le();
        for _ in 0..next {
            need(buf, 2)?;
            let len = usize::from(buf.get_u16_le());
            need(buf, len)?;
            let name = String::from_utf8(buf[..len].to_vec())
                .map_err(|_| CodecError::InvalidUtf8("extension name"))?;
            buf.advance(len);
            let value = take_bytes(buf)?;
            entry.extensions.insert(name, value);
        }

        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }
        Ok(entry)
    }
}

fn need(buf: &&[u8], needed: usize) -> CodecResult<()> {
    if buf.len() < needed {
        return Err(CodecError::UnexpectedEof {
            needed,
            remaining: buf.len(),
        });
    }
    Ok(())
}

fn take_bytes(buf: &mut &[u8]) -> CodecResult<Vec<u8>> {
    need(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    need(buf, len)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

fn take_string(buf: &mut &[u8], what: &'static str) -> CodecResult<String> {
    String::from_utf8(take_bytes(buf)?).map_err(|_| CodecError::InvalidUtf8(what))
}
