//! # evlog codec
//!
//! Two representations of an event live here:
//!
//! - [`Entry`], the internal form stored in blocks. Fixed CloudEvents
//!   attributes sit in numbered [`Ordinal`] slots; everything else is an
//!   extension attribute kept sorted by name. [`Entry::encode`] and
//!   [`Entry::decode`] define its binary form.
//! - [`CloudEvent`], the wire form exchanged with clients.
//!
//! [`to_entry`] and [`to_event`] convert between them. Reserved attributes
//! that the store itself stamps on outgoing events ([`BLOCK_OFFSET_ATTR`],
//! [`LOG_OFFSET_ATTR`], [`STIME_ATTR`]) are stripped on the way in so user
//! data can never collide with them.
//!
//! ```rust
//! use evlog_codec::{to_entry, to_event, CloudEvent, EventData, Ordinal, Value};
//!
//! let mut event = CloudEvent::new("id-1", "/orders", "order.created");
//! event.data = Some(EventData::Text("{}".into()));
//! let entry = to_entry(event);
//! assert_eq!(entry.get(Ordinal::Type), Some(&Value::Text("order.created".into())));
//!
//! let back = to_event(&entry, 7, 1_700_000_000_000);
//! assert_eq!(back.id, "id-1");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod convert;
mod entry;
mod error;
mod event;

pub use convert::{
    attr_value, to_entry, to_event, BLOCK_OFFSET_ATTR, LOG_OFFSET_ATTR, STIME_ATTR,
};
pub use entry::{Entry, Ordinal, Value};
pub use error::{CodecError, CodecResult};
pub use event::{AttributeValue, CloudEvent, EventData};
