//! Conversion between [`CloudEvent`] and [`Entry`].

use crate::entry::{Entry, Ordinal, Value};
use crate::event::{AttributeValue, CloudEvent, EventData};
use chrono::{DateTime, SecondsFormat, Utc};

/// Position of the event inside its block, stamped on read.
pub const BLOCK_OFFSET_ATTR: &str = "xevblockoffset";
/// Position of the event inside its event log, stamped by the log layer.
pub const LOG_OFFSET_ATTR: &str = "xevlogoffset";
/// Store time in milliseconds, stamped on read.
pub const STIME_ATTR: &str = "xevstime";

const DATA_CONTENT_TYPE_ATTR: &str = "datacontenttype";
const DATA_SCHEMA_ATTR: &str = "dataschema";
const SUBJECT_ATTR: &str = "subject";
const TIME_ATTR: &str = "time";

/// Extension attribute values are stored as bytes: text for scalars,
/// RFC 3339 with nanoseconds for timestamps.
#[must_use]
pub fn attr_value(value: &AttributeValue) -> Vec<u8> {
    match value {
        AttributeValue::Bool(b) => b.to_string().into_bytes(),
        AttributeValue::Integer(i) => i.to_string().into_bytes(),
        AttributeValue::String(s) | AttributeValue::Uri(s) | AttributeValue::UriRef(s) => {
            s.clone().into_bytes()
        }
        AttributeValue::Bytes(b) => b.clone(),
        AttributeValue::Timestamp(t) => t.to_rfc3339_opts(SecondsFormat::Nanos, true).into_bytes(),
    }
}

fn text_of(value: &AttributeValue) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => String::from_utf8_lossy(&attr_value(value)).into_owned(),
    }
}

/// Converts an incoming event into an entry.
///
/// Reserved attributes are dropped. Proto payloads keep only their encoded
/// bytes and come back as binary data.
#[must_use]
pub fn to_entry(mut event: CloudEvent) -> Entry {
    for reserved in [BLOCK_OFFSET_ATTR, LOG_OFFSET_ATTR, STIME_ATTR] {
        event.attributes.remove(reserved);
    }

    let mut entry = Entry::new()
        .with(Ordinal::Id, Value::Text(event.id))
        .with(Ordinal::Source, Value::Text(event.source))
        .with(Ordinal::SpecVersion, Value::Text(event.spec_version))
        .with(Ordinal::Type, Value::Text(event.ty));

    match event.data {
        Some(EventData::Binary(b)) => {
            entry.set(Ordinal::Data, Value::Bytes(b));
        }
        Some(EventData::Text(s)) => {
            entry.set(Ordinal::Data, Value::Text(s));
        }
        Some(EventData::Proto { value, .. }) => {
            entry.set(Ordinal::Data, Value::Bytes(value));
        }
        None => {}
    }

    for (name, value) in event.attributes {
        match name.as_str() {
            DATA_CONTENT_TYPE_ATTR => {
                entry.set(Ordinal::DataContentType, Value::Text(text_of(&value)));
            }
            DATA_SCHEMA_ATTR => {
                entry.set(Ordinal::DataSchema, Value::Text(text_of(&value)));
            }
            SUBJECT_ATTR => {
                entry.set(Ordinal::Subject, Value::Text(text_of(&value)));
            }
            TIME_ATTR => match value {
                AttributeValue::Timestamp(t) => {
                    entry.set(Ordinal::Time, Value::Time(t));
                }
                other => {
                    if let Ok(t) = DateTime::parse_from_rfc3339(&text_of(&other)) {
                        entry.set(Ordinal::Time, Value::Time(t.with_timezone(&Utc)));
                    }
                }
            },
            _ => entry.set_extension(name, attr_value(&value)),
        }
    }
    entry
}

/// Rebuilds an event from a stored entry, stamping its block offset and
/// store time.
///
/// Extension values come back as strings when they are valid UTF-8 and as
/// bytes otherwise.
#[must_use]
pub fn to_event(entry: &Entry, block_offset: u64, stime_ms: i64) -> CloudEvent {
    let text = |o: Ordinal| {
        entry
            .get(o)
            .and_then(Value::as_text)
            .map(str::to_string)
            .unwrap_or_default()
    };
    let mut event = CloudEvent {
        id: text(Ordinal::Id),
        source: text(Ordinal::Source),
        spec_version: text(Ordinal::SpecVersion),
        ty: text(Ordinal::Type),
        attributes: Default::default(),
        data: match entry.get(Ordinal::Data) {
            Some(Value::Text(s)) => Some(EventData::Text(s.clone())),
            Some(Value::Bytes(b)) => Some(EventData::Binary(b.clone())),
            Some(Value::Time(_)) | None => None,
        },
    };

    for (ordinal, name) in [
        (Ordinal::DataContentType, DATA_CONTENT_TYPE_ATTR),
        (Ordinal::DataSchema, DATA_SCHEMA_ATTR),
        (Ordinal::Subject, SUBJECT_ATTR),
    ] {
        if let Some(Value::Text(s)) = entry.get(ordinal) {
            event
                .attributes
                .insert(name.to_string(), AttributeValue::String(s.clone()));
        }
    }
    if let Some(Value::Time(t)) = entry.get(Ordinal::Time) {
        event
            .attributes
            .insert(TIME_ATTR.to_string(), AttributeValue::Timestamp(*t));
    }

    for (name, value) in entry.extensions() {
        let attr = match std::str::from_utf8(value) {
            Ok(s) => AttributeValue::String(s.to_string()),
            Err(_) => AttributeValue::Bytes(value.clone()),
        };
        event.attributes.insert(name.clone(), attr);
    }

    event.attributes.insert(
        BLOCK_OFFSET_ATTR.to_string(),
        AttributeValue::String(block_offset.to_string()),
    );
    event.attributes.insert(
        STIME_ATTR.to_string(),
        AttributeValue::String(stime_ms.to_string()),
    );
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_event() -> CloudEvent {
        CloudEvent::new("evt-9", "/orders", "order.created")
            .with_data(EventData::Binary(vec![1, 2, 3]))
            .with_attribute(SUBJECT_ATTR, AttributeValue::String("o-1".into()))
            .with_attribute(
                TIME_ATTR,
                AttributeValue::Timestamp(DateTime::from_timestamp(1_700_000_000, 5).unwrap()),
            )
            .with_attribute("retries", AttributeValue::Integer(3))
            .with_attribute("traced", AttributeValue::Bool(true))
    }

    #[test]
    fn fixed_attributes_land_in_slots() {
        let entry = to_entry(order_event());

        assert_eq!(entry.get(Ordinal::Id), Some(&Value::Text("evt-9".into())));
        assert_eq!(entry.get(Ordinal::SpecVersion), Some(&Value::Text("1.0".into())));
        assert_eq!(entry.get(Ordinal::Subject), Some(&Value::Text("o-1".into())));
        assert_eq!(entry.get(Ordinal::Data), Some(&Value::Bytes(vec![1, 2, 3])));
        assert!(matches!(entry.get(Ordinal::Time), Some(Value::Time(_))));
        assert_eq!(entry.get(Ordinal::DataSchema), None);

        let names: Vec<_> = entry.extensions().keys().cloned().collect();
        assert_eq!(names, vec!["retries", "traced"]);
        assert_eq!(entry.extension("retries"), Some(&b"3"[..]));
        assert_eq!(entry.extension("traced"), Some(&b"true"[..]));
    }

    #[test]
    fn reserved_attributes_are_stripped() {
        let event = order_event()
            .with_attribute(BLOCK_OFFSET_ATTR, AttributeValue::String("99".into()))
            .with_attribute(LOG_OFFSET_ATTR, AttributeValue::String("12".into()))
            .with_attribute(STIME_ATTR, AttributeValue::Integer(1));
        let entry = to_entry(event);
        assert!(entry.extension(BLOCK_OFFSET_ATTR).is_none());
        assert!(entry.extension(LOG_OFFSET_ATTR).is_none());
        assert!(entry.extension(STIME_ATTR).is_none());
    }

    #[test]
    fn timestamps_render_as_rfc3339_nanos() {
        let t = DateTime::from_timestamp(0, 1).unwrap();
        assert_eq!(
            attr_value(&AttributeValue::Timestamp(t)),
            b"1970-01-01T00:00:00.000000001Z".to_vec()
        );
    }

    #[test]
    fn to_event_stamps_offset_and_stime() {
        let entry = to_entry(order_event());
        let event = to_event(&entry, 42, 1_700_000_000_123);

        assert_eq!(event.id, "evt-9");
        assert_eq!(event.ty, "order.created");
        assert_eq!(event.data, Some(EventData::Binary(vec![1, 2, 3])));
        assert_eq!(
            event.attributes.get(BLOCK_OFFSET_ATTR),
            Some(&AttributeValue::String("42".into()))
        );
        assert_eq!(
            event.attributes.get(STIME_ATTR),
            Some(&AttributeValue::String("1700000000123".into()))
        );
        assert_eq!(
            event.attributes.get("retries"),
            Some(&AttributeValue::String("3".into()))
        );

        // Feeding the stamped event back in yields the same entry.
        assert_eq!(to_entry(event), entry);
    }

    #[test]
    fn events_serialize_through_cbor() {
        let event = order_event();
        let mut buf = Vec::new();
        ciborium::into_writer(&event, &mut buf).unwrap();
        let back: CloudEvent = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(back, event);
    }
}
