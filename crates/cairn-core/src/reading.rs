//! Decoded readings and the collector-to-sink event stream.

use cairn_proto::content_format;
use serde::Serialize;

/// A decoded telemetry payload value.
///
/// Devices report text/plain numeric payloads (the common case for
/// constrained sensors) or CBOR values; anything else is carried raw so
/// the sink still records the delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReadingValue {
    /// Numeric reading.
    Float(f64),
    /// Integer reading that does not fit the float path losslessly.
    Integer(i64),
    /// Textual payload that did not parse as a number.
    Text(String),
    /// Raw bytes for unknown or binary content formats.
    Raw(Vec<u8>),
}

/// One accepted reading, the unit handed to the external sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Stable identity of the source device.
    pub device_id: String,
    /// Resource path the value was collected from.
    pub resource_path: String,
    /// Decoded payload value.
    pub value: ReadingValue,
    /// Receipt time, milliseconds since the unix epoch.
    pub timestamp_ms: u64,
}

/// Why collection from a device/resource failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionErrorKind {
    /// An exchange exhausted its retransmissions.
    Timeout,
    /// The peer explicitly rejected the request or a notification
    /// exchange with a Reset; the resource stays uncollectable until
    /// reconfiguration.
    Rejected,
    /// The observation went silent and re-registration exhausted its
    /// budget.
    ObserveLost,
}

/// Structured failure event for the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionError {
    /// Stable identity of the source device.
    pub device_id: String,
    /// Resource path collection failed for.
    pub resource_path: String,
    /// Failure classification.
    pub kind: CollectionErrorKind,
    /// Event time, milliseconds since the unix epoch.
    pub timestamp_ms: u64,
}

/// Event stream handed to the external log sink, ordered per device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CollectorEvent {
    /// An accepted reading.
    Reading(Reading),
    /// A collection failure that exceeded its retry budget.
    Error(CollectionError),
}

/// Decode a notification payload according to its Content-Format.
///
/// Absent and text/plain formats take the numeric-text path; CBOR
/// payloads decode through `ciborium`; unknown formats and undecodable
/// payloads fall back to [`ReadingValue::Raw`].
pub fn decode_payload(format: Option<u16>, payload: &[u8]) -> ReadingValue {
    match format {
        None | Some(content_format::TEXT_PLAIN | content_format::JSON) => decode_text(payload),
        Some(content_format::CBOR) => decode_cbor(payload),
        _ => ReadingValue::Raw(payload.to_vec()),
    }
}

fn decode_text(payload: &[u8]) -> ReadingValue {
    match std::str::from_utf8(payload) {
        Ok(text) => {
            let trimmed = text.trim();
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map_or_else(|| ReadingValue::Text(text.to_owned()), ReadingValue::Float)
        },
        Err(_) => ReadingValue::Raw(payload.to_vec()),
    }
}

fn decode_cbor(payload: &[u8]) -> ReadingValue {
    match ciborium::de::from_reader::<ciborium::Value, _>(payload) {
        Ok(ciborium::Value::Float(v)) => ReadingValue::Float(v),
        Ok(ciborium::Value::Integer(v)) => {
            i64::try_from(v).map_or_else(|_| ReadingValue::Raw(payload.to_vec()), ReadingValue::Integer)
        },
        Ok(ciborium::Value::Text(v)) => ReadingValue::Text(v),
        _ => ReadingValue::Raw(payload.to_vec()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_number_decodes_to_float() {
        assert_eq!(decode_payload(Some(0), b"21.5"), ReadingValue::Float(21.5));
        assert_eq!(decode_payload(None, b" -4 \n"), ReadingValue::Float(-4.0));
    }

    #[test]
    fn non_numeric_text_is_text() {
        assert_eq!(decode_payload(Some(0), b"warming up"), ReadingValue::Text("warming up".into()));
    }

    #[test]
    fn invalid_utf8_is_raw() {
        assert_eq!(decode_payload(Some(0), &[0xFF, 0xFE]), ReadingValue::Raw(vec![0xFF, 0xFE]));
    }

    #[test]
    fn cbor_float_decodes() {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&21.5f64, &mut buf).unwrap();
        assert_eq!(decode_payload(Some(60), &buf), ReadingValue::Float(21.5));
    }

    #[test]
    fn cbor_integer_decodes() {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&-12i64, &mut buf).unwrap();
        assert_eq!(decode_payload(Some(60), &buf), ReadingValue::Integer(-12));
    }

    #[test]
    fn octet_stream_is_raw() {
        assert_eq!(decode_payload(Some(42), &[1, 2, 3]), ReadingValue::Raw(vec![1, 2, 3]));
    }

    #[test]
    fn events_serialize_as_tagged_json() {
        let event = CollectorEvent::Reading(Reading {
            device_id: "mote-1".into(),
            resource_path: "dh/tmp".into(),
            value: ReadingValue::Float(22.0),
            timestamp_ms: 1_700_000_000_000,
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"reading\""));
        assert!(json.contains("\"value\":22.0"));
    }

    #[test]
    fn error_event_kind_is_snake_case() {
        let event = CollectorEvent::Error(CollectionError {
            device_id: "mote-1".into(),
            resource_path: "dh/tmp".into(),
            kind: CollectionErrorKind::ObserveLost,
            timestamp_ms: 0,
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"observe_lost\""));
    }
}
