//! Wire envelopes.
//!
//! Two inbound JSON shapes exist: the legacy `{type, data?}` envelope and the
//! tagged `{v, cat, type, id?, ts, data?}` envelope. Both normalize into the
//! same [`Message`] so subscribers never see two shapes for one event.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    codec::FormatFlag,
    types::{Category, Message},
};
use crate::error::{SyncError, SyncResult};

/// Version of the tagged envelope.
pub const ENVELOPE_VERSION: u32 = 1;

/// Version string advertised in [`ProtocolInit`].
pub const PROTOCOL_VERSION: &str = "1.0";

/// Types that are treated as heartbeats even without `cat: "heartbeat"`.
pub const HEARTBEAT_TYPES: [&str; 2] = ["ping", "pong"];

/// Legacy types that belong to the system category.
const SYSTEM_TYPES: [&str; 5] = ["connected", "error", "protocol_ack", "subscribed", "info"];

/// Keys that belong to the envelope rather than the payload.
const ENVELOPE_KEYS: [&str; 6] = ["v", "cat", "type", "id", "ts", "data"];

/// Turn a decoded JSON/MessagePack value into a [`Message`].
///
/// Legacy frames carry no category; it is inferred from the type, falling
/// back to `default_category` (the category of the endpoint the frame arrived
/// on). Frames without a non-empty `type` are rejected.
pub fn normalize(value: Value, default_category: Category) -> SyncResult<Message> {
    let Value::Object(mut object) = value else {
        return Err(SyncError::decode("envelope is not an object"));
    };

    let message_type = match object.remove("type") {
        Some(Value::String(t)) if !t.is_empty() => t,
        Some(Value::String(_)) | None => return Err(SyncError::decode("missing message type")),
        Some(other) => {
            return Err(SyncError::decode(format!(
                "message type is not a string: {other}"
            )));
        }
    };

    let declared = object
        .get("cat")
        .and_then(Value::as_str)
        .and_then(Category::from_wire);
    let category = declared.unwrap_or_else(|| infer_category(&message_type, default_category));

    let timestamp = object
        .get("ts")
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    let id = object
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let payload = match object.remove("data") {
        Some(data) => data,
        None => {
            let object = strip_envelope(object);
            if object.is_empty() {
                Value::Null
            } else {
                Value::Object(object)
            }
        }
    };

    Ok(Message {
        category,
        message_type,
        payload,
        timestamp,
        id,
    })
}

fn infer_category(message_type: &str, default_category: Category) -> Category {
    if HEARTBEAT_TYPES.contains(&message_type) || message_type == "heartbeat" {
        Category::Heartbeat
    } else if SYSTEM_TYPES.contains(&message_type) {
        Category::System
    } else {
        default_category
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// Format a timestamp the way the tagged envelope carries it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Outbound tagged envelope.
#[derive(Debug, Serialize)]
pub struct TaggedEnvelope<'a> {
    pub v: u32,
    pub cat: Category,
    #[serde(rename = "type")]
    pub message_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a str>,
    pub ts: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: &'a Value,
}

impl<'a> TaggedEnvelope<'a> {
    pub fn from_message(message: &'a Message) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            cat: message.category,
            message_type: &message.message_type,
            id: message.id.as_deref(),
            ts: format_timestamp(&message.timestamp),
            data: &message.payload,
        }
    }

    pub fn to_value(&self) -> SyncResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Client-to-server negotiation message sent once per physical connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolInit {
    #[serde(rename = "type")]
    pub message_type: String,
    pub v: u32,
    pub protocol_version: String,
    pub features: Vec<String>,
    pub supports_msgpack: bool,
    pub ts: String,
    pub client: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub news_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub public_key: Option<String>,
}

impl ProtocolInit {
    pub fn new(supports_msgpack: bool, supports_compressed_binary: bool) -> Self {
        let mut features = vec!["heartbeat".to_string(), "tagged_envelope".to_string()];
        if supports_msgpack {
            features.push("msgpack".to_string());
        }
        if supports_compressed_binary {
            features.push("compression".to_string());
        }
        Self {
            message_type: "protocol_init".to_string(),
            v: ENVELOPE_VERSION,
            protocol_version: PROTOCOL_VERSION.to_string(),
            features,
            supports_msgpack,
            ts: format_timestamp(&Utc::now()),
            client: "web".to_string(),
            news_id: None,
            public_key: None,
        }
    }

    #[must_use]
    pub fn news_id(mut self, id: impl Into<String>) -> Self {
        self.news_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Server acknowledgement of [`ProtocolInit`].
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ProtocolAck {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub compression: bool,
}

impl ProtocolAck {
    /// Message type that carries an acknowledgement.
    pub const TYPE: &'static str = "protocol_ack";

    /// Extract an acknowledgement from a system message, if it is one.
    pub fn from_message(message: &Message) -> Option<SyncResult<Self>> {
        if message.category != Category::System || message.message_type != Self::TYPE {
            return None;
        }
        Some(serde_json::from_value(message.payload.clone()).map_err(Into::into))
    }

    /// Pick the frame format given what the peer accepted and what is available locally.
    pub fn negotiated_format(
        &self,
        local_msgpack: bool,
        local_compression: bool,
        advertised_compression: bool,
    ) -> FormatFlag {
        let binary = local_msgpack && self.format.as_deref() == Some("msgpack");
        let compressed = self.compression && local_compression && advertised_compression;
        match (binary, compressed) {
            (true, true) => FormatFlag::CompressedBinary,
            (true, false) => FormatFlag::RawBinary,
            (false, true) => FormatFlag::CompressedJson,
            (false, false) => FormatFlag::Json,
        }
    }
}

/// Drop envelope-only keys from a JSON object, leaving payload fields.
fn strip_envelope(mut object: Map<String, Value>) -> Map<String, Value> {
    for key in ENVELOPE_KEYS {
        object.remove(key);
    }
    object
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn legacy_and_tagged_shapes_normalize_identically() {
        let legacy = json!({"type": "trade", "data": {"price": 0.42, "size": 10}});
        let tagged = json!({
            "v": 1,
            "cat": "market",
            "type": "trade",
            "ts": "2026-03-01T12:00:00.000Z",
            "data": {"price": 0.42, "size": 10}
        });

        let a = normalize(legacy, Category::Market).expect("legacy");
        let b = normalize(tagged, Category::User).expect("tagged");

        assert_eq!(a.category, b.category);
        assert_eq!(a.message_type, b.message_type);
        assert_eq!(a.payload, b.payload);
        assert_eq!(format_timestamp(&b.timestamp), "2026-03-01T12:00:00.000Z");
    }

    #[test]
    fn legacy_without_data_keeps_inline_fields() {
        let msg = normalize(
            json!({"type": "market_stats", "current_price": 0.5}),
            Category::Market,
        )
        .expect("message");
        assert_eq!(msg.payload, json!({"current_price": 0.5}));

        let msg = normalize(json!({"type": "positions_update"}), Category::User).expect("msg");
        assert_eq!(msg.payload, Value::Null);
        assert_eq!(msg.category, Category::User);
    }

    #[test]
    fn missing_or_empty_type_is_rejected() {
        assert!(normalize(json!({"data": 1}), Category::Market).is_err());
        assert!(normalize(json!({"type": ""}), Category::Market).is_err());
        assert!(normalize(json!({"type": 7}), Category::Market).is_err());
        assert!(normalize(json!([1, 2]), Category::Market).is_err());
    }

    #[test]
    fn category_inference() {
        let ping = normalize(json!({"type": "ping"}), Category::Market).unwrap();
        assert_eq!(ping.category, Category::Heartbeat);

        let err = normalize(json!({"type": "error", "data": "bad"}), Category::Market).unwrap();
        assert_eq!(err.category, Category::System);

        let unknown_cat =
            normalize(json!({"cat": "weird", "type": "trade"}), Category::User).unwrap();
        assert_eq!(unknown_cat.category, Category::User);
    }

    #[test]
    fn numeric_timestamp_is_millis() {
        let msg = normalize(json!({"type": "trade", "ts": 1_700_000_000_123i64}), Category::Market)
            .unwrap();
        assert_eq!(msg.timestamp.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn protocol_init_wire_shape() {
        let init = ProtocolInit::new(true, false).news_id("abc123");
        let value: Value = serde_json::from_str(&init.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "protocol_init");
        assert_eq!(value["v"], 1);
        assert_eq!(value["client"], "web");
        assert_eq!(value["supports_msgpack"], true);
        assert_eq!(value["news_id"], "abc123");
        assert!(value.get("public_key").is_none());
        let features = value["features"].as_array().unwrap();
        assert!(features.contains(&json!("msgpack")));
        assert!(!features.contains(&json!("compression")));
    }

    #[test]
    fn ack_negotiation() {
        let ack = ProtocolAck {
            format: Some("msgpack".to_string()),
            compression: true,
        };
        assert_eq!(ack.negotiated_format(true, true, false), FormatFlag::RawBinary);
        assert_eq!(ack.negotiated_format(true, true, true), FormatFlag::CompressedBinary);
        assert_eq!(ack.negotiated_format(false, true, false), FormatFlag::Json);

        let msg = Message::new(
            Category::System,
            ProtocolAck::TYPE,
            json!({"format": "json"}),
        );
        let parsed = ProtocolAck::from_message(&msg).unwrap().unwrap();
        assert_eq!(parsed.negotiated_format(true, true, true), FormatFlag::Json);

        let other = Message::new(Category::Market, "trade", Value::Null);
        assert!(ProtocolAck::from_message(&other).is_none());
    }
}
