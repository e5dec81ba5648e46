//! Core message types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw frame as carried by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsMessage {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl WsMessage {
    /// Create a text message.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Create a binary message.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::Binary(data.into())
    }

    /// Get as text if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    /// Get as bytes regardless of message type.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Top-level routing category of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Market,
    User,
    System,
    Heartbeat,
}

impl Category {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::User => "user",
            Self::System => "system",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Parse a wire name.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "market" => Some(Self::Market),
            "user" => Some(Self::User),
            "system" => Some(Self::System),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded message, normalized from either envelope shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub category: Category,
    /// Message type, e.g. `trade`, `order_book`, `market_stats`. Never empty
    /// for anything that reaches a subscriber.
    pub message_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Optional server-assigned id (tagged envelope only).
    pub id: Option<String>,
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(category: Category, message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            category,
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now(),
            id: None,
        }
    }

    /// A bare heartbeat (`ping` or `pong`).
    pub fn heartbeat(message_type: impl Into<String>) -> Self {
        Self::new(Category::Heartbeat, message_type, Value::Null)
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}
