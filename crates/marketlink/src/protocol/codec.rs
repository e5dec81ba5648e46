//! Frame codec with a one-byte format discriminant.
//!
//! Binary frames are `byte[0] = format flag, byte[1..] = payload`. The
//! transport already delimits frames, so the flag is the only framing needed.
//! Text frames are either the bare heartbeat strings or JSON envelopes.
//!
//! Decoding never fails loudly: an undecodable frame is logged and dropped
//! so one bad frame cannot take a healthy channel down.

use std::{
    borrow::Cow,
    fmt,
    io::{Read, Write},
    sync::Arc,
};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    envelope::{HEARTBEAT_TYPES, ProtocolInit, TaggedEnvelope, normalize},
    types::{Category, Message, WsMessage},
};
use crate::error::{SyncError, SyncResult};

/// Which codec and compression produced the rest of a binary frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FormatFlag {
    RawBinary = 0,
    CompressedBinary = 1,
    Json = 2,
    CompressedJson = 3,
}

impl FormatFlag {
    pub const ALL: [FormatFlag; 4] = [
        Self::RawBinary,
        Self::CompressedBinary,
        Self::Json,
        Self::CompressedJson,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::RawBinary),
            1 => Some(Self::CompressedBinary),
            2 => Some(Self::Json),
            3 => Some(Self::CompressedJson),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Payload must be inflated before structural decoding.
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::CompressedBinary | Self::CompressedJson)
    }

    /// Payload is MessagePack.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::RawBinary | Self::CompressedBinary)
    }
}

impl fmt::Display for FormatFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RawBinary => "msgpack",
            Self::CompressedBinary => "msgpack+deflate",
            Self::Json => "json",
            Self::CompressedJson => "json+deflate",
        };
        f.write_str(name)
    }
}

/// A structural codec between bytes and JSON-shaped values.
pub trait Codec: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn encode(&self, value: &Value) -> SyncResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> SyncResult<Value>;
}

/// MessagePack codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, value: &Value) -> SyncResult<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| SyncError::decode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> SyncResult<Value> {
        rmp_serde::from_slice(bytes).map_err(|e| SyncError::decode(e.to_string()))
    }
}

/// UTF-8 JSON codec. Always available.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> SyncResult<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// What this side can decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub msgpack: bool,
    pub compression: bool,
}

/// True for the bare heartbeat strings `ping` and `pong`.
pub fn is_heartbeat_text(text: &str) -> bool {
    HEARTBEAT_TYPES.contains(&text)
}

/// True for heartbeat-category messages and for `ping`/`pong` of any category.
pub fn is_heartbeat(message: &Message) -> bool {
    message.category == Category::Heartbeat
        || HEARTBEAT_TYPES.contains(&message.message_type.as_str())
}

/// Encoder/decoder for one channel.
#[derive(Clone)]
pub struct ProtocolCodec {
    binary: Option<Arc<dyn Codec>>,
    json: Arc<dyn Codec>,
    compression: bool,
    advertise_compression: bool,
    default_category: Category,
    max_inflated_size: usize,
}

impl fmt::Debug for ProtocolCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolCodec")
            .field("binary", &self.binary.as_ref().map(|c| c.name()))
            .field("compression", &self.compression)
            .field("default_category", &self.default_category)
            .finish()
    }
}

impl Default for ProtocolCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolCodec {
    /// Codec with MessagePack and inflate available.
    pub fn new() -> Self {
        Self {
            binary: Some(Arc::new(BinaryCodec)),
            json: Arc::new(JsonCodec),
            compression: true,
            advertise_compression: false,
            default_category: Category::Market,
            max_inflated_size: 16 * 1024 * 1024,
        }
    }

    /// Codec without MessagePack; binary frames fall back to JSON.
    pub fn json_only() -> Self {
        Self {
            binary: None,
            ..Self::new()
        }
    }

    /// Replace the binary codec, or remove it with `None`.
    #[must_use]
    pub fn with_binary_codec(mut self, codec: Option<Arc<dyn Codec>>) -> Self {
        self.binary = codec;
        self
    }

    /// Enable or disable inflate support.
    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Whether compressed binary is advertised in [`ProtocolInit`].
    #[must_use]
    pub fn advertise_compression(mut self, advertise: bool) -> Self {
        self.advertise_compression = advertise;
        self
    }

    /// Category given to legacy frames that do not declare one.
    #[must_use]
    pub fn with_default_category(mut self, category: Category) -> Self {
        self.default_category = category;
        self
    }

    /// Cap on the size of an inflated payload.
    #[must_use]
    pub fn with_max_inflated_size(mut self, max: usize) -> Self {
        self.max_inflated_size = max;
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            msgpack: self.binary.is_some(),
            compression: self.compression,
        }
    }

    pub fn advertises_compression(&self) -> bool {
        self.advertise_compression
    }

    /// Decode a frame, dropping (and logging) anything undecodable.
    pub fn decode(&self, frame: &WsMessage) -> Option<Message> {
        match self.decode_frame(frame) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(error = %err, size = frame.len(), "Dropping undecodable frame");
                None
            }
        }
    }

    /// Decode a frame, returning why it could not be decoded.
    pub fn decode_frame(&self, frame: &WsMessage) -> SyncResult<Message> {
        match frame {
            WsMessage::Text(text) => {
                if is_heartbeat_text(text) {
                    return Ok(Message::heartbeat(text.as_str()));
                }
                let value = self.json.decode(text.as_bytes())?;
                normalize(value, self.default_category)
            }
            WsMessage::Binary(bytes) => self.decode_binary(bytes),
        }
    }

    fn decode_binary(&self, bytes: &[u8]) -> SyncResult<Message> {
        let Some((&first, rest)) = bytes.split_first() else {
            return Err(SyncError::decode("empty binary frame"));
        };

        let Some(flag) = FormatFlag::from_byte(first) else {
            // Unprefixed frame from a peer that predates the format flag.
            return self
                .decode_json_bytes(bytes)
                .map_err(|_| SyncError::decode(format!("unknown format flag {first}")));
        };

        let body: Cow<'_, [u8]> = if flag.is_compressed() {
            Cow::Owned(self.inflate(rest)?)
        } else {
            Cow::Borrowed(rest)
        };

        if flag.is_binary() {
            match &self.binary {
                Some(codec) => match codec.decode(&body) {
                    Ok(value) => return normalize(value, self.default_category),
                    Err(err) => {
                        debug!(error = %err, "MessagePack decode failed, trying JSON");
                    }
                },
                None => debug!(%flag, "MessagePack codec unavailable, trying JSON"),
            }
        }

        self.decode_json_bytes(&body)
    }

    fn decode_json_bytes(&self, body: &[u8]) -> SyncResult<Message> {
        let text = std::str::from_utf8(body).map_err(|e| SyncError::decode(e.to_string()))?;
        if is_heartbeat_text(text) {
            return Ok(Message::heartbeat(text));
        }
        let value = self.json.decode(body)?;
        normalize(value, self.default_category)
    }

    fn inflate(&self, body: &[u8]) -> SyncResult<Vec<u8>> {
        if !self.compression {
            return Err(SyncError::decode("compressed frame but inflate is unavailable"));
        }
        let limit = u64::try_from(self.max_inflated_size).unwrap_or(u64::MAX);
        let mut out = Vec::new();
        ZlibDecoder::new(body)
            .take(limit.saturating_add(1))
            .read_to_end(&mut out)
            .map_err(|e| SyncError::decode(format!("inflate failed: {e}")))?;
        if out.len() > self.max_inflated_size {
            return Err(SyncError::decode("inflated frame exceeds size limit"));
        }
        Ok(out)
    }

    fn deflate(&self, body: &[u8]) -> SyncResult<Vec<u8>> {
        if !self.compression {
            return Err(SyncError::internal("compression is unavailable"));
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(body)
            .map_err(|e| SyncError::internal(format!("deflate failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| SyncError::internal(format!("deflate failed: {e}")))
    }

    /// Encode a message as a flag-prefixed binary frame.
    pub fn encode(&self, message: &Message, flag: FormatFlag) -> SyncResult<WsMessage> {
        let value = TaggedEnvelope::from_message(message).to_value()?;

        let body = if flag.is_binary() {
            let codec = self
                .binary
                .as_ref()
                .ok_or_else(|| SyncError::internal("MessagePack codec unavailable"))?;
            codec.encode(&value)?
        } else {
            self.json.encode(&value)?
        };
        let body = if flag.is_compressed() {
            self.deflate(&body)?
        } else {
            body
        };

        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(flag.as_byte());
        frame.extend_from_slice(&body);
        Ok(WsMessage::Binary(frame))
    }

    /// Encode a message as a tagged JSON text frame.
    pub fn encode_text(&self, message: &Message) -> SyncResult<WsMessage> {
        let value = TaggedEnvelope::from_message(message).to_value()?;
        Ok(WsMessage::Text(serde_json::to_string(&value)?))
    }

    /// Build the negotiation message for a new physical connection.
    ///
    /// Compressed binary is only advertised when explicitly enabled.
    pub fn encode_protocol_init(
        &self,
        news_id: Option<&str>,
        public_key: Option<&str>,
    ) -> SyncResult<WsMessage> {
        let mut init = ProtocolInit::new(self.binary.is_some(), self.advertise_compression);
        if let Some(id) = news_id {
            init = init.news_id(id);
        }
        if let Some(key) = public_key {
            init = init.public_key(key);
        }
        Ok(WsMessage::Text(init.to_json()?))
    }
}
