//! Message model, wire envelopes and the frame codec.

pub mod codec;
pub mod envelope;
pub mod types;

pub use codec::{
    BinaryCodec, Capabilities, Codec, FormatFlag, JsonCodec, ProtocolCodec, is_heartbeat,
    is_heartbeat_text,
};
pub use envelope::{ProtocolAck, ProtocolInit, TaggedEnvelope, normalize};
pub use types::{Category, Message, WsMessage};
