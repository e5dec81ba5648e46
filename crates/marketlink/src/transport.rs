//! Transport seam between channels and the socket library.
//!
//! Channel drivers only see [`TransportFrame`]s, a [`WsWriter`] and a
//! [`FrameStream`], so they can run against a scripted transport in tests.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, stream::BoxStream, stream::SplitSink};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message as TungsteniteMessage, protocol::CloseFrame},
};
use tracing::debug;
use url::Url;

use crate::{
    error::{SyncError, SyncResult},
    protocol::WsMessage,
};

/// One frame as seen by a channel driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Close frame. `code` is `None` when the peer sent no status.
    Close {
        code: Option<u16>,
        reason: String,
    },
}

impl TransportFrame {
    /// Payload size in bytes; zero for control frames.
    pub fn data_len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
            _ => 0,
        }
    }

    /// The data frame as a [`WsMessage`], if this is one.
    pub fn into_message(self) -> Option<WsMessage> {
        match self {
            Self::Text(t) => Some(WsMessage::Text(t)),
            Self::Binary(b) => Some(WsMessage::Binary(b)),
            _ => None,
        }
    }
}

impl From<WsMessage> for TransportFrame {
    fn from(message: WsMessage) -> Self {
        match message {
            WsMessage::Text(t) => Self::Text(t),
            WsMessage::Binary(b) => Self::Binary(b),
        }
    }
}

/// Code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Inbound half of a connection.
pub type FrameStream = BoxStream<'static, SyncResult<TransportFrame>>;

/// Outbound half of a connection.
#[async_trait]
pub trait WsWriter: Send {
    async fn send_frame(&mut self, frame: TransportFrame) -> SyncResult<()>;

    /// Start a clean close.
    async fn close(&mut self) -> SyncResult<()>;
}

/// An established physical connection.
pub struct TransportConnection {
    pub writer: Box<dyn WsWriter>,
    pub reader: FrameStream,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection").finish_non_exhaustive()
    }
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> SyncResult<TransportConnection>;
}

type TungsteniteSink =
    SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, TungsteniteMessage>;

struct TungsteniteWriter {
    sink: TungsteniteSink,
}

#[async_trait]
impl WsWriter for TungsteniteWriter {
    async fn send_frame(&mut self, frame: TransportFrame) -> SyncResult<()> {
        let message = match frame {
            TransportFrame::Text(t) => TungsteniteMessage::Text(t),
            TransportFrame::Binary(b) => TungsteniteMessage::Binary(b),
            TransportFrame::Ping(p) => TungsteniteMessage::Ping(p),
            TransportFrame::Pong(p) => TungsteniteMessage::Pong(p),
            TransportFrame::Close { code, reason } => {
                TungsteniteMessage::Close(code.map(|code| CloseFrame {
                    code: code.into(),
                    reason: reason.into(),
                }))
            }
        };
        self.sink.send(message).await.map_err(SyncError::from)
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.sink.close().await.map_err(SyncError::from)
    }
}

fn from_tungstenite(message: TungsteniteMessage) -> Option<TransportFrame> {
    match message {
        TungsteniteMessage::Text(t) => Some(TransportFrame::Text(t)),
        TungsteniteMessage::Binary(b) => Some(TransportFrame::Binary(b)),
        TungsteniteMessage::Ping(p) => Some(TransportFrame::Ping(p)),
        TungsteniteMessage::Pong(p) => Some(TransportFrame::Pong(p)),
        TungsteniteMessage::Close(frame) => Some(match frame {
            Some(frame) => TransportFrame::Close {
                code: Some(u16::from(frame.code)),
                reason: frame.reason.into_owned(),
            },
            None => TransportFrame::Close {
                code: None,
                reason: String::new(),
            },
        }),
        TungsteniteMessage::Frame(_) => None,
    }
}

/// Real WebSocket connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> SyncResult<TransportConnection> {
        let (stream, response) = connect_async(url.as_str()).await?;
        debug!(url = %url, status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = stream.split();
        let reader = stream
            .filter_map(|item| async move {
                match item {
                    Ok(message) => from_tungstenite(message).map(Ok),
                    Err(err) => Some(Err(SyncError::from(err))),
                }
            })
            .boxed();

        Ok(TransportConnection {
            writer: Box::new(TungsteniteWriter { sink }),
            reader,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    use super::*;

    #[test]
    fn close_frames_keep_code_and_reason() {
        let frame = from_tungstenite(TungsteniteMessage::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: Cow::Borrowed("server restart"),
        })));
        assert_eq!(
            frame,
            Some(TransportFrame::Close {
                code: Some(1001),
                reason: "server restart".to_string(),
            })
        );

        let frame = from_tungstenite(TungsteniteMessage::Close(None));
        assert_eq!(
            frame,
            Some(TransportFrame::Close {
                code: None,
                reason: String::new(),
            })
        );
    }

    #[test]
    fn data_frames_convert_both_ways() {
        let frame = TransportFrame::from(WsMessage::text("ping"));
        assert_eq!(frame.data_len(), 4);
        assert_eq!(frame.into_message(), Some(WsMessage::text("ping")));
        assert_eq!(TransportFrame::Pong(vec![1]).into_message(), None);
        assert_eq!(TransportFrame::Pong(vec![1]).data_len(), 0);
    }
}
