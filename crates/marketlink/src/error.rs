//! Error type shared by every layer of the synchronization subsystem.

use std::{string::FromUtf8Error, time::Duration};

use thiserror::Error;

/// The main result type used throughout the crate.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors produced while connecting, decoding, dispatching or polling.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Structurally invalid configuration (bad URL, unsupported scheme, zero intervals).
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transport-level WebSocket failure.
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// The peer or the driver task went away.
    #[error("Connection closed: {}", reason.as_deref().unwrap_or("no reason given"))]
    ConnectionClosed { reason: Option<String> },

    /// A frame could not be turned into a [`Message`](crate::protocol::Message).
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// REST request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success REST response
    #[error("API error: status={status}, body={body}")]
    Api { status: u16, body: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// A subscriber callback failed.
    #[error("Handler error: {message}")]
    Handler { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<FromUtf8Error> for SyncError {
    fn from(e: FromUtf8Error) -> Self {
        Self::Decode {
            message: e.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket {
            message: e.to_string(),
        }
    }
}

impl SyncError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a connection-closed error.
    pub fn connection_closed(reason: Option<String>) -> Self {
        Self::ConnectionClosed { reason }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an API error.
    pub fn api(status: u16, body: impl Into<String>) -> Self {
        Self::Api {
            status,
            body: body.into(),
        }
    }

    /// Errors that can never succeed on retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = SyncError::config("Invalid URL");
        assert!(matches!(err, SyncError::Config { .. }));
        assert!(err.is_fatal());

        let err = SyncError::timeout(Duration::from_secs(5));
        assert!(matches!(err, SyncError::Timeout { .. }));
        assert!(!err.is_fatal());

        let err = SyncError::websocket("reset by peer");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_connection_closed_display() {
        let err = SyncError::connection_closed(None);
        assert_eq!(err.to_string(), "Connection closed: no reason given");

        let err = SyncError::connection_closed(Some("going away".to_string()));
        assert_eq!(err.to_string(), "Connection closed: going away");
    }

    #[test]
    fn test_utf8_error_maps_to_decode() {
        let err: SyncError = String::from_utf8(vec![0xff, 0xfe]).unwrap_err().into();
        assert!(matches!(err, SyncError::Decode { .. }));
    }
}
