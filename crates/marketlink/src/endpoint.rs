//! Logical endpoint identity and the `ws(s)://<host>/ws/<kind>/<id>` URL scheme.

use std::fmt;

use url::Url;

use crate::{
    error::{SyncError, SyncResult},
    protocol::Category,
};

/// Stable identity of a logical stream, e.g. `market/abc123` or `user/<publicKey>`.
///
/// Independent of the physical socket; the registry holds at most one live
/// channel per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey(String);

/// Which family of stream an [`EndpointKey`] addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    /// `market/<entityId>`
    Market,
    /// `user/<publicKey>`
    User,
    /// Anything else; no entity id is sent during negotiation.
    Other,
}

impl EndpointKey {
    /// Create a key from a raw string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Key for a market stream.
    pub fn market(entity_id: impl AsRef<str>) -> Self {
        Self(format!("market/{}", entity_id.as_ref()))
    }

    /// Key for a user stream.
    pub fn user(public_key: impl AsRef<str>) -> Self {
        Self(format!("user/{}", public_key.as_ref()))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stream family derived from the key prefix.
    pub fn kind(&self) -> EndpointKind {
        match self.0.split_once('/') {
            Some(("market", id)) if !id.is_empty() => EndpointKind::Market,
            Some(("user", id)) if !id.is_empty() => EndpointKind::User,
            _ => EndpointKind::Other,
        }
    }

    /// The market id or public key carried by the key, if any.
    pub fn entity_id(&self) -> Option<&str> {
        match self.kind() {
            EndpointKind::Market | EndpointKind::User => {
                self.0.split_once('/').map(|(_, id)| id)
            }
            EndpointKind::Other => None,
        }
    }

    /// Category assumed for legacy frames that do not declare one.
    pub fn default_category(&self) -> Category {
        match self.kind() {
            EndpointKind::Market => Category::Market,
            EndpointKind::User => Category::User,
            EndpointKind::Other => Category::System,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EndpointKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EndpointKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Build the channel URL for `key` from the page/API base URL.
///
/// The WebSocket scheme mirrors the base: `http` becomes `ws`, `https`
/// becomes `wss`. `ws`/`wss` bases are accepted as-is.
pub fn endpoint_url(base: &str, key: &EndpointKey) -> SyncResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| SyncError::config(format!("Invalid base URL {base:?}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::config(format!(
                "Unsupported scheme {other:?} for channel URL"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::config(format!("Cannot switch {base:?} to {scheme}")))?;

    let (kind, id) = match (key.kind(), key.entity_id()) {
        (EndpointKind::Market, Some(id)) => ("market", id),
        (EndpointKind::User, Some(id)) => ("user", id),
        _ => {
            return Err(SyncError::config(format!(
                "Endpoint key {key} has no channel URL"
            )));
        }
    };

    url.path_segments_mut()
        .map_err(|_| SyncError::config(format!("Base URL {base:?} cannot carry a path")))?
        .clear()
        .extend(["ws", kind, id]);
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}

/// Parse and check a channel URL. Only `ws` and `wss` are accepted.
pub fn validate_ws_url(raw: &str) -> SyncResult<Url> {
    let url =
        Url::parse(raw).map_err(|e| SyncError::config(format!("Invalid URL {raw:?}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(SyncError::config(format!(
                "Unsupported scheme {other:?}; expected ws or wss"
            )));
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(SyncError::config(format!("URL {raw:?} has no host")));
    }
    Ok(url)
}
