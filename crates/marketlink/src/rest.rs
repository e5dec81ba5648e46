//! REST collaborator used by fallback polling and stop-gap refreshes.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{SyncError, SyncResult};

/// Source of market snapshots outside the real-time channel.
#[async_trait]
pub trait MarketDataSource: Send + Sync + 'static {
    /// `GET <base>/market/<id>/stats`
    async fn fetch_stats(&self, market_id: &str) -> SyncResult<Value>;

    /// `GET <base>/market/<id>/orderbook`
    async fn fetch_order_book(&self, market_id: &str) -> SyncResult<Value>;

    /// `GET <base>/me/positions/<id>`
    async fn fetch_positions(&self, market_id: &str) -> SyncResult<Value>;
}

/// [`MarketDataSource`] over HTTP.
#[derive(Clone, Debug)]
pub struct MarketRestClient {
    client: reqwest::Client,
    base: Url,
}

impl MarketRestClient {
    /// Client for the API rooted at `base`.
    pub fn new(base: &str, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::config(format!("Failed to build HTTP client: {e}")))?;
        Self::with_client(base, client)
    }

    pub fn with_client(base: &str, client: reqwest::Client) -> SyncResult<Self> {
        let base = Url::parse(base)
            .map_err(|e| SyncError::config(format!("Invalid REST base URL {base:?}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::config(format!(
                "Unsupported REST scheme {:?}",
                base.scheme()
            )));
        }
        if base.cannot_be_a_base() {
            return Err(SyncError::config(format!("REST base {base} cannot carry a path")));
        }
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `base` with `segments` appended to its path.
    pub fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::config("REST base cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json(&self, segments: &[&str]) -> SyncResult<Value> {
        let url = self.endpoint(segments)?;
        debug!(url = %url, "GET");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::api(status.as_u16(), body));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl MarketDataSource for MarketRestClient {
    async fn fetch_stats(&self, market_id: &str) -> SyncResult<Value> {
        self.get_json(&["market", market_id, "stats"]).await
    }

    async fn fetch_order_book(&self, market_id: &str) -> SyncResult<Value> {
        self.get_json(&["market", market_id, "orderbook"]).await
    }

    async fn fetch_positions(&self, market_id: &str) -> SyncResult<Value> {
        self.get_json(&["me", "positions", market_id]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_append_to_base_path() {
        let client =
            MarketRestClient::new("https://news.example.com/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint(&["market", "abc123", "stats"]).unwrap().as_str(),
            "https://news.example.com/api/market/abc123/stats"
        );

        let client =
            MarketRestClient::new("http://localhost:8080", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint(&["me", "positions", "abc123"]).unwrap().as_str(),
            "http://localhost:8080/me/positions/abc123"
        );
    }

    #[test]
    fn segments_are_escaped() {
        let client = MarketRestClient::new("http://localhost", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint(&["market", "a/b", "orderbook"]).unwrap().as_str(),
            "http://localhost/market/a%2Fb/orderbook"
        );
    }

    #[test]
    fn rejects_non_http_base() {
        let err = MarketRestClient::new("ws://localhost", Duration::from_secs(5)).unwrap_err();
        assert!(err.is_fatal());
    }
}
