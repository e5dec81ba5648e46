//! # marketlink
//!
//! Real-time market data synchronization over WebSocket channels with REST
//! fallback.
//!
//! ## Features
//!
//! - **Deduplicated channels**: one live channel per endpoint key, owned by
//!   an explicit [`ConnectionRegistry`]
//! - **Protocol negotiation**: MessagePack or JSON frames, optionally
//!   compressed, behind a one-byte format flag
//! - **Reconnection**: exponential backoff with a bounded retry budget
//! - **Liveness**: heartbeat pings and staleness detection
//! - **Fallback polling**: periodic REST refresh with randomized reconnect probes
//! - **Structured failure reporting**: every recoverable error is classified
//!   and sent to an injected [`ErrorReporter`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use marketlink::{ConnectionRegistry, MarketFeed, MarketRestClient, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ConnectionRegistry::new(SyncConfig::default())?;
//!     let rest = MarketRestClient::new("https://news.example.com/api", Duration::from_secs(10))?;
//!
//!     let feed = MarketFeed::builder(registry, Arc::new(rest), "abc123", "https://news.example.com")
//!         .connect()?;
//!
//!     let mut status = feed.subscribe_status();
//!     while status.changed().await.is_ok() {
//!         println!("status: {}", *status.borrow());
//!     }
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod feed;
pub mod heartbeat;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod rest;
pub mod transport;

pub use backoff::BackoffConfig;
pub use channel::{
    Channel, ChannelId, ChannelObserver, ChannelState, CloseInfo, NoopObserver,
};
pub use config::SyncConfig;
pub use dispatcher::{DispatchKey, Disposer, MessageDispatcher};
pub use endpoint::{EndpointKey, EndpointKind, endpoint_url};
pub use error::{SyncError, SyncResult};
pub use feed::{
    FeedStatus, MarketFeed, MarketFeedBuilder, MarketSnapshot, TradeExecutor, TradeRequest,
    TradeSide,
};
pub use heartbeat::HeartbeatMonitor;
pub use poller::{FallbackPoller, FetchFn, ReconnectProbe, RefreshDecision, RefreshThrottle};
pub use protocol::{Category, FormatFlag, Message, ProtocolCodec, WsMessage, is_heartbeat};
pub use registry::{ConnectionRegistry, RegistryBuilder};
pub use report::{ErrorContext, ErrorKind, ErrorReporter, RecordingReporter, TracingReporter};
pub use rest::{MarketDataSource, MarketRestClient};
pub use transport::{Connector, TransportConnection, TransportFrame, TungsteniteConnector, WsWriter};
