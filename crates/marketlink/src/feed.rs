//! Market feed: live channel first, REST polling when the channel gives up.
//!
//! A [`MarketFeed`] owns the subscriptions for one market, keeps a
//! [`MarketSnapshot`] current from either source and publishes a
//! [`FeedStatus`] for the UI. Channels still belong to the registry; the
//! feed only references them by key.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    channel::{Channel, ChannelObserver, ChannelState, CloseInfo},
    dispatcher::{Disposer, MessageDispatcher},
    endpoint::{EndpointKey, endpoint_url},
    error::{SyncError, SyncResult},
    poller::{FallbackPoller, FetchFn, ReconnectProbe, RefreshDecision, RefreshThrottle},
    protocol::Message,
    registry::ConnectionRegistry,
    report::{ErrorContext, ErrorKind, ErrorReporter},
    rest::MarketDataSource,
};

/// Price moves smaller than this do not count as a stats change.
pub const PRICE_EPSILON: f64 = 0.001;

/// Recent trades kept in a snapshot.
pub const MAX_RECENT_TRADES: usize = 50;

/// Connection status shown to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedStatus {
    Connecting,
    Live,
    /// Waiting to reconnect. `attempt` is one-based.
    Reconnecting { attempt: u32 },
    /// Channel abandoned; data refreshes over REST.
    Polling,
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Live => f.write_str("live"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Polling => f.write_str("auto-refresh"),
        }
    }
}

/// Latest known state of one market.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MarketSnapshot {
    pub stats: Option<Value>,
    pub order_book: Option<Value>,
    /// Newest first.
    pub trades: VecDeque<Value>,
    pub positions: Option<Value>,
}

impl MarketSnapshot {
    pub fn current_price(&self) -> Option<f64> {
        self.stats.as_ref().and_then(current_price)
    }

    /// Replace the stats unless the price moved by less than [`PRICE_EPSILON`].
    ///
    /// Returns whether the snapshot changed.
    pub fn apply_market_stats(&mut self, stats: Value) -> bool {
        if let (Some(old), Some(new)) = (self.current_price(), current_price(&stats))
            && (old - new).abs() < PRICE_EPSILON
        {
            return false;
        }
        self.stats = Some(stats);
        true
    }

    pub fn push_trade(&mut self, trade: Value) {
        self.trades.push_front(trade);
        self.trades.truncate(MAX_RECENT_TRADES);
    }
}

fn current_price(stats: &Value) -> Option<f64> {
    match stats.get("current_price")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A user-initiated trade.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub market_id: String,
    pub outcome: String,
    pub side: TradeSide,
    pub amount: f64,
}

/// Executes trades. Share accounting and balance checks live behind this.
#[async_trait]
pub trait TradeExecutor: Send + Sync + 'static {
    async fn execute(&self, request: &TradeRequest) -> SyncResult<Value>;
}

struct FeedInner {
    market_id: String,
    market_key: EndpointKey,
    market_url: Url,
    user: Option<(EndpointKey, Url)>,
    registry: ConnectionRegistry,
    /// The one observer this feed binds to every endpoint it follows.
    observer: Arc<dyn ChannelObserver>,
    dispatcher: MessageDispatcher,
    poller: FallbackPoller,
    /// Positions over REST while the user channel is out of retries.
    user_poller: FallbackPoller,
    throttle: RefreshThrottle,
    source: Arc<dyn MarketDataSource>,
    executor: Option<Arc<dyn TradeExecutor>>,
    reporter: Arc<dyn ErrorReporter>,
    snapshot: watch::Sender<MarketSnapshot>,
    status: watch::Sender<FeedStatus>,
    disposers: Mutex<Vec<Disposer>>,
}

impl FeedInner {
    fn observer(&self) -> Arc<dyn ChannelObserver> {
        Arc::clone(&self.observer)
    }

    fn user_key(&self) -> Option<&EndpointKey> {
        self.user.as_ref().map(|(key, _)| key)
    }

    fn set_status(&self, status: FeedStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!(market = %self.market_id, %status, "Feed status changed");
            *current = status;
            true
        });
    }

    fn fetch_fn(self: &Arc<Self>) -> FetchFn {
        let feed = Arc::downgrade(self);
        Arc::new(move || {
            let feed = feed.clone();
            async move {
                match feed.upgrade() {
                    Some(feed) => feed.fetch_all().await,
                    None => Ok(()),
                }
            }
            .boxed()
        })
    }

    fn positions_fn(self: &Arc<Self>) -> FetchFn {
        let feed = Arc::downgrade(self);
        Arc::new(move || {
            let feed = feed.clone();
            async move {
                match feed.upgrade() {
                    Some(feed) => feed.fetch_positions().await,
                    None => Ok(()),
                }
            }
            .boxed()
        })
    }

    fn probe_fn(self: &Arc<Self>, key: EndpointKey, url: Url) -> ReconnectProbe {
        let feed = Arc::downgrade(self);
        Arc::new(move || {
            let feed = feed.clone();
            let key = key.clone();
            let url = url.clone();
            async move {
                let Some(feed) = feed.upgrade() else {
                    return false;
                };
                match feed.registry.probe(key, &url, feed.observer()) {
                    Ok(channel) => channel.wait_settled().await == ChannelState::Open,
                    Err(err) => {
                        warn!(error = %err, "Reconnect probe could not start");
                        false
                    }
                }
            }
            .boxed()
        })
    }

    /// Pull stats, order book and (with a user channel) positions over REST.
    async fn fetch_all(&self) -> SyncResult<()> {
        let stats = self.source.fetch_stats(&self.market_id).await?;
        let order_book = self.source.fetch_order_book(&self.market_id).await?;
        let positions = match self.user {
            Some(_) => Some(self.source.fetch_positions(&self.market_id).await?),
            None => None,
        };
        self.snapshot.send_if_modified(|snapshot| {
            let mut changed = snapshot.apply_market_stats(stats);
            if snapshot.order_book.as_ref() != Some(&order_book) {
                snapshot.order_book = Some(order_book);
                changed = true;
            }
            if positions.is_some() && snapshot.positions != positions {
                snapshot.positions = positions;
                changed = true;
            }
            changed
        });
        self.throttle.mark_fetched();
        debug!(market = %self.market_id, "REST refresh complete");
        Ok(())
    }

    /// Positions only, for while the user channel is down.
    async fn fetch_positions(&self) -> SyncResult<()> {
        if self.user.is_none() {
            return Ok(());
        }
        let positions = self.source.fetch_positions(&self.market_id).await?;
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.positions.as_ref() == Some(&positions) {
                return false;
            }
            snapshot.positions = Some(positions);
            true
        });
        Ok(())
    }

    /// Bind to the user channel, joining it if another feed already has it.
    fn ensure_user_channel(&self) {
        let Some((key, url)) = &self.user else {
            return;
        };
        if self.user_poller.is_polling() {
            return;
        }
        if let Err(err) = self.registry.get_or_create(key.clone(), url, self.observer()) {
            warn!(endpoint = %key, error = %err, "User channel not started");
        }
    }

    fn register_handlers(self: &Arc<Self>) {
        let mut disposers = self.disposers.lock();

        let feed = Arc::downgrade(self);
        disposers.push(self.dispatcher.on("market_stats", move |message| {
            with_feed(&feed, |feed| {
                let stats = object_payload(message)?;
                feed.snapshot
                    .send_if_modified(|snapshot| snapshot.apply_market_stats(stats));
                Ok(())
            })
        }));

        let feed = Arc::downgrade(self);
        disposers.push(self.dispatcher.on("order_book", move |message| {
            with_feed(&feed, |feed| {
                let book = object_payload(message)?;
                feed.snapshot.send_modify(|snapshot| snapshot.order_book = Some(book));
                Ok(())
            })
        }));

        let feed = Arc::downgrade(self);
        disposers.push(self.dispatcher.on("trade", move |message| {
            with_feed(&feed, |feed| {
                feed.snapshot
                    .send_modify(|snapshot| snapshot.push_trade(message.payload.clone()));
                feed.throttle.request(feed.fetch_fn());
                Ok(())
            })
        }));

        let feed = Arc::downgrade(self);
        disposers.push(self.dispatcher.on("positions_update", move |message| {
            with_feed(&feed, |feed| {
                let positions = message.payload.clone();
                feed.snapshot
                    .send_modify(|snapshot| snapshot.positions = Some(positions));
                Ok(())
            })
        }));
    }
}

fn with_feed(
    feed: &Weak<FeedInner>,
    f: impl FnOnce(&Arc<FeedInner>) -> SyncResult<()>,
) -> SyncResult<()> {
    match feed.upgrade() {
        Some(feed) => f(&feed),
        None => Ok(()),
    }
}

fn object_payload(message: &Message) -> SyncResult<Value> {
    if message.payload.is_object() {
        Ok(message.payload.clone())
    } else {
        Err(SyncError::handler(format!(
            "{} payload is not an object",
            message.message_type
        )))
    }
}

/// Channel callbacks for a feed. Holds the feed weakly so channels never
/// keep a dropped feed alive.
struct FeedObserver {
    feed: Weak<FeedInner>,
}

impl ChannelObserver for FeedObserver {
    fn on_open(&self, channel: &Channel) {
        let Some(feed) = self.feed.upgrade() else {
            return;
        };
        if channel.key() == &feed.market_key {
            feed.poller.stop();
            feed.set_status(FeedStatus::Live);
            feed.ensure_user_channel();
        } else if feed.user_key() == Some(channel.key()) && feed.user_poller.stop() {
            info!(endpoint = %channel.key(), "User channel back, positions polling stopped");
        }
    }

    fn on_message(&self, _channel: &Channel, message: &Message) {
        if let Some(feed) = self.feed.upgrade() {
            feed.dispatcher.dispatch(message);
        }
    }

    fn on_close(&self, channel: &Channel, info: &CloseInfo) {
        debug!(endpoint = %channel.key(), clean = info.was_clean, "Feed channel closed");
    }

    fn on_error(&self, channel: &Channel, error: &SyncError) {
        let Some(feed) = self.feed.upgrade() else {
            return;
        };
        debug!(endpoint = %channel.key(), error = %error, "Channel error, refreshing over REST");
        feed.throttle.request(feed.fetch_fn());
    }

    fn on_reconnect_scheduled(&self, channel: &Channel, attempt: u32, _delay: Duration) {
        if let Some(feed) = self.feed.upgrade()
            && channel.key() == &feed.market_key
        {
            feed.set_status(FeedStatus::Reconnecting { attempt });
        }
    }

    fn on_retries_exhausted(&self, key: &EndpointKey) {
        let Some(feed) = self.feed.upgrade() else {
            return;
        };
        if key == &feed.market_key {
            feed.set_status(FeedStatus::Polling);
            let interval = feed.poller.default_interval();
            let probe = feed.probe_fn(feed.market_key.clone(), feed.market_url.clone());
            feed.poller.start_with_probe(feed.fetch_fn(), interval, probe);
        } else if let Some((user_key, user_url)) = &feed.user
            && user_key == key
        {
            let interval = feed.user_poller.default_interval();
            let probe = feed.probe_fn(user_key.clone(), user_url.clone());
            if feed
                .user_poller
                .start_with_probe(feed.positions_fn(), interval, probe)
            {
                info!(endpoint = %key, "User channel out of retries, polling positions");
            }
        }
    }
}

/// Builder for [`MarketFeed`].
pub struct MarketFeedBuilder {
    registry: ConnectionRegistry,
    source: Arc<dyn MarketDataSource>,
    market_id: String,
    ws_base: String,
    user_public_key: Option<String>,
    executor: Option<Arc<dyn TradeExecutor>>,
    probe_seed: Option<u64>,
}

impl MarketFeedBuilder {
    /// Also follow `user/<public_key>` for position updates.
    #[must_use]
    pub fn user(mut self, public_key: impl Into<String>) -> Self {
        self.user_public_key = Some(public_key.into());
        self
    }

    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn TradeExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Seed the reconnect-probe dice.
    #[must_use]
    pub fn probe_seed(mut self, seed: u64) -> Self {
        self.probe_seed = Some(seed);
        self
    }

    /// Register handlers, open the market channel and schedule an initial
    /// REST load. Must be called from within a Tokio runtime.
    pub fn connect(self) -> SyncResult<MarketFeed> {
        let market_key = EndpointKey::market(&self.market_id);
        let market_url = endpoint_url(&self.ws_base, &market_key)?;
        let user = match &self.user_public_key {
            Some(pk) => {
                let key = EndpointKey::user(pk);
                let url = endpoint_url(&self.ws_base, &key)?;
                Some((key, url))
            }
            None => None,
        };

        let config = self.registry.config().clone();
        let reporter = self.registry.reporter();
        let mut poller = FallbackPoller::with_reporter(&config, Arc::clone(&reporter));
        let mut user_poller = FallbackPoller::with_reporter(&config, Arc::clone(&reporter));
        if let Some(seed) = self.probe_seed {
            poller = poller.with_seed(seed);
            user_poller = user_poller.with_seed(seed.wrapping_add(1));
        }
        let (snapshot, _) = watch::channel(MarketSnapshot::default());
        let (status, _) = watch::channel(FeedStatus::Connecting);

        let inner = Arc::new_cyclic(|feed| FeedInner {
            market_id: self.market_id,
            market_key,
            market_url,
            user,
            observer: Arc::new(FeedObserver { feed: feed.clone() }),
            dispatcher: MessageDispatcher::with_reporter(Arc::clone(&reporter)),
            throttle: RefreshThrottle::from_config(&config, Arc::clone(&reporter)),
            poller,
            user_poller,
            registry: self.registry,
            source: self.source,
            executor: self.executor,
            reporter,
            snapshot,
            status,
            disposers: Mutex::new(Vec::new()),
        });

        inner.register_handlers();
        inner.registry.get_or_create(
            inner.market_key.clone(),
            &inner.market_url,
            inner.observer(),
        )?;
        inner.throttle.request(inner.fetch_fn());

        Ok(MarketFeed { inner })
    }
}

/// Live view of one market.
#[derive(Clone)]
pub struct MarketFeed {
    inner: Arc<FeedInner>,
}

impl fmt::Debug for MarketFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketFeed")
            .field("market_id", &self.inner.market_id)
            .field("status", &self.status())
            .finish()
    }
}

impl MarketFeed {
    pub fn builder(
        registry: ConnectionRegistry,
        source: Arc<dyn MarketDataSource>,
        market_id: impl Into<String>,
        ws_base: impl Into<String>,
    ) -> MarketFeedBuilder {
        MarketFeedBuilder {
            registry,
            source,
            market_id: market_id.into(),
            ws_base: ws_base.into(),
            user_public_key: None,
            executor: None,
            probe_seed: None,
        }
    }

    pub fn market_id(&self) -> &str {
        &self.inner.market_id
    }

    pub fn market_key(&self) -> &EndpointKey {
        &self.inner.market_key
    }

    /// Subscribers for this feed's messages. Extra handlers may be added.
    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.inner.dispatcher
    }

    pub fn status(&self) -> FeedStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<FeedStatus> {
        self.inner.status.subscribe()
    }

    pub fn snapshot(&self) -> MarketSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Notified on every effective snapshot change.
    pub fn subscribe_snapshot(&self) -> watch::Receiver<MarketSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.poller.is_polling()
    }

    /// Positions are refreshed over REST because the user channel gave up.
    pub fn is_polling_positions(&self) -> bool {
        self.inner.user_poller.is_polling()
    }

    /// The current market channel, when live.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.inner.registry.get(&self.inner.market_key)
    }

    /// Ask for a REST refresh, throttled and debounced.
    pub fn refresh_now(&self) -> RefreshDecision {
        self.inner.throttle.request(self.inner.fetch_fn())
    }

    /// Execute a trade, then refresh stats and positions.
    ///
    /// Failures are returned to the caller.
    pub async fn execute_trade(&self, request: TradeRequest) -> SyncResult<Value> {
        let executor = self
            .inner
            .executor
            .as_ref()
            .ok_or_else(|| SyncError::config("No trade executor configured"))?;
        let receipt = executor.execute(&request).await?;
        info!(market = %request.market_id, side = ?request.side, amount = request.amount, "Trade executed");
        if let Err(err) = self.inner.fetch_all().await {
            self.inner.reporter.report(
                ErrorKind::Fetch,
                &ErrorContext::for_endpoint(
                    &self.inner.market_key,
                    format!("post-trade refresh failed: {err}"),
                ),
            );
        }
        Ok(receipt)
    }

    /// Stop polling, unbind from this feed's endpoints and drop its handlers.
    ///
    /// A channel is closed only when no other feed still observes it.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.poller.stop();
        inner.user_poller.stop();
        inner.registry.release(&inner.market_key, &inner.observer);
        if let Some(key) = inner.user_key() {
            inner.registry.release(key, &inner.observer);
        }
        inner.disposers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn stats_diffing_ignores_sub_epsilon_moves() {
        let mut snapshot = MarketSnapshot::default();
        assert!(snapshot.apply_market_stats(json!({"current_price": 0.5, "volume": 10})));
        assert!(!snapshot.apply_market_stats(json!({"current_price": 0.5005, "volume": 11})));
        assert_eq!(snapshot.stats.as_ref().unwrap()["volume"], 10);

        assert!(snapshot.apply_market_stats(json!({"current_price": 0.502})));
        assert_eq!(snapshot.current_price(), Some(0.502));
    }

    #[test]
    fn stats_without_price_always_apply() {
        let mut snapshot = MarketSnapshot::default();
        assert!(snapshot.apply_market_stats(json!({"current_price": "0.25"})));
        assert_eq!(snapshot.current_price(), Some(0.25));
        assert!(snapshot.apply_market_stats(json!({"volume": 3})));
        assert_eq!(snapshot.current_price(), None);
    }

    #[test]
    fn trades_are_bounded_newest_first() {
        let mut snapshot = MarketSnapshot::default();
        for i in 0..60 {
            snapshot.push_trade(json!({"seq": i}));
        }
        assert_eq!(snapshot.trades.len(), MAX_RECENT_TRADES);
        assert_eq!(snapshot.trades[0]["seq"], 59);
        assert_eq!(snapshot.trades[MAX_RECENT_TRADES - 1]["seq"], 10);
    }

    #[test]
    fn status_labels() {
        assert_eq!(FeedStatus::Polling.to_string(), "auto-refresh");
        assert_eq!(
            FeedStatus::Reconnecting { attempt: 2 }.to_string(),
            "reconnecting (attempt 2)"
        );
    }

    #[test]
    fn trade_request_wire_shape() {
        let request = TradeRequest {
            market_id: "abc123".to_string(),
            outcome: "yes".to_string(),
            side: TradeSide::Buy,
            amount: 12.5,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["side"], "buy");
        assert_eq!(value["amount"], 12.5);
    }
}
