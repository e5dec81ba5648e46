mod support;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use marketlink::{
    ChannelState, ConnectionRegistry, EndpointKey, FeedStatus, MarketDataSource, MarketFeed, RecordingReporter,
    SyncConfig, SyncError, SyncResult, TradeExecutor, TradeRequest, TradeSide,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use support::{Behavior, ScriptedConnector, eventually};

#[derive(Default)]
struct FakeSource {
    stats_calls: AtomicUsize,
    positions_calls: AtomicUsize,
}

impl FakeSource {
    fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    fn positions_calls(&self) -> usize {
        self.positions_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataSource for FakeSource {
    async fn fetch_stats(&self, _market_id: &str) -> SyncResult<Value> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"current_price": 0.5, "volume": 100}))
    }

    async fn fetch_order_book(&self, _market_id: &str) -> SyncResult<Value> {
        Ok(json!({"bids": [[0.49, 10]], "asks": [[0.51, 12]]}))
    }

    async fn fetch_positions(&self, _market_id: &str) -> SyncResult<Value> {
        self.positions_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"yes": 3, "no": 0}))
    }
}

#[derive(Default)]
struct FakeExecutor {
    requests: Mutex<Vec<TradeRequest>>,
}

#[async_trait]
impl TradeExecutor for FakeExecutor {
    async fn execute(&self, request: &TradeRequest) -> SyncResult<Value> {
        self.requests.lock().push(request.clone());
        Ok(json!({"filled": request.amount}))
    }
}

fn registry(connector: Arc<ScriptedConnector>, config: SyncConfig) -> ConnectionRegistry {
    ConnectionRegistry::builder(config)
        .connector(connector)
        .reporter(Arc::new(RecordingReporter::new()))
        .build()
        .unwrap()
}

fn volume(feed: &MarketFeed) -> Option<i64> {
    feed.snapshot()
        .stats
        .and_then(|s| s.get("volume").and_then(Value::as_i64))
}

#[tokio::test(start_paused = true)]
async fn stats_below_price_epsilon_are_ignored() {
    let connector = ScriptedConnector::accepting();
    let source = Arc::new(FakeSource::default());
    let feed = MarketFeed::builder(
        registry(connector.clone(), SyncConfig::default()),
        source.clone(),
        "abc123",
        "ws://localhost",
    )
    .connect()
    .unwrap();

    eventually("feed live", || feed.status() == FeedStatus::Live).await;
    eventually("initial refresh", || source.stats_calls() == 1).await;
    eventually("stats loaded", || volume(&feed) == Some(100)).await;

    let server = connector.session(0).unwrap();
    server.text(r#"{"type":"market_stats","data":{"current_price":0.5005,"volume":200}}"#);
    server.text(r#"{"type":"order_book","data":{"bids":[],"asks":[]}}"#);
    eventually("order book replaced", || {
        feed.snapshot().order_book == Some(json!({"bids": [], "asks": []}))
    })
    .await;
    assert_eq!(volume(&feed), Some(100));

    server.text(r#"{"type":"market_stats","data":{"current_price":0.51,"volume":300}}"#);
    eventually("stats replaced", || volume(&feed) == Some(300)).await;
    assert_eq!(feed.snapshot().current_price(), Some(0.51));
}

#[tokio::test(start_paused = true)]
async fn trades_are_kept_newest_first() {
    let connector = ScriptedConnector::accepting();
    let feed = MarketFeed::builder(
        registry(connector.clone(), SyncConfig::default()),
        Arc::new(FakeSource::default()),
        "abc123",
        "ws://localhost",
    )
    .connect()
    .unwrap();
    eventually("feed live", || feed.status() == FeedStatus::Live).await;

    let server = connector.session(0).unwrap();
    server.text(r#"{"type":"trade","data":{"seq":1}}"#);
    server.text(r#"{"type":"trade","data":{"seq":2}}"#);
    eventually("trades recorded", || feed.snapshot().trades.len() == 2).await;

    let trades = feed.snapshot().trades;
    assert_eq!(trades[0], json!({"seq": 2}));
    assert_eq!(trades[1], json!({"seq": 1}));
}

#[tokio::test(start_paused = true)]
async fn exhausted_channel_falls_back_to_polling_then_probes_back() {
    let connector = ScriptedConnector::new([Behavior::Refuse; 6], Behavior::Accept);
    let source = Arc::new(FakeSource::default());
    let mut config = SyncConfig::default();
    config.probe_initial_probability = 1.0;
    let feed = MarketFeed::builder(
        registry(connector.clone(), config),
        source.clone(),
        "abc123",
        "ws://localhost",
    )
    .probe_seed(7)
    .connect()
    .unwrap();

    eventually("reconnecting", || {
        matches!(feed.status(), FeedStatus::Reconnecting { attempt: 1 })
    })
    .await;
    eventually("polling", || feed.status() == FeedStatus::Polling).await;
    assert!(feed.is_polling());
    assert_eq!(feed.status().to_string(), "auto-refresh");
    assert_eq!(connector.attempts(), 6);

    let calls = source.stats_calls();
    eventually("polled over REST", || source.stats_calls() > calls).await;

    eventually("live again", || feed.status() == FeedStatus::Live).await;
    assert_eq!(connector.attempts(), 7);
    assert!(!feed.is_polling());

    let channel = feed.channel().unwrap();
    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(channel.retry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn user_channel_follows_market_channel() {
    let connector = ScriptedConnector::accepting();
    let source = Arc::new(FakeSource::default());
    let feed = MarketFeed::builder(
        registry(connector.clone(), SyncConfig::default()),
        source.clone(),
        "abc123",
        "ws://localhost",
    )
    .user("pk-1")
    .connect()
    .unwrap();

    eventually("user channel opened", || connector.session_count() == 2).await;
    eventually("positions fetched", || source.positions_calls() == 1).await;

    let user = connector.session(1).unwrap();
    eventually("user handshake", || user.sent_texts().len() == 2).await;
    let init: Value = serde_json::from_str(&user.sent_texts()[1]).unwrap();
    assert_eq!(init["public_key"], "pk-1");
    assert!(init.get("news_id").is_none());

    user.text(r#"{"type":"positions_update","data":{"yes":5,"no":1}}"#);
    eventually("positions updated", || {
        feed.snapshot().positions == Some(json!({"yes": 5, "no": 1}))
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn trade_executes_then_refreshes() {
    let connector = ScriptedConnector::accepting();
    let source = Arc::new(FakeSource::default());
    let executor = Arc::new(FakeExecutor::default());
    let feed = MarketFeed::builder(
        registry(connector, SyncConfig::default()),
        source.clone(),
        "abc123",
        "ws://localhost",
    )
    .executor(executor.clone())
    .connect()
    .unwrap();
    eventually("initial refresh", || source.stats_calls() == 1).await;

    let request = TradeRequest {
        market_id: "abc123".to_string(),
        outcome: "yes".to_string(),
        side: TradeSide::Buy,
        amount: 2.5,
    };
    let receipt = feed.execute_trade(request.clone()).await.unwrap();
    assert_eq!(receipt, json!({"filled": 2.5}));
    assert_eq!(*executor.requests.lock(), vec![request]);
    assert_eq!(source.stats_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn trade_without_executor_is_rejected() {
    let feed = MarketFeed::builder(
        registry(ScriptedConnector::accepting(), SyncConfig::default()),
        Arc::new(FakeSource::default()),
        "abc123",
        "ws://localhost",
    )
    .connect()
    .unwrap();

    let err = feed
        .execute_trade(TradeRequest {
            market_id: "abc123".to_string(),
            outcome: "no".to_string(),
            side: TradeSide::Sell,
            amount: 1.0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Config { .. }));
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_channels_and_drops_handlers() {
    let connector = ScriptedConnector::accepting();
    let feed = MarketFeed::builder(
        registry(connector.clone(), SyncConfig::default()),
        Arc::new(FakeSource::default()),
        "abc123",
        "ws://localhost",
    )
    .connect()
    .unwrap();
    eventually("feed live", || feed.status() == FeedStatus::Live).await;
    let channel = feed.channel().unwrap();
    assert!(feed.dispatcher().key_count() >= 4);

    feed.shutdown();
    channel.wait_closed().await;
    assert!(feed.channel().is_none());
    assert_eq!(feed.dispatcher().key_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn feeds_on_one_market_share_the_channel() {
    let connector = ScriptedConnector::accepting();
    let registry = registry(connector.clone(), SyncConfig::default());
    let key = EndpointKey::market("abc123");
    let feed = |registry: &ConnectionRegistry| {
        MarketFeed::builder(
            registry.clone(),
            Arc::new(FakeSource::default()),
            "abc123",
            "ws://localhost",
        )
        .connect()
        .unwrap()
    };

    let a = feed(&registry);
    eventually("a live", || a.status() == FeedStatus::Live).await;
    let b = feed(&registry);
    eventually("b live", || b.status() == FeedStatus::Live).await;
    assert_eq!(connector.session_count(), 1);
    assert_eq!(registry.observer_count(&key), 2);

    let server = connector.session(0).unwrap();
    server.text(r#"{"type":"trade","data":{"seq":1}}"#);
    eventually("a got the trade", || a.snapshot().trades.len() == 1).await;
    eventually("b got the trade", || b.snapshot().trades.len() == 1).await;

    a.shutdown();
    assert_eq!(registry.observer_count(&key), 1);
    let channel = b.channel().unwrap();
    assert!(!channel.is_close_requested());

    server.text(r#"{"type":"trade","data":{"seq":2}}"#);
    eventually("b got the second trade", || b.snapshot().trades.len() == 2).await;
    assert_eq!(a.snapshot().trades.len(), 1);

    b.shutdown();
    channel.wait_closed().await;
    assert_eq!(registry.observer_count(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn refused_user_channel_falls_back_to_polling_positions() {
    let connector = ScriptedConnector::new([Behavior::Accept], Behavior::Refuse);
    let source = Arc::new(FakeSource::default());
    let mut config = SyncConfig::default();
    config.probe_initial_probability = 1.0;
    let feed = MarketFeed::builder(
        registry(connector.clone(), config),
        source.clone(),
        "abc123",
        "ws://localhost",
    )
    .user("pk-1")
    .probe_seed(7)
    .connect()
    .unwrap();

    eventually("market live", || feed.status() == FeedStatus::Live).await;
    eventually("polling positions", || feed.is_polling_positions()).await;
    assert_eq!(connector.attempts(), 7);
    assert_eq!(feed.status(), FeedStatus::Live);
    assert!(!feed.is_polling());

    let calls = source.positions_calls();
    eventually("positions polled", || source.positions_calls() > calls + 1).await;
    // A failed reconnect attempt keeps the positions poller running.
    eventually("user endpoint retried", || connector.attempts() > 7).await;
    assert!(feed.is_polling_positions());
    assert_eq!(feed.status(), FeedStatus::Live);

    connector.set_fallback(Behavior::Accept);
    eventually("user channel back", || !feed.is_polling_positions()).await;
    assert_eq!(connector.session_count(), 2);

    let user = connector.session(1).unwrap();
    user.text(r#"{"type":"positions_update","data":{"yes":5,"no":1}}"#);
    eventually("positions pushed", || {
        feed.snapshot().positions == Some(json!({"yes": 5, "no": 1}))
    })
    .await;
    assert_eq!(feed.channel().map(|c| c.state()), Some(ChannelState::Open));
}
