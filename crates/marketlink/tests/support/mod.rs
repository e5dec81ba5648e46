#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use marketlink::{
    Channel, ChannelObserver, CloseInfo, Connector, EndpointKey, Message, SyncError, SyncResult,
    TransportConnection, TransportFrame, WsWriter,
};
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};
use url::Url;

/// What the fake server does with the next connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Refuse,
    Accept,
}

/// Server side of an accepted fake connection.
#[derive(Clone)]
pub struct ServerHandle {
    frames: mpsc::UnboundedSender<SyncResult<TransportFrame>>,
    sent: Arc<Mutex<Vec<TransportFrame>>>,
}

impl ServerHandle {
    pub fn push(&self, frame: TransportFrame) {
        let _ = self.frames.send(Ok(frame));
    }

    pub fn text(&self, text: &str) {
        self.push(TransportFrame::Text(text.to_string()));
    }

    pub fn close(&self, code: u16) {
        self.push(TransportFrame::Close {
            code: Some(code),
            reason: String::new(),
        });
    }

    pub fn fail(&self, message: &str) {
        let _ = self.frames.send(Err(SyncError::websocket(message)));
    }

    /// Frames the client wrote on this connection.
    pub fn sent(&self) -> Vec<TransportFrame> {
        self.sent.lock().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|f| match f {
                TransportFrame::Text(t) => Some(t),
                _ => None,
            })
            .collect()
    }
}

struct FakeWriter {
    sent: Arc<Mutex<Vec<TransportFrame>>>,
}

#[async_trait]
impl WsWriter for FakeWriter {
    async fn send_frame(&mut self, frame: TransportFrame) -> SyncResult<()> {
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn close(&mut self) -> SyncResult<()> {
        Ok(())
    }
}

/// Connector that follows a plan and records every attempt.
pub struct ScriptedConnector {
    plan: Mutex<VecDeque<Behavior>>,
    fallback: Mutex<Behavior>,
    attempts: AtomicUsize,
    attempt_times: Mutex<Vec<Instant>>,
    sessions: Mutex<Vec<ServerHandle>>,
}

impl ScriptedConnector {
    pub fn new(plan: impl IntoIterator<Item = Behavior>, fallback: Behavior) -> Arc<Self> {
        Arc::new(Self {
            plan: Mutex::new(plan.into_iter().collect()),
            fallback: Mutex::new(fallback),
            attempts: AtomicUsize::new(0),
            attempt_times: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new([], Behavior::Accept)
    }

    pub fn refusing() -> Arc<Self> {
        Self::new([], Behavior::Refuse)
    }

    /// What every connect after the plan runs out does from now on.
    pub fn set_fallback(&self, behavior: Behavior) {
        *self.fallback.lock() = behavior;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().clone()
    }

    pub fn session(&self, index: usize) -> Option<ServerHandle> {
        self.sessions.lock().get(index).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &Url) -> SyncResult<TransportConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempt_times.lock().push(Instant::now());
        let planned = self.plan.lock().pop_front();
        let behavior = planned.unwrap_or_else(|| *self.fallback.lock());
        if behavior == Behavior::Refuse {
            return Err(SyncError::websocket("connection refused"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.sessions.lock().push(ServerHandle {
            frames: tx,
            sent: Arc::clone(&sent),
        });
        let reader = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed();
        Ok(TransportConnection {
            writer: Box::new(FakeWriter { sent }),
            reader,
        })
    }
}

/// Observer that records lifecycle events.
#[derive(Default)]
pub struct RecordingObserver {
    pub opens: Mutex<Vec<EndpointKey>>,
    pub messages: Mutex<Vec<Message>>,
    pub closes: Mutex<Vec<(CloseInfo, u32)>>,
    pub errors: Mutex<Vec<String>>,
    pub reconnects: Mutex<Vec<(u32, Duration)>>,
    pub exhausted: Mutex<Vec<EndpointKey>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn message_types(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .map(|m| m.message_type.clone())
            .collect()
    }
}

impl ChannelObserver for RecordingObserver {
    fn on_open(&self, channel: &Channel) {
        self.opens.lock().push(channel.key().clone());
    }

    fn on_message(&self, _channel: &Channel, message: &Message) {
        self.messages.lock().push(message.clone());
    }

    fn on_close(&self, channel: &Channel, info: &CloseInfo) {
        self.closes.lock().push((info.clone(), channel.retry_count()));
    }

    fn on_error(&self, _channel: &Channel, error: &SyncError) {
        self.errors.lock().push(error.to_string());
    }

    fn on_reconnect_scheduled(&self, _channel: &Channel, attempt: u32, delay: Duration) {
        self.reconnects.lock().push((attempt, delay));
    }

    fn on_retries_exhausted(&self, key: &EndpointKey) {
        self.exhausted.lock().push(key.clone());
    }
}

pub fn market_url(id: &str) -> Url {
    Url::parse(&format!("ws://localhost/ws/market/{id}")).unwrap()
}

/// Poll `condition` until it holds, sleeping between checks.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}
