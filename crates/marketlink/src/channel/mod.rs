//! One logical real-time connection for an endpoint.
//!
//! A [`Channel`] is a handle shared between the registry, callers and the
//! driver task that owns the socket. Reconnection never reuses a channel:
//! the driver builds a successor and the registry swaps it in only if the
//! old one is still current.

mod driver;
pub mod state;

use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{Notify, mpsc, watch},
    time::Instant,
};
use tracing::debug;
use ulid::Ulid;
use url::Url;

pub(crate) use self::driver::{DriverContext, run_endpoint};
pub use self::state::{ChannelEvent, ChannelState, InvalidTransition};
use crate::{
    config::SyncConfig,
    dispatcher::MessageDispatcher,
    endpoint::EndpointKey,
    error::{SyncError, SyncResult},
    heartbeat::HeartbeatMonitor,
    protocol::{FormatFlag, Message, WsMessage},
};

/// Unique identity of one channel instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(Ulid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// How a channel's transport ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    /// Normal closure, or a close requested locally.
    pub was_clean: bool,
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    pub fn clean(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            was_clean: true,
            code,
            reason: reason.into(),
        }
    }

    pub fn unclean(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            was_clean: false,
            code,
            reason: reason.into(),
        }
    }
}

/// Lifecycle callbacks bound to an endpoint through the registry.
///
/// Every hook runs inside a panic guard on the driver task.
#[allow(unused_variables)]
pub trait ChannelObserver: Send + Sync + 'static {
    /// Handshake and negotiation sequence finished.
    fn on_open(&self, channel: &Channel) {}

    /// A decoded, non-heartbeat message arrived.
    fn on_message(&self, channel: &Channel, message: &Message) {}

    /// The transport ended. Fires before any reconnect is scheduled.
    fn on_close(&self, channel: &Channel, info: &CloseInfo) {}

    /// Transport error. A close always follows.
    fn on_error(&self, channel: &Channel, error: &SyncError) {}

    /// A successor will be connected after `delay`. `attempt` is one-based.
    fn on_reconnect_scheduled(&self, channel: &Channel, attempt: u32, delay: Duration) {}

    /// The retry budget for `key` is spent; no further attempt is made.
    fn on_retries_exhausted(&self, key: &EndpointKey) {}
}

/// Observer that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl ChannelObserver for NoopObserver {}

/// A bare dispatcher observes only messages.
impl ChannelObserver for MessageDispatcher {
    fn on_message(&self, _channel: &Channel, message: &Message) {
        self.dispatch(message);
    }
}

/// Outbound work for the driver.
#[derive(Debug)]
pub(crate) enum ChannelCommand {
    Send(WsMessage),
    SendMessage(Message),
}

pub struct Channel {
    id: ChannelId,
    key: EndpointKey,
    url: Url,
    state: watch::Sender<ChannelState>,
    created_at: Instant,
    closed_at: Mutex<Option<Instant>>,
    retry_count: AtomicU32,
    heartbeat: HeartbeatMonitor,
    format: Mutex<FormatFlag>,
    connect_timeout: Duration,
    probe: bool,
    close_requested: AtomicBool,
    close_notify: Notify,
    cmd_tx: mpsc::Sender<ChannelCommand>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("retry_count", &self.retry_count())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        key: EndpointKey,
        url: Url,
        config: &SyncConfig,
        retry_count: u32,
        probe: bool,
    ) -> (Self, mpsc::Receiver<ChannelCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (state, _) = watch::channel(ChannelState::Connecting);
        let channel = Self {
            id: ChannelId::new(),
            key,
            url,
            state,
            created_at: Instant::now(),
            closed_at: Mutex::new(None),
            retry_count: AtomicU32::new(retry_count),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval, config.stale_threshold),
            format: Mutex::new(FormatFlag::Json),
            connect_timeout: config.connect_timeout,
            probe,
            close_requested: AtomicBool::new(false),
            close_notify: Notify::new(),
            cmd_tx,
        };
        (channel, cmd_rx)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn closed_at(&self) -> Option<Instant> {
        *self.closed_at.lock()
    }

    /// Unclean closes absorbed by this endpoint since it last opened.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.heartbeat.last_heartbeat_at()
    }

    /// Some `ping` or `pong` arrived within the stale threshold.
    pub fn has_recent_heartbeat(&self) -> bool {
        self.heartbeat.has_recent_heartbeat()
    }

    /// Frame format negotiated for this connection. `Json` until acknowledged.
    pub fn negotiated_format(&self) -> FormatFlag {
        *self.format.lock()
    }

    /// Created by a reconnect probe with no retry budget.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    /// Still connecting after the connect timeout.
    pub fn is_stale_connecting(&self) -> bool {
        self.state() == ChannelState::Connecting && self.created_at.elapsed() > self.connect_timeout
    }

    /// Should not be handed out: closing, closed, a dead handshake, or an
    /// open socket that stopped proving liveness.
    pub fn is_stale(&self) -> bool {
        match self.state() {
            ChannelState::Closing | ChannelState::Closed => true,
            ChannelState::Connecting => self.is_stale_connecting(),
            ChannelState::Open => self.heartbeat.is_stale(),
        }
    }

    /// Wait until the channel leaves `Connecting`.
    pub async fn wait_settled(&self) -> ChannelState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| *s != ChannelState::Connecting).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Wait until the channel reaches `Closed`.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Queue a raw frame. Frames queued while connecting go out after open.
    pub async fn send(&self, message: WsMessage) -> SyncResult<()> {
        self.enqueue(ChannelCommand::Send(message)).await
    }

    /// Queue a message, encoded with the negotiated format.
    pub async fn send_message(&self, message: Message) -> SyncResult<()> {
        self.enqueue(ChannelCommand::SendMessage(message)).await
    }

    async fn enqueue(&self, command: ChannelCommand) -> SyncResult<()> {
        if self.state().is_terminal() || self.is_close_requested() {
            return Err(SyncError::connection_closed(Some(format!(
                "channel {} is {}",
                self.key,
                self.state()
            ))));
        }
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| SyncError::connection_closed(Some("driver stopped".to_string())))
    }

    /// Request a clean close. Also cancels a pending reconnect.
    pub fn close(&self) {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.apply(ChannelEvent::CloseRequested);
        self.close_notify.notify_one();
    }

    pub(crate) async fn close_requested(&self) {
        self.close_notify.notified().await;
    }

    pub(crate) fn set_retry_count(&self, value: u32) {
        self.retry_count.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_format(&self, format: FormatFlag) {
        *self.format.lock() = format;
    }

    /// Apply a state-machine event. Invalid transitions are ignored.
    pub(crate) fn apply(&self, event: ChannelEvent) -> bool {
        let applied = self.state.send_if_modified(|state| match state.transition(event) {
            Ok(next) => {
                *state = next;
                true
            }
            Err(err) => {
                debug!(endpoint = %self.key, error = %err, "Ignoring channel event");
                false
            }
        });
        if applied && self.state() == ChannelState::Closed {
            *self.closed_at.lock() = Some(Instant::now());
        }
        applied
    }

    /// Drive the state to `Closed` from wherever it is.
    pub(crate) fn finish(&self) {
        match self.state() {
            ChannelState::Connecting => {
                self.apply(ChannelEvent::Failed);
            }
            ChannelState::Open => {
                self.apply(ChannelEvent::TransportLost);
                self.apply(ChannelEvent::Finalized);
            }
            ChannelState::Closing => {
                self.apply(ChannelEvent::Finalized);
            }
            ChannelState::Closed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (Channel, mpsc::Receiver<ChannelCommand>) {
        Channel::new(
            EndpointKey::market("abc123"),
            Url::parse("ws://localhost/ws/market/abc123").unwrap(),
            &SyncConfig::default(),
            0,
            false,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_goes_stale_after_connect_timeout() {
        let (channel, _rx) = channel();
        assert!(!channel.is_stale());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(channel.is_stale_connecting());
        assert!(channel.is_stale());
    }

    #[tokio::test]
    async fn close_moves_to_closing_then_finish_to_closed() {
        let (channel, _rx) = channel();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closing);
        assert!(channel.closed_at().is_none());

        channel.finish();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.closed_at().is_some());
        assert_eq!(channel.wait_settled().await, ChannelState::Closed);
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (channel, mut rx) = channel();
        channel.send(WsMessage::text("hello")).await.unwrap();
        assert!(matches!(rx.recv().await, Some(ChannelCommand::Send(_))));

        channel.close();
        let err = channel.send(WsMessage::text("late")).await.unwrap_err();
        assert!(matches!(err, SyncError::ConnectionClosed { .. }));
    }

    #[test]
    fn finish_from_open_passes_through_closing() {
        let (channel, _rx) = channel();
        assert!(channel.apply(ChannelEvent::Opened));
        let mut states = channel.watch_state();
        channel.finish();
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ChannelState::Closed);
        assert!(!channel.apply(ChannelEvent::Opened));
    }
}
