//! Per-endpoint driver task.
//!
//! One task owns the socket of the current channel for an endpoint. When
//! the socket closes uncleanly and the retry budget allows, the task sleeps
//! for the backoff delay and then asks the registry to swap in a successor.
//! The swap is refused when the registry no longer holds the closed channel,
//! which is how a superseded reconnect becomes a no-op.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Weak},
};

use futures_util::StreamExt;
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use super::{Channel, ChannelCommand, ChannelEvent, ChannelObserver, CloseInfo};
use crate::{
    config::SyncConfig,
    dispatcher::panic_message,
    endpoint::{EndpointKey, EndpointKind},
    error::{SyncError, SyncResult},
    protocol::{
        ProtocolAck, ProtocolCodec, WsMessage, is_heartbeat,
        types::Category,
    },
    registry::{ObserverSet, RegistryInner},
    report::{ErrorContext, ErrorKind, ErrorReporter},
    transport::{CLOSE_NORMAL, Connector, FrameStream, TransportFrame, WsWriter},
};

/// Everything a driver needs besides its channel.
#[derive(Clone)]
pub(crate) struct DriverContext {
    pub registry: Weak<RegistryInner>,
    pub config: Arc<SyncConfig>,
    pub connector: Arc<dyn Connector>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub codec: ProtocolCodec,
}

impl DriverContext {
    fn report(&self, kind: ErrorKind, key: &EndpointKey, message: impl Into<String>) {
        self.reporter
            .report(kind, &ErrorContext::for_endpoint(key, message));
    }

    /// Run an observer hook, reporting a panic instead of unwinding.
    fn guard(&self, key: &EndpointKey, hook: &str, f: impl FnOnce()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
            self.report(
                ErrorKind::Handler,
                key,
                format!("{hook} observer panicked: {}", panic_message(panic.as_ref())),
            );
        }
    }

    /// Run `hook` on every bound observer, each under its own guard.
    fn notify(
        &self,
        key: &EndpointKey,
        hook: &str,
        observers: &ObserverSet,
        f: impl Fn(&dyn ChannelObserver),
    ) {
        for observer in observers.snapshot() {
            self.guard(key, hook, || f(observer.as_ref()));
        }
    }
}

/// How one channel's run ended.
struct Outcome {
    info: CloseInfo,
    /// Closed by a local request.
    requested: bool,
    /// The failure can never succeed on retry.
    fatal: bool,
}

impl Outcome {
    fn requested() -> Self {
        Self {
            info: CloseInfo::clean(Some(CLOSE_NORMAL), "closed by client"),
            requested: true,
            fatal: false,
        }
    }

    fn lost(reason: impl Into<String>) -> Self {
        Self {
            info: CloseInfo::unclean(None, reason),
            requested: false,
            fatal: false,
        }
    }
}

/// Drive `channel` and its successors until the endpoint is closed,
/// superseded, or out of retries.
pub(crate) async fn run_endpoint(
    ctx: DriverContext,
    channel: Arc<Channel>,
    cmd_rx: mpsc::Receiver<ChannelCommand>,
    observers: Arc<ObserverSet>,
) {
    let backoff = ctx.config.backoff();
    let key = channel.key().clone();
    let codec = ctx.codec.clone().with_default_category(key.default_category());
    let mut current = (channel, cmd_rx);

    loop {
        let (channel, mut cmd_rx) = current;
        let outcome = run_channel(&ctx, &codec, &channel, &mut cmd_rx, &observers).await;
        channel.finish();

        info!(
            endpoint = %key,
            channel = %channel.id(),
            clean = outcome.info.was_clean,
            code = ?outcome.info.code,
            reason = %outcome.info.reason,
            "Channel closed"
        );
        ctx.notify(&key, "on_close", &observers, |o| o.on_close(&channel, &outcome.info));

        if outcome.requested || outcome.info.was_clean || channel.is_close_requested() {
            schedule_gc(&ctx, &channel);
            return;
        }

        if outcome.fatal {
            ctx.report(ErrorKind::FatalConfig, &key, outcome.info.reason.clone());
            schedule_gc(&ctx, &channel);
            return;
        }

        ctx.report(
            ErrorKind::TransientTransport,
            &key,
            format!("unclean close: {}", outcome.info.reason),
        );

        let retry_count = channel.retry_count();
        if !backoff.can_retry(retry_count) {
            if channel.is_probe() {
                debug!(endpoint = %key, "Reconnect probe failed");
            } else {
                ctx.report(
                    ErrorKind::ExhaustedRetries,
                    &key,
                    format!("giving up after {retry_count} retries"),
                );
            }
            ctx.notify(&key, "on_retries_exhausted", &observers, |o| {
                o.on_retries_exhausted(&key)
            });
            schedule_gc(&ctx, &channel);
            return;
        }

        let delay = backoff.delay_for(retry_count);
        let next_retry = retry_count.saturating_add(1);
        channel.set_retry_count(next_retry);
        info!(
            endpoint = %key,
            attempt = next_retry,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        ctx.notify(&key, "on_reconnect_scheduled", &observers, |o| {
            o.on_reconnect_scheduled(&channel, next_retry, delay)
        });

        tokio::select! {
            biased;
            _ = channel.close_requested() => {
                debug!(endpoint = %key, "Reconnect cancelled by close");
                schedule_gc(&ctx, &channel);
                return;
            }
            _ = sleep(delay) => {}
        }

        let Some(registry) = ctx.registry.upgrade() else {
            return;
        };
        match registry.replace_if_current(&channel, next_retry) {
            Some(successor) => current = successor,
            None => {
                debug!(
                    endpoint = %key,
                    channel = %channel.id(),
                    "Channel superseded, dropping scheduled reconnect"
                );
                return;
            }
        }
    }
}

fn schedule_gc(ctx: &DriverContext, channel: &Arc<Channel>) {
    let registry = ctx.registry.clone();
    let grace = ctx.config.gc_grace;
    let id = channel.id();
    let key = channel.key().clone();
    tokio::spawn(async move {
        sleep(grace).await;
        if let Some(registry) = registry.upgrade() {
            registry.remove_closed(&key, id);
        }
    });
}

async fn run_channel(
    ctx: &DriverContext,
    codec: &ProtocolCodec,
    channel: &Channel,
    cmd_rx: &mut mpsc::Receiver<ChannelCommand>,
    observers: &ObserverSet,
) -> Outcome {
    let key = channel.key();
    let connect_timeout = ctx.config.connect_timeout;

    let connected = tokio::select! {
        biased;
        _ = channel.close_requested() => return Outcome::requested(),
        result = timeout(connect_timeout, ctx.connector.connect(channel.url())) => {
            result.unwrap_or_else(|_| Err(SyncError::timeout(connect_timeout)))
        }
    };
    let connection = match connected {
        Ok(connection) => connection,
        Err(err) => {
            warn!(endpoint = %key, error = %err, "Connect failed");
            ctx.notify(key, "on_error", observers, |o| o.on_error(channel, &err));
            let mut outcome = Outcome::lost(err.to_string());
            outcome.fatal = err.is_fatal();
            return outcome;
        }
    };
    let mut writer = connection.writer;
    let mut reader = connection.reader;

    if let Err(err) = handshake(ctx, codec, channel, writer.as_mut()).await {
        if channel.is_close_requested() {
            let _ = writer.close().await;
            return Outcome::requested();
        }
        ctx.notify(key, "on_error", observers, |o| o.on_error(channel, &err));
        return Outcome::lost(err.to_string());
    }

    channel.apply(ChannelEvent::Opened);
    channel.set_retry_count(0);
    channel.heartbeat().attach();
    info!(endpoint = %key, channel = %channel.id(), "Channel open");
    ctx.notify(key, "on_open", observers, |o| o.on_open(channel));

    let outcome = session(ctx, codec, channel, cmd_rx, observers, writer.as_mut(), &mut reader).await;
    if outcome.requested {
        let _ = writer.close().await;
    }
    outcome
}

/// Liveness probe, then the negotiation message.
///
/// Completing the sequence opens the channel whether or not the peer ever
/// acknowledges negotiation.
async fn handshake(
    ctx: &DriverContext,
    codec: &ProtocolCodec,
    channel: &Channel,
    writer: &mut dyn WsWriter,
) -> SyncResult<()> {
    writer.send_frame(TransportFrame::Text("ping".to_string())).await?;

    tokio::select! {
        biased;
        _ = channel.close_requested() => {
            return Err(SyncError::connection_closed(Some("closed during handshake".to_string())));
        }
        _ = sleep(ctx.config.init_delay) => {}
    }

    let key = channel.key();
    let (news_id, public_key) = match key.kind() {
        EndpointKind::Market => (key.entity_id(), None),
        EndpointKind::User => (None, key.entity_id()),
        EndpointKind::Other => (None, None),
    };
    match codec.encode_protocol_init(news_id, public_key) {
        Ok(init) => writer.send_frame(init.into()).await?,
        Err(err) => {
            ctx.report(
                ErrorKind::Negotiation,
                key,
                format!("protocol init not sent: {err}"),
            );
        }
    }
    Ok(())
}

async fn session(
    ctx: &DriverContext,
    codec: &ProtocolCodec,
    channel: &Channel,
    cmd_rx: &mut mpsc::Receiver<ChannelCommand>,
    observers: &ObserverSet,
    writer: &mut dyn WsWriter,
    reader: &mut FrameStream,
) -> Outcome {
    let key = channel.key();
    let mut ticker = channel.heartbeat().ticker();

    loop {
        tokio::select! {
            biased;
            _ = channel.close_requested() => return Outcome::requested(),
            cmd = cmd_rx.recv() => {
                let frame = match cmd {
                    Some(ChannelCommand::Send(message)) => message,
                    Some(ChannelCommand::SendMessage(message)) => {
                        match codec.encode(&message, channel.negotiated_format()) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(endpoint = %key, error = %err, "Failed to encode outbound message");
                                continue;
                            }
                        }
                    }
                    None => return Outcome::requested(),
                };
                if let Err(err) = writer.send_frame(frame.into()).await {
                    ctx.notify(key, "on_error", observers, |o| o.on_error(channel, &err));
                    return Outcome::lost(err.to_string());
                }
            }
            frame = reader.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        if let Some(outcome) =
                            handle_frame(ctx, codec, channel, observers, writer, frame).await
                        {
                            return outcome;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(endpoint = %key, error = %err, "WebSocket read error");
                        ctx.notify(key, "on_error", observers, |o| o.on_error(channel, &err));
                        return Outcome::lost(err.to_string());
                    }
                    None => return Outcome::lost("stream ended without close frame"),
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = writer.send_frame(channel.heartbeat().ping_frame().into()).await {
                    ctx.notify(key, "on_error", observers, |o| o.on_error(channel, &err));
                    return Outcome::lost(err.to_string());
                }
            }
        }
    }
}

async fn handle_frame(
    ctx: &DriverContext,
    codec: &ProtocolCodec,
    channel: &Channel,
    observers: &ObserverSet,
    writer: &mut dyn WsWriter,
    frame: TransportFrame,
) -> Option<Outcome> {
    let key = channel.key();
    match frame {
        TransportFrame::Ping(payload) => {
            channel.heartbeat().record();
            let _ = writer.send_frame(TransportFrame::Pong(payload)).await;
            None
        }
        TransportFrame::Pong(_) => {
            channel.heartbeat().record();
            None
        }
        TransportFrame::Close { code, reason } => {
            let info = if code == Some(CLOSE_NORMAL) {
                CloseInfo::clean(code, reason)
            } else {
                CloseInfo::unclean(code, reason)
            };
            Some(Outcome {
                info,
                requested: false,
                fatal: false,
            })
        }
        data => {
            let size = data.data_len();
            if size > ctx.config.max_message_size {
                ctx.report(
                    ErrorKind::ProtocolDecode,
                    key,
                    format!(
                        "dropping {size} byte frame, limit is {}",
                        ctx.config.max_message_size
                    ),
                );
                return None;
            }
            let raw = data.into_message()?;
            let message = match codec.decode_frame(&raw) {
                Ok(message) => message,
                Err(err) => {
                    ctx.report(
                        ErrorKind::ProtocolDecode,
                        key,
                        format!("dropping frame: {err}"),
                    );
                    return None;
                }
            };

            if is_heartbeat(&message) {
                channel.heartbeat().record();
                if message.message_type == "ping" {
                    let _ = writer.send_frame(WsMessage::text("pong").into()).await;
                }
                return None;
            }

            if message.category == Category::System {
                negotiate(ctx, codec, channel, &message);
            }

            ctx.notify(key, "on_message", observers, |o| o.on_message(channel, &message));
            None
        }
    }
}

fn negotiate(
    ctx: &DriverContext,
    codec: &ProtocolCodec,
    channel: &Channel,
    message: &crate::protocol::Message,
) {
    match ProtocolAck::from_message(message) {
        Some(Ok(ack)) => {
            let caps = codec.capabilities();
            let format = ack.negotiated_format(
                caps.msgpack,
                caps.compression,
                codec.advertises_compression(),
            );
            channel.set_format(format);
            debug!(endpoint = %channel.key(), %format, "Protocol negotiated");
        }
        Some(Err(err)) => ctx.report(
            ErrorKind::Negotiation,
            channel.key(),
            format!("malformed protocol_ack, staying on JSON: {err}"),
        ),
        None => {}
    }
}
