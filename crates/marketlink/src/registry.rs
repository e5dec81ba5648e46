//! Table of live channels, one per endpoint key.
//!
//! Every read-then-write on the table happens inside one critical section
//! with no `.await`, so two callers can never both decide to create a
//! channel for the same key. Driver tasks are spawned after the lock is
//! released.

use std::{
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::{
    channel::{
        Channel, ChannelCommand, ChannelId, ChannelObserver, ChannelState, DriverContext,
        run_endpoint,
    },
    config::SyncConfig,
    dispatcher::panic_message,
    endpoint::{EndpointKey, validate_ws_url},
    error::{SyncError, SyncResult},
    protocol::ProtocolCodec,
    report::{ErrorContext, ErrorKind, ErrorReporter, TracingReporter},
    transport::{Connector, TungsteniteConnector},
};

/// Observers bound to one endpoint.
///
/// The set belongs to the endpoint rather than to a channel, so successor
/// channels keep reporting to every feature that asked for the endpoint.
#[derive(Default)]
pub(crate) struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn ChannelObserver>>>,
}

impl ObserverSet {
    /// Bind `observer` unless this exact instance is already bound.
    fn attach(&self, observer: Arc<dyn ChannelObserver>) -> bool {
        let mut observers = self.observers.write();
        if observers.iter().any(|o| same_observer(o, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    fn detach(&self, observer: &Arc<dyn ChannelObserver>) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| !same_observer(o, observer));
        observers.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn ChannelObserver>> {
        self.observers.read().clone()
    }

    fn len(&self) -> usize {
        self.observers.read().len()
    }

    fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}

fn same_observer(a: &Arc<dyn ChannelObserver>, b: &Arc<dyn ChannelObserver>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub(crate) struct RegistryInner {
    channels: Mutex<HashMap<EndpointKey, Arc<Channel>>>,
    /// Locked only while `channels` is held, or on its own for reads.
    observers: Mutex<HashMap<EndpointKey, Arc<ObserverSet>>>,
    config: Arc<SyncConfig>,
    connector: Arc<dyn Connector>,
    reporter: Arc<dyn ErrorReporter>,
    codec: ProtocolCodec,
}

impl RegistryInner {
    /// Swap in a successor for `current` if the table still holds it.
    ///
    /// Returns `None` when `current` was evicted, replaced, or closed on
    /// request while its reconnect was pending.
    pub(crate) fn replace_if_current(
        &self,
        current: &Channel,
        retry_count: u32,
    ) -> Option<(Arc<Channel>, mpsc::Receiver<ChannelCommand>)> {
        let mut channels = self.channels.lock();
        let entry = channels.get(current.key())?;
        if entry.id() != current.id() || current.is_close_requested() {
            return None;
        }
        let (successor, cmd_rx) = Channel::new(
            current.key().clone(),
            current.url().clone(),
            &self.config,
            retry_count,
            false,
        );
        let successor = Arc::new(successor);
        channels.insert(current.key().clone(), Arc::clone(&successor));
        debug!(
            endpoint = %current.key(),
            previous = %current.id(),
            channel = %successor.id(),
            retry_count,
            "Replaced channel"
        );
        Some((successor, cmd_rx))
    }

    /// Purge the entry for `key` if it is still channel `id` and closed.
    pub(crate) fn remove_closed(&self, key: &EndpointKey, id: ChannelId) -> bool {
        let mut channels = self.channels.lock();
        let purge = channels
            .get(key)
            .is_some_and(|c| c.id() == id && c.state() == ChannelState::Closed);
        if purge {
            channels.remove(key);
            let mut observers = self.observers.lock();
            if observers.get(key).is_some_and(|set| set.is_empty()) {
                observers.remove(key);
            }
            debug!(endpoint = %key, channel = %id, "Purged closed channel");
        }
        purge
    }
}

/// Shared handle to the channel table.
///
/// Cloning is cheap. Construct one per application and pass it to every
/// component that needs channels.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("channels", &self.len())
            .finish()
    }
}

/// Builder for [`ConnectionRegistry`].
pub struct RegistryBuilder {
    config: SyncConfig,
    connector: Option<Arc<dyn Connector>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    codec: Option<ProtocolCodec>,
}

impl RegistryBuilder {
    /// Use a custom transport.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Send classified failures to `reporter`.
    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Override the codec derived from the configuration.
    #[must_use]
    pub fn codec(mut self, codec: ProtocolCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Validate the configuration and build the registry.
    pub fn build(self) -> SyncResult<ConnectionRegistry> {
        let reporter = self.reporter.unwrap_or_else(|| Arc::new(TracingReporter));
        if let Err(message) = self.config.validate() {
            reporter.report(ErrorKind::FatalConfig, &ErrorContext::new(message.clone()));
            return Err(SyncError::config(message));
        }

        let codec = self.codec.unwrap_or_else(|| codec_for(&self.config));
        Ok(ConnectionRegistry {
            inner: Arc::new(RegistryInner {
                channels: Mutex::new(HashMap::new()),
                observers: Mutex::new(HashMap::new()),
                config: Arc::new(self.config),
                connector: self
                    .connector
                    .unwrap_or_else(|| Arc::new(TungsteniteConnector)),
                reporter,
                codec,
            }),
        })
    }
}

fn codec_for(config: &SyncConfig) -> ProtocolCodec {
    let codec = if config.enable_msgpack {
        ProtocolCodec::new()
    } else {
        ProtocolCodec::json_only()
    };
    codec
        .with_compression(config.enable_compression)
        .advertise_compression(config.supports_compressed_binary)
        .with_max_inflated_size(config.max_message_size)
}

impl ConnectionRegistry {
    pub fn builder(config: SyncConfig) -> RegistryBuilder {
        RegistryBuilder {
            config,
            connector: None,
            reporter: None,
            codec: None,
        }
    }

    /// Registry over real WebSockets.
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn reporter(&self) -> Arc<dyn ErrorReporter> {
        Arc::clone(&self.inner.reporter)
    }

    /// The live channel for `key`, if it is neither closed nor stale.
    pub fn get(&self, key: &EndpointKey) -> Option<Arc<Channel>> {
        self.inner
            .channels
            .lock()
            .get(key)
            .filter(|c| !c.is_stale())
            .cloned()
    }

    /// Return the live channel for `key`, or create and start one.
    ///
    /// A stale or closing entry is evicted and closed first. `observer` is
    /// bound to the endpoint, not to the returned channel: it keeps receiving
    /// events from successor channels, probes included, until
    /// [`release`](Self::release). Binding the same instance twice is a
    /// no-op. An observer joining an already open channel gets `on_open`
    /// immediately. Must be called from within a Tokio runtime.
    pub fn get_or_create(
        &self,
        key: EndpointKey,
        url: &Url,
        observer: Arc<dyn ChannelObserver>,
    ) -> SyncResult<Arc<Channel>> {
        self.open(key, url, observer, false)
    }

    /// Single-shot connection attempt used when probing out of polling mode.
    ///
    /// The channel starts with its retry budget spent, so a failed probe
    /// ends without a backoff cycle. A probe that opens resets the budget
    /// like any channel. Returns the existing channel when one is live.
    pub fn probe(
        &self,
        key: EndpointKey,
        url: &Url,
        observer: Arc<dyn ChannelObserver>,
    ) -> SyncResult<Arc<Channel>> {
        self.open(key, url, observer, true)
    }

    fn open(
        &self,
        key: EndpointKey,
        url: &Url,
        observer: Arc<dyn ChannelObserver>,
        probe: bool,
    ) -> SyncResult<Arc<Channel>> {
        let url = validate_ws_url(url.as_str()).inspect_err(|err| {
            self.inner.reporter.report(
                ErrorKind::FatalConfig,
                &ErrorContext::for_endpoint(&key, err.to_string()),
            );
        })?;

        let retry_count = if probe { self.inner.config.max_retries } else { 0 };
        let (channel, cmd_rx, evicted, observers) = {
            let mut channels = self.inner.channels.lock();
            let observers = Arc::clone(
                self.inner
                    .observers
                    .lock()
                    .entry(key.clone())
                    .or_default(),
            );
            let newly_bound = observers.attach(Arc::clone(&observer));

            let live = channels.get(&key).filter(|c| !c.is_stale()).cloned();
            if let Some(existing) = live {
                drop(channels);
                if newly_bound && existing.state() == ChannelState::Open {
                    self.replay_open(&existing, observer.as_ref());
                }
                return Ok(existing);
            }

            let (channel, cmd_rx) =
                Channel::new(key.clone(), url, &self.inner.config, retry_count, probe);
            let channel = Arc::new(channel);
            let evicted = channels.insert(key.clone(), Arc::clone(&channel));
            (channel, cmd_rx, evicted, observers)
        };

        if let Some(evicted) = evicted {
            debug!(
                endpoint = %key,
                channel = %evicted.id(),
                state = %evicted.state(),
                "Evicting stale channel"
            );
            evicted.close();
        }

        info!(endpoint = %key, channel = %channel.id(), probe, "Opening channel");
        let ctx = DriverContext {
            registry: Arc::downgrade(&self.inner),
            config: Arc::clone(&self.inner.config),
            connector: Arc::clone(&self.inner.connector),
            reporter: Arc::clone(&self.inner.reporter),
            codec: self.inner.codec.clone(),
        };
        tokio::spawn(run_endpoint(ctx, Arc::clone(&channel), cmd_rx, observers));
        Ok(channel)
    }

    /// A late observer of an open channel still sees `on_open` once.
    fn replay_open(&self, channel: &Channel, observer: &dyn ChannelObserver) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer.on_open(channel))) {
            self.inner.reporter.report(
                ErrorKind::Handler,
                &ErrorContext::for_endpoint(
                    channel.key(),
                    format!("on_open observer panicked: {}", panic_message(panic.as_ref())),
                ),
            );
        }
    }

    /// Unbind `observer` from `key`. The channel is closed once nothing
    /// observes it any more.
    ///
    /// Returns whether the observer was bound.
    pub fn release(&self, key: &EndpointKey, observer: &Arc<dyn ChannelObserver>) -> bool {
        let orphaned = {
            let channels = self.inner.channels.lock();
            let mut observers = self.inner.observers.lock();
            let Some(set) = observers.get(key) else {
                return false;
            };
            if !set.detach(observer) {
                return false;
            }
            if set.is_empty() {
                observers.remove(key);
                channels.get(key).cloned()
            } else {
                None
            }
        };

        if let Some(channel) = orphaned {
            debug!(endpoint = %key, channel = %channel.id(), "Last observer released");
            channel.close();
        }
        true
    }

    /// Observers currently bound to `key`.
    pub fn observer_count(&self, key: &EndpointKey) -> usize {
        self.inner
            .observers
            .lock()
            .get(key)
            .map_or(0, |set| set.len())
    }

    /// Close the channel for `key`. It is purged after the GC grace window.
    pub fn close(&self, key: &EndpointKey) -> bool {
        let channel = self.inner.channels.lock().get(key).cloned();
        match channel {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Close every channel.
    pub fn close_all(&self) {
        let channels: Vec<_> = self.inner.channels.lock().values().cloned().collect();
        for channel in channels {
            channel.close();
        }
    }

    /// Purge channels that have been closed for at least the GC grace window.
    pub fn collect_garbage(&self) -> usize {
        let grace = self.inner.config.gc_grace;
        let mut channels = self.inner.channels.lock();
        let before = channels.len();
        channels.retain(|_, c| {
            c.state() != ChannelState::Closed || c.closed_at().is_none_or(|at| at.elapsed() < grace)
        });
        self.inner
            .observers
            .lock()
            .retain(|key, set| channels.contains_key(key) || !set.is_empty());
        before - channels.len()
    }

    /// Number of entries, including closed ones awaiting GC.
    pub fn len(&self) -> usize {
        self.inner.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<EndpointKey> {
        self.inner.channels.lock().keys().cloned().collect()
    }

    /// The entry for `key` regardless of state.
    pub fn entry(&self, key: &EndpointKey) -> Option<Arc<Channel>> {
        self.inner.channels.lock().get(key).cloned()
    }
}
