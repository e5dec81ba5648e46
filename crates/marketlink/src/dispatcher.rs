//! Routes decoded messages to subscribers keyed by type or category.
//!
//! Each handler runs failure-isolated: a handler that returns an error or
//! panics is reported and the remaining handlers still run.

use std::{
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;
use tracing::trace;

use crate::{
    error::SyncResult,
    protocol::{Category, Message},
    report::{ErrorContext, ErrorKind, ErrorReporter, TracingReporter},
};

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&Message) -> SyncResult<()> + Send + Sync>;

/// What a handler is registered for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DispatchKey {
    /// Every message with this `type`.
    Type(String),
    /// Every message in this category.
    Category(Category),
}

impl DispatchKey {
    pub fn message_type(t: impl Into<String>) -> Self {
        Self::Type(t.into())
    }
}

impl From<Category> for DispatchKey {
    fn from(category: Category) -> Self {
        Self::Category(category)
    }
}

impl From<&str> for DispatchKey {
    fn from(t: &str) -> Self {
        Self::Type(t.to_string())
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(t) => write!(f, "type:{t}"),
            Self::Category(c) => write!(f, "category:{c}"),
        }
    }
}

struct DispatcherInner {
    handlers: RwLock<HashMap<DispatchKey, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
    reporter: Arc<dyn ErrorReporter>,
}

impl DispatcherInner {
    fn remove(&self, key: &DispatchKey, id: u64) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(key);
        }
        removed
    }
}

/// Subscriber table shared by one feature.
#[derive(Clone)]
pub struct MessageDispatcher {
    inner: Arc<DispatcherInner>,
}

impl fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("keys", &self.key_count())
            .finish()
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDispatcher {
    /// Dispatcher that reports handler failures through `tracing`.
    pub fn new() -> Self {
        Self::with_reporter(Arc::new(TracingReporter))
    }

    pub fn with_reporter(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                handlers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                reporter,
            }),
        }
    }

    /// Register `handler` for `key`.
    ///
    /// The handler stays registered until the returned [`Disposer`] is
    /// dropped or disposed.
    pub fn on<F>(&self, key: impl Into<DispatchKey>, handler: F) -> Disposer
    where
        F: Fn(&Message) -> SyncResult<()> + Send + Sync + 'static,
    {
        let key = key.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Disposer {
            registration: Some((Arc::downgrade(&self.inner), key, id)),
        }
    }

    /// Invoke every handler for the message's type, then every handler for
    /// its category. Returns how many handlers ran.
    ///
    /// Messages with an empty type are dropped and reported.
    pub fn dispatch(&self, message: &Message) -> usize {
        if message.message_type.is_empty() {
            self.inner.reporter.report(
                ErrorKind::ProtocolDecode,
                &ErrorContext::new("dropping message without a type"),
            );
            return 0;
        }

        // Snapshot so handlers may register or dispose without deadlocking.
        let snapshot: Vec<Handler> = {
            let handlers = self.inner.handlers.read();
            let by_type = handlers.get(&DispatchKey::Type(message.message_type.clone()));
            let by_category = handlers.get(&DispatchKey::Category(message.category));
            by_type
                .into_iter()
                .chain(by_category)
                .flatten()
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };

        for handler in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self.inner.reporter.report(
                    ErrorKind::Handler,
                    &ErrorContext::new(format!(
                        "handler for {} failed: {err}",
                        message.message_type
                    )),
                ),
                Err(panic) => self.inner.reporter.report(
                    ErrorKind::Handler,
                    &ErrorContext::new(format!(
                        "handler for {} panicked: {}",
                        message.message_type,
                        panic_message(panic.as_ref())
                    )),
                ),
            }
        }

        trace!(
            message_type = %message.message_type,
            handlers = snapshot.len(),
            "Dispatched message"
        );
        snapshot.len()
    }

    /// Number of handlers registered for `key`.
    pub fn handler_count(&self, key: &DispatchKey) -> usize {
        self.inner.handlers.read().get(key).map_or(0, Vec::len)
    }

    /// Number of keys with at least one handler.
    pub fn key_count(&self) -> usize {
        self.inner.handlers.read().len()
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Removes exactly one handler registration when dropped.
#[must_use = "dropping a Disposer unregisters its handler"]
pub struct Disposer {
    registration: Option<(Weak<DispatcherInner>, DispatchKey, u64)>,
}

impl Disposer {
    /// Unregister now. Returns whether the handler was still registered.
    pub fn dispose(mut self) -> bool {
        self.remove()
    }

    /// Keep the handler registered for the dispatcher's lifetime.
    pub fn detach(mut self) {
        self.registration = None;
    }

    fn remove(&mut self) -> bool {
        let Some((inner, key, id)) = self.registration.take() else {
            return false;
        };
        inner.upgrade().is_some_and(|inner| inner.remove(&key, id))
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("key", &self.registration.as_ref().map(|(_, k, _)| k))
            .finish()
    }
}
