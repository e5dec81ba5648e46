//! Structured error-reporting sink.
//!
//! Every recoverable failure in the subsystem is classified into an
//! [`ErrorKind`] and handed to an injected [`ErrorReporter`]. Only the
//! terminal "switched to polling" state and explicit user actions are
//! surfaced to callers as errors; everything else flows through here.

use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::endpoint::EndpointKey;

/// Failure taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Dirty close or socket error; retried with backoff.
    TransientTransport,
    /// A single frame could not be decoded and was discarded.
    ProtocolDecode,
    /// The peer did not understand negotiation; the channel stays on JSON.
    Negotiation,
    /// Retry budget spent; the feed switched to fallback polling.
    ExhaustedRetries,
    /// Malformed URL or configuration. Never retried.
    FatalConfig,
    /// A subscriber callback failed or panicked.
    Handler,
    /// A REST fetch (poll or stop-gap) failed.
    Fetch,
}

impl ErrorKind {
    /// Stable lowercase name, used as a log field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientTransport => "transient_transport",
            Self::ProtocolDecode => "protocol_decode",
            Self::Negotiation => "negotiation",
            Self::ExhaustedRetries => "exhausted_retries",
            Self::FatalConfig => "fatal_config",
            Self::Handler => "handler",
            Self::Fetch => "fetch",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and why a failure happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorContext {
    /// Endpoint the failure belongs to, when there is one.
    pub endpoint: Option<EndpointKey>,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorContext {
    /// Context without an endpoint.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            message: message.into(),
        }
    }

    /// Context tied to an endpoint.
    pub fn for_endpoint(endpoint: &EndpointKey, message: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.clone()),
            message: message.into(),
        }
    }
}

/// Sink for classified failures.
pub trait ErrorReporter: Send + Sync + 'static {
    /// Record one failure.
    fn report(&self, kind: ErrorKind, context: &ErrorContext);
}

/// Default reporter: emits a `tracing` event whose level follows the kind.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, kind: ErrorKind, context: &ErrorContext) {
        let endpoint = context.endpoint.as_ref().map(EndpointKey::as_str);
        match kind {
            ErrorKind::FatalConfig | ErrorKind::ExhaustedRetries => {
                error!(kind = %kind, endpoint, "{}", context.message);
            }
            ErrorKind::Negotiation => {
                debug!(kind = %kind, endpoint, "{}", context.message);
            }
            _ => {
                warn!(kind = %kind, endpoint, "{}", context.message);
            }
        }
    }
}

/// Reporter that keeps every report in memory.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(ErrorKind, ErrorContext)>>,
}

impl RecordingReporter {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn reports(&self) -> Vec<(ErrorKind, ErrorContext)> {
        self.reports.lock().clone()
    }

    /// Number of reports of the given kind.
    pub fn count(&self, kind: ErrorKind) -> usize {
        self.reports.lock().iter().filter(|(k, _)| *k == kind).count()
    }

    /// Forget all recorded reports.
    pub fn clear(&self) {
        self.reports.lock().clear();
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, kind: ErrorKind, context: &ErrorContext) {
        self.reports.lock().push((kind, context.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_reporter_counts_by_kind() {
        let reporter = RecordingReporter::new();
        let key = EndpointKey::market("abc");
        reporter.report(
            ErrorKind::ProtocolDecode,
            &ErrorContext::for_endpoint(&key, "bad flag"),
        );
        reporter.report(ErrorKind::ProtocolDecode, &ErrorContext::new("short frame"));
        reporter.report(ErrorKind::Fetch, &ErrorContext::new("503"));

        assert_eq!(reporter.count(ErrorKind::ProtocolDecode), 2);
        assert_eq!(reporter.count(ErrorKind::Fetch), 1);
        assert_eq!(reporter.count(ErrorKind::FatalConfig), 0);
        assert_eq!(reporter.reports()[0].1.endpoint, Some(key));

        reporter.clear();
        assert!(reporter.reports().is_empty());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::TransientTransport.to_string(), "transient_transport");
        assert_eq!(ErrorKind::ExhaustedRetries.as_str(), "exhausted_retries");
    }
}
