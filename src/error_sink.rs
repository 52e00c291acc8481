//! Process-scoped sink for failures nobody else is waiting on.
//!
//! Failures that belong to a live future are delivered to that future. What
//! remains ends up here: failed fire-and-forget actions, failed futures that
//! were abandoned before they resolved, replies that arrive after their
//! caller gave up, and transport events that cannot be tied to a single call.
//!
//! Every report becomes a [`DiagnosticRecord`] and is passed to the
//! registered handlers in registration order. A panicking handler is caught
//! and logged; the handlers after it still run. When no handler is
//! registered the record is logged at `error` level instead.
//!
//! A non-console locality can be configured to forward its reports to the
//! console locality through the built-in [`CONSOLE_SINK_ACTION`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::action::ActionRegistryBuilder;
use crate::error::{panic_message, Error, ErrorKind, Result};
use crate::tracing_compat::{error, warn};
use crate::types::LocalityId;

/// Action id of the built-in handler that feeds a record into the receiving
/// locality's sink.
pub const CONSOLE_SINK_ACTION: &str = "parcelrt::console_error_sink";

/// A formatted failure as seen by diagnostic handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    /// Kind of the reported error.
    pub kind: ErrorKind,
    /// Rendered error message.
    pub message: String,
    /// Locality where the failure was raised.
    pub origin: LocalityId,
    /// Locality that built the record.
    pub reported_by: LocalityId,
    /// Cause chain, outermost first.
    pub causes: Vec<String>,
}

impl DiagnosticRecord {
    /// Builds a record for `error`, reported on `here`.
    #[must_use]
    pub fn from_error(error: &Error, here: LocalityId) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            origin: error.origin().unwrap_or(here),
            reported_by: here,
            causes: error.cause_chain(),
        }
    }

    /// Multi-line human readable rendering.
    #[must_use]
    pub fn diagnostic_information(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.message);
        let _ = writeln!(out, "  kind:        {:?}", self.kind);
        let _ = writeln!(out, "  origin:      {}", self.origin);
        let _ = write!(out, "  reported by: {}", self.reported_by);
        for (depth, cause) in self.causes.iter().enumerate() {
            let _ = write!(out, "\n  cause {depth}:     {cause}");
        }
        out
    }
}

impl fmt::Display for DiagnosticRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.origin, self.message)
    }
}

/// Identifies a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A diagnostic handler.
pub type DiagnosticHandler = Arc<dyn Fn(&DiagnosticRecord) + Send + Sync>;

/// Sends a record to the console locality.
pub(crate) type Forwarder = Arc<dyn Fn(&DiagnosticRecord) + Send + Sync>;

struct SinkInner {
    locality: LocalityId,
    handlers: RwLock<Vec<(HandlerId, DiagnosticHandler)>>,
    forwarder: RwLock<Option<Forwarder>>,
    next_id: AtomicU64,
    reported: AtomicU64,
}

/// Cloneable handle to one locality's error sink.
#[derive(Clone)]
pub struct ErrorSink {
    inner: Arc<SinkInner>,
}

impl ErrorSink {
    /// Creates an empty sink for `locality`.
    #[must_use]
    pub fn new(locality: LocalityId) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                locality,
                handlers: RwLock::new(Vec::new()),
                forwarder: RwLock::new(None),
                next_id: AtomicU64::new(1),
                reported: AtomicU64::new(0),
            }),
        }
    }

    /// Locality this sink belongs to.
    #[must_use]
    pub fn locality(&self) -> LocalityId {
        self.inner.locality
    }

    /// Registers a handler; handlers run in registration order.
    pub fn register_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&DiagnosticRecord) + Send + Sync + 'static,
    {
        self.register_shared(Arc::new(handler))
    }

    pub(crate) fn register_shared(&self, handler: DiagnosticHandler) -> HandlerId {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers.write().push((id, handler));
        id
    }

    /// Removes a handler. Returns false if `id` was not registered.
    pub fn deregister_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write();
        let before = handlers.len();
        handlers.retain(|(registered, _)| *registered != id);
        handlers.len() != before
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    /// Total number of records delivered through this sink.
    #[must_use]
    pub fn reported_count(&self) -> u64 {
        self.inner.reported.load(Ordering::Relaxed)
    }

    pub(crate) fn set_forwarder(&self, forwarder: Option<Forwarder>) {
        *self.inner.forwarder.write() = forwarder;
    }

    /// Reports a failure raised on, or received by, this locality.
    ///
    /// The record is also forwarded to the console locality when forwarding
    /// is configured.
    pub fn report(&self, error: &Error) {
        let record = DiagnosticRecord::from_error(error, self.inner.locality);
        self.deliver(&record);
        let forwarder = self.inner.forwarder.read().clone();
        if let Some(forward) = forwarder {
            forward(&record);
        }
    }

    /// Delivers an already built record, without forwarding it.
    pub fn report_record(&self, record: &DiagnosticRecord) {
        self.deliver(record);
    }

    fn deliver(&self, record: &DiagnosticRecord) {
        self.inner.reported.fetch_add(1, Ordering::Relaxed);
        let handlers: Vec<DiagnosticHandler> = self
            .inner
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        if handlers.is_empty() {
            error!(
                kind = ?record.kind,
                origin = %record.origin,
                locality = %record.reported_by,
                causes = ?record.causes,
                "{}",
                record.message
            );
            return;
        }
        for handler in handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(record))) {
                warn!(
                    panic = %panic_message(payload.as_ref()),
                    "diagnostic handler panicked"
                );
            }
        }
    }
}

/// Registers the action that feeds a remotely built record into the
/// receiving locality's sink.
pub(crate) fn register_console_sink(builder: &mut ActionRegistryBuilder) -> Result<()> {
    builder
        .register_fn(CONSOLE_SINK_ACTION, |ctx, record: DiagnosticRecord| -> Result<()> {
            if let Some(dispatcher) = ctx.dispatcher() {
                dispatcher.error_sink().report_record(&record);
            }
            Ok(())
        })?
        .set_accepts_continuation(false);
    Ok(())
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink")
            .field("locality", &self.inner.locality)
            .field("handlers", &self.handler_count())
            .field("reported", &self.reported_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use parking_lot::Mutex;

    #[test]
    fn handlers_run_in_registration_order() {
        init_test_logging();
        let sink = ErrorSink::new(LocalityId::new(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            sink.register_handler(move |record| seen.lock().push((tag, record.kind)));
        }
        sink.report(&Error::user("boom"));
        assert_eq!(
            *seen.lock(),
            vec![("first", ErrorKind::User), ("second", ErrorKind::User)]
        );
        assert_eq!(sink.reported_count(), 1);
    }

    #[test]
    fn panicking_handler_is_isolated() {
        init_test_logging();
        let sink = ErrorSink::new(LocalityId::new(1));
        let calls = Arc::new(AtomicU64::new(0));
        sink.register_handler(|_| panic!("handler bug"));
        let c = Arc::clone(&calls);
        sink.register_handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sink.report(&Error::new(ErrorKind::ReplyTimeout));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregistered_handler_stops_receiving() {
        init_test_logging();
        let sink = ErrorSink::new(LocalityId::new(1));
        let calls = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&calls);
        let id = sink.register_handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sink.report(&Error::user("one"));
        assert!(sink.deregister_handler(id));
        assert!(!sink.deregister_handler(id));
        sink.report(&Error::user("two"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.handler_count(), 0);
    }

    #[test]
    fn record_keeps_origin_and_causes() {
        init_test_logging();
        let remote = Error::user("disk full")
            .with_source(std::io::Error::new(std::io::ErrorKind::Other, "ENOSPC"))
            .with_origin(LocalityId::new(4));
        let record = DiagnosticRecord::from_error(&remote, LocalityId::new(1));
        assert_eq!(record.origin, LocalityId::new(4));
        assert_eq!(record.reported_by, LocalityId::new(1));
        assert_eq!(record.causes, vec!["ENOSPC".to_string()]);
        let info = record.diagnostic_information();
        assert!(info.starts_with("user error: disk full"), "{info}");
        assert!(info.contains("cause 0:"), "{info}");
        assert_eq!(record.to_string(), "[locality#4] user error: disk full");
    }

    #[test]
    fn forwarder_sees_reports_but_not_records() {
        init_test_logging();
        let sink = ErrorSink::new(LocalityId::new(2));
        let forwarded = Arc::new(AtomicU64::new(0));
        let f = Arc::clone(&forwarded);
        sink.set_forwarder(Some(Arc::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        })));
        sink.register_handler(|_| {});
        sink.report(&Error::user("forwarded"));
        let record = DiagnosticRecord::from_error(&Error::user("local"), LocalityId::new(2));
        sink.report_record(&record);
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
        assert_eq!(sink.reported_count(), 2);
    }
}
