//! Futures completed by externally polled events.
//!
//! Some completions are only observable by asking: a DMA transfer, a device
//! status register, a file appearing on disk. An [`EventToken`] wraps such a
//! check as a predicate returning [`EventStatus`]; binding it to an
//! [`EventPoller`] yields a future resolved by whichever thread next polls.
//!
//! ```text
//! bind(token) ──► pending list ──poll_once──► Success ─► future ok
//!                      ▲                 ├──► Error(c) ─► future fails
//!                      └──── Pending ◄───┘
//! ```
//!
//! The poller implements [`Poller`], so registering it on a pool
//! ([`EventPoller::enable_polling`]) lets idle workers drive it.
//!
//! ```
//! use parcelrt::event::{EventPoller, EventStatus};
//!
//! let poller = EventPoller::new();
//! let mut remaining = 2;
//! let done = poller.bind_fn("countdown", move || {
//!     remaining -= 1;
//!     if remaining == 0 { EventStatus::Success } else { EventStatus::Pending }
//! });
//! while !done.is_ready() {
//!     poller.poll_once();
//! }
//! assert!(done.get().is_ok());
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{panic_message, Error, ErrorKind};
use crate::error_sink::ErrorSink;
use crate::executor::{Poller, PollerId, PoolHandle};
use crate::future::{Promise, SharedFuture};
use crate::tracing_compat::{debug, trace, warn};

/// Result of one check of an external event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Not finished yet; check again later.
    Pending,
    /// Finished successfully.
    Success,
    /// Finished with an implementation-defined error code.
    Error(i32),
}

type Predicate = Box<dyn FnMut() -> EventStatus + Send + 'static>;

/// A labelled, repeatedly checkable external event.
pub struct EventToken {
    label: String,
    check: Predicate,
}

impl EventToken {
    /// Wraps `check` under `label`; the label shows up in errors and logs.
    pub fn new<F>(label: impl Into<String>, check: F) -> Self
    where
        F: FnMut() -> EventStatus + Send + 'static,
    {
        Self {
            label: label.into(),
            check: Box::new(check),
        }
    }

    /// The token's label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for EventToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventToken")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

struct Bound {
    token: EventToken,
    promise: Promise<()>,
}

struct PollerInner {
    pending: Mutex<Vec<Bound>>,
    sink: Option<ErrorSink>,
}

/// Set of bound external events, tested on every [`poll_once`](Self::poll_once).
#[derive(Clone)]
pub struct EventPoller {
    inner: Arc<PollerInner>,
}

impl EventPoller {
    /// Creates a poller that does not report predicate panics anywhere but
    /// the failed future.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a poller that also reports predicate panics to `sink`.
    #[must_use]
    pub fn with_error_sink(sink: ErrorSink) -> Self {
        Self::build(Some(sink))
    }

    fn build(sink: Option<ErrorSink>) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                pending: Mutex::new(Vec::new()),
                sink,
            }),
        }
    }

    /// Binds `token`; the returned future resolves when the event finishes.
    ///
    /// With an error sink attached, a failure nobody observes any more is
    /// reported there once.
    pub fn bind(&self, token: EventToken) -> SharedFuture<()> {
        let promise = match &self.inner.sink {
            Some(sink) => {
                let sink = sink.clone();
                Promise::new().with_abandon_hook(move |err| {
                    // Predicate panics are reported where they are caught.
                    if err.kind() != ErrorKind::Panicked {
                        sink.report(err);
                    }
                })
            }
            None => Promise::new(),
        };
        let future = promise.future();
        trace!(label = %token.label, "event bound");
        self.inner.pending.lock().push(Bound { token, promise });
        future
    }

    /// Shorthand for `bind(EventToken::new(label, check))`.
    pub fn bind_fn<F>(&self, label: impl Into<String>, check: F) -> SharedFuture<()>
    where
        F: FnMut() -> EventStatus + Send + 'static,
    {
        self.bind(EventToken::new(label, check))
    }

    /// Number of events still pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Checks every bound event once and returns how many finished.
    ///
    /// Predicates run without the poller lock held, so they may bind new
    /// events; those are checked on the next pass. Concurrent callers each
    /// test a disjoint batch.
    pub fn poll_once(&self) -> usize {
        let batch = std::mem::take(&mut *self.inner.pending.lock());
        if batch.is_empty() {
            return 0;
        }

        let mut still_pending = Vec::with_capacity(batch.len());
        let mut finished = 0;
        for mut bound in batch {
            let status = catch_unwind(AssertUnwindSafe(|| (bound.token.check)()));
            match status {
                Ok(EventStatus::Pending) => still_pending.push(bound),
                Ok(EventStatus::Success) => {
                    debug!(label = %bound.token.label, "event completed");
                    let _ = bound.promise.set_value(());
                    finished += 1;
                }
                Ok(EventStatus::Error(code)) => {
                    debug!(label = %bound.token.label, code, "event failed");
                    let _ = bound.promise.set_error(
                        Error::new(ErrorKind::ExternalEvent)
                            .with_message(format!("'{}' failed with code {code}", bound.token.label)),
                    );
                    finished += 1;
                }
                Err(payload) => {
                    let err = Error::panicked(format!(
                        "predicate of '{}' panicked: {}",
                        bound.token.label,
                        panic_message(payload.as_ref())
                    ));
                    warn!(label = %bound.token.label, error = %err, "event predicate panicked");
                    if let Some(sink) = &self.inner.sink {
                        sink.report(&err);
                    }
                    let _ = bound.promise.set_error(err);
                    finished += 1;
                }
            }
        }

        if !still_pending.is_empty() {
            let mut pending = self.inner.pending.lock();
            // Keep bind order: the survivors were bound before anything added
            // during this pass.
            still_pending.append(&mut pending);
            *pending = still_pending;
        }
        finished
    }

    /// Registers this poller on `pool` until the guard is dropped.
    #[must_use = "polling stops when the guard is dropped"]
    pub fn enable_polling(&self, pool: &PoolHandle) -> PollingGuard {
        let id = pool.register_poller(Arc::new(self.clone()));
        PollingGuard {
            pool: pool.clone(),
            id: Some(id),
        }
    }

    /// Fails every pending event with `Shutdown`.
    pub fn cancel_all(&self) -> usize {
        let pending = std::mem::take(&mut *self.inner.pending.lock());
        let count = pending.len();
        for bound in pending {
            let _ = bound.promise.set_error(
                Error::new(ErrorKind::Shutdown)
                    .with_message(format!("'{}' abandoned at shutdown", bound.token.label)),
            );
        }
        count
    }
}

impl Default for EventPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for EventPoller {
    fn poll(&self) -> usize {
        self.poll_once()
    }
}

impl fmt::Debug for EventPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPoller")
            .field("pending", &self.pending_count())
            .field("reports_to_sink", &self.inner.sink.is_some())
            .finish()
    }
}

/// Keeps a poller registered on a pool; unregisters it on drop.
pub struct PollingGuard {
    pool: PoolHandle,
    id: Option<PollerId>,
}

impl PollingGuard {
    /// Unregisters now instead of on drop.
    pub fn disable(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.pool.unregister_poller(id);
        }
    }
}

impl Drop for PollingGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PollingGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingGuard")
            .field("active", &self.id.is_some())
            .finish()
    }
}
