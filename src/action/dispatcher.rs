//! Runs actions locally or forwards them to the locality that owns the
//! destination.
//!
//! # Call paths
//!
//! ```text
//! invoke ──► destination local? ──yes──► handler on the executor ──► future
//!                  │
//!                  no
//!                  ▼
//!        outstanding[correlation] = completion
//!        parcelport.send(Request) ······► remote handle_parcel
//!                                               │
//!        handle_parcel(Reply) ◄······ Reply ◄───┘
//!        outstanding.remove(correlation) ─► completion ─► future
//! ```
//!
//! Every remote call carries a deadline. The [`ReplyTimeoutSweep`] poller
//! fails calls whose deadline passed with `ReplyTimeout`; a disconnect fails
//! every call outstanding to that locality with `ConnectionLost`. A reply that
//! arrives after its call was resolved is dropped, or reported to the error
//! sink if it carries a failure.
//!
//! A transferred continuation changes where the result goes: the remote side
//! applies the continuation action at the target instead of replying. A
//! failure is reported to the error sink of the target's locality.

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::{Action, ActionContext, ActionRegistry, Payload};
use crate::error::{Error, ErrorKind, Result};
use crate::error_sink::{DiagnosticRecord, ErrorSink, Forwarder, CONSOLE_SINK_ACTION};
use crate::executor::{Poller, SharedExecutor, Task};
use crate::future::{promise, Promise, SharedFuture};
use crate::parcel::{
    ContinuationTarget, Parcel, ParcelKind, ParcelReceiver, Parcelport, ReplyOutcome,
    TransportError,
};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::{ActionId, CorrelationId, Gid, LocalityId};

/// Receives the terminal outcome of one call.
type Completion = Box<dyn FnOnce(Result<Payload>) + Send + 'static>;

struct Outstanding {
    complete: Completion,
    destination: LocalityId,
    action: ActionId,
    deadline: Instant,
}

pub(crate) struct DispatcherInner {
    locality: LocalityId,
    registry: Arc<ActionRegistry>,
    executor: SharedExecutor,
    sink: ErrorSink,
    reply_timeout: Duration,
    port: RwLock<Option<Arc<dyn Parcelport>>>,
    outstanding: Mutex<HashMap<CorrelationId, Outstanding>>,
    closed: AtomicBool,
}

impl DispatcherInner {
    /// A promise whose failure is reported to the sink if nobody observes it.
    fn watched_promise<T: Send + Sync + 'static>(&self) -> Promise<T> {
        let sink = self.sink.clone();
        Promise::new().with_abandon_hook(move |err| sink.report(err))
    }

    fn shutdown_error(&self) -> Error {
        Error::new(ErrorKind::Shutdown).with_message(format!("dispatcher on {} shut down", self.locality))
    }

    fn send(&self, parcel: Parcel) -> Result<()> {
        let port = self.port.read().clone();
        let Some(port) = port else {
            return Err(Error::locality_unreachable(parcel.destination_locality()));
        };
        trace!(parcel = %parcel, port = port.name(), "send parcel");
        port.send(parcel).map_err(Error::from)
    }

    /// Schedules the handler for `action` on the executor.
    fn run_local(
        self: &Arc<Self>,
        action: &ActionId,
        arguments: Payload,
        target: Gid,
        source: LocalityId,
    ) -> Result<SharedFuture<Payload>> {
        let descriptor = self
            .registry
            .get(action)
            .ok_or_else(|| Error::unregistered_action(action))?;
        let handler = Arc::clone(descriptor.handler());
        let ctx = ActionContext::new(self.locality, target, source, Arc::downgrade(self));
        let (promise, future) = promise();
        self.executor.execute(Task::new(move || {
            match catch_unwind(AssertUnwindSafe(|| handler(ctx, arguments))) {
                Ok(result) => result.on_complete(move |outcome| {
                    let _ = promise.set_result(outcome.clone());
                }),
                Err(payload) => {
                    let _ = promise.set_error(Error::from_panic(payload.as_ref()));
                }
            }
        }));
        Ok(future)
    }

    fn dispatch(self: &Arc<Self>, action: ActionId, arguments: Payload, destination: Gid, complete: Completion) {
        if self.closed.load(Ordering::Acquire) {
            complete(Err(self.shutdown_error()));
            return;
        }
        debug!(%action, %destination, "dispatching action");

        if destination.locality() == self.locality {
            match self.run_local(&action, arguments, destination, self.locality) {
                Ok(future) => future.on_complete(move |outcome| complete(outcome.clone())),
                Err(err) => complete(Err(err)),
            }
            return;
        }

        let correlation = CorrelationId::next();
        let parcel = Parcel::request(
            correlation,
            self.locality,
            destination,
            action.clone(),
            arguments,
            None,
        );
        // Registered before sending: an in-process reply can arrive before
        // `send` returns.
        self.outstanding.lock().insert(
            correlation,
            Outstanding {
                complete,
                destination: destination.locality(),
                action,
                deadline: Instant::now() + self.reply_timeout,
            },
        );
        if let Err(err) = self.send(parcel) {
            let entry = self.outstanding.lock().remove(&correlation);
            if let Some(entry) = entry {
                (entry.complete)(Err(err));
            }
        }
    }

    fn apply(self: &Arc<Self>, action: ActionId, arguments: Payload, destination: Gid) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.shutdown_error());
        }
        debug!(%action, %destination, "applying action");
        if destination.locality() == self.locality {
            let future = self.run_local(&action, arguments, destination, self.locality)?;
            let sink = self.sink.clone();
            future.on_complete(move |outcome| {
                if let Err(err) = outcome {
                    sink.report(err);
                }
            });
            return Ok(());
        }
        self.send(Parcel::apply(self.locality, destination, action, arguments))
    }

    fn invoke_with_continuation(
        self: &Arc<Self>,
        action: ActionId,
        arguments: Payload,
        destination: Gid,
        target: ContinuationTarget,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.shutdown_error());
        }
        debug!(%action, %destination, continuation = %target.action, "dispatching with continuation");
        if destination.locality() != self.locality {
            let parcel = Parcel::request(
                CorrelationId::next(),
                self.locality,
                destination,
                action,
                arguments,
                Some(target),
            );
            return self.send(parcel);
        }

        self.check_accepts_continuation(&action)?;
        let future = self.run_local(&action, arguments, destination, self.locality)?;
        let weak = Arc::downgrade(self);
        future.on_complete(move |outcome| {
            if let Some(inner) = weak.upgrade() {
                inner.deliver_to_continuation(target, outcome.clone());
            }
        });
        Ok(())
    }

    fn check_accepts_continuation(&self, action: &ActionId) -> Result<()> {
        match self.registry.get(action) {
            Some(descriptor) if !descriptor.accepts_continuation() => Err(Error::invalid_argument(
                format!("'{action}' does not accept a continuation"),
            )),
            _ => Ok(()),
        }
    }

    fn deliver_to_continuation(self: &Arc<Self>, target: ContinuationTarget, result: Result<Payload>) {
        match result {
            Ok(value) => {
                let locality = target.locality();
                if let Err(err) = self.apply(target.action, value, target.destination) {
                    warn!(to = %locality, error = %err, "continuation delivery failed");
                    self.sink.report(&err);
                }
            }
            Err(err) => self.report_to(target.locality(), &err),
        }
    }

    /// Reports `error` to the error sink of `locality`.
    fn report_to(self: &Arc<Self>, locality: LocalityId, error: &Error) {
        if locality == self.locality {
            self.sink.report(error);
            return;
        }
        let record = DiagnosticRecord::from_error(error, self.locality);
        let sent = Payload::encode(&record).and_then(|payload| {
            self.apply(ActionId::new(CONSOLE_SINK_ACTION), payload, Gid::locality_root(locality))
        });
        if let Err(err) = sent {
            warn!(%locality, error = %err, "could not report failure remotely");
            self.sink.report(error);
        }
    }

    /// Sends `record` to the console locality without reporting failures.
    fn forward_to_console(self: &Arc<Self>, record: &DiagnosticRecord) {
        let sent = Payload::encode(record).and_then(|payload| {
            self.apply(
                ActionId::new(CONSOLE_SINK_ACTION),
                payload,
                Gid::locality_root(LocalityId::CONSOLE),
            )
        });
        if let Err(err) = sent {
            warn!(error = %err, "console forwarding failed");
        }
    }

    fn handle_parcel(self: &Arc<Self>, parcel: Parcel) {
        trace!(parcel = %parcel, "received parcel");
        match parcel.kind {
            ParcelKind::Request => self.handle_request(parcel),
            ParcelKind::Apply => self.handle_apply(parcel),
            ParcelKind::Reply => self.handle_reply(parcel),
        }
    }

    fn handle_request(self: &Arc<Self>, parcel: Parcel) {
        let Parcel {
            correlation,
            source,
            destination,
            action,
            arguments,
            continuation,
            ..
        } = parcel;

        let started = if continuation.is_some() {
            self.check_accepts_continuation(&action)
                .and_then(|()| self.run_local(&action, arguments, destination, source))
        } else {
            self.run_local(&action, arguments, destination, source)
        };

        let weak = Arc::downgrade(self);
        let respond = move |result: Result<Payload>| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match continuation {
                Some(target) => inner.deliver_to_continuation(target, result),
                None => inner.reply(correlation, source, action, result),
            }
        };
        match started {
            Ok(future) => future.on_complete(move |outcome| respond(outcome.clone())),
            Err(err) => respond(Err(err)),
        }
    }

    fn reply(&self, correlation: CorrelationId, to: LocalityId, action: ActionId, result: Result<Payload>) {
        let outcome = match result {
            Ok(value) => ReplyOutcome::Value(value),
            Err(err) => ReplyOutcome::Failed(err.to_remote(self.locality)),
        };
        let parcel = Parcel::reply(correlation, self.locality, to, action.clone(), outcome);
        if let Err(err) = self.send(parcel) {
            warn!(%to, %action, error = %err, "reply not delivered");
            self.sink.report(&err.with_message(format!("reply to {to} for '{action}' not delivered")));
        }
    }

    fn handle_apply(self: &Arc<Self>, parcel: Parcel) {
        match self.run_local(&parcel.action, parcel.arguments, parcel.destination, parcel.source) {
            Ok(future) => {
                let sink = self.sink.clone();
                future.on_complete(move |outcome| {
                    if let Err(err) = outcome {
                        sink.report(err);
                    }
                });
            }
            Err(err) => self.sink.report(&err),
        }
    }

    fn handle_reply(&self, parcel: Parcel) {
        let entry = self.outstanding.lock().remove(&parcel.correlation);
        let outcome = parcel.outcome.unwrap_or_else(|| {
            ReplyOutcome::Failed(
                Error::internal("reply without outcome").to_remote(parcel.source),
            )
        });
        match (entry, outcome) {
            (Some(entry), outcome) => {
                trace!(correlation = parcel.correlation.raw(), "reply matched");
                let result = match outcome {
                    ReplyOutcome::Value(value) => Ok(value),
                    ReplyOutcome::Failed(remote) => Err(Error::from_remote(remote)),
                };
                self.resolve(entry, result);
            }
            (None, ReplyOutcome::Failed(remote)) => {
                debug!(correlation = parcel.correlation.raw(), "failure reply without a waiting caller");
                self.sink.report(&Error::from_remote(remote));
            }
            (None, ReplyOutcome::Value(_)) => {
                trace!(correlation = parcel.correlation.raw(), "dropping late reply");
            }
        }
    }

    /// Resolves a call on the executor. Replies and disconnects arrive on
    /// transport threads, which must stay free to read further replies.
    fn resolve(&self, entry: Outstanding, result: Result<Payload>) {
        let complete = entry.complete;
        self.executor.execute(Task::new(move || complete(result)));
    }

    /// Removes and returns the outstanding calls matching `pred`.
    fn take_outstanding(&self, pred: impl Fn(&Outstanding) -> bool) -> Vec<Outstanding> {
        let mut outstanding = self.outstanding.lock();
        let ids: Vec<CorrelationId> = outstanding
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| outstanding.remove(&id))
            .collect()
    }

    fn expire_overdue(&self, now: Instant) -> usize {
        let expired = self.take_outstanding(|entry| entry.deadline <= now);
        let count = expired.len();
        for entry in expired {
            warn!(destination = %entry.destination, action = %entry.action, "reply timed out");
            let error = Error::new(ErrorKind::ReplyTimeout).with_message(format!(
                "no reply from {} for '{}' within {:?}",
                entry.destination, entry.action, self.reply_timeout
            ));
            self.resolve(entry, Err(error));
        }
        count
    }

    fn fail_outstanding_for(&self, locality: LocalityId, error: &Error) -> usize {
        let failed = self.take_outstanding(|entry| entry.destination == locality);
        let count = failed.len();
        if count > 0 {
            warn!(%locality, count, error = %error, "failing outstanding calls");
        }
        for entry in failed {
            self.resolve(entry, Err(error.clone()));
        }
        count
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Cloneable handle to one locality's dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Creates a dispatcher for `locality`.
    ///
    /// Handlers run on `executor`. Until a parcelport is attached every
    /// remote destination is unreachable.
    #[must_use]
    pub fn new(
        locality: LocalityId,
        registry: Arc<ActionRegistry>,
        executor: SharedExecutor,
        sink: ErrorSink,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                locality,
                registry,
                executor,
                sink,
                reply_timeout,
                port: RwLock::new(None),
                outstanding: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<DispatcherInner>) -> Self {
        Self { inner }
    }

    /// Locality this dispatcher serves.
    #[must_use]
    pub fn locality(&self) -> LocalityId {
        self.inner.locality
    }

    /// The frozen action registry.
    #[must_use]
    pub fn registry(&self) -> &ActionRegistry {
        &self.inner.registry
    }

    /// The local error sink.
    #[must_use]
    pub fn error_sink(&self) -> &ErrorSink {
        &self.inner.sink
    }

    /// Configured reply timeout.
    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        self.inner.reply_timeout
    }

    /// Number of remote calls waiting for a reply.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.inner.outstanding.lock().len()
    }

    /// Routes remote traffic through `port` and installs this dispatcher as
    /// its receiver.
    pub fn attach_parcelport(&self, port: Arc<dyn Parcelport>) {
        port.set_receiver(self.receiver());
        debug!(locality = %self.inner.locality, port = port.name(), "parcelport attached");
        *self.inner.port.write() = Some(port);
    }

    /// Detaches and returns the current parcelport.
    pub fn detach_parcelport(&self) -> Option<Arc<dyn Parcelport>> {
        self.inner.port.write().take()
    }

    /// The attached parcelport, if any.
    #[must_use]
    pub fn parcelport(&self) -> Option<Arc<dyn Parcelport>> {
        self.inner.port.read().clone()
    }

    /// A receiver feeding inbound parcels into this dispatcher.
    #[must_use]
    pub fn receiver(&self) -> Arc<dyn ParcelReceiver> {
        Arc::new(DispatchReceiver {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// The poller that fails overdue remote calls.
    #[must_use]
    pub fn timeout_sweep(&self) -> ReplyTimeoutSweep {
        ReplyTimeoutSweep {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn console_forwarder(&self) -> Forwarder {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |record: &DiagnosticRecord| {
            if let Some(inner) = weak.upgrade() {
                inner.forward_to_console(record);
            }
        })
    }

    /// Invokes a typed action at `destination`.
    pub fn invoke<A: Action>(&self, destination: impl Into<Gid>, args: A::Args) -> SharedFuture<A::Output> {
        self.invoke_by_id(A::id(), destination, &args)
    }

    /// Invokes the action registered as `action`, decoding its result as `T`.
    pub fn invoke_by_id<Args, T>(
        &self,
        action: impl Into<ActionId>,
        destination: impl Into<Gid>,
        args: &Args,
    ) -> SharedFuture<T>
    where
        Args: Serialize + ?Sized,
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let promise = self.inner.watched_promise::<T>();
        let future = promise.future();
        match Payload::encode(args) {
            Ok(arguments) => self.inner.dispatch(
                action.into(),
                arguments,
                destination.into(),
                Box::new(move |result: Result<Payload>| {
                    let _ = promise.set_result(result.and_then(|payload| payload.decode_result::<T>()));
                }),
            ),
            Err(err) => {
                let _ = promise.set_error(err);
            }
        }
        future
    }

    /// Invokes `action` with already encoded arguments.
    pub fn invoke_raw(&self, action: &ActionId, arguments: Payload, destination: impl Into<Gid>) -> SharedFuture<Payload> {
        let promise = self.inner.watched_promise::<Payload>();
        let future = promise.future();
        self.inner.dispatch(
            action.clone(),
            arguments,
            destination.into(),
            Box::new(move |result: Result<Payload>| {
                let _ = promise.set_result(result);
            }),
        );
        future
    }

    /// Invokes `A` at `destination` and delivers its result to `target`
    /// instead of back to the caller.
    ///
    /// The returned `Result` covers the local enqueue only; the result, or
    /// the failure, goes to the target.
    pub fn invoke_with_continuation<A: Action>(
        &self,
        destination: impl Into<Gid>,
        args: A::Args,
        target: ContinuationTarget,
    ) -> Result<()> {
        let arguments = Payload::encode(&args)?;
        self.invoke_with_continuation_raw(&A::id(), arguments, destination, target)
    }

    /// Untyped form of [`invoke_with_continuation`](Self::invoke_with_continuation).
    pub fn invoke_with_continuation_raw(
        &self,
        action: &ActionId,
        arguments: Payload,
        destination: impl Into<Gid>,
        target: ContinuationTarget,
    ) -> Result<()> {
        self.inner
            .invoke_with_continuation(action.clone(), arguments, destination.into(), target)
    }

    /// Runs `A` at `destination` without waiting for a result; failures go
    /// to the error sink of the locality that ran it.
    pub fn apply<A: Action>(&self, destination: impl Into<Gid>, args: A::Args) -> Result<()> {
        let arguments = Payload::encode(&args)?;
        self.apply_raw(&A::id(), arguments, destination)
    }

    /// Untyped form of [`apply`](Self::apply).
    pub fn apply_raw(&self, action: &ActionId, arguments: Payload, destination: impl Into<Gid>) -> Result<()> {
        self.inner.apply(action.clone(), arguments, destination.into())
    }

    /// Processes one inbound parcel.
    pub fn handle_parcel(&self, parcel: Parcel) {
        self.inner.handle_parcel(parcel);
    }

    /// Fails every remote call whose deadline is at or before `now`.
    /// Returns how many were failed.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        self.inner.expire_overdue(now)
    }

    /// Fails every remote call outstanding to `locality` with `error`.
    pub fn fail_outstanding_for(&self, locality: LocalityId, error: &Error) -> usize {
        self.inner.fail_outstanding_for(locality, error)
    }

    /// Rejects new calls and fails every outstanding one with `Shutdown`.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let error = self.inner.shutdown_error();
        let pending = self.inner.take_outstanding(|_| true);
        debug!(locality = %self.inner.locality, pending = pending.len(), "dispatcher shutting down");
        for entry in pending {
            (entry.complete)(Err(error.clone()));
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) ran.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("locality", &self.inner.locality)
            .field("actions", &self.inner.registry.len())
            .field("outstanding", &self.outstanding_count())
            .field("reply_timeout", &self.inner.reply_timeout)
            .finish_non_exhaustive()
    }
}

struct DispatchReceiver {
    inner: Weak<DispatcherInner>,
}

impl ParcelReceiver for DispatchReceiver {
    fn receive(&self, parcel: Parcel) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_parcel(parcel);
        }
    }

    fn disconnected(&self, locality: LocalityId) {
        if let Some(inner) = self.inner.upgrade() {
            let error = Error::new(ErrorKind::ConnectionLost)
                .with_message(format!("connection to {locality} lost"));
            inner.fail_outstanding_for(locality, &error);
        }
    }

    fn receive_failed(&self, from: Option<LocalityId>, error: &TransportError) {
        if let Some(inner) = self.inner.upgrade() {
            let from = from.map_or_else(|| "unknown locality".to_string(), |l| l.to_string());
            inner.sink.report(
                &Error::new(ErrorKind::Transport)
                    .with_message(format!("undecodable parcel from {from}: {error}")),
            );
        }
    }
}

/// Pool poller failing remote calls whose reply deadline passed.
pub struct ReplyTimeoutSweep {
    inner: Weak<DispatcherInner>,
}

impl Poller for ReplyTimeoutSweep {
    fn poll(&self) -> usize {
        let Some(inner) = self.inner.upgrade() else {
            return 0;
        };
        if inner.outstanding.lock().is_empty() {
            return 0;
        }
        inner.expire_overdue(Instant::now())
    }
}

impl fmt::Debug for ReplyTimeoutSweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyTimeoutSweep").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistryBuilder;
    use crate::executor::{inline, is_worker_thread, ThreadPool};
    use crate::parcel::InProcessFabric;
    use crate::test_utils::{init_test_logging, TEST_WAIT};
    use std::sync::atomic::AtomicUsize;

    struct Add;

    impl Action for Add {
        const NAME: &'static str = "test::add";
        type Args = (i32, i32);
        type Output = i32;

        fn invoke(_ctx: &ActionContext, (a, b): (i32, i32)) -> Result<i32> {
            Ok(a + b)
        }
    }

    fn registry() -> Arc<ActionRegistry> {
        let mut builder = ActionRegistryBuilder::new();
        builder.register::<Add>().expect("add");
        builder
            .register_fn("test::fail", |_, (): ()| -> Result<()> {
                Err(Error::user("handler failed"))
            })
            .expect("fail");
        builder
            .register_async_fn("test::never", |_, (): ()| {
                let (promise, future) = promise::<u8>();
                std::mem::forget(promise);
                future
            })
            .expect("never");
        Arc::new(builder.build())
    }

    fn dispatcher(locality: u32, timeout: Duration) -> Dispatcher {
        let here = LocalityId::new(locality);
        Dispatcher::new(here, registry(), inline(), ErrorSink::new(here), timeout)
    }

    fn counting_sink(dispatcher: &Dispatcher) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        dispatcher.error_sink().register_handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn local_invocation_runs_the_handler() {
        init_test_logging();
        let d = dispatcher(1, Duration::from_secs(5));
        let sum = d.invoke::<Add>(LocalityId::new(1), (2, 3));
        assert_eq!(sum.get().expect("sum"), 5);
    }

    #[test]
    fn remote_without_parcelport_is_unreachable() {
        init_test_logging();
        let d = dispatcher(1, Duration::from_secs(5));
        let err = d
            .invoke::<Add>(LocalityId::new(9), (2, 3))
            .get()
            .expect_err("unreachable");
        assert_eq!(err.kind(), ErrorKind::LocalityUnreachable);
        assert!(err.to_string().starts_with("locality unreachable"), "{err}");
    }

    #[test]
    fn unregistered_action_fails_the_future() {
        init_test_logging();
        let d = dispatcher(1, Duration::from_secs(5));
        let err = d
            .invoke_by_id::<_, u8>("test::missing", LocalityId::new(1), &())
            .get()
            .expect_err("unregistered");
        assert_eq!(err.kind(), ErrorKind::UnregisteredAction);
    }

    #[test]
    fn abandoned_failure_reaches_the_sink_once() {
        init_test_logging();
        let fabric = InProcessFabric::new();
        let a = dispatcher(1, Duration::from_millis(10));
        let b = dispatcher(2, Duration::from_millis(10));
        a.attach_parcelport(fabric.join(LocalityId::new(1)).expect("join"));
        b.attach_parcelport(fabric.join(LocalityId::new(2)).expect("join"));
        let reports = counting_sink(&a);

        drop(a.invoke_by_id::<_, u8>("test::never", LocalityId::new(2), &()));
        assert_eq!(a.expire_overdue(Instant::now() + Duration::from_secs(1)), 1);
        assert_eq!(reports.load(Ordering::SeqCst), 1);

        let observed = a.invoke_by_id::<_, u8>("test::never", LocalityId::new(2), &());
        assert_eq!(a.expire_overdue(Instant::now() + Duration::from_secs(1)), 1);
        assert_eq!(observed.get().expect_err("timed out").kind(), ErrorKind::ReplyTimeout);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remote_round_trip_and_timeout() {
        init_test_logging();
        let fabric = InProcessFabric::new();
        let a = dispatcher(1, Duration::from_millis(50));
        let b = dispatcher(2, Duration::from_millis(50));
        a.attach_parcelport(fabric.join(LocalityId::new(1)).expect("join"));
        b.attach_parcelport(fabric.join(LocalityId::new(2)).expect("join"));

        assert_eq!(a.invoke::<Add>(LocalityId::new(2), (20, 22)).get().expect("sum"), 42);
        let err = a
            .invoke_by_id::<_, ()>("test::fail", LocalityId::new(2), &())
            .get()
            .expect_err("remote failure");
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(err.origin(), Some(LocalityId::new(2)));

        let pending = a.invoke_by_id::<_, u8>("test::never", LocalityId::new(2), &());
        assert_eq!(a.outstanding_count(), 1);
        assert_eq!(a.expire_overdue(Instant::now()), 0);
        assert_eq!(a.expire_overdue(Instant::now() + Duration::from_secs(1)), 1);
        assert_eq!(pending.get().expect_err("timeout").kind(), ErrorKind::ReplyTimeout);
    }

    #[test]
    fn disconnect_fails_outstanding_calls() {
        init_test_logging();
        let fabric = InProcessFabric::new();
        let a = dispatcher(1, Duration::from_secs(30));
        let b = dispatcher(2, Duration::from_secs(30));
        let port_a = fabric.join(LocalityId::new(1)).expect("join");
        a.attach_parcelport(port_a.clone());
        b.attach_parcelport(fabric.join(LocalityId::new(2)).expect("join"));

        let pending = a.invoke_by_id::<_, u8>("test::never", LocalityId::new(2), &());
        port_a.disconnect(LocalityId::new(2));
        assert_eq!(pending.get().expect_err("lost").kind(), ErrorKind::ConnectionLost);
        assert_eq!(a.outstanding_count(), 0);
    }

    #[test]
    fn result_of_the_wrong_type_is_a_serialization_error() {
        init_test_logging();
        let d = dispatcher(1, Duration::from_secs(5));
        let err = d
            .invoke_by_id::<_, String>("test::add", LocalityId::new(1), &(1, 2))
            .get()
            .expect_err("i32 is not a String");
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn transport_side_failures_resolve_on_the_executor() {
        init_test_logging();
        let pool = ThreadPool::with_threads(1).expect("pool");
        let here = LocalityId::new(1);
        let a = Dispatcher::new(
            here,
            registry(),
            pool.handle().executor(),
            ErrorSink::new(here),
            Duration::from_secs(30),
        );
        let b = dispatcher(2, Duration::from_secs(30));
        let fabric = InProcessFabric::new();
        let port_a = fabric.join(here).expect("join");
        a.attach_parcelport(port_a.clone());
        b.attach_parcelport(fabric.join(LocalityId::new(2)).expect("join"));
        let observe = |future: &SharedFuture<u8>| {
            future.then(|result| Ok((is_worker_thread(), result.err().map(|e| e.kind()))))
        };

        let overdue = observe(&a.invoke_by_id::<_, u8>("test::never", LocalityId::new(2), &()));
        assert_eq!(a.expire_overdue(Instant::now() + Duration::from_secs(60)), 1);
        assert_eq!(
            overdue.get_timeout(TEST_WAIT).expect("done").expect("continuation"),
            (true, Some(ErrorKind::ReplyTimeout))
        );

        let lost = observe(&a.invoke_by_id::<_, u8>("test::never", LocalityId::new(2), &()));
        port_a.disconnect(LocalityId::new(2));
        assert_eq!(
            lost.get_timeout(TEST_WAIT).expect("done").expect("continuation"),
            (true, Some(ErrorKind::ConnectionLost))
        );
        a.shutdown();
        pool.shutdown();
    }

    #[test]
    fn late_failure_reply_goes_to_the_sink() {
        init_test_logging();
        let d = dispatcher(1, Duration::from_secs(5));
        let reports = counting_sink(&d);
        d.handle_parcel(Parcel::reply(
            CorrelationId::from_raw(u64::MAX),
            LocalityId::new(2),
            LocalityId::new(1),
            ActionId::new("test::add"),
            ReplyOutcome::Failed(Error::user("late").to_remote(LocalityId::new(2))),
        ));
        d.handle_parcel(Parcel::reply(
            CorrelationId::from_raw(u64::MAX - 1),
            LocalityId::new(2),
            LocalityId::new(1),
            ActionId::new("test::add"),
            ReplyOutcome::Value(Payload::encode(&1).expect("encode")),
        ));
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_fails_pending_and_rejects_new_calls() {
        init_test_logging();
        let fabric = InProcessFabric::new();
        let a = dispatcher(1, Duration::from_secs(30));
        let b = dispatcher(2, Duration::from_secs(30));
        a.attach_parcelport(fabric.join(LocalityId::new(1)).expect("join"));
        b.attach_parcelport(fabric.join(LocalityId::new(2)).expect("join"));

        let pending = a.invoke_by_id::<_, u8>("test::never", LocalityId::new(2), &());
        a.shutdown();
        a.shutdown();
        assert!(a.is_shutdown());
        assert_eq!(pending.get().expect_err("shutdown").kind(), ErrorKind::Shutdown);
        let rejected = a.invoke::<Add>(LocalityId::new(1), (1, 1));
        assert_eq!(rejected.get().expect_err("closed").kind(), ErrorKind::Shutdown);
        assert!(a.apply::<Add>(LocalityId::new(1), (1, 1)).is_err());
    }
}
