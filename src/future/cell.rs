//! The shared completion cell behind [`Promise`] and [`SharedFuture`].
//!
//! ```text
//!   Promise ──set_value / set_error──► Cell ◄── SharedFuture (clone, clone, …)
//!                                       │
//!                       pending ───► ready(value) | failed(error)
//!                                       │
//!                              continuations (FIFO)
//!                                       │
//!                 C1 on its executor ─► C2 on its executor ─► …
//! ```
//!
//! The state tag is an atomic so `is_ready` style polls never lock. The value,
//! the continuation queue and the waker list live behind one short
//! `parking_lot::Mutex` critical section that is never held while user code
//! runs.
//!
//! Continuations are dispatched one at a time: the task that runs `C1`
//! dispatches `C2` only after `C1` returns. That gives attachment order on any
//! executor, including a multi-threaded pool, and a continuation attached
//! while the queue drains is appended behind the ones already queued.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use super::SharedFuture;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::pool::{help_current_pool, is_worker_thread};
use crate::executor::{SharedExecutor, Task};

const PENDING: u8 = 0;
const READY: u8 = 1;
const FAILED: u8 = 2;

/// How long a helping worker sleeps when the pool queue is empty.
const HELP_BACKOFF: Duration = Duration::from_micros(200);

/// Terminal value shared by every observer of a cell.
pub(crate) type Outcome<T> = Arc<Result<T>>;

/// Invoked once if a cell fails while nobody observes it.
pub type AbandonHook = Box<dyn FnOnce(&Error) + Send + 'static>;

type ContinuationFn<T> = Box<dyn FnOnce(&Result<T>) + Send + 'static>;

struct Continuation<T> {
    executor: SharedExecutor,
    run: ContinuationFn<T>,
}

struct Inner<T> {
    outcome: Option<Outcome<T>>,
    continuations: VecDeque<Continuation<T>>,
    draining: bool,
    wakers: Vec<Waker>,
    abandon_hook: Option<AbandonHook>,
}

pub(crate) struct Cell<T> {
    state: AtomicU8,
    /// Live `SharedFuture` handles.
    observers: AtomicUsize,
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T: Send + Sync + 'static> Cell<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            observers: AtomicUsize::new(0),
            inner: Mutex::new(Inner {
                outcome: None,
                continuations: VecDeque::new(),
                draining: false,
                wakers: Vec::new(),
                abandon_hook: None,
            }),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    pub(crate) fn has_value(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    pub(crate) fn has_error(&self) -> bool {
        self.state.load(Ordering::Acquire) == FAILED
    }

    pub(crate) fn outcome(&self) -> Option<Outcome<T>> {
        if !self.is_ready() {
            return None;
        }
        self.inner.lock().outcome.clone()
    }

    pub(crate) fn add_observer(&self) {
        self.observers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_observer(&self) {
        self.observers.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.observers.load(Ordering::Acquire) == 0 && self.inner.lock().continuations.is_empty()
    }

    fn set_abandon_hook(&self, hook: AbandonHook) {
        let mut inner = self.inner.lock();
        if inner.outcome.is_none() {
            inner.abandon_hook = Some(hook);
        }
    }

    /// Transitions the cell to its terminal state.
    pub(crate) fn complete(self: &Arc<Self>, result: Result<T>) -> Result<()> {
        let failure = result.as_ref().err().cloned();
        let (wakers, start_drain, hook) = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return Err(Error::new(ErrorKind::AlreadySatisfied));
            }
            let unobserved = self.observers.load(Ordering::Acquire) == 0
                && inner.continuations.is_empty();
            let hook = inner.abandon_hook.take().filter(|_| unobserved);
            inner.outcome = Some(Arc::new(result));
            self.state.store(
                if failure.is_some() { FAILED } else { READY },
                Ordering::Release,
            );
            let start_drain = !inner.continuations.is_empty() && !inner.draining;
            if start_drain {
                inner.draining = true;
            }
            (std::mem::take(&mut inner.wakers), start_drain, hook)
        };

        self.ready.notify_all();
        for waker in wakers {
            waker.wake();
        }
        if start_drain {
            self.drain();
        }
        if let (Some(hook), Some(error)) = (hook, failure) {
            hook(&error);
        }
        Ok(())
    }

    /// Queues a continuation, starting the drain if the cell is terminal and
    /// idle.
    fn push_continuation(self: &Arc<Self>, executor: SharedExecutor, run: ContinuationFn<T>) {
        let start_drain = {
            let mut inner = self.inner.lock();
            inner.continuations.push_back(Continuation { executor, run });
            let start = inner.outcome.is_some() && !inner.draining;
            if start {
                inner.draining = true;
            }
            start
        };
        if start_drain {
            self.drain();
        }
    }

    /// Dispatches the next queued continuation, or clears the draining flag.
    fn drain(self: &Arc<Self>) {
        let next = {
            let mut inner = self.inner.lock();
            let popped = match inner.outcome.clone() {
                Some(outcome) => inner.continuations.pop_front().map(|c| (c, outcome)),
                None => None,
            };
            if popped.is_none() {
                inner.draining = false;
            }
            popped
        };
        let Some((Continuation { executor, run }, outcome)) = next else {
            return;
        };

        let cell = Arc::clone(self);
        executor.execute(Task::new(move || {
            // Continuation wrappers catch their own panics; this keeps the
            // queue moving if a raw observer does not.
            let _ = catch_unwind(AssertUnwindSafe(|| run(&outcome)));
            cell.drain();
        }));
    }

    /// Registers `run` to observe the outcome on `executor`.
    pub(crate) fn observe(
        self: &Arc<Self>,
        executor: SharedExecutor,
        run: impl FnOnce(&Result<T>) + Send + 'static,
    ) {
        self.push_continuation(executor, Box::new(run));
    }

    /// Returns the outcome, or stores `waker` to be woken on completion.
    pub(crate) fn poll_outcome(&self, waker: &Waker) -> Option<Outcome<T>> {
        let mut inner = self.inner.lock();
        if let Some(outcome) = inner.outcome.clone() {
            return Some(outcome);
        }
        if !inner.wakers.iter().any(|w| w.will_wake(waker)) {
            inner.wakers.push(waker.clone());
        }
        None
    }

    /// Blocks until terminal. On a pool worker the wait runs queued tasks.
    pub(crate) fn wait(&self) -> Outcome<T> {
        loop {
            if let Some(outcome) = self.wait_step(None) {
                return outcome;
            }
        }
    }

    /// Blocks until terminal or until `timeout` elapses.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.wait_step(Some(deadline)) {
                return Some(outcome);
            }
            if Instant::now() >= deadline {
                return self.outcome();
            }
        }
    }

    fn wait_step(&self, deadline: Option<Instant>) -> Option<Outcome<T>> {
        if let Some(outcome) = self.outcome() {
            return Some(outcome);
        }
        if is_worker_thread() {
            if help_current_pool() {
                return None;
            }
            let mut inner = self.inner.lock();
            if inner.outcome.is_none() {
                let pause = deadline.map_or(HELP_BACKOFF, |d| {
                    d.saturating_duration_since(Instant::now()).min(HELP_BACKOFF)
                });
                let _ = self.ready.wait_for(&mut inner, pause);
            }
            return inner.outcome.clone();
        }

        let mut inner = self.inner.lock();
        while inner.outcome.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                None => self.ready.wait(&mut inner),
            }
        }
        inner.outcome.clone()
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            PENDING => "pending",
            READY => "ready",
            _ => "failed",
        };
        f.debug_struct("Cell")
            .field("state", &state)
            .field("observers", &self.observers.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Promise
// ---------------------------------------------------------------------------

/// The producing side of a future: completes the shared cell exactly once.
///
/// Dropping a promise that was never completed fails the cell with
/// [`ErrorKind::BrokenPromise`], so consumers never wait forever on a
/// producer that went away.
pub struct Promise<T: Send + Sync + 'static> {
    cell: Arc<Cell<T>>,
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Creates a pending promise.
    #[must_use]
    pub fn new() -> Self {
        Self { cell: Cell::new() }
    }

    /// Returns a consumer handle for this promise's cell.
    #[must_use]
    pub fn future(&self) -> SharedFuture<T> {
        SharedFuture::from_cell(Arc::clone(&self.cell))
    }

    /// Completes the cell with a value.
    ///
    /// Fails with [`ErrorKind::AlreadySatisfied`] if the cell is already
    /// terminal; the stored outcome is left untouched.
    pub fn set_value(&self, value: T) -> Result<()> {
        self.cell.complete(Ok(value))
    }

    /// Fails the cell.
    ///
    /// Fails with [`ErrorKind::AlreadySatisfied`] if the cell is already
    /// terminal.
    pub fn set_error(&self, error: Error) -> Result<()> {
        self.cell.complete(Err(error))
    }

    /// Completes the cell with either outcome.
    pub fn set_result(&self, result: Result<T>) -> Result<()> {
        self.cell.complete(result)
    }

    /// Returns true once the cell is terminal.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.cell.is_ready()
    }

    /// Returns true when no consumer handle and no continuation remain.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.cell.is_abandoned()
    }

    /// Installs a hook run once if the cell fails while unobserved.
    ///
    /// The hook is dropped without running if the cell completes while
    /// someone still observes it, or completes successfully.
    #[must_use]
    pub fn with_abandon_hook(self, hook: impl FnOnce(&Error) + Send + 'static) -> Self {
        self.cell.set_abandon_hook(Box::new(hook));
        self
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.cell.is_ready() {
            let _ = self.cell.complete(Err(Error::new(ErrorKind::BrokenPromise)
                .with_message("promise dropped before completion")));
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("cell", &self.cell).finish()
    }
}
