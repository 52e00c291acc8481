//! The consuming side of a future.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use super::cell::Cell;
use super::Promise;
use crate::error::{Error, Result};
use crate::executor::{inline, SharedExecutor};

/// A cloneable, read-only handle to a completion cell.
///
/// Every clone observes the same outcome. Reading never consumes: `get`
/// clones the stored value out, so `T: Clone` is required for reads and
/// continuations.
///
/// Continuations (`then`, `map`, `and_then`) never mutate this future; each
/// returns a new derived future that completes with the continuation's result.
/// An `Err` returned by, or a panic raised in, a continuation fails only the
/// derived future.
pub struct SharedFuture<T: Send + Sync + 'static> {
    cell: Arc<Cell<T>>,
}

impl<T: Send + Sync + 'static> SharedFuture<T> {
    pub(crate) fn from_cell(cell: Arc<Cell<T>>) -> Self {
        cell.add_observer();
        Self { cell }
    }

    /// Returns true once the future is ready or failed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.cell.is_ready()
    }

    /// Returns true if the future completed with a value.
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.cell.has_value()
    }

    /// Returns true if the future failed.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.cell.has_error()
    }

    /// Returns the error if the future failed, without cloning the value.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        self.cell
            .outcome()
            .and_then(|outcome| outcome.as_ref().as_ref().err().cloned())
    }

    /// Blocks until the future is terminal.
    ///
    /// On a pool worker the wait runs queued tasks instead of parking.
    pub fn wait(&self) {
        let _ = self.cell.wait();
    }

    /// Blocks until the future is terminal or `timeout` elapses. Returns true
    /// if the future is terminal.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.cell.wait_timeout(timeout).is_some()
    }

    /// Runs `f` with a reference to the outcome once the future is terminal.
    ///
    /// `f` runs inline on the completing thread (or immediately, if already
    /// terminal). Unlike [`then`](Self::then) no derived future is created.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        self.cell.observe(inline(), f);
    }
}

impl<T: Clone + Send + Sync + 'static> SharedFuture<T> {
    /// Non-blocking read: `None` while pending.
    #[must_use]
    pub fn try_get(&self) -> Option<Result<T>> {
        self.cell.outcome().map(|outcome| (*outcome).clone())
    }

    /// Blocking read.
    ///
    /// On a pool worker the wait runs queued tasks instead of parking the
    /// thread.
    pub fn get(&self) -> Result<T> {
        (*self.cell.wait()).clone()
    }

    /// Blocking read with a timeout: `None` if still pending after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        self.cell
            .wait_timeout(timeout)
            .map(|outcome| (*outcome).clone())
    }

    /// Attaches a continuation run inline on the completing thread.
    ///
    /// If the future is already terminal the continuation is scheduled
    /// immediately. Continuations attached to one future run in attachment
    /// order.
    pub fn then<U, F>(&self, f: F) -> SharedFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(Result<T>) -> Result<U> + Send + 'static,
    {
        self.then_on(&inline(), f)
    }

    /// Attaches a continuation resumed on `executor`.
    pub fn then_on<U, F>(&self, executor: &SharedExecutor, f: F) -> SharedFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(Result<T>) -> Result<U> + Send + 'static,
    {
        let promise = Promise::new();
        let derived = promise.future();
        self.cell.observe(Arc::clone(executor), move |outcome| {
            let input = outcome.clone();
            let result = catch_unwind(AssertUnwindSafe(move || f(input)))
                .unwrap_or_else(|payload| Err(Error::from_panic(payload.as_ref())));
            let _ = promise.set_result(result);
        });
        derived
    }

    /// Maps the value; failures propagate without invoking `f`.
    pub fn map<U, F>(&self, f: F) -> SharedFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then(move |result| result.map(f))
    }

    /// Chains a fallible step; failures propagate without invoking `f`.
    pub fn and_then<U, F>(&self, f: F) -> SharedFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        self.then(move |result| result.and_then(f))
    }

    /// Recovers from a failure; values pass through untouched.
    pub fn or_else<F>(&self, f: F) -> SharedFuture<T>
    where
        F: FnOnce(Error) -> Result<T> + Send + 'static,
    {
        self.then(move |result| result.or_else(f))
    }
}

impl<T: Send + Sync + 'static> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self::from_cell(Arc::clone(&self.cell))
    }
}

impl<T: Send + Sync + 'static> Drop for SharedFuture<T> {
    fn drop(&mut self) {
        self.cell.remove_observer();
    }
}

impl<T: Clone + Send + Sync + 'static> Future for SharedFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.cell.poll_outcome(cx.waker()) {
            Some(outcome) => Poll::Ready((*outcome).clone()),
            None => Poll::Pending,
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for SharedFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFuture")
            .field("cell", &self.cell)
            .finish()
    }
}
