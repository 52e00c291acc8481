//! Single-assignment futures with ordered continuations.
//!
//! A [`Promise`] is the producing side; any number of [`SharedFuture`]
//! handles observe the same outcome. An outcome is written exactly once:
//! either a value or an [`Error`]. After that it never changes.
//!
//! ```
//! use parcelrt::future::promise;
//!
//! let (p, f) = promise::<u32>();
//! let doubled = f.map(|v| v * 2);
//! p.set_value(21).unwrap();
//! assert_eq!(doubled.get().unwrap(), 42);
//! ```
//!
//! Groups of futures are combined with the functions in [`combinator`].

mod cell;
pub mod combinator;
mod shared;

pub use cell::{AbandonHook, Promise};
pub use combinator::{wait_all, wait_any, when_all, when_all2, when_any, WhenAnyResult};
pub use shared::SharedFuture;

use crate::error::Error;

/// Creates a pending promise together with its first consumer handle.
#[must_use]
pub fn promise<T: Send + Sync + 'static>() -> (Promise<T>, SharedFuture<T>) {
    let promise = Promise::new();
    let future = promise.future();
    (promise, future)
}

/// Returns a future that is already ready with `value`.
#[must_use]
pub fn make_ready_future<T: Send + Sync + 'static>(value: T) -> SharedFuture<T> {
    let promise = Promise::new();
    let future = promise.future();
    let _ = promise.set_value(value);
    future
}

/// Returns a future that has already failed with `error`.
#[must_use]
pub fn make_error_future<T: Send + Sync + 'static>(error: Error) -> SharedFuture<T> {
    let promise = Promise::new();
    let future = promise.future();
    let _ = promise.set_error(error);
    future
}
