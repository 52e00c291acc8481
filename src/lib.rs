//! parcelrt: futures, continuations and remote actions for a distributed
//! parallel runtime.
//!
//! # Overview
//!
//! Work is expressed as *actions*: named, serializable functions registered on
//! every participating process (*locality*). Invoking an action returns a
//! [`SharedFuture`] whether the action runs locally or on another locality;
//! remote invocations travel as *parcels* over a pluggable [`Parcelport`].
//! Continuations attached to a future run on an executor of the caller's
//! choosing, in attachment order.
//!
//! # Core Guarantees
//!
//! - **Single resolution**: a future becomes ready or failed exactly once
//! - **Ordered continuations**: continuations on one future run in attachment order
//! - **No silent failures**: a failure nobody observes reaches the error sink once
//! - **No crashes on remote failure**: handler errors, panics and transport loss
//!   fail the affected futures; the process keeps running
//!
//! # Module Structure
//!
//! - [`types`]: Locality, object, action and correlation identifiers
//! - [`error`]: Error types
//! - [`config`]: Runtime configuration, environment and TOML overrides
//! - [`future`]: Promises, shared futures, continuations and combinators
//! - [`executor`]: Inline executor and worker pool
//! - [`action`]: Action registry and dispatcher
//! - [`parcel`]: Parcels, frame codec, in-process and TCP parcelports
//! - [`error_sink`]: Terminal handler for unobserved failures
//! - [`event`]: Futures completed by externally polled events
//! - [`runtime`]: One locality's runtime, built and torn down as a unit

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod action;
pub mod config;
pub mod error;
pub mod error_sink;
pub mod event;
pub mod executor;
pub mod future;
pub mod parcel;
pub mod runtime;
pub(crate) mod tracing_compat;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenient access to core types
pub use action::{Action, ActionContext, ActionRegistry, ActionRegistryBuilder, Dispatcher, Payload};
pub use config::RuntimeConfig;
pub use error::{Error, ErrorCategory, ErrorKind, Recoverability, RemoteError, Result, ResultExt};
pub use error_sink::{DiagnosticRecord, ErrorSink, HandlerId};
pub use event::{EventPoller, EventStatus, EventToken};
pub use executor::{Executor, SharedExecutor, ThreadPool};
pub use future::{make_error_future, make_ready_future, promise, Promise, SharedFuture};
pub use parcel::{ContinuationTarget, InProcessFabric, Parcel, Parcelport, TcpParcelport};
pub use runtime::{Runtime, RuntimeBuilder};
pub use types::{ActionId, CorrelationId, Gid, LocalityId};
