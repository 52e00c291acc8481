//! Error types and error handling strategy for parcelrt.
//!
//! This module defines the error type shared by futures, the dispatcher, the
//! parcel layer, and the error sink. Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - A failure is a value: it lands in a future, never aborts the process
//! - Panics in handlers and continuations are caught and become `Panicked`
//! - Errors survive a trip across localities with kind and cause chain intact
//!
//! # Error Categories
//!
//! - **Invocation**: the call could not be issued (unknown action, bad args)
//! - **Serialization**: a payload could not be encoded or decoded
//! - **Transport**: the destination could not be reached or stopped answering
//! - **Execution**: the handler or continuation itself failed
//! - **Lifecycle**: promise misuse, shutdown, external events, configuration
//! - **Internal**: runtime bugs and invalid states
//!
//! # Wire form
//!
//! [`Error`] carries an arbitrary `source` which cannot cross a process
//! boundary. [`RemoteError`] is its serializable projection: kind, message,
//! origin locality, and the rendered cause chain. [`Error::from_remote`]
//! rebuilds an `Error` whose `source()` chain yields the same messages.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

use crate::types::LocalityId;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    // === Invocation ===
    /// No handler is registered under the requested action id.
    UnregisteredAction,
    /// Arguments do not match what the handler expects.
    ArgumentMismatch,
    /// Two actions were registered under the same id.
    ActionIdCollision,
    /// A caller-supplied argument is invalid (for example an empty input set).
    InvalidArgument,

    // === Serialization ===
    /// A payload could not be serialized or deserialized.
    Serialization,

    // === Transport ===
    /// No connection exists to the destination locality.
    LocalityUnreachable,
    /// The connection to the destination dropped while a call was in flight.
    ConnectionLost,
    /// No reply arrived before the reply deadline.
    ReplyTimeout,
    /// Any other transport failure (corrupt frame, oversized frame, I/O).
    Transport,

    // === Execution ===
    /// A remote handler failed without a more specific kind.
    Remote,
    /// A user handler or continuation returned an error.
    User,
    /// A handler, continuation, or predicate panicked.
    Panicked,

    // === Lifecycle ===
    /// A promise was completed more than once.
    AlreadySatisfied,
    /// A promise was dropped without ever being completed.
    BrokenPromise,
    /// The runtime shut down before the operation finished.
    Shutdown,
    /// An externally polled event reported failure.
    ExternalEvent,
    /// Configuration could not be parsed or is invalid.
    Config,

    // === Internal ===
    /// Internal runtime error (bug).
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::UnregisteredAction
            | Self::ArgumentMismatch
            | Self::ActionIdCollision
            | Self::InvalidArgument => ErrorCategory::Invocation,
            Self::Serialization => ErrorCategory::Serialization,
            Self::LocalityUnreachable
            | Self::ConnectionLost
            | Self::ReplyTimeout
            | Self::Transport => ErrorCategory::Transport,
            Self::Remote | Self::User | Self::Panicked => ErrorCategory::Execution,
            Self::AlreadySatisfied
            | Self::BrokenPromise
            | Self::Shutdown
            | Self::ExternalEvent
            | Self::Config => ErrorCategory::Lifecycle,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns the recoverability classification for this error kind.
    ///
    /// This helps retry logic decide whether to re-issue an invocation.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::ConnectionLost | Self::ReplyTimeout | Self::LocalityUnreachable => {
                Recoverability::Transient
            }

            Self::UnregisteredAction
            | Self::ArgumentMismatch
            | Self::ActionIdCollision
            | Self::InvalidArgument
            | Self::Serialization
            | Self::AlreadySatisfied
            | Self::Shutdown
            | Self::Config
            | Self::Internal => Recoverability::Permanent,

            Self::Transport
            | Self::Remote
            | Self::User
            | Self::Panicked
            | Self::BrokenPromise
            | Self::ExternalEvent => Recoverability::Unknown,
        }
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.recoverability(), Recoverability::Transient)
    }

    /// Short human-readable description, used as the `Display` form.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::UnregisteredAction => "unregistered action",
            Self::ArgumentMismatch => "argument mismatch",
            Self::ActionIdCollision => "action id collision",
            Self::InvalidArgument => "invalid argument",
            Self::Serialization => "non-serializable payload",
            Self::LocalityUnreachable => "locality unreachable",
            Self::ConnectionLost => "connection lost",
            Self::ReplyTimeout => "reply timeout",
            Self::Transport => "transport failure",
            Self::Remote => "remote failure",
            Self::User => "user error",
            Self::Panicked => "panicked",
            Self::AlreadySatisfied => "already satisfied",
            Self::BrokenPromise => "broken promise",
            Self::Shutdown => "runtime shut down",
            Self::ExternalEvent => "external event failed",
            Self::Config => "invalid configuration",
            Self::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Classification of error recoverability for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure that may succeed on retry.
    Transient,
    /// Permanent failure that will not succeed on retry.
    Permanent,
    /// Recoverability depends on context and cannot be determined
    /// from the error kind alone.
    Unknown,
}

impl Recoverability {
    /// Returns true if this error is safe to retry.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns true if this error should never be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent)
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The invocation could not be issued.
    Invocation,
    /// Payload encoding or decoding failures.
    Serialization,
    /// Transport-layer failures.
    Transport,
    /// Handler or continuation failures.
    Execution,
    /// Promise, runtime, and configuration lifecycle failures.
    Lifecycle,
    /// Internal runtime errors.
    Internal,
}

/// The main error type for parcelrt operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    origin: Option<LocalityId>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            origin: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Records the locality where the failure was raised.
    #[must_use]
    pub const fn with_origin(mut self, origin: LocalityId) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the recoverability classification.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        self.kind.recoverability()
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the locality where the failure was raised, if known.
    #[must_use]
    pub const fn origin(&self) -> Option<LocalityId> {
        self.origin
    }

    /// Returns true if this is a transport-related error.
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(self.kind.category(), ErrorCategory::Transport)
    }

    /// Returns true if the error was raised on another locality than `here`.
    #[must_use]
    pub fn is_remote_to(&self, here: LocalityId) -> bool {
        self.origin.is_some_and(|origin| origin != here)
    }

    /// Renders the `source()` chain, outermost first.
    #[must_use]
    pub fn cause_chain(&self) -> Vec<String> {
        let mut causes = Vec::new();
        let mut next = std::error::Error::source(self);
        while let Some(cause) = next {
            causes.push(cause.to_string());
            next = cause.source();
        }
        causes
    }

    /// Projects this error into its serializable wire form.
    ///
    /// `here` is recorded as the origin when the error does not already carry
    /// one.
    #[must_use]
    pub fn to_remote(&self, here: LocalityId) -> RemoteError {
        RemoteError {
            kind: self.kind,
            message: self.message.clone(),
            origin: self.origin.unwrap_or(here),
            causes: self.cause_chain(),
        }
    }

    /// Rebuilds an error received from another locality.
    #[must_use]
    pub fn from_remote(remote: RemoteError) -> Self {
        let source = remote
            .causes
            .into_iter()
            .rev()
            .fold(None, |next: Option<RemoteCause>, message| {
                Some(RemoteCause {
                    message,
                    next: next.map(Box::new),
                })
            });
        Self {
            kind: remote.kind,
            message: remote.message,
            source: source
                .map(|cause| Arc::new(cause) as Arc<dyn std::error::Error + Send + Sync>),
            origin: Some(remote.origin),
        }
    }

    /// Creates an unregistered-action error.
    #[must_use]
    pub fn unregistered_action(action: impl fmt::Display) -> Self {
        Self::new(ErrorKind::UnregisteredAction).with_message(format!("no handler for '{action}'"))
    }

    /// Creates a locality-unreachable error.
    #[must_use]
    pub fn locality_unreachable(locality: LocalityId) -> Self {
        Self::new(ErrorKind::LocalityUnreachable)
            .with_message(format!("no connection to {locality}"))
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization).with_message(detail)
    }

    /// Creates a user error with a message.
    #[must_use]
    pub fn user(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_message(detail)
    }

    /// Creates a panicked error carrying the panic message.
    #[must_use]
    pub fn panicked(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Panicked).with_message(detail)
    }

    /// Creates an error from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::panicked(panic_message(payload))
    }

    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument).with_message(detail)
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_message(detail)
    }

    /// Creates an internal error (runtime bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Extracts the message of a caught panic.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// Serializable form of an [`Error`], carried by reply parcels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Kind of the original error.
    pub kind: ErrorKind,
    /// Message of the original error.
    pub message: Option<String>,
    /// Locality that raised the error.
    pub origin: LocalityId,
    /// Rendered cause chain, outermost first.
    pub causes: Vec<String>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.kind, self.origin)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl From<RemoteError> for Error {
    fn from(remote: RemoteError) -> Self {
        Self::from_remote(remote)
    }
}

#[derive(Debug)]
struct RemoteCause {
    message: String,
    next: Option<Box<RemoteCause>>,
}

impl fmt::Display for RemoteCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.next.as_deref().map(|c| c as _)
    }
}

/// Extension trait for adding context to Results.
#[allow(clippy::result_large_err)]
pub trait ResultExt<T> {
    /// Attach a context message on error.
    fn context(self, msg: impl Into<String>) -> Result<T>;
    /// Attach context message computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_message(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_message(f()))
    }
}

/// A specialized Result type for parcelrt operations.
#[allow(clippy::result_large_err)]
pub type Result<T> = core::result::Result<T, Error>;
