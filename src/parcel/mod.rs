//! Parcels and the transports that carry them between localities.
//!
//! A [`Parcel`] is the envelope for one invocation or one reply. Parcelports
//! move parcels between localities and hand inbound ones to a
//! [`ParcelReceiver`], normally the dispatcher.
//!
//! Two parcelports ship with the crate:
//!
//! - [`InProcessFabric`] connects localities living in one process and
//!   supports fault injection for tests.
//! - [`TcpParcelport`] connects localities over TCP.
//!
//! Both frame every parcel with the codec in [`codec`].

pub mod codec;
mod error;
mod inproc;
mod port;
mod tcp;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use error::TransportError;
pub use inproc::{FaultConfig, InProcessFabric, InProcessParcelport};
pub use port::Parcelport;
pub use tcp::TcpParcelport;

use crate::action::Payload;
use crate::error::RemoteError;
use crate::types::{ActionId, CorrelationId, Gid, LocalityId};

/// What a parcel asks of its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParcelKind {
    /// Run an action and send the result back (or to the continuation target).
    Request,
    /// Run an action; nobody waits for the result.
    Apply,
    /// The result of an earlier request.
    Reply,
}

/// Where a transferred continuation delivers its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationTarget {
    /// Object the continuation action runs against.
    pub destination: Gid,
    /// Action invoked with the result as its argument.
    pub action: ActionId,
}

impl ContinuationTarget {
    /// Creates a target running `action` at `destination`.
    pub fn new(destination: impl Into<Gid>, action: impl Into<ActionId>) -> Self {
        Self {
            destination: destination.into(),
            action: action.into(),
        }
    }

    /// Locality the result is delivered to.
    #[must_use]
    pub const fn locality(&self) -> LocalityId {
        self.destination.locality()
    }
}

/// Terminal outcome carried by a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyOutcome {
    /// The handler produced a value.
    Value(Payload),
    /// The handler, or the dispatch itself, failed.
    Failed(RemoteError),
}

/// Envelope for one invocation or reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parcel {
    /// Request, apply or reply.
    pub kind: ParcelKind,
    /// Pairs a reply with its request.
    pub correlation: CorrelationId,
    /// Locality that sent the parcel.
    pub source: LocalityId,
    /// Object the parcel is addressed to.
    pub destination: Gid,
    /// Action to run, or the action a reply answers.
    pub action: ActionId,
    /// Encoded arguments; empty for replies.
    pub arguments: Payload,
    /// Transferred continuation, requests only.
    pub continuation: Option<ContinuationTarget>,
    /// Result, replies only.
    pub outcome: Option<ReplyOutcome>,
}

impl Parcel {
    /// Builds a request parcel.
    #[must_use]
    pub fn request(
        correlation: CorrelationId,
        source: LocalityId,
        destination: Gid,
        action: ActionId,
        arguments: Payload,
        continuation: Option<ContinuationTarget>,
    ) -> Self {
        Self {
            kind: ParcelKind::Request,
            correlation,
            source,
            destination,
            action,
            arguments,
            continuation,
            outcome: None,
        }
    }

    /// Builds a fire-and-forget parcel.
    #[must_use]
    pub fn apply(source: LocalityId, destination: Gid, action: ActionId, arguments: Payload) -> Self {
        Self {
            kind: ParcelKind::Apply,
            correlation: CorrelationId::next(),
            source,
            destination,
            action,
            arguments,
            continuation: None,
            outcome: None,
        }
    }

    /// Builds a reply to request `correlation`, sent from `source` back to
    /// the requesting locality `to`.
    #[must_use]
    pub fn reply(
        correlation: CorrelationId,
        source: LocalityId,
        to: LocalityId,
        action: ActionId,
        outcome: ReplyOutcome,
    ) -> Self {
        Self {
            kind: ParcelKind::Reply,
            correlation,
            source,
            destination: Gid::locality_root(to),
            action,
            arguments: Payload::default(),
            continuation: None,
            outcome: Some(outcome),
        }
    }

    /// Builds the reply to `request`, sent from `here`.
    #[must_use]
    pub fn reply_to(request: &Self, here: LocalityId, outcome: ReplyOutcome) -> Self {
        Self::reply(
            request.correlation,
            here,
            request.source,
            request.action.clone(),
            outcome,
        )
    }

    /// Locality the parcel is addressed to.
    #[must_use]
    pub const fn destination_locality(&self) -> LocalityId {
        self.destination.locality()
    }
}

impl fmt::Display for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} #{} {} -> {} '{}'",
            self.kind,
            self.correlation.raw(),
            self.source,
            self.destination,
            self.action
        )
    }
}

/// Consumer of inbound parcels and connection events.
///
/// Parcelports call into the receiver from their own threads; implementations
/// must not block for long.
pub trait ParcelReceiver: Send + Sync {
    /// A parcel arrived.
    fn receive(&self, parcel: Parcel);

    /// The connection to `locality` is gone; nothing more will arrive from it.
    fn disconnected(&self, locality: LocalityId);

    /// A frame from `from` could not be decoded. The frame is skipped; the
    /// connection stays up.
    fn receive_failed(&self, from: Option<LocalityId>, error: &TransportError);
}
