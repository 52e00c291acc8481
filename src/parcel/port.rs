//! The parcelport abstraction.

use std::sync::Arc;

use super::{Parcel, ParcelReceiver, TransportError};
use crate::types::LocalityId;

/// A transport moving parcels between localities.
///
/// `send` is fire-and-forget: `Ok` means the parcel was handed to the
/// transport, not that it arrived. Loss after that point shows up as a
/// disconnect or as a reply timeout in the dispatcher.
pub trait Parcelport: Send + Sync {
    /// Short transport name used in logs.
    fn name(&self) -> &'static str;

    /// Locality this parcelport sends from.
    fn locality(&self) -> LocalityId;

    /// Sends `parcel` to its destination locality.
    fn send(&self, parcel: Parcel) -> Result<(), TransportError>;

    /// Installs the consumer of inbound parcels, replacing any previous one.
    fn set_receiver(&self, receiver: Arc<dyn ParcelReceiver>);

    /// Returns true if parcels can currently be sent to `locality`.
    fn connected(&self, locality: LocalityId) -> bool;

    /// Drops the connection to `locality`.
    fn disconnect(&self, locality: LocalityId);

    /// Closes every connection and stops background threads. Idempotent.
    fn shutdown(&self);
}
