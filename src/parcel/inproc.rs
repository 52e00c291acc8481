//! In-process parcelport for localities sharing one address space.
//!
//! Every locality that joins an [`InProcessFabric`] gets an
//! [`InProcessParcelport`]. Sends are delivered synchronously to the
//! destination's receiver, but still pass through the frame codec, so
//! encoding limits and corrupt frames behave as they would on a socket.
//!
//! [`FaultConfig`] injects transport faults for tests: dropped parcels,
//! corrupted frames and partitions between pairs of localities.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::codec::{encode_frame, FrameDecoder, LENGTH_FIELD_LEN};
use super::{Parcel, ParcelReceiver, Parcelport, TransportError};
use crate::config::DEFAULT_MAX_FRAME_LENGTH;
use crate::error::Error;
use crate::tracing_compat::{debug, trace, warn};
use crate::types::LocalityId;

/// Fault injection controls shared by every port of a fabric.
#[derive(Debug, Default)]
pub struct FaultConfig {
    drop_next: usize,
    corrupt_next: usize,
    partitions: HashSet<(LocalityId, LocalityId)>,
    dropped: u64,
    corrupted: u64,
}

impl FaultConfig {
    fn partitioned(&self, a: LocalityId, b: LocalityId) -> bool {
        self.partitions.contains(&ordered(a, b))
    }

    /// Number of parcels silently dropped so far.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Number of frames corrupted so far.
    #[must_use]
    pub const fn corrupted(&self) -> u64 {
        self.corrupted
    }
}

fn ordered(a: LocalityId, b: LocalityId) -> (LocalityId, LocalityId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

enum Fault {
    Deliver,
    Drop,
    Corrupt,
}

struct Endpoint {
    receiver: RwLock<Option<Arc<dyn ParcelReceiver>>>,
    open: AtomicBool,
}

impl Endpoint {
    fn receiver(&self) -> Option<Arc<dyn ParcelReceiver>> {
        self.receiver.read().clone()
    }
}

struct FabricInner {
    endpoints: RwLock<HashMap<LocalityId, Arc<Endpoint>>>,
    faults: Mutex<FaultConfig>,
    max_frame_length: usize,
}

impl FabricInner {
    fn endpoint(&self, locality: LocalityId) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .get(&locality)
            .filter(|endpoint| endpoint.open.load(Ordering::Acquire))
            .cloned()
    }

    fn receivers_except(&self, locality: LocalityId) -> Vec<Arc<dyn ParcelReceiver>> {
        self.endpoints
            .read()
            .iter()
            .filter(|(id, _)| **id != locality)
            .filter_map(|(_, endpoint)| endpoint.receiver())
            .collect()
    }
}

/// A set of localities connected through shared memory.
#[derive(Clone)]
pub struct InProcessFabric {
    inner: Arc<FabricInner>,
}

impl InProcessFabric {
    /// Creates an empty fabric with the default frame limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Creates an empty fabric with a custom frame limit.
    #[must_use]
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                endpoints: RwLock::new(HashMap::new()),
                faults: Mutex::new(FaultConfig::default()),
                max_frame_length,
            }),
        }
    }

    /// Adds `locality` to the fabric and returns its parcelport.
    ///
    /// A locality can join again after its previous port shut down.
    pub fn join(&self, locality: LocalityId) -> crate::error::Result<Arc<InProcessParcelport>> {
        let endpoint = Arc::new(Endpoint {
            receiver: RwLock::new(None),
            open: AtomicBool::new(true),
        });
        {
            let mut endpoints = self.inner.endpoints.write();
            if endpoints
                .get(&locality)
                .is_some_and(|existing| existing.open.load(Ordering::Acquire))
            {
                return Err(Error::invalid_argument(format!(
                    "{locality} already joined the fabric"
                )));
            }
            endpoints.insert(locality, Arc::clone(&endpoint));
        }
        debug!(%locality, "locality joined in-process fabric");
        Ok(Arc::new(InProcessParcelport {
            locality,
            endpoint,
            fabric: Arc::clone(&self.inner),
            severed: RwLock::new(HashSet::new()),
        }))
    }

    /// Returns the localities currently joined.
    #[must_use]
    pub fn localities(&self) -> Vec<LocalityId> {
        let mut ids: Vec<_> = self
            .inner
            .endpoints
            .read()
            .iter()
            .filter(|(_, endpoint)| endpoint.open.load(Ordering::Acquire))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Silently drops the next `n` parcels sent on the fabric.
    pub fn drop_next(&self, n: usize) {
        self.inner.faults.lock().drop_next = n;
    }

    /// Corrupts the next `n` frames sent on the fabric.
    pub fn corrupt_next(&self, n: usize) {
        self.inner.faults.lock().corrupt_next = n;
    }

    /// Makes `a` and `b` unreachable from each other.
    pub fn partition(&self, a: LocalityId, b: LocalityId) {
        self.inner.faults.lock().partitions.insert(ordered(a, b));
    }

    /// Restores the link between `a` and `b`.
    pub fn heal(&self, a: LocalityId, b: LocalityId) {
        self.inner.faults.lock().partitions.remove(&ordered(a, b));
    }

    /// Clears every fault.
    pub fn heal_all(&self) {
        let mut faults = self.inner.faults.lock();
        faults.partitions.clear();
        faults.drop_next = 0;
        faults.corrupt_next = 0;
    }

    /// Returns (dropped, corrupted) counters.
    #[must_use]
    pub fn fault_counts(&self) -> (u64, u64) {
        let faults = self.inner.faults.lock();
        (faults.dropped(), faults.corrupted())
    }
}

impl Default for InProcessFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InProcessFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessFabric")
            .field("localities", &self.localities())
            .field("max_frame_length", &self.inner.max_frame_length)
            .finish_non_exhaustive()
    }
}

/// One locality's port onto an [`InProcessFabric`].
pub struct InProcessParcelport {
    locality: LocalityId,
    endpoint: Arc<Endpoint>,
    fabric: Arc<FabricInner>,
    /// Peers this port disconnected from.
    severed: RwLock<HashSet<LocalityId>>,
}

impl InProcessParcelport {
    fn route(&self, destination: LocalityId) -> Result<Arc<Endpoint>, TransportError> {
        if !self.endpoint.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.severed.read().contains(&destination)
            || self.fabric.faults.lock().partitioned(self.locality, destination)
        {
            return Err(TransportError::Unreachable(destination));
        }
        self.fabric
            .endpoint(destination)
            .ok_or(TransportError::Unreachable(destination))
    }

    fn next_fault(&self) -> Fault {
        let mut faults = self.fabric.faults.lock();
        if faults.drop_next > 0 {
            faults.drop_next -= 1;
            faults.dropped += 1;
            Fault::Drop
        } else if faults.corrupt_next > 0 {
            faults.corrupt_next -= 1;
            faults.corrupted += 1;
            Fault::Corrupt
        } else {
            Fault::Deliver
        }
    }
}

impl Parcelport for InProcessParcelport {
    fn name(&self) -> &'static str {
        "inproc"
    }

    fn locality(&self) -> LocalityId {
        self.locality
    }

    fn send(&self, parcel: Parcel) -> Result<(), TransportError> {
        let destination = parcel.destination_locality();
        let endpoint = self.route(destination)?;
        let mut frame = encode_frame(&parcel, self.fabric.max_frame_length)?;

        match self.next_fault() {
            Fault::Drop => {
                trace!(parcel = %parcel, "fault injection dropped parcel");
                return Ok(());
            }
            Fault::Corrupt => {
                // 0xc1 is never a valid MessagePack marker.
                frame[LENGTH_FIELD_LEN] = 0xc1;
            }
            Fault::Deliver => {}
        }

        let mut decoder = FrameDecoder::new(self.fabric.max_frame_length);
        decoder.extend(&frame);
        let delivered = match decoder.decode() {
            Some(Ok(delivered)) => delivered,
            Some(Err(err)) => {
                warn!(from = %self.locality, to = %destination, error = %err, "dropping corrupt frame");
                if let Some(receiver) = endpoint.receiver() {
                    receiver.receive_failed(Some(self.locality), &err);
                }
                return Err(err);
            }
            None => {
                return Err(TransportError::Corrupt {
                    details: "truncated frame".to_string(),
                })
            }
        };

        let receiver = endpoint
            .receiver()
            .ok_or(TransportError::Unreachable(destination))?;
        trace!(parcel = %delivered, "inproc deliver");
        receiver.receive(delivered);
        Ok(())
    }

    fn set_receiver(&self, receiver: Arc<dyn ParcelReceiver>) {
        *self.endpoint.receiver.write() = Some(receiver);
    }

    fn connected(&self, locality: LocalityId) -> bool {
        self.route(locality).is_ok()
    }

    fn disconnect(&self, locality: LocalityId) {
        if !self.severed.write().insert(locality) {
            return;
        }
        debug!(from = %self.locality, peer = %locality, "inproc disconnect");
        if let Some(receiver) = self.endpoint.receiver() {
            receiver.disconnected(locality);
        }
        if let Some(peer) = self.fabric.endpoint(locality).and_then(|e| e.receiver()) {
            peer.disconnected(self.locality);
        }
    }

    fn shutdown(&self) {
        if !self.endpoint.open.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut endpoints = self.fabric.endpoints.write();
            if endpoints
                .get(&self.locality)
                .is_some_and(|e| Arc::ptr_eq(e, &self.endpoint))
            {
                endpoints.remove(&self.locality);
            }
        }
        debug!(locality = %self.locality, "locality left in-process fabric");
        for receiver in self.fabric.receivers_except(self.locality) {
            receiver.disconnected(self.locality);
        }
        self.endpoint.receiver.write().take();
    }
}

impl Drop for InProcessParcelport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for InProcessParcelport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessParcelport")
            .field("locality", &self.locality)
            .field("open", &self.endpoint.open.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
