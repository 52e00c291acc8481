//! TCP parcelport.
//!
//! Plain `std::net` sockets with one background thread per connection; no
//! async runtime is involved. A connection starts with a 4-byte big-endian
//! handshake carrying the dialing locality's id, after which both directions
//! carry frames from [`codec`](super::codec). An inbound handshake is read
//! on the connection's own thread, so a silent client never stalls the
//! listener.
//!
//! Connections are dialed lazily on the first send to a peer added with
//! [`TcpParcelport::add_peer`]. An accepted connection is reused for sends
//! back to the peer that dialed it, so replies need no reverse address.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::codec::{encode_frame, FrameDecoder, LENGTH_FIELD_LEN};
use super::{Parcel, ParcelReceiver, Parcelport, TransportError};
use crate::tracing_compat::{debug, trace, warn};
use crate::types::LocalityId;

const READ_CHUNK: usize = 16 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

struct Connection {
    id: u64,
    peer: LocalityId,
    writer: Mutex<TcpStream>,
}

impl Connection {
    fn close(&self) {
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }
}

struct TcpInner {
    locality: LocalityId,
    local_addr: SocketAddr,
    max_frame_length: usize,
    peers: RwLock<HashMap<LocalityId, SocketAddr>>,
    /// Send path per peer.
    connections: RwLock<HashMap<LocalityId, Arc<Connection>>>,
    /// Every open socket, including accepted ones that are not a send path.
    sockets: Mutex<Vec<Arc<Connection>>>,
    receiver: RwLock<Option<Arc<dyn ParcelReceiver>>>,
    /// Serializes dials so two senders never race to open the same peer.
    dial: Mutex<()>,
    closed: AtomicBool,
    next_connection: AtomicU64,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    /// Live connection threads by connection id; each removes itself on exit.
    readers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl TcpInner {
    fn receiver(&self) -> Option<Arc<dyn ParcelReceiver>> {
        self.receiver.read().clone()
    }

    fn connection(&self, peer: LocalityId) -> Option<Arc<Connection>> {
        self.connections.read().get(&peer).cloned()
    }

    fn connect(self: &Arc<Self>, peer: LocalityId) -> Result<Arc<Connection>, TransportError> {
        if let Some(conn) = self.connection(peer) {
            return Ok(conn);
        }
        let _dial = self.dial.lock();
        if let Some(conn) = self.connection(peer) {
            return Ok(conn);
        }
        let addr = self
            .peers
            .read()
            .get(&peer)
            .copied()
            .ok_or(TransportError::Unreachable(peer))?;

        let mut stream = TcpStream::connect(addr).map_err(|err| {
            debug!(%peer, %addr, error = %err, "tcp dial failed");
            TransportError::Unreachable(peer)
        })?;
        stream.set_nodelay(true)?;
        stream.write_all(&self.locality.raw().to_be_bytes())?;
        debug!(%peer, %addr, "tcp connection dialed");

        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (send_path, conn, reader) = self.open(id, peer, stream, true)?;
        let reading = Arc::clone(&conn);
        let spawned = self.spawn_connection_thread(id, format!("parcelrt-tcp-{}", peer.raw()), move |inner| {
            inner.read_loop(reader, &reading);
        });
        if let Err(err) = spawned {
            self.forget(&conn);
            return Err(err);
        }
        Ok(send_path)
    }

    /// Registers `stream` and, if `replace` or no connection to `peer` exists
    /// yet, makes it the send path to `peer`. Returns the send path, the new
    /// connection and its read half.
    fn open(
        &self,
        id: u64,
        peer: LocalityId,
        stream: TcpStream,
        replace: bool,
    ) -> Result<(Arc<Connection>, Arc<Connection>, TcpStream), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(TransportError::Closed);
        }
        let reader = stream.try_clone()?;
        let conn = Arc::new(Connection {
            id,
            peer,
            writer: Mutex::new(stream),
        });
        self.sockets.lock().push(Arc::clone(&conn));
        let send_path = {
            let mut connections = self.connections.write();
            match connections.get(&peer) {
                Some(existing) if !replace => Arc::clone(existing),
                _ => {
                    connections.insert(peer, Arc::clone(&conn));
                    Arc::clone(&conn)
                }
            }
        };
        Ok((send_path, conn, reader))
    }

    /// Runs `body` on a thread tracked under `id` until it returns.
    fn spawn_connection_thread<F>(self: &Arc<Self>, id: u64, name: String, body: F) -> Result<(), TransportError>
    where
        F: FnOnce(&Arc<Self>) + Send + 'static,
    {
        let inner = Arc::clone(self);
        // Held across the spawn: the thread's own removal waits for the insert.
        let mut readers = self.readers.lock();
        let handle = thread::Builder::new().name(name).spawn(move || {
            body(&inner);
            inner.readers.lock().remove(&id);
        })?;
        readers.insert(id, handle);
        Ok(())
    }

    fn read_loop(&self, mut stream: TcpStream, conn: &Arc<Connection>) {
        let peer = conn.peer;
        let mut decoder = FrameDecoder::new(self.max_frame_length);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let read = match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !self.closed.load(Ordering::Acquire) {
                        debug!(%peer, error = %err, "tcp read failed");
                    }
                    break;
                }
            };
            decoder.extend(&chunk[..read]);
            while let Some(result) = decoder.decode() {
                match result {
                    Ok(parcel) => {
                        trace!(parcel = %parcel, "tcp receive");
                        if let Some(receiver) = self.receiver() {
                            receiver.receive(parcel);
                        }
                    }
                    Err(err) => {
                        warn!(%peer, error = %err, "dropping undecodable frame");
                        if let Some(receiver) = self.receiver() {
                            receiver.receive_failed(Some(peer), &err);
                        }
                    }
                }
            }
        }
        self.lost(conn);
    }

    /// Closes `conn` and drops it from the tables. Returns true if it was the
    /// send path to its peer.
    fn forget(&self, conn: &Arc<Connection>) -> bool {
        conn.close();
        self.sockets.lock().retain(|c| !Arc::ptr_eq(c, conn));
        let mut connections = self.connections.write();
        let current = connections
            .get(&conn.peer)
            .is_some_and(|c| Arc::ptr_eq(c, conn));
        if current {
            connections.remove(&conn.peer);
        }
        current
    }

    /// Forgets `conn` and, if it was the send path to its peer, reports the
    /// disconnect.
    fn lost(&self, conn: &Arc<Connection>) {
        if self.forget(conn) && !self.closed.load(Ordering::Acquire) {
            warn!(peer = %conn.peer, connection = conn.id, "tcp connection lost");
            if let Some(receiver) = self.receiver() {
                receiver.disconnected(conn.peer);
            }
        }
    }

    fn accept_loop(self: &Arc<Self>, listener: &TcpListener) {
        for stream in listener.incoming() {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            match stream {
                Ok(stream) => {
                    if let Err(err) = self.accept(stream) {
                        debug!(error = %err, "rejected inbound tcp connection");
                    }
                }
                Err(err) => {
                    if self.closed.load(Ordering::Acquire) {
                        break;
                    }
                    debug!(error = %err, "tcp accept failed");
                }
            }
        }
    }

    fn accept(self: &Arc<Self>, stream: TcpStream) -> Result<(), TransportError> {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.spawn_connection_thread(id, format!("parcelrt-tcp-in-{id}"), move |inner| {
            match inner.handshake(id, stream) {
                Ok((conn, reader)) => inner.read_loop(reader, &conn),
                Err(err) => debug!(connection = id, error = %err, "inbound tcp handshake failed"),
            }
        })
    }

    fn handshake(&self, id: u64, mut stream: TcpStream) -> Result<(Arc<Connection>, TcpStream), TransportError> {
        let mut handshake = [0u8; LENGTH_FIELD_LEN];
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.read_exact(&mut handshake)?;
        stream.set_read_timeout(None)?;
        stream.set_nodelay(true)?;
        let peer = LocalityId::new(u32::from_be_bytes(handshake));
        debug!(%peer, connection = id, "tcp connection accepted");
        let (_, conn, reader) = self.open(id, peer, stream, false)?;
        Ok((conn, reader))
    }
}

/// Parcelport over TCP.
pub struct TcpParcelport {
    inner: Arc<TcpInner>,
}

impl TcpParcelport {
    /// Binds a listener for `locality` on `addr` and starts accepting.
    pub fn bind(
        locality: LocalityId,
        addr: impl ToSocketAddrs,
        max_frame_length: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let inner = Arc::new(TcpInner {
            locality,
            local_addr,
            max_frame_length,
            peers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            sockets: Mutex::new(Vec::new()),
            receiver: RwLock::new(None),
            dial: Mutex::new(()),
            closed: AtomicBool::new(false),
            next_connection: AtomicU64::new(1),
            acceptor: Mutex::new(None),
            readers: Mutex::new(HashMap::new()),
        });

        let accepting = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("parcelrt-tcp-accept-{}", locality.raw()))
            .spawn(move || accepting.accept_loop(&listener))?;
        *inner.acceptor.lock() = Some(handle);
        debug!(%locality, %local_addr, "tcp parcelport listening");
        Ok(Self { inner })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Registers the address of `locality`.
    pub fn add_peer(&self, locality: LocalityId, addr: SocketAddr) {
        self.inner.peers.write().insert(locality, addr);
    }

    /// Returns the number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Returns the number of running connection threads.
    #[must_use]
    pub fn connection_threads(&self) -> usize {
        self.inner.readers.lock().len()
    }
}

impl Parcelport for TcpParcelport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn locality(&self) -> LocalityId {
        self.inner.locality
    }

    fn send(&self, parcel: Parcel) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let peer = parcel.destination_locality();
        let frame = encode_frame(&parcel, self.inner.max_frame_length)?;
        let conn = self.inner.connect(peer)?;
        trace!(parcel = %parcel, "tcp send");
        let written = conn.writer.lock().write_all(&frame);
        if let Err(err) = written {
            debug!(%peer, error = %err, "tcp write failed");
            self.inner.lost(&conn);
            return Err(TransportError::ConnectionLost(peer));
        }
        Ok(())
    }

    fn set_receiver(&self, receiver: Arc<dyn ParcelReceiver>) {
        *self.inner.receiver.write() = Some(receiver);
    }

    fn connected(&self, locality: LocalityId) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
            && (self.inner.connections.read().contains_key(&locality)
                || self.inner.peers.read().contains_key(&locality))
    }

    fn disconnect(&self, locality: LocalityId) {
        let conn = self.inner.connections.write().remove(&locality);
        if let Some(conn) = conn {
            conn.close();
            debug!(peer = %locality, "tcp disconnect");
            if let Some(receiver) = self.inner.receiver() {
                receiver.disconnected(locality);
            }
        }
    }

    fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.connections.write().clear();
        let sockets: Vec<_> = self.inner.sockets.lock().drain(..).collect();
        for conn in sockets {
            conn.close();
        }
        // Wake the accept loop so it observes the closed flag.
        let _ = TcpStream::connect(self.inner.local_addr);

        let current = thread::current().id();
        let mut handles: Vec<JoinHandle<()>> = self.inner.acceptor.lock().take().into_iter().collect();
        handles.extend(self.inner.readers.lock().drain().map(|(_, handle)| handle));
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        debug!(locality = %self.inner.locality, "tcp parcelport shut down");
    }
}

impl Drop for TcpParcelport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TcpParcelport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpParcelport")
            .field("locality", &self.inner.locality)
            .field("local_addr", &self.inner.local_addr)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Payload;
    use crate::test_utils::{init_test_logging, wait_until};
    use crate::types::{ActionId, CorrelationId, Gid};

    #[derive(Default)]
    struct Recorder {
        parcels: Mutex<Vec<Parcel>>,
        disconnects: Mutex<Vec<LocalityId>>,
    }

    impl ParcelReceiver for Recorder {
        fn receive(&self, parcel: Parcel) {
            self.parcels.lock().push(parcel);
        }
        fn disconnected(&self, locality: LocalityId) {
            self.disconnects.lock().push(locality);
        }
        fn receive_failed(&self, _from: Option<LocalityId>, _error: &TransportError) {}
    }

    fn request(from: u32, to: u32, n: u64) -> Parcel {
        Parcel::request(
            CorrelationId::from_raw(n),
            LocalityId::new(from),
            Gid::locality_root(LocalityId::new(to)),
            ActionId::new("ping"),
            Payload::encode(&n).expect("encode"),
            None,
        )
    }

    #[test]
    fn round_trip_over_loopback() {
        init_test_logging();
        let a = TcpParcelport::bind(LocalityId::new(1), "127.0.0.1:0", 1 << 20).expect("bind a");
        let b = TcpParcelport::bind(LocalityId::new(2), "127.0.0.1:0", 1 << 20).expect("bind b");
        let ra = Arc::new(Recorder::default());
        let rb = Arc::new(Recorder::default());
        a.set_receiver(ra.clone());
        b.set_receiver(rb.clone());
        a.add_peer(LocalityId::new(2), b.local_addr());

        a.send(request(1, 2, 1)).expect("send");
        assert!(wait_until(|| rb.parcels.lock().len() == 1));
        assert_eq!(rb.parcels.lock()[0], request(1, 2, 1));

        // b never learned a's address: the reply rides the accepted socket.
        assert!(wait_until(|| b.connected(LocalityId::new(1))));
        b.send(request(2, 1, 2)).expect("reply path");
        assert!(wait_until(|| ra.parcels.lock().len() == 1));
    }

    #[test]
    fn silent_client_does_not_block_other_connections() {
        init_test_logging();
        let a = TcpParcelport::bind(LocalityId::new(1), "127.0.0.1:0", 1 << 20).expect("bind a");
        let b = TcpParcelport::bind(LocalityId::new(2), "127.0.0.1:0", 1 << 20).expect("bind b");
        let rb = Arc::new(Recorder::default());
        b.set_receiver(rb.clone());
        a.set_receiver(Arc::new(Recorder::default()));
        a.add_peer(LocalityId::new(2), b.local_addr());

        // Connected but never sends its handshake.
        let _silent = TcpStream::connect(b.local_addr()).expect("silent client");
        let started = std::time::Instant::now();
        a.send(request(1, 2, 1)).expect("send");
        assert!(wait_until(|| rb.parcels.lock().len() == 1));
        assert!(started.elapsed() < HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn reconnects_do_not_accumulate_threads() {
        init_test_logging();
        let a = TcpParcelport::bind(LocalityId::new(1), "127.0.0.1:0", 1 << 20).expect("bind a");
        let b = TcpParcelport::bind(LocalityId::new(2), "127.0.0.1:0", 1 << 20).expect("bind b");
        let rb = Arc::new(Recorder::default());
        a.set_receiver(Arc::new(Recorder::default()));
        b.set_receiver(rb.clone());
        a.add_peer(LocalityId::new(2), b.local_addr());

        for n in 0..5u64 {
            a.send(request(1, 2, n)).expect("send");
            assert!(wait_until(|| rb.parcels.lock().len() == n as usize + 1));
            a.disconnect(LocalityId::new(2));
        }
        assert!(wait_until(|| a.connection_threads() == 0 && b.connection_threads() == 0));
    }

    #[test]
    fn unknown_peer_is_unreachable() {
        init_test_logging();
        let a = TcpParcelport::bind(LocalityId::new(1), "127.0.0.1:0", 1 << 20).expect("bind");
        assert!(matches!(
            a.send(request(1, 7, 1)),
            Err(TransportError::Unreachable(l)) if l == LocalityId::new(7)
        ));
        assert!(!a.connected(LocalityId::new(7)));
    }

    #[test]
    fn peer_shutdown_reports_disconnect() {
        init_test_logging();
        let a = TcpParcelport::bind(LocalityId::new(1), "127.0.0.1:0", 1 << 20).expect("bind a");
        let b = TcpParcelport::bind(LocalityId::new(2), "127.0.0.1:0", 1 << 20).expect("bind b");
        let ra = Arc::new(Recorder::default());
        a.set_receiver(ra.clone());
        b.set_receiver(Arc::new(Recorder::default()));
        a.add_peer(LocalityId::new(2), b.local_addr());
        a.send(request(1, 2, 1)).expect("send");

        b.shutdown();
        assert!(wait_until(|| ra.disconnects.lock().as_slice() == [LocalityId::new(2)]));
        a.shutdown();
        assert!(matches!(a.send(request(1, 2, 2)), Err(TransportError::Closed)));
    }
}
