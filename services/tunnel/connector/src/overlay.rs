//! Reliable stream overlay on top of a UDP socket.
//!
//! Every datagram starts with a 5-byte header `kind u8 | seq u32`. Data
//! segments are sent stop-and-wait: a segment is retransmitted until the peer
//! acknowledges its sequence number or the retry budget is spent. The receiver
//! only delivers the next expected segment, so the byte stream is in order with
//! no gaps or duplicates. A segment is acknowledged once it is queued for the
//! reader; while `recv_window` segments wait unread, new ones are dropped
//! unacknowledged and the sender's retransmissions carry the backpressure.
//!
//! One UDP socket ([`DatagramHandle`]) carries any number of connections,
//! keyed by peer address. A single reader task demultiplexes incoming
//! datagrams; it stops when the last handle reference is dropped.

use crate::error::SocketError;
use crate::socket::{buffer_size, lock, resolve, Accepted, CloseSignal, Handle, Socket, SocketState, StateCell};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, trace, warn};

const HEADER_LEN: usize = 5;
const MAX_DATAGRAM: usize = 64 * 1024;

const KIND_SYN: u8 = 1;
const KIND_SYN_ACK: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_ACK: u8 = 4;
const KIND_FIN: u8 = 5;

/// Overlay tuning
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Largest payload carried by one DATA datagram
    pub segment_size: usize,
    /// Wait for an ACK before retransmitting
    pub retransmit_timeout: Duration,
    /// Retransmissions per segment before the send fails
    pub max_retries: u32,
    /// Total time allowed for the SYN exchange
    pub handshake_timeout: Duration,
    /// Interval between SYN retransmissions
    pub handshake_interval: Duration,
    /// Received segments queued for the reader before further ones go unacknowledged
    pub recv_window: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            segment_size: 1200,
            retransmit_timeout: Duration::from_millis(200),
            max_retries: 25,
            handshake_timeout: Duration::from_secs(5),
            handshake_interval: Duration::from_millis(250),
            recv_window: 64,
        }
    }
}

fn encode_packet(kind: u8, seq: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind);
    buf.put_u32(seq);
    buf.put_slice(payload);
    buf.freeze()
}

fn decode_packet(mut buf: &[u8]) -> Option<(u8, u32, &[u8])> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let kind = buf.get_u8();
    let seq = buf.get_u32();
    Some((kind, seq, buf))
}

/// Per-peer delivery state owned by the reader
struct Route {
    id: u64,
    expected_seq: u32,
    data_tx: mpsc::Sender<Bytes>,
    ack_tx: mpsc::UnboundedSender<u32>,
    ctl_tx: mpsc::UnboundedSender<u8>,
}

struct RouteReceivers {
    id: u64,
    data_rx: mpsc::Receiver<Bytes>,
    ack_rx: mpsc::UnboundedReceiver<u32>,
    ctl_rx: mpsc::UnboundedReceiver<u8>,
}

/// What the reader decided to do with a datagram once the route lock is released
enum Action {
    Nothing,
    Reply(u8, u32),
    Accept(RouteReceivers),
}

pub(crate) struct DatagramMux {
    socket: Arc<UdpSocket>,
    config: OverlayConfig,
    routes: Mutex<HashMap<SocketAddr, Route>>,
    acceptor: Mutex<Option<mpsc::Sender<OverlayConnection>>>,
    next_route: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl DatagramMux {
    fn start(socket: UdpSocket, config: OverlayConfig) -> Arc<Self> {
        let socket = Arc::new(socket);
        let mux = Arc::new(Self {
            socket: socket.clone(),
            config,
            routes: Mutex::new(HashMap::new()),
            acceptor: Mutex::new(None),
            next_route: AtomicU64::new(1),
            reader: Mutex::new(None),
        });

        let reader = tokio::spawn(read_loop(socket, Arc::downgrade(&mux)));
        *lock(&mux.reader) = Some(reader);
        mux
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn register_route(&self, peer: SocketAddr) -> Result<RouteReceivers, SocketError> {
        let mut routes = lock(&self.routes);
        if routes.contains_key(&peer) {
            return Err(SocketError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("overlay connection to {} already exists", peer),
            )));
        }
        let (route, receivers) = self.new_route();
        routes.insert(peer, route);
        Ok(receivers)
    }

    fn new_route(&self) -> (Route, RouteReceivers) {
        let id = self.next_route.fetch_add(1, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::channel(self.config.recv_window.max(1));
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        (
            Route { id, expected_seq: 0, data_tx, ack_tx, ctl_tx },
            RouteReceivers { id, data_rx, ack_rx, ctl_rx },
        )
    }

    fn remove_route(&self, peer: SocketAddr, id: u64) {
        let mut routes = lock(&self.routes);
        if routes.get(&peer).map(|route| route.id) == Some(id) {
            routes.remove(&peer);
        }
    }

    fn set_acceptor(&self, backlog: usize) -> Result<mpsc::Receiver<OverlayConnection>, SocketError> {
        let mut acceptor = lock(&self.acceptor);
        if acceptor.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(SocketError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "datagram handle is already listening",
            )));
        }
        let (tx, rx) = mpsc::channel(backlog.max(1));
        *acceptor = Some(tx);
        Ok(rx)
    }

    fn clear_acceptor(&self) {
        lock(&self.acceptor).take();
    }

    async fn send_packet(&self, kind: u8, seq: u32, payload: &[u8], to: SocketAddr) -> std::io::Result<()> {
        self.socket.send_to(&encode_packet(kind, seq, payload), to).await?;
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, from: SocketAddr, datagram: &[u8]) {
        let Some((kind, seq, payload)) = decode_packet(datagram) else {
            trace!("overlay dropped short datagram from {}", from);
            return;
        };

        let action = {
            let mut routes = lock(&self.routes);
            match (kind, routes.get_mut(&from)) {
                (KIND_SYN, Some(route)) => {
                    let _ = route.ctl_tx.send(KIND_SYN);
                    Action::Reply(KIND_SYN_ACK, 0)
                }
                (KIND_SYN, None) => {
                    if lock(&self.acceptor).is_some() {
                        let (route, receivers) = self.new_route();
                        routes.insert(from, route);
                        Action::Accept(receivers)
                    } else {
                        Action::Nothing
                    }
                }
                (KIND_SYN_ACK, Some(route)) => {
                    let _ = route.ctl_tx.send(KIND_SYN_ACK);
                    Action::Nothing
                }
                (KIND_DATA, Some(route)) if seq == route.expected_seq => {
                    match route.data_tx.try_send(Bytes::copy_from_slice(payload)) {
                        Ok(()) => {
                            route.expected_seq = route.expected_seq.wrapping_add(1);
                            Action::Reply(KIND_ACK, seq)
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            trace!("overlay receive window to {} full, dropping seq {}", from, seq);
                            Action::Nothing
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => Action::Nothing,
                    }
                }
                // Retransmission of a segment already queued
                (KIND_DATA, Some(_)) => Action::Reply(KIND_ACK, seq),
                (KIND_ACK, Some(route)) => {
                    let _ = route.ack_tx.send(seq);
                    Action::Nothing
                }
                (KIND_FIN, Some(_)) => {
                    debug!("overlay peer {} closed the connection", from);
                    routes.remove(&from);
                    Action::Nothing
                }
                (kind, _) => {
                    trace!("overlay ignored datagram kind {} from {}", kind, from);
                    Action::Nothing
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Reply(kind, seq) => {
                if let Err(e) = self.send_packet(kind, seq, &[], from).await {
                    trace!("overlay reply to {} failed: {}", from, e);
                }
            }
            Action::Accept(receivers) => {
                let _ = self.send_packet(KIND_SYN_ACK, 0, &[], from).await;
                let route_id = receivers.id;
                let conn = OverlayConnection::new(self.clone(), from, receivers);
                let sender = lock(&self.acceptor).clone();
                let queued = match sender {
                    Some(tx) => tx.try_send(conn).is_ok(),
                    None => false,
                };
                if !queued {
                    warn!("overlay backlog full, dropping connection from {}", from);
                    self.remove_route(from, route_id);
                }
            }
        }
    }
}

impl Drop for DatagramMux {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

async fn read_loop(socket: Arc<UdpSocket>, mux: Weak<DatagramMux>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors surface here on some platforms; the socket stays usable
                trace!("overlay recv_from failed: {}", e);
                continue;
            }
        };
        let Some(mux) = mux.upgrade() else {
            break;
        };
        mux.dispatch(from, &buf[..n]).await;
    }
}

/// Shared, reference-counted UDP socket carrying overlay connections.
///
/// Clones share the socket; it is released when the last clone (and the last
/// connection using it) is dropped.
#[derive(Clone)]
pub struct DatagramHandle(Arc<DatagramMux>);

impl DatagramHandle {
    /// Bind a new UDP socket
    pub async fn bind(addr: SocketAddr, config: OverlayConfig) -> Result<Self, SocketError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, config))
    }

    /// Take over an existing UDP socket, e.g. one with a discovered external mapping
    pub fn from_socket(socket: UdpSocket, config: OverlayConfig) -> Self {
        Self(DatagramMux::start(socket, config))
    }

    /// Local address of the UDP socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.0.local_addr()
    }

    /// Number of live references (handles and connections)
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Overlay settings of this handle
    pub fn config(&self) -> &OverlayConfig {
        &self.0.config
    }

    fn max_buffer_size(&self) -> usize {
        buffer_size(&*self.0.socket)
    }
}

impl fmt::Debug for DatagramHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramHandle")
            .field("local_addr", &self.local_addr())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeMode {
    /// Wait for SYN-ACK
    Originate,
    /// Either side's SYN or SYN-ACK completes
    Rendezvous,
}

struct SendHalf {
    next_seq: u32,
    ack_rx: mpsc::UnboundedReceiver<u32>,
}

struct RecvHalf {
    data_rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

/// Established overlay connection to one peer
pub struct OverlayConnection {
    mux: Arc<DatagramMux>,
    peer: SocketAddr,
    route_id: u64,
    sender: AsyncMutex<SendHalf>,
    receiver: AsyncMutex<RecvHalf>,
    closed: CloseSignal,
}

impl OverlayConnection {
    fn new(mux: Arc<DatagramMux>, peer: SocketAddr, receivers: RouteReceivers) -> Self {
        Self {
            mux,
            peer,
            route_id: receivers.id,
            sender: AsyncMutex::new(SendHalf { next_seq: 0, ack_rx: receivers.ack_rx }),
            receiver: AsyncMutex::new(RecvHalf { data_rx: receivers.data_rx, pending: Bytes::new() }),
            closed: CloseSignal::new(),
        }
    }

    async fn establish(
        mux: Arc<DatagramMux>,
        peer: SocketAddr,
        mode: HandshakeMode,
    ) -> Result<Self, SocketError> {
        let mut receivers = mux.register_route(peer)?;
        let mut ctl_rx = std::mem::replace(&mut receivers.ctl_rx, mpsc::unbounded_channel().1);
        let conn = Self::new(mux, peer, receivers);

        let deadline = Instant::now() + conn.mux.config.handshake_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!("overlay handshake with {} timed out", peer);
                return Err(SocketError::Timeout);
            }
            conn.mux.send_packet(KIND_SYN, 0, &[], peer).await?;

            let wait = conn.mux.config.handshake_interval.min(deadline - now);
            tokio::select! {
                kind = ctl_rx.recv() => match kind {
                    Some(KIND_SYN_ACK) => break,
                    Some(KIND_SYN) if mode == HandshakeMode::Rendezvous => break,
                    Some(_) => {}
                    None => return Err(SocketError::Eof),
                },
                _ = sleep(wait) => {}
            }
        }

        debug!("overlay connection to {} established ({:?})", peer, mode);
        Ok(conn)
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local address of the underlying UDP socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mux.local_addr()
    }

    /// Deliver the whole buffer reliably or fail
    pub async fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        let mut guard = self.sender.lock().await;
        let half = &mut *guard;
        for chunk in data.chunks(self.mux.config.segment_size.max(1)) {
            let seq = half.next_seq;
            self.send_segment(half, seq, chunk).await?;
            half.next_seq = seq.wrapping_add(1);
        }
        Ok(())
    }

    async fn send_segment(&self, half: &mut SendHalf, seq: u32, chunk: &[u8]) -> Result<(), SocketError> {
        let packet = encode_packet(KIND_DATA, seq, chunk);
        let config = &self.mux.config;

        for attempt in 0..=config.max_retries {
            if attempt > 0 {
                trace!("overlay retransmit seq {} to {} (attempt {})", seq, self.peer, attempt);
            }
            self.mux.socket.send_to(&packet, self.peer).await?;

            let deadline = Instant::now() + config.retransmit_timeout;
            loop {
                tokio::select! {
                    ack = half.ack_rx.recv() => match ack {
                        Some(acked) if acked == seq => return Ok(()),
                        // Stale acknowledgement of a retransmitted segment
                        Some(_) => continue,
                        None => return Err(SocketError::Eof),
                    },
                    _ = sleep_until(deadline) => break,
                    _ = self.closed.fired() => return Err(SocketError::Closed),
                }
            }
        }

        debug!("overlay segment {} to {} unacknowledged after {} retries", seq, self.peer, config.max_retries);
        Err(SocketError::Timeout)
    }

    /// Fill the whole buffer or fail; EOF after the peer sent FIN
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(), SocketError> {
        let mut guard = self.receiver.lock().await;
        let half = &mut *guard;

        let mut filled = 0;
        while filled < buf.len() {
            if half.pending.is_empty() {
                half.pending = tokio::select! {
                    segment = half.data_rx.recv() => segment.ok_or(SocketError::Eof)?,
                    _ = self.closed.fired() => return Err(SocketError::Closed),
                };
                continue;
            }
            let n = (buf.len() - filled).min(half.pending.len());
            buf[filled..filled + n].copy_from_slice(&half.pending[..n]);
            half.pending.advance(n);
            filled += n;
        }
        Ok(())
    }

    /// Send FIN and release the route
    pub async fn close(&self) {
        if self.closed.fire() {
            if let Err(e) = self.mux.send_packet(KIND_FIN, 0, &[], self.peer).await {
                trace!("overlay FIN to {} failed: {}", self.peer, e);
            }
            self.mux.remove_route(self.peer, self.route_id);
        }
    }

    fn max_buffer_size(&self) -> usize {
        buffer_size(&*self.mux.socket)
    }
}

impl Drop for OverlayConnection {
    fn drop(&mut self) {
        if self.closed.fire() {
            let _ = self.mux.socket.try_send_to(&encode_packet(KIND_FIN, 0, &[]), self.peer);
        }
        self.mux.remove_route(self.peer, self.route_id);
    }
}

impl fmt::Debug for OverlayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayConnection")
            .field("peer", &self.peer)
            .field("route", &self.route_id)
            .finish()
    }
}

/// Socket over the datagram overlay.
///
/// Without an attached handle the socket binds its own UDP socket and uses the
/// originate/accept handshake. Attached to a shared handle it uses the
/// rendezvous handshake, so two peers can connect to each other at once.
pub struct OverlaySocket {
    config: OverlayConfig,
    attached: Option<DatagramHandle>,
    state: StateCell,
    handle: Mutex<Option<DatagramHandle>>,
    listener: AsyncMutex<Option<mpsc::Receiver<OverlayConnection>>>,
    conn: Mutex<Option<Arc<OverlayConnection>>>,
    closed: CloseSignal,
}

impl OverlaySocket {
    /// Socket owning its own UDP handle
    pub fn new(config: OverlayConfig) -> Self {
        Self::build(config, None, None)
    }

    /// Socket multiplexed over a shared handle
    pub fn attached(handle: DatagramHandle) -> Self {
        let config = handle.config().clone();
        Self::build(config, Some(handle), None)
    }

    /// Wrap an accepted connection
    pub fn from_connection(conn: OverlayConnection) -> Self {
        let config = conn.mux.config.clone();
        let socket = Self::build(config, None, Some(conn));
        socket.state.set(SocketState::Connected);
        socket
    }

    /// Wrap a handle; only overlay handles are accepted
    pub fn from_handle(handle: Handle) -> Result<Self, SocketError> {
        match handle {
            Handle::Overlay(conn) => Ok(Self::from_connection(conn)),
            Handle::Stream(_) => Err(SocketError::HandleKind("overlay")),
        }
    }

    fn build(config: OverlayConfig, attached: Option<DatagramHandle>, conn: Option<OverlayConnection>) -> Self {
        Self {
            config,
            handle: Mutex::new(attached.clone()),
            attached,
            state: StateCell::new(SocketState::Open),
            listener: AsyncMutex::new(None),
            conn: Mutex::new(conn.map(Arc::new)),
            closed: CloseSignal::new(),
        }
    }

    fn connection(&self) -> Result<Arc<OverlayConnection>, SocketError> {
        lock(&self.conn).clone().ok_or(SocketError::Closed)
    }

    async fn handle_for(&self, peer: &SocketAddr) -> Result<DatagramHandle, SocketError> {
        if let Some(handle) = lock(&self.handle).clone() {
            return Ok(handle);
        }
        let wildcard = match peer.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let handle = DatagramHandle::bind(SocketAddr::new(wildcard, 0), self.config.clone()).await?;
        *lock(&self.handle) = Some(handle.clone());
        Ok(handle)
    }

    fn fail(&self, err: SocketError) -> SocketError {
        debug!("overlay socket failed: {}", err);
        self.state.close();
        self.closed.fire();
        err
    }
}

#[async_trait]
impl Socket for OverlaySocket {
    fn state(&self) -> SocketState {
        self.state.get()
    }

    fn initialize(&self) -> Result<(), SocketError> {
        self.state.require(
            "initialize",
            &[SocketState::Uninitialized, SocketState::Closed],
        )?;
        *lock(&self.handle) = self.attached.clone();
        lock(&self.conn).take();
        self.closed.reset();
        self.state.set(SocketState::Open);
        Ok(())
    }

    async fn bind(&self, host: &str, port: u16) -> Result<(), SocketError> {
        self.state.require("bind", &[SocketState::Open])?;

        if self.attached.is_none() {
            let addr = resolve(host, port).await?;
            let handle = DatagramHandle::bind(addr, self.config.clone()).await?;
            debug!("overlay socket bound to {:?}", handle.local_addr());
            *lock(&self.handle) = Some(handle);
        }
        self.state.set(SocketState::Bound);
        Ok(())
    }

    async fn listen(&self, backlog: u32) -> Result<(), SocketError> {
        self.state.require("listen", &[SocketState::Bound])?;

        let handle = lock(&self.handle).clone().ok_or(SocketError::Uninitialized)?;
        let rx = handle.0.set_acceptor(backlog as usize)?;
        *self.listener.lock().await = Some(rx);
        self.state.set(SocketState::Listening);
        Ok(())
    }

    async fn accept(&self) -> Result<Accepted, SocketError> {
        self.state.require("accept", &[SocketState::Listening])?;

        let mut guard = self.listener.lock().await;
        let listener = guard.as_mut().ok_or(SocketError::Closed)?;
        tokio::select! {
            conn = listener.recv() => {
                let conn = conn.ok_or(SocketError::Closed)?;
                let peer = conn.peer_addr();
                trace!("overlay accepted connection from {}", peer);
                Ok(Accepted { handle: Handle::Overlay(conn), peer })
            }
            _ = self.closed.fired() => Err(SocketError::Closed),
        }
    }

    async fn connect(&self, host: &str, port: u16) -> Result<(), SocketError> {
        self.state
            .require("connect", &[SocketState::Open, SocketState::Bound])?;
        if host.is_empty() {
            return Err(SocketError::Resolve(String::new()));
        }

        let peer = resolve(host, port).await?;
        let handle = self.handle_for(&peer).await?;
        let mode = if self.attached.is_some() {
            HandshakeMode::Rendezvous
        } else {
            HandshakeMode::Originate
        };

        let conn = tokio::select! {
            result = OverlayConnection::establish(handle.0.clone(), peer, mode) => result?,
            _ = self.closed.fired() => return Err(SocketError::Closed),
        };
        *lock(&self.conn) = Some(Arc::new(conn));
        self.state.set(SocketState::Connected);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        self.state.require("send", &[SocketState::Connected])?;
        let conn = self.connection()?;

        let result = tokio::select! {
            result = conn.send(data) => result,
            _ = self.closed.fired() => Err(SocketError::Closed),
        };
        result.map_err(|err| self.fail(err))
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(), SocketError> {
        self.state.require("recv", &[SocketState::Connected])?;
        let conn = self.connection()?;

        let result = tokio::select! {
            result = conn.recv(buf) => result,
            _ = self.closed.fired() => Err(SocketError::Closed),
        };
        result.map_err(|err| self.fail(err))
    }

    async fn close(&self) -> Result<(), SocketError> {
        let previous = self.state.close();
        self.closed.fire();

        let conn = lock(&self.conn).take();
        if let Some(conn) = conn {
            conn.close().await;
        }
        if self.listener.lock().await.take().is_some() {
            if let Some(handle) = lock(&self.handle).as_ref() {
                handle.0.clear_acceptor();
            }
        }
        lock(&self.handle).take();

        match previous {
            SocketState::Closed => Err(SocketError::Closed),
            SocketState::Uninitialized => Err(SocketError::Uninitialized),
            _ => Ok(()),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        if let Some(conn) = lock(&self.conn).as_ref() {
            return conn.local_addr();
        }
        lock(&self.handle).as_ref().and_then(DatagramHandle::local_addr)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.conn).as_ref().map(|conn| conn.peer_addr())
    }

    fn max_buffer_size(&self) -> usize {
        if let Some(conn) = lock(&self.conn).as_ref() {
            return conn.max_buffer_size();
        }
        lock(&self.handle).as_ref().map_or(0, DatagramHandle::max_buffer_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> OverlayConfig {
        OverlayConfig {
            retransmit_timeout: Duration::from_millis(50),
            max_retries: 5,
            handshake_timeout: Duration::from_millis(300),
            handshake_interval: Duration::from_millis(50),
            ..OverlayConfig::default()
        }
    }

    async fn connected_pair() -> (OverlaySocket, OverlaySocket) {
        connected_pair_with(fast_config()).await
    }

    async fn connected_pair_with(config: OverlayConfig) -> (OverlaySocket, OverlaySocket) {
        let server = OverlaySocket::new(config.clone());
        server.bind("127.0.0.1", 0).await.unwrap();
        server.listen(4).await.unwrap();
        let port = server.local_addr().unwrap().port();

        let client = OverlaySocket::new(config);
        let (accepted, connected) = tokio::join!(server.accept(), client.connect("127.0.0.1", port));
        connected.unwrap();
        let accepted = OverlaySocket::from_handle(accepted.unwrap().handle).unwrap();
        (client, accepted)
    }

    #[test]
    fn test_packet_header() {
        let packet = encode_packet(KIND_DATA, 7, b"abc");
        assert_eq!(packet.len(), HEADER_LEN + 3);
        assert_eq!(decode_packet(&packet), Some((KIND_DATA, 7, &b"abc"[..])));
        assert_eq!(decode_packet(&[KIND_ACK, 0, 0]), None);
    }

    #[tokio::test]
    async fn test_stream_is_ordered_across_segments() {
        let (client, accepted) = connected_pair().await;

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let (sent, received) = tokio::join!(client.send(&data), async {
            let mut buf = vec![0u8; data.len()];
            accepted.recv(&mut buf).await.map(|_| buf)
        });
        sent.unwrap();
        assert_eq!(received.unwrap(), data);

        accepted.send(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_close_sends_fin() {
        let (client, accepted) = connected_pair().await;
        client.close().await.unwrap();

        let mut buf = [0u8; 1];
        let result = tokio::time::timeout(Duration::from_secs(1), accepted.recv(&mut buf))
            .await
            .unwrap();
        assert!(matches!(result, Err(SocketError::Eof)));
        assert!(accepted.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_send_fails_once_the_peer_route_is_gone() {
        let (client, accepted) = connected_pair().await;
        let conn = accepted.connection().unwrap();
        conn.mux.remove_route(conn.peer_addr(), conn.route_id);

        let data = vec![7u8; 5000];
        assert!(matches!(client.send(&data).await, Err(SocketError::Timeout)));
        assert_eq!(client.state(), SocketState::Closed);
        assert!(matches!(client.send(b"x").await, Err(SocketError::Closed)));
    }

    #[tokio::test]
    async fn test_unread_segments_push_back_on_the_sender() {
        let config = OverlayConfig {
            segment_size: 100,
            recv_window: 4,
            ..fast_config()
        };
        let (client, accepted) = connected_pair_with(config).await;

        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        assert!(matches!(client.send(&data).await, Err(SocketError::Timeout)));
        assert_eq!(client.state(), SocketState::Closed);

        // Only the acknowledged window was delivered, in order
        let mut buf = vec![0u8; 400];
        accepted.recv(&mut buf).await.unwrap();
        assert_eq!(buf, &data[..400]);
        let mut more = [0u8; 1];
        let next = tokio::time::timeout(Duration::from_millis(200), accepted.recv(&mut more)).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_connect_without_peer_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let client = OverlaySocket::new(fast_config());
        assert!(matches!(client.connect("127.0.0.1", port).await, Err(SocketError::Timeout)));
    }

    #[tokio::test]
    async fn test_rendezvous_over_shared_handles() {
        let a = DatagramHandle::bind("127.0.0.1:0".parse().unwrap(), fast_config()).await.unwrap();
        let b = DatagramHandle::bind("127.0.0.1:0".parse().unwrap(), fast_config()).await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let left = OverlaySocket::attached(a.clone());
        let right = OverlaySocket::attached(b.clone());
        let (l, r) = tokio::join!(
            left.connect("127.0.0.1", b_addr.port()),
            right.connect("127.0.0.1", a_addr.port())
        );
        l.unwrap();
        r.unwrap();

        left.send(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        right.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_handle_reference_count() {
        let handle = DatagramHandle::bind("127.0.0.1:0".parse().unwrap(), fast_config()).await.unwrap();
        assert_eq!(handle.ref_count(), 1);

        let socket = OverlaySocket::attached(handle.clone());
        assert_eq!(handle.ref_count(), 3);

        drop(socket);
        assert_eq!(handle.ref_count(), 1);
    }
}
