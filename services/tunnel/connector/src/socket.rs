//! Socket contract shared by every tunnel transport.
//!
//! A [`Socket`] is a connection-oriented endpoint with all-or-nothing I/O:
//! `send` writes the whole buffer or fails, `recv` fills the whole buffer or
//! fails. Blocking operations return as soon as the socket is closed from
//! another task, which is how sessions and servers are shut down.

use crate::error::SocketError;
use crate::overlay::OverlayConnection;
use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Lifecycle state of a socket handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No handle; only `initialize` and `close` are meaningful
    Uninitialized,
    /// Handle ready, neither bound nor connected
    Open,
    /// Bound to a local address
    Bound,
    /// Accepting connections
    Listening,
    /// Connected to a peer
    Connected,
    /// Closed (explicitly or after a fatal I/O error)
    Closed,
}

/// Raw transport handle produced by `accept` or by an external facility.
///
/// Factories turn a handle into a [`Socket`] with `create_socket_from`.
pub enum Handle {
    /// Connected stream
    Stream(TcpStream),
    /// Established datagram-overlay connection
    Overlay(OverlayConnection),
}

impl Handle {
    /// Peer address of the handle
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Handle::Stream(stream) => stream.peer_addr().ok(),
            Handle::Overlay(conn) => Some(conn.peer_addr()),
        }
    }

    /// Short transport name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Handle::Stream(_) => "stream",
            Handle::Overlay(_) => "overlay",
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &self.kind())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

/// Result of a successful `accept`
#[derive(Debug)]
pub struct Accepted {
    /// Handle of the new connection
    pub handle: Handle,
    /// Remote address
    pub peer: SocketAddr,
}

/// Uniform socket capability over every transport.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Current lifecycle state
    fn state(&self) -> SocketState;

    /// (Re)create the handle after the socket was closed
    fn initialize(&self) -> Result<(), SocketError>;

    /// Bind to `host:port`; an empty host binds the wildcard address
    async fn bind(&self, host: &str, port: u16) -> Result<(), SocketError>;

    /// Start accepting connections
    async fn listen(&self, backlog: u32) -> Result<(), SocketError>;

    /// Wait for the next incoming connection
    async fn accept(&self) -> Result<Accepted, SocketError>;

    /// Resolve `host` (numeric or name) and connect
    async fn connect(&self, host: &str, port: u16) -> Result<(), SocketError>;

    /// Write the whole buffer or fail
    async fn send(&self, data: &[u8]) -> Result<(), SocketError>;

    /// Fill the whole buffer or fail
    async fn recv(&self, buf: &mut [u8]) -> Result<(), SocketError>;

    /// Shut down both directions and release the handle.
    ///
    /// Returns `SocketError::Closed` when the socket was already closed.
    async fn close(&self) -> Result<(), SocketError>;

    /// Local address, when bound or connected
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote address, when connected
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Smaller of the send and receive buffer sizes, 0 without a handle
    fn max_buffer_size(&self) -> usize;
}

/// Lock a std mutex, recovering the data of a poisoned lock
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Socket state guarded for concurrent access
#[derive(Debug)]
pub(crate) struct StateCell(Mutex<SocketState>);

impl StateCell {
    pub(crate) fn new(state: SocketState) -> Self {
        Self(Mutex::new(state))
    }

    pub(crate) fn get(&self) -> SocketState {
        *lock(&self.0)
    }

    pub(crate) fn set(&self, state: SocketState) {
        *lock(&self.0) = state;
    }

    /// Fail unless the socket is in one of `allowed`
    pub(crate) fn require(
        &self,
        op: &'static str,
        allowed: &[SocketState],
    ) -> Result<SocketState, SocketError> {
        let state = self.get();
        if allowed.contains(&state) {
            return Ok(state);
        }
        Err(match state {
            SocketState::Uninitialized => SocketError::Uninitialized,
            SocketState::Closed => SocketError::Closed,
            state => SocketError::InvalidState { op, state },
        })
    }

    /// Move to `Closed`, returning the previous state
    pub(crate) fn close(&self) -> SocketState {
        std::mem::replace(&mut *lock(&self.0), SocketState::Closed)
    }
}

/// Close notification that pending operations select on.
#[derive(Debug)]
pub(crate) struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Fire the signal; returns false when it was already fired
    pub(crate) fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Resolves once the signal has fired
    pub(crate) async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so wait_for only ends on a fired signal
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Resolve `host:port`; an empty host means the IPv4 wildcard
pub(crate) async fn resolve(host: &str, port: u16) -> Result<SocketAddr, SocketError> {
    if host.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| SocketError::Resolve(host.to_string()))?
        .next()
        .ok_or_else(|| SocketError::Resolve(host.to_string()))
}

/// Smaller of SO_SNDBUF and SO_RCVBUF, 0 when they cannot be read
pub(crate) fn buffer_size<S>(socket: &S) -> usize
where
    for<'a> socket2::SockRef<'a>: From<&'a S>,
{
    let sock = socket2::SockRef::from(socket);
    match (sock.send_buffer_size(), sock.recv_buffer_size()) {
        (Ok(snd), Ok(rcv)) => snd.min(rcv),
        _ => 0,
    }
}
