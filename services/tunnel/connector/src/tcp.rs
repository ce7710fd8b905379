//! Plain TCP stream socket.

use crate::error::SocketError;
use crate::socket::{buffer_size, lock, resolve, Accepted, CloseSignal, Handle, Socket, SocketState, StateCell};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

/// TCP socket implementing the [`Socket`] contract.
///
/// The stream is split so that a blocked `recv` never holds up `send`; each
/// direction has its own lock, which also keeps concurrent sends from
/// interleaving.
pub struct TcpSocket {
    state: StateCell,
    bound: Mutex<Option<tokio::net::TcpSocket>>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    reader: AsyncMutex<Option<OwnedReadHalf>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    local: Mutex<Option<SocketAddr>>,
    peer: Mutex<Option<SocketAddr>>,
    buffer_size: AtomicUsize,
    closed: CloseSignal,
}

impl TcpSocket {
    /// Create an idle socket ready to bind or connect
    pub fn new() -> Self {
        Self {
            state: StateCell::new(SocketState::Open),
            bound: Mutex::new(None),
            listener: Mutex::new(None),
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            local: Mutex::new(None),
            peer: Mutex::new(None),
            buffer_size: AtomicUsize::new(0),
            closed: CloseSignal::new(),
        }
    }

    /// Wrap an already connected stream (accepted or externally dialed)
    pub fn from_stream(stream: TcpStream) -> Self {
        let socket = Self::new();
        socket.attach(stream);
        socket
    }

    /// Wrap a handle; only stream handles are accepted
    pub fn from_handle(handle: Handle) -> Result<Self, SocketError> {
        match handle {
            Handle::Stream(stream) => Ok(Self::from_stream(stream)),
            Handle::Overlay(_) => Err(SocketError::HandleKind("tcp")),
        }
    }

    fn attach(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        self.buffer_size.store(buffer_size(&stream), Ordering::Relaxed);
        *lock(&self.local) = stream.local_addr().ok();
        *lock(&self.peer) = stream.peer_addr().ok();

        let (read_half, write_half) = stream.into_split();
        // Fresh socket: the halves are uncontended
        if let Ok(mut reader) = self.reader.try_lock() {
            *reader = Some(read_half);
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            *writer = Some(write_half);
        }
        self.state.set(SocketState::Connected);
    }

    fn new_raw(addr: &SocketAddr) -> Result<tokio::net::TcpSocket, SocketError> {
        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };
        Ok(socket)
    }

    /// Fatal I/O error: the socket cannot be used any more
    fn fail(&self, err: SocketError) -> SocketError {
        debug!("tcp socket {:?} failed: {}", lock(&self.peer), err);
        self.state.close();
        self.closed.fire();
        err
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Socket for TcpSocket {
    fn state(&self) -> SocketState {
        self.state.get()
    }

    fn initialize(&self) -> Result<(), SocketError> {
        self.state.require(
            "initialize",
            &[SocketState::Uninitialized, SocketState::Closed],
        )?;
        *lock(&self.bound) = None;
        *lock(&self.listener) = None;
        *lock(&self.local) = None;
        *lock(&self.peer) = None;
        self.buffer_size.store(0, Ordering::Relaxed);
        self.closed.reset();
        self.state.set(SocketState::Open);
        Ok(())
    }

    async fn bind(&self, host: &str, port: u16) -> Result<(), SocketError> {
        self.state.require("bind", &[SocketState::Open])?;

        let addr = resolve(host, port).await?;
        let socket = Self::new_raw(&addr)?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;

        *lock(&self.local) = socket.local_addr().ok();
        self.buffer_size.store(buffer_size(&socket), Ordering::Relaxed);
        *lock(&self.bound) = Some(socket);
        self.state.set(SocketState::Bound);
        debug!("tcp socket bound to {}", addr);
        Ok(())
    }

    async fn listen(&self, backlog: u32) -> Result<(), SocketError> {
        self.state.require("listen", &[SocketState::Bound])?;

        let socket = lock(&self.bound).take().ok_or(SocketError::Uninitialized)?;
        let listener = socket.listen(backlog)?;
        *lock(&self.local) = listener.local_addr().ok();
        *lock(&self.listener) = Some(Arc::new(listener));
        self.state.set(SocketState::Listening);
        Ok(())
    }

    async fn accept(&self) -> Result<Accepted, SocketError> {
        self.state.require("accept", &[SocketState::Listening])?;
        let listener = lock(&self.listener).clone().ok_or(SocketError::Closed)?;

        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                trace!("tcp accepted connection from {}", peer);
                Ok(Accepted { handle: Handle::Stream(stream), peer })
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

        let addr = resolve(host, port).await?;
        let socket = match lock(&self.bound).take() {
            Some(socket) => socket,
            None => Self::new_raw(&addr)?,
        };

        tokio::select! {
            result = socket.connect(addr) => {
                let stream = result?;
                self.attach(stream);
                debug!("tcp socket connected to {}", addr);
                Ok(())
            }
            _ = self.closed.fired() => Err(SocketError::Closed),
        }
    }

    async fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        self.state.require("send", &[SocketState::Connected])?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SocketError::Closed)?;

        let result = tokio::select! {
            result = async {
                let mut written = 0;
                while written < data.len() {
                    let n = writer.write(&data[written..]).await?;
                    if n == 0 {
                        return Err(SocketError::WriteZero);
                    }
                    written += n;
                }
                Ok(())
            } => result,
            _ = self.closed.fired() => Err(SocketError::Closed),
        };
        drop(guard);

        result.map_err(|err| self.fail(err))
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(), SocketError> {
        self.state.require("recv", &[SocketState::Connected])?;

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(SocketError::Closed)?;

        let result = tokio::select! {
            result = reader.read_exact(buf) => match result {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SocketError::Eof),
                Err(e) => Err(SocketError::Io(e)),
            },
            _ = self.closed.fired() => Err(SocketError::Closed),
        };
        drop(guard);

        result.map_err(|err| self.fail(err))
    }

    async fn close(&self) -> Result<(), SocketError> {
        let previous = self.state.close();
        self.closed.fire();

        *lock(&self.bound) = None;
        *lock(&self.listener) = None;
        // Pending operations drop their guards once the signal fired
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();

        match previous {
            SocketState::Closed => Err(SocketError::Closed),
            SocketState::Uninitialized => Err(SocketError::Uninitialized),
            _ => Ok(()),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        *lock(&self.peer)
    }

    fn max_buffer_size(&self) -> usize {
        match self.state.get() {
            SocketState::Uninitialized | SocketState::Closed => 0,
            _ => self.buffer_size.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn listening() -> (TcpSocket, SocketAddr) {
        let server = TcpSocket::new();
        server.bind("127.0.0.1", 0).await.unwrap();
        server.listen(16).await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn test_connect_send_recv() {
        let (server, addr) = listening().await;
        assert_eq!(server.state(), SocketState::Listening);

        let client = TcpSocket::new();
        let (accepted, connected) = tokio::join!(server.accept(), client.connect("127.0.0.1", addr.port()));
        connected.unwrap();
        let accepted = TcpSocket::from_handle(accepted.unwrap().handle).unwrap();

        client.send(b"hello tunnel").await.unwrap();
        let mut buf = [0u8; 12];
        accepted.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello tunnel");
        assert!(client.max_buffer_size() > 0);
    }

    #[tokio::test]
    async fn test_operations_on_closed_socket_fail() {
        let socket = TcpSocket::new();
        socket.close().await.unwrap();

        assert!(matches!(socket.close().await, Err(SocketError::Closed)));
        assert!(matches!(socket.send(b"x").await, Err(SocketError::Closed)));
        assert!(matches!(socket.bind("127.0.0.1", 0).await, Err(SocketError::Closed)));
        assert_eq!(socket.max_buffer_size(), 0);

        socket.initialize().unwrap();
        assert_eq!(socket.state(), SocketState::Open);
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let (server, _addr) = listening().await;
        let server = Arc::new(server);

        let pending = {
            let server = server.clone();
            tokio::spawn(async move { server.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SocketError::Closed)));
    }

    #[tokio::test]
    async fn test_peer_close_fails_recv_and_later_sends() {
        let (server, addr) = listening().await;
        let client = TcpSocket::new();
        let (accepted, connected) = tokio::join!(server.accept(), client.connect("127.0.0.1", addr.port()));
        connected.unwrap();
        let accepted = TcpSocket::from_handle(accepted.unwrap().handle).unwrap();

        client.send(b"ab").await.unwrap();
        client.close().await.unwrap();

        // Two bytes are available, four are requested: all-or-nothing
        let mut buf = [0u8; 4];
        assert!(matches!(accepted.recv(&mut buf).await, Err(SocketError::Eof)));
        assert_eq!(accepted.state(), SocketState::Closed);
        assert!(accepted.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_with_empty_host_fails() {
        let socket = TcpSocket::new();
        assert!(matches!(socket.connect("", 80).await, Err(SocketError::Resolve(_))));
    }
}
