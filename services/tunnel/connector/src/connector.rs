//! Connector: binds a socket factory to connection and listen attempts.
//!
//! The connector owns the reconnect policy and the framed I/O helpers used by
//! sessions. A stop signal aborts an ongoing connect, including the backoff
//! sleep between attempts.

use crate::error::SocketError;
use crate::factory::SocketFactory;
use crate::socket::{lock, CloseSignal, Socket, SocketState};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use tunnel_wire::{Frame, FrameDecoder};

/// Retry schedule for outgoing connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total connect attempts (at least one is always made)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound of the doubling delay
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1` (1-based `attempt`)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Default time allowed for a single connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces connected (or listening) sockets from a factory and frames traffic over them
pub struct Connector {
    factory: Box<dyn SocketFactory>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    decoder: FrameDecoder,
    socket: Mutex<Option<Arc<dyn Socket>>>,
    recv_lock: AsyncMutex<()>,
    stop: CloseSignal,
    next_msg_id: AtomicU64,
}

impl Connector {
    /// Connector over `factory` with the default policy
    pub fn new(factory: Box<dyn SocketFactory>) -> Self {
        Self {
            factory,
            policy: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            decoder: FrameDecoder::new(),
            socket: Mutex::new(None),
            recv_lock: AsyncMutex::new(()),
            stop: CloseSignal::new(),
            next_msg_id: AtomicU64::new(1),
        }
    }

    /// Connector around an accepted socket
    pub fn accepted(factory: Box<dyn SocketFactory>, socket: Box<dyn Socket>) -> Self {
        let connector = Self::new(factory);
        *lock(&connector.socket) = Some(Arc::from(socket));
        connector
    }

    /// Replace the reconnect policy
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the per-attempt connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Transport name of the factory
    pub fn kind(&self) -> &'static str {
        self.factory.kind()
    }

    /// Connect to `host:port`, retrying per policy until stopped
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), SocketError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = SocketError::Stopped;

        for attempt in 1..=attempts {
            if self.is_stopped() {
                return Err(SocketError::Stopped);
            }

            match self.try_connect(host, port).await {
                Ok(socket) => {
                    info!("{} connection to {}:{} established (attempt {})", self.kind(), host, port, attempt);
                    *lock(&self.socket) = Some(socket);
                    return Ok(());
                }
                Err(SocketError::Stopped) => return Err(SocketError::Stopped),
                Err(e) => {
                    warn!("{} connect to {}:{} failed (attempt {}/{}): {}", self.kind(), host, port, attempt, attempts, e);
                    last_error = e;
                }
            }

            if attempt < attempts {
                let backoff = self.policy.backoff(attempt);
                debug!("retrying connect to {}:{} in {:?}", host, port, backoff);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.stop.fired() => return Err(SocketError::Stopped),
                }
            }
        }

        Err(last_error)
    }

    async fn try_connect(&self, host: &str, port: u16) -> Result<Arc<dyn Socket>, SocketError> {
        let socket: Arc<dyn Socket> = self
            .factory
            .create_socket()
            .map(Arc::from)
            .ok_or_else(|| SocketError::Factory(self.kind().to_string()))?;

        // Dial-up factories hand out connected sockets
        if socket.state() == SocketState::Connected {
            return Ok(socket);
        }

        let result = tokio::select! {
            result = tokio::time::timeout(self.connect_timeout, socket.connect(host, port)) => {
                result.unwrap_or(Err(SocketError::Timeout))
            }
            _ = self.stop.fired() => Err(SocketError::Stopped),
        };

        match result {
            Ok(()) => Ok(socket),
            Err(e) => {
                let _ = socket.close().await;
                Err(e)
            }
        }
    }

    /// Create a socket bound to `host:port` and listening
    pub async fn listen(&self, host: &str, port: u16, backlog: u32) -> Result<Arc<dyn Socket>, SocketError> {
        let socket: Arc<dyn Socket> = self
            .factory
            .create_socket()
            .map(Arc::from)
            .ok_or_else(|| SocketError::Factory(self.kind().to_string()))?;

        let result = async {
            socket.bind(host, port).await?;
            socket.listen(backlog).await
        }
        .await;

        match result {
            Ok(()) => {
                info!("{} listening on {:?}", self.kind(), socket.local_addr());
                Ok(socket)
            }
            Err(e) => {
                let _ = socket.close().await;
                Err(e)
            }
        }
    }

    /// Wrap an accepted handle into a connector sharing this factory's configuration
    pub fn accept_connector(&self, handle: crate::socket::Handle) -> Option<Connector> {
        let socket = self.factory.create_socket_from(handle)?;
        Some(Connector::accepted(self.factory.clone_factory(), socket)
            .with_policy(self.policy.clone())
            .with_connect_timeout(self.connect_timeout))
    }

    fn socket(&self) -> Result<Arc<dyn Socket>, SocketError> {
        lock(&self.socket).clone().ok_or(SocketError::Closed)
    }

    /// True while a connected socket is held
    pub fn is_connected(&self) -> bool {
        lock(&self.socket)
            .as_ref()
            .is_some_and(|socket| socket.state() == SocketState::Connected)
    }

    /// Remote address of the held socket
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.socket).as_ref().and_then(|socket| socket.peer_addr())
    }

    /// Local address of the held socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.socket).as_ref().and_then(|socket| socket.local_addr())
    }

    /// Next message id for frames sent over this connector
    pub fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one encoded frame
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), SocketError> {
        self.socket()?.send(frame).await
    }

    /// Receive one frame
    pub async fn recv_frame(&self) -> Result<Frame, SocketError> {
        let socket = self.socket()?;
        let _guard = self.recv_lock.lock().await;

        let mut len = [0u8; 4];
        socket.recv(&mut len).await?;
        let frame_len = u32::from_be_bytes(len) as usize;
        self.decoder.check_frame_len(frame_len)?;

        let mut body = vec![0u8; frame_len];
        socket.recv(&mut body).await?;
        Ok(self.decoder.decode_body(Bytes::from(body))?)
    }

    /// Close the held socket; pending I/O on it fails
    pub async fn close(&self) -> Result<(), SocketError> {
        let socket = lock(&self.socket).take();
        match socket {
            Some(socket) => socket.close().await,
            None => Err(SocketError::Closed),
        }
    }

    /// Abort connect attempts and close the held socket
    pub async fn stop(&self) {
        if self.stop.fire() {
            debug!("{} connector stopped", self.kind());
        }
        let _ = self.close().await;
    }

    /// True once `stop` was called
    pub fn is_stopped(&self) -> bool {
        self.stop.is_fired()
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("kind", &self.kind())
            .field("policy", &self.policy)
            .field("peer", &self.peer_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{DialupSocketFactory, TcpSocketFactory};
    use crate::dialup::DialRegistry;
    use tokio::net::{TcpListener, TcpStream};
    use tunnel_wire::{FastHeader, FrameBuilder, FrameType, DEFAULT_MAX_FRAME_SIZE};

    fn quick_policy(attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        }
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(5), Duration::from_secs(16));
        assert_eq!(policy.backoff(6), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
        assert_eq!(ReconnectPolicy::none().max_attempts, 1);
    }

    #[tokio::test]
    async fn test_connect_refused_after_retries() {
        let port = unused_port().await;
        let connector = Connector::new(Box::new(TcpSocketFactory::new())).with_policy(quick_policy(3));
        assert!(connector.connect("127.0.0.1", port).await.is_err());
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn test_stop_aborts_backoff() {
        let port = unused_port().await;
        let connector = Arc::new(Connector::new(Box::new(TcpSocketFactory::new())).with_policy(ReconnectPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
        }));

        let pending = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.connect("127.0.0.1", port).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        connector.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(SocketError::Stopped)));
        assert!(connector.is_stopped());
    }

    #[tokio::test]
    async fn test_frames_between_connectors() {
        let server = Connector::new(Box::new(TcpSocketFactory::new()));
        let listener = server.listen("127.0.0.1", 0, 4).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = Connector::new(Box::new(TcpSocketFactory::new())).with_policy(ReconnectPolicy::none());
        let (accepted, connected) = tokio::join!(listener.accept(), client.connect("127.0.0.1", port));
        connected.unwrap();
        let accepted = server.accept_connector(accepted.unwrap().handle).unwrap();

        let frame = FrameBuilder::new(FastHeader::new(FrameType::Ping, client.next_msg_id()))
            .corr_id(77)
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        client.send_frame(&frame).await.unwrap();

        let received = accepted.recv_frame().await.unwrap();
        assert_eq!(received.fast.typ, FrameType::Ping);
        assert_eq!(received.fast.corr_id, 77);
        assert_eq!(received.fast.msg_id, 1);

        client.close().await.unwrap();
        assert!(accepted.recv_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_dialup_connector_skips_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let registry = Arc::new(DialRegistry::new());
        registry.insert("S1", stream);

        let connector = Connector::new(Box::new(DialupSocketFactory::new("S1", registry)));
        connector.connect("", 0).await.unwrap();
        assert!(connector.is_connected());
    }
}
