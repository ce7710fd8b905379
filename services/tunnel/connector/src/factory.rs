//! Socket factories.
//!
//! A factory carries an immutable transport configuration and produces
//! sockets for it, either fresh (`create_socket`) or around an accepted
//! handle (`create_socket_from`). Factories compose by decoration:
//! [`SecureSocketFactory`] wraps any other factory.

use crate::dialup::DialFacility;
use crate::overlay::{DatagramHandle, OverlayConfig, OverlaySocket};
use crate::proxy::{ProxyConfig, ProxySocket};
use crate::secure::SecureSocket;
use crate::socket::{Handle, Socket};
use crate::tcp::TcpSocket;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Produces sockets for one transport configuration.
///
/// Failures yield `None`; a handle passed to a failing `create_socket_from`
/// is dropped, which closes it.
pub trait SocketFactory: Send + Sync + fmt::Debug {
    /// New unconnected socket
    fn create_socket(&self) -> Option<Box<dyn Socket>>;

    /// Socket around an accepted (or externally dialed) handle
    fn create_socket_from(&self, handle: Handle) -> Option<Box<dyn Socket>>;

    /// Independent factory with identical configuration
    fn clone_factory(&self) -> Box<dyn SocketFactory>;

    /// Transport name for logs
    fn kind(&self) -> &'static str;
}

impl Clone for Box<dyn SocketFactory> {
    fn clone(&self) -> Self {
        self.clone_factory()
    }
}

fn wrap_stream(kind: &'static str, handle: Handle) -> Option<Box<dyn Socket>> {
    match TcpSocket::from_handle(handle) {
        Ok(socket) => Some(Box::new(socket)),
        Err(e) => {
            debug!("{} factory rejected handle: {}", kind, e);
            None
        }
    }
}

/// Plain stream sockets
#[derive(Debug, Clone, Default)]
pub struct TcpSocketFactory;

impl TcpSocketFactory {
    /// New factory
    pub fn new() -> Self {
        Self
    }
}

impl SocketFactory for TcpSocketFactory {
    fn create_socket(&self) -> Option<Box<dyn Socket>> {
        Some(Box::new(TcpSocket::new()))
    }

    fn create_socket_from(&self, handle: Handle) -> Option<Box<dyn Socket>> {
        wrap_stream(self.kind(), handle)
    }

    fn clone_factory(&self) -> Box<dyn SocketFactory> {
        Box::new(self.clone())
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

/// Stream sockets that connect through a SOCKS5 proxy.
///
/// Accepted handles are direct connections and are wrapped as plain streams.
#[derive(Debug, Clone)]
pub struct ProxySocketFactory {
    config: ProxyConfig,
}

impl ProxySocketFactory {
    /// Factory for the given proxy
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    /// Proxy configuration
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

impl SocketFactory for ProxySocketFactory {
    fn create_socket(&self) -> Option<Box<dyn Socket>> {
        Some(Box::new(ProxySocket::new(
            Box::new(TcpSocket::new()),
            self.config.clone(),
        )))
    }

    fn create_socket_from(&self, handle: Handle) -> Option<Box<dyn Socket>> {
        wrap_stream(self.kind(), handle)
    }

    fn clone_factory(&self) -> Box<dyn SocketFactory> {
        Box::new(self.clone())
    }

    fn kind(&self) -> &'static str {
        "proxy"
    }
}

/// Decorator adding transport security to any factory
#[derive(Debug)]
pub struct SecureSocketFactory {
    inner: Box<dyn SocketFactory>,
}

impl SecureSocketFactory {
    /// Secure the sockets produced by `inner`
    pub fn new(inner: Box<dyn SocketFactory>) -> Self {
        Self { inner }
    }

    /// Kind of the decorated factory
    pub fn inner_kind(&self) -> &'static str {
        self.inner.kind()
    }
}

impl SocketFactory for SecureSocketFactory {
    fn create_socket(&self) -> Option<Box<dyn Socket>> {
        let inner = self.inner.create_socket()?;
        Some(Box::new(SecureSocket::new(inner)))
    }

    fn create_socket_from(&self, handle: Handle) -> Option<Box<dyn Socket>> {
        let inner = self.inner.create_socket_from(handle)?;
        Some(Box::new(SecureSocket::new(inner)))
    }

    fn clone_factory(&self) -> Box<dyn SocketFactory> {
        Box::new(Self {
            inner: self.inner.clone_factory(),
        })
    }

    fn kind(&self) -> &'static str {
        "secure"
    }
}

/// Datagram-overlay sockets, optionally over a shared UDP handle.
///
/// Clones share the handle (reference counted); none of them owns it.
#[derive(Debug, Clone, Default)]
pub struct OverlaySocketFactory {
    config: OverlayConfig,
    handle: Option<DatagramHandle>,
}

impl OverlaySocketFactory {
    /// Sockets that bind their own UDP socket
    pub fn new(config: OverlayConfig) -> Self {
        Self { config, handle: None }
    }

    /// Sockets attached to an externally supplied handle
    pub fn with_handle(handle: DatagramHandle) -> Self {
        Self {
            config: handle.config().clone(),
            handle: Some(handle),
        }
    }

    /// Shared handle, if any
    pub fn handle(&self) -> Option<&DatagramHandle> {
        self.handle.as_ref()
    }
}

impl SocketFactory for OverlaySocketFactory {
    fn create_socket(&self) -> Option<Box<dyn Socket>> {
        let socket = match &self.handle {
            Some(handle) => OverlaySocket::attached(handle.clone()),
            None => OverlaySocket::new(self.config.clone()),
        };
        Some(Box::new(socket))
    }

    fn create_socket_from(&self, handle: Handle) -> Option<Box<dyn Socket>> {
        match OverlaySocket::from_handle(handle) {
            Ok(socket) => Some(Box::new(socket)),
            Err(e) => {
                debug!("overlay factory rejected handle: {}", e);
                None
            }
        }
    }

    fn clone_factory(&self) -> Box<dyn SocketFactory> {
        Box::new(self.clone())
    }

    fn kind(&self) -> &'static str {
        "overlay"
    }
}

/// Stream sockets obtained from a [`DialFacility`] for one session
#[derive(Debug, Clone)]
pub struct DialupSocketFactory {
    session_id: String,
    facility: Arc<dyn DialFacility>,
}

impl DialupSocketFactory {
    /// Factory taking the stream registered for `session_id`
    pub fn new(session_id: impl Into<String>, facility: Arc<dyn DialFacility>) -> Self {
        Self {
            session_id: session_id.into(),
            facility,
        }
    }

    /// Session whose stream this factory takes
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl SocketFactory for DialupSocketFactory {
    /// Produces an already connected socket, or `None` for an unknown session
    fn create_socket(&self) -> Option<Box<dyn Socket>> {
        match self.facility.open(&self.session_id) {
            Some(stream) => Some(Box::new(TcpSocket::from_stream(stream))),
            None => {
                debug!("no dial-up stream for session {}", self.session_id);
                None
            }
        }
    }

    fn create_socket_from(&self, handle: Handle) -> Option<Box<dyn Socket>> {
        wrap_stream(self.kind(), handle)
    }

    fn clone_factory(&self) -> Box<dyn SocketFactory> {
        Box::new(self.clone())
    }

    fn kind(&self) -> &'static str {
        "dialup"
    }
}
