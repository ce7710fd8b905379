//! Pluggable transports for the tunnel.
//!
//! Every transport implements the [`Socket`] contract: connection oriented,
//! all-or-nothing `send`/`recv`, and cancellation of pending operations by
//! `close`. Transports are produced by [`SocketFactory`] implementations that
//! compose by decoration:
//!
//! - [`TcpSocketFactory`]: plain stream
//! - [`ProxySocketFactory`]: stream through a SOCKS5 proxy
//! - [`SecureSocketFactory`]: encryption over any other factory
//! - [`OverlaySocketFactory`]: reliable stream over UDP, optionally over a shared [`DatagramHandle`]
//! - [`DialupSocketFactory`]: stream handed over by a [`DialFacility`]
//!
//! The [`Connector`] binds a factory to connect/listen attempts and owns the
//! reconnect policy.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connector;
pub mod dialup;
pub mod error;
pub mod factory;
pub mod overlay;
pub mod proxy;
pub mod secure;
pub mod socket;
pub mod tcp;

pub use connector::{Connector, ReconnectPolicy, DEFAULT_CONNECT_TIMEOUT};
pub use dialup::{DialFacility, DialRegistry};
pub use error::SocketError;
pub use factory::{
    DialupSocketFactory, OverlaySocketFactory, ProxySocketFactory, SecureSocketFactory, SocketFactory,
    TcpSocketFactory,
};
pub use overlay::{DatagramHandle, OverlayConfig, OverlayConnection, OverlaySocket};
pub use proxy::{ProxyConfig, ProxySocket};
pub use secure::SecureSocket;
pub use socket::{lock, Accepted, Handle, Socket, SocketState};
pub use tcp::TcpSocket;
