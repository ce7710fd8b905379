//! Socket and connector error types.

use crate::socket::SocketState;
use thiserror::Error;

/// Errors surfaced by sockets, factories and the connector.
///
/// Every failure of the socket contract is reported through this type; no
/// socket operation panics on an invalid handle.
#[derive(Error, Debug)]
pub enum SocketError {
    /// Operation on a socket that has no handle
    #[error("socket is not initialized")]
    Uninitialized,

    /// Operation on a closed socket (or the socket was closed while waiting)
    #[error("socket is closed")]
    Closed,

    /// Operation not valid in the current state
    #[error("{op} not allowed in state {state:?}")]
    InvalidState {
        /// Attempted operation
        op: &'static str,
        /// State the socket was in
        state: SocketState,
    },

    /// Host could not be resolved
    #[error("failed to resolve {0}")]
    Resolve(String),

    /// Peer closed the connection before the buffer was filled
    #[error("connection closed by peer")]
    Eof,

    /// Underlying write accepted zero bytes
    #[error("write returned zero bytes")]
    WriteZero,

    /// Operation did not complete in time
    #[error("timed out")]
    Timeout,

    /// Proxy negotiation failed
    #[error("proxy handshake failed: {0}")]
    Proxy(String),

    /// Secure transport failure
    #[error("secure transport failure: {0}")]
    Secure(&'static str),

    /// Handle kind does not match the factory transport
    #[error("handle kind does not match transport {0}")]
    HandleKind(&'static str),

    /// No socket could be produced by the factory
    #[error("factory {0} produced no socket")]
    Factory(String),

    /// Operation not supported by this transport
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Connect attempts were stopped
    #[error("connect stopped")]
    Stopped,

    /// Framing error on the wire
    #[error("wire error: {0}")]
    Wire(#[from] tunnel_wire::WireError),

    /// I/O error from the operating system
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
