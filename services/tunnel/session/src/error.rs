//! Session error types.

use thiserror::Error;
use tunnel_connector::SocketError;
use tunnel_wire::{CodecError, FrameType};

/// Errors surfaced by the session layer
#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport failure
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    /// Frame or metadata encoding failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The server rejected our credentials
    #[error("authentication rejected by server")]
    AuthRejected,

    /// Frame type not valid at this point of the protocol
    #[error("unexpected frame type {0:?}")]
    UnexpectedFrame(FrameType),

    /// Required metadata field is absent
    #[error("missing metadata field {0}")]
    MissingMeta(&'static str),

    /// Operation needs the client to be disconnected
    #[error("operation not allowed while connected")]
    Busy,

    /// A connect is already in progress or established
    #[error("already connected")]
    AlreadyConnected,

    /// No established session
    #[error("not connected")]
    NotConnected,

    /// `start_server` while a server is running
    #[error("server already running")]
    ServerRunning,

    /// `stop_server` without a running server
    #[error("server not running")]
    ServerStopped,

    /// Unknown server-side session id
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// A protocol step did not complete in time
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Request was cancelled because the session ended
    #[error("session closed")]
    Closed,
}
