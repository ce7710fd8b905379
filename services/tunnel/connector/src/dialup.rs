//! Dial-up transport: connections established out of band.
//!
//! Some peers are reached through a facility that hands over an already
//! connected stream for a session (for example a connection relayed by a
//! rendezvous server). The facility is passed explicitly to the factory.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio::net::TcpStream;
use tracing::debug;

use crate::socket::lock;

/// Source of pre-connected streams keyed by session id
pub trait DialFacility: Send + Sync + fmt::Debug {
    /// Take the stream registered for `session_id`, if any
    fn open(&self, session_id: &str) -> Option<TcpStream>;
}

/// In-process [`DialFacility`]: streams are deposited and taken once
#[derive(Default)]
pub struct DialRegistry {
    streams: Mutex<HashMap<String, TcpStream>>,
}

impl DialRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit a connected stream for `session_id`, replacing any previous one
    pub fn insert(&self, session_id: impl Into<String>, stream: TcpStream) {
        let session_id = session_id.into();
        debug!("dial-up stream registered for session {}", session_id);
        lock(&self.streams).insert(session_id, stream);
    }

    /// Number of streams waiting to be taken
    pub fn len(&self) -> usize {
        lock(&self.streams).len()
    }

    /// True when no stream is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DialFacility for DialRegistry {
    fn open(&self, session_id: &str) -> Option<TcpStream> {
        lock(&self.streams).remove(session_id)
    }
}

impl fmt::Debug for DialRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sessions: Vec<String> = lock(&self.streams).keys().cloned().collect();
        f.debug_struct("DialRegistry").field("sessions", &sessions).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_stream_is_taken_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();

        let registry = DialRegistry::new();
        registry.insert("S1", stream);
        assert_eq!(registry.len(), 1);

        assert!(registry.open("S2").is_none());
        assert!(registry.open("S1").is_some());
        assert!(registry.open("S1").is_none());
        assert!(registry.is_empty());
    }
}
