//! Liveness heartbeat over an established connector.
//!
//! The heartbeat sends one PING per interval. The first failed send is
//! reported through the failure callback and ends the task; reconnecting is
//! the owner's decision.

use crate::error::SessionError;
use crate::keepalive::{build_ping, now_corr_id};
use crate::registry::{TaskHandle, TaskRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};
use tunnel_connector::Connector;

/// Running heartbeat task
#[derive(Debug)]
pub struct Heartbeat {
    task: TaskHandle,
}

impl Heartbeat {
    /// Start pinging over `connector` every `interval`
    pub fn start<F>(registry: &TaskRegistry, connector: Arc<Connector>, interval: Duration, on_failure: F) -> Self
    where
        F: FnOnce(SessionError) + Send + 'static,
    {
        let task = registry.spawn("heartbeat", move |shutdown| async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.triggered() => {
                        debug!("heartbeat stopped");
                        return;
                    }
                }

                let result = match build_ping(connector.next_msg_id(), now_corr_id()) {
                    Ok(frame) => tokio::select! {
                        result = connector.send_frame(&frame) => result.map_err(SessionError::from),
                        _ = shutdown.triggered() => return,
                    },
                    Err(e) => Err(e.into()),
                };

                match result {
                    Ok(()) => trace!("heartbeat ping sent to {:?}", connector.peer_addr()),
                    Err(e) => {
                        warn!("heartbeat to {:?} failed: {}", connector.peer_addr(), e);
                        on_failure(e);
                        return;
                    }
                }
            }
        });

        Self { task }
    }

    /// True while the task runs
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Stop the task and wait for it
    pub async fn stop(self) {
        self.task.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tunnel_connector::{Accepted, Socket, SocketError, SocketState, TcpSocketFactory};
    use tunnel_wire::{FrameDecoder, FrameType};

    #[derive(Default)]
    struct CountingSocket {
        pings: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Socket for CountingSocket {
        fn state(&self) -> SocketState {
            SocketState::Connected
        }

        fn initialize(&self) -> Result<(), SocketError> {
            Ok(())
        }

        async fn bind(&self, _host: &str, _port: u16) -> Result<(), SocketError> {
            Err(SocketError::Unsupported("bind"))
        }

        async fn listen(&self, _backlog: u32) -> Result<(), SocketError> {
            Err(SocketError::Unsupported("listen"))
        }

        async fn accept(&self) -> Result<Accepted, SocketError> {
            Err(SocketError::Unsupported("accept"))
        }

        async fn connect(&self, _host: &str, _port: u16) -> Result<(), SocketError> {
            Ok(())
        }

        async fn send(&self, data: &[u8]) -> Result<(), SocketError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SocketError::Eof);
            }
            let mut buf = bytes::BytesMut::from(data);
            let frame = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.fast.typ, FrameType::Ping);
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn recv(&self, _buf: &mut [u8]) -> Result<(), SocketError> {
            std::future::pending().await
        }

        async fn close(&self) -> Result<(), SocketError> {
            Ok(())
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn max_buffer_size(&self) -> usize {
            0
        }
    }

    fn counting_connector() -> (Arc<Connector>, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let socket = CountingSocket::default();
        let pings = socket.pings.clone();
        let fail = socket.fail.clone();
        let connector = Connector::accepted(Box::new(TcpSocketFactory::new()), Box::new(socket));
        (Arc::new(connector), pings, fail)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_ping_per_tick() {
        let registry = TaskRegistry::new();
        let (connector, pings, _fail) = counting_connector();

        let heartbeat = Heartbeat::start(&registry, connector, Duration::from_secs(10), |_| {});
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 3);
        assert_eq!(registry.names(), vec!["heartbeat"]);

        heartbeat.stop().await;
        assert_eq!(registry.active(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reported_once_without_retry() {
        let registry = TaskRegistry::new();
        let (connector, pings, fail) = counting_connector();
        fail.store(true, Ordering::SeqCst);

        let failures = Arc::new(AtomicUsize::new(0));
        let heartbeat = {
            let failures = failures.clone();
            Heartbeat::start(&registry, connector, Duration::from_secs(1), move |err| {
                assert!(matches!(err, SessionError::Socket(SocketError::Eof)));
                failures.fetch_add(1, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(pings.load(Ordering::SeqCst), 0);
        assert!(!heartbeat.is_running());
        assert_eq!(registry.active(), 0);
    }
}
