//! Established client/server sessions.
//!
//! A [`Session`] owns the connector of one authenticated link. Once started it
//! runs a driver task that answers PINGs, measures RTT from PONGs and routes
//! MESSAGE / OBJECT_LIST frames to the module's IPC layer, plus an optional
//! heartbeat. Either task reports the end of the link through the `on_closed`
//! callback; `close` stops both without reporting.

use crate::error::SessionError;
use crate::handshake::MAX_CONTROL_FRAME;
use crate::heartbeat::Heartbeat;
use crate::ipc::{IpcModule, IpcObject};
use crate::keepalive::{build_pong, calc_rtt_from_corr};
use crate::registry::{TaskHandle, TaskRegistry};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use tunnel_connector::{lock, Connector, OverlayConfig, ProxyConfig, ReconnectPolicy, DEFAULT_CONNECT_TIMEOUT};
use tunnel_wire::{FastHeader, Frame, FrameBuilder, FrameType, TunnelMessage};

/// Time allowed for delivering the BYE on close
const BYE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration of a client/server module
#[derive(Clone, Debug)]
pub struct ClientServerConfig {
    /// Module name presented at login and published over IPC
    pub module_name: String,
    /// Interval between heartbeat PINGs
    pub ping_interval: Duration,
    /// Time allowed for the LOGIN / LOGIN_RESULT exchange
    pub auth_timeout: Duration,
    /// Per-attempt connect timeout
    pub connect_timeout: Duration,
    /// Client reconnect policy
    pub reconnect: ReconnectPolicy,
    /// Listen backlog of the server
    pub accept_backlog: u32,
    /// Overlay tuning used when no external datagram handle is supplied
    pub overlay: OverlayConfig,
}

impl Default for ClientServerConfig {
    fn default() -> Self {
        Self {
            module_name: "tunnel".to_string(),
            ping_interval: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(5),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            accept_backlog: 128,
            overlay: OverlayConfig::default(),
        }
    }
}

/// Descriptive data of a session
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Issued session id
    pub session_id: String,
    /// Remote address of the link
    pub peer: Option<SocketAddr>,
    /// Authenticated user
    pub user: String,
    /// Proxy the client went through, if any
    pub proxy: Option<ProxyConfig>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl SessionInfo {
    /// Info for a session created now
    pub fn new(session_id: impl Into<String>, peer: Option<SocketAddr>, user: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            peer,
            user: user.into(),
            proxy: None,
            created_at: Utc::now(),
        }
    }

    /// Time since the session was created
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Counters maintained by the driver
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Frames received
    pub frames_received: u64,
    /// PINGs answered
    pub pings_answered: u64,
    /// Most recent RTT measurement
    pub last_rtt: Option<Duration>,
}

/// Callback invoked when the link ends; `None` for an orderly BYE
pub type ClosedCallback = Arc<dyn Fn(Option<SessionError>) + Send + Sync>;

#[derive(Default)]
struct SessionTasks {
    driver: Option<TaskHandle>,
    heartbeat: Option<Heartbeat>,
}

/// One authenticated link
pub struct Session {
    info: SessionInfo,
    connector: Arc<Connector>,
    stats: Arc<Mutex<SessionStats>>,
    tasks: Mutex<SessionTasks>,
}

impl Session {
    /// Session over an authenticated connector
    pub fn new(info: SessionInfo, connector: Arc<Connector>) -> Self {
        Self {
            info,
            connector,
            stats: Arc::new(Mutex::new(SessionStats::default())),
            tasks: Mutex::new(SessionTasks::default()),
        }
    }

    /// Session data
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Issued session id
    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    /// Connector of the link
    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Snapshot of the driver counters
    pub fn stats(&self) -> SessionStats {
        lock(&self.stats).clone()
    }

    /// True while the driver runs
    pub fn is_running(&self) -> bool {
        lock(&self.tasks)
            .driver
            .as_ref()
            .is_some_and(|driver| driver.is_running())
    }

    /// Start the driver and, with a `ping_interval`, the heartbeat
    pub fn start(
        &self,
        registry: &TaskRegistry,
        ipc: Arc<IpcModule>,
        ping_interval: Option<Duration>,
        on_closed: ClosedCallback,
    ) {
        let driver = {
            let connector = self.connector.clone();
            let stats = self.stats.clone();
            let on_closed = on_closed.clone();
            let session_id = self.info.session_id.clone();
            registry.spawn("session", move |shutdown| async move {
                loop {
                    let result = tokio::select! {
                        result = connector.recv_frame() => result,
                        _ = shutdown.triggered() => {
                            debug!("session {} driver stopped", session_id);
                            return;
                        }
                    };

                    let frame = match result {
                        Ok(frame) => frame,
                        Err(e) => {
                            if shutdown.is_triggered() {
                                return;
                            }
                            info!("session {} link lost: {}", session_id, e);
                            on_closed(Some(e.into()));
                            return;
                        }
                    };
                    lock(&stats).frames_received += 1;

                    if frame.fast.typ == FrameType::Bye {
                        info!("session {} closed by peer", session_id);
                        on_closed(None);
                        return;
                    }
                    let handled = handle_frame(&connector, &ipc, &stats, &frame).await;
                    if shutdown.is_triggered() {
                        return;
                    }
                    if let Err(e) = handled {
                        warn!("session {}: failed to handle {:?} frame: {}", session_id, frame.fast.typ, e);
                    }
                }
            })
        };

        let heartbeat = ping_interval.map(|interval| {
            Heartbeat::start(registry, self.connector.clone(), interval, move |e| on_closed(Some(e)))
        });

        let mut tasks = lock(&self.tasks);
        tasks.driver = Some(driver);
        tasks.heartbeat = heartbeat;
    }

    /// Send a tunnel message to the peer
    pub async fn send_message(&self, message: &TunnelMessage) -> Result<(), SessionError> {
        let frame = message.to_frame(self.connector.next_msg_id())?;
        self.connector.send_frame(&frame).await?;
        trace!("session {}: sent {}", self.info.session_id, message.wire_name());
        Ok(())
    }

    /// Query the objects published by the peer
    pub async fn request_objects(&self, ipc: &IpcModule, timeout: Duration) -> Result<Vec<IpcObject>, SessionError> {
        ipc.request_objects(&self.connector, timeout).await
    }

    /// Stop the tasks, optionally say BYE, and close the link.
    ///
    /// The BYE is best effort and bounded by [`BYE_TIMEOUT`]; the link is
    /// closed before the driver is joined, so a peer that stopped reading
    /// cannot hold up the close.
    pub async fn close(&self, send_bye: bool) {
        let (driver, heartbeat) = {
            let mut tasks = lock(&self.tasks);
            (tasks.driver.take(), tasks.heartbeat.take())
        };

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        if send_bye {
            self.send_bye().await;
        }
        if let Some(driver) = &driver {
            driver.trigger();
        }
        // Closing fails any send the driver is blocked in
        self.connector.stop().await;
        if let Some(driver) = driver {
            driver.stop().await;
        }
        debug!("session {} closed", self.info.session_id);
    }

    async fn send_bye(&self) {
        let bye = match FrameBuilder::new(FastHeader::new(FrameType::Bye, self.connector.next_msg_id()))
            .build(MAX_CONTROL_FRAME)
        {
            Ok(bye) => bye,
            Err(e) => {
                warn!("failed to build BYE: {}", e);
                return;
            }
        };
        match tokio::time::timeout(BYE_TIMEOUT, self.connector.send_frame(&bye)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("session {}: BYE not delivered: {}", self.info.session_id, e),
            Err(_) => debug!("session {}: BYE not delivered within {:?}", self.info.session_id, BYE_TIMEOUT),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.info)
            .field("connector", &self.connector)
            .finish()
    }
}

async fn handle_frame(
    connector: &Connector,
    ipc: &IpcModule,
    stats: &Mutex<SessionStats>,
    frame: &Frame,
) -> Result<(), SessionError> {
    match frame.fast.typ {
        FrameType::Ping => {
            let pong = build_pong(connector.next_msg_id(), frame.fast.corr_id)?;
            connector.send_frame(&pong).await?;
            lock(stats).pings_answered += 1;
        }
        FrameType::Pong => {
            if let Some(rtt) = calc_rtt_from_corr(frame.fast.corr_id) {
                trace!("RTT to {:?}: {:?}", connector.peer_addr(), rtt);
                lock(stats).last_rtt = Some(rtt);
            }
        }
        FrameType::Message | FrameType::ObjectList => {
            if let Some(reply) = ipc.handle_frame(frame, connector.next_msg_id())? {
                connector.send_frame(&reply).await?;
            }
        }
        other => debug!("ignoring {:?} frame from {:?}", other, connector.peer_addr()),
    }
    Ok(())
}
