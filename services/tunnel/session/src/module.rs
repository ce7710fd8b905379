//! Client/server session module.
//!
//! One module can act as a client (a single outgoing session) and as a server
//! (one session per accepted connection) at the same time. The transport used
//! by both roles is selected on the module and turned into a socket factory
//! when a connect or listen starts.
//!
//! Client phases: `Disconnected -> Connecting -> Connected -> Disconnected`.
//! Server phases: `Stopped -> Listening -> Stopped`.
//!
//! Event callbacks are invoked without any module lock held.

use crate::credentials::{Credential, CredentialSet};
use crate::error::SessionError;
use crate::handshake::{build_login_result, recv_login, send_login, Login, LoginResult};
use crate::ipc::{IpcModule, IpcObject};
use crate::registry::{TaskHandle, TaskRegistry};
use crate::session::{ClientServerConfig, ClosedCallback, Session, SessionInfo};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tunnel_connector::{
    lock, Connector, DatagramHandle, DialFacility, DialupSocketFactory, OverlaySocketFactory, ProxyConfig,
    ProxySocketFactory, SecureSocketFactory, Socket, SocketError, SocketFactory, TcpSocketFactory,
};
use tunnel_wire::TunnelMessage;
use uuid::Uuid;

const REJECT_REASON: &str = "invalid credentials";
const MODULE_REJECT_REASON: &str = "unknown module";
const OBJECT_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives module events. Every method defaults to a no-op.
pub trait ClientServerEventHandler: Send + Sync {
    /// Client session established
    fn notify_connected(&self, _session_id: &str) {}

    /// Client connect failed before authentication
    fn notify_connect_failed(&self, _reason: &str) {}

    /// Client: rejected by the server. Server: a client failed authentication.
    fn notify_auth_failed(&self, _user: &str) {}

    /// Server accepted and authenticated a client
    fn notify_client_connected(&self, _session_id: &str, _user: &str, _peer: Option<SocketAddr>) {}

    /// Server socket could not be created
    fn notify_server_creation_failed(&self, _reason: &str) {}

    /// A session ended (client or server side)
    fn notify_disconnected(&self, _session_id: &str) {}
}

#[derive(Debug)]
struct NoopHandler;

impl ClientServerEventHandler for NoopHandler {}

/// IP family of the server socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpVersion {
    fn listen_host(self, local_only: bool) -> &'static str {
        match (self, local_only) {
            (IpVersion::V4, true) => "127.0.0.1",
            (IpVersion::V4, false) => "0.0.0.0",
            (IpVersion::V6, true) => "::1",
            (IpVersion::V6, false) => "::",
        }
    }
}

/// Client side lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// No session
    Disconnected,
    /// Connect or login in progress
    Connecting,
    /// Session established
    Connected,
}

enum Transport {
    Standard,
    Proxy,
    Overlay(Option<DatagramHandle>),
    Dialup {
        session_id: String,
        facility: Arc<dyn DialFacility>,
    },
}

impl Transport {
    fn name(&self) -> &'static str {
        match self {
            Transport::Standard => "standard",
            Transport::Proxy => "proxy",
            Transport::Overlay(_) => "overlay",
            Transport::Dialup { .. } => "dialup",
        }
    }
}

struct ServerState {
    listener: Arc<dyn Socket>,
    accept: TaskHandle,
    addr: Option<SocketAddr>,
}

struct ModuleState {
    user_name: String,
    password: String,
    credentials: CredentialSet,
    transport: Transport,
    secure: bool,
    proxy: ProxyConfig,
    phase: ClientPhase,
    connecting: Option<Arc<Connector>>,
    client: Option<Arc<Session>>,
    server_starting: bool,
    server: Option<ServerState>,
    sessions: HashMap<String, Arc<Session>>,
}

impl ModuleState {
    fn new() -> Self {
        Self {
            user_name: String::new(),
            password: String::new(),
            credentials: CredentialSet::new(),
            transport: Transport::Standard,
            secure: false,
            proxy: ProxyConfig::default(),
            phase: ClientPhase::Disconnected,
            connecting: None,
            client: None,
            server_starting: false,
            server: None,
            sessions: HashMap::new(),
        }
    }

    fn require_disconnected(&self) -> Result<(), SessionError> {
        match self.phase {
            ClientPhase::Disconnected => Ok(()),
            _ => Err(SessionError::Busy),
        }
    }

    /// Factory for the selected transport. Servers accept plain streams for
    /// the proxy and dial-up transports.
    fn build_factory(&self, config: &ClientServerConfig, for_server: bool) -> Box<dyn SocketFactory> {
        let base: Box<dyn SocketFactory> = match &self.transport {
            Transport::Standard => Box::new(TcpSocketFactory::new()),
            Transport::Proxy if for_server => Box::new(TcpSocketFactory::new()),
            Transport::Proxy => Box::new(ProxySocketFactory::new(self.proxy.clone())),
            Transport::Overlay(Some(handle)) => Box::new(OverlaySocketFactory::with_handle(handle.clone())),
            Transport::Overlay(None) => Box::new(OverlaySocketFactory::new(config.overlay.clone())),
            Transport::Dialup { .. } if for_server => Box::new(TcpSocketFactory::new()),
            Transport::Dialup { session_id, facility } => {
                Box::new(DialupSocketFactory::new(session_id.clone(), facility.clone()))
            }
        };

        if self.secure {
            Box::new(SecureSocketFactory::new(base))
        } else {
            base
        }
    }
}

struct ModuleInner {
    config: ClientServerConfig,
    registry: TaskRegistry,
    state: Mutex<ModuleState>,
    handler: Arc<dyn ClientServerEventHandler>,
    ipc: Arc<IpcModule>,
}

/// Authenticated client/server sessions over a selectable transport
#[derive(Clone)]
pub struct ClientServerModule {
    inner: Arc<ModuleInner>,
}

impl ClientServerModule {
    /// Module without event handler
    pub fn new(config: ClientServerConfig, registry: TaskRegistry) -> Self {
        Self::with_handler(config, registry, Arc::new(NoopHandler))
    }

    /// Module reporting events to `handler`
    pub fn with_handler(
        config: ClientServerConfig,
        registry: TaskRegistry,
        handler: Arc<dyn ClientServerEventHandler>,
    ) -> Self {
        let ipc = Arc::new(IpcModule::new(config.module_name.clone()));
        Self {
            inner: Arc::new(ModuleInner {
                config,
                registry,
                state: Mutex::new(ModuleState::new()),
                handler,
                ipc,
            }),
        }
    }

    /// Module configuration
    pub fn config(&self) -> &ClientServerConfig {
        &self.inner.config
    }

    /// IPC layer: published objects and message handlers
    pub fn ipc(&self) -> &Arc<IpcModule> {
        &self.inner.ipc
    }

    fn state(&self) -> MutexGuard<'_, ModuleState> {
        lock(&self.inner.state)
    }

    // ---- credentials ----

    /// User name presented when connecting
    pub fn set_user_name(&self, user: impl Into<String>) {
        self.state().user_name = user.into();
    }

    /// Password presented when connecting
    pub fn set_password(&self, password: impl Into<String>) {
        self.state().password = password.into();
    }

    /// Allow a client user; false when the user name already exists
    pub fn add_user(&self, user: &str, password: &str) -> bool {
        self.state().credentials.add(Credential::new(user, password))
    }

    /// Remove a client user matching name and password
    pub fn remove_user(&self, user: &str, password: &str) -> bool {
        self.state().credentials.remove(user, password)
    }

    /// Remove every client user
    pub fn clear_users(&self) {
        self.state().credentials.clear();
    }

    /// Number of allowed client users
    pub fn user_count(&self) -> usize {
        self.state().credentials.len()
    }

    // ---- transport selection ----

    /// Direct stream connections, keeping the secure flag
    pub fn use_standard_connections(&self) -> Result<(), SessionError> {
        let mut state = self.state();
        state.require_disconnected()?;
        state.transport = Transport::Standard;
        Ok(())
    }

    /// Connect through the SOCKS5 proxy at `ip:port`
    pub fn use_proxy(&self, ip: &str, port: u16) -> Result<(), SessionError> {
        let mut state = self.state();
        state.require_disconnected()?;
        state.proxy.host = ip.to_string();
        state.proxy.port = port;
        state.transport = Transport::Proxy;
        Ok(())
    }

    /// Proxy user name
    pub fn set_proxy_user_name(&self, user: &str) -> Result<(), SessionError> {
        let mut state = self.state();
        state.require_disconnected()?;
        state.proxy.username = user.to_string();
        Ok(())
    }

    /// Proxy password
    pub fn set_proxy_password(&self, password: &str) -> Result<(), SessionError> {
        let mut state = self.state();
        state.require_disconnected()?;
        state.proxy.password = password.to_string();
        Ok(())
    }

    /// Wrap the selected transport in the secure decorator
    pub fn set_secure(&self, secure: bool) -> Result<(), SessionError> {
        let mut state = self.state();
        state.require_disconnected()?;
        state.secure = secure;
        Ok(())
    }

    /// Reliable datagram overlay, optionally over a shared UDP handle
    pub fn use_overlay(&self, handle: Option<DatagramHandle>) -> Result<(), SessionError> {
        let mut state = self.state();
        state.require_disconnected()?;
        state.transport = Transport::Overlay(handle);
        Ok(())
    }

    /// Streams supplied by `facility` for `session_id`
    pub fn use_dialup(&self, session_id: &str, facility: Arc<dyn DialFacility>) -> Result<(), SessionError> {
        let mut state = self.state();
        state.require_disconnected()?;
        state.transport = Transport::Dialup {
            session_id: session_id.to_string(),
            facility,
        };
        Ok(())
    }

    /// Name of the selected transport, with the secure prefix when enabled
    pub fn transport(&self) -> String {
        let state = self.state();
        if state.secure {
            format!("secure-{}", state.transport.name())
        } else {
            state.transport.name().to_string()
        }
    }

    // ---- client ----

    /// Current client phase
    pub fn client_phase(&self) -> ClientPhase {
        self.state().phase
    }

    /// Client session id, empty when not connected
    pub fn session_id(&self) -> String {
        self.state()
            .client
            .as_ref()
            .map(|session| session.session_id().to_string())
            .unwrap_or_default()
    }

    /// Connect to a server and authenticate; returns the issued session id
    pub async fn connect(&self, ip: &str, port: u16) -> Result<String, SessionError> {
        let config = &self.inner.config;
        let (connector, login, proxy) = {
            let mut state = self.state();
            if state.phase != ClientPhase::Disconnected {
                return Err(SessionError::AlreadyConnected);
            }
            let connector = Arc::new(
                Connector::new(state.build_factory(config, false))
                    .with_policy(config.reconnect.clone())
                    .with_connect_timeout(config.connect_timeout),
            );
            state.phase = ClientPhase::Connecting;
            state.connecting = Some(connector.clone());

            let login = Login {
                user: state.user_name.clone(),
                password: state.password.clone(),
                module: config.module_name.clone(),
            };
            let proxy = matches!(state.transport, Transport::Proxy).then(|| state.proxy.clone());
            (connector, login, proxy)
        };
        info!("connecting to {}:{} over {}", ip, port, connector.kind());

        let result = async {
            connector.connect(ip, port).await?;
            match tokio::time::timeout(config.auth_timeout, send_login(&connector, &login)).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::Timeout("login result")),
            }
        }
        .await;

        match result {
            Ok(LoginResult::Accepted { session_id }) => {
                let mut info = SessionInfo::new(session_id.clone(), connector.peer_addr(), login.user.clone());
                info.proxy = proxy;
                let session = Arc::new(Session::new(info, connector.clone()));
                let current = {
                    let mut state = self.state();
                    let current = is_current(&state.connecting, &connector);
                    if current {
                        state.connecting = None;
                        state.phase = ClientPhase::Connected;
                        state.client = Some(session.clone());
                    }
                    current
                };
                if !current {
                    debug!("connect to {}:{} abandoned", ip, port);
                    connector.stop().await;
                    return Err(SessionError::Closed);
                }

                session.start(
                    &self.inner.registry,
                    self.inner.ipc.clone(),
                    Some(config.ping_interval),
                    self.link_lost_callback(&session),
                );
                self.inner
                    .ipc
                    .publish("client", &session_id, connector.peer_addr().map(|addr| addr.to_string()));
                info!("session {} established with {}:{}", session_id, ip, port);
                self.inner.handler.notify_connected(&session_id);
                Ok(session_id)
            }
            Ok(LoginResult::Rejected { reason }) => {
                warn!("login as {} rejected by {}:{}: {}", login.user, ip, port, reason);
                self.abandon_connect(&connector).await;
                self.inner.handler.notify_auth_failed(&login.user);
                Err(SessionError::AuthRejected)
            }
            Err(e) => {
                warn!("connect to {}:{} failed: {}", ip, port, e);
                self.abandon_connect(&connector).await;
                self.inner.handler.notify_connect_failed(&e.to_string());
                Err(e)
            }
        }
    }

    async fn abandon_connect(&self, connector: &Arc<Connector>) {
        {
            let mut state = self.state();
            if is_current(&state.connecting, connector) {
                state.connecting = None;
                state.phase = ClientPhase::Disconnected;
            }
        }
        connector.stop().await;
    }

    /// End the client session, or abort an ongoing connect
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (connecting, client) = {
            let mut state = self.state();
            let connecting = state.connecting.take();
            let client = state.client.take();
            state.phase = ClientPhase::Disconnected;
            (connecting, client)
        };

        if connecting.is_none() && client.is_none() {
            return Err(SessionError::NotConnected);
        }
        if let Some(connector) = connecting {
            info!("aborting connect");
            connector.stop().await;
        }
        if let Some(session) = client {
            self.inner.ipc.unpublish("client");
            session.close(true).await;
            info!("session {} disconnected", session.session_id());
            self.inner.handler.notify_disconnected(session.session_id());
        }
        Ok(())
    }

    /// Send a tunnel message over the client session
    pub async fn send_message(&self, message: &TunnelMessage) -> Result<(), SessionError> {
        let session = self.state().client.clone().ok_or(SessionError::NotConnected)?;
        session.send_message(message).await
    }

    /// Objects published by the server behind the client session
    pub async fn request_object_list(&self) -> Result<Vec<IpcObject>, SessionError> {
        let session = self.state().client.clone().ok_or(SessionError::NotConnected)?;
        session.request_objects(&self.inner.ipc, OBJECT_LIST_TIMEOUT).await
    }

    // ---- server ----

    /// Listen on `port` and authenticate every incoming client
    pub async fn start_server(&self, port: u16, ip_version: IpVersion, local_only: bool) -> Result<(), SessionError> {
        let config = &self.inner.config;
        let factory = {
            let mut state = self.state();
            if state.server.is_some() || state.server_starting {
                return Err(SessionError::ServerRunning);
            }
            state.server_starting = true;
            state.build_factory(config, true)
        };

        let host = ip_version.listen_host(local_only);
        let connector = Connector::new(factory).with_connect_timeout(config.connect_timeout);
        let listener = match connector.listen(host, port, config.accept_backlog).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state().server_starting = false;
                error!("failed to create server on {}:{}: {}", host, port, e);
                self.inner.handler.notify_server_creation_failed(&e.to_string());
                return Err(e.into());
            }
        };
        let addr = listener.local_addr();

        let accept = {
            let listener = listener.clone();
            let module = Arc::downgrade(&self.inner);
            self.inner
                .registry
                .spawn("accept", move |shutdown| async move {
                    loop {
                        let accepted = tokio::select! {
                            accepted = listener.accept() => accepted,
                            _ = shutdown.triggered() => break,
                        };
                        match accepted {
                            Ok(accepted) => {
                                let Some(inner) = module.upgrade() else { break };
                                let peer = accepted.peer;
                                match connector.accept_connector(accepted.handle) {
                                    Some(link) => {
                                        debug!("accepted {} connection from {}", link.kind(), peer);
                                        ClientServerModule { inner }.spawn_login(link, peer);
                                    }
                                    None => warn!("dropping connection from {}: no socket", peer),
                                }
                            }
                            Err(SocketError::Closed) | Err(SocketError::Uninitialized) => break,
                            Err(e) => {
                                if shutdown.is_triggered() {
                                    break;
                                }
                                warn!("accept failed: {}", e);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                    debug!("accept loop ended");
                })
        };

        {
            let mut state = self.state();
            state.server_starting = false;
            state.server = Some(ServerState { listener, accept, addr });
        }
        self.inner
            .ipc
            .publish("server", "", addr.map(|addr| addr.to_string()));
        info!("server listening on {:?}", addr);
        Ok(())
    }

    fn spawn_login(&self, link: Connector, peer: SocketAddr) {
        let module = self.clone();
        self.inner.registry.spawn("login", move |shutdown| async move {
            tokio::select! {
                _ = module.serve_login(link, peer) => {}
                _ = shutdown.triggered() => debug!("login from {} aborted", peer),
            }
        });
    }

    async fn serve_login(&self, link: Connector, peer: SocketAddr) {
        let config = &self.inner.config;
        let (login, login_msg_id) = match tokio::time::timeout(config.auth_timeout, recv_login(&link)).await {
            Ok(Ok(login)) => login,
            Ok(Err(e)) => {
                debug!("no login from {}: {}", peer, e);
                link.stop().await;
                return;
            }
            Err(_) => {
                warn!("login from {} timed out", peer);
                link.stop().await;
                return;
            }
        };

        if login.module != config.module_name {
            warn!(
                "client {} asked for module {:?}, this is {:?}",
                peer, login.module, config.module_name
            );
            self.reject_login(&link, login_msg_id, MODULE_REJECT_REASON, peer).await;
            return;
        }

        let authenticated = self.state().credentials.authenticate(&login.user, &login.password);
        if !authenticated {
            warn!("client {} failed authentication as {}", peer, login.user);
            self.inner.handler.notify_auth_failed(&login.user);
            self.reject_login(&link, login_msg_id, REJECT_REASON, peer).await;
            return;
        }

        let session_id = Uuid::new_v4().to_string();
        let verdict = LoginResult::Accepted {
            session_id: session_id.clone(),
        };
        let frame = match build_login_result(link.next_msg_id(), login_msg_id, &verdict) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to build login result: {}", e);
                link.stop().await;
                return;
            }
        };

        let link = Arc::new(link);
        let session = Arc::new(Session::new(
            SessionInfo::new(session_id.clone(), Some(peer), login.user.clone()),
            link.clone(),
        ));
        let registered = {
            let mut state = self.state();
            let running = state.server.is_some();
            if running {
                state.sessions.insert(session_id.clone(), session.clone());
            }
            running
        };
        if !registered {
            link.stop().await;
            return;
        }
        session.start(
            &self.inner.registry,
            self.inner.ipc.clone(),
            Some(config.ping_interval),
            self.link_lost_callback(&session),
        );
        self.inner
            .ipc
            .publish(&format!("session:{}", session_id), &session_id, Some(peer.to_string()));
        info!("client {} authenticated as {}, session {}", peer, login.user, session_id);
        self.inner
            .handler
            .notify_client_connected(&session_id, &login.user, Some(peer));

        if let Err(e) = link.send_frame(&frame).await {
            warn!("failed to deliver session id to {}: {}", peer, e);
            self.session_lost(&session).await;
        }
    }

    async fn reject_login(&self, link: &Connector, login_msg_id: u64, reason: &str, peer: SocketAddr) {
        let verdict = LoginResult::Rejected {
            reason: reason.to_string(),
        };
        match build_login_result(link.next_msg_id(), login_msg_id, &verdict) {
            Ok(frame) => {
                match tokio::time::timeout(self.inner.config.auth_timeout, link.send_frame(&frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("login rejection not delivered to {}: {}", peer, e),
                    Err(_) => debug!("login rejection to {} timed out", peer),
                }
            }
            Err(e) => warn!("failed to build login rejection: {}", e),
        }
        link.stop().await;
    }

    /// Stop accepting and close every server-side session
    pub async fn stop_server(&self) -> Result<(), SessionError> {
        let (server, sessions) = {
            let mut state = self.state();
            let server = state.server.take().ok_or(SessionError::ServerStopped)?;
            let sessions: Vec<Arc<Session>> = state.sessions.drain().map(|(_, session)| session).collect();
            (server, sessions)
        };

        if let Err(e) = server.listener.close().await {
            debug!("server listener close: {}", e);
        }
        server.accept.stop().await;
        self.inner.ipc.unpublish("server");

        for session in sessions {
            self.inner.ipc.unpublish(&format!("session:{}", session.session_id()));
            session.close(true).await;
            self.inner.handler.notify_disconnected(session.session_id());
        }
        info!("server stopped");
        Ok(())
    }

    /// True while no server is listening
    pub fn is_stop_server(&self) -> bool {
        self.state().server.is_none()
    }

    /// Bound address of the server
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.state().server.as_ref().and_then(|server| server.addr)
    }

    /// Server-side sessions
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .state()
            .sessions
            .values()
            .map(|session| session.info().clone())
            .collect();
        sessions.sort_by_key(|info| info.created_at);
        sessions
    }

    /// Send a tunnel message to one server-side session
    pub async fn send_message_to(&self, session_id: &str, message: &TunnelMessage) -> Result<(), SessionError> {
        let session = self
            .state()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        session.send_message(message).await
    }

    // ---- link loss ----

    fn link_lost_callback(&self, session: &Arc<Session>) -> ClosedCallback {
        let module = Arc::downgrade(&self.inner);
        let session = Arc::downgrade(session);
        Arc::new(move |reason: Option<SessionError>| {
            let (Some(inner), Some(session)) = (module.upgrade(), session.upgrade()) else {
                return;
            };
            if let Some(reason) = reason {
                debug!("session {} ended: {}", session.session_id(), reason);
            }
            // The reporting task may be one the cleanup joins
            tokio::spawn(async move {
                ClientServerModule { inner }.session_lost(&session).await;
            });
        })
    }

    async fn session_lost(&self, session: &Arc<Session>) {
        let removed = {
            let mut state = self.state();
            let is_client = state
                .client
                .as_ref()
                .is_some_and(|client| Arc::ptr_eq(client, session));
            if is_client {
                state.client = None;
                state.phase = ClientPhase::Disconnected;
                true
            } else {
                let is_server_side = state
                    .sessions
                    .get(session.session_id())
                    .is_some_and(|known| Arc::ptr_eq(known, session));
                if is_server_side {
                    state.sessions.remove(session.session_id());
                }
                is_server_side
            }
        };
        if !removed {
            return;
        }

        self.inner.ipc.unpublish("client");
        self.inner.ipc.unpublish(&format!("session:{}", session.session_id()));
        session.close(false).await;
        info!("session {} lost", session.session_id());
        self.inner.handler.notify_disconnected(session.session_id());
    }
}

fn is_current(slot: &Option<Arc<Connector>>, connector: &Arc<Connector>) -> bool {
    slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, connector))
}

impl std::fmt::Debug for ClientServerModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("ClientServerModule")
            .field("module", &self.inner.config.module_name)
            .field("transport", &state.transport.name())
            .field("phase", &state.phase)
            .field("server", &state.server.as_ref().map(|server| server.addr))
            .field("sessions", &state.sessions.len())
            .finish()
    }
}
