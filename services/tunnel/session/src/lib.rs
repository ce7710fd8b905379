//! Authenticated client/server sessions, IPC dispatch and heartbeat for the tunnel.
//!
//! This crate sits on top of `tunnel-connector`: it turns connected sockets
//! into authenticated sessions and keeps them alive.
//!
//! ## Features
//!
//! - **Login Handshake**: LOGIN / LOGIN_RESULT exchange against a credential set
//! - **Client/Server Module**: one client session, one server session per accepted link
//! - **Transport Selection**: standard, proxy, overlay or dial-up, optionally secured
//! - **Heartbeat**: PING per interval, first failure reported and the task ends
//! - **IPC**: published object lists and tunnel message dispatch by wire name
//! - **Task Registry**: explicit registry of background tasks with joined shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use tunnel_session::{ClientServerConfig, ClientServerModule, IpVersion, TaskRegistry};
//!
//! # async fn example() -> Result<(), tunnel_session::SessionError> {
//! let registry = TaskRegistry::new();
//!
//! let server = ClientServerModule::new(ClientServerConfig::default(), registry.clone());
//! server.add_user("bob", "secret");
//! server.start_server(7000, IpVersion::V4, true).await?;
//!
//! let client = ClientServerModule::new(ClientServerConfig::default(), registry.clone());
//! client.set_user_name("bob");
//! client.set_password("secret");
//! let session_id = client.connect("127.0.0.1", 7000).await?;
//! println!("session {}", session_id);
//!
//! client.disconnect().await?;
//! server.stop_server().await?;
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod credentials;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod ipc;
pub mod keepalive;
pub mod module;
pub mod registry;
pub mod session;

// Re-export main types
pub use credentials::{Credential, CredentialSet};
pub use error::SessionError;
pub use handshake::{build_login, build_login_result, parse_login, parse_login_result, Login, LoginResult};
pub use heartbeat::Heartbeat;
pub use ipc::{IpcModule, IpcObject, SignalDispatcher, SignalHandler};
pub use keepalive::{build_ping, build_pong, calc_rtt_from_corr, now_corr_id};
pub use module::{ClientPhase, ClientServerEventHandler, ClientServerModule, IpVersion};
pub use registry::{ShutdownSignal, TaskHandle, TaskRegistry};
pub use session::{ClientServerConfig, ClosedCallback, Session, SessionInfo, SessionStats};
