//! Tunnel relay node binary.
//!
//! Loads the configuration, installs logging, then starts the server role,
//! the client role or both, and runs until interrupted.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tunnel_session::{ClientServerEventHandler, ClientServerModule, SessionError, TaskRegistry};
use tunnel_wire::{EXTERNAL_ADDRESS_WIRE_NAME, LISTENER_CREATED_WIRE_NAME};

mod config;
mod logging;

use config::{TransportKind, TunnelConfig};

/// Tunnel relay node
#[derive(Parser, Debug)]
#[command(name = "redb-tunnel", version, about = "Tunnel relay node with authenticated sessions")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "tunnel.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append log output to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Reports module events to the log
struct LoggingEventHandler;

impl ClientServerEventHandler for LoggingEventHandler {
    fn notify_connected(&self, session_id: &str) {
        component_info!("client", "Connected, session {}", session_id);
    }

    fn notify_connect_failed(&self, reason: &str) {
        component_warn!("client", "Connect failed: {}", reason);
    }

    fn notify_auth_failed(&self, user: &str) {
        component_warn!("auth", "Authentication failed for user {}", user);
    }

    fn notify_client_connected(&self, session_id: &str, user: &str, peer: Option<std::net::SocketAddr>) {
        component_info!("server", "Client {} connected from {:?}, session {}", user, peer, session_id);
    }

    fn notify_server_creation_failed(&self, reason: &str) {
        component_error!("server", "Server creation failed: {}", reason);
    }

    fn notify_disconnected(&self, session_id: &str) {
        component_info!("session", "Session {} disconnected", session_id);
    }
}

fn select_transport(module: &ClientServerModule, config: &TunnelConfig) -> Result<(), SessionError> {
    let client = &config.client;
    match client.transport {
        TransportKind::Standard => module.use_standard_connections()?,
        TransportKind::Proxy => {
            module.use_proxy(&client.proxy_host, client.proxy_port)?;
            module.set_proxy_user_name(&client.proxy_user)?;
            module.set_proxy_password(&client.proxy_password)?;
        }
        TransportKind::Overlay => module.use_overlay(None)?,
    }
    module.set_secure(client.secure)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init(&args.log_level, args.log_file.as_deref())?;
    info!("Starting reDB Tunnel Service v{}", env!("CARGO_PKG_VERSION"));

    let config = TunnelConfig::load_from_file(&args.config)?;
    let registry = TaskRegistry::new();
    let module = ClientServerModule::with_handler(config.module_config(), registry.clone(), Arc::new(LoggingEventHandler));

    for kind in [LISTENER_CREATED_WIRE_NAME, EXTERNAL_ADDRESS_WIRE_NAME] {
        module.ipc().dispatcher().register(kind, |message| {
            let addr = message.address();
            component_info!(
                "message",
                "{} {} (session {}) at {}:{}",
                message.wire_name(),
                addr.id,
                addr.session_id,
                addr.ip,
                addr.port
            );
        });
    }

    if config.server.enabled {
        for (user, password) in &config.server.users {
            if !module.add_user(user, password) {
                component_warn!("auth", "Duplicate user {} ignored", user);
            }
        }
        module
            .start_server(config.server.port, config.server.ip_version, config.server.local_only)
            .await
            .with_context(|| format!("failed to start server on port {}", config.server.port))?;
        component_info!("server", "Listening on {:?}", module.server_addr());
    }

    if config.client.enabled {
        select_transport(&module, &config)?;
        module.set_user_name(config.client.user.as_str());
        module.set_password(config.client.password.as_str());

        let result = module.connect(&config.client.host, config.client.port).await;
        if let Err(e) = result {
            // A node that only acts as client has nothing left to do
            if !config.server.enabled {
                return Err(e).with_context(|| format!("failed to connect to {}:{}", config.client.host, config.client.port));
            }
            component_warn!("client", "Continuing as server only: {}", e);
        }
    }

    if !config.server.enabled && !config.client.enabled {
        anyhow::bail!("neither server nor client role is enabled");
    }

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    info!("Shutting down");

    if !module.session_id().is_empty() {
        let _ = module.disconnect().await;
    }
    if !module.is_stop_server() {
        let _ = module.stop_server().await;
    }
    registry.shutdown().await;

    info!("Tunnel service stopped");
    Ok(())
}
