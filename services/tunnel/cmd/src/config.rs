//! Configuration handling for the tunnel service.
//!
//! Settings are read from a YAML file and then overridden by `TUNNEL_*`
//! environment variables. Durations are written in humantime form (`10s`,
//! `250ms`).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use tunnel_connector::ReconnectPolicy;
use tunnel_session::{ClientServerConfig, IpVersion};

/// Transport selected for outgoing connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Direct stream
    Standard,
    /// Through a SOCKS5 proxy
    Proxy,
    /// Reliable datagram overlay
    Overlay,
}

/// Server role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub enabled: bool,
    pub port: u16,
    pub ip_version: IpVersion,
    pub local_only: bool,
    /// Accepted (user, password) pairs
    pub users: Vec<(String, String)>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 7000,
            ip_version: IpVersion::V4,
            local_only: false,
            users: Vec::new(),
        }
    }
}

/// Client role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub transport: TransportKind,
    pub secure: bool,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub proxy_user: String,
    pub proxy_password: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 7000,
            user: String::new(),
            password: String::new(),
            transport: TransportKind::Standard,
            secure: false,
            proxy_host: String::new(),
            proxy_port: 1080,
            proxy_user: String::new(),
            proxy_password: String::new(),
        }
    }
}

/// Tunnel service configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub module_name: String,
    pub ping_interval: Duration,
    pub auth_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub server: ServerSettings,
    pub client: ClientSettings,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let session = ClientServerConfig::default();
        Self {
            module_name: session.module_name,
            ping_interval: session.ping_interval,
            auth_timeout: session.auth_timeout,
            connect_timeout: session.connect_timeout,
            reconnect: session.reconnect,
            server: ServerSettings::default(),
            client: ClientSettings::default(),
        }
    }
}

/// YAML file layout; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    module_name: Option<String>,
    ping_interval: Option<String>,
    auth_timeout: Option<String>,
    connect_timeout: Option<String>,
    reconnect: Option<FileReconnect>,
    server: Option<FileServer>,
    client: Option<FileClient>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileReconnect {
    max_attempts: Option<u32>,
    initial_backoff: Option<String>,
    max_backoff: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileServer {
    enabled: Option<bool>,
    port: Option<u16>,
    ip_version: Option<u8>,
    local_only: Option<bool>,
    users: Vec<FileUser>,
}

#[derive(Debug, Deserialize)]
struct FileUser {
    user: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileClient {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    transport: Option<TransportKind>,
    secure: Option<bool>,
    proxy: Option<FileProxy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileProxy {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {:?}", key, value))
}

fn parse_ip_version(value: u8) -> Result<IpVersion> {
    match value {
        4 => Ok(IpVersion::V4),
        6 => Ok(IpVersion::V6),
        other => bail!("invalid ip_version {}, expected 4 or 6", other),
    }
}

impl TunnelConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                config = Self::from_yaml(&content).with_context(|| format!("failed to parse {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
            }
            Err(e) => warn!("Config file {:?} not readable ({}), using defaults", path, e),
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Final tunnel configuration: server={} (port {}), client={} ({}:{}), ping_interval={:?}",
            config.server.enabled,
            config.server.port,
            config.client.enabled,
            config.client.host,
            config.client.port,
            config.ping_interval
        );
        Ok(config)
    }

    /// Parse a YAML document on top of the defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: FileConfig = serde_yaml::from_str(content)?;
        let mut config = Self::default();

        if let Some(name) = file.module_name {
            config.module_name = name;
        }
        if let Some(value) = file.ping_interval {
            config.ping_interval = parse_duration("ping_interval", &value)?;
        }
        if let Some(value) = file.auth_timeout {
            config.auth_timeout = parse_duration("auth_timeout", &value)?;
        }
        if let Some(value) = file.connect_timeout {
            config.connect_timeout = parse_duration("connect_timeout", &value)?;
        }

        if let Some(reconnect) = file.reconnect {
            if let Some(attempts) = reconnect.max_attempts {
                config.reconnect.max_attempts = attempts;
            }
            if let Some(value) = reconnect.initial_backoff {
                config.reconnect.initial_backoff = parse_duration("reconnect.initial_backoff", &value)?;
            }
            if let Some(value) = reconnect.max_backoff {
                config.reconnect.max_backoff = parse_duration("reconnect.max_backoff", &value)?;
            }
        }

        if let Some(server) = file.server {
            let settings = &mut config.server;
            settings.enabled = server.enabled.unwrap_or(settings.enabled);
            settings.port = server.port.unwrap_or(settings.port);
            settings.local_only = server.local_only.unwrap_or(settings.local_only);
            if let Some(version) = server.ip_version {
                settings.ip_version = parse_ip_version(version)?;
            }
            settings.users = server
                .users
                .into_iter()
                .map(|entry| (entry.user, entry.password))
                .collect();
        }

        if let Some(client) = file.client {
            let settings = &mut config.client;
            settings.enabled = client.enabled.unwrap_or(settings.enabled);
            settings.host = client.host.unwrap_or_else(|| settings.host.clone());
            settings.port = client.port.unwrap_or(settings.port);
            settings.user = client.user.unwrap_or_default();
            settings.password = client.password.unwrap_or_default();
            settings.transport = client.transport.unwrap_or(settings.transport);
            settings.secure = client.secure.unwrap_or(settings.secure);
            if let Some(proxy) = client.proxy {
                settings.proxy_host = proxy.host.unwrap_or_default();
                settings.proxy_port = proxy.port.unwrap_or(settings.proxy_port);
                settings.proxy_user = proxy.user.unwrap_or_default();
                settings.proxy_password = proxy.password.unwrap_or_default();
            }
        }

        Ok(config)
    }

    /// Apply `TUNNEL_*` overrides obtained through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("TUNNEL_SERVER_PORT") {
            self.server.port = port.parse().with_context(|| format!("TUNNEL_SERVER_PORT={}", port))?;
            info!("Server port overridden by environment: {}", self.server.port);
        }
        if let Some(host) = lookup("TUNNEL_CLIENT_HOST") {
            self.client.host = host;
            self.client.enabled = true;
            info!("Client host overridden by environment: {}", self.client.host);
        }
        if let Some(port) = lookup("TUNNEL_CLIENT_PORT") {
            self.client.port = port.parse().with_context(|| format!("TUNNEL_CLIENT_PORT={}", port))?;
            info!("Client port overridden by environment: {}", self.client.port);
        }
        if let Some(user) = lookup("TUNNEL_USER") {
            self.client.user = user;
        }
        if let Some(password) = lookup("TUNNEL_PASSWORD") {
            self.client.password = password;
        }
        if let Some(value) = lookup("TUNNEL_PING_INTERVAL") {
            self.ping_interval = parse_duration("TUNNEL_PING_INTERVAL", &value)?;
            info!("Ping interval overridden by environment: {:?}", self.ping_interval);
        }
        Ok(())
    }

    /// Session module configuration
    pub fn module_config(&self) -> ClientServerConfig {
        ClientServerConfig {
            module_name: self.module_name.clone(),
            ping_interval: self.ping_interval,
            auth_timeout: self.auth_timeout,
            connect_timeout: self.connect_timeout,
            reconnect: self.reconnect.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.module_name, "tunnel");
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert!(config.server.enabled);
        assert!(!config.client.enabled);
        assert_eq!(config.reconnect.max_attempts, 3);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
module_name: relay
ping_interval: 2s
auth_timeout: 1500ms
reconnect:
  max_attempts: 5
  initial_backoff: 250ms
server:
  port: 7100
  ip_version: 6
  local_only: true
  users:
    - user: bob
      password: secret
    - user: alice
      password: p1
client:
  enabled: true
  host: relay.example.net
  port: 7200
  user: bob
  password: secret
  transport: proxy
  secure: true
  proxy:
    host: 10.0.0.5
    port: 1081
    user: proxyuser
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = TunnelConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.module_name, "relay");
        assert_eq!(config.ping_interval, Duration::from_secs(2));
        assert_eq!(config.auth_timeout, Duration::from_millis(1500));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.server.port, 7100);
        assert_eq!(config.server.ip_version, IpVersion::V6);
        assert!(config.server.local_only);
        assert_eq!(config.server.users.len(), 2);
        assert_eq!(config.client.host, "relay.example.net");
        assert_eq!(config.client.transport, TransportKind::Proxy);
        assert!(config.client.secure);
        assert_eq!(config.client.proxy_port, 1081);
        assert_eq!(config.client.proxy_user, "proxyuser");

        let module = config.module_config();
        assert_eq!(module.module_name, "relay");
        assert_eq!(module.auth_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(TunnelConfig::from_yaml("ping_interval: soon\n").is_err());
        assert!(TunnelConfig::from_yaml("server:\n  ip_version: 5\n").is_err());
        assert!(TunnelConfig::from_yaml("client:\n  transport: carrier-pigeon\n").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TunnelConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.server.port, 7000);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TUNNEL_SERVER_PORT", "7300"),
            ("TUNNEL_CLIENT_HOST", "10.1.1.1"),
            ("TUNNEL_PING_INTERVAL", "30s"),
        ]);
        let mut config = TunnelConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|value| value.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 7300);
        assert_eq!(config.client.host, "10.1.1.1");
        assert!(config.client.enabled);
        assert_eq!(config.ping_interval, Duration::from_secs(30));

        let bad: HashMap<&str, &str> = HashMap::from([("TUNNEL_SERVER_PORT", "seventy")]);
        assert!(config.apply_overrides(|key| bad.get(key).map(|value| value.to_string())).is_err());
    }
}
