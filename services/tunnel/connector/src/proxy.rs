//! SOCKS5 client (RFC 1928) with username/password sub-negotiation (RFC 1929).
//!
//! The proxy handshake runs inside `connect`; afterwards the socket behaves
//! like any other connected [`Socket`].

use crate::error::SocketError;
use crate::socket::{Accepted, Socket, SocketState};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

const VERSION5: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPT: u8 = 0xFF;
const AUTH_PASSWORD_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;

/// Proxy endpoint and credentials
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// User name; empty disables username/password authentication
    pub username: String,
    /// Password
    pub password: String,
}

impl ProxyConfig {
    /// Proxy without credentials
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Stream socket that reaches its target through a SOCKS5 proxy
pub struct ProxySocket {
    inner: Box<dyn Socket>,
    config: ProxyConfig,
}

impl ProxySocket {
    /// Decorate `inner`, which must not be connected yet
    pub fn new(inner: Box<dyn Socket>, config: ProxyConfig) -> Self {
        Self { inner, config }
    }

    async fn negotiate(&self, host: &str, port: u16) -> Result<(), SocketError> {
        self.authenticate().await?;

        let mut request = vec![VERSION5, CMD_CONNECT, 0x00];
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                let name = host.as_bytes();
                let len = u8::try_from(name.len())
                    .map_err(|_| SocketError::Proxy(format!("host name too long: {}", host)))?;
                request.push(ATYP_DOMAIN);
                request.push(len);
                request.extend_from_slice(name);
            }
        }
        request.extend_from_slice(&port.to_be_bytes());
        self.inner.send(&request).await?;

        let mut reply = [0u8; 4];
        self.inner.recv(&mut reply).await?;
        if reply[0] != VERSION5 {
            return Err(SocketError::Proxy(format!("unexpected version {}", reply[0])));
        }
        if reply[1] != REP_SUCCESS {
            return Err(SocketError::Proxy(format!("connect refused with reply {}", reply[1])));
        }

        // Bound address, not used
        let addr_len = match reply[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                self.inner.recv(&mut len).await?;
                len[0] as usize
            }
            atyp => return Err(SocketError::Proxy(format!("unknown address type {}", atyp))),
        };
        let mut bound = vec![0u8; addr_len + 2];
        self.inner.recv(&mut bound).await?;
        Ok(())
    }

    async fn authenticate(&self) -> Result<(), SocketError> {
        let method = if self.config.has_credentials() {
            AUTH_PASSWORD
        } else {
            AUTH_NONE
        };
        self.inner.send(&[VERSION5, 1, method]).await?;

        let mut choice = [0u8; 2];
        self.inner.recv(&mut choice).await?;
        if choice[0] != VERSION5 {
            return Err(SocketError::Proxy(format!("unexpected version {}", choice[0])));
        }
        match choice[1] {
            AUTH_NONE => Ok(()),
            AUTH_PASSWORD if self.config.has_credentials() => self.send_credentials().await,
            AUTH_NO_ACCEPT => Err(SocketError::Proxy("no acceptable auth method".to_string())),
            other => Err(SocketError::Proxy(format!("unexpected auth method {}", other))),
        }
    }

    async fn send_credentials(&self) -> Result<(), SocketError> {
        let user = self.config.username.as_bytes();
        let pass = self.config.password.as_bytes();
        let (Ok(user_len), Ok(pass_len)) = (u8::try_from(user.len()), u8::try_from(pass.len())) else {
            return Err(SocketError::Proxy("credentials too long".to_string()));
        };

        let mut request = Vec::with_capacity(3 + user.len() + pass.len());
        request.push(AUTH_PASSWORD_VERSION);
        request.push(user_len);
        request.extend_from_slice(user);
        request.push(pass_len);
        request.extend_from_slice(pass);
        self.inner.send(&request).await?;

        let mut status = [0u8; 2];
        self.inner.recv(&mut status).await?;
        if status[1] != 0 {
            return Err(SocketError::Proxy("proxy rejected credentials".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Socket for ProxySocket {
    fn state(&self) -> SocketState {
        self.inner.state()
    }

    fn initialize(&self) -> Result<(), SocketError> {
        self.inner.initialize()
    }

    async fn bind(&self, host: &str, port: u16) -> Result<(), SocketError> {
        self.inner.bind(host, port).await
    }

    async fn listen(&self, _backlog: u32) -> Result<(), SocketError> {
        Err(SocketError::Unsupported("listen through proxy"))
    }

    async fn accept(&self) -> Result<Accepted, SocketError> {
        Err(SocketError::Unsupported("accept through proxy"))
    }

    async fn connect(&self, host: &str, port: u16) -> Result<(), SocketError> {
        if host.is_empty() {
            return Err(SocketError::Resolve(String::new()));
        }

        self.inner.connect(&self.config.host, self.config.port).await?;
        debug!(
            "connected to proxy {}:{}, requesting {}:{}",
            self.config.host, self.config.port, host, port
        );

        if let Err(e) = self.negotiate(host, port).await {
            warn!("proxy negotiation with {}:{} failed: {}", self.config.host, self.config.port, e);
            let _ = self.inner.close().await;
            return Err(e);
        }
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        self.inner.send(data).await
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(), SocketError> {
        self.inner.recv(buf).await
    }

    async fn close(&self) -> Result<(), SocketError> {
        self.inner.close().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }

    fn max_buffer_size(&self) -> usize {
        self.inner.max_buffer_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TcpSocket;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// One-shot SOCKS5 proxy that requires `user`/`pass` and echoes after CONNECT.
    /// Returns the proxy address and a receiver for the requested target.
    async fn start_proxy(
        user: &'static str,
        pass: &'static str,
    ) -> (SocketAddr, tokio::sync::oneshot::Receiver<(String, u16)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let Some(target) = serve(&mut stream, user, pass).await else {
                return;
            };
            let _ = tx.send(target);

            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
        (addr, rx)
    }

    async fn serve(stream: &mut TcpStream, user: &str, pass: &str) -> Option<(String, u16)> {
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await.ok()?;
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await.ok()?;
        if !methods.contains(&AUTH_PASSWORD) {
            stream.write_all(&[VERSION5, AUTH_NO_ACCEPT]).await.ok()?;
            return None;
        }
        stream.write_all(&[VERSION5, AUTH_PASSWORD]).await.ok()?;

        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.ok()?;
        let mut got_user = vec![0u8; head[1] as usize];
        stream.read_exact(&mut got_user).await.ok()?;
        let mut pass_len = [0u8; 1];
        stream.read_exact(&mut pass_len).await.ok()?;
        let mut got_pass = vec![0u8; pass_len[0] as usize];
        stream.read_exact(&mut got_pass).await.ok()?;
        if got_user != user.as_bytes() || got_pass != pass.as_bytes() {
            stream.write_all(&[AUTH_PASSWORD_VERSION, 1]).await.ok()?;
            return None;
        }
        stream.write_all(&[AUTH_PASSWORD_VERSION, 0]).await.ok()?;

        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await.ok()?;
        let host = match request[3] {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await.ok()?;
                IpAddr::from(ip).to_string()
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.ok()?;
                let mut name = vec![0u8; len[0] as usize];
                stream.read_exact(&mut name).await.ok()?;
                String::from_utf8(name).ok()?
            }
            _ => return None,
        };
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await.ok()?;

        stream
            .write_all(&[VERSION5, REP_SUCCESS, 0, ATYP_IPV4, 127, 0, 0, 1, 0, 0])
            .await
            .ok()?;
        Some((host, u16::from_be_bytes(port)))
    }

    #[tokio::test]
    async fn test_connect_through_proxy_with_credentials() {
        let (proxy, target) = start_proxy("carol", "hunter2").await;
        let config = ProxyConfig {
            host: "127.0.0.1".to_string(),
            port: proxy.port(),
            username: "carol".to_string(),
            password: "hunter2".to_string(),
        };

        let socket = ProxySocket::new(Box::new(TcpSocket::new()), config);
        socket.connect("tunnel.example", 7000).await.unwrap();
        assert_eq!(socket.state(), SocketState::Connected);
        assert_eq!(target.await.unwrap(), ("tunnel.example".to_string(), 7000));

        socket.send(b"through").await.unwrap();
        let mut buf = [0u8; 7];
        socket.recv(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through");
    }

    #[tokio::test]
    async fn test_wrong_proxy_password_closes_socket() {
        let (proxy, _target) = start_proxy("carol", "hunter2").await;
        let config = ProxyConfig {
            host: "127.0.0.1".to_string(),
            port: proxy.port(),
            username: "carol".to_string(),
            password: "nope".to_string(),
        };

        let socket = ProxySocket::new(Box::new(TcpSocket::new()), config);
        assert!(matches!(socket.connect("10.0.0.1", 80).await, Err(SocketError::Proxy(_))));
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_proxy_cannot_listen() {
        let socket = ProxySocket::new(Box::new(TcpSocket::new()), ProxyConfig::new("127.0.0.1", 1080));
        assert!(matches!(socket.listen(1).await, Err(SocketError::Unsupported(_))));
    }
}
