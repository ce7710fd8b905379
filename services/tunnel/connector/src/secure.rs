//! Transport-security decorator.
//!
//! On first use both ends exchange an ephemeral X25519 public key and derive a
//! shared ChaCha20-Poly1305 key. Every `send` is then framed as one or more
//! sealed records `u32 len | ciphertext`. Nonces are `direction | counter`, the
//! direction byte being fixed by the order of the two public keys so both ends
//! agree on it without extra round trips.

use crate::error::SocketError;
use crate::socket::{Accepted, Socket, SocketState};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};

const HELLO_MAGIC: [u8; 4] = *b"RTS1";
const HELLO_LEN: usize = 4 + 32;
const KEY_LABEL: &[u8] = b"redb-tunnel secure transport v1";

/// Largest plaintext sealed into one record
pub const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;
const TAG_LEN: usize = 16;

struct SessionKeys {
    cipher: ChaCha20Poly1305,
    send_dir: u8,
    recv_dir: u8,
}

fn nonce(dir: u8, counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[0] = dir;
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

fn derive_key(local: &PublicKey, remote: &PublicKey, shared: &[u8; 32]) -> [u8; 32] {
    let (low, high) = if local.as_bytes() < remote.as_bytes() {
        (local, remote)
    } else {
        (remote, local)
    };
    let mut hasher = Sha256::new();
    hasher.update(KEY_LABEL);
    hasher.update(low.as_bytes());
    hasher.update(high.as_bytes());
    hasher.update(shared);
    hasher.finalize().into()
}

struct RecvState {
    counter: u64,
    plaintext: BytesMut,
}

/// Socket that encrypts everything passing through an inner socket
pub struct SecureSocket {
    inner: Box<dyn Socket>,
    keys: OnceCell<SessionKeys>,
    send_counter: AsyncMutex<u64>,
    recv_state: AsyncMutex<RecvState>,
}

impl SecureSocket {
    /// Decorate `inner`; the key exchange happens on the first `send`/`recv`
    pub fn new(inner: Box<dyn Socket>) -> Self {
        Self {
            inner,
            keys: OnceCell::new(),
            send_counter: AsyncMutex::new(0),
            recv_state: AsyncMutex::new(RecvState {
                counter: 0,
                plaintext: BytesMut::new(),
            }),
        }
    }

    async fn keys(&self) -> Result<&SessionKeys, SocketError> {
        self.keys.get_or_try_init(|| self.handshake()).await
    }

    async fn handshake(&self) -> Result<SessionKeys, SocketError> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let local = PublicKey::from(&secret);

        let mut hello = [0u8; HELLO_LEN];
        hello[..4].copy_from_slice(&HELLO_MAGIC);
        hello[4..].copy_from_slice(local.as_bytes());
        self.inner.send(&hello).await?;

        let mut peer_hello = [0u8; HELLO_LEN];
        self.inner.recv(&mut peer_hello).await?;
        if peer_hello[..4] != HELLO_MAGIC {
            warn!("secure handshake with {:?}: bad hello", self.inner.peer_addr());
            let _ = self.inner.close().await;
            return Err(SocketError::Secure("bad hello"));
        }
        let mut remote_bytes = [0u8; 32];
        remote_bytes.copy_from_slice(&peer_hello[4..]);
        let remote = PublicKey::from(remote_bytes);
        if remote.as_bytes() == local.as_bytes() {
            let _ = self.inner.close().await;
            return Err(SocketError::Secure("reflected hello"));
        }

        let shared = secret.diffie_hellman(&remote);
        let key = derive_key(&local, &remote, shared.as_bytes());
        let (send_dir, recv_dir) = if local.as_bytes() < remote.as_bytes() {
            (0, 1)
        } else {
            (1, 0)
        };
        debug!("secure transport established with {:?}", self.inner.peer_addr());

        Ok(SessionKeys {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            send_dir,
            recv_dir,
        })
    }

    async fn fill_plaintext(&self, keys: &SessionKeys, state: &mut RecvState) -> Result<(), SocketError> {
        let mut len = [0u8; 4];
        self.inner.recv(&mut len).await?;
        let len = u32::from_be_bytes(len) as usize;
        if !(TAG_LEN..=MAX_RECORD_PLAINTEXT + TAG_LEN).contains(&len) {
            let _ = self.inner.close().await;
            return Err(SocketError::Secure("record length out of range"));
        }

        let mut sealed = vec![0u8; len];
        self.inner.recv(&mut sealed).await?;
        let plaintext = match keys
            .cipher
            .decrypt(&nonce(keys.recv_dir, state.counter), sealed.as_slice())
        {
            Ok(plaintext) => plaintext,
            Err(_) => {
                let _ = self.inner.close().await;
                return Err(SocketError::Secure("record authentication failed"));
            }
        };
        state.counter += 1;
        state.plaintext.extend_from_slice(&plaintext);
        Ok(())
    }
}

#[async_trait]
impl Socket for SecureSocket {
    fn state(&self) -> SocketState {
        self.inner.state()
    }

    fn initialize(&self) -> Result<(), SocketError> {
        Err(SocketError::Unsupported("re-initializing a secure socket"))
    }

    async fn bind(&self, host: &str, port: u16) -> Result<(), SocketError> {
        self.inner.bind(host, port).await
    }

    async fn listen(&self, backlog: u32) -> Result<(), SocketError> {
        self.inner.listen(backlog).await
    }

    async fn accept(&self) -> Result<Accepted, SocketError> {
        self.inner.accept().await
    }

    async fn connect(&self, host: &str, port: u16) -> Result<(), SocketError> {
        self.inner.connect(host, port).await
    }

    async fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        require_connected(self.inner.as_ref())?;
        let keys = self.keys().await?;

        let mut counter = self.send_counter.lock().await;
        let mut out = Vec::with_capacity(data.len() + TAG_LEN + 4);
        for chunk in data.chunks(MAX_RECORD_PLAINTEXT) {
            let sealed = keys
                .cipher
                .encrypt(&nonce(keys.send_dir, *counter), chunk)
                .map_err(|_| SocketError::Secure("encryption failed"))?;
            *counter += 1;
            out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
            out.extend_from_slice(&sealed);
        }
        self.inner.send(&out).await
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(), SocketError> {
        require_connected(self.inner.as_ref())?;
        let keys = self.keys().await?;

        let mut guard = self.recv_state.lock().await;
        let state = &mut *guard;
        let mut filled = 0;
        while filled < buf.len() {
            if state.plaintext.is_empty() {
                self.fill_plaintext(keys, state).await?;
                continue;
            }
            let n = (buf.len() - filled).min(state.plaintext.len());
            buf[filled..filled + n].copy_from_slice(&state.plaintext[..n]);
            state.plaintext.advance(n);
            filled += n;
        }
        Ok(())
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

fn require_connected(inner: &dyn Socket) -> Result<(), SocketError> {
    match inner.state() {
        SocketState::Connected => Ok(()),
        SocketState::Uninitialized => Err(SocketError::Uninitialized),
        SocketState::Closed => Err(SocketError::Closed),
        state => Err(SocketError::InvalidState { op: "secure io", state }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TcpSocket;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn tcp_pair() -> (TcpSocket, TcpSocket) {
        let server = TcpSocket::new();
        server.bind("127.0.0.1", 0).await.unwrap();
        server.listen(4).await.unwrap();
        let port = server.local_addr().unwrap().port();

        let client = TcpSocket::new();
        let (accepted, connected) = tokio::join!(server.accept(), client.connect("127.0.0.1", port));
        connected.unwrap();
        (client, TcpSocket::from_handle(accepted.unwrap().handle).unwrap())
    }

    #[test]
    fn test_nonce_layout() {
        let n = nonce(1, 0x0102);
        assert_eq!(n.as_slice(), &[1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_secure_round_trip_multi_record() {
        let (client, server) = tcp_pair().await;
        let client = SecureSocket::new(Box::new(client));
        let server = SecureSocket::new(Box::new(server));

        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
        let (sent, received) = tokio::join!(client.send(&data), async {
            let mut buf = vec![0u8; data.len()];
            server.recv(&mut buf).await.map(|_| buf)
        });
        sent.unwrap();
        assert_eq!(received.unwrap(), data);

        server.send(b"ok").await.unwrap();
        let mut reply = [0u8; 2];
        client.recv(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ok");
    }

    #[tokio::test]
    async fn test_send_after_transport_loss_fails() {
        let (client, server) = tcp_pair().await;
        let client = SecureSocket::new(Box::new(client));
        let server = SecureSocket::new(Box::new(server));

        let (sent, received) = tokio::join!(client.send(b"hi"), async {
            let mut buf = [0u8; 2];
            server.recv(&mut buf).await
        });
        sent.unwrap();
        received.unwrap();

        client.inner.close().await.unwrap();
        let data = vec![1u8; 3 * MAX_RECORD_PLAINTEXT];
        assert!(matches!(client.send(&data).await, Err(SocketError::Closed)));
        assert_eq!(client.state(), SocketState::Closed);

        // The peer sees the stream end instead of a partial message
        let mut buf = [0u8; 1];
        assert!(server.recv(&mut buf).await.is_err());
        assert_eq!(server.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_plaintext_peer_is_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; HELLO_LEN];
            stream.read_exact(&mut hello).await.unwrap();
            assert_eq!(&hello[..4], &HELLO_MAGIC);
            stream.write_all(&[0u8; HELLO_LEN]).await.unwrap();
        });

        let client = TcpSocket::new();
        client.connect("127.0.0.1", port).await.unwrap();
        let client = SecureSocket::new(Box::new(client));

        assert!(matches!(client.send(b"secret").await, Err(SocketError::Secure("bad hello"))));
        assert_eq!(client.state(), SocketState::Closed);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_io_before_connect_fails() {
        let socket = SecureSocket::new(Box::new(TcpSocket::new()));
        assert!(matches!(
            socket.send(b"x").await,
            Err(SocketError::InvalidState { op: "secure io", state: SocketState::Open })
        ));
    }
}
