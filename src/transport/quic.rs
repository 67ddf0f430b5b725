//! Multiplexed transport over QUIC
//!
//! Every write opens a fresh unidirectional stream, writes the buffer and
//! finishes the stream. The reader accepts those streams in order and drains
//! each one before moving on, so callers see one ordered byte sequence just
//! like on the stream transport.
//!
//! QUIC always runs TLS. Without configured certificates the listener uses a
//! self-signed identity and the dialer skips server verification.

use super::security::{insecure_client_config, self_signed_server_config};
use super::{resolve, SecurityProvider, TransportError, WriteDeadline};
use crate::network::constants::DIAL_TIMEOUT;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ConnectionError, Endpoint, IdleTimeout, RecvStream, TransportConfig, VarInt};
use std::fmt;
use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const PROTOCOL_NAME: &str = "QUIC";

/// Suggested seconds between repeated requests on a multiplexed connection
pub const REQ_INTERVAL: u64 = 1;

const MAX_UNI_STREAMS: u32 = 10_000;
const INSECURE_SERVER_NAME: &str = "localhost";

/// Dials and listens over QUIC
#[derive(Debug, Clone)]
pub struct QuicTransport {
    security: SecurityProvider,
    idle_timeout: Duration,
}

impl QuicTransport {
    pub fn new(security: SecurityProvider, idle_timeout: Duration) -> Self {
        Self {
            security,
            idle_timeout,
        }
    }

    fn transport_config(&self) -> Arc<TransportConfig> {
        let mut config = TransportConfig::default();
        config
            .max_concurrent_uni_streams(VarInt::from_u32(MAX_UNI_STREAMS))
            .max_concurrent_bidi_streams(VarInt::from_u32(0))
            .max_idle_timeout(IdleTimeout::try_from(self.idle_timeout).ok());
        Arc::new(config)
    }

    pub async fn dial_with_timeout(
        &self,
        addr: &str,
        timeout: Duration,
    ) -> Result<QuicConnection, TransportError> {
        let timeout = if timeout.is_zero() { DIAL_TIMEOUT } else { timeout };
        let dial_err = |detail: String| TransportError::Dial {
            transport: PROTOCOL_NAME,
            address: addr.to_string(),
            detail,
        };

        let remote = resolve(addr).await.map_err(|e| dial_err(e.to_string()))?;
        let (crypto, server_name) = match self.security.client_config()? {
            Some(config) => (config, remote.ip().to_string()),
            None => (insecure_client_config()?, INSECURE_SERVER_NAME.to_string()),
        };
        let crypto = QuicClientConfig::try_from(crypto).map_err(|e| dial_err(e.to_string()))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(self.transport_config());

        let bind: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let endpoint = Endpoint::client(bind).map_err(|e| dial_err(e.to_string()))?;
        let connecting = endpoint
            .connect_with(client_config, remote, &server_name)
            .map_err(|e| dial_err(e.to_string()))?;

        let conn = match tokio::time::timeout(timeout, connecting).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(dial_err(e.to_string())),
            Err(_) => return Err(dial_err(format!("timed out after {:?}", timeout))),
        };
        let local = endpoint.local_addr()?;

        Ok(QuicConnection::new(conn, Some(endpoint), local))
    }

    pub async fn listen(&self, port: u16) -> Result<QuicListener, TransportError> {
        let crypto = match self.security.server_config()? {
            Some(config) => config,
            None => self_signed_server_config()?,
        };
        let bind_err = |detail: String| TransportError::Bind {
            transport: PROTOCOL_NAME,
            port,
            detail,
        };

        let crypto = QuicServerConfig::try_from(crypto).map_err(|e| bind_err(e.to_string()))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(self.transport_config());

        let endpoint = Endpoint::server(server_config, SocketAddr::from(([0, 0, 0, 0], port)))
            .map_err(|e| bind_err(e.to_string()))?;
        Ok(QuicListener { endpoint })
    }
}

/// A bound QUIC endpoint accepting connections
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    /// Wait for the next connection attempt; the handshake runs in
    /// [`QuicAccepting::finish`]
    pub async fn accept(&self) -> Result<QuicAccepting, TransportError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or(TransportError::ListenerClosed)?;
        let local = self.endpoint.local_addr()?;
        Ok(QuicAccepting { incoming, local })
    }

    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"listener closed");
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.endpoint.local_addr()?)
    }
}

/// An incoming QUIC connection whose handshake has not completed
pub struct QuicAccepting {
    incoming: quinn::Incoming,
    local: SocketAddr,
}

impl QuicAccepting {
    pub fn remote_addr(&self) -> SocketAddr {
        self.incoming.remote_address()
    }

    pub async fn finish(self) -> Result<QuicConnection, TransportError> {
        let remote = self.incoming.remote_address();
        let conn = tokio::time::timeout(DIAL_TIMEOUT, self.incoming.into_future())
            .await
            .map_err(|_| TransportError::Handshake(format!("QUIC handshake with {} timed out", remote)))?
            .map_err(|e| TransportError::Handshake(format!("QUIC handshake with {}: {}", remote, e)))?;
        Ok(QuicConnection::new(conn, None, self.local))
    }
}

impl fmt::Debug for QuicAccepting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicAccepting")
            .field("remote", &self.incoming.remote_address())
            .finish()
    }
}

/// One QUIC connection
#[derive(Debug)]
pub struct QuicConnection {
    conn: quinn::Connection,
    // dialed connections own their client endpoint
    _endpoint: Option<Endpoint>,
    local: SocketAddr,
    deadline: WriteDeadline,
    reader_taken: AtomicBool,
}

impl QuicConnection {
    fn new(conn: quinn::Connection, endpoint: Option<Endpoint>, local: SocketAddr) -> Self {
        Self {
            conn,
            _endpoint: endpoint,
            local,
            deadline: WriteDeadline::default(),
            reader_taken: AtomicBool::new(false),
        }
    }

    pub fn take_reader(&self) -> Option<QuicReader> {
        if self.reader_taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(QuicReader {
            conn: self.conn.clone(),
            current: None,
        })
    }

    /// Send the buffer on its own stream
    pub async fn write(&self, payload: &[u8]) -> Result<usize, TransportError> {
        if self.conn.close_reason().is_some() {
            return Err(TransportError::Closed);
        }

        self.deadline
            .run(async {
                let mut stream = self.conn.open_uni().await.map_err(io::Error::other)?;
                stream.write_all(payload).await.map_err(io::Error::other)?;
                stream.finish().map_err(io::Error::other)?;
                Ok::<_, io::Error>(payload.len())
            })
            .await
    }

    pub fn close(&self) {
        self.conn.close(VarInt::from_u32(0), b"closed");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    pub fn set_write_deadline(&self, deadline: Instant) {
        self.deadline.set(deadline);
    }
}

/// Receive side of a [`QuicConnection`]
#[derive(Debug)]
pub struct QuicReader {
    conn: quinn::Connection,
    current: Option<RecvStream>,
}

fn closed_cleanly(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::ApplicationClosed(_)
            | ConnectionError::LocallyClosed
            | ConnectionError::ConnectionClosed(_)
    )
}

impl QuicReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.current.is_none() {
                match self.conn.accept_uni().await {
                    Ok(stream) => self.current = Some(stream),
                    Err(e) if closed_cleanly(&e) => return Ok(0),
                    Err(e) => return Err(io::Error::other(e)),
                }
            }
            let Some(stream) = self.current.as_mut() else {
                continue;
            };

            match stream.read(buf).await {
                Ok(Some(n)) => return Ok(n),
                Ok(None) => self.current = None,
                Err(quinn::ReadError::ConnectionLost(e)) if closed_cleanly(&e) => return Ok(0),
                Err(e) => return Err(io::Error::other(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::security::write_test_identity;

    fn transport() -> QuicTransport {
        QuicTransport::new(SecurityProvider::disabled(), Duration::from_secs(30))
    }

    async fn connected_pair(
        transport: &QuicTransport,
    ) -> (QuicListener, QuicConnection, QuicConnection) {
        let listener = transport.listen(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = format!("127.0.0.1:{}", port);
        let (dialed, accepted) = tokio::join!(
            transport.dial_with_timeout(&target, Duration::ZERO),
            async { listener.accept().await?.finish().await }
        );
        (listener, dialed.unwrap(), accepted.unwrap())
    }

    async fn read_exact(reader: &mut QuicReader, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while out.len() < len {
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0, "unexpected end of connection");
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_writes_arrive_in_order() {
        let (_listener, dialed, accepted) = connected_pair(&transport()).await;
        let mut reader = accepted.take_reader().unwrap();
        assert!(accepted.take_reader().is_none());

        dialed.write(b"first-").await.unwrap();
        dialed.write(b"second-").await.unwrap();
        dialed.write(&[b'x'; 200]).await.unwrap();

        let got = read_exact(&mut reader, 6 + 7 + 200).await;
        assert_eq!(&got[..13], b"first-second-");
        assert!(got[13..].iter().all(|b| *b == b'x'));
    }

    #[tokio::test]
    async fn test_tls_identity_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let transport = QuicTransport::new(
            SecurityProvider::new(write_test_identity(dir.path())),
            Duration::from_secs(30),
        );
        let (_listener, dialed, accepted) = connected_pair(&transport).await;

        accepted.write(b"pong").await.unwrap();
        let mut reader = dialed.take_reader().unwrap();
        assert_eq!(read_exact(&mut reader, 4).await, b"pong");
    }

    #[tokio::test]
    async fn test_close_ends_remote_reader() {
        let (_listener, dialed, accepted) = connected_pair(&transport()).await;
        let mut reader = accepted.take_reader().unwrap();

        dialed.close();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert!(dialed.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_listener_close_ends_accept() {
        let listener = transport().listen(0).await.unwrap();
        listener.close();
        assert!(matches!(
            listener.accept().await,
            Err(TransportError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_dial_nobody_times_out() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();

        let err = transport()
            .dial_with_timeout(&addr.to_string(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Dial { transport: "QUIC", .. }));
    }
}
