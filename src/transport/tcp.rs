//! Stream transport: TCP, optionally wrapped in TLS
//!
//! Plain and TLS sockets are boxed behind one [`AsyncStream`] so the rest of
//! the connection code is identical for both.

use super::{SecurityProvider, TransportError, WriteDeadline};
use crate::network::constants::DIAL_TIMEOUT;
use rustls_pki_types::ServerName;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

pub const PROTOCOL_NAME: &str = "TCP";

/// Suggested seconds between repeated requests on a stream connection
pub const REQ_INTERVAL: u64 = 3;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// Dials and listens over TCP
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    security: SecurityProvider,
}

impl TcpTransport {
    pub fn new(security: SecurityProvider) -> Self {
        Self { security }
    }

    pub async fn dial_with_timeout(
        &self,
        addr: &str,
        timeout: Duration,
    ) -> Result<TcpConnection, TransportError> {
        let timeout = if timeout.is_zero() { DIAL_TIMEOUT } else { timeout };
        let dial_err = |detail: String| TransportError::Dial {
            transport: PROTOCOL_NAME,
            address: addr.to_string(),
            detail,
        };

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(dial_err(e.to_string())),
            Err(_) => return Err(dial_err(format!("timed out after {:?}", timeout))),
        };
        stream.set_nodelay(true).map_err(|e| dial_err(e.to_string()))?;
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;

        let client_config = self.security.client_config()?;
        let stream: BoxedStream = match client_config {
            Some(config) => {
                let connector = TlsConnector::from(Arc::new(config));
                let server_name = ServerName::from(remote.ip());
                let tls = tokio::time::timeout(timeout, connector.connect(server_name, stream))
                    .await
                    .map_err(|_| dial_err("TLS handshake timed out".into()))?
                    .map_err(|e| dial_err(format!("TLS handshake: {}", e)))?;
                Box::new(tls)
            }
            None => Box::new(stream),
        };

        Ok(TcpConnection::new(stream, local, remote))
    }

    pub async fn listen(&self, port: u16) -> Result<TcpListener, TransportError> {
        let server_config = self.security.server_config()?;
        let inner = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| TransportError::Bind {
                transport: PROTOCOL_NAME,
                port,
                detail: e.to_string(),
            })?;

        Ok(TcpListener {
            inner,
            acceptor: server_config.map(|c| TlsAcceptor::from(Arc::new(c))),
            cancel: CancellationToken::new(),
        })
    }
}

/// A bound TCP listener
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    acceptor: Option<TlsAcceptor>,
    cancel: CancellationToken,
}

impl TcpListener {
    /// Wait for the next socket; its TLS handshake runs in [`TcpAccepting::finish`]
    pub async fn accept(&self) -> Result<TcpAccepting, TransportError> {
        let (stream, remote) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::ListenerClosed),
            accepted = self.inner.accept() => accepted?,
        };
        let _ = stream.set_nodelay(true);
        let local = stream.local_addr()?;

        Ok(TcpAccepting {
            stream,
            local,
            remote,
            acceptor: self.acceptor.clone(),
        })
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.local_addr()?)
    }
}

impl fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpListener")
            .field("local", &self.inner.local_addr().ok())
            .field("tls", &self.acceptor.is_some())
            .finish()
    }
}

/// An accepted socket that has not finished connection setup
pub struct TcpAccepting {
    stream: TcpStream,
    local: SocketAddr,
    remote: SocketAddr,
    acceptor: Option<TlsAcceptor>,
}

impl TcpAccepting {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Run the server side of the TLS handshake, bounded by [`DIAL_TIMEOUT`]
    pub async fn finish(self) -> Result<TcpConnection, TransportError> {
        let remote = self.remote;
        let stream: BoxedStream = match self.acceptor {
            Some(acceptor) => {
                let tls = tokio::time::timeout(DIAL_TIMEOUT, acceptor.accept(self.stream))
                    .await
                    .map_err(|_| {
                        TransportError::Handshake(format!("TLS handshake with {} timed out", remote))
                    })?
                    .map_err(|e| TransportError::Handshake(format!("TLS handshake with {}: {}", remote, e)))?;
                Box::new(tls)
            }
            None => Box::new(self.stream),
        };

        Ok(TcpConnection::new(stream, self.local, remote))
    }
}

impl fmt::Debug for TcpAccepting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpAccepting")
            .field("remote", &self.remote)
            .field("tls", &self.acceptor.is_some())
            .finish()
    }
}

/// One TCP (or TLS over TCP) connection
pub struct TcpConnection {
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    local: SocketAddr,
    remote: SocketAddr,
    deadline: WriteDeadline,
    closed: CancellationToken,
}

impl TcpConnection {
    fn new(stream: BoxedStream, local: SocketAddr, remote: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(writer),
            local,
            remote,
            deadline: WriteDeadline::default(),
            closed: CancellationToken::new(),
        }
    }

    /// Wrap an already connected plaintext socket
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Self::new(Box::new(stream), local, remote))
    }

    pub fn take_reader(&self) -> Option<TcpReader> {
        let inner = self.reader.lock().ok()?.take()?;
        Some(TcpReader {
            inner,
            closed: self.closed.clone(),
        })
    }

    /// Write the whole buffer or fail
    pub async fn write(&self, payload: &[u8]) -> Result<usize, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut writer = self.writer.lock().await;
        let write = self.deadline.run(async {
            writer.write_all(payload).await?;
            writer.flush().await
        });

        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = write => result.map(|_| payload.len()),
        }
    }

    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn set_write_deadline(&self, deadline: Instant) {
        self.deadline.set(deadline);
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// Receive half of a [`TcpConnection`]
pub struct TcpReader {
    inner: ReadHalf<BoxedStream>,
    closed: CancellationToken,
}

impl TcpReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed locally",
            )),
            n = self.inner.read(buf) => n,
        }
    }
}

impl fmt::Debug for TcpReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpReader").finish_non_exhaustive()
    }
}

/// Two plaintext connections joined over loopback
#[cfg(test)]
pub(crate) async fn loopback_pair() -> (super::Connection, super::Connection) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (
        super::Connection::Stream(TcpConnection::from_tcp(dialed.unwrap()).unwrap()),
        super::Connection::Stream(TcpConnection::from_tcp(accepted.unwrap().0).unwrap()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::security::write_test_identity;

    async fn read_exact(reader: &mut TcpReader, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while out.len() < len {
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0, "unexpected EOF");
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    async fn accept_one(listener: &TcpListener) -> Result<TcpConnection, TransportError> {
        listener.accept().await?.finish().await
    }

    #[tokio::test]
    async fn test_plain_dial_and_echo() {
        let transport = TcpTransport::default();
        let listener = transport.listen(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = format!("127.0.0.1:{}", port);
        let (dialed, accepted) = tokio::join!(
            transport.dial_with_timeout(&target, Duration::ZERO),
            accept_one(&listener)
        );
        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();
        assert_eq!(dialed.remote_addr().port(), port);

        assert_eq!(dialed.write(b"hello").await.unwrap(), 5);
        let mut reader = accepted.take_reader().unwrap();
        assert!(accepted.take_reader().is_none());
        assert_eq!(read_exact(&mut reader, 5).await, b"hello");
    }

    #[tokio::test]
    async fn test_tls_dial_and_echo() {
        let dir = tempfile::tempdir().unwrap();
        let transport = TcpTransport::new(SecurityProvider::new(write_test_identity(dir.path())));
        let listener = transport.listen(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = format!("127.0.0.1:{}", port);
        let (dialed, accepted) = tokio::join!(
            transport.dial_with_timeout(&target, Duration::ZERO),
            accept_one(&listener)
        );
        let dialed = dialed.unwrap();
        let accepted = accepted.unwrap();

        accepted.write(b"secured").await.unwrap();
        let mut reader = dialed.take_reader().unwrap();
        assert_eq!(read_exact(&mut reader, 7).await, b"secured");
    }

    #[tokio::test]
    async fn test_silent_client_does_not_block_next_accept() {
        let dir = tempfile::tempdir().unwrap();
        let transport = TcpTransport::new(SecurityProvider::new(write_test_identity(dir.path())));
        let listener = transport.listen(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let _silent = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let stalled = listener.accept().await.unwrap();
        let stalled = tokio::spawn(stalled.finish());

        let target = format!("127.0.0.1:{}", port);
        let started = Instant::now();
        let (dialed, accepted) = tokio::join!(
            transport.dial_with_timeout(&target, Duration::from_secs(2)),
            accept_one(&listener)
        );
        assert!(dialed.is_ok());
        assert!(accepted.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
        stalled.abort();
    }

    #[tokio::test]
    async fn test_failed_tls_setup_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let transport = TcpTransport::new(SecurityProvider::new(write_test_identity(dir.path())));
        let listener = transport.listen(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut garbage = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        garbage.write_all(b"definitely not a client hello").await.unwrap();
        garbage.shutdown().await.unwrap();
        let err = listener.accept().await.unwrap().finish().await.unwrap_err();
        assert!(err.is_recoverable());

        let target = format!("127.0.0.1:{}", port);
        let (dialed, accepted) = tokio::join!(
            transport.dial_with_timeout(&target, Duration::ZERO),
            accept_one(&listener)
        );
        assert!(dialed.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let transport = TcpTransport::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = transport
            .dial_with_timeout(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Dial { transport: "TCP", .. }));
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let transport = TcpTransport::default();
        let first = transport.listen(0).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let err = transport.listen(port).await.unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_close_wakes_reader_and_peer() {
        let (a, b) = loopback_pair().await;
        let mut a_reader = a.take_reader().unwrap();
        let mut b_reader = b.take_reader().unwrap();

        a.close().await;
        let mut buf = [0u8; 8];
        assert!(a_reader.read(&mut buf).await.is_err());
        assert_eq!(b_reader.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(a.write(b"x").await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_listener_close_ends_accept() {
        let listener = TcpTransport::default().listen(0).await.unwrap();
        listener.close();
        assert!(matches!(
            listener.accept().await,
            Err(TransportError::ListenerClosed)
        ));
    }
}
