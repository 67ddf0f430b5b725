//! Pluggable transports
//!
//! Two substrates sit behind one contract:
//! - a reliable ordered stream (TCP, optionally wrapped in TLS)
//! - a multiplexed transport (QUIC) where every write travels on its own
//!   unidirectional stream
//!
//! The rest of the crate only sees [`Transport`], [`Connection`],
//! [`ConnectionReader`], [`Listener`] and [`Accepting`]. Each is a closed
//! set of variants so a match over them is checked by the compiler.

pub mod quic;
pub mod registry;
pub mod security;
pub mod tcp;

pub use quic::{QuicAccepting, QuicConnection, QuicListener, QuicReader, QuicTransport};
pub use registry::TransportRegistry;
pub use security::{SecurityError, SecurityProvider};
pub use tcp::{TcpAccepting, TcpConnection, TcpListener, TcpReader, TcpTransport};

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Protocol code of the stream transport, exchanged during negotiation
pub const T_TCP: i32 = 1;
/// Protocol code of the multiplexed transport
pub const T_QUIC: i32 = 2;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{transport} dial {address} failed: {detail}")]
    Dial {
        transport: &'static str,
        address: String,
        detail: String,
    },
    #[error("Transport not found: {0}")]
    NotFound(String),
    #[error("{transport} listen on port {port} failed: {detail}")]
    Bind {
        transport: &'static str,
        port: u16,
        detail: String,
    },
    #[error("Connection setup failed: {0}")]
    Handshake(String),
    #[error("Listener closed")]
    ListenerClosed,
    #[error("Connection closed")]
    Closed,
    #[error("Write deadline exceeded")]
    WriteTimeout,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Security configuration error: {0}")]
    Security(#[from] SecurityError),
}

impl TransportError {
    /// Whether an accept loop may keep going after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Handshake(_) | TransportError::Io(_))
    }
}

/// Deadline applied to the next writes on a connection
#[derive(Debug, Default)]
pub(crate) struct WriteDeadline {
    at: Mutex<Option<Instant>>,
}

impl WriteDeadline {
    pub(crate) fn set(&self, deadline: Instant) {
        if let Ok(mut at) = self.at.lock() {
            *at = Some(deadline);
        }
    }

    fn current(&self) -> Option<Instant> {
        self.at.lock().ok().and_then(|at| *at)
    }

    /// Run a write, failing with `WriteTimeout` once the deadline passes
    pub(crate) async fn run<T, F>(&self, write: F) -> Result<T, TransportError>
    where
        F: Future<Output = io::Result<T>>,
    {
        match self.current() {
            Some(deadline) => match tokio::time::timeout_at(deadline, write).await {
                Ok(result) => result.map_err(TransportError::Io),
                Err(_) => Err(TransportError::WriteTimeout),
            },
            None => write.await.map_err(TransportError::Io),
        }
    }
}

/// A transport capable of dialing and listening
#[derive(Debug)]
pub enum Transport {
    Stream(TcpTransport),
    Multiplexed(QuicTransport),
}

impl Transport {
    /// Dial with the transport's default timeout
    pub async fn dial(&self, addr: &str) -> Result<Connection, TransportError> {
        self.dial_with_timeout(addr, Duration::ZERO).await
    }

    /// Dial, giving up after `timeout`; a zero timeout means the default
    pub async fn dial_with_timeout(
        &self,
        addr: &str,
        timeout: Duration,
    ) -> Result<Connection, TransportError> {
        match self {
            Transport::Stream(t) => t.dial_with_timeout(addr, timeout).await.map(Connection::Stream),
            Transport::Multiplexed(t) => t
                .dial_with_timeout(addr, timeout)
                .await
                .map(Connection::Multiplexed),
        }
    }

    /// Bind a listener on all interfaces
    pub async fn listen(&self, port: u16) -> Result<Listener, TransportError> {
        match self {
            Transport::Stream(t) => t.listen(port).await.map(Listener::Stream),
            Transport::Multiplexed(t) => t.listen(port).await.map(Listener::Multiplexed),
        }
    }

    pub fn protocol_code(&self) -> i32 {
        match self {
            Transport::Stream(_) => T_TCP,
            Transport::Multiplexed(_) => T_QUIC,
        }
    }

    pub fn protocol_name(&self) -> &'static str {
        match self {
            Transport::Stream(_) => tcp::PROTOCOL_NAME,
            Transport::Multiplexed(_) => quic::PROTOCOL_NAME,
        }
    }

    /// Suggested interval between repeated requests to one peer, in seconds
    pub fn request_interval_hint(&self) -> u64 {
        match self {
            Transport::Stream(_) => tcp::REQ_INTERVAL,
            Transport::Multiplexed(_) => quic::REQ_INTERVAL,
        }
    }
}

/// An established connection to a remote node
#[derive(Debug)]
pub enum Connection {
    Stream(TcpConnection),
    Multiplexed(QuicConnection),
}

impl Connection {
    /// Take the receive side; only the first call gets it
    pub fn take_reader(&self) -> Option<ConnectionReader> {
        match self {
            Connection::Stream(c) => c.take_reader().map(ConnectionReader::Stream),
            Connection::Multiplexed(c) => c.take_reader().map(ConnectionReader::Multiplexed),
        }
    }

    pub async fn write(&self, payload: &[u8]) -> Result<usize, TransportError> {
        match self {
            Connection::Stream(c) => c.write(payload).await,
            Connection::Multiplexed(c) => c.write(payload).await,
        }
    }

    /// Close the connection; a blocked reader wakes up
    pub async fn close(&self) {
        match self {
            Connection::Stream(c) => c.close().await,
            Connection::Multiplexed(c) => c.close(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Connection::Stream(c) => c.local_addr(),
            Connection::Multiplexed(c) => c.local_addr(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            Connection::Stream(c) => c.remote_addr(),
            Connection::Multiplexed(c) => c.remote_addr(),
        }
    }

    /// Writes that have not finished by `deadline` fail with `WriteTimeout`
    pub fn set_write_deadline(&self, deadline: Instant) {
        match self {
            Connection::Stream(c) => c.set_write_deadline(deadline),
            Connection::Multiplexed(c) => c.set_write_deadline(deadline),
        }
    }
}

/// Receive side of a [`Connection`]
#[derive(Debug)]
pub enum ConnectionReader {
    Stream(TcpReader),
    Multiplexed(QuicReader),
}

impl ConnectionReader {
    /// Read into `buf`; `Ok(0)` means the peer finished
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ConnectionReader::Stream(r) => r.read(buf).await,
            ConnectionReader::Multiplexed(r) => r.read(buf).await,
        }
    }
}

/// A bound listener
#[derive(Debug)]
pub enum Listener {
    Stream(TcpListener),
    Multiplexed(QuicListener),
}

impl Listener {
    /// Wait for the next inbound connection attempt
    ///
    /// Security setup runs later in [`Accepting::finish`]. An error here
    /// means the listener is gone.
    pub async fn accept(&self) -> Result<Accepting, TransportError> {
        match self {
            Listener::Stream(l) => l.accept().await.map(Accepting::Stream),
            Listener::Multiplexed(l) => l.accept().await.map(Accepting::Multiplexed),
        }
    }

    pub fn close(&self) {
        match self {
            Listener::Stream(l) => l.close(),
            Listener::Multiplexed(l) => l.close(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        match self {
            Listener::Stream(l) => l.local_addr(),
            Listener::Multiplexed(l) => l.local_addr(),
        }
    }
}

/// An inbound connection still completing its setup handshake
#[derive(Debug)]
pub enum Accepting {
    Stream(TcpAccepting),
    Multiplexed(QuicAccepting),
}

impl Accepting {
    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            Accepting::Stream(a) => a.remote_addr(),
            Accepting::Multiplexed(a) => a.remote_addr(),
        }
    }

    /// Complete setup; errors for which [`TransportError::is_recoverable`]
    /// holds concern only this connection
    pub async fn finish(self) -> Result<Connection, TransportError> {
        match self {
            Accepting::Stream(a) => a.finish().await.map(Connection::Stream),
            Accepting::Multiplexed(a) => a.finish().await.map(Connection::Multiplexed),
        }
    }
}

/// Resolve a host:port string to its first socket address
pub(crate) async fn resolve(addr: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(TransportError::Handshake("bad cert".into()).is_recoverable());
        assert!(!TransportError::ListenerClosed.is_recoverable());
        assert!(!TransportError::NotFound("udp".into()).is_recoverable());
    }

    #[tokio::test]
    async fn test_write_deadline_expires() {
        let deadline = WriteDeadline::default();
        deadline.set(Instant::now() + Duration::from_millis(10));

        let result = deadline
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), io::Error>(())
            })
            .await;
        assert!(matches!(result, Err(TransportError::WriteTimeout)));
    }

    #[tokio::test]
    async fn test_no_deadline_runs_to_completion() {
        let deadline = WriteDeadline::default();
        let result = deadline.run(async { Ok::<usize, io::Error>(5) }).await.unwrap();
        assert_eq!(result, 5);
    }
}
