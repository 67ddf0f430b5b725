//! Link: the live connection state for one remote node
//!
//! A link owns the data connection, an optional consensus connection, the
//! lifecycle state and the bookkeeping the scheduler needs (reported height,
//! flight heights, last receive time). One receive task runs per physical
//! connection.

use crate::network::constants::{MAX_BUF_LEN, WRITE_DEADLINE};
use crate::network::dispatch::Dispatcher;
use crate::network::frame::Reassembler;
use crate::transport::{Connection, ConnectionReader, TransportError};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Link errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link is inactive")]
    Inactive,
    #[error("No consensus channel attached")]
    NoConsensusChannel,
    #[error("A consensus channel is already attached")]
    ConsensusBound,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Lifecycle of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkState {
    /// Constructed, not connected
    Init = 0,
    /// Connected, handshake not started
    Hand = 1,
    /// Inbound side: peer's version received, ours sent
    HandShake = 2,
    /// Outbound side: peer's version received, verack sent
    HandShaked = 3,
    Establish = 4,
    /// Terminal
    Inactivity = 5,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkState::Init,
            1 => LinkState::Hand,
            2 => LinkState::HandShake,
            3 => LinkState::HandShaked,
            4 => LinkState::Establish,
            _ => LinkState::Inactivity,
        }
    }

    /// Whether `self -> to` is a legal lifecycle edge
    pub fn can_transition(self, to: LinkState) -> bool {
        use LinkState::*;
        match (self, to) {
            (Inactivity, _) => false,
            (_, Inactivity) => true,
            (Init, Hand) => true,
            (Hand, HandShake) | (Hand, HandShaked) => true,
            (HandShake, Establish) | (HandShaked, Establish) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Init => "INIT",
            LinkState::Hand => "HAND",
            LinkState::HandShake => "HAND_SHAKE",
            LinkState::HandShaked => "HAND_SHAKED",
            LinkState::Establish => "ESTABLISH",
            LinkState::Inactivity => "INACTIVITY",
        };
        f.write_str(name)
    }
}

/// Logical channel of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Data,
    Consensus,
}

/// Notifications raised by receive tasks
#[derive(Debug)]
pub enum LinkEvent {
    Disconnected {
        link: Arc<Link>,
        channel: Channel,
        /// The connection whose receive loop ended
        conn: Arc<Connection>,
        reason: String,
    },
}

/// What a receive task needs besides the link itself
#[derive(Clone)]
pub struct RxContext {
    pub dispatcher: Dispatcher,
    pub events: mpsc::Sender<LinkEvent>,
    pub cancel: CancellationToken,
}

pub struct Link {
    id: AtomicU64,
    addr: SocketAddr,
    outbound: bool,
    /// Address this link was dialed on, if outbound
    dial_addr: Option<String>,
    state: AtomicU8,
    data: Arc<Connection>,
    consensus: RwLock<Option<Arc<Connection>>>,
    last_rx: Mutex<Instant>,
    height: AtomicU64,
    relay: AtomicBool,
    sync_port: AtomicU16,
    consensus_port: AtomicU16,
    flights: Mutex<BTreeSet<u32>>,
}

impl Link {
    /// Wrap an accepted connection
    pub fn inbound(conn: Connection) -> Self {
        Self::new(conn, false, None)
    }

    /// Wrap a connection dialed on `addr`
    pub fn outbound(conn: Connection, addr: &str) -> Self {
        Self::new(conn, true, Some(addr.to_string()))
    }

    fn new(conn: Connection, outbound: bool, dial_addr: Option<String>) -> Self {
        Self {
            id: AtomicU64::new(0),
            addr: conn.remote_addr(),
            outbound,
            dial_addr,
            state: AtomicU8::new(LinkState::Init as u8),
            data: Arc::new(conn),
            consensus: RwLock::new(None),
            last_rx: Mutex::new(Instant::now()),
            height: AtomicU64::new(0),
            relay: AtomicBool::new(true),
            sync_port: AtomicU16::new(0),
            consensus_port: AtomicU16::new(0),
            flights: Mutex::new(BTreeSet::new()),
        }
    }

    // ===== Identity =====

    /// Peer id learned from its `version`; 0 before the handshake
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Release);
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Address to dial when this peer has to be reached again
    pub fn reconnect_addr(&self) -> String {
        match &self.dial_addr {
            Some(addr) => addr.clone(),
            None => SocketAddr::new(self.addr.ip(), self.sync_port()).to_string(),
        }
    }

    /// Address of the peer's consensus listener, if it offers one
    pub fn consensus_addr(&self) -> Option<SocketAddr> {
        match self.consensus_port() {
            0 => None,
            port => Some(SocketAddr::new(self.addr.ip(), port)),
        }
    }

    // ===== Lifecycle =====

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_established(&self) -> bool {
        self.state() == LinkState::Establish
    }

    /// Move `from -> to` if the link is still in `from` and the edge is legal
    pub fn transition(&self, from: LinkState, to: LinkState) -> bool {
        if !from.can_transition(to) {
            return false;
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter INACTIVITY; returns false if the link already was inactive
    pub fn mark_inactive(&self) -> bool {
        self.state.swap(LinkState::Inactivity as u8, Ordering::AcqRel) != LinkState::Inactivity as u8
    }

    /// Mark inactive and close every connection
    pub async fn shutdown(&self) {
        if self.mark_inactive() {
            log::debug!("Link {} ({}) shutting down", self.id(), self.addr);
        }
        self.data.close().await;
        if let Some(conn) = self.take_consensus() {
            conn.close().await;
        }
    }

    // ===== Peer info =====

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Acquire)
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Release);
    }

    pub fn relay(&self) -> bool {
        self.relay.load(Ordering::Acquire)
    }

    pub fn set_relay(&self, relay: bool) {
        self.relay.store(relay, Ordering::Release);
    }

    pub fn sync_port(&self) -> u16 {
        self.sync_port.load(Ordering::Acquire)
    }

    pub fn consensus_port(&self) -> u16 {
        self.consensus_port.load(Ordering::Acquire)
    }

    pub fn set_ports(&self, sync_port: u16, consensus_port: u16) {
        self.sync_port.store(sync_port, Ordering::Release);
        self.consensus_port.store(consensus_port, Ordering::Release);
    }

    pub fn update_rx_time(&self) {
        if let Ok(mut last) = self.last_rx.lock() {
            *last = Instant::now();
        }
    }

    /// Time since the data channel last delivered bytes
    pub fn rx_elapsed(&self) -> Duration {
        self.last_rx
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn set_last_rx(&self, at: Instant) {
        if let Ok(mut last) = self.last_rx.lock() {
            *last = at;
        }
    }

    // ===== Flight heights =====

    /// Record a requested height; false if it was already in flight
    pub fn add_flight(&self, height: u32) -> bool {
        self.flights
            .lock()
            .map(|mut f| f.insert(height))
            .unwrap_or(false)
    }

    pub fn remove_flight(&self, height: u32) -> bool {
        self.flights
            .lock()
            .map(|mut f| f.remove(&height))
            .unwrap_or(false)
    }

    /// Drop every flight at or below `height`
    pub fn prune_flights(&self, height: u32) {
        if let Ok(mut flights) = self.flights.lock() {
            *flights = flights.split_off(&height.saturating_add(1));
        }
    }

    pub fn flight_heights(&self) -> Vec<u32> {
        self.flights
            .lock()
            .map(|f| f.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn flight_count(&self) -> usize {
        self.flights.lock().map(|f| f.len()).unwrap_or(0)
    }

    // ===== Channels =====

    pub fn has_consensus(&self) -> bool {
        self.consensus
            .read()
            .map(|c| c.is_some())
            .unwrap_or(false)
    }

    fn consensus_conn(&self) -> Option<Arc<Connection>> {
        self.consensus.read().ok().and_then(|c| c.clone())
    }

    fn take_consensus(&self) -> Option<Arc<Connection>> {
        self.consensus.write().ok().and_then(|mut c| c.take())
    }

    /// Bind a consensus connection to this link
    ///
    /// The slot must be empty; a refused connection is closed.
    pub async fn attach_consensus(&self, conn: Arc<Connection>) -> Result<(), LinkError> {
        if self.state() == LinkState::Inactivity {
            conn.close().await;
            return Err(LinkError::Inactive);
        }
        let refused = match self.consensus.write() {
            Ok(mut slot) if slot.is_none() => {
                *slot = Some(conn);
                None
            }
            _ => Some(conn),
        };
        match refused {
            Some(conn) => {
                conn.close().await;
                Err(LinkError::ConsensusBound)
            }
            None => Ok(()),
        }
    }

    /// Close `conn`, forgetting it only if it is the attached consensus
    /// connection; returns whether it was
    pub async fn detach_consensus_if(&self, conn: &Arc<Connection>) -> bool {
        let attached = match self.consensus.write() {
            Ok(mut slot) => match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, conn) => slot.take().is_some(),
                _ => false,
            },
            Err(_) => false,
        };
        conn.close().await;
        attached
    }

    /// Write a frame on the given channel
    ///
    /// Writes to an inactive link are dropped. Without a dedicated consensus
    /// connection, consensus traffic goes over the data connection.
    pub async fn send(&self, channel: Channel, frame: &[u8]) -> Result<(), LinkError> {
        if self.state() == LinkState::Inactivity {
            return Ok(());
        }
        let conn = match channel {
            Channel::Data => self.data.clone(),
            Channel::Consensus => self
                .consensus_conn()
                .unwrap_or_else(|| self.data.clone()),
        };
        conn.set_write_deadline(Instant::now() + WRITE_DEADLINE);
        conn.write(frame).await?;
        Ok(())
    }

    pub async fn tx(&self, frame: &[u8]) -> Result<(), LinkError> {
        self.send(Channel::Data, frame).await
    }

    /// Write on the dedicated consensus connection only
    pub async fn consensus_tx(&self, frame: &[u8]) -> Result<(), LinkError> {
        if self.state() == LinkState::Inactivity {
            return Ok(());
        }
        let conn = self.consensus_conn().ok_or(LinkError::NoConsensusChannel)?;
        conn.set_write_deadline(Instant::now() + WRITE_DEADLINE);
        conn.write(frame).await?;
        Ok(())
    }

    /// Take the data connection's receive side; only the first call gets it
    pub fn take_data_reader(&self) -> Option<ConnectionReader> {
        self.data.take_reader()
    }

    pub fn data_conn(&self) -> Arc<Connection> {
        self.data.clone()
    }

    // ===== Receive =====

    /// Run the receive loop for one channel on its own task
    ///
    /// `rx` may already hold a partial frame, as when the first frame of a
    /// consensus connection was read before the link was known.
    pub fn spawn_rx(
        self: &Arc<Self>,
        channel: Channel,
        conn: Arc<Connection>,
        reader: ConnectionReader,
        rx: Reassembler,
        ctx: RxContext,
    ) -> JoinHandle<()> {
        let link = self.clone();
        tokio::spawn(async move { link.rx_loop(channel, conn, reader, rx, ctx).await })
    }

    async fn rx_loop(
        self: Arc<Self>,
        channel: Channel,
        conn: Arc<Connection>,
        mut reader: ConnectionReader,
        mut rx: Reassembler,
        ctx: RxContext,
    ) {
        let mut buf = vec![0u8; MAX_BUF_LEN];
        let mut frames: Vec<Bytes> = Vec::new();

        let reason = loop {
            let read = tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => break "connection closed by peer".to_string(),
                Ok(n) => {
                    if channel == Channel::Data {
                        self.update_rx_time();
                    }
                    let fed = rx.feed(&buf[..n], &mut frames);
                    for frame in frames.drain(..) {
                        ctx.dispatcher.submit(self.clone(), channel, frame).await;
                    }
                    if let Err(e) = fed {
                        log::warn!("Dropping {:?} channel of {}: {}", channel, self.addr, e);
                        break e.to_string();
                    }
                }
                Err(e) => break e.to_string(),
            }
        };

        log::info!(
            "Peer {} ({}) {:?} channel disconnected: {}",
            self.id(),
            self.addr,
            channel,
            reason
        );
        let event = LinkEvent::Disconnected {
            link: self,
            channel,
            conn,
            reason,
        };
        if ctx.events.send(event).await.is_err() {
            log::debug!("Link event channel closed");
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id())
            .field("addr", &self.addr)
            .field("outbound", &self.outbound)
            .field("state", &self.state())
            .field("height", &self.height())
            .finish()
    }
}
