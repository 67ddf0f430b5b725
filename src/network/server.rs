//! Network server
//!
//! Composes the transport, neighbor table, dispatcher and background workers
//! into one running node.

use crate::config::{ConfigError, NetConfig};
use crate::ledger::LedgerQuery;
use crate::network::constants::{
    CHAN_CAPABILITY, CONN_MONITOR, DIAL_TIMEOUT, MAX_BUF_LEN, WRITE_DEADLINE,
};
use crate::network::dispatch::{Dispatcher, MessageHandler};
use crate::network::frame::Reassembler;
use crate::network::link::{Channel, Link, LinkError, LinkEvent, LinkState, RxContext};
use crate::network::liveness::RetryRegistry;
use crate::network::message::{
    build_frame, build_message, split_frame, Command, VersionPayload,
};
use crate::network::neighbor::NeighborTable;
use crate::network::protocol::{FrameSink, ProtocolHandler};
use crate::network::sync::SyncScheduler;
use crate::transport::{
    Accepting, Connection, Listener, Transport, TransportError, TransportRegistry,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Unknown peer: {0}")]
    UnknownPeer(u64),
    #[error("Server already started")]
    AlreadyStarted,
    #[error("Connection refused: {0}")]
    Refused(String),
}

/// A listener and the address it bound
type Bound = (Arc<Listener>, SocketAddr);

pub struct NetServer {
    id: u64,
    config: NetConfig,
    transport: Arc<Transport>,
    ledger: Arc<dyn LedgerQuery>,
    table: Arc<NeighborTable>,
    retry: RetryRegistry,
    sync: SyncScheduler,
    connecting: Mutex<HashSet<String>>,
    /// Links still in the version / verack exchange
    handshaking: Mutex<Vec<Arc<Link>>>,
    dispatcher: Dispatcher,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
    cancel: CancellationToken,
    listeners: Mutex<Vec<Arc<Listener>>>,
    data_addr: OnceLock<SocketAddr>,
    consensus_addr: OnceLock<SocketAddr>,
}

impl NetServer {
    /// Server running the built-in protocol handler, delivering application
    /// frames to `sink`
    pub fn new(
        config: NetConfig,
        registry: &TransportRegistry,
        ledger: Arc<dyn LedgerQuery>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Arc<Self>, ServerError> {
        config.validate()?;
        let transport = registry.get_transport(&config.transport)?;
        Ok(Self::with_handler(config, transport, ledger, move |server| {
            Arc::new(ProtocolHandler::new(server, sink))
        }))
    }

    /// Server whose frames go to a custom handler
    pub fn with_handler<F>(
        config: NetConfig,
        transport: Arc<Transport>,
        ledger: Arc<dyn LedgerQuery>,
        make_handler: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Weak<NetServer>) -> Arc<dyn MessageHandler>,
    {
        Arc::new_cyclic(|weak| {
            let handler = make_handler(weak.clone());
            let (events_tx, events_rx) = mpsc::channel(CHAN_CAPABILITY);
            let table = Arc::new(NeighborTable::new(config.max_connections));

            Self {
                id: rand::random(),
                sync: SyncScheduler::new(ledger.clone(), config.network_magic),
                dispatcher: Dispatcher::new(handler, config.worker_count),
                transport,
                ledger,
                table,
                retry: RetryRegistry::new(),
                connecting: Mutex::new(HashSet::new()),
                handshaking: Mutex::new(Vec::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                cancel: CancellationToken::new(),
                listeners: Mutex::new(Vec::new()),
                data_addr: OnceLock::new(),
                consensus_addr: OnceLock::new(),
                config,
            }
        })
    }

    // ===== Accessors =====

    /// Random id this node announces in `version`
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<NeighborTable> {
        &self.table
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerQuery> {
        &self.ledger
    }

    pub fn retry(&self) -> &RetryRegistry {
        &self.retry
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Bound data listener address, once started
    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.data_addr.get().copied()
    }

    pub fn consensus_addr(&self) -> Option<SocketAddr> {
        self.consensus_addr.get().copied()
    }

    fn rx_context(&self) -> RxContext {
        RxContext {
            dispatcher: self.dispatcher.clone(),
            events: self.events_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    // ===== Frames =====

    /// Frame raw payload bytes under this network's magic
    pub fn frame(&self, command: &str, payload: &[u8]) -> Bytes {
        build_frame(self.config.network_magic, command, payload)
    }

    pub fn message<T: Serialize>(&self, command: Command, payload: &T) -> Result<Bytes, ServerError> {
        Ok(build_message(self.config.network_magic, command, payload)?)
    }

    /// Our `version`, advertising the bound listener ports
    pub fn version_frame(&self, is_consensus: bool) -> Result<Bytes, ServerError> {
        let sync_port = self
            .data_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.node_port);
        let cons_port = if self.config.dual_port {
            self.consensus_addr()
                .map(|a| a.port())
                .unwrap_or(self.config.consensus_port)
        } else {
            0
        };

        let mut version = VersionPayload::new(
            self.id,
            sync_port,
            cons_port,
            self.ledger.current_block_height() as u64,
            self.config.relay,
        );
        version.is_consensus = is_consensus;
        self.message(Command::Version, &version)
    }

    // ===== Lifecycle =====

    /// Bind listeners and spawn every background worker
    ///
    /// Nothing is spawned unless every listener binds; a failed start may be
    /// retried.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        let events_rx = self
            .events_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or(ServerError::AlreadyStarted)?;

        let (data, consensus) = match self.bind_all().await {
            Ok(bound) => bound,
            Err(e) => {
                self.close_listeners();
                if let Ok(mut rx) = self.events_rx.lock() {
                    *rx = Some(events_rx);
                }
                return Err(e);
            }
        };

        let _ = self.data_addr.set(data.1);
        log::info!(
            "{} data listener on {:?}, node id {}",
            self.transport.protocol_name(),
            self.data_addr(),
            self.id
        );
        tokio::spawn(self.clone().accept_loop(data.0, Channel::Data));

        if let Some((consensus, addr)) = consensus {
            let _ = self.consensus_addr.set(addr);
            log::info!("Consensus listener on {}", addr);
            tokio::spawn(self.clone().accept_loop(consensus, Channel::Consensus));
        }

        tokio::spawn(self.clone().event_loop(events_rx));
        tokio::spawn(self.clone().heartbeat_loop());
        tokio::spawn(self.clone().monitor_loop());

        self.connect_seeds().await;
        Ok(())
    }

    async fn bind_all(&self) -> Result<(Bound, Option<Bound>), ServerError> {
        let data = self.bind(self.config.node_port).await?;
        let consensus = if self.config.dual_port {
            Some(self.bind(self.config.consensus_port).await?)
        } else {
            None
        };
        Ok((data, consensus))
    }

    async fn bind(&self, port: u16) -> Result<Bound, ServerError> {
        let listener = match self.transport.listen(port).await {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                log::error!("Failed to listen on port {}: {}", port, e);
                return Err(e.into());
            }
        };
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener.clone());
        }
        let addr = listener.local_addr()?;
        Ok((listener, addr))
    }

    /// Stop every worker, close listeners and drop all links
    pub async fn halt(&self) {
        log::info!("Halting network server {}", self.id);
        self.cancel.cancel();
        self.dispatcher.close();
        self.close_listeners();

        let pending: Vec<_> = self
            .handshaking
            .lock()
            .map(|mut h| h.drain(..).collect())
            .unwrap_or_default();
        for link in pending.into_iter().chain(self.table.drain().await) {
            link.shutdown().await;
        }
    }

    fn close_listeners(&self) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .map(|mut l| l.drain(..).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener.close();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn accept_loop(self: Arc<Self>, listener: Arc<Listener>, channel: Channel) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(accepting) => {
                    let remote = accepting.remote_addr();
                    let admitted = match channel {
                        Channel::Data => self.admit_inbound(remote).await,
                        Channel::Consensus => self.admit_reserved(remote),
                    };
                    if let Err(e) = admitted {
                        log::warn!("Refusing {:?} connection from {}: {}", channel, remote, e);
                        continue;
                    }
                    tokio::spawn(self.clone().setup_inbound(accepting, channel));
                }
                Err(e) if e.is_recoverable() => {
                    log::warn!("Accepting on {:?} listener failed: {}", channel, e);
                }
                Err(e) => {
                    if !self.cancel.is_cancelled() {
                        log::error!("{:?} listener stopped: {}", channel, e);
                    }
                    break;
                }
            }
        }
    }

    /// Finish transport setup of one inbound connection off the accept loop
    async fn setup_inbound(self: Arc<Self>, accepting: Accepting, channel: Channel) {
        let remote = accepting.remote_addr();
        let conn = tokio::select! {
            _ = self.cancel.cancelled() => return,
            finished = accepting.finish() => finished,
        };
        match conn {
            Ok(conn) => {
                log::info!("Inbound {:?} connection from {}", channel, remote);
                match channel {
                    Channel::Data => self.on_inbound(conn).await,
                    Channel::Consensus => self.accept_consensus(conn).await,
                }
            }
            Err(e) => log::warn!("Inbound connection setup failed: {}", e),
        }
    }

    async fn on_inbound(self: &Arc<Self>, conn: Connection) {
        if let Err(e) = self.admit_inbound(conn.remote_addr()).await {
            log::warn!("Refusing {}: {}", conn.remote_addr(), e);
            conn.close().await;
            return;
        }

        let link = Arc::new(Link::inbound(conn));
        link.transition(LinkState::Init, LinkState::Hand);
        self.watch_handshake(&link);
        self.spawn_data_rx(&link);
    }

    // ===== Admission =====

    fn admit_reserved(&self, remote: SocketAddr) -> Result<(), ServerError> {
        if self.config.is_reserved_socket(remote) {
            Ok(())
        } else {
            Err(ServerError::Refused(format!("{} is not a reserved peer", remote)))
        }
    }

    /// Check an inbound connection against the reserved list and the caps
    async fn admit_inbound(&self, remote: SocketAddr) -> Result<(), ServerError> {
        self.admit_reserved(remote)?;

        let links = self.tracked_links().await;
        if links.len() >= self.config.max_connections {
            return Err(ServerError::Refused(format!(
                "{} connections, at max_connections",
                links.len()
            )));
        }
        let inbound: Vec<_> = links.iter().filter(|l| !l.is_outbound()).collect();
        if inbound.len() >= self.config.max_conn_in_bound {
            return Err(ServerError::Refused(format!(
                "{} inbound connections, at max_conn_in_bound",
                inbound.len()
            )));
        }
        let same_ip = inbound
            .iter()
            .filter(|l| l.addr().ip() == remote.ip())
            .count();
        if same_ip >= self.config.max_conn_in_bound_per_ip {
            return Err(ServerError::Refused(format!(
                "{} inbound connections from {}, at max_conn_in_bound_per_ip",
                same_ip,
                remote.ip()
            )));
        }
        Ok(())
    }

    /// Check a dial target against the reserved list and the outbound cap
    async fn admit_outbound(&self, addr: &str) -> Result<(), ServerError> {
        if !self.config.is_reserved(addr) {
            return Err(ServerError::Refused(format!("{} is not a reserved peer", addr)));
        }
        let dialing = self.connecting.lock().map(|c| c.len()).unwrap_or(0);
        let outbound = self
            .tracked_links()
            .await
            .iter()
            .filter(|l| l.is_outbound())
            .count()
            + dialing;
        if outbound >= self.config.max_conn_out_bound {
            return Err(ServerError::Refused(format!(
                "{} outbound connections, at max_conn_out_bound",
                outbound
            )));
        }
        Ok(())
    }

    /// Neighbor table entries plus links still handshaking
    async fn tracked_links(&self) -> Vec<Arc<Link>> {
        let mut links = self.table.all().await;
        links.extend(self.live_handshakes());
        links
    }

    fn live_handshakes(&self) -> Vec<Arc<Link>> {
        self.handshaking
            .lock()
            .map(|mut pending| {
                pending.retain(|l| {
                    !matches!(l.state(), LinkState::Establish | LinkState::Inactivity)
                });
                pending.clone()
            })
            .unwrap_or_default()
    }

    /// Links that have connected but not yet finished the handshake
    pub fn handshaking_count(&self) -> usize {
        self.live_handshakes().len()
    }

    /// Shut `link` down unless it establishes within the handshake timeout
    fn watch_handshake(self: &Arc<Self>, link: &Arc<Link>) {
        if let Ok(mut pending) = self.handshaking.lock() {
            pending.push(link.clone());
        }

        let server = self.clone();
        let link = link.clone();
        let timeout = self.config.handshake_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = server.cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if matches!(
                        link.state(),
                        LinkState::Hand | LinkState::HandShake | LinkState::HandShaked
                    ) {
                        log::warn!("Handshake with {} timed out after {:?}", link.addr(), timeout);
                        link.shutdown().await;
                    }
                }
            }
            if let Ok(mut pending) = server.handshaking.lock() {
                pending.retain(|l| !Arc::ptr_eq(l, &link));
            }
        });
    }

    fn spawn_data_rx(&self, link: &Arc<Link>) {
        match link.take_data_reader() {
            Some(reader) => {
                link.spawn_rx(
                    Channel::Data,
                    link.data_conn(),
                    reader,
                    Reassembler::new(self.config.network_magic),
                    self.rx_context(),
                );
            }
            None => log::error!("Data reader of {} already taken", link.addr()),
        }
    }

    // ===== Outbound =====

    fn begin_connecting(&self, addr: &str) -> bool {
        self.connecting
            .lock()
            .map(|mut c| c.insert(addr.to_string()))
            .unwrap_or(false)
    }

    fn end_connecting(&self, addr: &str) {
        if let Ok(mut c) = self.connecting.lock() {
            c.remove(addr);
        }
    }

    pub fn is_connecting(&self, addr: &str) -> bool {
        self.connecting
            .lock()
            .map(|c| c.contains(addr))
            .unwrap_or(false)
    }

    /// Dial `addr` and start the handshake
    ///
    /// Dialing an existing neighbor, or an address already being dialed, is a
    /// no-op. A failed dial puts the address on the retry list.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<(), ServerError> {
        if self.is_halted() {
            return Ok(());
        }
        if self.table.is_addr_neighbor(addr).await {
            log::debug!("{} is already a neighbor", addr);
            return Ok(());
        }
        if self.is_connecting(addr) {
            log::debug!("Already connecting to {}", addr);
            return Ok(());
        }
        if let Err(e) = self.admit_outbound(addr).await {
            log::debug!("Not dialing {}: {}", addr, e);
            return Err(e);
        }
        if !self.begin_connecting(addr) {
            log::debug!("Already connecting to {}", addr);
            return Ok(());
        }

        let dialed = self.transport.dial_with_timeout(addr, DIAL_TIMEOUT).await;
        self.end_connecting(addr);
        let conn = match dialed {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Dial {} failed: {}", addr, e);
                self.retry.insert(addr);
                return Err(e.into());
            }
        };

        log::info!("Connected to {}", addr);
        let link = Arc::new(Link::outbound(conn, addr));
        link.transition(LinkState::Init, LinkState::Hand);
        self.watch_handshake(&link);
        self.spawn_data_rx(&link);

        let version = self.version_frame(false)?;
        if let Err(e) = link.tx(&version).await {
            log::warn!("Sending version to {} failed: {}", addr, e);
            link.shutdown().await;
            self.retry.insert(addr);
            return Err(e.into());
        }
        Ok(())
    }

    /// Open the dedicated consensus connection of an established link
    pub async fn connect_consensus(self: &Arc<Self>, link: Arc<Link>) -> Result<(), ServerError> {
        let Some(addr) = link.consensus_addr() else {
            return Ok(());
        };
        let addr = addr.to_string();

        let conn = Arc::new(self.transport.dial_with_timeout(&addr, DIAL_TIMEOUT).await?);
        let Some(reader) = conn.take_reader() else {
            return Ok(());
        };

        conn.set_write_deadline(Instant::now() + WRITE_DEADLINE);
        conn.write(&self.version_frame(true)?).await?;
        link.attach_consensus(conn.clone()).await?;
        link.spawn_rx(
            Channel::Consensus,
            conn,
            reader,
            Reassembler::new(self.config.network_magic),
            self.rx_context(),
        );
        log::info!("Consensus channel to {} ({}) open", link.id(), addr);
        Ok(())
    }

    /// Bind an inbound consensus connection to its link
    ///
    /// The first frame must be a consensus `version` naming an established
    /// neighbor at the connection's remote IP, and that neighbor must not
    /// have a consensus connection yet. Anything else closes the connection.
    async fn accept_consensus(self: Arc<Self>, conn: Connection) {
        let conn = Arc::new(conn);
        let Some(mut reader) = conn.take_reader() else {
            return;
        };
        let mut rx = Reassembler::new(self.config.network_magic);
        let mut frames = Vec::new();
        let mut buf = vec![0u8; MAX_BUF_LEN];

        let first = tokio::time::timeout(DIAL_TIMEOUT, async {
            while frames.is_empty() {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => return false,
                    Ok(n) => {
                        if rx.feed(&buf[..n], &mut frames).is_err() {
                            return false;
                        }
                    }
                }
            }
            true
        })
        .await;
        if !matches!(first, Ok(true)) {
            log::warn!("No consensus version from {}", conn.remote_addr());
            conn.close().await;
            return;
        }

        let mut frames = frames.into_iter();
        let link = match frames.next() {
            Some(first) => self.consensus_owner(&first, conn.remote_addr()).await,
            None => None,
        };
        let Some(link) = link else {
            log::warn!("Unbound consensus connection from {}", conn.remote_addr());
            conn.close().await;
            return;
        };

        if let Err(e) = link.attach_consensus(conn.clone()).await {
            log::warn!(
                "Consensus connection from {} for {} refused: {}",
                conn.remote_addr(),
                link.id(),
                e
            );
            return;
        }
        for frame in frames {
            self.dispatcher
                .submit(link.clone(), Channel::Consensus, frame)
                .await;
        }
        link.spawn_rx(Channel::Consensus, conn, reader, rx, self.rx_context());
        log::info!("Consensus channel from {} bound", link.id());
    }

    /// Resolve the established link a consensus `version` frame names
    async fn consensus_owner(&self, frame: &Bytes, remote: SocketAddr) -> Option<Arc<Link>> {
        let (header, payload) = split_frame(frame).ok()?;
        if header.command() != Some(Command::Version) || !header.verify_checksum(&payload) {
            return None;
        }
        let version: VersionPayload = serde_json::from_slice(&payload).ok()?;
        if !version.is_consensus {
            return None;
        }
        self.table
            .get_nbr_node(version.nonce)
            .await
            .filter(|l| l.is_established() && l.addr().ip() == remote.ip())
    }

    // ===== Link events =====

    /// Called by the handler once a link reaches ESTABLISH
    pub(crate) async fn on_established(self: &Arc<Self>, link: &Arc<Link>) -> bool {
        if !self.table.add_nbr_node(link.clone()).await {
            link.shutdown().await;
            return false;
        }
        self.retry.remove(&link.reconnect_addr());
        log::info!(
            "Peer {} ({}) established, height {}",
            link.id(),
            link.addr(),
            link.height()
        );

        if let Ok(frame) = self.message(Command::GetAddr, &()) {
            if let Err(e) = link.tx(&frame).await {
                log::debug!("getaddr to {} failed: {}", link.addr(), e);
            }
        }

        if link.is_outbound() && self.config.dual_port && link.consensus_addr().is_some() {
            let server = self.clone();
            let link = link.clone();
            tokio::spawn(async move {
                if let Err(e) = server.connect_consensus(link.clone()).await {
                    log::warn!("Consensus channel to {} failed: {}", link.addr(), e);
                }
            });
        }
        true
    }

    /// Shut a link down and drop it from the table
    pub async fn disconnect(&self, link: &Arc<Link>) {
        link.shutdown().await;
        self.table.del_if_same(link).await;
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<LinkEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(LinkEvent::Disconnected {
                    link,
                    channel,
                    conn,
                    reason,
                }) => self.on_disconnected(link, channel, conn, reason).await,
                None => break,
            }
        }
    }

    async fn on_disconnected(
        &self,
        link: Arc<Link>,
        channel: Channel,
        conn: Arc<Connection>,
        reason: String,
    ) {
        match channel {
            Channel::Data => {
                link.shutdown().await;
                let removed = self.table.del_if_same(&link).await;
                log::info!(
                    "Peer {} ({}) went inactive: {}",
                    link.id(),
                    link.addr(),
                    reason
                );
                // a duplicate that lost to a live link for the same peer
                let superseded = match self.table.get_nbr_node(link.id()).await {
                    Some(current) => {
                        !Arc::ptr_eq(&current, &link) && current.state() != LinkState::Inactivity
                    }
                    None => false,
                };
                if !superseded && (removed || (link.is_outbound() && link.id() != 0)) {
                    self.retry.insert(&link.reconnect_addr());
                }
            }
            Channel::Consensus => {
                if link.detach_consensus_if(&conn).await {
                    log::info!("Consensus channel of {} lost: {}", link.id(), reason);
                } else {
                    log::debug!("Stale consensus connection of {} closed: {}", link.id(), reason);
                }
            }
        }
    }

    // ===== Sending =====

    /// Broadcast a complete frame to every established, relaying neighbor
    pub async fn broadcast(&self, frame: Bytes, consensus: bool) -> usize {
        self.table.broadcast(frame, consensus).await
    }

    /// Send a complete frame to one neighbor
    pub async fn send(&self, peer_id: u64, frame: &[u8], consensus: bool) -> Result<(), ServerError> {
        let link = self
            .table
            .get_nbr_node(peer_id)
            .await
            .ok_or(ServerError::UnknownPeer(peer_id))?;
        let channel = if consensus {
            Channel::Consensus
        } else {
            Channel::Data
        };
        link.send(channel, frame).await?;
        Ok(())
    }

    // ===== Workers =====

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.period_update());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.ping_neighbors().await;
            self.check_heartbeats().await;
            self.sync.request_headers(&self.table, self.config.min_node_count()).await;
            self.sync.sync_blocks(&self.table).await;
        }
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CONN_MONITOR);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.fetch_retry_from_neighbors().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.reconnect_pass() => {}
            }
            self.connect_seeds().await;
        }
    }
}
