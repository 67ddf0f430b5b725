//! Neighbor table
//!
//! Concurrent registry of established peers keyed by peer id.

use crate::network::link::{Channel, Link, LinkState};
use crate::network::message::{PeerAddr, ServiceFlags};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct NeighborTable {
    peers: RwLock<HashMap<u64, Arc<Link>>>,
    max_peers: usize,
}

impl NeighborTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_peers,
        }
    }

    /// Insert a link under its id
    ///
    /// A duplicate id is a no-op: the existing link is kept and `false` is
    /// returned. A full table also refuses the link.
    pub async fn add_nbr_node(&self, link: Arc<Link>) -> bool {
        let mut peers = self.peers.write().await;
        let id = link.id();

        if peers.contains_key(&id) {
            log::warn!("Neighbor {} ({}) already present, keeping existing link", id, link.addr());
            return false;
        }
        if peers.len() >= self.max_peers {
            log::warn!("Neighbor table full ({}), refusing {}", self.max_peers, link.addr());
            return false;
        }

        peers.insert(id, link);
        log::info!("Added neighbor {} (total: {})", id, peers.len());
        true
    }

    pub async fn del_nbr_node(&self, id: u64) -> Option<Arc<Link>> {
        let removed = self.peers.write().await.remove(&id);
        if let Some(link) = &removed {
            log::info!("Removed neighbor {} ({})", id, link.addr());
        }
        removed
    }

    /// Remove `link` only if it is the entry stored under its id
    pub async fn del_if_same(&self, link: &Arc<Link>) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(&link.id()) {
            Some(current) if Arc::ptr_eq(current, link) => {
                peers.remove(&link.id());
                log::info!("Removed neighbor {} ({})", link.id(), link.addr());
                true
            }
            _ => false,
        }
    }

    pub async fn get_nbr_node(&self, id: u64) -> Option<Arc<Link>> {
        self.peers.read().await.get(&id).cloned()
    }

    pub async fn node_existed(&self, id: u64) -> bool {
        self.peers.read().await.contains_key(&id)
    }

    pub async fn node_established(&self, id: u64) -> bool {
        self.peers
            .read()
            .await
            .get(&id)
            .map(|l| l.is_established())
            .unwrap_or(false)
    }

    /// Number of neighbors in ESTABLISH
    pub async fn get_connection_cnt(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|l| l.is_established())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Snapshot of established neighbors
    pub async fn neighbors(&self) -> Vec<Arc<Link>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|l| l.is_established())
            .cloned()
            .collect()
    }

    /// Snapshot of every entry regardless of state
    pub async fn all(&self) -> Vec<Arc<Link>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Write `frame` to every established, relaying neighbor
    ///
    /// Each write runs on its own task so a stalled peer delays nobody else.
    /// Returns the number of peers written to.
    pub async fn broadcast(&self, frame: Bytes, consensus: bool) -> usize {
        let channel = if consensus {
            Channel::Consensus
        } else {
            Channel::Data
        };
        let targets: Vec<Arc<Link>> = self
            .peers
            .read()
            .await
            .values()
            .filter(|l| l.is_established() && l.relay())
            .cloned()
            .collect();

        for link in &targets {
            let link = link.clone();
            let frame = frame.clone();
            tokio::spawn(async move {
                if let Err(e) = link.send(channel, &frame).await {
                    log::debug!("Broadcast to {} failed: {}", link.addr(), e);
                }
            });
        }
        targets.len()
    }

    /// Reachable addresses of established neighbors, for `addr` replies
    pub async fn neighbor_addrs(&self) -> Vec<PeerAddr> {
        let now = chrono::Utc::now().timestamp();
        self.peers
            .read()
            .await
            .values()
            .filter(|l| l.is_established() && l.sync_port() != 0)
            .map(|l| PeerAddr {
                time: now,
                services: ServiceFlags::VERIFY_NODE.bits(),
                ip: l.addr().ip().to_string(),
                port: l.sync_port(),
                cons_port: l.consensus_port(),
                id: l.id(),
            })
            .collect()
    }

    /// Find a neighbor by the address it was, or would be, dialed on
    pub async fn get_neighbor_by_addr(&self, addr: &str) -> Option<Arc<Link>> {
        self.peers
            .read()
            .await
            .values()
            .find(|l| l.reconnect_addr() == addr || l.addr().to_string() == addr)
            .cloned()
    }

    pub async fn is_addr_neighbor(&self, addr: &str) -> bool {
        self.get_neighbor_by_addr(addr).await.is_some()
    }

    /// Remove and return every entry that has gone INACTIVITY
    pub async fn remove_inactive(&self) -> Vec<Arc<Link>> {
        let mut peers = self.peers.write().await;
        let dead: Vec<u64> = peers
            .iter()
            .filter(|(_, l)| l.state() == LinkState::Inactivity)
            .map(|(id, _)| *id)
            .collect();
        dead.iter().filter_map(|id| peers.remove(id)).collect()
    }

    /// Empty the table, returning what it held
    pub async fn drain(&self) -> Vec<Arc<Link>> {
        self.peers.write().await.drain().map(|(_, l)| l).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::constants::{MSG_HDR_LEN, NETWORK_MAGIC};
    use crate::network::message::build_frame;
    use crate::transport::tcp::loopback_pair;
    use crate::transport::Connection;

    /// An established link with `id`, plus the remote end of its connection
    pub(crate) async fn established_link(id: u64) -> (Arc<Link>, Connection) {
        let (local, remote) = loopback_pair().await;
        let link = Arc::new(Link::outbound(local, &format!("10.0.0.{}:20338", id % 250)));
        link.set_id(id);
        link.set_ports(20338, 0);
        assert!(link.transition(LinkState::Init, LinkState::Hand));
        assert!(link.transition(LinkState::Hand, LinkState::HandShaked));
        assert!(link.transition(LinkState::HandShaked, LinkState::Establish));
        (link, remote)
    }

    #[tokio::test]
    async fn test_duplicate_id_keeps_first() {
        let table = NeighborTable::new(16);
        let (first, _r1) = established_link(7).await;
        let (second, _r2) = established_link(7).await;

        assert!(table.add_nbr_node(first.clone()).await);
        assert!(!table.add_nbr_node(second.clone()).await);

        let stored = table.get_nbr_node(7).await.unwrap();
        assert!(Arc::ptr_eq(&stored, &first));
        assert!(!table.del_if_same(&second).await);
        assert!(table.node_existed(7).await);
    }

    #[tokio::test]
    async fn test_connection_count_tracks_established() {
        let table = NeighborTable::new(16);
        let mut remotes = Vec::new();
        for id in 1..=4 {
            let (link, remote) = established_link(id).await;
            remotes.push(remote);
            table.add_nbr_node(link).await;
        }
        assert_eq!(table.get_connection_cnt().await, 4);

        table.get_nbr_node(2).await.unwrap().mark_inactive();
        assert_eq!(table.get_connection_cnt().await, 3);
        assert!(!table.node_established(2).await);
        assert_eq!(table.len().await, 4);

        let removed = table.remove_inactive().await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), 2);
        assert_eq!(table.len().await, table.get_connection_cnt().await);
    }

    #[tokio::test]
    async fn test_full_table_refuses() {
        let table = NeighborTable::new(1);
        let (a, _ra) = established_link(1).await;
        let (b, _rb) = established_link(2).await;
        assert!(table.add_nbr_node(a).await);
        assert!(!table.add_nbr_node(b).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_relaying_peers() {
        let table = NeighborTable::new(16);
        let (relaying, remote_a) = established_link(1).await;
        let (quiet, _remote_b) = established_link(2).await;
        quiet.set_relay(false);
        table.add_nbr_node(relaying).await;
        table.add_nbr_node(quiet).await;

        let frame = build_frame(NETWORK_MAGIC, "block", b"{\"h\":1}");
        assert_eq!(table.broadcast(frame.clone(), false).await, 1);

        let mut reader = remote_a.take_reader().unwrap();
        let mut got = Vec::new();
        let mut buf = [0u8; 128];
        while got.len() < frame.len() {
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got[..], &frame[..]);
        assert!(got.len() > MSG_HDR_LEN);
    }

    #[tokio::test]
    async fn test_lookup_by_addr() {
        let table = NeighborTable::new(16);
        let (link, _r) = established_link(3).await;
        table.add_nbr_node(link).await;

        assert!(table.is_addr_neighbor("10.0.0.3:20338").await);
        assert!(!table.is_addr_neighbor("10.0.0.4:20338").await);

        let addrs = table.neighbor_addrs().await;
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].id, 3);
        assert_eq!(addrs[0].port, 20338);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mutation() {
        let table = Arc::new(NeighborTable::new(1024));
        let mut links = Vec::new();
        for id in 0..32 {
            links.push(established_link(id).await);
        }

        let mut handles = Vec::new();
        for (link, _) in &links {
            let table = table.clone();
            let link = link.clone();
            handles.push(tokio::spawn(async move {
                table.add_nbr_node(link.clone()).await;
                table
                    .broadcast(build_frame(NETWORK_MAGIC, "ping", b"{}"), false)
                    .await;
                if link.id() % 2 == 0 {
                    table.del_nbr_node(link.id()).await;
                }
                table.get_connection_cnt().await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(table.len().await, 16);
        assert_eq!(table.get_connection_cnt().await, 16);
        assert!(table.all().await.iter().all(|l| l.id() % 2 == 1));
        drop(links);
    }
}
