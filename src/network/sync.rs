//! Block and header sync pacing
//!
//! Decides which block heights to request from which established peers so
//! that no peer has more than [`MAX_REQ_BLK_ONCE`] requests outstanding, no
//! height is requested from two peers at once, and the total in flight stays
//! under [`MAX_SYNC_IN_FLIGHT`].

use crate::ledger::{Hash256, LedgerQuery};
use crate::network::constants::{MAX_BLK_HDR_CNT, MAX_REQ_BLK_ONCE, MAX_SYNC_IN_FLIGHT};
use crate::network::link::Link;
use crate::network::message::{build_message, Command, GetDataPayload, GetHeadersPayload, InvType};
use crate::network::neighbor::NeighborTable;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct SyncScheduler {
    ledger: Arc<dyn LedgerQuery>,
    magic: u32,
}

impl SyncScheduler {
    pub fn new(ledger: Arc<dyn LedgerQuery>, magic: u32) -> Self {
        Self { ledger, magic }
    }

    /// Ask one random peer ahead of our header tip for more headers
    ///
    /// Nothing is sent until at least `min_peers` neighbors are established.
    /// Returns the id of the peer asked.
    pub async fn request_headers(&self, table: &NeighborTable, min_peers: usize) -> Option<u64> {
        if table.get_connection_cnt().await < min_peers {
            return None;
        }

        let header_height = self.ledger.current_header_height();
        let candidates: Vec<Arc<Link>> = table
            .neighbors()
            .await
            .into_iter()
            .filter(|l| l.height() > header_height as u64)
            .collect();
        let peer = candidates.choose(&mut rand::thread_rng())?.clone();

        let start_hash = match self.ledger.block_hash_by_height(header_height) {
            Ok(hash) => hex::encode(hash),
            Err(e) => {
                log::warn!("Cannot read header {}: {}", header_height, e);
                return None;
            }
        };
        let request = GetHeadersPayload {
            start_height: header_height,
            start_hash,
            count: MAX_BLK_HDR_CNT,
        };
        let frame = match build_message(self.magic, Command::GetHeaders, &request) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode getheaders: {}", e);
                return None;
            }
        };

        log::debug!(
            "Requesting headers after {} from peer {} (height {})",
            header_height,
            peer.id(),
            peer.height()
        );
        if let Err(e) = peer.tx(&frame).await {
            log::debug!("getheaders to {} failed: {}", peer.addr(), e);
        }
        Some(peer.id())
    }

    /// Request missing blocks between our block tip and header tip
    ///
    /// Returns the number of new requests sent.
    pub async fn sync_blocks(&self, table: &NeighborTable) -> usize {
        let block_height = self.ledger.current_block_height();
        let header_height = self.ledger.current_header_height();
        let peers = table.neighbors().await;

        for peer in &peers {
            peer.prune_flights(block_height);
        }
        if header_height <= block_height {
            return 0;
        }

        let in_flight: BTreeSet<u32> = peers.iter().flat_map(|p| p.flight_heights()).collect();
        let delta = (header_height - block_height) as usize;
        let mut budget = delta.min(MAX_SYNC_IN_FLIGHT).saturating_sub(in_flight.len());
        let mut next = block_height + 1;
        let mut sent = 0;

        for peer in &peers {
            if peer.height() <= block_height as u64 {
                continue;
            }

            let slots = MAX_REQ_BLK_ONCE.saturating_sub(peer.flight_count());
            if slots == 0 {
                self.rerequest_flights(peer).await;
                continue;
            }

            let mut granted = 0;
            while granted < slots
                && budget > 0
                && next <= header_height
                && u64::from(next) <= peer.height()
            {
                let height = next;
                next += 1;
                if in_flight.contains(&height) {
                    continue;
                }

                match self.missing_block(height) {
                    Some(hash) => {
                        if !self.request_block(peer, height, hash).await {
                            break;
                        }
                        granted += 1;
                        budget -= 1;
                        sent += 1;
                    }
                    None => continue,
                }
            }
        }

        if sent > 0 {
            log::debug!(
                "Requested {} blocks (block height {}, header height {})",
                sent,
                block_height,
                header_height
            );
        }
        sent
    }

    /// Hash of the block at `height` if we do not hold it yet
    fn missing_block(&self, height: u32) -> Option<Hash256> {
        let hash = match self.ledger.block_hash_by_height(height) {
            Ok(hash) => hash,
            Err(e) => {
                log::debug!("No header for height {}: {}", height, e);
                return None;
            }
        };
        match self.ledger.contains_block(&hash) {
            Ok(false) => Some(hash),
            Ok(true) => None,
            Err(e) => {
                log::debug!("Ledger lookup for height {} failed: {}", height, e);
                None
            }
        }
    }

    async fn request_block(&self, peer: &Link, height: u32, hash: Hash256) -> bool {
        let request = GetDataPayload {
            inv_type: InvType::Block,
            hash: hex::encode(hash),
        };
        let frame = match build_message(self.magic, Command::GetData, &request) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode getdata: {}", e);
                return false;
            }
        };

        peer.add_flight(height);
        if let Err(e) = peer.tx(&frame).await {
            log::debug!("getdata {} to {} failed: {}", height, peer.addr(), e);
            peer.remove_flight(height);
            return false;
        }
        true
    }

    /// Resend requests for a saturated peer's flights we still lack
    async fn rerequest_flights(&self, peer: &Link) {
        for height in peer.flight_heights() {
            let Some(hash) = self.missing_block(height) else {
                peer.remove_flight(height);
                continue;
            };
            let request = GetDataPayload {
                inv_type: InvType::Block,
                hash: hex::encode(hash),
            };
            if let Ok(frame) = build_message(self.magic, Command::GetData, &request) {
                if let Err(e) = peer.tx(&frame).await {
                    log::debug!("Re-request {} to {} failed: {}", height, peer.addr(), e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::network::constants::NETWORK_MAGIC;
    use crate::network::neighbor::tests::established_link;
    use crate::transport::Connection;

    async fn table_with_heights(heights: &[u64]) -> (NeighborTable, Vec<Arc<Link>>, Vec<Connection>) {
        let table = NeighborTable::new(64);
        let mut links = Vec::new();
        let mut remotes = Vec::new();
        for (i, height) in heights.iter().enumerate() {
            let (link, remote) = established_link(i as u64 + 1).await;
            link.set_height(*height);
            table.add_nbr_node(link.clone()).await;
            links.push(link);
            remotes.push(remote);
        }
        (table, links, remotes)
    }

    fn scheduler(ledger: MemoryLedger) -> SyncScheduler {
        SyncScheduler::new(Arc::new(ledger), NETWORK_MAGIC)
    }

    fn all_flights(links: &[Arc<Link>]) -> Vec<u32> {
        let mut all: Vec<u32> = links.iter().flat_map(|l| l.flight_heights()).collect();
        all.sort_unstable();
        all
    }

    #[tokio::test]
    async fn test_per_peer_cap() {
        let (table, links, _remotes) = table_with_heights(&[1000]).await;
        let sync = scheduler(MemoryLedger::with_heights(1000, 0));

        assert_eq!(sync.sync_blocks(&table).await, MAX_REQ_BLK_ONCE);
        assert_eq!(links[0].flight_count(), MAX_REQ_BLK_ONCE);

        // saturated: nothing new is granted
        assert_eq!(sync.sync_blocks(&table).await, 0);
        assert_eq!(links[0].flight_count(), MAX_REQ_BLK_ONCE);
    }

    #[tokio::test]
    async fn test_aggregate_bounded_without_duplicates() {
        let (table, links, _remotes) = table_with_heights(&[1000; 10]).await;
        let sync = scheduler(MemoryLedger::with_heights(1000, 0));

        let sent = sync.sync_blocks(&table).await;
        assert_eq!(sent, MAX_SYNC_IN_FLIGHT);

        let flights = all_flights(&links);
        let unique: BTreeSet<u32> = flights.iter().copied().collect();
        assert_eq!(unique.len(), flights.len());
        assert_eq!(flights.len(), MAX_SYNC_IN_FLIGHT);
        assert!(links.iter().all(|l| l.flight_count() <= MAX_REQ_BLK_ONCE));
    }

    #[tokio::test]
    async fn test_small_gap_bounds_requests() {
        let (table, links, _remotes) = table_with_heights(&[50, 50, 50]).await;
        let sync = scheduler(MemoryLedger::with_heights(25, 20));

        assert_eq!(sync.sync_blocks(&table).await, 5);
        assert_eq!(all_flights(&links), vec![21, 22, 23, 24, 25]);
    }

    #[tokio::test]
    async fn test_possessed_blocks_not_requested() {
        let (table, links, _remotes) = table_with_heights(&[30]).await;
        let ledger = MemoryLedger::with_heights(30, 10);
        ledger.add_block(12);
        ledger.add_block(14);
        let sync = scheduler(ledger);

        sync.sync_blocks(&table).await;
        let flights = all_flights(&links);
        assert!(!flights.contains(&12));
        assert!(!flights.contains(&14));
        assert_eq!(flights[0], 11);
    }

    #[tokio::test]
    async fn test_peers_behind_are_skipped() {
        let (table, links, _remotes) = table_with_heights(&[5, 40]).await;
        let sync = scheduler(MemoryLedger::with_heights(40, 10));

        sync.sync_blocks(&table).await;
        assert_eq!(links[0].flight_count(), 0);
        assert_eq!(links[1].flight_count(), MAX_REQ_BLK_ONCE);
    }

    #[tokio::test]
    async fn test_flights_below_tip_are_pruned() {
        let (table, links, _remotes) = table_with_heights(&[100]).await;
        let ledger = Arc::new(MemoryLedger::with_heights(100, 0));
        let sync = SyncScheduler::new(ledger.clone(), NETWORK_MAGIC);

        sync.sync_blocks(&table).await;
        for h in 1..=8 {
            ledger.add_block(h);
        }
        sync.sync_blocks(&table).await;

        let flights = all_flights(&links);
        assert!(flights.iter().all(|h| *h > 8));
        assert_eq!(flights.len(), MAX_REQ_BLK_ONCE);
    }

    #[tokio::test]
    async fn test_header_request_needs_min_peers() {
        let (table, _links, _remotes) = table_with_heights(&[10, 200]).await;
        let sync = scheduler(MemoryLedger::with_heights(100, 100));

        assert_eq!(sync.request_headers(&table, 4).await, None);
        // only the peer above our header tip qualifies
        assert_eq!(sync.request_headers(&table, 1).await, Some(2));
    }

    #[tokio::test]
    async fn test_header_request_without_candidates() {
        let (table, _links, _remotes) = table_with_heights(&[10]).await;
        let sync = scheduler(MemoryLedger::with_heights(100, 100));
        assert_eq!(sync.request_headers(&table, 0).await, None);
    }
}
