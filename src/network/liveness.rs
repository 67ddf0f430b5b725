//! Liveness and reconnection
//!
//! Heartbeats, silent-peer eviction, the retry registry and the
//! reconnect / seed passes driven by the server's timers.

use crate::network::constants::{CONN_MAX_BACK, MAX_RETRY_COUNT};
use crate::network::message::{Command, HeightPayload};
use crate::network::server::NetServer;
use futures::future::join_all;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Addresses waiting to be redialed, with their failed attempt counts
#[derive(Debug, Default)]
pub struct RetryRegistry {
    entries: Mutex<HashMap<String, u32>>,
}

impl RetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `addr`; an address already tracked keeps its count
    pub fn insert(&self, addr: &str) {
        if addr.is_empty() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.entry(addr.to_string()).or_insert(0);
        }
    }

    pub fn remove(&self, addr: &str) -> bool {
        self.entries
            .lock()
            .map(|mut e| e.remove(addr).is_some())
            .unwrap_or(false)
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.entries
            .lock()
            .map(|e| e.contains_key(addr))
            .unwrap_or(false)
    }

    pub fn attempts(&self, addr: &str) -> Option<u32> {
        self.entries.lock().ok().and_then(|e| e.get(addr).copied())
    }

    /// Count one more redial of `addr`
    ///
    /// Returns false, and forgets the address, once the count would exceed
    /// [`MAX_RETRY_COUNT`]. Counting the failure that put the address here,
    /// an address is dropped after `MAX_RETRY_COUNT + 1` failed dials.
    pub fn record_attempt(&self, addr: &str) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let Some(count) = entries.get_mut(addr) else {
            return false;
        };
        *count += 1;
        if *count > MAX_RETRY_COUNT {
            entries.remove(addr);
            return false;
        }
        true
    }

    pub fn addresses(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NetServer {
    /// Ping every established neighbor with our block height
    pub async fn ping_neighbors(&self) -> usize {
        let ping = HeightPayload {
            height: self.ledger().current_block_height() as u64,
        };
        let frame = match self.message(Command::Ping, &ping) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode ping: {}", e);
                return 0;
            }
        };

        let neighbors = self.table().neighbors().await;
        for link in &neighbors {
            if let Err(e) = link.tx(&frame).await {
                log::debug!("Ping to {} failed: {}", link.addr(), e);
            }
        }
        neighbors.len()
    }

    /// Close established neighbors silent for longer than the keepalive timeout
    pub async fn check_heartbeats(&self) -> usize {
        let timeout = self.config().keepalive_timeout();
        let mut evicted = 0;

        for link in self.table().neighbors().await {
            let silent = link.rx_elapsed();
            if silent > timeout {
                log::warn!(
                    "Peer {} ({}) silent for {:?}, closing",
                    link.id(),
                    link.addr(),
                    silent
                );
                link.shutdown().await;
                evicted += 1;
            }
        }
        evicted
    }

    /// Move inactive neighbors to the retry list; forget retries for live ones
    pub async fn fetch_retry_from_neighbors(&self) {
        for link in self.table().remove_inactive().await {
            log::debug!("Queueing {} for reconnect", link.reconnect_addr());
            self.retry().insert(&link.reconnect_addr());
        }
        for link in self.table().neighbors().await {
            self.retry().remove(&link.reconnect_addr());
        }
    }

    /// Redial every address on the retry list after a random delay
    pub async fn reconnect_pass(self: &Arc<Self>) {
        let mut dials = Vec::new();

        for addr in self.retry().addresses() {
            if self.table().is_addr_neighbor(&addr).await {
                self.retry().remove(&addr);
                continue;
            }
            if !self.retry().record_attempt(&addr) {
                log::info!("Giving up on {} after {} retries", addr, MAX_RETRY_COUNT);
                continue;
            }

            let delay = Duration::from_millis(rand::thread_rng().gen_range(0..CONN_MAX_BACK));
            let server = self.clone();
            dials.push(async move {
                tokio::time::sleep(delay).await;
                log::debug!(
                    "Reconnecting to {} (attempt {:?})",
                    addr,
                    server.retry().attempts(&addr)
                );
                if let Err(e) = server.connect(&addr).await {
                    log::debug!("Reconnect to {} failed: {}", addr, e);
                }
            });
        }

        join_all(dials).await;
    }

    /// Dial seeds while under the consensus mode's minimum peer count
    pub async fn connect_seeds(self: &Arc<Self>) {
        let established = self.table().get_connection_cnt().await;
        if established >= self.config().min_node_count() {
            return;
        }

        for seed in &self.config().seed_list {
            if self.table().is_addr_neighbor(seed).await || self.is_connecting(seed) {
                continue;
            }
            let server = self.clone();
            let seed = seed.clone();
            tokio::spawn(async move {
                if let Err(e) = server.connect(&seed).await {
                    log::warn!("Seed {} unreachable: {}", seed, e);
                }
            });
        }
    }
}
