//! Read-only view of the local chain
//!
//! The networking core never writes to the ledger; it only asks how far the
//! local chain has come so it knows what to request from peers.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

/// 32-byte block hash
pub type Hash256 = [u8; 32];

/// Ledger query errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("No header at height {0}")]
    UnknownHeight(u32),
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Narrow query interface onto the local chain
pub trait LedgerQuery: Send + Sync {
    fn current_block_height(&self) -> u32;
    fn current_header_height(&self) -> u32;
    fn block_hash_by_height(&self, height: u32) -> Result<Hash256, LedgerError>;
    fn contains_block(&self, hash: &Hash256) -> Result<bool, LedgerError>;
}

#[derive(Debug, Default)]
struct ChainState {
    headers: Vec<Hash256>,
    by_hash: HashMap<Hash256, u32>,
    blocks: HashSet<Hash256>,
    block_height: u32,
}

/// In-memory ledger used by the binary and tests
///
/// Header `h` has hash `sha256(h)`. Height 0 is present from the start with
/// its block.
#[derive(Debug)]
pub struct MemoryLedger {
    state: RwLock<ChainState>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        let genesis = Self::hash_for(0);
        let mut state = ChainState::default();
        state.headers.push(genesis);
        state.by_hash.insert(genesis, 0);
        state.blocks.insert(genesis);
        Self {
            state: RwLock::new(state),
        }
    }

    /// A ledger that knows headers up to `header_height` and blocks up to `block_height`
    pub fn with_heights(header_height: u32, block_height: u32) -> Self {
        let ledger = Self::new();
        for _ in 0..header_height {
            ledger.push_header();
        }
        for height in 1..=block_height.min(header_height) {
            ledger.add_block(height);
        }
        ledger
    }

    pub fn hash_for(height: u32) -> Hash256 {
        Sha256::digest(height.to_le_bytes()).into()
    }

    /// Append the next header, returning its height
    pub fn push_header(&self) -> u32 {
        let Ok(mut state) = self.state.write() else {
            return 0;
        };
        let height = state.headers.len() as u32;
        let hash = Self::hash_for(height);
        state.headers.push(hash);
        state.by_hash.insert(hash, height);
        height
    }

    /// Record the block at `height` as stored; the block tip advances over
    /// any contiguous run of stored blocks
    pub fn add_block(&self, height: u32) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        let Some(hash) = state.headers.get(height as usize).copied() else {
            return false;
        };
        state.blocks.insert(hash);

        loop {
            let next = state.block_height + 1;
            match state.headers.get(next as usize).copied() {
                Some(hash) if state.blocks.contains(&hash) => state.block_height = next,
                _ => break,
            }
        }
        true
    }
}

impl LedgerQuery for MemoryLedger {
    fn current_block_height(&self) -> u32 {
        self.state.read().map(|s| s.block_height).unwrap_or(0)
    }

    fn current_header_height(&self) -> u32 {
        self.state
            .read()
            .map(|s| s.headers.len().saturating_sub(1) as u32)
            .unwrap_or(0)
    }

    fn block_hash_by_height(&self, height: u32) -> Result<Hash256, LedgerError> {
        let state = self
            .state
            .read()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        state
            .headers
            .get(height as usize)
            .copied()
            .ok_or(LedgerError::UnknownHeight(height))
    }

    fn contains_block(&self, hash: &Hash256) -> Result<bool, LedgerError> {
        let state = self
            .state
            .read()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(state.blocks.contains(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_only() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.current_block_height(), 0);
        assert_eq!(ledger.current_header_height(), 0);
        assert!(ledger
            .contains_block(&ledger.block_hash_by_height(0).unwrap())
            .unwrap());
    }

    #[test]
    fn test_headers_ahead_of_blocks() {
        let ledger = MemoryLedger::with_heights(10, 4);
        assert_eq!(ledger.current_header_height(), 10);
        assert_eq!(ledger.current_block_height(), 4);

        let hash = ledger.block_hash_by_height(7).unwrap();
        assert_eq!(hash, MemoryLedger::hash_for(7));
        assert!(!ledger.contains_block(&hash).unwrap());
        assert_eq!(
            ledger.block_hash_by_height(11),
            Err(LedgerError::UnknownHeight(11))
        );
    }

    #[test]
    fn test_block_tip_waits_for_gap() {
        let ledger = MemoryLedger::with_heights(5, 1);
        assert!(ledger.add_block(3));
        assert_eq!(ledger.current_block_height(), 1);

        assert!(ledger.add_block(2));
        assert_eq!(ledger.current_block_height(), 3);
        assert!(!ledger.add_block(9));
    }
}
