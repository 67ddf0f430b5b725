//! Peerlink: the peer-to-peer networking core of a blockchain full node
//!
//! This crate provides:
//! - TCP (optionally TLS) and QUIC transports behind one interface
//! - Mutual-TLS identity loading with a self-signed fallback for QUIC
//! - Stream reassembly of length-prefixed, checksummed frames
//! - Per-peer links with a handshake state machine and optional
//!   dedicated consensus channel
//! - A concurrent neighbor table with relay-aware broadcast
//! - Heartbeats, reconnection and block sync pacing
//!
//! # Example
//!
//! ```rust,no_run
//! use peerlink::{ChannelSink, MemoryLedger, NetConfig, NetServer, TransportRegistry};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NetConfig::default();
//! let registry = TransportRegistry::from_config(&config);
//! let (sink, mut frames) = ChannelSink::new();
//!
//! let server = NetServer::new(config, &registry, Arc::new(MemoryLedger::new()), Arc::new(sink))?;
//! server.start().await?;
//!
//! while let Some(frame) = frames.recv().await {
//!     println!("{} from peer {}", frame.command, frame.peer_id);
//! }
//! server.halt().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod ledger;
pub mod network;
pub mod transport;

// Re-export commonly used types
pub use config::{ConfigError, ConsensusType, NetConfig, TlsSettings};
pub use ledger::{LedgerError, LedgerQuery, MemoryLedger};
pub use network::{
    ChannelSink, FrameSink, InboundFrame, Link, LinkState, NeighborTable, NetServer, ServerError,
};
pub use transport::{Connection, Listener, SecurityProvider, Transport, TransportError, TransportRegistry};
