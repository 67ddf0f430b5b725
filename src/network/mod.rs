//! P2P Networking module
//!
//! Links, the neighbor table and the workers that keep a node connected and
//! in sync.
//!
//! # Features
//! - Framed messages reassembled from any transport's byte stream
//! - Version/verack handshake with duplicate and self-connection rejection
//! - Optional dedicated consensus connection per peer
//! - Heartbeats, silent-peer eviction and bounded reconnection
//! - Paced header and block requests

pub mod constants;
pub mod dispatch;
pub mod frame;
pub mod link;
pub mod liveness;
pub mod message;
pub mod neighbor;
pub mod protocol;
pub mod server;
pub mod sync;

pub use dispatch::{Dispatcher, MessageHandler};
pub use frame::Reassembler;
pub use link::{Channel, Link, LinkError, LinkState};
pub use liveness::RetryRegistry;
pub use message::{build_frame, Command, FrameError, MessageHeader};
pub use neighbor::NeighborTable;
pub use protocol::{ChannelSink, FrameSink, InboundFrame, ProtocolHandler};
pub use server::{NetServer, ServerError};
pub use sync::SyncScheduler;
