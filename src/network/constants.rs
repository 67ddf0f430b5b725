//! Protocol and scheduling constants

use std::time::Duration;

/// Protocol version advertised in `version`
pub const PROTOCOL_VERSION: u32 = 1;

/// Default network magic
pub const NETWORK_MAGIC: u32 = 0x7474_6e41;

// =============================================================================
// Framing
// =============================================================================

/// Command field width in the header
pub const MSG_CMD_LEN: usize = 12;
/// Offset of the command inside the header
pub const CMD_OFFSET: usize = 4;
/// Checksum width in the header
pub const CHECKSUM_LEN: usize = 4;
/// Header length: magic(4) + command(12) + length(4) + checksum(4)
pub const MSG_HDR_LEN: usize = 24;
/// Largest frame accepted from the wire
pub const MAX_MSG_LEN: usize = 30 * 1024 * 1024;
/// Largest payload accepted from the wire
pub const MAX_PAYLOAD_LEN: usize = MAX_MSG_LEN - MSG_HDR_LEN;
/// Receive scratch buffer size
pub const MAX_BUF_LEN: usize = 256 * 1024;

// =============================================================================
// Link and liveness
// =============================================================================

/// Per-write deadline
pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);
/// Heartbeat ticks per block generation period
pub const UPDATE_RATE_PER_BLOCK: u64 = 2;
/// Heartbeat periods of silence tolerated before eviction
pub const KEEPALIVE_TIMEOUT: u32 = 15;
/// Time a new link gets to finish the version / verack exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default outbound dial timeout
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(6);
/// Interval of the seed / reconnect pass
pub const CONN_MONITOR: Duration = Duration::from_secs(6);
/// Upper bound of the reconnect jitter, in milliseconds
pub const CONN_MAX_BACK: u64 = 4000;
/// Capacity of the link event channel
pub const CHAN_CAPABILITY: usize = 10_000;
/// Default cap on inbound links
pub const MAX_CONN_IN_BOUND: usize = 1024;
/// Default cap on outbound links
pub const MAX_CONN_OUT_BOUND: usize = 1024;
/// Default cap on inbound links from one IP
pub const MAX_CONN_IN_BOUND_PER_IP: usize = 16;
/// Failed reconnect attempts tolerated before an address is forgotten
pub const MAX_RETRY_COUNT: u32 = 3;
/// Minimum block generation time, in seconds
pub const MIN_GEN_BLOCK_TIME: u64 = 2;
/// Block generation time used when the configured one is below the minimum
pub const DEFAULT_GEN_BLOCK_TIME: u64 = 6;

// =============================================================================
// Sync
// =============================================================================

/// Block requests in flight to a single peer
pub const MAX_REQ_BLK_ONCE: usize = 16;
/// Block requests in flight across all peers
pub const MAX_SYNC_IN_FLIGHT: usize = MAX_REQ_BLK_ONCE * 4;
/// Headers asked for in one `getheaders`
pub const MAX_BLK_HDR_CNT: u32 = 500;
/// Addresses returned in one `addr`
pub const MAX_ADDR_NODE_CNT: usize = 64;
