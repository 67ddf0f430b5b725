//! Network configuration
//!
//! Read once at startup, either built in code or loaded from a JSON file.

use crate::network::constants::{
    DEFAULT_GEN_BLOCK_TIME, HANDSHAKE_TIMEOUT, KEEPALIVE_TIMEOUT, MAX_CONN_IN_BOUND,
    MAX_CONN_IN_BOUND_PER_IP, MAX_CONN_OUT_BOUND, MIN_GEN_BLOCK_TIME, NETWORK_MAGIC,
    UPDATE_RATE_PER_BLOCK,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Consensus mode the node runs under; decides the minimum neighbor count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusType {
    Solo,
    Dbft,
    Vbft,
}

impl ConsensusType {
    /// Established peers required before the node stops dialing seeds
    pub fn min_node_count(&self) -> usize {
        match self {
            ConsensusType::Solo => 0,
            ConsensusType::Vbft => 1,
            ConsensusType::Dbft => 4,
        }
    }
}

/// Transport security material
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

/// P2P network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Magic number identifying the network on the wire
    pub network_magic: u32,
    /// Data channel listen port (0 picks an ephemeral port)
    pub node_port: u16,
    /// Consensus channel listen port, used when `dual_port` is set
    pub consensus_port: u16,
    /// Open a second, dedicated connection per peer for consensus traffic
    pub dual_port: bool,
    /// Transport name looked up in the registry ("tcp" or "quic")
    pub transport: String,
    pub tls: TlsSettings,
    /// Seed addresses dialed while under the minimum peer count
    pub seed_list: Vec<String>,
    pub consensus_type: ConsensusType,
    /// Block generation time hint in seconds
    pub gen_block_time: u64,
    /// Whether this node relays broadcasts
    pub relay: bool,
    /// Upper bound on neighbor table size
    pub max_connections: usize,
    /// Inbound links allowed, handshaking ones included
    pub max_conn_in_bound: usize,
    /// Outbound links allowed, dials in progress included
    pub max_conn_out_bound: usize,
    /// Inbound links allowed from a single IP
    pub max_conn_in_bound_per_ip: usize,
    /// When non-empty, only addresses starting with one of these entries
    /// may connect or be dialed
    pub reserved_peers: Vec<String>,
    /// Seconds a new link gets to complete the handshake
    pub handshake_timeout_secs: u64,
    /// Concurrent message handler invocations
    pub worker_count: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            network_magic: NETWORK_MAGIC,
            node_port: 20338,
            consensus_port: 20339,
            dual_port: false,
            transport: "tcp".to_string(),
            tls: TlsSettings::default(),
            seed_list: Vec::new(),
            consensus_type: ConsensusType::Dbft,
            gen_block_time: DEFAULT_GEN_BLOCK_TIME,
            relay: true,
            max_connections: 1024,
            max_conn_in_bound: MAX_CONN_IN_BOUND,
            max_conn_out_bound: MAX_CONN_OUT_BOUND,
            max_conn_in_bound_per_ip: MAX_CONN_IN_BOUND_PER_IP,
            reserved_peers: Vec::new(),
            handshake_timeout_secs: HANDSHAKE_TIMEOUT.as_secs(),
            worker_count: 64,
        }
    }
}

impl NetConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: NetConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dual_port && self.consensus_port != 0 && self.consensus_port == self.node_port {
            return Err(ConfigError::Invalid(format!(
                "consensus port {} collides with node port",
                self.consensus_port
            )));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        if self.max_conn_in_bound_per_ip == 0 || self.max_conn_in_bound_per_ip > self.max_conn_in_bound {
            return Err(ConfigError::Invalid(format!(
                "max_conn_in_bound_per_ip must be in 1..={}",
                self.max_conn_in_bound
            )));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid("handshake_timeout_secs must be positive".into()));
        }
        if self.tls.enabled
            && (self.tls.cert_path.as_os_str().is_empty()
                || self.tls.key_path.as_os_str().is_empty()
                || self.tls.ca_path.as_os_str().is_empty())
        {
            return Err(ConfigError::Invalid(
                "tls enabled but cert/key/ca paths are not all set".into(),
            ));
        }
        Ok(())
    }

    /// Interval between heartbeat and sync ticks
    pub fn period_update(&self) -> Duration {
        let gen = if self.gen_block_time > MIN_GEN_BLOCK_TIME {
            self.gen_block_time
        } else {
            DEFAULT_GEN_BLOCK_TIME
        };
        Duration::from_secs(gen / UPDATE_RATE_PER_BLOCK)
    }

    /// Silence after which an established peer is considered dead
    pub fn keepalive_timeout(&self) -> Duration {
        self.period_update() * KEEPALIVE_TIMEOUT
    }

    pub fn min_node_count(&self) -> usize {
        self.consensus_type.min_node_count()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Whether the reserved list lets `addr` through
    pub fn is_reserved(&self, addr: &str) -> bool {
        self.reserved_peers.is_empty()
            || self.reserved_peers.iter().any(|p| addr.starts_with(p.as_str()))
    }

    pub fn is_reserved_socket(&self, addr: SocketAddr) -> bool {
        self.is_reserved(&addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_update_floor() {
        let mut config = NetConfig::default();
        config.gen_block_time = 1;
        assert_eq!(config.period_update(), Duration::from_secs(3));

        config.gen_block_time = 10;
        assert_eq!(config.period_update(), Duration::from_secs(5));
        assert_eq!(config.keepalive_timeout(), Duration::from_secs(75));
    }

    #[test]
    fn test_min_node_count() {
        assert_eq!(ConsensusType::Solo.min_node_count(), 0);
        assert_eq!(ConsensusType::Dbft.min_node_count(), 4);
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");
        std::fs::write(
            &path,
            r#"{"node_port": 3000, "consensus_type": "solo", "seed_list": ["10.0.0.1:3000"]}"#,
        )
        .unwrap();

        let config = NetConfig::load(&path).unwrap();
        assert_eq!(config.node_port, 3000);
        assert_eq!(config.consensus_type, ConsensusType::Solo);
        assert_eq!(config.seed_list.len(), 1);
        assert_eq!(config.transport, "tcp");
    }

    #[test]
    fn test_reserved_peers_match_by_prefix() {
        let mut config = NetConfig::default();
        assert!(config.is_reserved("10.0.0.9:20338"));

        config.reserved_peers = vec!["10.0.0.".into(), "192.168.1.7".into()];
        assert!(config.is_reserved("10.0.0.9:20338"));
        assert!(config.is_reserved_socket("192.168.1.7:4000".parse().unwrap()));
        assert!(!config.is_reserved("10.0.1.9:20338"));
        assert!(!config.is_reserved_socket("127.0.0.1:20338".parse().unwrap()));
    }

    #[test]
    fn test_validate_connection_caps() {
        let mut config = NetConfig::default();
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        config.max_conn_in_bound_per_ip = config.max_conn_in_bound + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.max_conn_in_bound_per_ip = 1;
        config.handshake_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_missing_tls_paths() {
        let mut config = NetConfig::default();
        config.tls.enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
