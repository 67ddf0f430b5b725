//! Transport registry
//!
//! Holds one instance of each supported transport, keyed by lowercase name.

use super::{QuicTransport, SecurityProvider, TcpTransport, Transport, TransportError};
use crate::config::NetConfig;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static GLOBAL: OnceLock<TransportRegistry> = OnceLock::new();

#[derive(Debug)]
pub struct TransportRegistry {
    transports: HashMap<&'static str, Arc<Transport>>,
}

impl TransportRegistry {
    /// Build both transports sharing one security provider
    pub fn new(security: SecurityProvider, idle_timeout: Duration) -> Self {
        let mut transports = HashMap::new();
        transports.insert(
            "tcp",
            Arc::new(Transport::Stream(TcpTransport::new(security.clone()))),
        );
        transports.insert(
            "quic",
            Arc::new(Transport::Multiplexed(QuicTransport::new(
                security,
                idle_timeout,
            ))),
        );
        Self { transports }
    }

    pub fn from_config(config: &NetConfig) -> Self {
        Self::new(
            SecurityProvider::new(config.tls.clone()),
            config.keepalive_timeout(),
        )
    }

    /// Look a transport up by name, ignoring case
    pub fn get_transport(&self, name: &str) -> Result<Arc<Transport>, TransportError> {
        self.transports
            .get(name.to_ascii_lowercase().as_str())
            .cloned()
            .ok_or_else(|| TransportError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.transports.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Initialize the process-wide registry; later calls return the first one
pub fn init_global(config: &NetConfig) -> &'static TransportRegistry {
    GLOBAL.get_or_init(|| TransportRegistry::from_config(config))
}

pub fn global() -> Option<&'static TransportRegistry> {
    GLOBAL.get()
}
