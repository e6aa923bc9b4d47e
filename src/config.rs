use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PeerError;
use crate::id::{DEFAULT_RING_BITS, RingSpace};

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_QUOTA_BYTES: u64 = 1 << 30;
pub const DEFAULT_MAX_CONNECTIONS: usize = 150;
pub const DEFAULT_MAX_BODY_BYTES: u64 = 256 * 1024 * 1024;

/// Everything a peer needs to start.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address the request listener binds to. Port 0 picks a free port.
    pub listen: SocketAddr,

    /// Address announced to other peers; defaults to the bound address.
    pub advertise: Option<SocketAddr>,

    /// Existing ring member to join through. `None` starts a new ring.
    pub bootstrap: Option<SocketAddr>,

    /// `m`: the ring holds 2^m positions and every finger table m entries.
    pub ring_bits: u32,

    /// Parent directory of every `node_<id>` directory.
    pub storage_root: PathBuf,

    /// Quota used when no ledger snapshot exists yet.
    pub quota_bytes: u64,

    pub stabilize_interval: Duration,

    /// Bound on connect, each read and each write of a single RPC.
    pub rpc_timeout: Duration,

    /// Inbound connections served at the same time.
    pub max_connections: usize,

    pub max_body_bytes: u64,

    /// Consecutive failed stabilization ticks before the next successor
    /// replaces an unreachable successor.
    pub max_stabilize_failures: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            advertise: None,
            bootstrap: None,
            ring_bits: DEFAULT_RING_BITS,
            storage_root: PathBuf::from("nodes"),
            quota_bytes: DEFAULT_QUOTA_BYTES,
            stabilize_interval: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(3),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_stabilize_failures: 3,
        }
    }
}

impl PeerConfig {
    pub fn ring_space(&self) -> Result<RingSpace, PeerError> {
        RingSpace::new(self.ring_bits)
            .ok_or_else(|| PeerError::Config(format!("ring bits must be in 1..=64, got {}", self.ring_bits)))
    }

    pub fn validate(&self) -> Result<(), PeerError> {
        self.ring_space()?;
        if self.max_connections == 0 {
            return Err(PeerError::Config("max connections must be at least 1".into()));
        }
        if self.stabilize_interval.is_zero() {
            return Err(PeerError::Config("stabilize interval must be positive".into()));
        }
        if self.rpc_timeout.is_zero() {
            return Err(PeerError::Config("rpc timeout must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PeerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ring_space().unwrap().bits(), DEFAULT_RING_BITS);
    }

    #[test]
    fn rejects_bad_ring_bits() {
        let config = PeerConfig { ring_bits: 0, ..PeerConfig::default() };
        assert!(matches!(config.validate(), Err(PeerError::Config(_))));
    }

    #[test]
    fn rejects_zero_connections() {
        let config = PeerConfig { max_connections: 0, ..PeerConfig::default() };
        assert!(config.validate().is_err());
    }
}
