//! On-disk configuration: a JSON document listing the bus stations the
//! bridge answers for and the remote tunnel stations they are bound to.
//!
//! ```json
//! {
//!   "bus_peers": [
//!     { "station_id": 1, "bound_port": 32768 }
//!   ],
//!   "tunnel_peers": [
//!     { "station_id": 101, "remote_address": "10.0.0.5", "remote_port": 32768 }
//!   ]
//! }
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use bustun_bridge::peers::{BusPeerConfig, PeerConfigError, PeerTable, TunnelPeerConfig};
use bustun_common::dev_warn;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bus_peers: Vec<BusPeerConfig>,
    #[serde(default)]
    pub tunnel_peers: Vec<TunnelPeerConfig>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "could not read configuration: {}", e),
            ConfigError::Parse(e) => write!(f, "could not parse configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn load(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
    serde_json::from_str(&text).map_err(ConfigError::Parse)
}

/// Loads every peer it can; a peer that fails is skipped and the first
/// error is reported once the rest are in.
pub fn apply(cfg: &BridgeConfig, table: &mut PeerTable) -> Result<(), PeerConfigError> {
    let mut first_err = None;
    for peer in &cfg.bus_peers {
        if let Err(e) = table.add_bus_peer(peer) {
            dev_warn!("Skipping bus station {}: {}", peer.station_id, e);
            first_err.get_or_insert(e);
        }
    }
    for peer in &cfg.tunnel_peers {
        if let Err(e) = table.add_tunnel_peer(peer) {
            dev_warn!("Skipping tunnel station {}: {}", peer.station_id, e);
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_document() {
        let cfg: BridgeConfig = serde_json::from_str(
            r#"{
                "bus_peers": [{ "station_id": 1, "bound_port": 0 }],
                "tunnel_peers": [
                    { "station_id": 101, "remote_address": "10.0.0.5", "remote_port": 32768 }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.bus_peers.len(), 1);
        assert_eq!(cfg.bus_peers[0].network_id, 0);
        assert_eq!(cfg.tunnel_peers[0].remote_address, "10.0.0.5");
    }

    #[test]
    fn test_empty_document_is_valid() {
        let cfg: BridgeConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.bus_peers.is_empty());
        assert!(cfg.tunnel_peers.is_empty());
    }

    #[test]
    fn test_apply_skips_failing_peer() {
        let cfg = BridgeConfig {
            bus_peers: vec![
                BusPeerConfig { station_id: 0, network_id: 0, bound_port: 0 },
                BusPeerConfig { station_id: 1, network_id: 0, bound_port: 0 },
            ],
            tunnel_peers: Vec::new(),
        };
        let mut table = PeerTable::new();
        assert!(apply(&cfg, &mut table).is_err());
        assert!(table.bus_by_station(1).is_some());
    }
}
