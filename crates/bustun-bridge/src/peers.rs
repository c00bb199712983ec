//! The peer registry: local bus stations with their bound tunnel sockets,
//! and remote tunnel stations with their addresses and
//! duplicate-suppression state.
//!
//! Both tables are fixed-size arrays with linear lookup; a slot with
//! `station_id == 0` is free. The registry is built while the bridge is
//! quiesced and shared immutably with the pipeline tasks afterwards; only
//! the per-peer delivery bookkeeping mutates at runtime, through atomics.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use bustun_common::dev_info;
use bustun_link::engine::DeliveryResult;
use serde::{Deserialize, Serialize};

pub const BUS_PEER_SLOTS: usize = 5;
pub const TUNNEL_PEER_SLOTS: usize = 20;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BusPeerConfig {
    pub station_id: u8,
    #[serde(default)]
    pub network_id: u8,
    pub bound_port: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TunnelPeerConfig {
    pub station_id: u8,
    #[serde(default)]
    pub network_id: u8,
    pub remote_address: String,
    pub remote_port: u16,
}

#[derive(Debug)]
pub enum PeerConfigError {
    NoFreeSlot { station_id: u8 },
    InvalidStationId(u8),
    BadAddress(String),
    Bind { port: u16, source: io::Error },
}

impl fmt::Display for PeerConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerConfigError::NoFreeSlot { station_id } => {
                write!(f, "no free slot for station {}", station_id)
            }
            PeerConfigError::InvalidStationId(id) => write!(f, "invalid station id {}", id),
            PeerConfigError::BadAddress(addr) => write!(f, "bad remote address {:?}", addr),
            PeerConfigError::Bind { port, source } => {
                write!(f, "unable to bind port {}: {}", port, source)
            }
        }
    }
}

impl std::error::Error for PeerConfigError {}

/// A local bus identity: frames from this station leave for the tunnel
/// through its own bound socket.
pub struct BusPeer {
    pub station_id: u8,
    pub network_id: u8,
    pub bound_port: u16,
    pub socket: Option<UdpSocket>,
}

const RESULT_NACK: u8 = 0;
const RESULT_ACK: u8 = 1;
const RESULT_NACK_CORRUPT: u8 = 2;
const RESULT_SEND_ERROR: u8 = 3;

fn result_to_u8(result: DeliveryResult) -> u8 {
    match result {
        DeliveryResult::Nack => RESULT_NACK,
        DeliveryResult::Ack => RESULT_ACK,
        DeliveryResult::NackCorrupt => RESULT_NACK_CORRUPT,
        DeliveryResult::SendError => RESULT_SEND_ERROR,
    }
}

fn result_from_u8(raw: u8) -> DeliveryResult {
    match raw {
        RESULT_ACK => DeliveryResult::Ack,
        RESULT_NACK_CORRUPT => DeliveryResult::NackCorrupt,
        RESULT_SEND_ERROR => DeliveryResult::SendError,
        _ => DeliveryResult::Nack,
    }
}

/// A remote tunnel station bound to a bus identity.
pub struct TunnelPeer {
    pub station_id: u8,
    pub network_id: u8,
    pub remote: Option<SocketAddr>,
    last_acked_seq: AtomicU32,
    last_result: AtomicU8,
}

impl TunnelPeer {
    fn empty() -> Self {
        Self {
            station_id: 0,
            network_id: 0,
            remote: None,
            last_acked_seq: AtomicU32::new(u32::MAX),
            last_result: AtomicU8::new(RESULT_NACK),
        }
    }

    /// The sequence and outcome of the most recent bus delivery for this
    /// peer, for duplicate suppression.
    pub fn last_delivery(&self) -> (u32, DeliveryResult) {
        (
            self.last_acked_seq.load(Ordering::Relaxed),
            result_from_u8(self.last_result.load(Ordering::Relaxed)),
        )
    }

    pub fn record_delivery(&self, seq: u32, result: DeliveryResult) {
        self.last_result.store(result_to_u8(result), Ordering::Relaxed);
        self.last_acked_seq.store(seq, Ordering::Relaxed);
    }
}

pub struct PeerTable {
    pub bus: [BusPeer; BUS_PEER_SLOTS],
    pub tunnel: [TunnelPeer; TUNNEL_PEER_SLOTS],
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            bus: core::array::from_fn(|_| BusPeer {
                station_id: 0,
                network_id: 0,
                bound_port: 0,
                socket: None,
            }),
            tunnel: core::array::from_fn(|_| TunnelPeer::empty()),
        }
    }

    /// Opens a socket for a local bus station and registers it.
    pub fn add_bus_peer(&mut self, cfg: &BusPeerConfig) -> Result<(), PeerConfigError> {
        if cfg.station_id == 0 || cfg.station_id == 255 {
            return Err(PeerConfigError::InvalidStationId(cfg.station_id));
        }
        let slot = self
            .bus
            .iter_mut()
            .find(|p| p.station_id == 0)
            .ok_or(PeerConfigError::NoFreeSlot { station_id: cfg.station_id })?;

        let socket = UdpSocket::bind(("0.0.0.0", cfg.bound_port))
            .map_err(|source| PeerConfigError::Bind { port: cfg.bound_port, source })?;
        let bound_port = socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(cfg.bound_port);

        dev_info!("Added bus station {} on port {}", cfg.station_id, bound_port);
        slot.station_id = cfg.station_id;
        slot.network_id = cfg.network_id;
        slot.bound_port = bound_port;
        slot.socket = Some(socket);
        Ok(())
    }

    /// Registers a remote tunnel station.
    pub fn add_tunnel_peer(&mut self, cfg: &TunnelPeerConfig) -> Result<(), PeerConfigError> {
        if cfg.station_id == 0 || cfg.station_id == 255 {
            return Err(PeerConfigError::InvalidStationId(cfg.station_id));
        }
        let slot = self
            .tunnel
            .iter_mut()
            .find(|p| p.station_id == 0)
            .ok_or(PeerConfigError::NoFreeSlot { station_id: cfg.station_id })?;

        let ip: IpAddr = cfg
            .remote_address
            .parse()
            .map_err(|_| PeerConfigError::BadAddress(cfg.remote_address.clone()))?;

        dev_info!(
            "Added tunnel station {} at {}:{}",
            cfg.station_id,
            ip,
            cfg.remote_port
        );
        slot.station_id = cfg.station_id;
        slot.network_id = cfg.network_id;
        slot.remote = Some(SocketAddr::new(ip, cfg.remote_port));
        slot.last_acked_seq.store(u32::MAX, Ordering::Relaxed);
        slot.last_result.store(RESULT_NACK, Ordering::Relaxed);
        Ok(())
    }

    pub fn bus_by_station(&self, station_id: u8) -> Option<&BusPeer> {
        if station_id == 0 {
            return None;
        }
        self.bus.iter().find(|p| p.station_id == station_id)
    }

    pub fn tunnel_by_station(&self, station_id: u8) -> Option<&TunnelPeer> {
        if station_id == 0 {
            return None;
        }
        self.tunnel.iter().find(|p| p.station_id == station_id)
    }

    pub fn tunnel_by_port(&self, remote_port: u16) -> Option<&TunnelPeer> {
        self.tunnel
            .iter()
            .filter(|p| p.station_id != 0)
            .find(|p| p.remote.is_some_and(|a| a.port() == remote_port))
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_cfg(station_id: u8) -> BusPeerConfig {
        BusPeerConfig { station_id, network_id: 0, bound_port: 0 }
    }

    fn tunnel_cfg(station_id: u8, port: u16) -> TunnelPeerConfig {
        TunnelPeerConfig {
            station_id,
            network_id: 0,
            remote_address: "127.0.0.1".into(),
            remote_port: port,
        }
    }

    #[test]
    fn test_add_and_lookup_bus_peer() {
        let mut table = PeerTable::new();
        table.add_bus_peer(&bus_cfg(1)).unwrap();
        let peer = table.bus_by_station(1).unwrap();
        assert_eq!(peer.station_id, 1);
        assert!(peer.socket.is_some());
        assert_ne!(peer.bound_port, 0);
        assert!(table.bus_by_station(2).is_none());
    }

    #[test]
    fn test_station_zero_never_matches() {
        let table = PeerTable::new();
        assert!(table.bus_by_station(0).is_none());
        assert!(table.tunnel_by_station(0).is_none());
    }

    #[test]
    fn test_bus_slots_exhaust() {
        let mut table = PeerTable::new();
        for i in 1..=BUS_PEER_SLOTS as u8 {
            table.add_bus_peer(&bus_cfg(i)).unwrap();
        }
        assert!(matches!(
            table.add_bus_peer(&bus_cfg(99)),
            Err(PeerConfigError::NoFreeSlot { station_id: 99 })
        ));
    }

    #[test]
    fn test_invalid_station_ids_rejected() {
        let mut table = PeerTable::new();
        assert!(matches!(
            table.add_bus_peer(&bus_cfg(0)),
            Err(PeerConfigError::InvalidStationId(0))
        ));
        assert!(matches!(
            table.add_tunnel_peer(&tunnel_cfg(255, 32768)),
            Err(PeerConfigError::InvalidStationId(255))
        ));
    }

    #[test]
    fn test_tunnel_lookup_by_port() {
        let mut table = PeerTable::new();
        table.add_tunnel_peer(&tunnel_cfg(101, 32768)).unwrap();
        table.add_tunnel_peer(&tunnel_cfg(102, 32769)).unwrap();
        assert_eq!(table.tunnel_by_port(32769).unwrap().station_id, 102);
        assert!(table.tunnel_by_port(40000).is_none());
    }

    #[test]
    fn test_bad_address_rejected() {
        let mut table = PeerTable::new();
        let mut cfg = tunnel_cfg(101, 32768);
        cfg.remote_address = "not-an-address".into();
        assert!(matches!(
            table.add_tunnel_peer(&cfg),
            Err(PeerConfigError::BadAddress(_))
        ));
    }

    #[test]
    fn test_duplicate_suppression_state() {
        let mut table = PeerTable::new();
        table.add_tunnel_peer(&tunnel_cfg(101, 32768)).unwrap();
        let peer = table.tunnel_by_station(101).unwrap();
        // Fresh peers never match an inbound sequence.
        assert_eq!(peer.last_delivery(), (u32::MAX, DeliveryResult::Nack));
        peer.record_delivery(16, DeliveryResult::Ack);
        assert_eq!(peer.last_delivery(), (16, DeliveryResult::Ack));
    }
}
