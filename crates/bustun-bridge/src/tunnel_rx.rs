//! Tunnel-to-bus pipeline.
//!
//! Waits on the set of bus peers' sockets plus the shutdown pipe. Inbound
//! acknowledges fan in to the queue the bus-to-tunnel pipeline consumes;
//! reachability probes are answered in place; data datagrams are rewritten
//! to bus frames, checked against the peer's duplicate-suppression state,
//! handed to the bus engine and answered with an acknowledge or a refusal.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::mpsc::SyncSender;

use bustun_common::{dev_error, dev_info, dev_warn};
use bustun_link::engine::{BusHandle, DeliveryResult};
use bustun_link::frame::BUS_MTU;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use zerocopy::{FromBytes, IntoBytes};

use crate::bus_rx::TunnelAck;
use crate::peers::{BusPeer, PeerTable};
use crate::stats::{BridgeStats, bump};
use crate::wire::{IMM_REPLY_LEN, MACHINE_PROBE_CONTROL, TUNNEL_HDR_LEN, TunnelHdr, kind};

pub(crate) struct TunnelRxTask {
    pub peers: Arc<PeerTable>,
    pub pipe_r: Arc<OwnedFd>,
    pub acks: SyncSender<TunnelAck>,
    pub bus: BusHandle,
    pub stats: Arc<BridgeStats>,
}

impl TunnelRxTask {
    pub fn run(self) {
        let mut buf = [0u8; TUNNEL_HDR_LEN + BUS_MTU];
        let open_peers: Vec<usize> = self
            .peers
            .bus
            .iter()
            .enumerate()
            .filter(|(_, p)| p.station_id != 0 && p.socket.is_some())
            .map(|(i, _)| i)
            .collect();

        loop {
            let mut ready = vec![false; open_peers.len()];
            let mut shutdown = false;
            {
                let mut fds = Vec::with_capacity(open_peers.len() + 1);
                fds.push(PollFd::new(self.pipe_r.as_fd(), PollFlags::POLLIN));
                for &i in &open_peers {
                    let socket = self.peers.bus[i].socket.as_ref().unwrap();
                    fds.push(PollFd::new(socket.as_fd(), PollFlags::POLLIN));
                }

                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        dev_error!("poll failed: {}", e);
                        return;
                    }
                }

                if fds[0]
                    .revents()
                    .unwrap_or(PollFlags::empty())
                    .contains(PollFlags::POLLIN)
                {
                    shutdown = true;
                }
                for (slot, fd) in ready.iter_mut().zip(&fds[1..]) {
                    *slot = fd
                        .revents()
                        .unwrap_or(PollFlags::empty())
                        .contains(PollFlags::POLLIN);
                }
            }

            if shutdown {
                let mut byte = [0u8; 1];
                let _ = nix::unistd::read(self.pipe_r.as_raw_fd(), &mut byte);
                dev_info!("Tunnel receive pipeline shut down");
                return;
            }

            for (i, &peer_idx) in open_peers.iter().enumerate() {
                if ready[i] {
                    self.process(&self.peers.bus[peer_idx], &mut buf);
                }
            }
        }
    }

    fn process(&self, bus_peer: &BusPeer, buf: &mut [u8]) {
        let socket = match bus_peer.socket.as_ref() {
            Some(s) => s,
            None => return,
        };
        let (len, from) = match socket.recv_from(buf) {
            Ok(x) => x,
            Err(e) => {
                dev_error!("recv_from failed: {}", e);
                return;
            }
        };

        if len < TUNNEL_HDR_LEN {
            dev_warn!("Runt tunnel datagram ({} bytes) ignored", len);
            bump(&self.stats.rx_unknown_count);
            return;
        }
        let hdr = *TunnelHdr::ref_from_prefix(&buf[..len]).expect("length checked").0;

        match hdr.kind {
            kind::ACK => {
                bump(&self.stats.rx_ack_count);
                let _ = self.acks.try_send(TunnelAck { seq: hdr.seq.get() });
                return;
            }
            kind::NACK => {
                bump(&self.stats.rx_nack_count);
                let _ = self.acks.try_send(TunnelAck { seq: hdr.seq.get() });
                return;
            }
            kind::IMM => bump(&self.stats.rx_imm_count),
            kind::DATA => bump(&self.stats.rx_data_count),
            other => {
                dev_warn!("Received tunnel datagram of unknown type 0x{:02x}. Ignored.", other);
                bump(&self.stats.rx_unknown_count);
                return;
            }
        }

        // Identify the sending station by its source port.
        let Some(tunnel_peer) = self.peers.tunnel_by_port(from.port()) else {
            dev_warn!("Received tunnel datagram but can't identify the station. Ignored.");
            bump(&self.stats.rx_unknown_count);
            return;
        };
        let Some(remote) = tunnel_peer.remote else {
            return;
        };

        if hdr.kind == kind::IMM {
            if hdr.port == 0 && hdr.control == MACHINE_PROBE_CONTROL {
                // Reachability probe: answer it here instead of
                // forwarding an immediate operation onto the bus.
                let mut reply = [0u8; IMM_REPLY_LEN];
                let copy = len.min(IMM_REPLY_LEN);
                reply[..copy].copy_from_slice(&buf[..copy]);
                reply[0] = kind::IMM_REPLY;
                if let Err(e) = socket.send_to(&reply, remote) {
                    dev_error!("Failed to answer reachability probe: {}", e);
                } else {
                    dev_info!("Answered reachability probe without forwarding");
                }
            } else {
                dev_warn!(
                    "Unsupported immediate operation (port 0x{:x}, control 0x{:x}) dropped",
                    hdr.port,
                    hdr.control
                );
            }
            return;
        }

        // Rewrite the datagram header into a bus frame header in place.
        let seq = hdr.seq.get();
        buf[2..8].copy_from_slice(&[
            bus_peer.station_id,
            0x00,
            tunnel_peer.station_id,
            0x00,
            hdr.control | 0x80,
            hdr.port,
        ]);

        let (last_seq, last_result) = tunnel_peer.last_delivery();
        let result = if seq != last_seq || !last_result.is_ack() {
            dev_info!(
                "[{:05}] Sending {} byte frame from {}.{} ({}) to bus station {}.{}",
                seq,
                len,
                tunnel_peer.network_id,
                tunnel_peer.station_id,
                from,
                bus_peer.network_id,
                bus_peer.station_id
            );
            let result = self.bus.send(&buf[2..len]);
            tunnel_peer.record_delivery(seq, result);
            result
        } else {
            dev_info!("[{:05}] Re-acknowledging duplicate (bus ack was {:?})", seq, last_result);
            DeliveryResult::Ack
        };

        let reply_kind = if result.is_ack() {
            bump(&self.stats.tx_ack_count);
            kind::ACK
        } else {
            bump(&self.stats.tx_nack_count);
            kind::NACK
        };
        let reply = TunnelHdr::new(reply_kind, hdr.port, hdr.control, seq);
        if let Err(e) = socket.send_to(reply.as_bytes(), remote) {
            dev_error!("Failed to send tunnel reply: {}", e);
        }
    }
}
