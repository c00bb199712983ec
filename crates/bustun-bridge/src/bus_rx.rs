//! Bus-to-tunnel pipeline.
//!
//! Drains the link's received-packet queue, pairs each scout with the data
//! frame that follows it, rewrites the packet buffer into a tunnel
//! datagram in place and pushes it to the bound tunnel peer, retrying
//! until a matching acknowledge comes back or the attempt budget runs out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Mutex;
use std::time::Duration;

use bustun_common::{dev_error, dev_info, dev_warn};
use bustun_link::RxItem;
use bustun_link::frame::{AddressPair, FrameHdr, SCOUT_LEN};
use bustun_link::pool::PacketRef;
use zerocopy::{FromBytes, IntoBytes};

use crate::peers::PeerTable;
use crate::stats::{BridgeStats, bump};
use crate::wire::{TUNNEL_HDR_LEN, TunnelHdr, kind};

/// How long a scout may dangle before the transaction is abandoned.
const DATA_FRAME_DEADLINE: Duration = Duration::from_secs(10);

/// How long each receive on the acknowledge queue waits.
const TUNNEL_ACK_DEADLINE: Duration = Duration::from_millis(200);

/// Datagram transmissions per transaction, the first included.
const SEND_ATTEMPTS: u32 = 5;

/// Out-of-sequence acknowledges tolerated within one wait.
const ACK_MISMATCH_BUDGET: u32 = 5;

/// An acknowledge or refusal observed on the tunnel. Either kind settles
/// the wait for its sequence; the peer has answered.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TunnelAck {
    pub seq: u32,
}

enum DataWait {
    Frame(PacketRef),
    Abandon,
    Exit,
}

pub(crate) struct BusRxTask {
    pub queue: Arc<Mutex<Receiver<RxItem>>>,
    pub acks: Arc<Mutex<Receiver<TunnelAck>>>,
    pub peers: Arc<PeerTable>,
    pub stats: Arc<BridgeStats>,
    pub seq: Arc<AtomicU32>,
}

impl BusRxTask {
    pub fn run(self) {
        let queue = self.queue.lock().unwrap();
        let acks = self.acks.lock().unwrap();

        loop {
            let item = match queue.recv() {
                Ok(item) => item,
                Err(_) => return,
            };
            let scout = match item {
                RxItem::Shutdown => {
                    dev_info!("Bus receive pipeline shut down");
                    return;
                }
                RxItem::Idle => continue,
                RxItem::Frame(pkt) => pkt,
            };

            if scout.len() < SCOUT_LEN {
                dev_warn!("Unexpected short scout frame (len={}) discarded", scout.len());
                continue;
            }
            if scout.len() != SCOUT_LEN {
                let pair = AddressPair::from_frame(scout.frame());
                dev_warn!(
                    "Expected scout but got a {} byte frame ({}). Discarding",
                    scout.len(),
                    pair
                );
                continue;
            }
            let scout_hdr = FrameHdr::read_from_bytes(scout.frame())
                .expect("scout length checked");
            let pair = AddressPair::from_frame(scout.frame());
            // Return the buffer before waiting on the data frame.
            drop(scout);

            match self.await_data_frame(&queue, pair, &scout_hdr) {
                DataWait::Frame(pkt) => self.forward(pkt, &scout_hdr, &acks),
                DataWait::Abandon => continue,
                DataWait::Exit => {
                    dev_info!("Bus receive pipeline shut down");
                    return;
                }
            }
        }
    }

    fn await_data_frame(
        &self,
        queue: &Receiver<RxItem>,
        pair: AddressPair,
        scout_hdr: &FrameHdr,
    ) -> DataWait {
        match queue.recv_timeout(DATA_FRAME_DEADLINE) {
            Ok(RxItem::Frame(pkt)) => {
                if pkt.len() < SCOUT_LEN {
                    dev_warn!("Unexpected short data frame discarded ({})", pair);
                    return DataWait::Abandon;
                }
                if pkt.frame()[..4] != scout_hdr.as_bytes()[..4] {
                    dev_warn!("Address mismatch between scout and data frame ({})", pair);
                }
                DataWait::Frame(pkt)
            }
            Ok(RxItem::Idle) => {
                dev_warn!(
                    "Idle whilst waiting for data frame ({}, ctrl=0x{:x}, port=0x{:x})",
                    pair,
                    scout_hdr.control,
                    scout_hdr.port
                );
                DataWait::Abandon
            }
            Ok(RxItem::Shutdown) | Err(RecvTimeoutError::Disconnected) => DataWait::Exit,
            Err(RecvTimeoutError::Timeout) => {
                dev_warn!(
                    "Timeout waiting for data frame ({}, ctrl=0x{:x}, port=0x{:x}). No clock?",
                    pair,
                    scout_hdr.control,
                    scout_hdr.port
                );
                DataWait::Abandon
            }
        }
    }

    fn forward(&self, mut data: PacketRef, scout_hdr: &FrameHdr, acks: &Receiver<TunnelAck>) {
        let src_stn = data.frame()[2];
        let dst_stn = data.frame()[0];

        let Some(bus_peer) = self.peers.bus_by_station(src_stn) else {
            dev_warn!("Bus station {} is not configured. Not forwarding frame", src_stn);
            bump(&self.stats.tx_unroutable_count);
            return;
        };
        let Some(socket) = bus_peer.socket.as_ref() else {
            bump(&self.stats.tx_unroutable_count);
            return;
        };
        let Some(tunnel_peer) = self.peers.tunnel_by_station(dst_stn) else {
            dev_error!(
                "Tunnel station {} is not configured but we accepted a frame for it!",
                dst_stn
            );
            bump(&self.stats.tx_unroutable_count);
            return;
        };
        let Some(remote) = tunnel_peer.remote else {
            bump(&self.stats.tx_unroutable_count);
            return;
        };

        bump(&self.stats.tx_count);
        let seq = self.seq.fetch_add(4, Ordering::Relaxed) + 4;

        dev_info!(
            "Data frame of {} bytes for tunnel station {} (seq {})",
            data.len(),
            dst_stn,
            seq
        );

        let body_len = data.len() - 4;
        let buf = data.prefixed_mut();
        let hdr = TunnelHdr::new(kind::DATA, scout_hdr.port, scout_hdr.control & 0x7F, seq);
        buf[..TUNNEL_HDR_LEN].copy_from_slice(hdr.as_bytes());
        let datagram = &buf[..TUNNEL_HDR_LEN + body_len];

        let mut delivered = false;
        for attempt in 0..SEND_ATTEMPTS {
            if attempt > 0 {
                bump(&self.stats.tx_retry_count);
                dev_info!("Retry! {} attempts remain", SEND_ATTEMPTS - attempt - 1);
            }
            if let Err(e) = socket.send_to(datagram, remote) {
                dev_error!("Error occurred during tunnel send: {}", e);
                bump(&self.stats.tx_error_count);
            }
            if self.await_tunnel_ack(seq, acks) {
                delivered = true;
                break;
            }
        }

        if !delivered {
            dev_warn!("Retries exhausted, no response from peer {}", remote);
            bump(&self.stats.tx_abort_count);
        }
    }

    fn await_tunnel_ack(&self, seq: u32, acks: &Receiver<TunnelAck>) -> bool {
        for _ in 0..ACK_MISMATCH_BUDGET {
            match acks.recv_timeout(TUNNEL_ACK_DEADLINE) {
                Ok(ack) if ack.seq == seq => return true,
                Ok(ack) => {
                    dev_warn!(
                        "Ignoring out-of-sequence tunnel ack (seq {}, awaiting {})",
                        ack.seq,
                        seq
                    );
                }
                Err(_) => return false,
            }
        }
        dev_warn!("Too many out-of-sequence tunnel acks!");
        false
    }
}
