/*! Link layer for a half-duplex HDLC-framed bus.

The receive half ([`rx::BitPump`]) is clocked bit by bit from the line
driver and assembles frames into a small pool of packet buffers
([`pool::PacketRing`]). The transmit half serialises frames to bit-stuffed
wire buffers ([`tx`]) which a [`tx::LineTx`] driver clocks out. A single
engine task ([`engine::BusEngine`]) owns transmission ordering and runs the
four-way handshake (scout, scout-ack, data, data-ack) in both roles.

[`build_link`] wires the pieces together with bounded queues: the pump
posts into them without ever blocking, the engine and the consumer drain
them.
*/

pub mod engine;
pub mod filter;
pub mod frame;
pub mod pool;
pub mod rx;
pub mod shared;
pub mod stats;
pub mod tx;

use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};

use engine::{BusEngine, BusHandle, ENGINE_QUEUE_DEPTH, EngineCmd};
use filter::AddrFilter;
use frame::AddressPair;
use pool::{PacketRef, PacketRing};
use rx::{BitPump, PumpEvents};
use shared::LineShared;
use stats::LinkStats;
use tx::LineTx;

/// Depth of the received-packet queue drained by the consumer task.
pub const RX_QUEUE_DEPTH: usize = 4;

/// What the consumer task receives.
pub enum RxItem {
    /// A data frame addressed to us.
    Frame(PacketRef),
    /// The bus went idle.
    Idle,
    /// Sentinel: the consumer task should exit.
    Shutdown,
}

/// [`PumpEvents`] implementation posting into the engine and consumer
/// queues. Lives in the line driver's context, so every post is a
/// `try_send`.
pub struct ChannelEvents<L: LineTx> {
    engine: SyncSender<EngineCmd>,
    packets: SyncSender<RxItem>,
    line: Arc<L>,
}

impl<L: LineTx> PumpEvents for ChannelEvents<L> {
    fn frame_received(&mut self, pkt: PacketRef) -> Result<(), PacketRef> {
        match self.packets.try_send(RxItem::Frame(pkt)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(RxItem::Frame(pkt)))
            | Err(TrySendError::Disconnected(RxItem::Frame(pkt))) => Err(pkt),
            Err(_) => unreachable!("returned item is what we sent"),
        }
    }

    fn ack_required(&mut self, pair: AddressPair) {
        let _ = self.engine.try_send(EngineCmd::AckFrame(pair));
        // Claim the bus right away so the sender sees activity before the
        // acknowledge frame itself is clocked out.
        self.line.pre_go();
    }

    fn ack_observed(&mut self, pair: AddressPair) {
        let _ = self.engine.try_send(EngineCmd::AckObserved(pair));
    }

    fn bus_idle(&mut self) {
        let _ = self.packets.try_send(RxItem::Idle);
        let _ = self.engine.try_send(EngineCmd::Idle);
    }
}

/// Everything `build_link` produces. The pump goes to the line driver, the
/// engine to its own thread; the rest is shared plumbing.
pub struct Link<L: LineTx> {
    pub pump: BitPump<ChannelEvents<L>>,
    pub engine: BusEngine<L>,
    pub handle: BusHandle,
    pub engine_cmds: SyncSender<EngineCmd>,
    pub rx_sender: SyncSender<RxItem>,
    pub rx_queue: Arc<Mutex<Receiver<RxItem>>>,
    pub filter: Arc<AddrFilter>,
    pub stats: Arc<LinkStats>,
    pub shared: Arc<LineShared>,
}

/// Builds a complete link over `line`.
pub fn build_link<L: LineTx>(line: Arc<L>) -> Link<L> {
    let shared = Arc::new(LineShared::new());
    let stats = Arc::new(LinkStats::default());
    let filter = Arc::new(AddrFilter::new());
    let ring = PacketRing::new();

    let (engine_tx, engine_rx) = sync_channel(ENGINE_QUEUE_DEPTH);
    let (rx_tx, rx_rx) = sync_channel(RX_QUEUE_DEPTH);

    let events = ChannelEvents {
        engine: engine_tx.clone(),
        packets: rx_tx.clone(),
        line: Arc::clone(&line),
    };
    let pump = BitPump::new(
        events,
        Arc::clone(&shared),
        Arc::clone(&stats),
        Arc::clone(&filter),
        ring,
    );
    let engine = BusEngine::new(line, engine_rx, Arc::clone(&shared), Arc::clone(&stats));

    Link {
        pump,
        engine,
        handle: BusHandle::new(engine_tx.clone()),
        engine_cmds: engine_tx,
        rx_sender: rx_tx,
        rx_queue: Arc::new(Mutex::new(rx_rx)),
        filter,
        stats,
        shared,
    }
}
