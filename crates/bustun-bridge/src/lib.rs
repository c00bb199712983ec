/*! The bridge between a half-duplex serial bus and a UDP tunnel.

Stations are bound together by identity: every bus station the bridge
answers for has a remote tunnel peer, and each logical transaction is
relayed from one side to the other while both handshakes are preserved.

Two unidirectional pipelines run as threads around the link layer from
`bustun-link`: [`bus_rx`] turns scout/data frame pairs into tunnel
datagrams and awaits the matching acknowledge; [`tunnel_rx`] waits on the
bus peers' sockets, answers reachability probes, and hands data datagrams
to the bus engine, suppressing duplicates the peer resent because an
acknowledge was lost.

Reconfiguration always quiesces both pipelines first: the bus pipeline is
woken with a sentinel in its packet queue, the tunnel pipeline with a byte
on its control pipe, and each is joined before peers are rebuilt.
*/

mod bus_rx;
pub mod peers;
pub mod stats;
mod tunnel_rx;
pub mod wire;

use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicU32;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use bustun_common::dev_info;
use bustun_link::engine::{BusEngine, BusHandle, EngineCmd};
use bustun_link::filter::AddrFilter;
use bustun_link::rx::BitPump;
use bustun_link::stats::{LinkStats, LinkStatsSnapshot};
use bustun_link::tx::LineTx;
use bustun_link::{ChannelEvents, Link, RxItem};

use bus_rx::{BusRxTask, TunnelAck};
use peers::{PeerConfigError, PeerTable};
use stats::{BridgeStats, BridgeStatsSnapshot};
use tunnel_rx::TunnelRxTask;

/// Depth of the tunnel acknowledge queue.
pub const ACK_QUEUE_DEPTH: usize = 10;

pub struct Bridge<L: LineTx + 'static> {
    handle: BusHandle,
    engine: Option<BusEngine<L>>,
    engine_cmds: SyncSender<EngineCmd>,
    engine_thread: Option<JoinHandle<()>>,

    rx_sender: SyncSender<RxItem>,
    rx_queue: Arc<Mutex<Receiver<RxItem>>>,
    filter: Arc<AddrFilter>,
    link_stats: Arc<LinkStats>,

    stats: Arc<BridgeStats>,
    seq: Arc<AtomicU32>,
    acks_tx: SyncSender<TunnelAck>,
    acks_rx: Arc<Mutex<Receiver<TunnelAck>>>,
    pipe_r: Arc<OwnedFd>,
    pipe_w: OwnedFd,

    peers: Option<Arc<PeerTable>>,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
}

impl<L: LineTx + 'static> Bridge<L> {
    /// Consumes a built link and returns the bridge plus the bit pump the
    /// line driver must clock.
    pub fn new(link: Link<L>) -> io::Result<(Self, BitPump<ChannelEvents<L>>)> {
        let (pipe_r, pipe_w) = nix::unistd::pipe().map_err(io::Error::from)?;
        let (acks_tx, acks_rx) = sync_channel(ACK_QUEUE_DEPTH);

        let bridge = Self {
            handle: link.handle,
            engine: Some(link.engine),
            engine_cmds: link.engine_cmds,
            engine_thread: None,
            rx_sender: link.rx_sender,
            rx_queue: link.rx_queue,
            filter: link.filter,
            link_stats: link.stats,
            stats: Arc::new(BridgeStats::default()),
            seq: Arc::new(AtomicU32::new(0)),
            acks_tx,
            acks_rx: Arc::new(Mutex::new(acks_rx)),
            pipe_r: Arc::new(pipe_r),
            pipe_w,
            peers: None,
            tasks: Vec::new(),
            running: false,
        };
        Ok((bridge, link.pump))
    }

    /// Starts the bus engine and applies the initial configuration.
    pub fn start<F>(&mut self, load: F) -> Result<(), PeerConfigError>
    where
        F: FnOnce(&mut PeerTable) -> Result<(), PeerConfigError>,
    {
        if let Some(engine) = self.engine.take() {
            let thread = thread::Builder::new()
                .name("bus-engine".into())
                .spawn(move || engine.run())
                .expect("spawn bus engine thread");
            self.engine_thread = Some(thread);
        }
        self.reconfigure(load)
    }

    /// Quiesces both pipelines, rebuilds the peer tables through `load`
    /// and restarts. A peer that failed to load is skipped: the bridge
    /// comes back up with the peers that did bind and the first error is
    /// returned.
    pub fn reconfigure<F>(&mut self, load: F) -> Result<(), PeerConfigError>
    where
        F: FnOnce(&mut PeerTable) -> Result<(), PeerConfigError>,
    {
        self.quiesce();

        let mut table = PeerTable::new();
        let result = load(&mut table);

        self.filter.clear();
        for peer in table.tunnel.iter().filter(|p| p.station_id != 0) {
            self.filter.enable_station(peer.station_id);
        }

        let table = Arc::new(table);
        self.peers = Some(Arc::clone(&table));
        self.spawn_tasks(table);
        self.running = true;
        result
    }

    /// Stops the pipelines and the bus engine.
    pub fn shutdown(&mut self) {
        self.quiesce();
        if let Some(thread) = self.engine_thread.take() {
            let _ = self.engine_cmds.send(EngineCmd::Shutdown);
            let _ = thread.join();
        }
    }

    /// The origination entry point, mostly useful to tests and tooling;
    /// the tunnel pipeline drives it in normal operation.
    pub fn bus_handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub fn peers(&self) -> Option<&Arc<PeerTable>> {
        self.peers.as_ref()
    }

    pub fn bridge_stats(&self) -> BridgeStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn link_stats(&self) -> LinkStatsSnapshot {
        self.link_stats.snapshot()
    }

    fn quiesce(&mut self) {
        if !self.running {
            return;
        }
        dev_info!("Quiescing bridge pipelines");
        self.filter.clear();
        let _ = self.rx_sender.send(RxItem::Shutdown);
        let _ = nix::unistd::write(&self.pipe_w, &[0u8]);
        for task in self.tasks.drain(..) {
            let _ = task.join();
        }
        self.running = false;
    }

    fn spawn_tasks(&mut self, table: Arc<PeerTable>) {
        let bus_rx = BusRxTask {
            queue: Arc::clone(&self.rx_queue),
            acks: Arc::clone(&self.acks_rx),
            peers: Arc::clone(&table),
            stats: Arc::clone(&self.stats),
            seq: Arc::clone(&self.seq),
        };
        let tunnel_rx = TunnelRxTask {
            peers: table,
            pipe_r: Arc::clone(&self.pipe_r),
            acks: self.acks_tx.clone(),
            bus: self.handle.clone(),
            stats: Arc::clone(&self.stats),
        };

        self.tasks.push(
            thread::Builder::new()
                .name("bus-rx".into())
                .spawn(move || bus_rx.run())
                .expect("spawn bus rx thread"),
        );
        self.tasks.push(
            thread::Builder::new()
                .name("tunnel-rx".into())
                .spawn(move || tunnel_rx.run())
                .expect("spawn tunnel rx thread"),
        );
    }
}

impl<L: LineTx + 'static> Drop for Bridge<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
