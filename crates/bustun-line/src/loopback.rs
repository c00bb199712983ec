//! An in-process two-station bus.
//!
//! One driver thread plays the clock source: it pops transmit descriptors
//! from either port's FIFO and clocks the resulting bus level into both
//! bit pumps, modelling the idle-high line (an undriven symbol reads as a
//! one, exactly like the biased physical bus). When neither port is
//! transmitting it clocks idle ones at a slower rate so receivers observe
//! genuine quiescence between transactions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bustun_common::util::RingBuffer;
use bustun_link::rx::{BitPump, PumpEvents};
use bustun_link::shared::LineShared;
use bustun_link::tx::{
    FLAG_STREAM_CAP, FLAG_STREAM_COUNT, LineTx, LineTxError, encode_flag_stream, wire_bits,
};

/// Depth of each port's transmit descriptor FIFO.
const TX_FIFO_DEPTH: usize = 4;

/// Frame bits clocked per pacing tick.
const FRAME_BITS_PER_TICK: usize = 64;

/// Idle bits clocked per pacing tick; slow enough that a responder gets
/// on the bus before the idle threshold trips.
const IDLE_BITS_PER_TICK: usize = 2;

const TICK: Duration = Duration::from_millis(1);

struct PortState {
    queue: RingBuffer<Vec<u8>, TX_FIFO_DEPTH>,
    primer: Option<Vec<u8>>,
    transmitting: bool,
}

pub struct LoopbackPort {
    state: Mutex<PortState>,
    done: Condvar,
    shared: OnceLock<Arc<LineShared>>,
    flag_bits: Vec<u8>,
}

impl LoopbackPort {
    fn new() -> Arc<Self> {
        let flag_bits = encode_flag_stream::<FLAG_STREAM_CAP>(FLAG_STREAM_COUNT)
            .expect("flag stream fits its capacity")
            .to_vec();
        Arc::new(Self {
            state: Mutex::new(PortState {
                queue: RingBuffer::new(),
                primer: None,
                transmitting: false,
            }),
            done: Condvar::new(),
            shared: OnceLock::new(),
            flag_bits,
        })
    }

    /// Connects the port to its link's shared line state so transmissions
    /// gate the local idle counter. Must be called before traffic flows.
    pub fn attach(&self, shared: Arc<LineShared>) {
        let _ = self.shared.set(shared);
    }

    fn set_tx(&self, active: bool) {
        if let Some(shared) = self.shared.get() {
            shared.set_tx_in_progress(active);
        }
    }

    fn pop_descriptor(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        match state.queue.pop() {
            Some(bits) => {
                state.transmitting = true;
                Some(bits)
            }
            None => None,
        }
    }

    fn descriptor_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.transmitting = false;
        if state.queue.is_empty() {
            self.set_tx(false);
        }
        self.done.notify_all();
    }

    fn abandon(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue.clear();
        state.transmitting = false;
        self.set_tx(false);
        self.done.notify_all();
    }
}

impl LineTx for LoopbackPort {
    fn submit(&self, bits: &[u8]) -> Result<(), LineTxError> {
        let mut state = self.state.lock().unwrap();
        state.queue.push(bits.to_vec()).map_err(|_| LineTxError::QueueFull)?;
        drop(state);
        self.set_tx(true);
        Ok(())
    }

    fn wait_done(&self) {
        let mut state = self.state.lock().unwrap();
        while state.transmitting || !state.queue.is_empty() {
            state = self.done.wait(state).unwrap();
        }
    }

    fn prequeue_flag_stream(&self) {
        let mut state = self.state.lock().unwrap();
        if state.primer.is_none() {
            state.primer = Some(self.flag_bits.clone());
        }
    }

    fn pre_go(&self) {
        self.set_tx(true);
        let mut state = self.state.lock().unwrap();
        if let Some(primer) = state.primer.take() {
            let _ = state.queue.push(primer);
        }
    }
}

/// Handle to the running bus; stops and joins the clock thread on drop.
pub struct LoopbackBus {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    ports: [Arc<LoopbackPort>; 2],
}

impl LoopbackBus {
    pub fn new_pair() -> (Arc<LoopbackPort>, Arc<LoopbackPort>) {
        (LoopbackPort::new(), LoopbackPort::new())
    }

    /// Starts the clock thread driving both pumps.
    pub fn spawn<EA, EB>(
        port_a: Arc<LoopbackPort>,
        port_b: Arc<LoopbackPort>,
        mut pump_a: BitPump<EA>,
        mut pump_b: BitPump<EB>,
    ) -> Self
    where
        EA: PumpEvents + Send + 'static,
        EB: PumpEvents + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let ports = [Arc::clone(&port_a), Arc::clone(&port_b)];

        let thread = thread::Builder::new()
            .name("loopback-bus".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    let job = port_a
                        .pop_descriptor()
                        .map(|bits| (0usize, bits))
                        .or_else(|| port_b.pop_descriptor().map(|bits| (1usize, bits)));

                    match job {
                        Some((side, bits)) => {
                            let mut clocked = 0;
                            for wb in wire_bits(&bits) {
                                let level = wb.bus_level();
                                pump_a.clock_bit(level);
                                pump_b.clock_bit(level);
                                clocked += 1;
                                if clocked % FRAME_BITS_PER_TICK == 0 {
                                    thread::sleep(TICK);
                                }
                            }
                            if side == 0 {
                                port_a.descriptor_done();
                            } else {
                                port_b.descriptor_done();
                            }
                        }
                        None => {
                            for _ in 0..IDLE_BITS_PER_TICK {
                                pump_a.clock_bit(true);
                                pump_b.clock_bit(true);
                            }
                            thread::sleep(TICK);
                        }
                    }
                }
                port_a.abandon();
                port_b.abandon();
            })
            .expect("spawn loopback bus thread");

        Self { stop, thread: Some(thread), ports }
    }
}

impl Drop for LoopbackBus {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        for port in &self.ports {
            port.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bustun_link::build_link;
    use bustun_link::engine::EngineCmd;
    use bustun_link::RxItem;
    use std::time::Duration;

    /// Two full links exchanging one four-way handshake over the bus.
    #[test]
    fn test_four_way_handshake_between_links() {
        let (port_a, port_b) = LoopbackBus::new_pair();
        let link_a = build_link(Arc::clone(&port_a));
        let link_b = build_link(Arc::clone(&port_b));
        port_a.attach(Arc::clone(&link_a.shared));
        port_b.attach(Arc::clone(&link_b.shared));

        // A answers for station 101, B for station 1.
        link_a.filter.enable_station(101);
        link_b.filter.enable_station(1);

        let engine_a_cmds = link_a.engine_cmds.clone();
        let engine_b_cmds = link_b.engine_cmds.clone();
        let a_engine = thread::spawn(move || link_a.engine.run());
        let b_engine = thread::spawn(move || link_b.engine.run());

        let _bus = LoopbackBus::spawn(port_a, port_b, link_a.pump, link_b.pump);

        // A originates a frame to station 1; B's pump acknowledges both
        // halves automatically.
        let result = link_a.handle.send(&[1, 0, 101, 0, 0x80, 0x99, 7, 8, 9]);
        assert!(result.is_ack(), "four-way handshake failed: {:?}", result);

        // B's consumer sees the scout and then the data frame.
        let queue = link_b.rx_queue.lock().unwrap();
        let mut frames = Vec::new();
        while frames.len() < 2 {
            match queue.recv_timeout(Duration::from_secs(2)).expect("frame from bus") {
                RxItem::Frame(pkt) => frames.push(pkt.frame().to_vec()),
                RxItem::Idle => {}
                RxItem::Shutdown => panic!("unexpected shutdown"),
            }
        }
        assert_eq!(frames[0], vec![1, 0, 101, 0, 0x80, 0x99]);
        assert_eq!(frames[1], vec![1, 0, 101, 0, 7, 8, 9]);

        let _ = engine_a_cmds.send(EngineCmd::Shutdown);
        let _ = engine_b_cmds.send(EngineCmd::Shutdown);
        let _ = a_engine.join();
        let _ = b_engine.join();
    }
}
