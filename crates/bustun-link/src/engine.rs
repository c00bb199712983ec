//! The bus engine: a single task that owns all frame transmission.
//!
//! Commands arrive on one queue, in the order the bits were observed:
//! acknowledge requests and observed acknowledges posted by the pump, idle
//! notifications, and origination requests from the bridge. The responder
//! side is stateless (emit one four-byte acknowledge per request); the
//! originator side runs the four-way handshake: wait for the bus to go
//! idle, claim it with the pre-go primer, send the scout, wait for the
//! peer's acknowledge, send the data frame, wait again.

use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bustun_common::{dev_debug, dev_error, dev_warn};
use heapless::Vec as HVec;
use ringbuffer::{ConstGenericRingBuffer, RingBuffer};
use serde::Serialize;

use crate::frame::{AddressPair, SCOUT_LEN};
use crate::shared::LineShared;
use crate::stats::{LinkStats, bump};
use crate::tx::{DATA_ENCODE_CAP, LineTx, SCOUT_ENCODE_CAP, encode_frame};

/// How long the originator waits for each acknowledge.
pub const ACK_DEADLINE: Duration = Duration::from_millis(200);

/// Upper bound on a whole origination, guarding the caller against a
/// wedged engine.
const SEND_GUARD: Duration = Duration::from_secs(1);

/// Depth of the engine command queue.
pub const ENGINE_QUEUE_DEPTH: usize = 8;

/// Outcome of one bus origination.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum DeliveryResult {
    /// Full four-way handshake completed.
    Ack,
    /// The peer never answered the scout; safe to retry.
    Nack,
    /// The data frame went out but its acknowledge was not observed. The
    /// peer may have processed the data, so a blind retransmit is unsafe.
    NackCorrupt,
    /// The frame never made it onto the bus.
    SendError,
}

impl DeliveryResult {
    pub fn is_ack(self) -> bool {
        matches!(self, DeliveryResult::Ack)
    }
}

pub enum EngineCmd {
    Originate(OriginateRequest),
    /// A data frame for us arrived; emit an acknowledge with this
    /// addressing.
    AckFrame(AddressPair),
    /// A bare acknowledge frame was seen on the bus.
    AckObserved(AddressPair),
    /// The idle threshold was reached.
    Idle,
    Shutdown,
}

pub struct OriginateRequest {
    pair: AddressPair,
    scout: HVec<u8, SCOUT_ENCODE_CAP>,
    data: HVec<u8, DATA_ENCODE_CAP>,
    reply: SyncSender<DeliveryResult>,
}

/// Cloneable entry point for bus originations. `send` blocks until the
/// engine latches a result; concurrent callers are serialised.
#[derive(Clone)]
pub struct BusHandle {
    cmds: SyncSender<EngineCmd>,
    gate: Arc<Mutex<()>>,
}

impl BusHandle {
    pub(crate) fn new(cmds: SyncSender<EngineCmd>) -> Self {
        Self { cmds, gate: Arc::new(Mutex::new(())) }
    }

    /// Runs the four-way handshake for `frame`, which must be laid out as
    /// `{dst_stn, dst_net, src_stn, src_net, control, port, body...}`.
    /// The scout carries the first six bytes; the data frame carries the
    /// addresses followed by the body.
    pub fn send(&self, frame: &[u8]) -> DeliveryResult {
        let _gate = self.gate.lock().unwrap();

        if frame.len() < SCOUT_LEN {
            dev_error!("Refusing to originate a {} byte frame", frame.len());
            return DeliveryResult::SendError;
        }

        let scout = match encode_frame::<SCOUT_ENCODE_CAP>(&frame[..SCOUT_LEN]) {
            Ok(bits) => bits,
            Err(e) => {
                dev_error!("Failed to encode scout: {:?}", e);
                return DeliveryResult::SendError;
            }
        };

        let mut data_payload = Vec::with_capacity(frame.len() - 2);
        data_payload.extend_from_slice(&frame[..4]);
        data_payload.extend_from_slice(&frame[SCOUT_LEN..]);
        let data = match encode_frame::<DATA_ENCODE_CAP>(&data_payload) {
            Ok(bits) => bits,
            Err(e) => {
                dev_error!("Failed to encode data frame: {:?}", e);
                return DeliveryResult::SendError;
            }
        };

        let pair = AddressPair::from_frame(frame);
        let (reply_tx, reply_rx) = sync_channel(1);
        let req = OriginateRequest { pair, scout, data, reply: reply_tx };
        if self.cmds.send(EngineCmd::Originate(req)).is_err() {
            dev_error!("Bus engine is gone; cannot originate");
            return DeliveryResult::SendError;
        }

        match reply_rx.recv_timeout(SEND_GUARD) {
            Ok(result) => result,
            Err(_) => {
                dev_error!("Timeout waiting for bus delivery result. This is a bug.");
                DeliveryResult::SendError
            }
        }
    }
}

enum AckWait {
    Observed,
    TimedOut,
    WentIdle,
}

pub struct BusEngine<L: LineTx> {
    line: Arc<L>,
    cmds: Receiver<EngineCmd>,
    shared: Arc<LineShared>,
    stats: Arc<LinkStats>,
    /// Acknowledge requests that arrived while an origination held the
    /// bus; serviced as soon as it completes.
    deferred: ConstGenericRingBuffer<AddressPair, ENGINE_QUEUE_DEPTH>,
    pending: Option<OriginateRequest>,
    stopping: bool,
}

impl<L: LineTx> BusEngine<L> {
    pub(crate) fn new(
        line: Arc<L>,
        cmds: Receiver<EngineCmd>,
        shared: Arc<LineShared>,
        stats: Arc<LinkStats>,
    ) -> Self {
        Self {
            line,
            cmds,
            shared,
            stats,
            deferred: ConstGenericRingBuffer::new(),
            pending: None,
            stopping: false,
        }
    }

    /// Drains the command queue until shutdown. Run this on its own
    /// thread.
    pub fn run(mut self) {
        loop {
            self.line.prequeue_flag_stream();

            while let Some(pair) = self.deferred.dequeue() {
                self.emit_ack(pair);
            }

            if self.stopping {
                return;
            }

            if self.pending.is_some() && self.shared.bus_idle() {
                let req = self.pending.take().unwrap();
                self.originate(req);
                continue;
            }

            match self.cmds.recv() {
                Ok(EngineCmd::Originate(req)) => {
                    debug_assert!(self.pending.is_none());
                    self.pending = Some(req);
                }
                Ok(EngineCmd::AckFrame(pair)) => self.emit_ack(pair),
                // No origination is awaiting anything here.
                Ok(EngineCmd::AckObserved(_)) => {}
                Ok(EngineCmd::Idle) => {}
                Ok(EngineCmd::Shutdown) | Err(_) => return,
            }
        }
    }

    fn emit_ack(&mut self, pair: AddressPair) {
        let payload = [pair.dst.station, pair.dst.net, pair.src.station, pair.src.net];
        let bits = match encode_frame::<SCOUT_ENCODE_CAP>(&payload) {
            Ok(bits) => bits,
            Err(e) => {
                dev_error!("Failed to encode acknowledge frame: {:?}", e);
                return;
            }
        };
        if let Err(e) = self.line.submit(&bits) {
            dev_error!("Failed to submit acknowledge frame: {:?}", e);
            return;
        }
        self.line.wait_done();
        bump(&self.stats.tx_ack_count);
    }

    fn originate(&mut self, req: OriginateRequest) {
        dev_debug!("Claiming bus for transaction {}", req.pair);
        self.line.pre_go();

        if self.line.submit(&req.scout).is_err() {
            self.finish(req, DeliveryResult::SendError);
            return;
        }
        self.line.wait_done();

        match self.await_ack(req.pair) {
            AckWait::Observed => {}
            AckWait::TimedOut => {
                dev_warn!("Timeout waiting for scout ack ({})", req.pair);
                bump(&self.stats.tx_nack_count);
                self.finish(req, DeliveryResult::Nack);
                return;
            }
            AckWait::WentIdle => {
                dev_warn!("Bus became idle whilst waiting for scout ack ({})", req.pair);
                bump(&self.stats.tx_nack_count);
                self.finish(req, DeliveryResult::Nack);
                return;
            }
        }

        if self.line.submit(&req.data).is_err() {
            self.finish(req, DeliveryResult::SendError);
            return;
        }
        self.line.wait_done();

        match self.await_ack(req.pair) {
            AckWait::Observed => {
                bump(&self.stats.tx_frame_count);
                self.finish(req, DeliveryResult::Ack);
            }
            AckWait::TimedOut => {
                dev_warn!("Timeout waiting for data ack ({})", req.pair);
                bump(&self.stats.tx_nack_count);
                self.finish(req, DeliveryResult::NackCorrupt);
            }
            AckWait::WentIdle => {
                dev_warn!("Bus became idle whilst waiting for data ack ({})", req.pair);
                bump(&self.stats.tx_nack_count);
                self.finish(req, DeliveryResult::NackCorrupt);
            }
        }
    }

    fn finish(&self, req: OriginateRequest, result: DeliveryResult) {
        // The caller may have given up on its guard timeout already.
        let _ = req.reply.try_send(result);
    }

    fn await_ack(&mut self, pair: AddressPair) -> AckWait {
        let deadline = Instant::now() + ACK_DEADLINE;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return AckWait::TimedOut;
            };
            match self.cmds.recv_timeout(remaining) {
                Ok(EngineCmd::AckObserved(seen))
                    if seen.dst == pair.src && seen.src == pair.dst =>
                {
                    return AckWait::Observed;
                }
                Ok(EngineCmd::AckObserved(seen)) => {
                    dev_warn!("Ignoring ack from unexpected pair {}", seen);
                }
                Ok(EngineCmd::AckFrame(p)) => {
                    // We hold the bus; answer once the transaction ends.
                    let _ = self.deferred.enqueue(p);
                }
                Ok(EngineCmd::Idle) => return AckWait::WentIdle,
                Ok(EngineCmd::Originate(other)) => {
                    // Cannot happen while the handle gate is held; fail it
                    // rather than wedge the caller.
                    dev_error!("Origination request while one is in flight");
                    let _ = other.reply.try_send(DeliveryResult::SendError);
                }
                Ok(EngineCmd::Shutdown) => {
                    self.stopping = true;
                    return AckWait::WentIdle;
                }
                Err(RecvTimeoutError::Timeout) => return AckWait::TimedOut,
                Err(RecvTimeoutError::Disconnected) => {
                    self.stopping = true;
                    return AckWait::WentIdle;
                }
            }
        }
    }
}
