//! State shared between the bit pump, the frame emitter's driver and the
//! bus engine: whether our transmitter is driving the bus, and how many
//! consecutive one bits the receiver has seen.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::frame::IDLE_THRESHOLD;

#[derive(Default)]
pub struct LineShared {
    tx_in_progress: AtomicBool,
    idle_ones: AtomicU8,
}

impl LineShared {
    pub const fn new() -> Self {
        Self {
            tx_in_progress: AtomicBool::new(false),
            idle_ones: AtomicU8::new(0),
        }
    }

    pub fn set_tx_in_progress(&self, active: bool) {
        self.tx_in_progress.store(active, Ordering::Relaxed);
    }

    pub fn tx_in_progress(&self) -> bool {
        self.tx_in_progress.load(Ordering::Relaxed)
    }

    pub(crate) fn idle_ones(&self) -> u8 {
        self.idle_ones.load(Ordering::Relaxed)
    }

    pub(crate) fn set_idle_ones(&self, count: u8) {
        self.idle_ones.store(count, Ordering::Relaxed);
    }

    /// Whether idle has been observed and not yet broken by activity.
    pub fn bus_idle(&self) -> bool {
        self.idle_ones() >= IDLE_THRESHOLD
    }
}
