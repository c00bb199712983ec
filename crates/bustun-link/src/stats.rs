//! Link-layer counters. Written lock-free from the pump and the engine,
//! read racily by whoever snapshots them.

use core::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct LinkStats {
    pub rx_frame_count: AtomicU32,
    pub rx_crc_fail_count: AtomicU32,
    pub rx_short_frame_count: AtomicU32,
    pub rx_abort_count: AtomicU32,
    pub rx_oversize_count: AtomicU32,
    pub rx_ack_count: AtomicU32,
    pub rx_filtered_count: AtomicU32,
    pub rx_error_count: AtomicU32,
    pub tx_frame_count: AtomicU32,
    pub tx_ack_count: AtomicU32,
    pub tx_nack_count: AtomicU32,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStatsSnapshot {
    pub rx_frame_count: u32,
    pub rx_crc_fail_count: u32,
    pub rx_short_frame_count: u32,
    pub rx_abort_count: u32,
    pub rx_oversize_count: u32,
    pub rx_ack_count: u32,
    pub rx_filtered_count: u32,
    pub rx_error_count: u32,
    pub tx_frame_count: u32,
    pub tx_ack_count: u32,
    pub tx_nack_count: u32,
}

pub(crate) fn bump(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl LinkStats {
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            rx_frame_count: self.rx_frame_count.load(Ordering::Relaxed),
            rx_crc_fail_count: self.rx_crc_fail_count.load(Ordering::Relaxed),
            rx_short_frame_count: self.rx_short_frame_count.load(Ordering::Relaxed),
            rx_abort_count: self.rx_abort_count.load(Ordering::Relaxed),
            rx_oversize_count: self.rx_oversize_count.load(Ordering::Relaxed),
            rx_ack_count: self.rx_ack_count.load(Ordering::Relaxed),
            rx_filtered_count: self.rx_filtered_count.load(Ordering::Relaxed),
            rx_error_count: self.rx_error_count.load(Ordering::Relaxed),
            tx_frame_count: self.tx_frame_count.load(Ordering::Relaxed),
            tx_ack_count: self.tx_ack_count.load(Ordering::Relaxed),
            tx_nack_count: self.tx_nack_count.load(Ordering::Relaxed),
        }
    }
}
