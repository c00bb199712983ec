//! Bridge counters, written lock-free by the pipeline tasks.

use core::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct BridgeStats {
    pub tx_count: AtomicU32,
    pub tx_retry_count: AtomicU32,
    pub tx_abort_count: AtomicU32,
    pub tx_error_count: AtomicU32,
    pub tx_unroutable_count: AtomicU32,
    pub tx_ack_count: AtomicU32,
    pub tx_nack_count: AtomicU32,
    pub rx_data_count: AtomicU32,
    pub rx_ack_count: AtomicU32,
    pub rx_nack_count: AtomicU32,
    pub rx_imm_count: AtomicU32,
    pub rx_unknown_count: AtomicU32,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeStatsSnapshot {
    pub tx_count: u32,
    pub tx_retry_count: u32,
    pub tx_abort_count: u32,
    pub tx_error_count: u32,
    pub tx_unroutable_count: u32,
    pub tx_ack_count: u32,
    pub tx_nack_count: u32,
    pub rx_data_count: u32,
    pub rx_ack_count: u32,
    pub rx_nack_count: u32,
    pub rx_imm_count: u32,
    pub rx_unknown_count: u32,
}

pub(crate) fn bump(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BridgeStats {
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            tx_count: self.tx_count.load(Ordering::Relaxed),
            tx_retry_count: self.tx_retry_count.load(Ordering::Relaxed),
            tx_abort_count: self.tx_abort_count.load(Ordering::Relaxed),
            tx_error_count: self.tx_error_count.load(Ordering::Relaxed),
            tx_unroutable_count: self.tx_unroutable_count.load(Ordering::Relaxed),
            tx_ack_count: self.tx_ack_count.load(Ordering::Relaxed),
            tx_nack_count: self.tx_nack_count.load(Ordering::Relaxed),
            rx_data_count: self.rx_data_count.load(Ordering::Relaxed),
            rx_ack_count: self.rx_ack_count.load(Ordering::Relaxed),
            rx_nack_count: self.rx_nack_count.load(Ordering::Relaxed),
            rx_imm_count: self.rx_imm_count.load(Ordering::Relaxed),
            rx_unknown_count: self.rx_unknown_count.load(Ordering::Relaxed),
        }
    }
}
