//! Delivery filter: which destination stations and networks the receiver
//! answers for.
//!
//! The bit pump tests the filter from the line driver's context on every
//! completed frame while the control thread repopulates it during
//! reconfiguration, so the bitmaps are plain atomic words read and written
//! relaxed. Torn views across a reconfiguration are acceptable; the bridge
//! quiesces its pipelines before it mutates peers.

use core::sync::atomic::{AtomicU32, Ordering};

struct Bitmap256 {
    words: [AtomicU32; 8],
}

impl Bitmap256 {
    const fn new() -> Self {
        Self { words: [const { AtomicU32::new(0) }; 8] }
    }

    fn set(&self, bit: u8) {
        let word = (bit >> 5) as usize;
        let offset = bit & 31;
        self.words[word].fetch_or(1 << offset, Ordering::Relaxed);
    }

    fn test(&self, bit: u8) -> bool {
        let word = (bit >> 5) as usize;
        let offset = bit & 31;
        (self.words[word].load(Ordering::Relaxed) >> offset) & 1 != 0
    }

    fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }
}

pub struct AddrFilter {
    stations: Bitmap256,
    networks: Bitmap256,
}

impl AddrFilter {
    pub const fn new() -> Self {
        Self {
            stations: Bitmap256::new(),
            networks: Bitmap256::new(),
        }
    }

    pub fn enable_station(&self, station_id: u8) {
        self.stations.set(station_id);
    }

    pub fn enable_network(&self, network_id: u8) {
        self.networks.set(network_id);
    }

    pub fn clear(&self) {
        self.stations.clear();
        self.networks.clear();
    }

    /// A frame is for us iff it targets an enabled station on the local
    /// network, or an enabled network.
    pub fn accepts(&self, dst_stn: u8, dst_net: u8) -> bool {
        (self.stations.test(dst_stn) && dst_net == 0) || self.networks.test(dst_net)
    }
}

impl Default for AddrFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::AddrFilter;

    #[test]
    fn test_station_requires_local_net() {
        let f = AddrFilter::new();
        f.enable_station(101);
        assert!(f.accepts(101, 0));
        assert!(!f.accepts(101, 3));
        assert!(!f.accepts(100, 0));
    }

    #[test]
    fn test_network_match_ignores_station() {
        let f = AddrFilter::new();
        f.enable_network(7);
        assert!(f.accepts(1, 7));
        assert!(f.accepts(254, 7));
        assert!(!f.accepts(1, 8));
    }

    #[test]
    fn test_clear_removes_everything() {
        let f = AddrFilter::new();
        f.enable_station(1);
        f.enable_network(2);
        f.clear();
        assert!(!f.accepts(1, 0));
        assert!(!f.accepts(0, 2));
    }

    #[test]
    fn test_word_boundaries() {
        let f = AddrFilter::new();
        for id in [0u8, 31, 32, 63, 64, 255] {
            f.enable_station(id);
        }
        for id in [0u8, 31, 32, 63, 64, 255] {
            assert!(f.accepts(id, 0), "station {} should be enabled", id);
        }
        assert!(!f.accepts(65, 0));
    }
}
