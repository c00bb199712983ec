//! Receive packet buffers.
//!
//! A small ring of fixed-size buffers shared between the bit pump (the
//! writer, running in the line driver's context) and the consumer task.
//! Each slot carries an atomic state marker; ownership of a slot's bytes
//! follows the marker: the pump owns `WRITING` slots, the holder of the
//! [`PacketRef`] owns `QUEUED` slots, nobody touches `FREE` slots until the
//! pump claims one. The pump never blocks: when every slot is held by the
//! consumer, frames are dropped and counted instead.
//!
//! Each buffer reserves a few bytes ahead of the frame so the bridge can
//! rewrite a bus frame into a tunnel datagram in place.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::frame::BUS_MTU;

/// Buffers in the receive ring.
pub const PACKET_BUFFER_COUNT: usize = 3;

/// Reserved prefix ahead of the frame bytes, sized for the tunnel header
/// rewrite (8 tunnel-header bytes overlay workspace + frame addresses).
pub const BUFFER_WORKSPACE: usize = 4;

const SLOT_LEN: usize = BUS_MTU + BUFFER_WORKSPACE;

const SLOT_FREE: u8 = 0;
const SLOT_WRITING: u8 = 1;
const SLOT_QUEUED: u8 = 2;

struct Slot {
    state: AtomicU8,
    data: UnsafeCell<[u8; SLOT_LEN]>,
}

pub struct PacketRing {
    slots: [Slot; PACKET_BUFFER_COUNT],
}

// SAFETY: slot bytes are only ever accessed by the party the state marker
// designates; the marker transitions use acquire/release ordering.
unsafe impl Sync for PacketRing {}
unsafe impl Send for PacketRing {}

impl PacketRing {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: core::array::from_fn(|_| Slot {
                state: AtomicU8::new(SLOT_FREE),
                data: UnsafeCell::new([0u8; SLOT_LEN]),
            }),
        })
    }

    /// Claims a free slot for writing, scanning round-robin from `start`.
    pub(crate) fn acquire_from(&self, start: usize) -> Option<usize> {
        for i in 0..PACKET_BUFFER_COUNT {
            let idx = (start + i) % PACKET_BUFFER_COUNT;
            if self.slots[idx]
                .state
                .compare_exchange(SLOT_FREE, SLOT_WRITING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(idx);
            }
        }
        None
    }

    /// Stores one frame byte into a slot the pump is writing.
    pub(crate) fn store_frame_byte(&self, slot: usize, frame_off: usize, byte: u8) {
        debug_assert_eq!(self.slots[slot].state.load(Ordering::Relaxed), SLOT_WRITING);
        unsafe {
            // SAFETY: the pump is the only accessor of a WRITING slot, and
            // the caller bounds `frame_off` by BUS_MTU.
            (*self.slots[slot].data.get())[BUFFER_WORKSPACE + frame_off] = byte;
        }
    }

    /// Publishes a written slot, transferring ownership to the returned
    /// reference. `len` is the frame length with the CRC already stripped.
    pub(crate) fn publish(ring: &Arc<Self>, slot: usize, len: u16) -> PacketRef {
        ring.slots[slot].state.store(SLOT_QUEUED, Ordering::Release);
        PacketRef { ring: Arc::clone(ring), slot, len }
    }
}

/// Owning view of one queued packet buffer. The slot returns to the pool
/// when this is dropped.
pub struct PacketRef {
    ring: Arc<PacketRing>,
    slot: usize,
    len: u16,
}

// SAFETY: the referenced slot is in QUEUED state and this is its only
// handle; sending it to another thread moves that exclusive access.
unsafe impl Send for PacketRef {}

impl PacketRef {
    /// The received frame bytes (addresses onward, CRC stripped).
    pub fn frame(&self) -> &[u8] {
        unsafe {
            // SAFETY: a QUEUED slot is owned by this reference alone; the
            // pump only writes WRITING slots.
            &(&*self.ring.slots[self.slot].data.get())
                [BUFFER_WORKSPACE..BUFFER_WORKSPACE + self.len as usize]
        }
    }

    /// The frame bytes preceded by the workspace prefix, mutable, for
    /// in-place header rewrites.
    pub fn prefixed_mut(&mut self) -> &mut [u8] {
        unsafe {
            // SAFETY: exclusive access as above, further guarded by the
            // mutable borrow of self.
            &mut (&mut *self.ring.slots[self.slot].data.get())
                [..BUFFER_WORKSPACE + self.len as usize]
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PacketRef {
    fn drop(&mut self) {
        self.ring.slots[self.slot].state.store(SLOT_FREE, Ordering::Release);
    }
}
