//! Tunnel datagram format: an eight-byte header, optionally followed by
//! the raw frame body. Sequence numbers are little-endian on the wire.

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const TUNNEL_HDR_LEN: usize = 8;

/// A reachability-probe reply is the header plus four bytes of probe data.
pub const IMM_REPLY_LEN: usize = 12;

/// Datagram types.
pub mod kind {
    /// Immediate operation.
    pub const IMM: u8 = 1;
    pub const DATA: u8 = 2;
    pub const ACK: u8 = 3;
    pub const NACK: u8 = 4;
    pub const IMM_REPLY: u8 = 5;
}

/// Control byte of the immediate operation used as a reachability probe.
pub const MACHINE_PROBE_CONTROL: u8 = 0x08;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct TunnelHdr {
    pub kind: u8,
    pub port: u8,
    pub control: u8,
    pub zero: u8,
    pub seq: U32,
}

impl TunnelHdr {
    pub fn new(kind: u8, port: u8, control: u8, seq: u32) -> Self {
        Self { kind, port, control, zero: 0, seq: U32::new(seq) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_eight_bytes() {
        assert_eq!(core::mem::size_of::<TunnelHdr>(), TUNNEL_HDR_LEN);
    }

    #[test]
    fn test_parse_little_endian_seq() {
        let bytes = [0x02u8, 0x99, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0xAA];
        let (hdr, body) = TunnelHdr::ref_from_prefix(&bytes).unwrap();
        assert_eq!(hdr.kind, kind::DATA);
        assert_eq!(hdr.port, 0x99);
        assert_eq!(hdr.control, 0x80);
        assert_eq!(hdr.seq.get(), 0x10);
        assert_eq!(body, &[0xAA]);
    }

    #[test]
    fn test_build_ack_reply() {
        let hdr = TunnelHdr::new(kind::ACK, 0x99, 0x80, 0x10);
        assert_eq!(hdr.as_bytes(), &[0x03, 0x99, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00]);
    }
}
