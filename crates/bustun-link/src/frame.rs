//! Bus frame constants and addressing types.
//!
//! A frame travels the wire as `FLAG | payload | crc16 | FLAG` with zero-bit
//! stuffing applied to payload and CRC. The payload always begins with the
//! four-byte address tuple `{dst_stn, dst_net, src_stn, src_net}`; a scout
//! additionally carries a control byte and a service port, and a bare
//! acknowledge frame carries nothing beyond the addresses.

use core::fmt;

use crc::{CRC_16_IBM_SDLC, Crc, Table};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// HDLC flag octet delimiting every frame. Never bit-stuffed.
pub const FLAG: u8 = 0x7E;

/// Largest frame (addresses + body + CRC) the receiver will assemble.
pub const BUS_MTU: usize = 1536;

/// Consecutive one bits that mark the bus as quiescent.
pub const IDLE_THRESHOLD: u8 = 15;

/// Shortest valid wire frame: the four address bytes plus the CRC.
pub const MIN_FRAME_LEN: usize = 6;

/// A scout is exactly addresses + control + port.
pub const SCOUT_LEN: usize = 6;

/// A bare acknowledge frame: addresses only, once the CRC is stripped.
pub const ACK_BODY_LEN: usize = 4;

/// The X.25 frame check sequence the bus uses: polynomial 0x8408
/// (reflected), init 0xFFFF, transmitted inverted, LSB first.
pub static FRAME_CRC: Crc<u16, Table<1>> = Crc::<u16, Table<1>>::new(&CRC_16_IBM_SDLC);

/// What an incremental digest over a whole frame (payload plus received
/// CRC) finalizes to when the frame is intact.
pub const CRC_GOOD_RESIDUAL: u16 = CRC_16_IBM_SDLC.residue ^ CRC_16_IBM_SDLC.xorout;

/// A station identity on the bus. Network 0 means the local segment.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StationId {
    pub station: u8,
    pub net: u8,
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.net, self.station)
    }
}

/// The destination/source addressing of a frame, in wire order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AddressPair {
    pub dst: StationId,
    pub src: StationId,
}

impl AddressPair {
    /// Reads the pair from the first four bytes of a frame.
    pub fn from_frame(bytes: &[u8]) -> Self {
        Self {
            dst: StationId { station: bytes[0], net: bytes[1] },
            src: StationId { station: bytes[2], net: bytes[3] },
        }
    }

    /// The addressing the peer uses when it answers this pair.
    pub fn reversed(self) -> Self {
        Self { dst: self.src, src: self.dst }
    }
}

impl fmt::Display for AddressPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// The six-byte header a scout (and a control/data frame) starts with.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct FrameHdr {
    pub dst_stn: u8,
    pub dst_net: u8,
    pub src_stn: u8,
    pub src_net: u8,
    pub control: u8,
    pub port: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_matches_x25_vector() {
        // "123456789" is the catalogue check input for CRC-16/IBM-SDLC.
        assert_eq!(FRAME_CRC.checksum(b"123456789"), 0x906E);
    }

    #[test]
    fn test_residual_detects_intact_frame() {
        let payload = [0x01, 0x00, 0x65, 0x00, 0x80, 0x99];
        let crc = FRAME_CRC.checksum(&payload);
        let mut digest = FRAME_CRC.digest();
        digest.update(&payload);
        digest.update(&crc.to_le_bytes());
        assert_eq!(digest.finalize(), CRC_GOOD_RESIDUAL);
    }

    #[test]
    fn test_residual_rejects_corruption() {
        let payload = [0x01, 0x00, 0x65, 0x00, 0x80, 0x99];
        let crc = FRAME_CRC.checksum(&payload);
        let mut digest = FRAME_CRC.digest();
        digest.update(&payload);
        digest.update(&(crc ^ 0x0100).to_le_bytes());
        assert_ne!(digest.finalize(), CRC_GOOD_RESIDUAL);
    }

    #[test]
    fn test_address_pair_roundtrip() {
        let pair = AddressPair::from_frame(&[1, 0, 101, 0, 0x80, 0x99]);
        assert_eq!(pair.dst, StationId { station: 1, net: 0 });
        assert_eq!(pair.src, StationId { station: 101, net: 0 });
        let rev = pair.reversed();
        assert_eq!(rev.dst.station, 101);
        assert_eq!(rev.src.station, 1);
    }

    #[test]
    fn test_frame_hdr_layout() {
        let hdr = FrameHdr::read_from_bytes(&[1u8, 0, 101, 0, 0x80, 0x99][..]).unwrap();
        assert_eq!(hdr.dst_stn, 1);
        assert_eq!(hdr.src_stn, 101);
        assert_eq!(hdr.control, 0x80);
        assert_eq!(hdr.port, 0x99);
    }
}
