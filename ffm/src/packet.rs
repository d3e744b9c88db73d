//! Packet-level wire layout: the fixed-size ring unit.
//!
//! Every packet is exactly `packet_size` bytes: a 14-byte header followed by
//! a slice of the frame byte stream and `fill_size` bytes of zero padding.

use crate::error::{FeedError, Result};

/// Sync word opening every packet.
pub const PACKET_SYNC: u16 = 0x666d;

/// On-disk packet header size: sync + fill_size + anchor_dts + frame_offset.
pub const PACKET_HEADER_SIZE: usize = 14;

/// High bit of frame_offset: this packet is a resync/bootstrap point.
pub const FLAG_RESYNC: u16 = 0x8000;

/// Low 15 bits of frame_offset: position of the first frame header.
pub const FRAME_OFFSET_MASK: u16 = 0x7fff;

/// Packet size used by `WriterOptions::default`.
pub const DEFAULT_PACKET_SIZE: u32 = 4096;

/// Decoded packet header.
///
/// `frame_offset` is measured from the start of the packet, header included,
/// so a frame header at the very start of the payload encodes as 14 and the
/// value 0 unambiguously means "no frame header begins in this packet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Number of zero padding bytes at the end of the packet.
    pub fill_size: u16,
    /// DTS of the frame whose header begins earliest in this packet.
    /// Continuation packets carry the previous frame's dts forward.
    pub anchor_dts: i64,
    /// Raw frame_offset field: resync flag plus 15-bit offset.
    pub frame_offset: u16,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[0..2].copy_from_slice(&PACKET_SYNC.to_be_bytes());
        buf[2..4].copy_from_slice(&self.fill_size.to_be_bytes());
        buf[4..12].copy_from_slice(&(self.anchor_dts as u64).to_be_bytes());
        buf[12..14].copy_from_slice(&self.frame_offset.to_be_bytes());
        buf
    }

    /// Decode a full packet header, validating the sync word. `offset` is the
    /// file position of the packet, for error context.
    pub fn decode(buf: &[u8; PACKET_HEADER_SIZE], offset: u64) -> Result<Self> {
        let sync = u16::from_be_bytes([buf[0], buf[1]]);
        if sync != PACKET_SYNC {
            return Err(FeedError::BadSync { offset, got: sync });
        }
        let mut body = [0u8; PACKET_HEADER_SIZE - 2];
        body.copy_from_slice(&buf[2..]);
        Ok(Self::decode_body(&body))
    }

    /// Decode the header fields after the sync word has been consumed and
    /// checked by the caller.
    pub fn decode_body(buf: &[u8; PACKET_HEADER_SIZE - 2]) -> Self {
        PacketHeader {
            fill_size: u16::from_be_bytes([buf[0], buf[1]]),
            anchor_dts: u64::from_be_bytes(buf[2..10].try_into().unwrap()) as i64,
            frame_offset: u16::from_be_bytes([buf[10], buf[11]]),
        }
    }

    /// Offset of the first frame header from packet start, if any.
    pub fn first_frame_offset(&self) -> Option<usize> {
        match (self.frame_offset & FRAME_OFFSET_MASK) as usize {
            0 => None,
            off => Some(off),
        }
    }

    pub fn is_resync_point(&self) -> bool {
        self.frame_offset & FLAG_RESYNC != 0
    }

    /// Check the header against the enclosing packet geometry. A fill_size
    /// larger than the packet body or a frame_offset outside the valid
    /// payload are fatal corruption, not recoverable desync.
    pub fn validate(&self, packet_size: u32, offset: u64) -> Result<()> {
        let body = packet_size as usize - PACKET_HEADER_SIZE;
        if self.fill_size as usize > body {
            return Err(FeedError::BadFillSize { offset, fill_size: self.fill_size });
        }
        if let Some(off) = self.first_frame_offset() {
            if off < PACKET_HEADER_SIZE || off > packet_size as usize - self.fill_size as usize {
                return Err(FeedError::BadFrameOffset { offset, frame_offset: self.frame_offset });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let hdr = PacketHeader { fill_size: 120, anchor_dts: 0x0102_0304_0506_0708, frame_offset: 14 };
        let buf = hdr.encode();
        assert_eq!(&buf[0..2], &[0x66, 0x6d]);
        assert_eq!(PacketHeader::decode(&buf, 0).unwrap(), hdr);
    }

    #[test]
    fn test_decode_rejects_bad_sync() {
        let mut buf = PacketHeader { fill_size: 0, anchor_dts: 0, frame_offset: 0 }.encode();
        buf[0] = 0x00;
        match PacketHeader::decode(&buf, 0x2000) {
            Err(FeedError::BadSync { offset: 0x2000, got: 0x006d }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_negative_anchor_dts_round_trips() {
        let hdr = PacketHeader { fill_size: 0, anchor_dts: -40, frame_offset: 0 };
        assert_eq!(PacketHeader::decode(&hdr.encode(), 0).unwrap().anchor_dts, -40);
    }

    #[test]
    fn test_resync_flag_and_offset() {
        let hdr = PacketHeader { fill_size: 0, anchor_dts: 0, frame_offset: FLAG_RESYNC | 22 };
        assert!(hdr.is_resync_point());
        assert_eq!(hdr.first_frame_offset(), Some(22));

        let hdr = PacketHeader { fill_size: 0, anchor_dts: 0, frame_offset: FLAG_RESYNC };
        assert!(hdr.is_resync_point());
        assert_eq!(hdr.first_frame_offset(), None);
    }

    #[test]
    fn test_validate_fill_size() {
        let hdr = PacketHeader { fill_size: 4083, anchor_dts: 0, frame_offset: 0 };
        assert!(matches!(
            hdr.validate(4096, 0),
            Err(FeedError::BadFillSize { fill_size: 4083, .. })
        ));
        let hdr = PacketHeader { fill_size: 4082, anchor_dts: 0, frame_offset: 0 };
        assert!(hdr.validate(4096, 0).is_ok());
    }

    #[test]
    fn test_validate_frame_offset() {
        // Inside the packet header
        let hdr = PacketHeader { fill_size: 0, anchor_dts: 0, frame_offset: 5 };
        assert!(matches!(hdr.validate(4096, 0), Err(FeedError::BadFrameOffset { .. })));

        // Pointing into the zero padding
        let hdr = PacketHeader { fill_size: 100, anchor_dts: 0, frame_offset: 4000 };
        assert!(matches!(hdr.validate(4096, 0), Err(FeedError::BadFrameOffset { .. })));

        let hdr = PacketHeader { fill_size: 100, anchor_dts: 0, frame_offset: 3996 };
        assert!(hdr.validate(4096, 0).is_ok());
    }
}
