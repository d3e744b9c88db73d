//! Frame-level wire layout and the decoded frame type.
//!
//! A frame is one stream's logical unit (one encoded picture, one audio
//! chunk). Its header and payload are written into the packet byte stream
//! back to back and may span any number of packet boundaries.

use crate::error::{FeedError, Result};

/// Flag bit: the frame is a key frame.
pub const FLAG_KEY_FRAME: u8 = 0x01;
/// Flag bit: a 32-bit pts-dts delta follows the fixed header.
pub const FLAG_DTS_DELTA: u8 = 0x02;

/// Fixed frame header size; four more bytes when FLAG_DTS_DELTA is set.
pub const FRAME_HEADER_SIZE: usize = 16;
pub const MAX_FRAME_HEADER_SIZE: usize = FRAME_HEADER_SIZE + 4;

/// Largest encodable payload size or duration (24-bit wire fields).
pub const MAX_FRAME_SIZE: u32 = 0xFF_FFFF;

/// Decoded per-frame flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub fn key_frame(self) -> bool {
        self.0 & FLAG_KEY_FRAME != 0
    }

    pub fn has_dts_delta(self) -> bool {
        self.0 & FLAG_DTS_DELTA != 0
    }
}

/// Decoded frame header (wire: 16 bytes, 20 with the dts delta).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_index: u8,
    pub flags: FrameFlags,
    /// Payload size in bytes (24-bit).
    pub size: u32,
    /// Frame duration in stream time base units (24-bit).
    pub duration: u32,
    pub pts: i64,
    /// pts - dts; meaningful only when FLAG_DTS_DELTA is set.
    pub dts_delta: u32,
}

impl FrameHeader {
    /// Decode the fixed 16-byte prefix. The dts delta, if flagged, is
    /// decoded separately once its bytes are available.
    pub fn decode_fixed(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        FrameHeader {
            stream_index: buf[0],
            flags: FrameFlags(buf[1]),
            size: read_u24(&buf[2..5]),
            duration: read_u24(&buf[5..8]),
            pts: u64::from_be_bytes(buf[8..16].try_into().unwrap()) as i64,
            dts_delta: 0,
        }
    }

    pub fn set_dts_delta(&mut self, buf: &[u8; 4]) {
        self.dts_delta = u32::from_be_bytes(*buf);
    }

    pub fn dts(&self) -> i64 {
        self.pts - self.dts_delta as i64
    }

    /// Encode into `buf`, returning the number of bytes used (16 or 20).
    /// Size and duration must fit their 24-bit fields.
    pub fn encode(&self, buf: &mut [u8; MAX_FRAME_HEADER_SIZE]) -> Result<usize> {
        buf[0] = self.stream_index;
        buf[1] = self.flags.0;
        write_u24(&mut buf[2..5], self.size)
            .ok_or(FeedError::FrameTooLarge(self.size as usize))?;
        write_u24(&mut buf[5..8], self.duration)
            .ok_or(FeedError::InvalidField { field: "duration", value: self.duration as i64 })?;
        buf[8..16].copy_from_slice(&(self.pts as u64).to_be_bytes());
        if self.flags.has_dts_delta() {
            buf[16..20].copy_from_slice(&self.dts_delta.to_be_bytes());
            Ok(MAX_FRAME_HEADER_SIZE)
        } else {
            Ok(FRAME_HEADER_SIZE)
        }
    }
}

/// A fully reassembled frame delivered by the demuxer.
#[derive(Debug, Clone, serde::Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct Frame {
    pub stream_index: u8,
    pub flags: FrameFlags,
    pub pts: i64,
    pub dts: i64,
    pub duration: u32,
    /// Opaque codec payload, delivered verbatim.
    #[serde(skip_serializing)]
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn key_frame(&self) -> bool {
        self.flags.key_frame()
    }
}

fn read_u24(buf: &[u8]) -> u32 {
    ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32
}

fn write_u24(buf: &mut [u8], v: u32) -> Option<()> {
    if v > MAX_FRAME_SIZE {
        return None;
    }
    buf[0] = (v >> 16) as u8;
    buf[1] = (v >> 8) as u8;
    buf[2] = v as u8;
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let f = FrameFlags(FLAG_KEY_FRAME);
        assert!(f.key_frame());
        assert!(!f.has_dts_delta());

        let f = FrameFlags(FLAG_KEY_FRAME | FLAG_DTS_DELTA);
        assert!(f.key_frame());
        assert!(f.has_dts_delta());
    }

    #[test]
    fn test_encode_decode_without_delta() {
        let hdr = FrameHeader {
            stream_index: 1,
            flags: FrameFlags(FLAG_KEY_FRAME),
            size: 1500,
            duration: 40,
            pts: 120,
            dts_delta: 0,
        };
        let mut buf = [0u8; MAX_FRAME_HEADER_SIZE];
        assert_eq!(hdr.encode(&mut buf).unwrap(), FRAME_HEADER_SIZE);

        let decoded = FrameHeader::decode_fixed(buf[..FRAME_HEADER_SIZE].try_into().unwrap());
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.dts(), 120);
    }

    #[test]
    fn test_encode_decode_with_delta() {
        let hdr = FrameHeader {
            stream_index: 0,
            flags: FrameFlags(FLAG_DTS_DELTA),
            size: 0x12_3456,
            duration: 33,
            pts: 1000,
            dts_delta: 80,
        };
        let mut buf = [0u8; MAX_FRAME_HEADER_SIZE];
        assert_eq!(hdr.encode(&mut buf).unwrap(), MAX_FRAME_HEADER_SIZE);

        let mut decoded = FrameHeader::decode_fixed(buf[..FRAME_HEADER_SIZE].try_into().unwrap());
        assert!(decoded.flags.has_dts_delta());
        decoded.set_dts_delta(buf[16..20].try_into().unwrap());
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.dts(), 920);
    }

    #[test]
    fn test_negative_pts_round_trips() {
        let hdr = FrameHeader {
            stream_index: 0,
            flags: FrameFlags(0),
            size: 1,
            duration: 0,
            pts: -40,
            dts_delta: 0,
        };
        let mut buf = [0u8; MAX_FRAME_HEADER_SIZE];
        hdr.encode(&mut buf).unwrap();
        let decoded = FrameHeader::decode_fixed(buf[..FRAME_HEADER_SIZE].try_into().unwrap());
        assert_eq!(decoded.pts, -40);
    }

    #[test]
    fn test_oversized_fields_rejected() {
        let mut buf = [0u8; MAX_FRAME_HEADER_SIZE];
        let hdr = FrameHeader {
            stream_index: 0,
            flags: FrameFlags(0),
            size: MAX_FRAME_SIZE + 1,
            duration: 0,
            pts: 0,
            dts_delta: 0,
        };
        assert!(matches!(hdr.encode(&mut buf), Err(FeedError::FrameTooLarge(_))));

        let hdr = FrameHeader { size: 1, duration: MAX_FRAME_SIZE + 1, ..hdr };
        assert!(matches!(hdr.encode(&mut buf), Err(FeedError::InvalidField { .. })));
    }

    #[test]
    fn test_frame_json_omits_payload() {
        let frame = Frame {
            stream_index: 1,
            flags: FrameFlags(FLAG_KEY_FRAME),
            pts: 120,
            dts: 80,
            duration: 40,
            payload: vec![0xAB; 1500],
        };
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["pts"], 120);
        assert_eq!(v["dts"], 80);
        assert_eq!(v["flags"], 1);
        assert!(v.get("payload").is_none());
    }

    #[test]
    fn test_u24_boundaries() {
        let mut buf = [0u8; 3];
        write_u24(&mut buf, MAX_FRAME_SIZE).unwrap();
        assert_eq!(buf, [0xFF, 0xFF, 0xFF]);
        assert_eq!(read_u24(&buf), MAX_FRAME_SIZE);
        assert!(write_u24(&mut buf, MAX_FRAME_SIZE + 1).is_none());
    }
}
