//! Feed producer: serializes frames into the fixed-size packet ring.
//!
//! Frames are appended to an in-memory packet body and flushed to disk one
//! full packet at a time. With a size cap the file becomes a ring: once the
//! cap is reached the writer wraps back to the first packet and starts
//! rewriting the header's write_index field in place so attached readers can
//! see where the valid window begins.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, trace};

use crate::error::{FeedError, Result};
use crate::frame::{self, FrameFlags, FrameHeader, MAX_FRAME_HEADER_SIZE};
use crate::header::{FeedHeader, StreamDescriptor, WRITE_INDEX_OFFSET};
use crate::packet::{FLAG_RESYNC, PACKET_HEADER_SIZE, PacketHeader, DEFAULT_PACKET_SIZE};

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub packet_size: u32,
    /// Cap on the file size in bytes; the feed becomes a ring once reached.
    /// None grows without bound.
    pub max_size: Option<u64>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions { packet_size: DEFAULT_PACKET_SIZE, max_size: None }
    }
}

pub struct FeedWriter {
    file: File,
    packet_size: u32,
    first_packet_offset: u64,
    max_size: Option<u64>,
    nb_streams: usize,

    /// File offset the next packet will be written at.
    write_index: u64,
    wrapped: bool,
    first_packet: bool,

    /// Body of the packet being assembled (up to packet_size - 14 bytes).
    packet: Vec<u8>,
    /// Raw frame_offset for the current packet; 0 until a frame header
    /// begins in it.
    frame_offset: u16,
    /// anchor_dts for the current packet.
    anchor_dts: i64,
    /// DTS of the most recently started frame, carried into continuation
    /// packets as their anchor.
    last_dts: i64,
}

impl FeedWriter {
    /// Create a feed file, write its header and position the ring at the
    /// first packet.
    pub fn create<P: AsRef<Path>>(
        path: P,
        streams: Vec<StreamDescriptor>,
        options: WriterOptions,
    ) -> Result<FeedWriter> {
        let bit_rate = streams.iter().fold(0u32, |acc, s| acc.saturating_add(s.bit_rate));
        let header = FeedHeader { packet_size: options.packet_size, write_index: 0, bit_rate, streams };
        let bytes = header.encode()?;
        let first_packet_offset = bytes.len() as u64;

        if let Some(max) = options.max_size {
            // The ring must hold the header plus at least one packet.
            if max < first_packet_offset + options.packet_size as u64 {
                return Err(FeedError::InvalidField { field: "max_size", value: max as i64 });
            }
        }

        let mut file = File::create(path)?;
        file.write_all(&bytes)?;

        let body = options.packet_size as usize - PACKET_HEADER_SIZE;
        Ok(FeedWriter {
            file,
            packet_size: options.packet_size,
            first_packet_offset,
            max_size: options.max_size,
            nb_streams: header.streams.len(),
            write_index: first_packet_offset,
            wrapped: false,
            first_packet: true,
            packet: Vec::with_capacity(body),
            frame_offset: 0,
            anchor_dts: 0,
            last_dts: 0,
        })
    }

    /// File offset the next packet will land at.
    pub fn write_index(&self) -> u64 {
        self.write_index
    }

    /// True once the ring has wrapped at least once.
    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    /// Append one frame to the feed. `dts` must not exceed `pts` and their
    /// difference must fit the 32-bit delta field.
    pub fn write_frame(
        &mut self,
        stream_index: u8,
        pts: i64,
        dts: i64,
        duration: u32,
        key_frame: bool,
        payload: &[u8],
    ) -> Result<()> {
        if stream_index as usize >= self.nb_streams {
            return Err(FeedError::BadStreamIndex(stream_index));
        }
        if payload.len() > frame::MAX_FRAME_SIZE as usize {
            return Err(FeedError::FrameTooLarge(payload.len()));
        }
        let delta = pts.checked_sub(dts).filter(|d| (0..=u32::MAX as i64).contains(d)).ok_or(
            FeedError::InvalidField { field: "dts", value: dts },
        )?;

        let mut flags = 0u8;
        if key_frame {
            flags |= frame::FLAG_KEY_FRAME;
        }
        if delta != 0 {
            flags |= frame::FLAG_DTS_DELTA;
        }
        let header = FrameHeader {
            stream_index,
            flags: FrameFlags(flags),
            size: payload.len() as u32,
            duration,
            pts,
            dts_delta: delta as u32,
        };
        let mut buf = [0u8; MAX_FRAME_HEADER_SIZE];
        let n = header.encode(&mut buf)?;

        self.append_bytes(&buf[..n], dts, true)?;
        self.append_bytes(payload, dts, false)
    }

    /// Flush any partially filled packet. A feed with no frames stays
    /// header-only.
    pub fn finish(mut self) -> Result<()> {
        if !self.packet.is_empty() {
            self.flush_packet()?;
        }
        self.file.flush()?;
        Ok(())
    }

    fn append_bytes(&mut self, mut buf: &[u8], dts: i64, frame_start: bool) -> Result<()> {
        let body = self.packet_size as usize - PACKET_HEADER_SIZE;
        let mut at_header = frame_start;
        while !buf.is_empty() {
            if self.packet.len() == body {
                self.flush_packet()?;
            }
            if at_header {
                if self.frame_offset == 0 {
                    self.frame_offset = (self.packet.len() + PACKET_HEADER_SIZE) as u16;
                    self.anchor_dts = dts;
                }
                self.last_dts = dts;
                at_header = false;
            }
            let n = (body - self.packet.len()).min(buf.len());
            self.packet.extend_from_slice(&buf[..n]);
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Write the assembled packet at write_index, zero-filled to size, then
    /// advance the index, wrapping at the size cap.
    fn flush_packet(&mut self) -> Result<()> {
        let body = self.packet_size as usize - PACKET_HEADER_SIZE;
        let fill_size = (body - self.packet.len()) as u16;
        let mut frame_offset = self.frame_offset;
        if self.first_packet {
            frame_offset |= FLAG_RESYNC;
        }
        let header =
            PacketHeader { fill_size, anchor_dts: self.anchor_dts, frame_offset };

        self.file.seek(SeekFrom::Start(self.write_index))?;
        self.file.write_all(&header.encode())?;
        self.file.write_all(&self.packet)?;
        if fill_size > 0 {
            self.file.write_all(&vec![0u8; fill_size as usize])?;
        }
        trace!(
            "packet at 0x{:X}: {} body bytes, fill {}, anchor dts {}",
            self.write_index,
            self.packet.len(),
            fill_size,
            self.anchor_dts
        );

        self.first_packet = false;
        self.packet.clear();
        self.frame_offset = 0;
        // A continuation packet's anchor is the dts of the frame it continues.
        self.anchor_dts = self.last_dts;

        self.write_index += self.packet_size as u64;
        if let Some(max) = self.max_size {
            if self.write_index + self.packet_size as u64 > max {
                if !self.wrapped {
                    debug!("ring wrapped at 0x{:X}", self.write_index);
                }
                self.write_index = self.first_packet_offset;
                self.wrapped = true;
            }
        }
        if self.wrapped {
            self.persist_write_index()?;
        }
        Ok(())
    }

    fn persist_write_index(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(WRITE_INDEX_OFFSET))?;
        self.file.write_all(&self.write_index.to_be_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::header::{AudioParams, Rational, VideoParams};

    fn test_streams() -> Vec<StreamDescriptor> {
        let mut v = StreamDescriptor::video(
            codec::H264.id,
            VideoParams {
                time_base: Rational { num: 1, den: 1000 },
                width: 640,
                height: 480,
                gop_size: 12,
                pixel_format: 0,
                qmin: 2,
                qmax: 31,
                max_qdiff: 3,
                qcompress: 5000,
                qblur: 0,
                bit_rate_tolerance: 0,
                rc_max_rate: 0,
                rc_min_rate: 0,
                rc_buffer_size: 0,
                codec_tag: 0,
            },
        );
        v.bit_rate = 1_000_000;
        let mut a = StreamDescriptor::audio(
            codec::AAC.id,
            AudioParams { sample_rate: 48_000, channels: 2, frame_size: 1024 },
        );
        a.bit_rate = 128_000;
        vec![v, a]
    }

    #[test]
    fn test_single_packet_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.ffm");

        let mut w =
            FeedWriter::create(&path, test_streams(), WriterOptions::default()).unwrap();
        w.write_frame(0, 0, 0, 40, true, &[0xAB; 100]).unwrap();
        w.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"FFM2");
        assert_eq!(u32::from_be_bytes(bytes[4..8].try_into().unwrap()), 4096);
        // Never wrapped: write_index stays zero.
        assert_eq!(u64::from_be_bytes(bytes[8..16].try_into().unwrap()), 0);
        assert_eq!(bytes.len(), 8192);

        // First packet at 4096: sync, fill, anchor dts, resync + offset 14.
        let p = &bytes[4096..];
        assert_eq!(&p[0..2], &[0x66, 0x6d]);
        let fill = u16::from_be_bytes([p[2], p[3]]);
        assert_eq!(fill as usize, 4096 - PACKET_HEADER_SIZE - 16 - 100);
        assert_eq!(u64::from_be_bytes(p[4..12].try_into().unwrap()), 0);
        let fo = u16::from_be_bytes([p[12], p[13]]);
        assert_eq!(fo, FLAG_RESYNC | 14);

        // Frame header right after the packet header.
        assert_eq!(p[14], 0); // stream index
        assert_eq!(p[15], frame::FLAG_KEY_FRAME);
        assert_eq!(&p[30..40], &[0xAB; 10][..]);
    }

    #[test]
    fn test_dts_delta_flagged_when_pts_differs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.ffm");

        let mut w =
            FeedWriter::create(&path, test_streams(), WriterOptions::default()).unwrap();
        w.write_frame(0, 120, 80, 40, false, &[1, 2, 3]).unwrap();
        w.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let p = &bytes[4096..];
        // Anchor carries the dts, not the pts.
        assert_eq!(u64::from_be_bytes(p[4..12].try_into().unwrap()), 80);
        assert_eq!(p[15], frame::FLAG_DTS_DELTA);
        // 20-byte header: delta in the trailing 4 bytes.
        assert_eq!(u32::from_be_bytes(p[30..34].try_into().unwrap()), 40);
    }

    #[test]
    fn test_ring_wraps_and_persists_write_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.ffm");

        // Header fits in one 256-byte packet; ring holds 3 packets.
        let streams = vec![test_streams().remove(0)];
        let options = WriterOptions { packet_size: 256, max_size: Some(256 + 3 * 256) };
        let mut w = FeedWriter::create(&path, streams, options).unwrap();
        assert_eq!(w.write_index(), 256);

        // Each frame fills exactly one packet body (16 + 226 = 242).
        for i in 0..5i64 {
            w.write_frame(0, i * 10, i * 10, 10, true, &vec![i as u8; 226]).unwrap();
        }
        assert!(w.wrapped());
        w.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 1024);
        // Five packets written into three slots: next write lands at 768.
        assert_eq!(u64::from_be_bytes(bytes[8..16].try_into().unwrap()), 768);

        // Slot at 256 now holds the fourth frame (dts 30), without the
        // resync flag the overwritten first packet carried.
        let p = &bytes[256..];
        assert_eq!(&p[0..2], &[0x66, 0x6d]);
        assert_eq!(u64::from_be_bytes(p[4..12].try_into().unwrap()), 30);
        assert_eq!(u16::from_be_bytes([p[12], p[13]]), 14);
    }

    #[test]
    fn test_invalid_frames_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.ffm");
        let mut w =
            FeedWriter::create(&path, test_streams(), WriterOptions::default()).unwrap();

        assert!(matches!(
            w.write_frame(9, 0, 0, 0, false, &[]),
            Err(FeedError::BadStreamIndex(9))
        ));
        // dts after pts is not representable.
        assert!(matches!(
            w.write_frame(0, 100, 200, 0, false, &[]),
            Err(FeedError::InvalidField { field: "dts", .. })
        ));
    }

    #[test]
    fn test_max_size_must_fit_one_packet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.ffm");
        let options = WriterOptions { packet_size: 4096, max_size: Some(4096) };
        assert!(matches!(
            FeedWriter::create(&path, test_streams(), options),
            Err(FeedError::InvalidField { field: "max_size", .. })
        ));
    }
}
