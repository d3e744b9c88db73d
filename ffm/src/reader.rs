//! Feed consumer: packet fetch, frame reassembly and live-mode availability.
//!
//! The reader walks the packet ring from its oldest valid packet, splicing
//! packet bodies back into the continuous frame byte stream. Frames are
//! reassembled across packet boundaries; a bad sync word triggers a
//! byte-level rescan rather than a hard failure. In attached mode the reader
//! tracks a live producer through the file's growing size and its in-place
//! write_index updates, reporting `WouldBlock` instead of end-of-feed when it
//! catches up.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;
use log::{debug, warn};

use crate::error::{FeedError, Result};
use crate::frame::{Frame, FrameHeader, FRAME_HEADER_SIZE, MAX_FRAME_HEADER_SIZE};
use crate::header::{FeedHeader, StreamDescriptor, WRITE_INDEX_OFFSET};
use crate::packet::{PacketHeader, PACKET_HEADER_SIZE, PACKET_SYNC};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    /// Follow a live producer: poll the write frontier and report
    /// `WouldBlock` instead of end-of-feed when caught up.
    pub attached: bool,
    /// Reject unknown header tags instead of skipping them.
    pub strict: bool,
}

/// Input source: a plain file, or a gzip-compressed feed decompressed into
/// memory up front (gzip streams are not seekable).
enum FeedInput {
    File(BufReader<File>),
    Memory(Cursor<Vec<u8>>),
}

impl FeedInput {
    fn len(&self) -> Result<u64> {
        match self {
            FeedInput::File(r) => Ok(r.get_ref().metadata()?.len()),
            FeedInput::Memory(c) => Ok(c.get_ref().len() as u64),
        }
    }

    fn is_file(&self) -> bool {
        matches!(self, FeedInput::File(_))
    }
}

impl Read for FeedInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            FeedInput::File(r) => r.read(buf),
            FeedInput::Memory(c) => c.read(buf),
        }
    }
}

impl Seek for FeedInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            FeedInput::File(r) => r.seek(pos),
            FeedInput::Memory(c) => c.seek(pos),
        }
    }
}

fn open_input<P: AsRef<Path>>(path: P) -> Result<FeedInput> {
    let path = path.as_ref();
    let file = File::open(path)?;
    if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("gz")) {
        let mut bytes = Vec::new();
        GzDecoder::new(file).read_to_end(&mut bytes)?;
        Ok(FeedInput::Memory(Cursor::new(bytes)))
    } else {
        Ok(FeedInput::File(BufReader::new(file)))
    }
}

/// Frame reassembly state, persisted across `WouldBlock` returns so a live
/// reader resumes exactly where it left off.
#[derive(Clone, Copy)]
enum ReadState {
    Header,
    /// Fixed header decoded; its 4-byte dts delta is still owed.
    DtsDelta(FrameHeader),
    Data(FrameHeader),
}

enum Avail {
    Ready,
    Eof,
}

pub struct FeedReader {
    input: FeedInput,
    header: FeedHeader,
    pub(crate) attached: bool,

    pub(crate) packet_size: u32,
    pub(crate) first_packet_offset: u64,
    /// Logical end of the packet area: first packet offset plus a whole
    /// number of packets. Wrap positions are computed against this.
    pub(crate) file_size: u64,
    /// Real file length. After a resync the cursor is no longer
    /// packet-aligned, so static availability is measured against this.
    raw_size: u64,
    /// Producer frontier; 0 until the ring first wraps.
    pub(crate) write_index: u64,

    /// File offset of the next byte to fetch.
    pos: u64,
    /// Body of the current packet, fill stripped.
    packet: Vec<u8>,
    packet_pos: usize,
    state: ReadState,
    /// Frame-offset realignment is still pending.
    first_frame: bool,
    /// Cursor was just placed exactly at write_index; the whole ring is
    /// still ahead of us, not behind.
    fresh: bool,
}

impl FeedReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FeedReader> {
        Self::open_with(path, ReaderOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: ReaderOptions) -> Result<FeedReader> {
        let mut input = open_input(path)?;
        if options.attached && !input.is_file() {
            return Err(FeedError::LiveGzip);
        }

        let (header, first_packet_offset) = FeedHeader::parse(&mut input, options.strict)?;
        let packet_size = header.packet_size;
        let raw_size = input.len()?;
        let file_size = logical_size(raw_size, first_packet_offset, packet_size);
        debug!(
            "opened feed: {} streams, packet size {}, {} packet bytes",
            header.streams.len(),
            packet_size,
            file_size - first_packet_offset
        );

        let write_index = header.write_index;
        let mut reader = FeedReader {
            input,
            header,
            attached: options.attached,
            packet_size,
            first_packet_offset,
            file_size,
            raw_size,
            write_index,
            pos: 0,
            packet: Vec::new(),
            packet_pos: 0,
            state: ReadState::Header,
            first_frame: true,
            fresh: true,
        };
        reader.reset_cursor();
        Ok(reader)
    }

    pub fn header(&self) -> &FeedHeader {
        &self.header
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.header.streams
    }

    /// Read the next frame in ring order.
    ///
    /// Returns `Ok(None)` at the end of a static feed. In attached mode the
    /// end of written data is `Err(WouldBlock)`; retry after a backoff.
    pub fn read_next_frame(&mut self) -> Result<Option<Frame>> {
        if self.attached {
            self.refresh_frontier()?;
        }
        loop {
            match self.state {
                ReadState::Header => {
                    match self.available(FRAME_HEADER_SIZE)? {
                        Avail::Ready => {}
                        Avail::Eof => return Ok(None),
                    }
                    let mut buf = [0u8; FRAME_HEADER_SIZE];
                    self.read_raw(&mut buf, true)?;
                    let fh = FrameHeader::decode_fixed(&buf);
                    if fh.stream_index as usize >= self.header.streams.len() {
                        return Err(FeedError::BadStreamIndex(fh.stream_index));
                    }
                    self.state = if fh.flags.has_dts_delta() {
                        ReadState::DtsDelta(fh)
                    } else {
                        ReadState::Data(fh)
                    };
                }
                ReadState::DtsDelta(mut fh) => {
                    match self.available(MAX_FRAME_HEADER_SIZE - FRAME_HEADER_SIZE)? {
                        Avail::Ready => {}
                        Avail::Eof => return Err(FeedError::TruncatedFrame(self.pos)),
                    }
                    let mut delta = [0u8; 4];
                    self.read_raw(&mut delta, true)?;
                    fh.set_dts_delta(&delta);
                    self.state = ReadState::Data(fh);
                }
                ReadState::Data(fh) => {
                    match self.available(fh.size as usize)? {
                        Avail::Ready => {}
                        Avail::Eof => return Err(FeedError::TruncatedFrame(self.pos)),
                    }
                    let mut payload = vec![0u8; fh.size as usize];
                    if let Err(e) = self.read_raw(&mut payload, false) {
                        // The cursor already sits at the next alignment
                        // point; leave the state machine ready to use it.
                        self.state = ReadState::Header;
                        return Err(e);
                    }
                    self.state = ReadState::Header;
                    return Ok(Some(Frame {
                        stream_index: fh.stream_index,
                        flags: fh.flags,
                        pts: fh.pts,
                        dts: fh.dts(),
                        duration: fh.duration,
                        payload,
                    }));
                }
            }
        }
    }

    /// Move the cursor back to the oldest readable packet, as on open.
    pub(crate) fn reset_cursor(&mut self) {
        let start = if self.write_index != 0 {
            self.write_index
        } else {
            self.first_packet_offset
        };
        self.set_cursor(start);
        self.fresh = true;
    }

    /// Place the cursor at a packet boundary and restart frame alignment
    /// from that packet's frame_offset.
    pub(crate) fn set_cursor(&mut self, pos: u64) {
        self.pos = pos;
        self.packet.clear();
        self.packet_pos = 0;
        self.state = ReadState::Header;
        self.first_frame = true;
        self.fresh = pos == self.write_index;
    }

    /// Anchor dts of the packet at `offset`, for timestamp search.
    pub(crate) fn packet_dts_at(&mut self, offset: u64) -> Result<i64> {
        self.input.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        self.input.read_exact(&mut buf)?;
        Ok(PacketHeader::decode(&buf, offset)?.anchor_dts)
    }

    /// Copy the next `out.len()` bytes of the frame byte stream, crossing
    /// packet boundaries as needed. Callers gate on `available` first.
    ///
    /// A resync-point packet reached mid-payload (`header_read` false)
    /// aborts the interrupted frame; the cursor is left on the packet's
    /// first frame header.
    fn read_raw(&mut self, mut out: &mut [u8], header_read: bool) -> Result<()> {
        while !out.is_empty() {
            let len = self.packet.len() - self.packet_pos;
            if len == 0 {
                let realigned = self.fetch_packet()?;
                if realigned && !header_read {
                    return Err(FeedError::TruncatedFrame(self.pos));
                }
                continue;
            }
            let n = len.min(out.len());
            out[..n].copy_from_slice(&self.packet[self.packet_pos..self.packet_pos + n]);
            self.packet_pos += n;
            out = &mut out[n..];
        }
        Ok(())
    }

    /// Load the packet at the cursor, resyncing on a bad sync word and
    /// realigning to the first frame header when alignment is pending or the
    /// packet carries the resync flag. Returns whether realignment happened.
    fn fetch_packet(&mut self) -> Result<bool> {
        loop {
            if self.pos >= self.file_size {
                if self.write_index == 0 {
                    // A feed that never wrapped has nothing before its
                    // first packet; running off the end is corruption.
                    return Err(FeedError::TruncatedFrame(self.pos));
                }
                self.pos = self.first_packet_offset;
            }
            let packet_offset = self.pos;
            self.input.seek(SeekFrom::Start(self.pos))?;

            let mut sync = [0u8; 2];
            self.input.read_exact(&mut sync)?;
            self.pos += 2;
            let sync = u16::from_be_bytes(sync);
            if sync != PACKET_SYNC {
                self.resync(sync)?;
            }
            let header_offset = self.pos - 2;

            let mut rest = [0u8; PACKET_HEADER_SIZE - 2];
            self.input.read_exact(&mut rest)?;
            self.pos += rest.len() as u64;
            let hdr = PacketHeader::decode_body(&rest);
            hdr.validate(self.packet_size, header_offset)?;

            let body_len = self.packet_size as usize - PACKET_HEADER_SIZE;
            let mut body = vec![0u8; body_len];
            self.input.read_exact(&mut body)?;
            self.pos += body_len as u64;
            body.truncate(body_len - hdr.fill_size as usize);
            self.packet = body;
            self.packet_pos = 0;
            self.fresh = false;

            if self.first_frame || hdr.is_resync_point() {
                match hdr.first_frame_offset() {
                    Some(off) => {
                        self.first_frame = false;
                        self.packet_pos = off - PACKET_HEADER_SIZE;
                        return Ok(true);
                    }
                    None => {
                        // No frame header begins here; the frame being
                        // continued must have started in an earlier packet.
                        self.first_frame = true;
                        let target = packet_offset
                            .saturating_sub(2 * self.packet_size as u64)
                            .max(self.first_packet_offset);
                        if target == packet_offset {
                            return Err(FeedError::NoAlignment(packet_offset));
                        }
                        debug!(
                            "no frame header at 0x{packet_offset:X}, backing up to 0x{target:X}"
                        );
                        self.pos = target;
                        continue;
                    }
                }
            }
            return Ok(false);
        }
    }

    /// Scan forward one byte at a time until a sync word is found. The two
    /// bytes already read seed the window.
    fn resync(&mut self, got: u16) -> Result<()> {
        let start = self.pos - 2;
        warn!("bad packet sync 0x{got:04X} at 0x{start:X}, scanning");
        let mut window = got;
        let mut byte = [0u8; 1];
        loop {
            if self.pos >= self.raw_size {
                return Err(FeedError::SyncLost(start));
            }
            self.input.read_exact(&mut byte)?;
            self.pos += 1;
            window = (window << 8) | byte[0] as u16;
            if window == PACKET_SYNC {
                return Ok(());
            }
        }
    }

    /// Decide whether `need` more frame-stream bytes can be read without
    /// running past the write frontier. Conservative: beyond the current
    /// packet it counts whole packets only.
    fn available(&mut self, need: usize) -> Result<Avail> {
        let len = self.packet.len() - self.packet_pos;
        if need <= len {
            return Ok(Avail::Ready);
        }
        let ahead = if self.write_index == 0 {
            // A resync can leave the cursor off the packet grid, so count
            // against the real file length, not the rounded one.
            if self.pos >= self.raw_size {
                return self.starved();
            }
            self.raw_size - self.pos
        } else if self.pos == self.write_index && !self.fresh {
            return self.starved();
        } else if self.pos < self.write_index {
            self.write_index - self.pos
        } else {
            // Between the frontier and the end of the file: the window
            // continues from the first packet up to the frontier.
            (self.file_size - self.pos) + (self.write_index - self.first_packet_offset)
        };
        let ps = self.packet_size as u64;
        let usable = ahead / ps * (ps - PACKET_HEADER_SIZE as u64) + len as u64;
        if need as u64 <= usable {
            Ok(Avail::Ready)
        } else {
            self.starved()
        }
    }

    fn starved(&self) -> Result<Avail> {
        if self.attached {
            Err(FeedError::WouldBlock)
        } else {
            Ok(Avail::Eof)
        }
    }

    /// Re-read the producer's frontier (file size and write_index) and fail
    /// if the ring has been rewritten past our position.
    pub(crate) fn refresh_frontier(&mut self) -> Result<()> {
        let raw = self.input.len()?;
        let size = logical_size(raw, self.first_packet_offset, self.packet_size);
        self.input.seek(SeekFrom::Start(WRITE_INDEX_OFFSET))?;
        let mut buf = [0u8; 8];
        self.input.read_exact(&mut buf)?;
        let new_wi = u64::from_be_bytes(buf);

        if new_wi != 0 {
            let prev = if self.write_index == 0 {
                self.first_packet_offset
            } else {
                self.write_index
            };
            if ring_swept(prev, new_wi, self.pos, self.first_packet_offset, size) {
                return Err(FeedError::RingOverrun { pos: self.pos, write_index: new_wi });
            }
        }
        self.file_size = size;
        self.raw_size = raw;
        self.write_index = new_wi;
        Ok(())
    }
}

/// Round the raw file length down to a whole number of packets.
fn logical_size(len: u64, first_packet_offset: u64, packet_size: u32) -> u64 {
    let ps = packet_size as u64;
    first_packet_offset + len.saturating_sub(first_packet_offset) / ps * ps
}

/// True if a producer advancing its frontier from `prev` to `new` rewrote
/// the packet a reader at `pos` has yet to read. All offsets lie in the ring
/// area `[fpo, end)`.
fn ring_swept(prev: u64, new: u64, pos: u64, fpo: u64, end: u64) -> bool {
    let span = end.saturating_sub(fpo);
    if span == 0 {
        return false;
    }
    // Ring-order distances from the previous frontier.
    let lead = (pos + span - prev) % span;
    let written = (new + span - prev) % span;
    lead != 0 && written > lead
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_size_rounds_down() {
        assert_eq!(logical_size(4096 + 3 * 4096, 4096, 4096), 4 * 4096);
        assert_eq!(logical_size(4096 + 3 * 4096 + 37, 4096, 4096), 4 * 4096);
        assert_eq!(logical_size(100, 4096, 4096), 4096);
    }

    #[test]
    fn test_ring_swept() {
        // Ring of four 256-byte packets at [256, 1280).
        let (fpo, end) = (256, 1280);

        // Writer advanced but stayed behind the reader.
        assert!(!ring_swept(256, 512, 768, fpo, end));
        // Writer reached exactly the reader's packet boundary: untouched.
        assert!(!ring_swept(256, 768, 768, fpo, end));
        // Writer rewrote the reader's next packet.
        assert!(ring_swept(256, 1024, 768, fpo, end));
        // Wrapping advance that sweeps a low position.
        assert!(ring_swept(1024, 768, 512, fpo, end));
        // Reader exactly at the previous frontier is waiting, not behind.
        assert!(!ring_swept(512, 1024, 512, fpo, end));
        // No progress.
        assert!(!ring_swept(512, 512, 768, fpo, end));
    }
}
