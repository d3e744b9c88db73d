//! Container header: magic, packet geometry, write index, and the tagged
//! stream descriptor blocks.
//!
//! Layout: `"FFM2" | u32 packet_size | u64 write_index | blocks | zero tag |
//! zero padding` to the first packet boundary. Each block is a 4-byte ASCII
//! tag, a 4-byte size and `size` payload bytes. `MAIN` (if present) comes
//! first; each stream opens with exactly one `COMM`, optionally followed by
//! its media-type-matched parameter block (`STVI`/`STAU`) and option strings
//! (`CPRV`, `S2VI`/`S2AU`). The write_index field is rewritten in place by
//! the producer once the ring wraps; everything else is immutable.

use std::io::Read;

use log::debug;

use crate::codec::{self, MediaType};
use crate::error::{FeedError, Result};

/// File magic.
pub const MAGIC: [u8; 4] = *b"FFM2";

/// Byte offset of the write_index field within the file.
pub const WRITE_INDEX_OFFSET: u64 = 8;

/// Fixed header bytes before the first tagged block.
pub const FIXED_HEADER_SIZE: u64 = 16;

const MIN_PACKET_SIZE: u32 = 256;
// The 15-bit frame_offset field must be able to address any packet byte.
const MAX_PACKET_SIZE: u32 = 1 << 15;
const MAX_DIMENSION: u16 = 16384;
const MAX_SAMPLE_RATE: u32 = 1_000_000;
const MAX_CHANNELS: u16 = 64;

const fn tag(b: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*b)
}

pub const TAG_MAIN: u32 = tag(b"MAIN");
pub const TAG_COMM: u32 = tag(b"COMM");
pub const TAG_VIDEO: u32 = tag(b"STVI");
pub const TAG_AUDIO: u32 = tag(b"STAU");
pub const TAG_CONFIG: u32 = tag(b"CPRV");
pub const TAG_VIDEO_OPTS: u32 = tag(b"S2VI");
pub const TAG_AUDIO_OPTS: u32 = tag(b"S2AU");

/// A stream time base as a rational number of seconds per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

/// Video parameters from the STVI block.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct VideoParams {
    pub time_base: Rational,
    pub width: u16,
    pub height: u16,
    pub gop_size: u16,
    /// Pixel format wire id; see `codec::PIXEL_FORMATS`.
    pub pixel_format: u32,
    pub qmin: u8,
    pub qmax: u8,
    pub max_qdiff: u8,
    /// Rate-control qcompress, fixed point x10000.
    pub qcompress: u16,
    /// Rate-control qblur, fixed point x10000.
    pub qblur: u16,
    pub bit_rate_tolerance: u32,
    pub rc_max_rate: u32,
    pub rc_min_rate: u32,
    pub rc_buffer_size: u32,
    pub codec_tag: u32,
}

/// Audio parameters from the STAU block.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: u16,
}

/// One stream's descriptor, assembled from its COMM block and the optional
/// blocks that follow it. Immutable once the header is written.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct StreamDescriptor {
    pub codec_id: u32,
    pub media_type: MediaType,
    pub bit_rate: u32,
    pub flags: u32,
    pub extradata: Vec<u8>,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
    /// CPRV block: recommended decoder configuration string.
    pub config: Option<String>,
    /// S2VI/S2AU block: free-form encoder option string.
    pub codec_options: Option<String>,
}

impl StreamDescriptor {
    pub fn video(codec_id: u32, params: VideoParams) -> Self {
        StreamDescriptor {
            codec_id,
            media_type: MediaType::Video,
            bit_rate: 0,
            flags: 0,
            extradata: Vec::new(),
            video: Some(params),
            audio: None,
            config: None,
            codec_options: None,
        }
    }

    pub fn audio(codec_id: u32, params: AudioParams) -> Self {
        StreamDescriptor {
            codec_id,
            media_type: MediaType::Audio,
            bit_rate: 0,
            flags: 0,
            extradata: Vec::new(),
            video: None,
            audio: Some(params),
            config: None,
            codec_options: None,
        }
    }
}

/// Parsed container header.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub struct FeedHeader {
    pub packet_size: u32,
    /// File offset of the producer's next packet; 0 until the ring first
    /// wraps, after which it marks the oldest valid packet.
    pub write_index: u64,
    /// Aggregate bit rate from the MAIN block.
    pub bit_rate: u32,
    pub streams: Vec<StreamDescriptor>,
}

/// Bounds-checked cursor over a block payload.
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
    /// File offset of the enclosing block, for error context.
    offset: u64,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8], offset: u64) -> Self {
        Fields { buf, pos: 0, offset }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let s = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(FeedError::TruncatedHeader(self.offset))?;
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let s = self.take(2)?;
        Ok(u16::from_be_bytes([s[0], s[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let s = self.take(4)?;
        Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }
}

fn put_block(out: &mut Vec<u8>, tag: u32, payload: &[u8]) {
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// Index of the stream a parameter block attaches to, after checking that a
/// stream is open and that the media types line up.
fn open_stream(streams: &[StreamDescriptor], tag: &'static str, media: MediaType) -> Result<usize> {
    match streams.last() {
        None => Err(FeedError::MisplacedBlock { tag, reason: "no COMM block opened a stream" }),
        Some(s) if s.media_type != media => {
            Err(FeedError::MediaTypeMismatch { stream: streams.len() - 1, codec_id: s.codec_id })
        }
        Some(_) => Ok(streams.len() - 1),
    }
}

impl FeedHeader {
    /// Serialize the header, zero-padded to the first packet boundary.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let mut out = Vec::with_capacity(self.packet_size as usize);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.packet_size.to_be_bytes());
        out.extend_from_slice(&self.write_index.to_be_bytes());

        let mut main = Vec::with_capacity(8);
        main.extend_from_slice(&(self.streams.len() as u32).to_be_bytes());
        main.extend_from_slice(&self.bit_rate.to_be_bytes());
        put_block(&mut out, TAG_MAIN, &main);

        for s in &self.streams {
            let mut comm = Vec::with_capacity(17 + s.extradata.len());
            comm.extend_from_slice(&s.codec_id.to_be_bytes());
            comm.push(s.media_type.to_wire());
            comm.extend_from_slice(&s.bit_rate.to_be_bytes());
            comm.extend_from_slice(&s.flags.to_be_bytes());
            comm.extend_from_slice(&(s.extradata.len() as u32).to_be_bytes());
            comm.extend_from_slice(&s.extradata);
            put_block(&mut out, TAG_COMM, &comm);

            if let Some(v) = &s.video {
                let mut p = Vec::with_capacity(45);
                p.extend_from_slice(&v.time_base.num.to_be_bytes());
                p.extend_from_slice(&v.time_base.den.to_be_bytes());
                p.extend_from_slice(&v.width.to_be_bytes());
                p.extend_from_slice(&v.height.to_be_bytes());
                p.extend_from_slice(&v.gop_size.to_be_bytes());
                p.extend_from_slice(&v.pixel_format.to_be_bytes());
                p.push(v.qmin);
                p.push(v.qmax);
                p.push(v.max_qdiff);
                p.extend_from_slice(&v.qcompress.to_be_bytes());
                p.extend_from_slice(&v.qblur.to_be_bytes());
                p.extend_from_slice(&v.bit_rate_tolerance.to_be_bytes());
                p.extend_from_slice(&v.rc_max_rate.to_be_bytes());
                p.extend_from_slice(&v.rc_min_rate.to_be_bytes());
                p.extend_from_slice(&v.rc_buffer_size.to_be_bytes());
                p.extend_from_slice(&v.codec_tag.to_be_bytes());
                put_block(&mut out, TAG_VIDEO, &p);
            }
            if let Some(a) = &s.audio {
                let mut p = Vec::with_capacity(8);
                p.extend_from_slice(&a.sample_rate.to_be_bytes());
                p.extend_from_slice(&a.channels.to_be_bytes());
                p.extend_from_slice(&a.frame_size.to_be_bytes());
                put_block(&mut out, TAG_AUDIO, &p);
            }
            if let Some(c) = &s.config {
                put_block(&mut out, TAG_CONFIG, c.as_bytes());
            }
            if let Some(o) = &s.codec_options {
                let t = match s.media_type {
                    MediaType::Video => TAG_VIDEO_OPTS,
                    MediaType::Audio => TAG_AUDIO_OPTS,
                };
                put_block(&mut out, t, o.as_bytes());
            }
        }

        // Zero tag terminator, then pad to the packet boundary.
        out.extend_from_slice(&[0u8; 4]);
        let padded =
            (out.len() as u64).div_ceil(self.packet_size as u64) * self.packet_size as u64;
        out.resize(padded as usize, 0);
        Ok(out)
    }

    /// Parse a header from the start of a feed, consuming exactly up to the
    /// first packet boundary. Returns the header and the first packet offset.
    ///
    /// In strict mode unknown tags are rejected; in lenient mode they are
    /// skipped by their declared size.
    pub fn parse<R: Read>(r: &mut R, strict: bool) -> Result<(FeedHeader, u64)> {
        let mut fixed = [0u8; FIXED_HEADER_SIZE as usize];
        r.read_exact(&mut fixed)?;
        if fixed[0..4] != MAGIC {
            return Err(FeedError::BadMagic { got: [fixed[0], fixed[1], fixed[2], fixed[3]] });
        }
        let packet_size = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&packet_size) {
            return Err(FeedError::BadPacketSize(packet_size));
        }
        let mut wi = [0u8; 8];
        wi.copy_from_slice(&fixed[8..16]);
        let write_index = u64::from_be_bytes(wi);

        let mut streams: Vec<StreamDescriptor> = Vec::new();
        let mut main: Option<(u32, u32)> = None;
        let mut consumed = FIXED_HEADER_SIZE;

        loop {
            let mut tag_buf = [0u8; 4];
            r.read_exact(&mut tag_buf)?;
            let block_tag = u32::from_be_bytes(tag_buf);
            consumed += 4;
            if block_tag == 0 {
                break;
            }

            let mut size_buf = [0u8; 4];
            r.read_exact(&mut size_buf)?;
            let size = u32::from_be_bytes(size_buf);
            consumed += 4;
            let block_offset = consumed;
            // Header blocks are small; a huge declared size is corruption.
            if size as u64 > MAX_PACKET_SIZE as u64 * 16 {
                return Err(FeedError::TruncatedHeader(block_offset));
            }
            let mut payload = vec![0u8; size as usize];
            r.read_exact(&mut payload)?;
            consumed += size as u64;

            let mut f = Fields::new(&payload, block_offset);
            match block_tag {
                TAG_MAIN => {
                    if main.is_some() {
                        return Err(FeedError::DuplicateBlock { tag: "MAIN", stream: 0 });
                    }
                    if !streams.is_empty() {
                        return Err(FeedError::MisplacedBlock {
                            tag: "MAIN",
                            reason: "must precede all COMM blocks",
                        });
                    }
                    main = Some((f.u32()?, f.u32()?));
                }

                TAG_COMM => {
                    let codec_id = f.u32()?;
                    let media_type = MediaType::from_wire(f.u8()?).ok_or(
                        FeedError::InvalidStreamField {
                            stream: streams.len(),
                            field: "media_type",
                            value: -1,
                        },
                    )?;
                    let bit_rate = f.u32()?;
                    let flags = f.u32()?;
                    let extradata_len = f.u32()? as usize;
                    let extradata = f.take(extradata_len)?.to_vec();
                    streams.push(StreamDescriptor {
                        codec_id,
                        media_type,
                        bit_rate,
                        flags,
                        extradata,
                        video: None,
                        audio: None,
                        config: None,
                        codec_options: None,
                    });
                }

                TAG_VIDEO => {
                    let idx = open_stream(&streams, "STVI", MediaType::Video)?;
                    if streams[idx].video.is_some() {
                        return Err(FeedError::DuplicateBlock { tag: "STVI", stream: idx });
                    }
                    streams[idx].video = Some(VideoParams {
                        time_base: Rational { num: f.u32()?, den: f.u32()? },
                        width: f.u16()?,
                        height: f.u16()?,
                        gop_size: f.u16()?,
                        pixel_format: f.u32()?,
                        qmin: f.u8()?,
                        qmax: f.u8()?,
                        max_qdiff: f.u8()?,
                        qcompress: f.u16()?,
                        qblur: f.u16()?,
                        bit_rate_tolerance: f.u32()?,
                        rc_max_rate: f.u32()?,
                        rc_min_rate: f.u32()?,
                        rc_buffer_size: f.u32()?,
                        codec_tag: f.u32()?,
                    });
                }

                TAG_AUDIO => {
                    let idx = open_stream(&streams, "STAU", MediaType::Audio)?;
                    if streams[idx].audio.is_some() {
                        return Err(FeedError::DuplicateBlock { tag: "STAU", stream: idx });
                    }
                    streams[idx].audio = Some(AudioParams {
                        sample_rate: f.u32()?,
                        channels: f.u16()?,
                        frame_size: f.u16()?,
                    });
                }

                TAG_CONFIG => {
                    let idx = streams.len().saturating_sub(1);
                    let s = streams.last_mut().ok_or(FeedError::MisplacedBlock {
                        tag: "CPRV",
                        reason: "no COMM block opened a stream",
                    })?;
                    if s.config.is_some() {
                        return Err(FeedError::DuplicateBlock { tag: "CPRV", stream: idx });
                    }
                    s.config = Some(String::from_utf8_lossy(f.rest()).into_owned());
                }

                TAG_VIDEO_OPTS | TAG_AUDIO_OPTS => {
                    let (name, media) = if block_tag == TAG_VIDEO_OPTS {
                        ("S2VI", MediaType::Video)
                    } else {
                        ("S2AU", MediaType::Audio)
                    };
                    let idx = open_stream(&streams, name, media)?;
                    if streams[idx].codec_options.is_some() {
                        return Err(FeedError::DuplicateBlock { tag: name, stream: idx });
                    }
                    streams[idx].codec_options =
                        Some(String::from_utf8_lossy(f.rest()).into_owned());
                }

                _ => {
                    if strict {
                        return Err(FeedError::UnknownTag { tag: block_tag, offset: block_offset });
                    }
                    debug!("skipping unknown header tag 0x{block_tag:08X} ({size} bytes)");
                }
            }
        }

        let mut header = FeedHeader { packet_size, write_index, bit_rate: 0, streams };
        if let Some((nb, bit_rate)) = main {
            if nb as usize != header.streams.len() {
                return Err(FeedError::StreamCountMismatch {
                    declared: nb,
                    found: header.streams.len(),
                });
            }
            header.bit_rate = bit_rate;
        }
        header.validate()?;

        // Skip the zero padding up to the first packet boundary.
        let first_packet_offset = consumed.div_ceil(packet_size as u64) * packet_size as u64;
        let mut pad = vec![0u8; (first_packet_offset - consumed) as usize];
        r.read_exact(&mut pad)?;

        Ok((header, first_packet_offset))
    }

    /// Check codec resolution, media-type consistency and numeric bounds.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(FeedError::BadPacketSize(self.packet_size));
        }
        if self.streams.len() > u8::MAX as usize {
            return Err(FeedError::InvalidField {
                field: "nb_streams",
                value: self.streams.len() as i64,
            });
        }
        for (i, s) in self.streams.iter().enumerate() {
            let info = codec::codec_info(s.codec_id).ok_or(FeedError::UnknownCodec(s.codec_id))?;
            if info.media_type != s.media_type {
                return Err(FeedError::MediaTypeMismatch { stream: i, codec_id: s.codec_id });
            }
            if s.media_type == MediaType::Video && s.audio.is_some() {
                return Err(FeedError::MisplacedBlock {
                    tag: "STAU",
                    reason: "audio parameters on a video stream",
                });
            }
            if s.media_type == MediaType::Audio && s.video.is_some() {
                return Err(FeedError::MisplacedBlock {
                    tag: "STVI",
                    reason: "video parameters on an audio stream",
                });
            }
            let bad = |field, value: i64| FeedError::InvalidStreamField { stream: i, field, value };
            if let Some(v) = &s.video {
                if v.time_base.den == 0 || v.time_base.num == 0 {
                    return Err(bad("time_base", v.time_base.den as i64));
                }
                if v.width == 0 || v.width > MAX_DIMENSION {
                    return Err(bad("width", v.width as i64));
                }
                if v.height == 0 || v.height > MAX_DIMENSION {
                    return Err(bad("height", v.height as i64));
                }
                if codec::pixel_format_name(v.pixel_format).is_none() {
                    return Err(FeedError::UnknownPixelFormat(v.pixel_format));
                }
            }
            if let Some(a) = &s.audio {
                if a.sample_rate == 0 || a.sample_rate > MAX_SAMPLE_RATE {
                    return Err(bad("sample_rate", a.sample_rate as i64));
                }
                if a.channels == 0 || a.channels > MAX_CHANNELS {
                    return Err(bad("channels", a.channels as i64));
                }
            }
        }
        Ok(())
    }
}
