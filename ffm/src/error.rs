use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Live/attached mode only: the reader has caught up with the producer.
    /// Not a fault; the caller retries after a backoff of its choosing.
    #[error("live feed has no complete frame available yet")]
    WouldBlock,

    #[error("bad magic: expected \"FFM2\", got {got:02X?}")]
    BadMagic { got: [u8; 4] },

    #[error("unusable packet size {0}")]
    BadPacketSize(u32),

    #[error("unknown header tag 0x{tag:08X} at offset 0x{offset:X}")]
    UnknownTag { tag: u32, offset: u64 },

    #[error("duplicate {tag} block for stream {stream}")]
    DuplicateBlock { tag: &'static str, stream: usize },

    #[error("misplaced {tag} block: {reason}")]
    MisplacedBlock { tag: &'static str, reason: &'static str },

    #[error("unknown codec id 0x{0:X}")]
    UnknownCodec(u32),

    #[error("codec 0x{codec_id:X} does not match the media type of stream {stream}")]
    MediaTypeMismatch { stream: usize, codec_id: u32 },

    #[error("unknown pixel format id {0}")]
    UnknownPixelFormat(u32),

    #[error("invalid {field} value {value} for stream {stream}")]
    InvalidStreamField {
        stream: usize,
        field: &'static str,
        value: i64,
    },

    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: i64 },

    #[error("stream count mismatch: MAIN declares {declared}, found {found} COMM blocks")]
    StreamCountMismatch { declared: u32, found: usize },

    #[error("truncated header block at offset 0x{0:X}")]
    TruncatedHeader(u64),

    #[error("bad sync word 0x{got:04X} at offset 0x{offset:X}")]
    BadSync { offset: u64, got: u16 },

    #[error("no sync word found before end of feed (scan started at 0x{0:X})")]
    SyncLost(u64),

    #[error("invalid fill_size {fill_size} at packet offset 0x{offset:X}")]
    BadFillSize { offset: u64, fill_size: u16 },

    #[error("invalid frame_offset {frame_offset} at packet offset 0x{offset:X}")]
    BadFrameOffset { offset: u64, frame_offset: u16 },

    #[error("no frame alignment point found near offset 0x{0:X}")]
    NoAlignment(u64),

    #[error("ring overrun: reader at 0x{pos:X} overtaken by writer at 0x{write_index:X}")]
    RingOverrun { pos: u64, write_index: u64 },

    #[error("feed truncated mid-frame at offset 0x{0:X}")]
    TruncatedFrame(u64),

    #[error("frame payload of {0} bytes exceeds the 24-bit size field")]
    FrameTooLarge(usize),

    #[error("unknown stream index {0}")]
    BadStreamIndex(u8),

    #[error("timestamp {0} not found in feed")]
    NotFound(i64),

    #[error("live mode is not supported for gzip-compressed input")]
    LiveGzip,
}

impl FeedError {
    /// True for the transient "caught up with the producer" condition that a
    /// live reader polls through; every other variant is a real failure.
    pub fn is_would_block(&self) -> bool {
        matches!(self, FeedError::WouldBlock)
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
