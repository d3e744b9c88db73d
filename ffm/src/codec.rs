/// Media category of a stream or codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[cfg_attr(feature = "jsonschema", derive(schemars::JsonSchema))]
pub enum MediaType {
    Video,
    Audio,
}

impl MediaType {
    /// One-byte wire encoding used in the COMM block.
    pub fn to_wire(self) -> u8 {
        match self {
            MediaType::Video => 0,
            MediaType::Audio => 1,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(MediaType::Video),
            1 => Some(MediaType::Audio),
            _ => None,
        }
    }
}

/// Information about a codec identified by its registry id.
#[derive(Debug, Clone, Copy)]
pub struct CodecInfo {
    /// Registry id as stored in the COMM block.
    pub id: u32,
    /// Human-readable codec name (e.g. "h264", "aac").
    pub name: &'static str,
    pub media_type: MediaType,
}

// Video codecs
pub const H264: CodecInfo = CodecInfo { id: 0x0001, name: "h264", media_type: MediaType::Video };
pub const HEVC: CodecInfo = CodecInfo { id: 0x0002, name: "hevc", media_type: MediaType::Video };
pub const MPEG4: CodecInfo = CodecInfo { id: 0x0003, name: "mpeg4", media_type: MediaType::Video };
pub const MJPEG: CodecInfo = CodecInfo { id: 0x0004, name: "mjpeg", media_type: MediaType::Video };
pub const AV1: CodecInfo = CodecInfo { id: 0x0005, name: "av1", media_type: MediaType::Video };

// Audio codecs
pub const AAC: CodecInfo = CodecInfo { id: 0x0100, name: "aac", media_type: MediaType::Audio };
pub const MP3: CodecInfo = CodecInfo { id: 0x0101, name: "mp3", media_type: MediaType::Audio };
pub const OPUS: CodecInfo = CodecInfo { id: 0x0102, name: "opus", media_type: MediaType::Audio };
pub const PCM_S16BE: CodecInfo =
    CodecInfo { id: 0x0103, name: "pcm_s16be", media_type: MediaType::Audio };
pub const FLAC: CodecInfo = CodecInfo { id: 0x0104, name: "flac", media_type: MediaType::Audio };

/// All registered codecs.
pub const ALL_CODECS: &[CodecInfo] =
    &[H264, HEVC, MPEG4, MJPEG, AV1, AAC, MP3, OPUS, PCM_S16BE, FLAC];

/// Look up codec info by registry id.
pub fn codec_info(id: u32) -> Option<&'static CodecInfo> {
    ALL_CODECS.iter().find(|c| c.id == id)
}

/// Pixel format names indexed by wire id.
pub const PIXEL_FORMATS: [&str; 8] = [
    "yuv420p", // 0
    "yuyv422", // 1
    "rgb24",   // 2
    "bgr24",   // 3
    "yuv422p", // 4
    "yuv444p", // 5
    "gray8",   // 6
    "nv12",    // 7
];

/// Look up a pixel format name by wire id.
pub fn pixel_format_name(id: u32) -> Option<&'static str> {
    PIXEL_FORMATS.get(id as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_lookup() {
        let info = codec_info(H264.id).unwrap();
        assert_eq!(info.name, "h264");
        assert_eq!(info.media_type, MediaType::Video);

        let info = codec_info(OPUS.id).unwrap();
        assert_eq!(info.name, "opus");
        assert_eq!(info.media_type, MediaType::Audio);

        assert!(codec_info(0xDEAD).is_none());
    }

    #[test]
    fn test_media_type_wire_round_trip() {
        assert_eq!(MediaType::from_wire(MediaType::Video.to_wire()), Some(MediaType::Video));
        assert_eq!(MediaType::from_wire(MediaType::Audio.to_wire()), Some(MediaType::Audio));
        assert_eq!(MediaType::from_wire(7), None);
    }

    #[test]
    fn test_pixel_format_lookup() {
        assert_eq!(pixel_format_name(0), Some("yuv420p"));
        assert_eq!(pixel_format_name(7), Some("nv12"));
        assert_eq!(pixel_format_name(8), None);
    }
}
