pub mod dissect;
pub mod inbound;
pub mod leb128;
pub mod outbound;
pub mod range;

/// Truncated 32-bit sync nonce carried in the frame trailer. The high byte
/// is the ratchet generation, the low 24 bits an intra-generation counter.
pub type TruncatedNonce = u32;

/// Media codecs the frame dissector understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Unknown,
    Opus,
    Vp8,
    Vp9,
    H264,
    H265,
    Av1,
}

/// Marker bytes ending every encrypted frame.
pub const MAGIC_MARKER: u16 = 0xFAFA;

/// Truncated AEAD tag size carried on the wire.
pub const TRUNCATED_TAG_SIZE: usize = 8;

/// Fixed trailer overhead: truncated tag, supplemental-size byte, marker.
pub const SUPPLEMENTAL_OVERHEAD: usize = TRUNCATED_TAG_SIZE + 1 + 2;

/// Headroom covering the LEB128 nonce and range map in the worst case.
pub const TRANSFORM_PADDING: usize = 64;

/// Opus DTX silence frame, forwarded without encryption in either
/// direction.
pub const OPUS_SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];
