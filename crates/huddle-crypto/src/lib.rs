use std::time::Duration;

use huddle_codec::TruncatedNonce;

pub mod clock;
pub mod cryptor;
pub mod decryptor;
pub mod encryptor;
pub mod manager;
pub mod pool;
pub mod ratchet;
pub mod stats;

/// Media classes handled by the encryptor and decryptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    pub(crate) fn index(self) -> usize {
        match self {
            MediaType::Audio => 0,
            MediaType::Video => 1,
        }
    }
}

/// AES-128 key size in bytes.
pub const KEY_SIZE: usize = 16;
/// Nonce size for AES-GCM (96 bits / 12 bytes).
pub const NONCE_SIZE: usize = 12;
/// Size of the truncated sync nonce inside the full AEAD nonce.
pub const TRUNCATED_NONCE_SIZE: usize = 4;
/// Offset of the truncated nonce inside the full AEAD nonce.
pub const TRUNCATED_NONCE_OFFSET: usize = NONCE_SIZE - TRUNCATED_NONCE_SIZE;

/// Bits of the truncated nonce below the ratchet generation byte.
pub const GENERATION_SHIFT_BITS: u32 = 24;
/// Modulus of the 8-bit generation carried in the truncated nonce.
pub const GENERATION_WRAP: u64 = 256;
/// How far ahead of the newest generation a frame may reach.
pub const MAX_GENERATION_GAP: u64 = 250;
/// Bound on the replay backlog of missing nonces.
pub const MAX_MISSING_NONCES: usize = 1000;
/// Frame-rate ceiling used to bound generation fast-forwarding:
/// 50 audio frames plus two 60 fps video streams.
pub const MAX_FRAMES_PER_SECOND: u64 = 50 + 2 * 60;

/// Lifetime of a superseded per-generation cryptor.
pub const CRYPTOR_EXPIRY: Duration = Duration::from_secs(10);
/// Default grace period for ratchet and passthrough transitions.
pub const DEFAULT_TRANSITION_DURATION: Duration = Duration::from_secs(10);

/// Ratchet step named by the high byte of the truncated nonce, lifted
/// into an unwrapped 64-bit space.
pub type Generation = u64;
/// Replay-ordering key combining the wrapped generation and the 24-bit
/// intra-generation counter.
pub type BigNonce = u64;
/// Key material produced by a ratchet for one generation.
pub type EncryptionKey = [u8; KEY_SIZE];

/// Protocol version published through the encryptor callback.
pub type ProtocolVersion = u16;
/// Highest frame protocol version this library speaks.
pub const MAX_PROTOCOL_VERSION: ProtocolVersion = 1;
/// Version published while the encryptor passes frames through unmodified.
pub const PASSTHROUGH_PROTOCOL_VERSION: ProtocolVersion = 0;

/// Expand the truncated sync nonce into a full AEAD nonce: low four bytes
/// carry the counter little-endian, the rest stays zero.
pub(crate) fn full_nonce(truncated: TruncatedNonce) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[TRUNCATED_NONCE_OFFSET..].copy_from_slice(&truncated.to_le_bytes());
    nonce
}
