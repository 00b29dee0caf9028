// Outbound frame encryption: dissect, seal, validate, append trailer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use huddle_codec::outbound::OutboundFrameProcessor;
use huddle_codec::{
    dissect, leb128, range, Codec, MAGIC_MARKER, SUPPLEMENTAL_OVERHEAD, TRANSFORM_PADDING,
    TRUNCATED_TAG_SIZE,
};

use crate::cryptor::Cryptor;
use crate::manager::wrapped_generation;
use crate::pool::Pool;
use crate::ratchet::KeyRatchet;
use crate::stats::EncryptStats;
use crate::{
    full_nonce, Generation, MediaType, ProtocolVersion, GENERATION_SHIFT_BITS,
    MAX_PROTOCOL_VERSION, PASSTHROUGH_PROTOCOL_VERSION,
};

/// Seal attempts before a frame whose ciphertext keeps breaking the codec
/// is failed. A fresh nonce changes both the ciphertext and the trailer
/// bytes around it, so a retry clears stray start codes.
const MAX_CIPHERTEXT_VALIDATION_RETRIES: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptError {
    #[error("no key ratchet configured")]
    MissingKeyRatchet,
    #[error("key ratchet produced no key for generation {0}")]
    KeyUnavailable(Generation),
    #[error("output buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("supplemental section of {0} bytes does not fit its length byte")]
    SupplementalOverflow(usize),
    #[error("ciphertext failed codec validation after {0} attempts")]
    ValidationExhausted(u32),
}

/// Callback invoked with the new value when the published protocol
/// version changes.
pub type ProtocolVersionCallback = Box<dyn Fn(ProtocolVersion) + Send + Sync>;

struct KeyState {
    ratchet: Option<Box<dyn KeyRatchet>>,
    cryptor: Option<Cryptor>,
    current_generation: Generation,
    truncated_nonce: huddle_codec::TruncatedNonce,
}

struct VersionState {
    current: ProtocolVersion,
    callback: Option<ProtocolVersionCallback>,
}

/// Encrypts outbound media frames for the local sender.
///
/// Safe to call from multiple encoder threads. The key state and the
/// processor pool are locked independently; the nonce counter only
/// advances under the key lock, together with the generation derivation
/// and the seal itself, which keeps nonces unique per key.
pub struct Encryptor {
    passthrough: AtomicBool,
    key_state: Mutex<KeyState>,
    processors: Pool<OutboundFrameProcessor>,
    ssrc_codecs: Mutex<Vec<(u32, Codec)>>,
    stats: Mutex<[EncryptStats; 2]>,
    version: Mutex<VersionState>,
}

impl Default for Encryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Encryptor {
    pub fn new() -> Self {
        Self {
            passthrough: AtomicBool::new(false),
            key_state: Mutex::new(KeyState {
                ratchet: None,
                cryptor: None,
                current_generation: 0,
                truncated_nonce: 0,
            }),
            processors: Pool::new(),
            ssrc_codecs: Mutex::new(Vec::new()),
            stats: Mutex::new([EncryptStats::default(); 2]),
            version: Mutex::new(VersionState {
                current: MAX_PROTOCOL_VERSION,
                callback: None,
            }),
        }
    }

    /// Install a new sending ratchet, resetting generation and nonce
    /// state.
    pub fn set_key_ratchet(&self, ratchet: Box<dyn KeyRatchet>) {
        let mut state = self.key_state.lock().unwrap();
        state.ratchet = Some(ratchet);
        state.cryptor = None;
        state.current_generation = 0;
        state.truncated_nonce = 0;
    }

    pub fn has_key_ratchet(&self) -> bool {
        self.key_state.lock().unwrap().ratchet.is_some()
    }

    /// Toggle passthrough mode, publishing the matching protocol version.
    pub fn set_passthrough(&self, passthrough: bool) {
        self.passthrough.store(passthrough, Ordering::Relaxed);
        self.update_protocol_version(if passthrough {
            PASSTHROUGH_PROTOCOL_VERSION
        } else {
            MAX_PROTOCOL_VERSION
        });
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough.load(Ordering::Relaxed)
    }

    pub fn set_protocol_version_callback(&self, callback: ProtocolVersionCallback) {
        self.version.lock().unwrap().callback = Some(callback);
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version.lock().unwrap().current
    }

    /// Bind `ssrc` to the codec its frames carry.
    pub fn assign_ssrc_to_codec(&self, ssrc: u32, codec: Codec) {
        let mut pairs = self.ssrc_codecs.lock().unwrap();
        match pairs.iter_mut().find(|(existing, _)| *existing == ssrc) {
            Some((_, existing)) => *existing = codec,
            None => pairs.push((ssrc, codec)),
        }
    }

    pub fn codec_for_ssrc(&self, ssrc: u32) -> Codec {
        self.ssrc_codecs
            .lock()
            .unwrap()
            .iter()
            .find(|(existing, _)| *existing == ssrc)
            .map(|&(_, codec)| codec)
            .unwrap_or(Codec::Unknown)
    }

    /// Upper bound on the transformed size of a `frame_size`-byte frame.
    pub fn max_ciphertext_size(&self, _media_type: MediaType, frame_size: usize) -> usize {
        frame_size + SUPPLEMENTAL_OVERHEAD + TRANSFORM_PADDING
    }

    pub fn stats(&self, media_type: MediaType) -> EncryptStats {
        self.stats.lock().unwrap()[media_type.index()]
    }

    /// Encrypt one frame, writing the transformed frame into `out`.
    /// Returns the number of bytes written.
    pub fn encrypt(
        &self,
        media_type: MediaType,
        ssrc: u32,
        frame: &[u8],
        out: &mut [u8],
    ) -> Result<usize, EncryptError> {
        if self.is_passthrough() {
            if out.len() < frame.len() {
                return Err(EncryptError::BufferTooSmall {
                    needed: frame.len(),
                    available: out.len(),
                });
            }
            out[..frame.len()].copy_from_slice(frame);
            self.stats.lock().unwrap()[media_type.index()].passthrough_count += 1;
            return Ok(frame.len());
        }

        if !self.has_key_ratchet() {
            self.stats.lock().unwrap()[media_type.index()].failure_count += 1;
            return Err(EncryptError::MissingKeyRatchet);
        }

        let start = Instant::now();
        let codec = self.codec_for_ssrc(ssrc);

        let mut processor = self.processors.acquire();
        processor.process_frame(frame, codec);

        let result = self.encrypt_dissected(media_type, &mut processor, out);

        let mut stats = self.stats.lock().unwrap();
        let stats = &mut stats[media_type.index()];
        stats.duration_micros += start.elapsed().as_micros() as u64;
        if result.is_ok() {
            stats.success_count += 1;
        } else {
            stats.failure_count += 1;
        }

        result
    }

    fn encrypt_dissected(
        &self,
        media_type: MediaType,
        processor: &mut OutboundFrameProcessor,
        out: &mut [u8],
    ) -> Result<usize, EncryptError> {
        let body_size = processor.unencrypted_bytes().len() + processor.encrypted_bytes().len();
        let ranges_size = range::ranges_size(processor.unencrypted_ranges());

        for attempt in 1..=MAX_CIPHERTEXT_VALIDATION_RETRIES {
            let (truncated_nonce, tag) = {
                let mut guard = self.key_state.lock().unwrap();
                let state = &mut *guard;

                state.truncated_nonce = state.truncated_nonce.wrapping_add(1);
                let truncated_nonce = state.truncated_nonce;

                let generation = wrapped_generation(
                    state.current_generation,
                    u64::from(truncated_nonce >> GENERATION_SHIFT_BITS),
                );
                if generation != state.current_generation || state.cryptor.is_none() {
                    let ratchet = state
                        .ratchet
                        .as_mut()
                        .ok_or(EncryptError::MissingKeyRatchet)?;
                    let key = ratchet
                        .key(generation)
                        .ok_or(EncryptError::KeyUnavailable(generation))?;
                    state.current_generation = generation;
                    state.cryptor = Some(Cryptor::new(&key));
                }
                let cryptor = state
                    .cryptor
                    .as_ref()
                    .ok_or(EncryptError::KeyUnavailable(generation))?;

                // seal with the unencrypted bytes as associated data
                let nonce = full_nonce(truncated_nonce);
                let (aad, plaintext, ciphertext) = processor.seal_buffers();
                let mut tag = [0u8; TRUNCATED_TAG_SIZE];
                cryptor.seal(ciphertext, plaintext, &nonce, aad, &mut tag);

                (truncated_nonce, tag)
            };

            {
                let mut stats = self.stats.lock().unwrap();
                let stats = &mut stats[media_type.index()];
                stats.attempts += 1;
                stats.max_attempts = stats.max_attempts.max(u64::from(attempt));
            }

            let nonce_size = leb128::size(u64::from(truncated_nonce));
            let supplemental_size = SUPPLEMENTAL_OVERHEAD + nonce_size + ranges_size;
            if supplemental_size > usize::from(u8::MAX) {
                warn!(supplemental_size, "supplemental section exceeds one byte");
                return Err(EncryptError::SupplementalOverflow(supplemental_size));
            }

            let total_size = body_size + supplemental_size;
            if out.len() < total_size {
                return Err(EncryptError::BufferTooSmall {
                    needed: total_size,
                    available: out.len(),
                });
            }

            let written = processor.reconstruct_frame(out);
            debug_assert_eq!(written, body_size);

            // tag, nonce, range map, supplemental size, marker
            let mut at = body_size;
            out[at..at + TRUNCATED_TAG_SIZE].copy_from_slice(&tag);
            at += TRUNCATED_TAG_SIZE;
            at += leb128::write(u64::from(truncated_nonce), &mut out[at..]);
            at += range::serialize_ranges(processor.unencrypted_ranges(), &mut out[at..]);
            out[at] = supplemental_size as u8;
            at += 1;
            out[at..at + 2].copy_from_slice(&MAGIC_MARKER.to_le_bytes());
            at += 2;
            debug_assert_eq!(at, total_size);

            if dissect::validate_encrypted_frame(processor, &out[..total_size]) {
                return Ok(total_size);
            }
            debug!(attempt, "ciphertext contains a start code, retrying with a fresh nonce");
        }

        warn!("failed to produce validatable ciphertext");
        Err(EncryptError::ValidationExhausted(
            MAX_CIPHERTEXT_VALIDATION_RETRIES,
        ))
    }

    fn update_protocol_version(&self, version: ProtocolVersion) {
        let mut state = self.version.lock().unwrap();
        if state.current == version {
            return;
        }
        state.current = version;
        if let Some(callback) = &state.callback {
            callback(version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ratchet::HkdfKeyRatchet;

    #[test]
    fn passthrough_copies_the_frame() {
        let encryptor = Encryptor::new();
        encryptor.set_passthrough(true);

        let frame = [1u8, 2, 3, 4];
        let mut out = [0u8; 8];
        let written = encryptor
            .encrypt(MediaType::Audio, 1, &frame, &mut out)
            .unwrap();
        assert_eq!(written, 4);
        assert_eq!(&out[..4], &frame);
        assert_eq!(encryptor.stats(MediaType::Audio).passthrough_count, 1);
    }

    #[test]
    fn encrypting_without_ratchet_fails() {
        let encryptor = Encryptor::new();
        let mut out = [0u8; 64];
        assert_eq!(
            encryptor.encrypt(MediaType::Audio, 1, &[1, 2, 3], &mut out),
            Err(EncryptError::MissingKeyRatchet)
        );
        assert_eq!(encryptor.stats(MediaType::Audio).failure_count, 1);
    }

    #[test]
    fn encrypted_frame_carries_the_trailer() {
        let encryptor = Encryptor::new();
        encryptor.set_key_ratchet(Box::new(HkdfKeyRatchet::new([9u8; 32])));
        encryptor.assign_ssrc_to_codec(7, Codec::Opus);

        let frame = [0x11u8; 32];
        let mut out = vec![0u8; encryptor.max_ciphertext_size(MediaType::Audio, frame.len())];
        let written = encryptor
            .encrypt(MediaType::Audio, 7, &frame, &mut out)
            .unwrap();

        // Opus: whole body encrypted, empty range map, one-byte nonce.
        assert_eq!(written, frame.len() + SUPPLEMENTAL_OVERHEAD + 1);
        assert_eq!(&out[written - 2..written], &MAGIC_MARKER.to_le_bytes());
        assert_eq!(usize::from(out[written - 3]), SUPPLEMENTAL_OVERHEAD + 1);
        // the body must differ from the plaintext
        assert_ne!(&out[..frame.len()], &frame);
        assert_eq!(encryptor.stats(MediaType::Audio).success_count, 1);
        assert_eq!(encryptor.stats(MediaType::Audio).attempts, 1);
    }

    #[test]
    fn nonces_increase_across_frames() {
        let encryptor = Encryptor::new();
        encryptor.set_key_ratchet(Box::new(HkdfKeyRatchet::new([9u8; 32])));
        encryptor.assign_ssrc_to_codec(7, Codec::Opus);

        let frame = [0x22u8; 8];
        let mut out = vec![0u8; encryptor.max_ciphertext_size(MediaType::Audio, frame.len())];

        // nonce is the last supplemental field before the range map; with
        // an empty range map it sits right before the size byte
        let mut nonces = Vec::new();
        for _ in 0..3 {
            let written = encryptor
                .encrypt(MediaType::Audio, 7, &frame, &mut out)
                .unwrap();
            nonces.push(out[written - 4]);
        }
        assert_eq!(nonces, vec![1, 2, 3]);
    }

    #[test]
    fn ssrc_bindings_can_be_reassigned() {
        let encryptor = Encryptor::new();
        assert_eq!(encryptor.codec_for_ssrc(1), Codec::Unknown);

        encryptor.assign_ssrc_to_codec(1, Codec::Vp8);
        assert_eq!(encryptor.codec_for_ssrc(1), Codec::Vp8);

        encryptor.assign_ssrc_to_codec(1, Codec::H264);
        assert_eq!(encryptor.codec_for_ssrc(1), Codec::H264);
    }

    #[test]
    fn passthrough_toggles_protocol_version() {
        let encryptor = Encryptor::new();
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = published.clone();
        encryptor.set_protocol_version_callback(Box::new(move |version| {
            sink.lock().unwrap().push(version);
        }));
        assert_eq!(encryptor.protocol_version(), MAX_PROTOCOL_VERSION);

        encryptor.set_passthrough(true);
        assert_eq!(encryptor.protocol_version(), PASSTHROUGH_PROTOCOL_VERSION);
        // setting the same mode again does not re-notify
        encryptor.set_passthrough(true);
        encryptor.set_passthrough(false);
        assert_eq!(
            *published.lock().unwrap(),
            vec![PASSTHROUGH_PROTOCOL_VERSION, MAX_PROTOCOL_VERSION]
        );
    }

    #[test]
    fn output_buffer_must_fit_the_bound() {
        let encryptor = Encryptor::new();
        encryptor.set_key_ratchet(Box::new(HkdfKeyRatchet::new([9u8; 32])));
        encryptor.assign_ssrc_to_codec(7, Codec::Opus);

        let frame = [0u8; 32];
        let mut out = [0u8; 16];
        assert!(matches!(
            encryptor.encrypt(MediaType::Audio, 7, &frame, &mut out),
            Err(EncryptError::BufferTooSmall { .. })
        ));
    }
}
