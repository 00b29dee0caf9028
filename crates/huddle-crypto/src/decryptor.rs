// Inbound frame decryption across overlapping key ratchets.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use huddle_codec::inbound::InboundFrameProcessor;
use huddle_codec::{TruncatedNonce, OPUS_SILENCE_FRAME, TRUNCATED_TAG_SIZE};

use crate::clock::{Clock, Expiry, SteadyClock};
use crate::manager::CryptorManager;
use crate::pool::Pool;
use crate::ratchet::KeyRatchet;
use crate::stats::DecryptStats;
use crate::{full_nonce, MediaType, GENERATION_SHIFT_BITS};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecryptError {
    #[error("output buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("frame is not encrypted and passthrough has expired")]
    PassthroughDisallowed,
    #[error("no cryptor could authenticate the frame")]
    AuthenticationFailed,
}

/// Decrypts frames from one remote sender, trying the newest ratchet
/// first.
///
/// Ratchet state is not internally locked: the `&mut self` receivers
/// encode the one-decoder-thread-per-sender contract. The processor pool
/// keeps its own lock so pooled buffers survive a sender being moved
/// between threads.
pub struct Decryptor {
    clock: Arc<dyn Clock>,
    managers: VecDeque<CryptorManager>,
    processors: Pool<InboundFrameProcessor>,
    allow_passthrough_until: Option<Expiry>,
    stats: [DecryptStats; 2],
}

impl Default for Decryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decryptor {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SteadyClock))
    }

    /// Build a decryptor on a caller-supplied clock; tests drive time.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            managers: VecDeque::new(),
            processors: Pool::new(),
            allow_passthrough_until: None,
            stats: [DecryptStats::default(); 2],
        }
    }

    /// Start decrypting under a new ratchet. Every prior ratchet's
    /// lifetime is clamped to `transition_expiry` from now.
    pub fn transition_to_key_ratchet(
        &mut self,
        ratchet: Box<dyn KeyRatchet>,
        transition_expiry: Duration,
    ) {
        info!(
            expiry_secs = transition_expiry.as_secs(),
            "transitioning to new key ratchet"
        );
        self.update_manager_expiry(transition_expiry);
        self.managers
            .push_back(CryptorManager::new(self.clock.clone(), ratchet));
    }

    /// Allow or stop allowing unencrypted frames through. Stopping clamps
    /// the existing horizon to `transition_expiry` from now; it never
    /// enables a horizon that was not granted.
    pub fn transition_to_passthrough(&mut self, passthrough: bool, transition_expiry: Duration) {
        if passthrough {
            self.allow_passthrough_until = Some(Expiry::Never);
        } else if let Some(until) = self.allow_passthrough_until {
            let max_expiry = Expiry::At(self.clock.now() + transition_expiry);
            self.allow_passthrough_until = Some(until.min(max_expiry));
        }
    }

    /// Upper bound on the plaintext size of an `encrypted_size`-byte
    /// frame.
    pub fn max_plaintext_size(&self, _media_type: MediaType, encrypted_size: usize) -> usize {
        encrypted_size
    }

    pub fn stats(&self, media_type: MediaType) -> DecryptStats {
        self.stats[media_type.index()]
    }

    /// Decrypt one frame into `out`, returning the plaintext length.
    pub fn decrypt(
        &mut self,
        media_type: MediaType,
        encrypted_frame: &[u8],
        out: &mut [u8],
    ) -> Result<usize, DecryptError> {
        let start = self.clock.now();

        // Opus DTX silence passes through regardless of ratchet state.
        if media_type == MediaType::Audio && encrypted_frame == OPUS_SILENCE_FRAME {
            debug!(size = encrypted_frame.len(), "passing through silence frame");
            return Self::copy_through(encrypted_frame, out);
        }

        self.cleanup_expired_managers();

        let mut processor = self.processors.acquire();
        processor.parse_frame(encrypted_frame);

        let can_passthrough = self
            .allow_passthrough_until
            .is_some_and(|until| until > Expiry::At(start));

        if !processor.is_encrypted() {
            if can_passthrough {
                let result = Self::copy_through(encrypted_frame, out);
                if result.is_ok() {
                    self.stats[media_type.index()].passthrough_count += 1;
                }
                return result;
            }
            info!("frame is not encrypted and passthrough is disabled");
            self.stats[media_type.index()].failure_count += 1;
            return Err(DecryptError::PassthroughDisallowed);
        }

        let tag = *processor.tag();
        let truncated_nonce = processor.truncated_nonce();

        // Try each live ratchet, newest first.
        let mut success = false;
        for manager in self.managers.iter_mut().rev() {
            if Self::try_open(
                manager,
                &mut self.stats[media_type.index()],
                &mut processor,
                tag,
                truncated_nonce,
            ) {
                success = true;
                break;
            }
        }

        if !success {
            self.stats[media_type.index()].failure_count += 1;
            self.stats[media_type.index()].duration_micros +=
                self.clock.now().duration_since(start).as_micros() as u64;
            warn!(
                encrypted_size = encrypted_frame.len(),
                managers = self.managers.len(),
                passthrough = can_passthrough,
                "no valid cryptor found for frame"
            );
            return Err(DecryptError::AuthenticationFailed);
        }

        let needed = processor.decrypted_size();
        if out.len() < needed {
            self.stats[media_type.index()].failure_count += 1;
            return Err(DecryptError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        let written = processor.reconstruct_frame(out);
        self.stats[media_type.index()].success_count += 1;
        self.stats[media_type.index()].duration_micros +=
            self.clock.now().duration_since(start).as_micros() as u64;
        Ok(written)
    }

    fn try_open(
        manager: &mut CryptorManager,
        stats: &mut DecryptStats,
        processor: &mut InboundFrameProcessor,
        tag: [u8; TRUNCATED_TAG_SIZE],
        truncated_nonce: TruncatedNonce,
    ) -> bool {
        let generation =
            manager.wrapped_generation(u64::from(truncated_nonce >> GENERATION_SHIFT_BITS));

        if !manager.can_process_nonce(generation, truncated_nonce) {
            debug!(truncated_nonce, "nonce was already processed");
            return false;
        }

        let Some(cryptor) = manager.cryptor(generation) else {
            debug!(generation, "no cryptor for generation");
            return false;
        };

        let nonce = full_nonce(truncated_nonce);
        let (aad, ciphertext, plaintext) = processor.open_buffers();
        stats.attempts += 1;
        let opened = cryptor.open(plaintext, ciphertext, &tag, &nonce, aad).is_ok();

        if opened {
            manager.report_success(generation, truncated_nonce);
        }
        opened
    }

    fn copy_through(frame: &[u8], out: &mut [u8]) -> Result<usize, DecryptError> {
        if out.len() < frame.len() {
            return Err(DecryptError::BufferTooSmall {
                needed: frame.len(),
                available: out.len(),
            });
        }
        out[..frame.len()].copy_from_slice(frame);
        Ok(frame.len())
    }

    fn update_manager_expiry(&mut self, expiry: Duration) {
        let max_expiry = Expiry::At(self.clock.now() + expiry);
        for manager in &mut self.managers {
            manager.update_expiry(max_expiry);
        }
    }

    fn cleanup_expired_managers(&mut self) {
        while self.managers.front().is_some_and(|m| m.is_expired()) {
            info!("removing expired cryptor manager");
            self.managers.pop_front();
        }
    }
}
