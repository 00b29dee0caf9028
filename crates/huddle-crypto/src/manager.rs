// Per-sender generation and replay state machine.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use huddle_codec::TruncatedNonce;

use crate::clock::{Clock, Expiry};
use crate::cryptor::Cryptor;
use crate::ratchet::KeyRatchet;
use crate::{
    BigNonce, Generation, CRYPTOR_EXPIRY, GENERATION_SHIFT_BITS, GENERATION_WRAP,
    MAX_FRAMES_PER_SECOND, MAX_GENERATION_GAP, MAX_MISSING_NONCES,
};

/// Lift an 8-bit `generation` into the unwrapped space at or above
/// `oldest`: the next full multiple of the wrap is used when the low byte
/// of `generation` falls below the low byte of `oldest`. Assumes the frame
/// is not older than `oldest`; the cases where that is wrong are caught by
/// the generation gap check.
pub fn wrapped_generation(oldest: Generation, generation: Generation) -> Generation {
    let remainder = oldest % GENERATION_WRAP;
    let factor = oldest / GENERATION_WRAP + u64::from(generation < remainder);
    factor * GENERATION_WRAP + generation
}

/// Replay-ordering key: the wrapped generation above the 24 counter bits
/// of the truncated nonce.
pub fn wrapped_big_nonce(generation: Generation, nonce: TruncatedNonce) -> BigNonce {
    let masked = u64::from(nonce) & ((1 << GENERATION_SHIFT_BITS) - 1);
    (generation << GENERATION_SHIFT_BITS) | masked
}

struct ExpiringCryptor {
    cryptor: Cryptor,
    expiry: Expiry,
}

/// Tracks one ratchet's generations, cryptor lifetimes and replay window
/// for a single remote sender. The owning decryptor serializes access.
pub struct CryptorManager {
    clock: Arc<dyn Clock>,
    ratchet: Box<dyn KeyRatchet>,
    cryptors: HashMap<Generation, ExpiringCryptor>,

    ratchet_creation: Instant,
    ratchet_expiry: Expiry,
    oldest_generation: Generation,
    newest_generation: Generation,

    newest_processed_nonce: Option<BigNonce>,
    missing_nonces: VecDeque<BigNonce>,
}

impl CryptorManager {
    pub fn new(clock: Arc<dyn Clock>, ratchet: Box<dyn KeyRatchet>) -> Self {
        let ratchet_creation = clock.now();
        Self {
            clock,
            ratchet,
            cryptors: HashMap::new(),
            ratchet_creation,
            ratchet_expiry: Expiry::Never,
            oldest_generation: 0,
            newest_generation: 0,
            newest_processed_nonce: None,
            missing_nonces: VecDeque::new(),
        }
    }

    /// Clamp this ratchet's lifetime to `expiry`.
    pub fn update_expiry(&mut self, expiry: Expiry) {
        self.ratchet_expiry = self.ratchet_expiry.min(expiry);
    }

    pub fn is_expired(&self) -> bool {
        self.ratchet_expiry.is_expired(self.clock.now())
    }

    /// Whether `nonce` may still be processed: it is either newer than
    /// everything seen so far or sits in the missing window.
    pub fn can_process_nonce(&self, generation: Generation, nonce: TruncatedNonce) -> bool {
        let Some(newest) = self.newest_processed_nonce else {
            return true;
        };

        let big_nonce = wrapped_big_nonce(generation, nonce);
        // recent misses cluster at the back of the queue
        big_nonce > newest || self.missing_nonces.iter().rev().any(|&n| n == big_nonce)
    }

    /// Lift a received generation into this manager's unwrapped space.
    pub fn wrapped_generation(&self, generation: Generation) -> Generation {
        wrapped_generation(self.oldest_generation, generation)
    }

    /// Cryptor for `generation`, created lazily from the ratchet. `None`
    /// when the generation is retired, too far ahead of the newest, or
    /// beyond the frame-rate budget of the ratchet's lifetime.
    pub fn cryptor(&mut self, generation: Generation) -> Option<&Cryptor> {
        self.cleanup_expired_cryptors();

        if generation < self.oldest_generation {
            info!(
                generation,
                oldest = self.oldest_generation,
                "frame generation is already retired"
            );
            return None;
        }

        if generation > self.newest_generation + MAX_GENERATION_GAP {
            info!(
                generation,
                newest = self.newest_generation,
                "frame generation is too far in the future"
            );
            return None;
        }

        // A sender cannot legitimately outrun the frame rate; cap how far
        // the generation may have advanced since this ratchet was created.
        let ratchet_lifetime_secs = self
            .clock
            .now()
            .duration_since(self.ratchet_creation)
            .as_secs();
        let max_lifetime_generations =
            (MAX_FRAMES_PER_SECOND * ratchet_lifetime_secs) >> GENERATION_SHIFT_BITS;
        if generation > max_lifetime_generations {
            info!(
                generation,
                max_lifetime_generations,
                ratchet_lifetime_secs,
                "frame generation is beyond the ratchet lifetime budget"
            );
            return None;
        }

        if !self.cryptors.contains_key(&generation) {
            let expiring = self.make_expiring_cryptor(generation)?;
            self.cryptors.insert(generation, expiring);
        }

        self.cryptors.get(&generation).map(|entry| &entry.cryptor)
    }

    /// Record a successful decryption: advance the replay window and, for
    /// a known cryptor of a newer generation, promote it and start expiring
    /// everything strictly older.
    pub fn report_success(&mut self, generation: Generation, nonce: TruncatedNonce) {
        let big_nonce = wrapped_big_nonce(generation, nonce);

        match self.newest_processed_nonce {
            None => self.newest_processed_nonce = Some(big_nonce),
            Some(newest) if big_nonce > newest => {
                let oldest_missing = big_nonce.saturating_sub(MAX_MISSING_NONCES as u64);

                while self
                    .missing_nonces
                    .front()
                    .is_some_and(|&front| front < oldest_missing)
                {
                    self.missing_nonces.pop_front();
                }

                // when a lot was missed, only backfill the tail window
                for missing in oldest_missing.max(newest + 1)..big_nonce {
                    self.missing_nonces.push_back(missing);
                }

                self.newest_processed_nonce = Some(big_nonce);
            }
            Some(_) => {
                // a reordered frame arrived late; it is no longer missing
                if let Some(position) = self.missing_nonces.iter().position(|&n| n == big_nonce) {
                    self.missing_nonces.remove(position);
                }
            }
        }

        if generation <= self.newest_generation || !self.cryptors.contains_key(&generation) {
            return;
        }
        info!(generation, "promoting newest generation");
        self.newest_generation = generation;

        let expiry = Expiry::At(self.clock.now() + CRYPTOR_EXPIRY);
        for (&gen, cryptor) in self.cryptors.iter_mut() {
            if gen < self.newest_generation {
                debug!(generation = gen, "collapsing expiry of superseded cryptor");
                cryptor.expiry = cryptor.expiry.min(expiry);
            }
        }
    }

    fn make_expiring_cryptor(&mut self, generation: Generation) -> Option<ExpiringCryptor> {
        let key = self.ratchet.key(generation)?;

        // A cryptor for an out-of-order old generation is born already
        // expiring; the sender has moved on.
        let expiry = if generation < self.newest_generation {
            info!(generation, "creating cryptor for old generation");
            Expiry::At(self.clock.now() + CRYPTOR_EXPIRY)
        } else {
            info!(generation, "creating cryptor for new generation");
            Expiry::Never
        };

        Some(ExpiringCryptor {
            cryptor: Cryptor::new(&key),
            expiry,
        })
    }

    fn cleanup_expired_cryptors(&mut self) {
        let now = self.clock.now();
        self.cryptors.retain(|&generation, cryptor| {
            let expired = cryptor.expiry.is_expired(now);
            if expired {
                debug!(generation, "removing expired cryptor");
            }
            !expired
        });

        while self.oldest_generation < self.newest_generation
            && !self.cryptors.contains_key(&self.oldest_generation)
        {
            info!(
                generation = self.oldest_generation,
                "deleting key for retired generation"
            );
            self.ratchet.delete_key(self.oldest_generation);
            self.oldest_generation += 1;
        }
    }
}
