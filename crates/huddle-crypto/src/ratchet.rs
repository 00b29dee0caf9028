// Key ratchet boundary: the sole producer of per-generation keys.

use std::collections::HashSet;

use hkdf::Hkdf;
use sha2::Sha256;
use tracing::{debug, info};

use crate::{EncryptionKey, Generation, KEY_SIZE};

/// Produces the symmetric key for each ratchet generation and forgets
/// deleted generations.
///
/// Implementations sit on top of an externally agreed group secret.
/// Repeated calls for a live generation return identical bytes; deleted or
/// out-of-range generations return `None`.
pub trait KeyRatchet: Send {
    fn key(&mut self, generation: Generation) -> Option<EncryptionKey>;
    fn delete_key(&mut self, generation: Generation);
}

/// Production ratchet deriving per-generation keys from a 32-byte base
/// secret with HKDF-SHA256.
pub struct HkdfKeyRatchet {
    base_secret: [u8; 32],
    deleted: HashSet<Generation>,
}

impl HkdfKeyRatchet {
    pub fn new(base_secret: [u8; 32]) -> Self {
        Self {
            base_secret,
            deleted: HashSet::new(),
        }
    }
}

impl KeyRatchet for HkdfKeyRatchet {
    fn key(&mut self, generation: Generation) -> Option<EncryptionKey> {
        if self.deleted.contains(&generation) {
            debug!(generation, "refusing key for deleted generation");
            return None;
        }

        let hkdf = Hkdf::<Sha256>::new(None, &self.base_secret);

        // info = "k" || generation, big-endian
        let mut info = [0u8; 9];
        info[0] = b'k';
        info[1..].copy_from_slice(&generation.to_be_bytes());

        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(&info, &mut key).ok()?;
        Some(key)
    }

    fn delete_key(&mut self, generation: Generation) {
        info!(generation, "deleting key for generation");
        self.deleted.insert(generation);
    }
}
