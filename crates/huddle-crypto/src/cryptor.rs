// AES-128-GCM with the 8-byte truncated tag used on the wire.
//
// The aes-gcm crate only accepts 12..16-byte tags, so the construction is
// assembled from the same primitives that crate is built on: the AES block
// cipher for the 32-bit big-endian counter keystream and GHASH for the tag
// (NIST SP 800-38D). Tag comparison is constant time; the tag is verified
// over the ciphertext before anything is decrypted.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use ghash::{universal_hash::UniversalHash, GHash};
use subtle::ConstantTimeEq;
use thiserror::Error;

use huddle_codec::TRUNCATED_TAG_SIZE;

use crate::{EncryptionKey, NONCE_SIZE};

const BLOCK_SIZE: usize = 16;

/// Authentication failure opening a sealed frame.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("frame authentication failed")]
pub struct AuthError;

/// Reusable AEAD context bound to one generation's key.
pub struct Cryptor {
    cipher: Aes128,
    ghash: GHash,
}

impl Cryptor {
    /// Build a cryptor from a 16-byte generation key.
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes128::new(GenericArray::from_slice(key));

        // GHASH key H = E_K(0^128)
        let mut ghash_key = ghash::Key::default();
        cipher.encrypt_block(&mut ghash_key);
        let ghash = GHash::new(&ghash_key);

        Self { cipher, ghash }
    }

    /// Seal `plaintext` into `ciphertext` (same length), authenticating
    /// `aad`, and write the truncated tag.
    pub fn seal(
        &self,
        ciphertext: &mut [u8],
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        tag: &mut [u8; TRUNCATED_TAG_SIZE],
    ) {
        debug_assert_eq!(ciphertext.len(), plaintext.len());

        let j0 = j0(nonce);
        ciphertext.copy_from_slice(plaintext);
        self.apply_keystream(j0, ciphertext);

        let full_tag = self.compute_tag(j0, ciphertext, aad);
        tag.copy_from_slice(&full_tag[..TRUNCATED_TAG_SIZE]);
    }

    /// Open `ciphertext` into `plaintext` (same length) after verifying
    /// the truncated tag over the ciphertext and `aad`.
    pub fn open(
        &self,
        plaintext: &mut [u8],
        ciphertext: &[u8],
        tag: &[u8; TRUNCATED_TAG_SIZE],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
    ) -> Result<(), AuthError> {
        debug_assert_eq!(plaintext.len(), ciphertext.len());

        let j0 = j0(nonce);
        let expected = self.compute_tag(j0, ciphertext, aad);
        if expected[..TRUNCATED_TAG_SIZE].ct_eq(tag).unwrap_u8() == 0 {
            return Err(AuthError);
        }

        plaintext.copy_from_slice(ciphertext);
        self.apply_keystream(j0, plaintext);
        Ok(())
    }

    /// XOR the counter-mode keystream (counter blocks following `j0`)
    /// into `buf`.
    fn apply_keystream(&self, j0: [u8; BLOCK_SIZE], buf: &mut [u8]) {
        let mut counter = j0;
        for chunk in buf.chunks_mut(BLOCK_SIZE) {
            inc32(&mut counter);
            let keystream = self.encrypt_block(counter);
            for (byte, key) in chunk.iter_mut().zip(keystream.iter()) {
                *byte ^= key;
            }
        }
    }

    /// GHASH over the associated data and ciphertext, masked with E_K(J0).
    fn compute_tag(&self, j0: [u8; BLOCK_SIZE], ciphertext: &[u8], aad: &[u8]) -> [u8; BLOCK_SIZE] {
        let mut ghash = self.ghash.clone();
        ghash.update_padded(aad);
        ghash.update_padded(ciphertext);

        let mut len_block = [0u8; BLOCK_SIZE];
        len_block[..8].copy_from_slice(&((aad.len() as u64) * 8).to_be_bytes());
        len_block[8..].copy_from_slice(&((ciphertext.len() as u64) * 8).to_be_bytes());
        ghash.update_padded(&len_block);

        let mut tag: [u8; BLOCK_SIZE] = ghash.finalize().into();
        let mask = self.encrypt_block(j0);
        for (byte, mask_byte) in tag.iter_mut().zip(mask.iter()) {
            *byte ^= mask_byte;
        }
        tag
    }

    fn encrypt_block(&self, block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut block = GenericArray::from(block);
        self.cipher.encrypt_block(&mut block);
        block.into()
    }
}

/// Initial counter block for a 96-bit nonce: nonce || 0x00000001.
fn j0(nonce: &[u8; NONCE_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[..NONCE_SIZE].copy_from_slice(nonce);
    block[BLOCK_SIZE - 1] = 1;
    block
}

/// Increment the last 32 bits of the counter block, big-endian, wrapping.
fn inc32(block: &mut [u8; BLOCK_SIZE]) {
    let counter = u32::from_be_bytes([block[12], block[13], block[14], block[15]]);
    block[12..].copy_from_slice(&counter.wrapping_add(1).to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::{Aead, KeyInit as _, Payload};
    use aes_gcm::{Aes128Gcm, Nonce};

    fn static_key(user_id: &str) -> EncryptionKey {
        let id: u64 = user_id.parse().unwrap();
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&id.to_le_bytes());
        key[8..].copy_from_slice(&id.to_le_bytes());
        key
    }

    #[test]
    fn seal_open_round_trip() {
        let cryptor = Cryptor::new(&static_key("12345678901234567890"));

        let plaintext = vec![0u8; 1024];
        let aad = vec![0u8; 1024];
        let nonce = [0u8; NONCE_SIZE];
        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut tag = [0u8; TRUNCATED_TAG_SIZE];

        cryptor.seal(&mut ciphertext, &plaintext, &nonce, &aad, &mut tag);
        assert_ne!(ciphertext, plaintext);

        let mut opened = vec![0u8; ciphertext.len()];
        cryptor
            .open(&mut opened, &ciphertext, &tag, &nonce, &aad)
            .expect("authentic frame opens");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampered_aad_fails_authentication() {
        let cryptor = Cryptor::new(&static_key("12345678901234567890"));

        let plaintext = vec![0u8; 1024];
        let mut aad = vec![0u8; 1024];
        let nonce = [0u8; NONCE_SIZE];
        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut tag = [0u8; TRUNCATED_TAG_SIZE];

        cryptor.seal(&mut ciphertext, &plaintext, &nonce, &aad, &mut tag);

        aad[0] = 1;
        let mut opened = vec![0u8; ciphertext.len()];
        assert_eq!(
            cryptor.open(&mut opened, &ciphertext, &tag, &nonce, &aad),
            Err(AuthError)
        );
    }

    #[test]
    fn tampered_tag_fails_authentication() {
        let cryptor = Cryptor::new(&static_key("12345678901234567890"));

        let plaintext = b"frame payload";
        let nonce = [7u8; NONCE_SIZE];
        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut tag = [0u8; TRUNCATED_TAG_SIZE];

        cryptor.seal(&mut ciphertext, plaintext, &nonce, b"", &mut tag);

        tag[3] ^= 0x80;
        let mut opened = vec![0u8; ciphertext.len()];
        assert_eq!(
            cryptor.open(&mut opened, &ciphertext, &tag, &nonce, b""),
            Err(AuthError)
        );
    }

    #[test]
    fn distinct_keys_produce_distinct_ciphertexts() {
        let cryptor1 = Cryptor::new(&static_key("12345678901234567890"));
        let cryptor2 = Cryptor::new(&static_key("9876543210987654321"));

        let plaintext = vec![0u8; 1024];
        let nonce = [0u8; NONCE_SIZE];
        let mut ciphertext1 = vec![0u8; plaintext.len()];
        let mut ciphertext2 = vec![0u8; plaintext.len()];
        let mut tag = [0u8; TRUNCATED_TAG_SIZE];

        cryptor1.seal(&mut ciphertext1, &plaintext, &nonce, b"", &mut tag);
        cryptor2.seal(&mut ciphertext2, &plaintext, &nonce, b"", &mut tag);

        assert_ne!(ciphertext1, ciphertext2);
    }

    #[test]
    fn distinct_nonces_produce_distinct_ciphertexts() {
        let cryptor = Cryptor::new(&static_key("12345678901234567890"));

        let plaintext = vec![0u8; 1024];
        let nonce1 = [0u8; NONCE_SIZE];
        let nonce2 = [1u8; NONCE_SIZE];
        let mut ciphertext1 = vec![0u8; plaintext.len()];
        let mut ciphertext2 = vec![0u8; plaintext.len()];
        let mut tag = [0u8; TRUNCATED_TAG_SIZE];

        cryptor.seal(&mut ciphertext1, &plaintext, &nonce1, b"", &mut tag);
        cryptor.seal(&mut ciphertext2, &plaintext, &nonce2, b"", &mut tag);

        assert_ne!(ciphertext1, ciphertext2);
    }

    #[test]
    fn empty_plaintext_still_authenticates_aad() {
        let cryptor = Cryptor::new(&static_key("12345678901234567890"));

        let nonce = [3u8; NONCE_SIZE];
        let mut tag = [0u8; TRUNCATED_TAG_SIZE];
        cryptor.seal(&mut [], &[], &nonce, b"header", &mut tag);

        assert!(cryptor.open(&mut [], &[], &tag, &nonce, b"header").is_ok());
        assert_eq!(cryptor.open(&mut [], &[], &tag, &nonce, b"other"), Err(AuthError));
    }

    /// The construction must match AES-128-GCM exactly: same ciphertext,
    /// and a tag equal to the first eight bytes of the full GCM tag.
    #[test]
    fn matches_aes_gcm_with_truncated_tag() {
        let key = static_key("12345678901234567890");
        let cryptor = Cryptor::new(&key);

        let plaintext: Vec<u8> = (0..100u8).collect();
        let aad = b"associated data";
        let nonce_bytes = [0x42u8; NONCE_SIZE];

        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut tag = [0u8; TRUNCATED_TAG_SIZE];
        cryptor.seal(&mut ciphertext, &plaintext, &nonce_bytes, aad, &mut tag);

        let reference = Aes128Gcm::new_from_slice(&key).unwrap();
        let sealed = reference
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &plaintext,
                    aad,
                },
            )
            .unwrap();
        let (reference_ciphertext, reference_tag) = sealed.split_at(plaintext.len());

        assert_eq!(ciphertext, reference_ciphertext);
        assert_eq!(tag, reference_tag[..TRUNCATED_TAG_SIZE]);
    }
}
