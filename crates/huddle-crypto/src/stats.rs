// Per-media operation counters.

/// Counters the encryptor keeps per media type.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptStats {
    /// Frames forwarded unmodified in passthrough mode.
    pub passthrough_count: u64,
    /// Frames encrypted successfully.
    pub success_count: u64,
    /// Frames that could not be encrypted.
    pub failure_count: u64,
    /// Accumulated encryption time in microseconds.
    pub duration_micros: u64,
    /// Seal attempts, including ciphertext-validation retries.
    pub attempts: u64,
    /// Largest number of attempts a single frame needed.
    pub max_attempts: u64,
}

/// Counters the decryptor keeps per media type.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecryptStats {
    /// Unencrypted frames forwarded under the passthrough policy.
    pub passthrough_count: u64,
    /// Frames decrypted successfully.
    pub success_count: u64,
    /// Frames no ratchet could authenticate.
    pub failure_count: u64,
    /// Accumulated decryption time in microseconds.
    pub duration_micros: u64,
    /// AEAD opens attempted across all ratchets.
    pub attempts: u64,
}
