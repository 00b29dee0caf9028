// Inbound frame parsing: trailer validation and body splitting.

use tracing::warn;

use crate::range::{self, Range};
use crate::{leb128, TruncatedNonce, MAGIC_MARKER, SUPPLEMENTAL_OVERHEAD, TRUNCATED_TAG_SIZE};

/// Parses one received frame into its authenticated and encrypted parts.
///
/// A failed parse leaves the processor with `is_encrypted() == false`; the
/// decryptor then decides whether passthrough policy lets the frame
/// through unmodified.
#[derive(Debug, Default)]
pub struct InboundFrameProcessor {
    is_encrypted: bool,
    original_size: usize,
    tag: [u8; TRUNCATED_TAG_SIZE],
    truncated_nonce: TruncatedNonce,
    unencrypted_ranges: Vec<Range>,
    authenticated: Vec<u8>,
    ciphertext: Vec<u8>,
    plaintext: Vec<u8>,
}

impl InboundFrameProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all state from the previous frame, keeping allocations.
    pub fn clear(&mut self) {
        self.is_encrypted = false;
        self.original_size = 0;
        self.tag = [0; TRUNCATED_TAG_SIZE];
        self.truncated_nonce = TruncatedNonce::MAX;
        self.unencrypted_ranges.clear();
        self.authenticated.clear();
        self.ciphertext.clear();
        self.plaintext.clear();
    }

    /// Validate the trailer of `frame` and split the body into
    /// authenticated and ciphertext bytes. Any validation failure leaves
    /// the frame classified as unencrypted.
    pub fn parse_frame(&mut self, frame: &[u8]) {
        self.clear();

        if frame.len() < SUPPLEMENTAL_OVERHEAD {
            warn!("encrypted frame is too small to contain min supplemental bytes");
            return;
        }

        // The frame must end with the magic marker.
        let marker = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
        if marker != MAGIC_MARKER {
            return;
        }

        // Preceded by the one-byte supplemental section size.
        let supplemental_size = usize::from(frame[frame.len() - 3]);
        if frame.len() < supplemental_size {
            warn!("encrypted frame is too small to contain supplemental bytes");
            return;
        }
        if supplemental_size < SUPPLEMENTAL_OVERHEAD {
            warn!("supplemental bytes size is too small to contain supplemental bytes");
            return;
        }

        // Tag, then the LEB128 truncated nonce.
        let supplemental = &frame[frame.len() - supplemental_size..frame.len() - 3];
        self.tag.copy_from_slice(&supplemental[..TRUNCATED_TAG_SIZE]);

        let nonce_and_ranges = &supplemental[TRUNCATED_TAG_SIZE..];
        let Some((nonce, nonce_size)) = leb128::read(nonce_and_ranges) else {
            warn!("failed to read truncated nonce");
            return;
        };
        let Ok(nonce) = TruncatedNonce::try_from(nonce) else {
            warn!(nonce, "truncated nonce does not fit in 32 bits");
            return;
        };
        self.truncated_nonce = nonce;

        // What remains before the supplemental-size byte is the range map.
        let Some(ranges) = range::deserialize_ranges(&nonce_and_ranges[nonce_size..]) else {
            return;
        };

        let body_size = frame.len() - supplemental_size;
        if !range::validate_ranges(&ranges, body_size) {
            warn!("invalid unencrypted ranges");
            return;
        }
        self.unencrypted_ranges = ranges;

        self.authenticated.reserve(frame.len());
        self.ciphertext.reserve(frame.len());
        self.original_size = frame.len();

        // Split the body into authenticated and ciphertext bytes.
        let mut frame_index = 0;
        for range in &self.unencrypted_ranges {
            if range.offset > frame_index {
                self.ciphertext
                    .extend_from_slice(&frame[frame_index..range.offset]);
            }
            self.authenticated
                .extend_from_slice(&frame[range.offset..range.offset + range.size]);
            frame_index = range.offset + range.size;
        }
        if frame_index < body_size {
            self.ciphertext.extend_from_slice(&frame[frame_index..body_size]);
        }

        // Stage a plaintext buffer of the same size as the ciphertext.
        self.plaintext.resize(self.ciphertext.len(), 0);

        self.is_encrypted = true;
    }

    /// Rebuild the plaintext frame into `out`. Returns the number of bytes
    /// written, 0 when the frame never parsed or `out` is too small.
    pub fn reconstruct_frame(&self, out: &mut [u8]) -> usize {
        if !self.is_encrypted {
            warn!("cannot reconstruct an invalid encrypted frame");
            return 0;
        }

        if self.decrypted_size() > out.len() {
            warn!("frame is too small to contain the decrypted frame");
            return 0;
        }

        range::reconstruct(&self.unencrypted_ranges, &self.authenticated, &self.plaintext, out)
    }

    /// Split borrows for opening: associated data, ciphertext and the
    /// plaintext output buffer of the same length.
    pub fn open_buffers(&mut self) -> (&[u8], &[u8], &mut [u8]) {
        (&self.authenticated, &self.ciphertext, &mut self.plaintext)
    }

    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    /// Size of the frame as received, trailer included.
    pub fn size(&self) -> usize {
        self.original_size
    }

    /// Size of the reconstructed plaintext frame.
    pub fn decrypted_size(&self) -> usize {
        self.authenticated.len() + self.plaintext.len()
    }

    pub fn tag(&self) -> &[u8; TRUNCATED_TAG_SIZE] {
        &self.tag
    }

    pub fn truncated_nonce(&self) -> TruncatedNonce {
        self.truncated_nonce
    }

    pub fn authenticated_data(&self) -> &[u8] {
        &self.authenticated
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn plaintext_mut(&mut self) -> &mut [u8] {
        &mut self.plaintext
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_hex(s: &str) -> Vec<u8> {
        let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    // 76 payload bytes, 8 zero tag bytes, nonce 0, four (offset, size)
    // range pairs, supplemental size 0x14 = 20, marker.
    const SPLIT_FIXTURE: &str = "0dc5aedd5bdc3f20be5697e54dd1f437b896a36f858c6f20bbd69e2a493ca170c4f0c1b9acd4\
         9d324b92afa788d09b12b29115a2feb3552b60fff983234a6c9608af3933683efc6b0f5579a9\
         0000000000000000 00 000a 140a 280a 3c0a 14 fafa";

    #[test]
    fn split_and_reconstruct_round_trips() {
        let frame = from_hex(SPLIT_FIXTURE);

        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&frame);
        assert!(processor.is_encrypted());
        assert_eq!(processor.truncated_nonce(), 0);
        assert_eq!(processor.decrypted_size(), 76);

        // Copy the ciphertext over the staged plaintext; reconstruction
        // must then reproduce the original body exactly.
        let ciphertext = processor.ciphertext().to_vec();
        processor.plaintext_mut().copy_from_slice(&ciphertext);

        let mut out = vec![0u8; 76];
        let written = processor.reconstruct_frame(&mut out);
        assert_eq!(written, 76);
        assert_eq!(out, frame[..76]);
    }

    #[test]
    fn parses_ranges_from_trailer() {
        let frame = from_hex(SPLIT_FIXTURE);

        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&frame);
        assert_eq!(
            processor.unencrypted_ranges,
            vec![
                Range { offset: 0, size: 10 },
                Range { offset: 20, size: 10 },
                Range { offset: 40, size: 10 },
                Range { offset: 60, size: 10 },
            ]
        );
        assert_eq!(processor.authenticated_data().len(), 40);
        assert_eq!(processor.ciphertext().len(), 36);
    }

    #[test]
    fn too_small_frame_is_not_encrypted() {
        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&[0xFA, 0xFA]);
        assert!(!processor.is_encrypted());
    }

    #[test]
    fn missing_marker_is_not_encrypted() {
        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&[0u8; 32]);
        assert!(!processor.is_encrypted());
    }

    #[test]
    fn undersized_supplemental_byte_is_rejected() {
        // Marker present but the supplemental size byte is below the fixed
        // trailer overhead.
        let mut frame = vec![0u8; 16];
        let len = frame.len();
        frame[len - 3] = 0x05;
        frame[len - 2] = 0xFA;
        frame[len - 1] = 0xFA;

        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&frame);
        assert!(!processor.is_encrypted());
    }

    #[test]
    fn supplemental_larger_than_frame_is_rejected() {
        let mut frame = vec![0u8; 16];
        let len = frame.len();
        frame[len - 3] = 0xFF;
        frame[len - 2] = 0xFA;
        frame[len - 1] = 0xFA;

        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&frame);
        assert!(!processor.is_encrypted());
    }

    #[test]
    fn range_reaching_into_trailer_is_rejected() {
        // One range (0, 70) against a 12-byte body: trailer is 8-byte tag,
        // 1-byte nonce, pair (0, 70), size byte, marker.
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&[0u8; 8]);
        frame.push(0x00);
        frame.extend_from_slice(&[0x00, 70]);
        frame.push(8 + 1 + 2 + 1 + 2);
        frame.extend_from_slice(&[0xFA, 0xFA]);

        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&frame);
        assert!(!processor.is_encrypted());
    }

    #[test]
    fn oversized_nonce_is_rejected() {
        // Five LEB128 bytes encoding a value beyond 32 bits.
        let mut frame = vec![0u8; 12];
        frame.extend_from_slice(&[0u8; 8]);
        frame.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);
        frame.push(8 + 5 + 1 + 2);
        frame.extend_from_slice(&[0xFA, 0xFA]);

        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&frame);
        assert!(!processor.is_encrypted());
    }

    #[test]
    fn clear_resets_classification() {
        let frame = from_hex(SPLIT_FIXTURE);
        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&frame);
        assert!(processor.is_encrypted());

        processor.clear();
        assert!(!processor.is_encrypted());
        assert_eq!(processor.decrypted_size(), 0);
    }
}
