// Outbound frame staging: codec-classified byte runs accumulate here
// before encryption and trailer assembly.

use tracing::warn;

use crate::dissect;
use crate::range::{self, Range};
use crate::Codec;

/// Accumulates the dissected form of one outbound frame.
///
/// Codec dissectors feed byte runs through [`add_unencrypted_bytes`] and
/// [`add_encrypted_bytes`] in frame order. The processor tracks where the
/// unencrypted runs sit in the final frame and keeps the two classes of
/// bytes in separate buffers, so the encrypted half can be sealed with a
/// single AEAD call using the unencrypted half as associated data.
///
/// [`add_unencrypted_bytes`]: OutboundFrameProcessor::add_unencrypted_bytes
/// [`add_encrypted_bytes`]: OutboundFrameProcessor::add_encrypted_bytes
#[derive(Debug, Default)]
pub struct OutboundFrameProcessor {
    codec: Codec,
    frame_index: usize,
    unencrypted_bytes: Vec<u8>,
    encrypted_bytes: Vec<u8>,
    ciphertext_bytes: Vec<u8>,
    unencrypted_ranges: Vec<Range>,
}

impl OutboundFrameProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all state from the previous frame, keeping allocations.
    pub fn reset(&mut self) {
        self.codec = Codec::Unknown;
        self.frame_index = 0;
        self.unencrypted_bytes.clear();
        self.encrypted_bytes.clear();
        self.unencrypted_ranges.clear();
    }

    /// Dissect `frame` according to `codec`. A dissector failure, or an
    /// unknown codec, falls back to encrypting the whole frame.
    pub fn process_frame(&mut self, frame: &[u8], codec: Codec) {
        self.reset();

        self.codec = codec;
        self.unencrypted_bytes.reserve(frame.len());
        self.encrypted_bytes.reserve(frame.len());

        let success = match codec {
            Codec::Opus => dissect::dissect_opus(self, frame),
            Codec::Vp8 => dissect::dissect_vp8(self, frame),
            Codec::Vp9 => dissect::dissect_vp9(self, frame),
            Codec::H264 => dissect::dissect_h264(self, frame),
            Codec::H265 => dissect::dissect_h265(self, frame),
            Codec::Av1 => dissect::dissect_av1(self, frame),
            Codec::Unknown => {
                warn!("no dissector for unknown codec, encrypting whole frame");
                false
            }
        };

        if !success {
            self.frame_index = 0;
            self.unencrypted_bytes.clear();
            self.encrypted_bytes.clear();
            self.unencrypted_ranges.clear();
            self.add_encrypted_bytes(frame);
        }

        self.ciphertext_bytes.resize(self.encrypted_bytes.len(), 0);
    }

    /// Rebuild the transformed frame body into `out` from the unencrypted
    /// bytes and the sealed ciphertext. Returns the number of bytes
    /// written, 0 when `out` is too small.
    pub fn reconstruct_frame(&self, out: &mut [u8]) -> usize {
        if self.unencrypted_bytes.len() + self.ciphertext_bytes.len() > out.len() {
            warn!("frame is too small to contain the encrypted frame");
            return 0;
        }

        range::reconstruct(
            &self.unencrypted_ranges,
            &self.unencrypted_bytes,
            &self.ciphertext_bytes,
            out,
        )
    }

    /// Append a run of bytes the packetizer must keep readable. Runs that
    /// touch the previous unencrypted range extend it.
    pub fn add_unencrypted_bytes(&mut self, bytes: &[u8]) {
        match self.unencrypted_ranges.last_mut() {
            Some(last) if last.offset + last.size == self.frame_index => {
                last.size += bytes.len();
            }
            _ => self.unencrypted_ranges.push(Range {
                offset: self.frame_index,
                size: bytes.len(),
            }),
        }

        self.unencrypted_bytes.extend_from_slice(bytes);
        self.frame_index += bytes.len();
    }

    /// Append a run of bytes that will be encrypted in place.
    pub fn add_encrypted_bytes(&mut self, bytes: &[u8]) {
        self.encrypted_bytes.extend_from_slice(bytes);
        self.frame_index += bytes.len();
    }

    /// Split borrows for sealing: associated data, plaintext and the
    /// ciphertext output buffer of the same length.
    pub fn seal_buffers(&mut self) -> (&[u8], &[u8], &mut [u8]) {
        (
            &self.unencrypted_bytes,
            &self.encrypted_bytes,
            &mut self.ciphertext_bytes,
        )
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn unencrypted_bytes(&self) -> &[u8] {
        &self.unencrypted_bytes
    }

    pub fn encrypted_bytes(&self) -> &[u8] {
        &self.encrypted_bytes
    }

    pub fn unencrypted_ranges(&self) -> &[Range] {
        &self.unencrypted_ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_unencrypted_runs_merge() {
        let mut processor = OutboundFrameProcessor::new();
        processor.add_unencrypted_bytes(&[1, 2]);
        processor.add_unencrypted_bytes(&[3]);
        assert_eq!(
            processor.unencrypted_ranges(),
            &[Range { offset: 0, size: 3 }]
        );

        processor.add_encrypted_bytes(&[0xEE]);
        processor.add_unencrypted_bytes(&[4, 5]);
        assert_eq!(
            processor.unencrypted_ranges(),
            &[Range { offset: 0, size: 3 }, Range { offset: 4, size: 2 }]
        );
        assert_eq!(processor.unencrypted_bytes(), &[1, 2, 3, 4, 5]);
        assert_eq!(processor.encrypted_bytes(), &[0xEE]);
    }

    #[test]
    fn unknown_codec_encrypts_whole_frame() {
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&[1, 2, 3, 4], Codec::Unknown);
        assert!(processor.unencrypted_ranges().is_empty());
        assert!(processor.unencrypted_bytes().is_empty());
        assert_eq!(processor.encrypted_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn reset_keeps_nothing_from_previous_frame() {
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&[1, 2, 3], Codec::Opus);
        processor.process_frame(&[9], Codec::Opus);
        assert_eq!(processor.encrypted_bytes(), &[9]);
        assert!(processor.unencrypted_ranges().is_empty());
    }

    #[test]
    fn reconstruct_requires_room() {
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&[1, 2, 3, 4], Codec::Opus);
        let mut small = [0u8; 2];
        assert_eq!(processor.reconstruct_frame(&mut small), 0);
    }
}
