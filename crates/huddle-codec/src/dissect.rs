// Codec-aware frame dissection. Each dissector splits a frame into runs
// the RTP packetizer must still be able to read and runs that may be
// encrypted, feeding them to an OutboundFrameProcessor in frame order.
//
// The unencrypted header sizes follow what the WebRTC packetizers and
// depacketizers actually read; see rtp_format_h264.cc,
// video_rtp_depacketizer_h264.cc, rtp_format_h265.cc and
// rtp_packetizer_av1.cc in the WebRTC tree.

use tracing::warn;

use crate::leb128;
use crate::outbound::OutboundFrameProcessor;
use crate::Codec;

/// Annex-B long start code written in front of every NAL unit; the
/// receive side normalizes all start codes to four bytes anyway.
const NALU_LONG_START_CODE: [u8; 4] = [0, 0, 0, 1];
/// Length of the short start code `{0, 0, 1}`.
const NALU_SHORT_START_SEQUENCE_SIZE: usize = 3;

const H264_NAL_HEADER_TYPE_MASK: u8 = 0x1F;
const H264_NAL_TYPE_SLICE: u8 = 1;
const H264_NAL_TYPE_IDR: u8 = 5;
const H264_NAL_UNIT_HEADER_SIZE: usize = 1;

const H265_NAL_HEADER_TYPE_MASK: u8 = 0x7E;
const H265_NAL_TYPE_VCL_CUTOFF: u8 = 32;
const H265_NAL_UNIT_HEADER_SIZE: usize = 2;

const VP8_KEY_FRAME_UNENCRYPTED_BYTES: usize = 10;
const VP8_DELTA_FRAME_UNENCRYPTED_BYTES: usize = 1;

const AV1_OBU_HEADER_HAS_EXTENSION_MASK: u8 = 0b0_0000_100;
const AV1_OBU_HEADER_HAS_SIZE_MASK: u8 = 0b0_0000_010;
const AV1_OBU_HEADER_TYPE_MASK: u8 = 0b0_1111_000;
const OBU_TYPE_TEMPORAL_DELIMITER: u8 = 2;
const OBU_TYPE_TILE_LIST: u8 = 8;
const OBU_TYPE_PADDING: u8 = 15;
const OBU_EXTENSION_SIZE: usize = 1;

/// Find the next 3- or 4-byte Annex-B start code at or after
/// `search_start`. Returns the index of the NAL unit following the start
/// code, together with the start code length.
fn find_next_nalu(buffer: &[u8], search_start: usize) -> Option<(usize, usize)> {
    if buffer.len() < NALU_SHORT_START_SEQUENCE_SIZE {
        return None;
    }

    let mut i = search_start;
    while i < buffer.len() - NALU_SHORT_START_SEQUENCE_SIZE {
        if buffer[i + 2] > 1 {
            // third byte is neither 0 nor 1, cannot be part of a start code
            i += NALU_SHORT_START_SEQUENCE_SIZE;
        } else if buffer[i + 2] == 1 {
            if buffer[i + 1] == 0 && buffer[i] == 0 {
                // confirmed start sequence {0, 0, 1}
                let nal_unit_start = i + NALU_SHORT_START_SEQUENCE_SIZE;
                if i >= 1 && buffer[i - 1] == 0 {
                    return Some((nal_unit_start, 4));
                }
                return Some((nal_unit_start, 3));
            }
            i += NALU_SHORT_START_SEQUENCE_SIZE;
        } else {
            // third byte is 0, might be inside a four byte start code
            i += 1;
        }
    }

    None
}

/// Number of payload bytes covering the first three exponential-Golomb
/// values of a slice header (first_mb_in_slice, slice_type,
/// pic_parameter_set_id), honoring RBSP emulation-prevention bytes. The
/// depacketizer needs the PPS id readable. Returns 0 on a malformed
/// header.
fn bytes_covering_h264_pps(payload: &[u8]) -> usize {
    const EMULATION_PREVENTION_BYTE: u8 = 0x03;

    let mut bit_index = 0usize;
    let mut zero_bit_count = 0usize;
    let mut parsed_exp_golomb_values = 0;

    while bit_index < payload.len() * 8 && parsed_exp_golomb_values < 3 {
        let bit = bit_index % 8;
        let byte_index = bit_index / 8;
        let payload_byte = payload[byte_index];

        // when starting a new byte, skip over emulation prevention bytes
        if bit == 0
            && byte_index >= 2
            && payload_byte == EMULATION_PREVENTION_BYTE
            && payload[byte_index - 1] == 0
            && payload[byte_index - 2] == 0
        {
            bit_index += 8;
            continue;
        }

        if payload_byte & (1 << (7 - bit)) == 0 {
            // still in the run of leading zero bits
            zero_bit_count += 1;
            bit_index += 1;

            if zero_bit_count >= 32 {
                warn!("unexpectedly large exponential golomb value in slice header");
                return 0;
            }
        } else {
            // hit a one, skip forward the number of bits given by the
            // leading zeroes
            parsed_exp_golomb_values += 1;
            bit_index += 1 + zero_bit_count;
            zero_bit_count = 0;
        }
    }

    // bytes covering the last exp golomb encoded value
    bit_index / 8 + 1
}

pub(crate) fn dissect_opus(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    // Opus frames carry no structure the packetizer needs to read.
    processor.add_encrypted_bytes(frame);
    true
}

pub(crate) fn dissect_vp8(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    // The first payload byte carries the inverse key frame flag
    // (RFC 7741 section 4.3). The depacketizer reads ten bytes into a key
    // frame header but only the flag byte of a delta frame.
    if frame.is_empty() {
        warn!("VP8 frame is too small to contain a payload header");
        return false;
    }

    let unencrypted = if frame[0] & 0x01 == 0 {
        VP8_KEY_FRAME_UNENCRYPTED_BYTES
    } else {
        VP8_DELTA_FRAME_UNENCRYPTED_BYTES
    };
    if frame.len() < unencrypted {
        warn!(size = frame.len(), "VP8 frame is too small to contain its header");
        return false;
    }

    processor.add_unencrypted_bytes(&frame[..unencrypted]);
    processor.add_encrypted_bytes(&frame[unencrypted..]);
    true
}

pub(crate) fn dissect_vp9(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    // The VP9 payload descriptor lives in the RTP packet, not the frame,
    // and carries everything the depacketizer needs.
    processor.add_encrypted_bytes(frame);
    true
}

pub(crate) fn dissect_h264(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    // The frame can be packetized as STAP-A or FU-A, so the packetizer
    // reads into the first NAL units; walk all of them and keep readable
    // what it needs.
    if frame.len() < NALU_SHORT_START_SEQUENCE_SIZE + H264_NAL_UNIT_HEADER_SIZE {
        warn!(size = frame.len(), "H264 frame is too small to contain a NAL unit");
        return false;
    }

    let mut nalu = find_next_nalu(frame, 0);
    while let Some((nal_unit_start, _)) = nalu {
        if nal_unit_start >= frame.len() - 1 {
            break;
        }

        let nal_type = frame[nal_unit_start] & H264_NAL_HEADER_TYPE_MASK;

        processor.add_unencrypted_bytes(&NALU_LONG_START_CODE);

        let next_nalu = find_next_nalu(frame, nal_unit_start);
        let next_nalu_start = match next_nalu {
            Some((start, start_code_size)) => start - start_code_size,
            None => frame.len(),
        };

        if nal_type == H264_NAL_TYPE_SLICE || nal_type == H264_NAL_TYPE_IDR {
            // a slice only has to stay readable up to the PPS id
            let payload_start = nal_unit_start + H264_NAL_UNIT_HEADER_SIZE;
            let pps_bytes = bytes_covering_h264_pps(&frame[payload_start..]);
            let unencrypted =
                (H264_NAL_UNIT_HEADER_SIZE + pps_bytes).min(next_nalu_start - nal_unit_start);

            processor.add_unencrypted_bytes(&frame[nal_unit_start..nal_unit_start + unencrypted]);
            processor.add_encrypted_bytes(&frame[nal_unit_start + unencrypted..next_nalu_start]);
        } else {
            // SPS, PPS, SEI and friends stay fully readable
            processor.add_unencrypted_bytes(&frame[nal_unit_start..next_nalu_start]);
        }

        nalu = next_nalu;
    }

    true
}

pub(crate) fn dissect_h265(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    if frame.len() < NALU_SHORT_START_SEQUENCE_SIZE + H265_NAL_UNIT_HEADER_SIZE {
        warn!(size = frame.len(), "H265 frame is too small to contain a NAL unit");
        return false;
    }

    let mut nalu = find_next_nalu(frame, 0);
    while let Some((nal_unit_start, _)) = nalu {
        if nal_unit_start >= frame.len() - 1 {
            break;
        }

        let nal_type = (frame[nal_unit_start] & H265_NAL_HEADER_TYPE_MASK) >> 1;

        processor.add_unencrypted_bytes(&NALU_LONG_START_CODE);

        let next_nalu = find_next_nalu(frame, nal_unit_start);
        let next_nalu_start = match next_nalu {
            Some((start, start_code_size)) => start - start_code_size,
            None => frame.len(),
        };

        if nal_type < H265_NAL_TYPE_VCL_CUTOFF {
            // a VCL NAL only needs its two header bytes readable
            let unencrypted = H265_NAL_UNIT_HEADER_SIZE.min(next_nalu_start - nal_unit_start);
            processor.add_unencrypted_bytes(&frame[nal_unit_start..nal_unit_start + unencrypted]);
            processor.add_encrypted_bytes(&frame[nal_unit_start + unencrypted..next_nalu_start]);
        } else {
            // parameter sets and SEI stay fully readable
            processor.add_unencrypted_bytes(&frame[nal_unit_start..next_nalu_start]);
        }

        nalu = next_nalu;
    }

    true
}

pub(crate) fn dissect_av1(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    let mut i = 0;
    while i < frame.len() {
        let obu_header_index = i;
        let mut obu_header = frame[obu_header_index];
        i += 1;

        let obu_has_extension = obu_header & AV1_OBU_HEADER_HAS_EXTENSION_MASK != 0;
        let obu_has_size = obu_header & AV1_OBU_HEADER_HAS_SIZE_MASK != 0;
        let obu_type = (obu_header & AV1_OBU_HEADER_TYPE_MASK) >> 3;

        if obu_has_extension {
            i += OBU_EXTENSION_SIZE;
        }

        if i >= frame.len() {
            warn!("malformed AV1 frame: header overflows frame");
            return false;
        }

        let obu_payload_size = if obu_has_size {
            let Some((size, consumed)) = leb128::read(&frame[i..]) else {
                warn!("malformed AV1 frame: invalid LEB128 size");
                return false;
            };
            i += consumed;
            size
        } else {
            // without a size field the OBU extends to the end of the frame
            (frame.len() - i) as u64
        };

        if obu_payload_size > (frame.len() - i) as u64 {
            warn!("malformed AV1 frame: payload overflows frame");
            return false;
        }
        let obu_payload_size = obu_payload_size as usize;

        let obu_payload_index = i;
        i += obu_payload_size;

        // OBUs the packetizer drops are not carried over.
        if obu_type == OBU_TYPE_TEMPORAL_DELIMITER
            || obu_type == OBU_TYPE_TILE_LIST
            || obu_type == OBU_TYPE_PADDING
        {
            continue;
        }

        // When this is the last OBU, clear the "has size" bit so the
        // trailer can be appended to the frame.
        let mut rewritten_without_size = false;
        if i == frame.len() && obu_has_size {
            obu_header &= !AV1_OBU_HEADER_HAS_SIZE_MASK;
            rewritten_without_size = true;
        }

        processor.add_unencrypted_bytes(&[obu_header]);
        if obu_has_extension {
            processor.add_unencrypted_bytes(
                &frame[obu_header_index + 1..obu_header_index + 1 + OBU_EXTENSION_SIZE],
            );
        }

        if obu_has_size && !rewritten_without_size {
            // Some encoders pad LEB128 sizes with a zero byte which the
            // packetizer strips; re-encode the size so the frame survives
            // packetization unchanged.
            let mut buffer = [0u8; leb128::MAX_SIZE];
            let written = leb128::write(obu_payload_size as u64, &mut buffer);
            processor.add_unencrypted_bytes(&buffer[..written]);
        }

        processor.add_encrypted_bytes(&frame[obu_payload_index..obu_payload_index + obu_payload_size]);
    }

    true
}

/// Check that no encrypted run in the final `frame` contains an Annex-B
/// start code near a range boundary. The H.26x depacketizers key on start
/// codes, and one inside ciphertext would shift the frame on the receive
/// side and break decryption. The caller re-encrypts with a fresh nonce on
/// failure. Always passes for codecs without start codes.
pub fn validate_encrypted_frame(processor: &OutboundFrameProcessor, frame: &[u8]) -> bool {
    let codec = processor.codec();
    if codec != Codec::H264 && codec != Codec::H265 {
        return true;
    }

    // a start code can straddle the boundary between an unencrypted range
    // and a ciphertext run
    const PADDING: usize = NALU_SHORT_START_SEQUENCE_SIZE - 1;

    let unencrypted_ranges = processor.unencrypted_ranges();

    let mut encrypted_section_start = 0;
    for range in unencrypted_ranges {
        if encrypted_section_start == range.offset {
            encrypted_section_start = range.offset + range.size;
            continue;
        }

        let start = encrypted_section_start - encrypted_section_start.min(PADDING);
        let end = (range.offset + PADDING).min(frame.len());
        if find_next_nalu(&frame[start..end], 0).is_some() {
            return false;
        }

        encrypted_section_start = range.offset + range.size;
    }

    if encrypted_section_start == frame.len() {
        return true;
    }

    let start = encrypted_section_start - encrypted_section_start.min(PADDING);
    find_next_nalu(&frame[start..], 0).is_none()
}
