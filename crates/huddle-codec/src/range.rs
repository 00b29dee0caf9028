// Unencrypted-range bookkeeping for the encrypted frame trailer.

use tracing::warn;

use crate::leb128;

/// A run of plaintext bytes within a reconstructed frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: usize,
    pub size: usize,
}

/// Serialized size of the range map in bytes.
pub fn ranges_size(ranges: &[Range]) -> usize {
    ranges
        .iter()
        .map(|range| leb128::size(range.offset as u64) + leb128::size(range.size as u64))
        .sum()
}

/// Serialize the range map into the start of `out`, returning the number
/// of bytes written. `out` must hold at least `ranges_size(ranges)` bytes.
pub fn serialize_ranges(ranges: &[Range], out: &mut [u8]) -> usize {
    let mut written = 0;
    for range in ranges {
        written += leb128::write(range.offset as u64, &mut out[written..]);
        written += leb128::write(range.size as u64, &mut out[written..]);
    }
    written
}

/// Deserialize a range map occupying all of `input`. Returns `None` when a
/// value is malformed or the buffer ends mid-pair.
pub fn deserialize_ranges(input: &[u8]) -> Option<Vec<Range>> {
    let mut ranges = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let Some((offset, consumed)) = leb128::read(rest) else {
            warn!("failed to deserialize unencrypted ranges");
            return None;
        };
        rest = &rest[consumed..];
        let Some((size, consumed)) = leb128::read(rest) else {
            warn!("failed to deserialize unencrypted ranges");
            return None;
        };
        rest = &rest[consumed..];
        let (Ok(offset), Ok(size)) = (usize::try_from(offset), usize::try_from(size)) else {
            warn!("unencrypted range does not fit in memory");
            return None;
        };
        ranges.push(Range { offset, size });
    }
    Some(ranges)
}

/// Check that the ranges are in order, do not overlap and stay inside
/// `frame_size`.
pub fn validate_ranges(ranges: &[Range], frame_size: usize) -> bool {
    for (i, range) in ranges.iter().enumerate() {
        // A range must not overflow into the next one, or past the end of
        // the frame if it is the last.
        let max_end = match ranges.get(i + 1) {
            Some(next) => next.offset,
            None => frame_size,
        };
        match range.offset.checked_add(range.size) {
            Some(end) if end <= max_end => {}
            _ => {
                warn!(
                    offset = range.offset,
                    size = range.size,
                    max_end,
                    frame_size,
                    "unencrypted range overlaps or is out of order"
                );
                return false;
            }
        }
    }
    true
}

/// Interleave `range_bytes` (at the positions named by `ranges`) with
/// `other_bytes` (everywhere else), writing the result into `out`. Returns
/// the number of bytes written. `out` must hold the combined length of
/// both sources.
pub fn reconstruct(
    ranges: &[Range],
    range_bytes: &[u8],
    other_bytes: &[u8],
    out: &mut [u8],
) -> usize {
    let mut frame_index = 0;
    let mut range_index = 0;
    let mut other_index = 0;

    for range in ranges {
        if range.offset > frame_index {
            let size = range.offset - frame_index;
            out[frame_index..range.offset]
                .copy_from_slice(&other_bytes[other_index..other_index + size]);
            other_index += size;
            frame_index = range.offset;
        }

        out[frame_index..frame_index + range.size]
            .copy_from_slice(&range_bytes[range_index..range_index + range.size]);
        range_index += range.size;
        frame_index += range.size;
    }

    if other_index < other_bytes.len() {
        let size = other_bytes.len() - other_index;
        out[frame_index..frame_index + size].copy_from_slice(&other_bytes[other_index..]);
        frame_index += size;
    }

    debug_assert_eq!(range_index, range_bytes.len());
    frame_index
}
