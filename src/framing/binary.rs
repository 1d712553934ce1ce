//! Varint length-prefixed binary framing.
//!
//! ```text
//! [len0|1][len1|1]...[lenN|0] [payload]
//!   7 data bits per byte, least significant group first,
//!   high bit set on every byte except the last
//! ```
//!
//! The prefix is capped at five bytes; the fifth byte may only carry three
//! data bits so the length always fits in 31 bits.

use bytes::{BufMut, BytesMut};

use super::{FrameError, ParsedFrame};
use crate::constants::MAX_LENGTH_PREFIX_SIZE;

/// Append `payload` to `out` with its varint length prefix.
pub fn write_frame(payload: &[u8], out: &mut BytesMut) {
    out.reserve(MAX_LENGTH_PREFIX_SIZE + payload.len());
    write_length_prefix(payload.len(), out);
    out.put_slice(payload);
}

/// Encode `length` as a varint into `out`.
pub fn write_length_prefix(mut length: usize, out: &mut BytesMut) {
    loop {
        let mut byte = (length & 0x7f) as u8;
        length >>= 7;
        if length > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if length == 0 {
            break;
        }
    }
}

/// Number of bytes `write_length_prefix` produces for `length`.
pub fn length_prefix_size(length: usize) -> usize {
    let mut size = 1;
    let mut rest = length >> 7;
    while rest > 0 {
        size += 1;
        rest >>= 7;
    }
    size
}

/// Outcome of decoding a length prefix.
enum Prefix {
    /// Not enough bytes to finish the prefix.
    Incomplete,
    /// Decoded `length`, prefix occupied `size` bytes.
    Complete { length: usize, size: usize },
}

/// Decode a varint prefix from any byte iterator.
///
/// Works over contiguous and segmented buffers alike.
fn read_length_prefix(bytes: impl Iterator<Item = u8>) -> Result<Prefix, FrameError> {
    let mut length: u64 = 0;
    let mut size = 0;

    for byte in bytes {
        let shift = 7 * size;
        size += 1;

        if size == MAX_LENGTH_PREFIX_SIZE && byte > 0x07 {
            // Continuation bit or more than 31 bits of length.
            return Err(FrameError::MalformedLength);
        }

        length |= u64::from(byte & 0x7f) << shift;

        if byte & 0x80 == 0 {
            return Ok(Prefix::Complete {
                length: length as usize,
                size,
            });
        }
    }

    Ok(Prefix::Incomplete)
}

fn check_size(length: usize, max_size: usize) -> Result<(), FrameError> {
    if length > max_size {
        return Err(FrameError::TooLarge {
            length: length as u64,
            max: max_size,
        });
    }
    Ok(())
}

/// Try to parse one binary frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds an incomplete prefix or body.
///
/// # Errors
///
/// Returns [`FrameError::MalformedLength`] for an over-long prefix and
/// [`FrameError::TooLarge`] when the declared length exceeds `max_size`.
pub fn try_parse(buf: &[u8], max_size: usize) -> Result<Option<ParsedFrame<'_>>, FrameError> {
    let (length, size) = match read_length_prefix(buf.iter().copied())? {
        Prefix::Incomplete => return Ok(None),
        Prefix::Complete { length, size } => (length, size),
    };
    check_size(length, max_size)?;

    let total = size + length;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some(ParsedFrame {
        payload: &buf[size..total],
        consumed: total,
    }))
}

/// Try to parse one binary frame spread over non-contiguous `segments`.
///
/// The prefix and the body may each straddle segment boundaries. The payload
/// is copied out since it may not be contiguous. Returns the payload and the
/// number of bytes consumed across all segments.
///
/// # Errors
///
/// Same as [`try_parse`].
pub fn try_parse_segments(
    segments: &[&[u8]],
    max_size: usize,
) -> Result<Option<(Vec<u8>, usize)>, FrameError> {
    let bytes = || segments.iter().flat_map(|s| s.iter().copied());

    let (length, size) = match read_length_prefix(bytes())? {
        Prefix::Incomplete => return Ok(None),
        Prefix::Complete { length, size } => (length, size),
    };
    check_size(length, max_size)?;

    let available: usize = segments.iter().map(|s| s.len()).sum();
    let total = size + length;
    if available < total {
        return Ok(None);
    }

    let payload: Vec<u8> = bytes().skip(size).take(length).collect();
    Ok(Some((payload, total)))
}
