//! Record-separator text framing.
//!
//! Each message is its UTF-8 payload followed by a single `0x1E` byte.
//! Payloads containing `0x1E` cannot be framed; [`write_frame`] rejects them
//! rather than emitting a stream the peer would split in two.

use bytes::{BufMut, BytesMut};

use super::{FrameError, ParsedFrame};
use crate::constants::RECORD_SEPARATOR;

/// Append `payload` and the record separator to `out`.
///
/// # Errors
///
/// Returns [`FrameError::EmbeddedSeparator`] if `payload` contains `0x1E`.
pub fn write_frame(payload: &[u8], out: &mut BytesMut) -> Result<(), FrameError> {
    if payload.contains(&RECORD_SEPARATOR) {
        return Err(FrameError::EmbeddedSeparator);
    }
    out.reserve(payload.len() + 1);
    out.put_slice(payload);
    out.put_u8(RECORD_SEPARATOR);
    Ok(())
}

/// Try to parse one text record from the front of `buf`.
///
/// Returns `None` until a separator has arrived. `consumed` includes the
/// separator byte.
pub fn try_parse(buf: &[u8]) -> Option<ParsedFrame<'_>> {
    let end = buf.iter().position(|&b| b == RECORD_SEPARATOR)?;
    Some(ParsedFrame {
        payload: &buf[..end],
        consumed: end + 1,
    })
}
