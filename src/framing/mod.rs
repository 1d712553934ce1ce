//! Message framing over a continuous byte stream.
//!
//! Two wire forms, chosen once per connection from the negotiated hub
//! protocol's transfer format:
//!
//! ```text
//! Binary:  [varint length (1-5 bytes)] [payload: length bytes]
//! Text:    [UTF-8 payload] [0x1E]
//! ```
//!
//! Both parsers are pure functions over a borrowed byte view. They return
//! `Ok(None)` when the view does not yet hold a whole message, never consume
//! anything on failure, and can be retried as more bytes arrive.
//!
//! See [`binary`] and [`text`] for the codecs.

pub mod binary;
pub mod text;

/// How a transport carries messages: as text records or length-prefixed binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferFormat {
    /// UTF-8 payloads terminated by the record separator.
    Text,
    /// Varint length-prefixed payloads.
    Binary,
}

/// A complete message located inside a parse buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    /// Message payload with framing removed.
    pub payload: &'a [u8],
    /// Bytes the caller should advance its cursor by (framing included).
    pub consumed: usize,
}

/// Errors raised by the framing codecs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared payload length exceeds the configured maximum.
    TooLarge {
        /// Length announced by the prefix.
        length: u64,
        /// Configured maximum.
        max: usize,
    },
    /// Length prefix longer than five bytes or wider than 31 bits.
    MalformedLength,
    /// Text payload contains the record separator and cannot be framed.
    EmbeddedSeparator,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge { length, max } => {
                write!(f, "Frame too large: {length} bytes (max {max})")
            }
            Self::MalformedLength => write!(f, "Messages over 2GB in size are not supported."),
            Self::EmbeddedSeparator => {
                write!(f, "Text payload contains the record separator (0x1E)")
            }
        }
    }
}

impl std::error::Error for FrameError {}
