//! Protocol negotiation handshake.
//!
//! The first message on every connection, in both directions, is a JSON
//! object framed with the text record separator, even when the negotiated
//! hub protocol is binary:
//!
//! ```text
//! client → {"protocol":"messagepack","version":1}\x1e
//! server → {}\x1e                          (accepted)
//! server → {"error":"..."}\x1e             (rejected, connection closes)
//! ```

use std::sync::Arc;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::framing::{text, FrameError};
use crate::protocol::{HubProtocol, ProtocolRegistry};

/// Client's protocol request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Requested hub protocol name.
    pub protocol: String,
    /// Requested protocol version.
    pub version: u32,
}

/// Server's reply. Empty on success.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    /// Negotiation failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Minor version of the selected protocol, when it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor_version: Option<u32>,
}

impl HandshakeResponse {
    /// Successful response.
    pub fn success(minor_version: Option<u32>) -> Self {
        Self {
            error: None,
            minor_version,
        }
    }

    /// Failed response.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            minor_version: None,
        }
    }
}

/// Handshake failures that close the connection without negotiation.
#[derive(Debug)]
pub enum HandshakeError {
    /// Payload was not a valid handshake object.
    Malformed(String),
    /// No separator within the allowed size.
    TooLarge {
        /// Configured limit.
        max: usize,
    },
    /// Response could not be framed.
    Frame(FrameError),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed handshake: {msg}"),
            Self::TooLarge { max } => {
                write!(f, "Handshake exceeded the maximum message size of {max}B")
            }
            Self::Frame(e) => write!(f, "Handshake framing error: {e}"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<FrameError> for HandshakeError {
    fn from(err: FrameError) -> Self {
        Self::Frame(err)
    }
}

/// Try to parse a handshake request from the front of `buf`.
///
/// Returns `Ok(None)` until a record separator arrives. On success also
/// returns the bytes consumed, separator included; anything after belongs
/// to the negotiated protocol.
///
/// # Errors
///
/// [`HandshakeError::Malformed`] for invalid JSON or missing fields,
/// [`HandshakeError::TooLarge`] when `max_size` bytes arrived without a
/// separator.
pub fn try_parse_request(
    buf: &[u8],
    max_size: Option<usize>,
) -> Result<Option<(HandshakeRequest, usize)>, HandshakeError> {
    try_parse(buf, max_size)
}

/// Try to parse a handshake response. Client-side counterpart of
/// [`try_parse_request`].
///
/// # Errors
///
/// Same as [`try_parse_request`].
pub fn try_parse_response(
    buf: &[u8],
) -> Result<Option<(HandshakeResponse, usize)>, HandshakeError> {
    try_parse(buf, None)
}

fn try_parse<T: serde::de::DeserializeOwned>(
    buf: &[u8],
    max_size: Option<usize>,
) -> Result<Option<(T, usize)>, HandshakeError> {
    let window = match max_size {
        Some(max) if buf.len() > max => &buf[..max],
        _ => buf,
    };
    let Some(frame) = text::try_parse(window) else {
        return match max_size {
            Some(max) if buf.len() > max => Err(HandshakeError::TooLarge { max }),
            _ => Ok(None),
        };
    };
    let parsed = serde_json::from_slice(frame.payload)
        .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    Ok(Some((parsed, frame.consumed)))
}

/// Append a framed request to `out`.
///
/// # Errors
///
/// Fails only if serialization produces a record separator, which JSON
/// escaping rules out.
pub fn write_request(request: &HandshakeRequest, out: &mut BytesMut) -> Result<(), HandshakeError> {
    write(request, out)
}

/// Append a framed response to `out`.
///
/// # Errors
///
/// Same as [`write_request`].
pub fn write_response(
    response: &HandshakeResponse,
    out: &mut BytesMut,
) -> Result<(), HandshakeError> {
    write(response, out)
}

fn write<T: Serialize>(value: &T, out: &mut BytesMut) -> Result<(), HandshakeError> {
    let payload =
        serde_json::to_vec(value).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    text::write_frame(&payload, out)?;
    Ok(())
}

/// Pick the protocol for `request` from `registry`.
///
/// # Errors
///
/// Returns the text to send back in the failure response.
pub fn negotiate(
    request: &HandshakeRequest,
    registry: &ProtocolRegistry,
) -> Result<Arc<dyn HubProtocol>, String> {
    let Some(protocol) = registry.get(&request.protocol) else {
        return Err(format!(
            "The protocol '{}' is not supported.",
            request.protocol
        ));
    };
    if !protocol.is_version_supported(request.version) {
        return Err(format!(
            "The server does not support version {} of the '{}' protocol.",
            request.version, request.protocol
        ));
    }
    Ok(protocol)
}
