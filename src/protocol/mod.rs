//! Hub protocols: typed messages to and from wire bytes.
//!
//! A [`HubProtocol`] owns both the message encoding and the framing for its
//! transfer format. Several protocols coexist in a [`ProtocolRegistry`]; the
//! handshake picks one per connection by exact name match.
//!
//! ```text
//! ProtocolRegistry
//!     ├── "json"        → JsonHubProtocol         (text frames, JSON objects)
//!     ├── "messagepack" → MessagePackHubProtocol  (binary frames, MessagePack arrays)
//!     └── "cbor"        → CborHubProtocol         (binary frames, CBOR arrays)
//! ```

pub mod binder;
pub mod cbor;
pub mod json;
pub mod messagepack;
pub mod messages;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

pub use binder::{bind_arguments, BindingError, InvocationBinder, ParamType, PassthroughBinder};
pub use cbor::CborHubProtocol;
pub use json::JsonHubProtocol;
pub use messagepack::MessagePackHubProtocol;
pub use messages::{
    CloseMessage, CompletionMessage, CompletionOutcome, HubMessage, InvocationMessage,
    StreamInvocationMessage, StreamItemMessage,
};

use crate::framing::{FrameError, TransferFormat};

/// Errors raised while encoding or decoding hub messages.
#[derive(Debug)]
pub enum ProtocolError {
    /// Framing layer rejected the bytes.
    Frame(FrameError),
    /// Payload is not valid for this protocol.
    InvalidData(String),
    /// Message could not be serialized.
    Serialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "Framing error: {e}"),
            Self::InvalidData(msg) => write!(f, "Invalid message: {msg}"),
            Self::Serialization(msg) => write!(f, "Serialization error: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Frame(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FrameError> for ProtocolError {
    fn from(err: FrameError) -> Self {
        Self::Frame(err)
    }
}

/// A wire format for hub messages.
///
/// Implementations must be stateless: one instance is shared by every
/// connection that negotiated it.
pub trait HubProtocol: Send + Sync + std::fmt::Debug {
    /// Name clients request in the handshake.
    fn name(&self) -> &str;

    /// Current protocol version.
    fn version(&self) -> u32;

    /// Minor version reported in the handshake response, if any.
    fn minor_version(&self) -> Option<u32> {
        None
    }

    /// Framing this protocol uses on the transport.
    fn transfer_format(&self) -> TransferFormat;

    /// Whether a client asking for `version` can be served.
    fn is_version_supported(&self, version: u32) -> bool {
        version <= self.version()
    }

    /// Try to decode one message from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the message
    /// and the number of bytes it occupied (framing included).
    ///
    /// # Errors
    ///
    /// Returns an error for malformed framing or an undecodable payload.
    /// Binding problems are *not* errors; they surface as
    /// [`HubMessage::InvocationBindingFailure`] /
    /// [`HubMessage::StreamBindingFailure`].
    fn try_parse_message(
        &self,
        buf: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<Option<(HubMessage, usize)>, ProtocolError>;

    /// Encode and frame `message` into `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if `message` cannot be represented, including the
    /// decoder-only binding-failure variants.
    fn write_message(&self, message: &HubMessage, out: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Encode and frame `message` into a fresh buffer.
    fn message_bytes(&self, message: &HubMessage) -> Result<Bytes, ProtocolError> {
        let mut out = BytesMut::new();
        self.write_message(message, &mut out)?;
        Ok(out.freeze())
    }
}

/// Protocols available to the handshake, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    protocols: BTreeMap<String, Arc<dyn HubProtocol>>,
}

impl ProtocolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in protocols named in `names`.
    ///
    /// # Errors
    ///
    /// Returns an error for a name without a built-in implementation.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for name in names {
            let protocol: Arc<dyn HubProtocol> = match name.as_ref() {
                json::PROTOCOL_NAME => Arc::new(JsonHubProtocol::new()),
                messagepack::PROTOCOL_NAME => Arc::new(MessagePackHubProtocol::new()),
                cbor::PROTOCOL_NAME => Arc::new(CborHubProtocol::new()),
                other => anyhow::bail!("Unknown hub protocol '{other}'"),
            };
            registry.register(protocol);
        }
        Ok(registry)
    }

    /// Add or replace a protocol.
    pub fn register(&mut self, protocol: Arc<dyn HubProtocol>) {
        self.protocols.insert(protocol.name().to_string(), protocol);
    }

    /// Look up a protocol by exact name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn HubProtocol>> {
        self.protocols.get(name).map(Arc::clone)
    }

    /// Iterate registered protocols in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn HubProtocol>> {
        self.protocols.values()
    }

    /// Number of registered protocols.
    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}
