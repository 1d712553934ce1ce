//! Encode-once broadcast payloads.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use serde_json::Value;

use crate::protocol::{HubMessage, HubProtocol, InvocationMessage, ProtocolError};

/// A message plus its encodings, computed lazily per protocol name.
///
/// Broadcasting to many connections encodes once per distinct protocol
/// among the targets, not once per connection.
#[derive(Debug)]
pub struct SerializedHubMessage {
    message: Option<HubMessage>,
    cache: Mutex<BTreeMap<String, Bytes>>,
}

impl SerializedHubMessage {
    /// Wrap `message` for lazy encoding.
    pub fn new(message: HubMessage) -> Self {
        Self {
            message: Some(message),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Invocation of `method` with `args`, as sent by the lifetime managers.
    pub fn invocation(method: &str, args: Vec<Value>) -> Self {
        Self::new(HubMessage::Invocation(InvocationMessage::new(method, args)))
    }

    /// Payloads already encoded elsewhere (received over a backplane).
    /// Connections whose protocol is missing cannot be served.
    pub fn from_encoded(payloads: BTreeMap<String, Bytes>) -> Self {
        Self {
            message: None,
            cache: Mutex::new(payloads),
        }
    }

    /// The message, when this was built from one.
    pub fn message(&self) -> Option<&HubMessage> {
        self.message.as_ref()
    }

    /// Framed bytes for `protocol`, encoding on first use.
    pub fn bytes_for(&self, protocol: &dyn HubProtocol) -> Result<Bytes, ProtocolError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bytes) = cache.get(protocol.name()) {
            return Ok(bytes.clone());
        }
        let Some(message) = &self.message else {
            return Err(ProtocolError::Serialization(format!(
                "No payload encoded for protocol '{}'",
                protocol.name()
            )));
        };
        let bytes = protocol.message_bytes(message)?;
        cache.insert(protocol.name().to_string(), bytes.clone());
        Ok(bytes)
    }

    /// Encode for every protocol in `protocols` and return the payload map.
    pub fn encode_all<'a>(
        &self,
        protocols: impl IntoIterator<Item = &'a std::sync::Arc<dyn HubProtocol>>,
    ) -> Result<BTreeMap<String, Bytes>, ProtocolError> {
        let mut payloads = BTreeMap::new();
        for protocol in protocols {
            payloads.insert(protocol.name().to_string(), self.bytes_for(protocol.as_ref())?);
        }
        Ok(payloads)
    }

    /// Number of protocols encoded so far.
    pub fn cached_encodings(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
