//! Backplane wire messages, CBOR-encoded.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::BackplaneError;

/// An invocation to deliver, pre-encoded once per hub protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationEnvelope {
    /// Method name, for logging.
    pub target: String,
    /// Connections that must not receive it.
    #[serde(default)]
    pub excluded_ids: Vec<String>,
    /// Protocol name → framed message bytes.
    pub payloads: BTreeMap<String, Bytes>,
}

/// Group membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupAction {
    /// Join the group.
    Add,
    /// Leave the group.
    Remove,
}

/// Request for the server owning `connection_id` to change its groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCommand {
    /// Ack id, unique per origin server.
    pub id: u64,
    /// Origin server, which waits on its ack channel.
    pub server_name: String,
    /// Add or remove.
    pub action: GroupAction,
    /// Group name.
    pub group: String,
    /// Connection to move.
    pub connection_id: String,
}

/// Acknowledgment of a [`GroupCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    /// Id of the acknowledged command.
    pub id: u64,
}

/// Encode a backplane message.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, BackplaneError> {
    let mut out = Vec::new();
    ciborium::into_writer(message, &mut out).map_err(|e| BackplaneError::Encode(e.to_string()))?;
    Ok(Bytes::from(out))
}

/// Decode a backplane message.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BackplaneError> {
    ciborium::from_reader(payload).map_err(|e| BackplaneError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_keeps_payload_bytes() {
        let mut payloads = BTreeMap::new();
        payloads.insert("json".to_string(), Bytes::from_static(b"{\"type\":1}\x1e"));
        payloads.insert("cbor".to_string(), Bytes::from_static(&[0x02, 0x81, 0x06]));
        let envelope = InvocationEnvelope {
            target: "Notify".into(),
            excluded_ids: vec!["c1".into()],
            payloads,
        };

        let decoded: InvocationEnvelope = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_group_command_and_ack() {
        let command = GroupCommand {
            id: 42,
            server_name: "a".into(),
            action: GroupAction::Remove,
            group: "room".into(),
            connection_id: "c9".into(),
        };
        let decoded: GroupCommand = decode(&encode(&command).unwrap()).unwrap();
        assert_eq!(decoded, command);

        let ack: AckMessage = decode(&encode(&AckMessage { id: 42 }).unwrap()).unwrap();
        assert_eq!(ack.id, 42);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode::<AckMessage>(b"\xff\xff").is_err());
        assert!(decode::<GroupCommand>(&encode(&AckMessage { id: 1 }).unwrap()).is_err());
    }
}
