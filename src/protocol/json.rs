//! JSON hub protocol.
//!
//! Messages are JSON objects tagged by a numeric `type`, text-framed with
//! the record separator:
//!
//! ```text
//! {"type":1,"invocationId":"1","target":"Send","arguments":["hi"]}\x1e
//! {"type":3,"invocationId":"1","result":42}\x1e
//! {"type":6}\x1e
//! ```
//!
//! Arguments are decoded generically and then converted to the declared
//! parameter types through the [`InvocationBinder`].

use bytes::BytesMut;
use log::debug;
use serde_json::{Map, Value};

use super::binder::{bind_arguments, InvocationBinder};
use super::messages::{
    message_type, CloseMessage, CompletionMessage, CompletionOutcome, HubMessage,
    InvocationMessage, StreamInvocationMessage, StreamItemMessage,
};
use super::{HubProtocol, ProtocolError};
use crate::framing::{text, TransferFormat};

/// Name clients use to request this protocol.
pub const PROTOCOL_NAME: &str = "json";

const PROTOCOL_VERSION: u32 = 1;

/// JSON encoding over record-separator framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    /// Create the protocol.
    pub fn new() -> Self {
        Self
    }

    /// Decode one unframed payload. `Ok(None)` means an unknown message
    /// type that the caller should skip.
    fn parse_payload(
        payload: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<Option<HubMessage>, ProtocolError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::InvalidData(format!("Error reading JSON: {e}")))?;
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::InvalidData(
                "Message must be a JSON object.".to_string(),
            ));
        };

        let kind = match obj.get("type") {
            Some(Value::Number(n)) => n.as_u64().ok_or_else(|| expected_type("type", "Integer"))?,
            Some(_) => return Err(expected_type("type", "Integer")),
            None => return Err(missing("type")),
        };

        let message = match u8::try_from(kind).unwrap_or(u8::MAX) {
            message_type::INVOCATION => {
                let invocation_id = optional_string(&obj, "invocationId")?;
                let target = required_string(&obj, "target")?;
                let stream_ids = stream_ids(&obj)?;
                let arguments = take_arguments(&mut obj)?;
                match bind_arguments(binder, &target, arguments) {
                    Ok(arguments) => HubMessage::Invocation(InvocationMessage {
                        invocation_id,
                        target,
                        arguments,
                        stream_ids,
                    }),
                    Err(e) => HubMessage::InvocationBindingFailure {
                        invocation_id,
                        target,
                        error: e.to_string(),
                    },
                }
            }
            message_type::STREAM_INVOCATION => {
                let invocation_id = required_string(&obj, "invocationId")?;
                let target = required_string(&obj, "target")?;
                let stream_ids = stream_ids(&obj)?;
                let arguments = take_arguments(&mut obj)?;
                match bind_arguments(binder, &target, arguments) {
                    Ok(arguments) => HubMessage::StreamInvocation(StreamInvocationMessage {
                        invocation_id,
                        target,
                        arguments,
                        stream_ids,
                    }),
                    Err(e) => HubMessage::InvocationBindingFailure {
                        invocation_id: Some(invocation_id),
                        target,
                        error: e.to_string(),
                    },
                }
            }
            message_type::STREAM_ITEM => {
                let invocation_id = required_string(&obj, "invocationId")?;
                let item = obj.remove("item").ok_or_else(|| missing("item"))?;
                let bound = binder
                    .stream_item_type(&invocation_id)
                    .and_then(|ty| ty.coerce(item));
                match bound {
                    Ok(item) => HubMessage::StreamItem(StreamItemMessage { invocation_id, item }),
                    Err(e) => HubMessage::StreamBindingFailure {
                        id: invocation_id,
                        error: e.to_string(),
                    },
                }
            }
            message_type::COMPLETION => {
                let invocation_id = required_string(&obj, "invocationId")?;
                let error = optional_string(&obj, "error")?;
                let result = obj.remove("result");
                let outcome = match (result, error) {
                    (Some(_), Some(_)) => {
                        return Err(ProtocolError::InvalidData(
                            "The 'error' and 'result' properties are mutually exclusive."
                                .to_string(),
                        ))
                    }
                    (None, Some(error)) => CompletionOutcome::Error(error),
                    (Some(result), None) => {
                        // Results for unknown invocations stay untyped.
                        let result = match binder.return_type(&invocation_id) {
                            Ok(ty) => ty.coerce(result.clone()).unwrap_or(result),
                            Err(_) => result,
                        };
                        CompletionOutcome::Result(result)
                    }
                    (None, None) => CompletionOutcome::Empty,
                };
                HubMessage::Completion(CompletionMessage {
                    invocation_id,
                    outcome,
                })
            }
            message_type::CANCEL_INVOCATION => HubMessage::CancelInvocation {
                invocation_id: required_string(&obj, "invocationId")?,
            },
            message_type::PING => HubMessage::Ping,
            message_type::CLOSE => HubMessage::Close(CloseMessage {
                error: optional_string(&obj, "error")?,
                allow_reconnect: match obj.get("allowReconnect") {
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(b)) => *b,
                    Some(_) => return Err(expected_type("allowReconnect", "Boolean")),
                },
            }),
            _ => {
                debug!("[Protocol] Ignoring unknown JSON message type {kind}");
                return Ok(None);
            }
        };

        Ok(Some(message))
    }
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn try_parse_message(
        &self,
        buf: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<Option<(HubMessage, usize)>, ProtocolError> {
        let mut offset = 0;
        while let Some(frame) = text::try_parse(&buf[offset..]) {
            offset += frame.consumed;
            if let Some(message) = Self::parse_payload(frame.payload, binder)? {
                return Ok(Some((message, offset)));
            }
        }
        Ok(None)
    }

    fn write_message(&self, message: &HubMessage, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let value = to_json(message)?;
        let payload = serde_json::to_vec(&value)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        text::write_frame(&payload, out)?;
        Ok(())
    }
}

fn to_json(message: &HubMessage) -> Result<Value, ProtocolError> {
    let mut obj = Map::new();
    match message {
        HubMessage::Invocation(inv) => {
            obj.insert("type".into(), message_type::INVOCATION.into());
            if let Some(id) = &inv.invocation_id {
                obj.insert("invocationId".into(), id.clone().into());
            }
            obj.insert("target".into(), inv.target.clone().into());
            obj.insert("arguments".into(), Value::Array(inv.arguments.clone()));
            if !inv.stream_ids.is_empty() {
                obj.insert("streamIds".into(), inv.stream_ids.clone().into());
            }
        }
        HubMessage::StreamInvocation(inv) => {
            obj.insert("type".into(), message_type::STREAM_INVOCATION.into());
            obj.insert("invocationId".into(), inv.invocation_id.clone().into());
            obj.insert("target".into(), inv.target.clone().into());
            obj.insert("arguments".into(), Value::Array(inv.arguments.clone()));
            if !inv.stream_ids.is_empty() {
                obj.insert("streamIds".into(), inv.stream_ids.clone().into());
            }
        }
        HubMessage::StreamItem(item) => {
            obj.insert("type".into(), message_type::STREAM_ITEM.into());
            obj.insert("invocationId".into(), item.invocation_id.clone().into());
            obj.insert("item".into(), item.item.clone());
        }
        HubMessage::Completion(completion) => {
            obj.insert("type".into(), message_type::COMPLETION.into());
            obj.insert("invocationId".into(), completion.invocation_id.clone().into());
            match &completion.outcome {
                CompletionOutcome::Empty => {}
                CompletionOutcome::Result(result) => {
                    obj.insert("result".into(), result.clone());
                }
                CompletionOutcome::Error(error) => {
                    obj.insert("error".into(), error.clone().into());
                }
            }
        }
        HubMessage::CancelInvocation { invocation_id } => {
            obj.insert("type".into(), message_type::CANCEL_INVOCATION.into());
            obj.insert("invocationId".into(), invocation_id.clone().into());
        }
        HubMessage::Ping => {
            obj.insert("type".into(), message_type::PING.into());
        }
        HubMessage::Close(close) => {
            obj.insert("type".into(), message_type::CLOSE.into());
            if let Some(error) = &close.error {
                obj.insert("error".into(), error.clone().into());
            }
            if close.allow_reconnect {
                obj.insert("allowReconnect".into(), true.into());
            }
        }
        HubMessage::InvocationBindingFailure { .. } | HubMessage::StreamBindingFailure { .. } => {
            return Err(ProtocolError::Serialization(format!(
                "{} messages cannot be written",
                message.kind()
            )))
        }
    }
    Ok(Value::Object(obj))
}

fn missing(property: &str) -> ProtocolError {
    ProtocolError::InvalidData(format!("Missing required property '{property}'."))
}

fn expected_type(property: &str, ty: &str) -> ProtocolError {
    ProtocolError::InvalidData(format!("Expected '{property}' to be of type {ty}."))
}

fn required_string(obj: &Map<String, Value>, property: &str) -> Result<String, ProtocolError> {
    optional_string(obj, property)?.ok_or_else(|| missing(property))
}

fn optional_string(
    obj: &Map<String, Value>,
    property: &str,
) -> Result<Option<String>, ProtocolError> {
    match obj.get(property) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(expected_type(property, "String")),
    }
}

fn take_arguments(obj: &mut Map<String, Value>) -> Result<Vec<Value>, ProtocolError> {
    match obj.remove("arguments") {
        Some(Value::Array(arguments)) => Ok(arguments),
        Some(_) => Err(expected_type("arguments", "Array")),
        None => Err(missing("arguments")),
    }
}

fn stream_ids(obj: &Map<String, Value>) -> Result<Vec<String>, ProtocolError> {
    match obj.get("streamIds") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(ids)) => ids
            .iter()
            .map(|id| match id {
                Value::String(s) => Ok(s.clone()),
                _ => Err(expected_type("streamIds", "Array of String")),
            })
            .collect(),
        Some(_) => Err(expected_type("streamIds", "Array")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::binder::{BindingError, ParamType, PassthroughBinder};
    use serde_json::json;

    struct AddBinder;

    impl InvocationBinder for AddBinder {
        fn parameter_types(&self, target: &str) -> Result<Vec<ParamType>, BindingError> {
            match target {
                "Add" => Ok(vec![ParamType::Int, ParamType::Int]),
                other => Err(BindingError::UnknownTarget(other.to_string())),
            }
        }

        fn return_type(&self, id: &str) -> Result<ParamType, BindingError> {
            Err(BindingError::UnknownInvocation(id.to_string()))
        }

        fn stream_item_type(&self, id: &str) -> Result<ParamType, BindingError> {
            match id {
                "s1" => Ok(ParamType::String),
                other => Err(BindingError::UnknownStream(other.to_string())),
            }
        }
    }

    fn parse(raw: &str, binder: &dyn InvocationBinder) -> HubMessage {
        let mut buf = raw.as_bytes().to_vec();
        buf.push(0x1e);
        let (message, consumed) = JsonHubProtocol.try_parse_message(&buf, binder).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        message
    }

    fn written(message: &HubMessage) -> Value {
        let bytes = JsonHubProtocol.message_bytes(message).unwrap();
        assert_eq!(bytes.last(), Some(&0x1e));
        serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap()
    }

    #[test]
    fn test_parse_invocation_binds_arguments() {
        let message = parse(
            r#"{"type":1,"invocationId":"7","target":"Add","arguments":[1,null]}"#,
            &AddBinder,
        );
        assert_eq!(
            message,
            HubMessage::Invocation(InvocationMessage::with_id("7", "Add", vec![json!(1), json!(0)]))
        );
    }

    #[test]
    fn test_binding_failure_is_a_message_not_an_error() {
        let message = parse(r#"{"type":1,"target":"Add","arguments":["x","y"]}"#, &AddBinder);
        assert!(matches!(
            message,
            HubMessage::InvocationBindingFailure { invocation_id: None, ref target, .. } if target == "Add"
        ));

        let message = parse(
            r#"{"type":4,"invocationId":"2","target":"Nope","arguments":[]}"#,
            &AddBinder,
        );
        assert!(matches!(
            message,
            HubMessage::InvocationBindingFailure { invocation_id: Some(ref id), .. } if id == "2"
        ));
    }

    #[test]
    fn test_stream_item_binding() {
        let message = parse(r#"{"type":2,"invocationId":"s1","item":"x"}"#, &AddBinder);
        assert_eq!(
            message,
            HubMessage::StreamItem(StreamItemMessage { invocation_id: "s1".into(), item: json!("x") })
        );

        let message = parse(r#"{"type":2,"invocationId":"s9","item":"x"}"#, &AddBinder);
        assert!(matches!(message, HubMessage::StreamBindingFailure { ref id, .. } if id == "s9"));
    }

    #[test]
    fn test_completion_outcomes() {
        let empty = parse(r#"{"type":3,"invocationId":"1"}"#, &PassthroughBinder);
        assert_eq!(empty, HubMessage::Completion(CompletionMessage::empty("1")));

        let null_result = parse(r#"{"type":3,"invocationId":"1","result":null}"#, &PassthroughBinder);
        assert_eq!(
            null_result,
            HubMessage::Completion(CompletionMessage::with_result("1", Value::Null))
        );

        let mut both = br#"{"type":3,"invocationId":"1","result":1,"error":"e"}"#.to_vec();
        both.push(0x1e);
        assert!(JsonHubProtocol.try_parse_message(&both, &PassthroughBinder).is_err());
    }

    #[test]
    fn test_incomplete_and_invalid_input() {
        assert!(JsonHubProtocol
            .try_parse_message(br#"{"type":6}"#, &PassthroughBinder)
            .unwrap()
            .is_none());

        let err = JsonHubProtocol
            .try_parse_message(b"{\"type\":1,\"arguments\":[]}\x1e", &PassthroughBinder)
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid message: Missing required property 'target'.");

        assert!(JsonHubProtocol
            .try_parse_message(b"not json\x1e", &PassthroughBinder)
            .is_err());
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let buf = b"{\"type\":99}\x1e{\"type\":6}\x1e";
        let (message, consumed) =
            JsonHubProtocol.try_parse_message(buf, &PassthroughBinder).unwrap().unwrap();
        assert_eq!(message, HubMessage::Ping);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_write_envelopes() {
        assert_eq!(written(&HubMessage::Ping), json!({"type": 6}));
        assert_eq!(
            written(&HubMessage::Invocation(InvocationMessage::new("Send", vec![json!("hi")]))),
            json!({"type": 1, "target": "Send", "arguments": ["hi"]})
        );
        assert_eq!(
            written(&HubMessage::Completion(CompletionMessage::with_error("3", "boom"))),
            json!({"type": 3, "invocationId": "3", "error": "boom"})
        );
        assert_eq!(
            written(&HubMessage::Close(CloseMessage { error: None, allow_reconnect: true })),
            json!({"type": 7, "allowReconnect": true})
        );
    }

    #[test]
    fn test_separator_inside_string_is_escaped() {
        let message = HubMessage::StreamItem(StreamItemMessage {
            invocation_id: "1".into(),
            item: json!("a\u{1e}b"),
        });
        let bytes = JsonHubProtocol.message_bytes(&message).unwrap();
        assert_eq!(bytes.iter().filter(|&&b| b == 0x1e).count(), 1);
        let (parsed, _) = JsonHubProtocol
            .try_parse_message(&bytes, &PassthroughBinder)
            .unwrap()
            .unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_binding_failures_cannot_be_written() {
        let message = HubMessage::StreamBindingFailure { id: "s".into(), error: "e".into() };
        assert!(JsonHubProtocol.message_bytes(&message).is_err());
    }
}
