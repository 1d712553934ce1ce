//! MessagePack hub protocol.
//!
//! Same positional array layout as the CBOR protocol, encoded as
//! MessagePack and carried in varint length-prefixed frames:
//!
//! ```text
//! Invocation:        [1, headers, invocationId|nil, target, [args], [streamIds]]
//! StreamItem:        [2, headers, invocationId, item]
//! Completion:        [3, headers, invocationId, kind, result?]   kind: 1 error, 2 void, 3 result
//! StreamInvocation:  [4, headers, invocationId, target, [args], [streamIds]]
//! CancelInvocation:  [5, headers, invocationId]
//! Ping:              [6]
//! Close:             [7, error|nil, allowReconnect]
//! ```

use bytes::BytesMut;
use log::debug;
use rmpv::Value as MsgValue;
use serde_json::{Map, Number, Value};

use super::binder::{BindingError, InvocationBinder, ParamType};
use super::messages::{
    message_type, CloseMessage, CompletionMessage, CompletionOutcome, HubMessage,
    InvocationMessage, StreamInvocationMessage, StreamItemMessage,
};
use super::{HubProtocol, ProtocolError};
use crate::constants::DEFAULT_MAX_FRAME_SIZE;
use crate::framing::{binary, TransferFormat};

/// Name clients use to request this protocol.
pub const PROTOCOL_NAME: &str = "messagepack";

const PROTOCOL_VERSION: u32 = 1;

const RESULT_KIND_ERROR: u8 = 1;
const RESULT_KIND_VOID: u8 = 2;
const RESULT_KIND_NON_VOID: u8 = 3;

/// MessagePack array encoding over varint length-prefixed framing.
#[derive(Debug, Clone, Copy)]
pub struct MessagePackHubProtocol {
    max_frame_size: usize,
}

impl Default for MessagePackHubProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagePackHubProtocol {
    /// Create the protocol with the default frame size limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create the protocol rejecting frames larger than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    fn parse_payload(
        payload: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<Option<HubMessage>, ProtocolError> {
        let mut reader = payload;
        let value = rmpv::decode::read_value(&mut reader)
            .map_err(|e| ProtocolError::InvalidData(format!("Error reading MessagePack: {e}")))?;
        let MsgValue::Array(items) = value else {
            return Err(ProtocolError::InvalidData(
                "Message must be a MessagePack array.".to_string(),
            ));
        };
        let mut fields = Fields::new(items);

        let kind = fields.integer("messageType")?;
        let message = match u8::try_from(kind).unwrap_or(u8::MAX) {
            message_type::INVOCATION => {
                fields.skip_headers()?;
                let invocation_id = fields.optional_string("invocationId")?;
                let target = fields.string("target")?;
                let arguments = fields.array("arguments")?;
                let stream_ids = fields.stream_ids()?;
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
                fields.skip_headers()?;
                let invocation_id = fields.string("invocationId")?;
                let target = fields.string("target")?;
                let arguments = fields.array("arguments")?;
                let stream_ids = fields.stream_ids()?;
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
                fields.skip_headers()?;
                let invocation_id = fields.string("invocationId")?;
                let item = fields.next("item")?;
                let bound = binder
                    .stream_item_type(&invocation_id)
                    .and_then(|ty| bind_value(ty, item));
                match bound {
                    Ok(item) => HubMessage::StreamItem(StreamItemMessage { invocation_id, item }),
                    Err(e) => HubMessage::StreamBindingFailure {
                        id: invocation_id,
                        error: e.to_string(),
                    },
                }
            }
            message_type::COMPLETION => {
                fields.skip_headers()?;
                let invocation_id = fields.string("invocationId")?;
                let outcome = match u8::try_from(fields.integer("resultKind")?).unwrap_or(u8::MAX) {
                    RESULT_KIND_ERROR => CompletionOutcome::Error(fields.string("error")?),
                    RESULT_KIND_VOID => CompletionOutcome::Empty,
                    RESULT_KIND_NON_VOID => {
                        let raw = msgpack_to_json(fields.next("result")?).map_err(|found| {
                            ProtocolError::InvalidData(format!("Error reading result: {found}."))
                        })?;
                        // A result that does not fit the expected type stays untyped.
                        let result = match binder.return_type(&invocation_id) {
                            Ok(ty) => ty.coerce(raw.clone()).unwrap_or(raw),
                            Err(_) => raw,
                        };
                        CompletionOutcome::Result(result)
                    }
                    other => {
                        return Err(ProtocolError::InvalidData(format!(
                            "Invalid invocation result kind: {other}."
                        )))
                    }
                };
                HubMessage::Completion(CompletionMessage {
                    invocation_id,
                    outcome,
                })
            }
            message_type::CANCEL_INVOCATION => {
                fields.skip_headers()?;
                HubMessage::CancelInvocation {
                    invocation_id: fields.string("invocationId")?,
                }
            }
            message_type::PING => HubMessage::Ping,
            message_type::CLOSE => {
                let error = fields.optional_string("error")?;
                let allow_reconnect = match fields.try_next() {
                    None | Some(MsgValue::Nil) => false,
                    Some(MsgValue::Boolean(b)) => b,
                    Some(_) => {
                        return Err(ProtocolError::InvalidData(
                            "Expected 'allowReconnect' to be a boolean.".to_string(),
                        ))
                    }
                };
                HubMessage::Close(CloseMessage {
                    error,
                    allow_reconnect,
                })
            }
            _ => {
                debug!("[Protocol] Ignoring unknown MessagePack message type {kind}");
                return Ok(None);
            }
        };

        Ok(Some(message))
    }
}

impl HubProtocol for MessagePackHubProtocol {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Binary
    }

    fn try_parse_message(
        &self,
        buf: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<Option<(HubMessage, usize)>, ProtocolError> {
        let mut offset = 0;
        while let Some(frame) = binary::try_parse(&buf[offset..], self.max_frame_size)? {
            offset += frame.consumed;
            if let Some(message) = Self::parse_payload(frame.payload, binder)? {
                return Ok(Some((message, offset)));
            }
        }
        Ok(None)
    }

    fn write_message(&self, message: &HubMessage, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let value = to_msgpack(message)?;
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &value)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        binary::write_frame(&payload, out);
        Ok(())
    }
}

struct Fields {
    items: std::vec::IntoIter<MsgValue>,
}

impl Fields {
    fn new(items: Vec<MsgValue>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    fn try_next(&mut self) -> Option<MsgValue> {
        self.items.next()
    }

    fn next(&mut self, field: &str) -> Result<MsgValue, ProtocolError> {
        self.items.next().ok_or_else(|| {
            ProtocolError::InvalidData(format!("Reading '{field}' failed: message too short."))
        })
    }

    fn integer(&mut self, field: &str) -> Result<i64, ProtocolError> {
        match self.next(field)? {
            MsgValue::Integer(i) => i.as_i64().ok_or_else(|| expected(field, "a small integer")),
            _ => Err(expected(field, "an integer")),
        }
    }

    fn string(&mut self, field: &str) -> Result<String, ProtocolError> {
        self.optional_string(field)?.ok_or_else(|| expected(field, "a string"))
    }

    fn optional_string(&mut self, field: &str) -> Result<Option<String>, ProtocolError> {
        match self.next(field)? {
            MsgValue::Nil => Ok(None),
            MsgValue::String(s) => s
                .into_str()
                .map(Some)
                .ok_or_else(|| expected(field, "a UTF-8 string")),
            _ => Err(expected(field, "a string")),
        }
    }

    fn array(&mut self, field: &str) -> Result<Vec<MsgValue>, ProtocolError> {
        match self.next(field)? {
            MsgValue::Array(items) => Ok(items),
            _ => Err(expected(field, "an array")),
        }
    }

    fn skip_headers(&mut self) -> Result<(), ProtocolError> {
        match self.next("headers")? {
            MsgValue::Map(_) | MsgValue::Nil => Ok(()),
            _ => Err(expected("headers", "a map")),
        }
    }

    /// Trailing stream ids; older clients leave them out.
    fn stream_ids(&mut self) -> Result<Vec<String>, ProtocolError> {
        match self.try_next() {
            None | Some(MsgValue::Nil) => Ok(Vec::new()),
            Some(MsgValue::Array(ids)) => ids
                .into_iter()
                .map(|id| match id {
                    MsgValue::String(s) => s
                        .into_str()
                        .ok_or_else(|| expected("streamIds", "UTF-8 strings")),
                    _ => Err(expected("streamIds", "an array of strings")),
                })
                .collect(),
            Some(_) => Err(expected("streamIds", "an array")),
        }
    }
}

fn expected(field: &str, what: &str) -> ProtocolError {
    ProtocolError::InvalidData(format!("Reading '{field}' failed: expected {what}."))
}

fn bind_arguments(
    binder: &dyn InvocationBinder,
    target: &str,
    arguments: Vec<MsgValue>,
) -> Result<Vec<Value>, BindingError> {
    if !binder.binds_arguments() {
        return arguments
            .into_iter()
            .map(|arg| bind_value(ParamType::Any, arg))
            .collect();
    }
    let types = binder.parameter_types(target)?;
    if types.len() != arguments.len() {
        return Err(BindingError::ArgumentCount {
            provided: arguments.len(),
            expected: types.len(),
        });
    }
    types
        .into_iter()
        .zip(arguments)
        .map(|(ty, arg)| bind_value(ty, arg))
        .collect()
}

fn bind_value(ty: ParamType, value: MsgValue) -> Result<Value, BindingError> {
    let json = msgpack_to_json(value).map_err(|found| BindingError::TypeMismatch {
        expected: ty,
        found,
    })?;
    ty.coerce(json)
}

/// Convert a MessagePack value into JSON. The error names the unsupported type.
fn msgpack_to_json(value: MsgValue) -> Result<Value, &'static str> {
    Ok(match value {
        MsgValue::Nil => Value::Null,
        MsgValue::Boolean(b) => Value::Bool(b),
        MsgValue::Integer(i) => {
            if let Some(n) = i.as_i64() {
                Value::from(n)
            } else if let Some(n) = i.as_u64() {
                Value::from(n)
            } else {
                return Err("integer out of range");
            }
        }
        MsgValue::F32(f) => Number::from_f64(f64::from(f))
            .map(Value::Number)
            .ok_or("non-finite float")?,
        MsgValue::F64(f) => Number::from_f64(f).map(Value::Number).ok_or("non-finite float")?,
        MsgValue::String(s) => Value::String(s.into_str().ok_or("invalid UTF-8 string")?),
        MsgValue::Array(items) => Value::Array(
            items
                .into_iter()
                .map(msgpack_to_json)
                .collect::<Result<_, _>>()?,
        ),
        MsgValue::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let MsgValue::String(key) = key else {
                    return Err("map with non-string keys");
                };
                let key = key.into_str().ok_or("invalid UTF-8 string")?;
                map.insert(key, msgpack_to_json(value)?);
            }
            Value::Object(map)
        }
        MsgValue::Binary(_) => return Err("binary"),
        MsgValue::Ext(..) => return Err("extension"),
    })
}

fn json_to_msgpack(value: &Value) -> MsgValue {
    match value {
        Value::Null => MsgValue::Nil,
        Value::Bool(b) => MsgValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                MsgValue::from(i)
            } else if let Some(u) = n.as_u64() {
                MsgValue::from(u)
            } else {
                MsgValue::F64(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => MsgValue::from(s.as_str()),
        Value::Array(items) => MsgValue::Array(items.iter().map(json_to_msgpack).collect()),
        Value::Object(map) => MsgValue::Map(
            map.iter()
                .map(|(k, v)| (MsgValue::from(k.as_str()), json_to_msgpack(v)))
                .collect(),
        ),
    }
}

fn string_array(items: &[String]) -> MsgValue {
    MsgValue::Array(items.iter().map(|s| MsgValue::from(s.as_str())).collect())
}

fn optional_string(value: Option<&str>) -> MsgValue {
    value.map_or(MsgValue::Nil, MsgValue::from)
}

fn to_msgpack(message: &HubMessage) -> Result<MsgValue, ProtocolError> {
    let headers = || MsgValue::Map(Vec::new());
    let kind = |t: u8| MsgValue::from(t);

    let items = match message {
        HubMessage::Invocation(inv) => vec![
            kind(message_type::INVOCATION),
            headers(),
            optional_string(inv.invocation_id.as_deref()),
            MsgValue::from(inv.target.as_str()),
            MsgValue::Array(inv.arguments.iter().map(json_to_msgpack).collect()),
            string_array(&inv.stream_ids),
        ],
        HubMessage::StreamInvocation(inv) => vec![
            kind(message_type::STREAM_INVOCATION),
            headers(),
            MsgValue::from(inv.invocation_id.as_str()),
            MsgValue::from(inv.target.as_str()),
            MsgValue::Array(inv.arguments.iter().map(json_to_msgpack).collect()),
            string_array(&inv.stream_ids),
        ],
        HubMessage::StreamItem(item) => vec![
            kind(message_type::STREAM_ITEM),
            headers(),
            MsgValue::from(item.invocation_id.as_str()),
            json_to_msgpack(&item.item),
        ],
        HubMessage::Completion(completion) => {
            let mut items = vec![
                kind(message_type::COMPLETION),
                headers(),
                MsgValue::from(completion.invocation_id.as_str()),
            ];
            match &completion.outcome {
                CompletionOutcome::Empty => items.push(kind(RESULT_KIND_VOID)),
                CompletionOutcome::Result(result) => {
                    items.push(kind(RESULT_KIND_NON_VOID));
                    items.push(json_to_msgpack(result));
                }
                CompletionOutcome::Error(error) => {
                    items.push(kind(RESULT_KIND_ERROR));
                    items.push(MsgValue::from(error.as_str()));
                }
            }
            items
        }
        HubMessage::CancelInvocation { invocation_id } => vec![
            kind(message_type::CANCEL_INVOCATION),
            headers(),
            MsgValue::from(invocation_id.as_str()),
        ],
        HubMessage::Ping => vec![kind(message_type::PING)],
        HubMessage::Close(close) => vec![
            kind(message_type::CLOSE),
            optional_string(close.error.as_deref()),
            MsgValue::Boolean(close.allow_reconnect),
        ],
        HubMessage::InvocationBindingFailure { .. } | HubMessage::StreamBindingFailure { .. } => {
            return Err(ProtocolError::Serialization(format!(
                "{} messages cannot be written",
                message.kind()
            )))
        }
    };
    Ok(MsgValue::Array(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameError;
    use crate::protocol::binder::PassthroughBinder;
    use serde_json::json;

    struct TypedBinder;

    impl InvocationBinder for TypedBinder {
        fn parameter_types(&self, target: &str) -> Result<Vec<ParamType>, BindingError> {
            match target {
                "Concat" => Ok(vec![ParamType::String, ParamType::Int]),
                other => Err(BindingError::UnknownTarget(other.to_string())),
            }
        }

        fn return_type(&self, _id: &str) -> Result<ParamType, BindingError> {
            Ok(ParamType::Int)
        }

        fn stream_item_type(&self, _id: &str) -> Result<ParamType, BindingError> {
            Ok(ParamType::Int)
        }
    }

    fn round_trip(message: &HubMessage, binder: &dyn InvocationBinder) -> HubMessage {
        let protocol = MessagePackHubProtocol::new();
        let bytes = protocol.message_bytes(message).unwrap();
        let (parsed, consumed) = protocol.try_parse_message(&bytes, binder).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        parsed
    }

    fn frame(value: &MsgValue) -> BytesMut {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, value).unwrap();
        let mut out = BytesMut::new();
        binary::write_frame(&payload, &mut out);
        out
    }

    #[test]
    fn test_ping_wire_bytes() {
        let bytes = MessagePackHubProtocol::new().message_bytes(&HubMessage::Ping).unwrap();
        assert_eq!(&bytes[..], &[0x02, 0x91, 0x06]);
    }

    #[test]
    fn test_close_wire_bytes() {
        let bytes = MessagePackHubProtocol::new()
            .message_bytes(&HubMessage::Close(CloseMessage::default()))
            .unwrap();
        assert_eq!(&bytes[..], &[0x04, 0x93, 0x07, 0xc0, 0xc2]);
    }

    #[test]
    fn test_invocation_with_streams() {
        let message = HubMessage::Invocation(
            InvocationMessage::with_id("1", "Concat", vec![json!("a"), json!(2)])
                .with_streams(vec!["s1".into()]),
        );
        assert_eq!(round_trip(&message, &TypedBinder), message);
    }

    #[test]
    fn test_argument_type_mismatch_is_binding_failure() {
        let message = HubMessage::Invocation(InvocationMessage::with_id(
            "1",
            "Concat",
            vec![json!("a"), json!("b")],
        ));
        assert!(matches!(
            round_trip(&message, &TypedBinder),
            HubMessage::InvocationBindingFailure { invocation_id: Some(ref id), .. } if id == "1"
        ));
    }

    #[test]
    fn test_completion_kinds() {
        for completion in [
            CompletionMessage::empty("1"),
            CompletionMessage::with_result("2", json!({"nested": [1, 2.5, "x", null]})),
            CompletionMessage::with_error("3", "failed"),
        ] {
            let message = HubMessage::Completion(completion);
            assert_eq!(round_trip(&message, &PassthroughBinder), message);
        }
    }

    #[test]
    fn test_unbindable_result_stays_untyped() {
        let message = HubMessage::Completion(CompletionMessage::with_result("1", json!("text")));
        assert_eq!(round_trip(&message, &TypedBinder), message);
    }

    #[test]
    fn test_stream_item_and_cancel() {
        let item = HubMessage::StreamItem(StreamItemMessage {
            invocation_id: "s1".into(),
            item: json!(5),
        });
        assert_eq!(round_trip(&item, &TypedBinder), item);

        let cancel = HubMessage::CancelInvocation { invocation_id: "4".into() };
        assert_eq!(round_trip(&cancel, &PassthroughBinder), cancel);
    }

    #[test]
    fn test_close_with_error_and_reconnect() {
        let message = HubMessage::Close(CloseMessage {
            error: Some("bye".into()),
            allow_reconnect: true,
        });
        assert_eq!(round_trip(&message, &PassthroughBinder), message);
    }

    #[test]
    fn test_invocation_without_stream_ids() {
        let buf = frame(&MsgValue::Array(vec![
            MsgValue::from(1u8),
            MsgValue::Map(Vec::new()),
            MsgValue::Nil,
            MsgValue::from("Echo"),
            MsgValue::Array(vec![MsgValue::from("hi")]),
        ]));
        let (message, _) = MessagePackHubProtocol::new()
            .try_parse_message(&buf, &PassthroughBinder)
            .unwrap()
            .unwrap();
        assert_eq!(
            message,
            HubMessage::Invocation(InvocationMessage::new("Echo", vec![json!("hi")]))
        );
    }

    #[test]
    fn test_binary_argument_rejected_by_binding() {
        let buf = frame(&MsgValue::Array(vec![
            MsgValue::from(1u8),
            MsgValue::Map(Vec::new()),
            MsgValue::Nil,
            MsgValue::from("Concat"),
            MsgValue::Array(vec![MsgValue::Binary(vec![1, 2]), MsgValue::from(1u8)]),
        ]));
        let (message, _) = MessagePackHubProtocol::new()
            .try_parse_message(&buf, &TypedBinder)
            .unwrap()
            .unwrap();
        assert!(matches!(message, HubMessage::InvocationBindingFailure { .. }));
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let mut buf = frame(&MsgValue::Array(vec![MsgValue::from(99u8)]));
        buf.extend_from_slice(&MessagePackHubProtocol::new().message_bytes(&HubMessage::Ping).unwrap());
        let (message, consumed) = MessagePackHubProtocol::new()
            .try_parse_message(&buf, &PassthroughBinder)
            .unwrap()
            .unwrap();
        assert_eq!(message, HubMessage::Ping);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_frame_limit_enforced() {
        let protocol = MessagePackHubProtocol::with_max_frame_size(4);
        let bytes = protocol
            .message_bytes(&HubMessage::Invocation(InvocationMessage::new(
                "Long",
                vec![json!("payload")],
            )))
            .unwrap();
        assert!(matches!(
            protocol.try_parse_message(&bytes, &PassthroughBinder),
            Err(ProtocolError::Frame(FrameError::TooLarge { .. }))
        ));
    }

    #[test]
    fn test_non_array_payload_is_invalid() {
        let buf = frame(&MsgValue::from("hello"));
        assert!(MessagePackHubProtocol::new()
            .try_parse_message(&buf, &PassthroughBinder)
            .is_err());
    }
}
