//! CBOR hub protocol.
//!
//! Messages are CBOR arrays in positional layout, varint length-prefixed:
//!
//! ```text
//! Invocation:        [1, headers, invocationId|null, target, [args], [streamIds]]
//! StreamItem:        [2, headers, invocationId, item]
//! Completion:        [3, headers, invocationId, kind, result?]   kind: 1 error, 2 void, 3 result
//! StreamInvocation:  [4, headers, invocationId, target, [args], [streamIds]]
//! CancelInvocation:  [5, headers, invocationId]
//! Ping:              [6]
//! Close:             [7, error|null, allowReconnect]
//! ```
//!
//! `headers` is a map; it is written empty and ignored on read. Parameter
//! types are looked up before the arguments are converted out of CBOR.

use bytes::BytesMut;
use ciborium::value::{Integer, Value as CborValue};
use log::debug;
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
pub const PROTOCOL_NAME: &str = "cbor";

const PROTOCOL_VERSION: u32 = 1;

const RESULT_KIND_ERROR: u8 = 1;
const RESULT_KIND_VOID: u8 = 2;
const RESULT_KIND_NON_VOID: u8 = 3;

/// CBOR array encoding over varint length-prefixed framing.
#[derive(Debug, Clone, Copy)]
pub struct CborHubProtocol {
    max_frame_size: usize,
}

impl Default for CborHubProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl CborHubProtocol {
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
        let value: CborValue = ciborium::from_reader(payload)
            .map_err(|e| ProtocolError::InvalidData(format!("Error reading CBOR: {e}")))?;
        let CborValue::Array(items) = value else {
            return Err(ProtocolError::InvalidData(
                "Message must be a CBOR array.".to_string(),
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
                        let raw = cbor_to_json(fields.next("result")?).map_err(|found| {
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
                // Older peers omit the flag.
                let allow_reconnect = match fields.try_next() {
                    None | Some(CborValue::Null) => false,
                    Some(CborValue::Bool(b)) => b,
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
                debug!("[Protocol] Ignoring unknown CBOR message type {kind}");
                return Ok(None);
            }
        };

        Ok(Some(message))
    }
}

impl HubProtocol for CborHubProtocol {
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
        let value = to_cbor(message)?;
        let mut payload = Vec::new();
        ciborium::into_writer(&value, &mut payload)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        binary::write_frame(&payload, out);
        Ok(())
    }
}

/// Positional reader over a decoded message array.
struct Fields {
    items: std::vec::IntoIter<CborValue>,
}

impl Fields {
    fn new(items: Vec<CborValue>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    fn try_next(&mut self) -> Option<CborValue> {
        self.items.next()
    }

    fn next(&mut self, field: &str) -> Result<CborValue, ProtocolError> {
        self.items.next().ok_or_else(|| {
            ProtocolError::InvalidData(format!("Reading '{field}' failed: message too short."))
        })
    }

    fn integer(&mut self, field: &str) -> Result<i128, ProtocolError> {
        match self.next(field)? {
            CborValue::Integer(i) => Ok(i128::from(i)),
            _ => Err(expected(field, "an integer")),
        }
    }

    fn string(&mut self, field: &str) -> Result<String, ProtocolError> {
        self.optional_string(field)?.ok_or_else(|| expected(field, "a string"))
    }

    fn optional_string(&mut self, field: &str) -> Result<Option<String>, ProtocolError> {
        match self.next(field)? {
            CborValue::Null => Ok(None),
            CborValue::Text(s) => Ok(Some(s)),
            _ => Err(expected(field, "a string")),
        }
    }

    fn array(&mut self, field: &str) -> Result<Vec<CborValue>, ProtocolError> {
        match self.next(field)? {
            CborValue::Array(items) => Ok(items),
            _ => Err(expected(field, "an array")),
        }
    }

    fn skip_headers(&mut self) -> Result<(), ProtocolError> {
        match self.next("headers")? {
            CborValue::Map(_) | CborValue::Null => Ok(()),
            _ => Err(expected("headers", "a map")),
        }
    }

    /// Trailing stream ids; absent in messages from peers without upload streams.
    fn stream_ids(&mut self) -> Result<Vec<String>, ProtocolError> {
        match self.try_next() {
            None | Some(CborValue::Null) => Ok(Vec::new()),
            Some(CborValue::Array(ids)) => ids
                .into_iter()
                .map(|id| match id {
                    CborValue::Text(s) => Ok(s),
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

/// Bind CBOR arguments against `target`'s parameter types.
///
/// Types are resolved first so a count mismatch is reported before any
/// conversion work happens.
fn bind_arguments(
    binder: &dyn InvocationBinder,
    target: &str,
    arguments: Vec<CborValue>,
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

fn bind_value(ty: ParamType, value: CborValue) -> Result<Value, BindingError> {
    let json = cbor_to_json(value).map_err(|found| BindingError::TypeMismatch {
        expected: ty,
        found,
    })?;
    ty.coerce(json)
}

/// Convert a CBOR value into JSON. The error names the unsupported CBOR type.
fn cbor_to_json(value: CborValue) -> Result<Value, &'static str> {
    Ok(match value {
        CborValue::Null => Value::Null,
        CborValue::Bool(b) => Value::Bool(b),
        CborValue::Integer(i) => {
            let wide = i128::from(i);
            if let Ok(n) = i64::try_from(wide) {
                Value::from(n)
            } else if let Ok(n) = u64::try_from(wide) {
                Value::from(n)
            } else {
                return Err("integer out of range");
            }
        }
        CborValue::Float(f) => Number::from_f64(f).map(Value::Number).ok_or("non-finite float")?,
        CborValue::Text(s) => Value::String(s),
        CborValue::Array(items) => Value::Array(
            items
                .into_iter()
                .map(cbor_to_json)
                .collect::<Result<_, _>>()?,
        ),
        CborValue::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let CborValue::Text(key) = key else {
                    return Err("map with non-string keys");
                };
                map.insert(key, cbor_to_json(value)?);
            }
            Value::Object(map)
        }
        CborValue::Tag(_, inner) => cbor_to_json(*inner)?,
        CborValue::Bytes(_) => return Err("bytes"),
        _ => return Err("unsupported value"),
    })
}

fn json_to_cbor(value: &Value) -> CborValue {
    match value {
        Value::Null => CborValue::Null,
        Value::Bool(b) => CborValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CborValue::Integer(Integer::from(i))
            } else if let Some(u) = n.as_u64() {
                CborValue::Integer(Integer::from(u))
            } else {
                CborValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => CborValue::Text(s.clone()),
        Value::Array(items) => CborValue::Array(items.iter().map(json_to_cbor).collect()),
        Value::Object(map) => CborValue::Map(
            map.iter()
                .map(|(k, v)| (CborValue::Text(k.clone()), json_to_cbor(v)))
                .collect(),
        ),
    }
}

fn text_array(items: &[String]) -> CborValue {
    CborValue::Array(items.iter().cloned().map(CborValue::Text).collect())
}

fn to_cbor(message: &HubMessage) -> Result<CborValue, ProtocolError> {
    let headers = || CborValue::Map(Vec::new());
    let kind = |t: u8| CborValue::Integer(Integer::from(t));

    let items = match message {
        HubMessage::Invocation(inv) => vec![
            kind(message_type::INVOCATION),
            headers(),
            inv.invocation_id.clone().map_or(CborValue::Null, CborValue::Text),
            CborValue::Text(inv.target.clone()),
            CborValue::Array(inv.arguments.iter().map(json_to_cbor).collect()),
            text_array(&inv.stream_ids),
        ],
        HubMessage::StreamInvocation(inv) => vec![
            kind(message_type::STREAM_INVOCATION),
            headers(),
            CborValue::Text(inv.invocation_id.clone()),
            CborValue::Text(inv.target.clone()),
            CborValue::Array(inv.arguments.iter().map(json_to_cbor).collect()),
            text_array(&inv.stream_ids),
        ],
        HubMessage::StreamItem(item) => vec![
            kind(message_type::STREAM_ITEM),
            headers(),
            CborValue::Text(item.invocation_id.clone()),
            json_to_cbor(&item.item),
        ],
        HubMessage::Completion(completion) => {
            let mut items = vec![
                kind(message_type::COMPLETION),
                headers(),
                CborValue::Text(completion.invocation_id.clone()),
            ];
            match &completion.outcome {
                CompletionOutcome::Empty => items.push(kind(RESULT_KIND_VOID)),
                CompletionOutcome::Result(result) => {
                    items.push(kind(RESULT_KIND_NON_VOID));
                    items.push(json_to_cbor(result));
                }
                CompletionOutcome::Error(error) => {
                    items.push(kind(RESULT_KIND_ERROR));
                    items.push(CborValue::Text(error.clone()));
                }
            }
            items
        }
        HubMessage::CancelInvocation { invocation_id } => vec![
            kind(message_type::CANCEL_INVOCATION),
            headers(),
            CborValue::Text(invocation_id.clone()),
        ],
        HubMessage::Ping => vec![kind(message_type::PING)],
        HubMessage::Close(close) => vec![
            kind(message_type::CLOSE),
            close.error.clone().map_or(CborValue::Null, CborValue::Text),
            CborValue::Bool(close.allow_reconnect),
        ],
        HubMessage::InvocationBindingFailure { .. } | HubMessage::StreamBindingFailure { .. } => {
            return Err(ProtocolError::Serialization(format!(
                "{} messages cannot be written",
                message.kind()
            )))
        }
    };
    Ok(CborValue::Array(items))
}
