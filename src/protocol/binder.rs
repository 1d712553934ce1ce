//! Argument binding between decoded values and declared parameter types.
//!
//! Some wire formats need to know target types before decoding, others
//! decode generically and convert afterwards. Both go through an
//! [`InvocationBinder`] so a failed bind becomes a tagged
//! [`HubMessage`](super::HubMessage) binding-failure value, never a parse
//! error that would tear down the connection.

use serde_json::{Map, Number, Value};

/// Declared type of a parameter, return value or stream item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// Any JSON value, passed through untouched.
    Any,
    /// Boolean.
    Bool,
    /// Signed integer.
    Int,
    /// Floating point number.
    Float,
    /// UTF-8 string.
    String,
    /// Array of any values.
    Array,
    /// Object / map.
    Object,
}

impl ParamType {
    /// Value a missing or null argument takes for this type.
    pub fn default_value(self) -> Value {
        match self {
            Self::Any | Self::String => Value::Null,
            Self::Bool => Value::Bool(false),
            Self::Int => Value::from(0),
            Self::Float => Value::from(0.0),
            Self::Array => Value::Array(Vec::new()),
            Self::Object => Value::Object(Map::new()),
        }
    }

    /// Convert `value` into this type.
    ///
    /// `null` becomes [`ParamType::default_value`]. Integral floats are
    /// accepted for `Int`; integers widen to `Float`.
    ///
    /// # Errors
    ///
    /// Returns a [`BindingError::TypeMismatch`] when no conversion applies.
    pub fn coerce(self, value: Value) -> Result<Value, BindingError> {
        if value.is_null() {
            return Ok(self.default_value());
        }

        let converted = match (self, value) {
            (Self::Any, v) => Some(v),
            (Self::Bool, v @ Value::Bool(_))
            | (Self::String, v @ Value::String(_))
            | (Self::Array, v @ Value::Array(_))
            | (Self::Object, v @ Value::Object(_)) => Some(v),
            (Self::Int, Value::Number(n)) => int_from_number(&n).map(Value::from),
            (Self::Float, Value::Number(n)) => {
                n.as_f64().and_then(Number::from_f64).map(Value::Number)
            }
            (_, other) => {
                return Err(BindingError::TypeMismatch {
                    expected: self,
                    found: json_type_name(&other),
                })
            }
        };

        converted.ok_or(BindingError::TypeMismatch {
            expected: self,
            found: "number",
        })
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

fn int_from_number(n: &Number) -> Option<i64> {
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    let f = n.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Why an invocation or stream item could not be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// No hub method with that name.
    UnknownTarget(String),
    /// No invocation with that id awaits a result.
    UnknownInvocation(String),
    /// No upload stream with that id is open.
    UnknownStream(String),
    /// Wrong number of arguments.
    ArgumentCount {
        /// Arguments the client sent.
        provided: usize,
        /// Parameters the method declares.
        expected: usize,
    },
    /// An argument could not be converted to its parameter type.
    TypeMismatch {
        /// Declared type.
        expected: ParamType,
        /// JSON type that arrived.
        found: &'static str,
    },
}

impl std::fmt::Display for BindingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTarget(target) => write!(f, "Unknown hub method '{target}'"),
            Self::UnknownInvocation(id) => write!(f, "Unknown invocation ID '{id}'."),
            Self::UnknownStream(id) => write!(f, "Unknown stream ID '{id}'."),
            Self::ArgumentCount { provided, expected } => write!(
                f,
                "Invocation provides {provided} argument(s) but target expects {expected}."
            ),
            Self::TypeMismatch { expected, found } => {
                write!(f, "Error binding arguments. Expected {expected}, found {found}.")
            }
        }
    }
}

impl std::error::Error for BindingError {}

/// Supplies expected types while decoding.
///
/// Implemented by the dispatcher per connection: parameter types come from
/// the method table, stream item types from the open upload streams.
pub trait InvocationBinder: Send + Sync {
    /// Parameter types of `target`, excluding upload-stream parameters.
    fn parameter_types(&self, target: &str) -> Result<Vec<ParamType>, BindingError>;

    /// Result type of the outstanding invocation `invocation_id`.
    fn return_type(&self, invocation_id: &str) -> Result<ParamType, BindingError>;

    /// Item type of the upload stream `stream_id`.
    fn stream_item_type(&self, stream_id: &str) -> Result<ParamType, BindingError>;

    /// Whether arguments are checked against [`Self::parameter_types`].
    ///
    /// Binders without a method table return `false` and arguments pass
    /// through untouched.
    fn binds_arguments(&self) -> bool {
        true
    }
}

/// Bind `arguments` to `target`'s declared parameter types.
///
/// # Errors
///
/// Returns the first binding error: unknown target, count mismatch, or a
/// type conversion failure.
pub fn bind_arguments(
    binder: &dyn InvocationBinder,
    target: &str,
    arguments: Vec<Value>,
) -> Result<Vec<Value>, BindingError> {
    if !binder.binds_arguments() {
        return Ok(arguments);
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
        .map(|(ty, arg)| ty.coerce(arg))
        .collect()
}

/// Binder that accepts anything: every target takes `Any` arguments of any count.
///
/// Useful for clients and tests that decode without a method table.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughBinder;

impl InvocationBinder for PassthroughBinder {
    fn parameter_types(&self, _target: &str) -> Result<Vec<ParamType>, BindingError> {
        Ok(Vec::new())
    }

    fn return_type(&self, _invocation_id: &str) -> Result<ParamType, BindingError> {
        Ok(ParamType::Any)
    }

    fn stream_item_type(&self, _stream_id: &str) -> Result<ParamType, BindingError> {
        Ok(ParamType::Any)
    }

    fn binds_arguments(&self) -> bool {
        false
    }
}
