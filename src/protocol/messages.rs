//! Typed hub message model shared by every hub protocol.
//!
//! Arguments, results and stream items travel as [`serde_json::Value`]
//! regardless of the wire format; each protocol converts to and from its own
//! representation.

use serde_json::Value;

/// Invocation of a hub method, optionally expecting a [`CompletionMessage`].
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationMessage {
    /// Present when the caller wants a completion back.
    pub invocation_id: Option<String>,
    /// Method name.
    pub target: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
    /// Client-to-server streams feeding upload parameters.
    pub stream_ids: Vec<String>,
}

impl InvocationMessage {
    /// Fire-and-forget invocation (no completion expected).
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            invocation_id: None,
            target: target.into(),
            arguments,
            stream_ids: Vec::new(),
        }
    }

    /// Invocation that expects a completion with `invocation_id`.
    pub fn with_id(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self {
            invocation_id: Some(invocation_id.into()),
            ..Self::new(target, arguments)
        }
    }

    /// Attach upload stream ids.
    pub fn with_streams(mut self, stream_ids: Vec<String>) -> Self {
        self.stream_ids = stream_ids;
        self
    }
}

/// Invocation whose results are streamed back as [`StreamItemMessage`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInvocationMessage {
    /// Id shared by every item and the final completion.
    pub invocation_id: String,
    /// Method name.
    pub target: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
    /// Client-to-server streams feeding upload parameters.
    pub stream_ids: Vec<String>,
}

/// One item of a stream, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItemMessage {
    /// Invocation id (server streams) or stream id (upload streams).
    pub invocation_id: String,
    /// The item.
    pub item: Value,
}

/// What a completion carries. Result and error are mutually exclusive.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// Success without a value.
    Empty,
    /// Success with a value.
    Result(Value),
    /// Failure.
    Error(String),
}

/// Terminal reply to an invocation or upload stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    /// Id of the invocation or stream being completed.
    pub invocation_id: String,
    /// Outcome.
    pub outcome: CompletionOutcome,
}

impl CompletionMessage {
    /// Successful completion without a result.
    pub fn empty(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Empty,
        }
    }

    /// Successful completion carrying `result`.
    pub fn with_result(invocation_id: impl Into<String>, result: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Result(result),
        }
    }

    /// Failed completion.
    pub fn with_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Error(error.into()),
        }
    }

    /// True when the completion carries a result value.
    pub fn has_result(&self) -> bool {
        matches!(self.outcome, CompletionOutcome::Result(_))
    }

    /// The result, if any.
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            CompletionOutcome::Result(value) => Some(value),
            _ => None,
        }
    }

    /// The error, if any.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            CompletionOutcome::Error(error) => Some(error),
            _ => None,
        }
    }
}

/// Close notification, optionally carrying the reason.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CloseMessage {
    /// Error that caused the close, if any.
    pub error: Option<String>,
    /// Whether the client may reconnect.
    pub allow_reconnect: bool,
}

/// Every message exchanged after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Non-streaming invocation.
    Invocation(InvocationMessage),
    /// Server-to-client streaming invocation.
    StreamInvocation(StreamInvocationMessage),
    /// Stream item.
    StreamItem(StreamItemMessage),
    /// Invocation or stream completion.
    Completion(CompletionMessage),
    /// Cancel a streaming invocation.
    CancelInvocation {
        /// Id of the stream invocation to cancel.
        invocation_id: String,
    },
    /// Keepalive.
    Ping,
    /// Connection close.
    Close(CloseMessage),
    /// An invocation whose arguments could not be bound.
    ///
    /// Produced by the decoder, never written to the wire.
    InvocationBindingFailure {
        /// Invocation id, if the client asked for a completion.
        invocation_id: Option<String>,
        /// Method name the client targeted.
        target: String,
        /// Binding error description.
        error: String,
    },
    /// A stream item whose payload could not be bound.
    ///
    /// Produced by the decoder, never written to the wire.
    StreamBindingFailure {
        /// Stream id.
        id: String,
        /// Binding error description.
        error: String,
    },
}

impl HubMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invocation(_) => "Invocation",
            Self::StreamInvocation(_) => "StreamInvocation",
            Self::StreamItem(_) => "StreamItem",
            Self::Completion(_) => "Completion",
            Self::CancelInvocation { .. } => "CancelInvocation",
            Self::Ping => "Ping",
            Self::Close(_) => "Close",
            Self::InvocationBindingFailure { .. } => "InvocationBindingFailure",
            Self::StreamBindingFailure { .. } => "StreamBindingFailure",
        }
    }
}

/// Numeric message type tags shared by the JSON and CBOR encodings.
pub mod message_type {
    /// [`super::HubMessage::Invocation`].
    pub const INVOCATION: u8 = 1;
    /// [`super::HubMessage::StreamItem`].
    pub const STREAM_ITEM: u8 = 2;
    /// [`super::HubMessage::Completion`].
    pub const COMPLETION: u8 = 3;
    /// [`super::HubMessage::StreamInvocation`].
    pub const STREAM_INVOCATION: u8 = 4;
    /// [`super::HubMessage::CancelInvocation`].
    pub const CANCEL_INVOCATION: u8 = 5;
    /// [`super::HubMessage::Ping`].
    pub const PING: u8 = 6;
    /// [`super::HubMessage::Close`].
    pub const CLOSE: u8 = 7;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completion_outcomes_are_exclusive() {
        let ok = CompletionMessage::with_result("1", json!(42));
        assert!(ok.has_result());
        assert_eq!(ok.result(), Some(&json!(42)));
        assert_eq!(ok.error(), None);

        let failed = CompletionMessage::with_error("2", "boom");
        assert!(!failed.has_result());
        assert_eq!(failed.error(), Some("boom"));

        let empty = CompletionMessage::empty("3");
        assert!(!empty.has_result());
        assert_eq!(empty.result(), None);
        assert_eq!(empty.error(), None);
    }

    #[test]
    fn test_result_of_null_still_counts_as_result() {
        let msg = CompletionMessage::with_result("1", Value::Null);
        assert!(msg.has_result());
    }
}
