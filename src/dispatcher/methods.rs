//! Hub method registration table.
//!
//! Methods are registered once at startup with their declared signature and
//! an invoker closure. The dispatcher only needs name lookup, the declared
//! types for binding, and the invoker.
//!
//! ```ignore
//! let methods = HubMethods::builder()
//!     .method("Echo", MethodSpec::new(vec![ParamType::String]), |_ctx, args| async move {
//!         Ok(HubReturn::Value(args[0].clone()))
//!     })
//!     .build();
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;

use super::HubCallContext;
use crate::protocol::ParamType;

/// Declared signature of a hub method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodSpec {
    /// Types of the positional arguments sent inline.
    pub parameters: Vec<ParamType>,
    /// Item types of the upload-stream parameters, in declaration order.
    pub upload_streams: Vec<ParamType>,
    /// Whether results are streamed back (the method must be invoked with a
    /// StreamInvocation and return [`HubReturn::Stream`]).
    pub streaming: bool,
}

impl MethodSpec {
    /// Non-streaming method taking `parameters`.
    pub fn new(parameters: Vec<ParamType>) -> Self {
        Self {
            parameters,
            ..Self::default()
        }
    }

    /// Mark the method as streaming its results.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Add an upload-stream parameter whose items have type `item_type`.
    pub fn with_upload_stream(mut self, item_type: ParamType) -> Self {
        self.upload_streams.push(item_type);
        self
    }
}

/// What a hub method produced.
pub enum HubReturn {
    /// Nothing; an empty Completion is sent when the caller supplied an id.
    Void,
    /// A single result.
    Value(Value),
    /// A sequence of results sent as stream items.
    Stream(BoxStream<'static, anyhow::Result<Value>>),
}

impl std::fmt::Debug for HubReturn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Void => f.write_str("Void"),
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl HubReturn {
    /// Serialize `value` into a result.
    pub fn value<T: Serialize>(value: T) -> anyhow::Result<Self> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }

    /// Wrap a stream of results.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }
}

/// Error whose message is always sent to the client.
///
/// Any other error a method returns is reported generically unless detailed
/// errors are enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubException(String);

impl HubException {
    /// Create an exception with a client-visible message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The message.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HubException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HubException {}

/// Type-erased method body.
pub type HubInvoker =
    Arc<dyn Fn(HubCallContext, Vec<Value>) -> BoxFuture<'static, anyhow::Result<HubReturn>> + Send + Sync>;

/// Hook run after a client connects.
pub type ConnectedHook =
    Arc<dyn Fn(HubCallContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Hook run when a client disconnects, with the close error if any.
pub type DisconnectedHook = Arc<
    dyn Fn(HubCallContext, Option<String>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;

/// A registered method.
#[derive(Clone)]
pub struct HubMethod {
    spec: MethodSpec,
    invoker: HubInvoker,
}

impl HubMethod {
    /// Declared signature.
    pub fn spec(&self) -> &MethodSpec {
        &self.spec
    }

    /// Run the method body.
    pub fn invoke(&self, ctx: HubCallContext, args: Vec<Value>) -> BoxFuture<'static, anyhow::Result<HubReturn>> {
        (self.invoker)(ctx, args)
    }
}

impl std::fmt::Debug for HubMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubMethod")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Name → method table plus connection hooks.
#[derive(Default, Clone)]
pub struct HubMethods {
    methods: HashMap<String, HubMethod>,
    on_connected: Option<ConnectedHook>,
    on_disconnected: Option<DisconnectedHook>,
}

impl std::fmt::Debug for HubMethods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("HubMethods")
            .field("methods", &names)
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .finish()
    }
}

impl HubMethods {
    /// Start building a table.
    pub fn builder() -> HubMethodsBuilder {
        HubMethodsBuilder::default()
    }

    /// Exact, case-sensitive lookup.
    pub fn get(&self, name: &str) -> Option<&HubMethod> {
        self.methods.get(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn on_connected(&self) -> Option<&ConnectedHook> {
        self.on_connected.as_ref()
    }

    pub(crate) fn on_disconnected(&self) -> Option<&DisconnectedHook> {
        self.on_disconnected.as_ref()
    }
}

/// Builder for [`HubMethods`].
#[derive(Default)]
pub struct HubMethodsBuilder {
    table: HubMethods,
}

impl std::fmt::Debug for HubMethodsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubMethodsBuilder")
            .field("table", &self.table)
            .finish()
    }
}

impl HubMethodsBuilder {
    /// Register `name`. A later registration with the same name replaces
    /// the earlier one.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, spec: MethodSpec, body: F) -> Self
    where
        F: Fn(HubCallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HubReturn>> + Send + 'static,
    {
        let invoker: HubInvoker = Arc::new(move |ctx, args| body(ctx, args).boxed());
        self.table
            .methods
            .insert(name.into(), HubMethod { spec, invoker });
        self
    }

    /// Run `hook` after each client connects. An error closes the connection.
    pub fn on_connected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HubCallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.table.on_connected = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }

    /// Run `hook` when each client disconnects.
    pub fn on_disconnected<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HubCallContext, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.table.on_disconnected = Some(Arc::new(move |ctx, error| hook(ctx, error).boxed()));
        self
    }

    /// Finish the table.
    pub fn build(self) -> HubMethods {
        self.table
    }
}
