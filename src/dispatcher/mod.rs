//! Invocation dispatch: routes decoded messages to hub methods.
//!
//! # Architecture
//!
//! ```text
//! HubDispatcher (shared)                 ConnectionDispatcher (one per connection)
//!   ├── HubMethods (name → invoker)        ├── StreamTracker   (upload streams)
//!   ├── lifetime manager                   ├── in-flight invocation ids
//!   └── options                            ├── streaming cancel tokens
//!                                          └── parallel-invocation semaphore
//! ```
//!
//! Each invocation runs on its own task. Plain invocations wait for a
//! parallel-invocation permit on that task, so the read loop keeps reading
//! (and keeps the client timeout fed) while the connection is at its limit;
//! it only waits when an upload stream is full. Items of one server stream
//! are written by a single task, in the order the method produces them.
//! A panicking method completes with an error like a failing one.

pub mod methods;
pub mod streams;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub use methods::{HubException, HubMethod, HubMethods, HubMethodsBuilder, HubReturn, MethodSpec};
pub use streams::{StreamTracker, UploadStream, UploadStreamError};

use crate::connection::HubConnectionContext;
use crate::lifetime::{GroupManager, HubCallerClients, HubLifetimeManager};
use crate::protocol::{
    BindingError, CompletionMessage, CompletionOutcome, HubMessage, InvocationBinder, ParamType,
    StreamItemMessage,
};

/// Completion error for a stream that failed mid-way.
const STREAM_ERROR: &str = "An error occurred on the server while streaming results.";

fn missing_method_message(target: &str) -> String {
    format!(
        "Failed to invoke '{target}' due to an error on the server. HubException: Method does not exist."
    )
}

fn invoke_failed_message(target: &str) -> String {
    format!("Failed to invoke '{target}' due to an error on the server.")
}

fn unexpected_error_message(target: &str) -> String {
    format!("An unexpected error occurred invoking '{target}' on the server.")
}

/// Build a client-facing error: `base`, plus the error text when it is a
/// [`HubException`] or detailed errors are on.
fn error_message(base: &str, err: &anyhow::Error, detailed: bool) -> String {
    if let Some(hub) = err.downcast_ref::<HubException>() {
        format!("{base} HubException: {hub}")
    } else if detailed {
        format!("{base} {err}")
    } else {
        base.to_string()
    }
}

/// Text of a panic payload, when it carries one.
fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        *text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.as_str()
    } else {
        "Box<dyn Any>"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-call context handed to a hub method.
pub struct HubCallContext {
    connection: Arc<HubConnectionContext>,
    clients: HubCallerClients,
    groups: GroupManager,
    cancellation: CancellationToken,
    invocation_id: Option<String>,
    upload_streams: Vec<UploadStream>,
}

impl std::fmt::Debug for HubCallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubCallContext")
            .field("connection_id", &self.connection.connection_id())
            .field("invocation_id", &self.invocation_id)
            .field("upload_streams", &self.upload_streams.len())
            .finish_non_exhaustive()
    }
}

impl HubCallContext {
    /// The calling connection.
    pub fn connection(&self) -> &Arc<HubConnectionContext> {
        &self.connection
    }

    /// Id of the calling connection.
    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    /// User of the calling connection, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.connection.user_id()
    }

    /// Invocation id, when the caller expects a completion.
    pub fn invocation_id(&self) -> Option<&str> {
        self.invocation_id.as_deref()
    }

    /// Send to clients relative to the caller.
    pub fn clients(&self) -> &HubCallerClients {
        &self.clients
    }

    /// Manage group membership.
    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    /// Cancelled when the connection aborts, or when the client cancels a
    /// streaming invocation.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// True once [`cancellation`](Self::cancellation) has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Take the next upload stream, in declaration order.
    pub fn take_upload_stream(&mut self) -> Option<UploadStream> {
        if self.upload_streams.is_empty() {
            None
        } else {
            Some(self.upload_streams.remove(0))
        }
    }

    /// Take all remaining upload streams.
    pub fn take_upload_streams(&mut self) -> Vec<UploadStream> {
        std::mem::take(&mut self.upload_streams)
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherOptions {
    /// Include error details in completions and close messages.
    pub enable_detailed_errors: bool,
    /// Concurrent non-streaming invocations allowed per connection.
    pub maximum_parallel_invocations: usize,
    /// Buffered items per upload stream.
    pub stream_buffer_capacity: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            enable_detailed_errors: false,
            maximum_parallel_invocations: crate::constants::DEFAULT_MAX_PARALLEL_INVOCATIONS,
            stream_buffer_capacity: crate::constants::DEFAULT_STREAM_BUFFER_CAPACITY,
        }
    }
}

/// Hub-wide dispatcher shared by every connection.
pub struct HubDispatcher {
    methods: Arc<HubMethods>,
    lifetime: Arc<dyn HubLifetimeManager>,
    options: DispatcherOptions,
}

impl std::fmt::Debug for HubDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubDispatcher")
            .field("methods", &self.methods)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// What the read loop should do after a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Keep reading.
    Continue,
    /// The client sent Close, with its error if any.
    Close(Option<String>),
}

impl HubDispatcher {
    /// Create a dispatcher over `methods`.
    pub fn new(
        methods: Arc<HubMethods>,
        lifetime: Arc<dyn HubLifetimeManager>,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            methods,
            lifetime,
            options,
        }
    }

    /// Registered methods.
    pub fn methods(&self) -> &HubMethods {
        &self.methods
    }

    /// Settings.
    pub fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    fn call_context(
        &self,
        connection: &Arc<HubConnectionContext>,
        cancellation: CancellationToken,
        invocation_id: Option<String>,
        upload_streams: Vec<UploadStream>,
    ) -> HubCallContext {
        HubCallContext {
            connection: Arc::clone(connection),
            clients: HubCallerClients::new(
                Arc::clone(&self.lifetime),
                connection.connection_id().to_string(),
            ),
            groups: GroupManager::new(Arc::clone(&self.lifetime)),
            cancellation,
            invocation_id,
            upload_streams,
        }
    }

    /// Start dispatching for a newly active connection.
    pub fn attach(self: &Arc<Self>, connection: Arc<HubConnectionContext>) -> ConnectionDispatcher {
        ConnectionDispatcher {
            hub: Arc::clone(self),
            state: Arc::new(InvocationState {
                uploads: StreamTracker::new(),
                in_flight: Mutex::new(HashSet::new()),
                streaming: Mutex::new(HashMap::new()),
                parallel: Arc::new(Semaphore::new(self.options.maximum_parallel_invocations.max(1))),
            }),
            connection,
        }
    }

    /// Run the on-connected hook, if any.
    pub async fn on_connected(&self, connection: &Arc<HubConnectionContext>) -> anyhow::Result<()> {
        let Some(hook) = self.methods.on_connected() else {
            return Ok(());
        };
        let ctx = self.call_context(connection, connection.abort_token().clone(), None, Vec::new());
        hook(ctx).await
    }

    /// Run the on-disconnected hook, if any.
    pub async fn on_disconnected(
        &self,
        connection: &Arc<HubConnectionContext>,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        let Some(hook) = self.methods.on_disconnected() else {
            return Ok(());
        };
        let ctx = self.call_context(connection, connection.abort_token().clone(), None, Vec::new());
        hook(ctx, error).await
    }
}

/// Bookkeeping for the invocations of one connection.
struct InvocationState {
    uploads: StreamTracker,
    /// Ids of invocations awaiting a completion.
    in_flight: Mutex<HashSet<String>>,
    /// Cancel tokens of server-to-client streams, by invocation id.
    streaming: Mutex<HashMap<String, CancellationToken>>,
    parallel: Arc<Semaphore>,
}

impl InvocationState {
    fn release(&self, invocation_id: Option<&str>, stream_ids: &[String]) {
        if let Some(id) = invocation_id {
            lock(&self.in_flight).remove(id);
            lock(&self.streaming).remove(id);
        }
        self.uploads.remove(stream_ids);
    }
}

/// A decoded invocation, streaming or not.
struct Invocation {
    invocation_id: Option<String>,
    target: String,
    arguments: Vec<Value>,
    stream_ids: Vec<String>,
    streaming: bool,
}

/// Dispatch state for one connection. Also the connection's
/// [`InvocationBinder`].
pub struct ConnectionDispatcher {
    hub: Arc<HubDispatcher>,
    connection: Arc<HubConnectionContext>,
    state: Arc<InvocationState>,
}

impl std::fmt::Debug for ConnectionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDispatcher")
            .field("connection_id", &self.connection.connection_id())
            .field("upload_streams", &self.state.uploads.len())
            .finish_non_exhaustive()
    }
}

impl InvocationBinder for ConnectionDispatcher {
    fn parameter_types(&self, target: &str) -> Result<Vec<ParamType>, BindingError> {
        self.hub
            .methods
            .get(target)
            .map(|method| method.spec().parameters.clone())
            .ok_or_else(|| BindingError::UnknownTarget(target.to_string()))
    }

    fn return_type(&self, invocation_id: &str) -> Result<ParamType, BindingError> {
        // The server never invokes client methods expecting a result.
        Err(BindingError::UnknownInvocation(invocation_id.to_string()))
    }

    fn stream_item_type(&self, stream_id: &str) -> Result<ParamType, BindingError> {
        self.state
            .uploads
            .item_type(stream_id)
            .ok_or_else(|| BindingError::UnknownStream(stream_id.to_string()))
    }
}

impl ConnectionDispatcher {
    /// Handle one decoded message.
    pub async fn dispatch(&self, message: HubMessage) -> DispatchOutcome {
        match message {
            HubMessage::Invocation(inv) => {
                self.invoke(Invocation {
                    invocation_id: inv.invocation_id,
                    target: inv.target,
                    arguments: inv.arguments,
                    stream_ids: inv.stream_ids,
                    streaming: false,
                })
                .await;
            }
            HubMessage::StreamInvocation(inv) => {
                self.invoke(Invocation {
                    invocation_id: Some(inv.invocation_id),
                    target: inv.target,
                    arguments: inv.arguments,
                    stream_ids: inv.stream_ids,
                    streaming: true,
                })
                .await;
            }
            HubMessage::StreamItem(StreamItemMessage { invocation_id, item }) => {
                let pushed = tokio::select! {
                    biased;
                    () = self.connection.aborted() => true,
                    pushed = self.state.uploads.push(&invocation_id, item) => pushed,
                };
                if !pushed {
                    warn!(
                        "[Dispatch] {} sent StreamItem for unknown stream '{invocation_id}'",
                        self.connection.connection_id()
                    );
                }
            }
            HubMessage::Completion(completion) => {
                let error = completion.error().map(str::to_string);
                let known = tokio::select! {
                    biased;
                    () = self.connection.aborted() => true,
                    known = self.state.uploads.complete(&completion.invocation_id, error) => known,
                };
                if !known {
                    warn!(
                        "[Dispatch] {} sent Completion for unknown stream '{}'",
                        self.connection.connection_id(),
                        completion.invocation_id
                    );
                }
            }
            HubMessage::CancelInvocation { invocation_id } => {
                match lock(&self.state.streaming).get(&invocation_id) {
                    Some(token) => token.cancel(),
                    None => debug!(
                        "[Dispatch] CancelInvocation for unknown stream invocation '{invocation_id}'"
                    ),
                }
            }
            HubMessage::InvocationBindingFailure {
                invocation_id,
                target,
                error,
            } => {
                warn!(
                    "[Dispatch] {} failed to bind arguments for '{target}': {error}",
                    self.connection.connection_id()
                );
                let message = if self.hub.methods.get(&target).is_none() {
                    missing_method_message(&target)
                } else if self.hub.options.enable_detailed_errors {
                    format!("{} {error}", invoke_failed_message(&target))
                } else {
                    invoke_failed_message(&target)
                };
                self.complete_with_error(invocation_id.as_deref(), message);
            }
            HubMessage::StreamBindingFailure { id, error } => {
                warn!(
                    "[Dispatch] {} sent an unbindable item for stream '{id}': {error}",
                    self.connection.connection_id()
                );
                let faulted = tokio::select! {
                    biased;
                    () = self.connection.aborted() => true,
                    known = self.state.uploads.complete(&id, Some(error)) => known,
                };
                if !faulted {
                    debug!("[Dispatch] Stream '{id}' was not open");
                }
            }
            HubMessage::Ping => {}
            HubMessage::Close(close) => {
                info!(
                    "[Dispatch] {} sent Close{}",
                    self.connection.connection_id(),
                    close.error.as_deref().map(|e| format!(": {e}")).unwrap_or_default()
                );
                return DispatchOutcome::Close(close.error);
            }
        }
        DispatchOutcome::Continue
    }

    /// Drop every open upload stream. Readers see the connection abort.
    pub fn shutdown(&self) {
        self.state.uploads.clear();
        for token in lock(&self.state.streaming).values() {
            token.cancel();
        }
    }

    fn complete_with_error(&self, invocation_id: Option<&str>, error: String) {
        match invocation_id {
            Some(id) => {
                self.connection
                    .write_message(&HubMessage::Completion(CompletionMessage::with_error(id, error)));
            }
            None => debug!("[Dispatch] Dropping error for fire-and-forget invocation: {error}"),
        }
    }

    async fn invoke(&self, request: Invocation) {
        let Invocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
            streaming,
        } = request;
        let id = invocation_id.as_deref();

        let Some(method) = self.hub.methods.get(&target).cloned() else {
            warn!("[Dispatch] Unknown hub method '{target}'");
            self.complete_with_error(id, missing_method_message(&target));
            return;
        };
        let spec = method.spec();

        if spec.streaming != streaming {
            let message = if spec.streaming {
                format!(
                    "The client attempted to invoke the streaming '{target}' method with a non-streaming invocation."
                )
            } else {
                format!(
                    "The client attempted to invoke the non-streaming '{target}' method with a streaming invocation."
                )
            };
            self.complete_with_error(id, message);
            return;
        }

        if stream_ids.len() != spec.upload_streams.len() {
            let message = format!(
                "{} HubException: Client sent {} stream(s), Hub method expects {}.",
                invoke_failed_message(&target),
                stream_ids.len(),
                spec.upload_streams.len()
            );
            self.complete_with_error(id, message);
            return;
        }

        if let Some(id) = id {
            if !lock(&self.state.in_flight).insert(id.to_string()) {
                self.complete_with_error(Some(id), format!("Invocation ID '{id}' is already in use."));
                return;
            }
        }

        let abort = self.connection.abort_token();
        let mut uploads = Vec::with_capacity(stream_ids.len());
        for (stream_id, item_type) in stream_ids.iter().zip(&spec.upload_streams) {
            match self.state.uploads.open(
                stream_id,
                *item_type,
                self.hub.options.stream_buffer_capacity,
                abort.clone(),
            ) {
                Some(upload) => uploads.push(upload),
                None => {
                    warn!("[Dispatch] Stream ID '{stream_id}' is already in use");
                    let opened: Vec<String> =
                        uploads.iter().map(|u: &UploadStream| u.id().to_string()).collect();
                    self.state.release(id, &opened);
                    self.complete_with_error(id, invoke_failed_message(&target));
                    return;
                }
            }
        }

        // Plain invocations count against the per-connection limit.
        let limit = (!streaming && stream_ids.is_empty()).then(|| Arc::clone(&self.state.parallel));

        let cancellation = abort.child_token();
        if streaming {
            if let Some(id) = id {
                lock(&self.state.streaming).insert(id.to_string(), cancellation.clone());
            }
        }

        debug!(
            "[Dispatch] {} invoking '{target}'{}",
            self.connection.connection_id(),
            id.map(|id| format!(" (id {id})")).unwrap_or_default()
        );

        let ctx = self
            .hub
            .call_context(&self.connection, cancellation.clone(), invocation_id.clone(), uploads);
        let connection = Arc::clone(&self.connection);
        let state = Arc::clone(&self.state);
        let detailed = self.hub.options.enable_detailed_errors;

        tokio::spawn(async move {
            let id = invocation_id.as_deref();
            let permit = match limit {
                Some(limit) => tokio::select! {
                    biased;
                    () = connection.aborted() => {
                        state.release(id, &stream_ids);
                        return;
                    }
                    permit = limit.acquire_owned() => permit.ok(),
                },
                None => None,
            };

            let call = AssertUnwindSafe(async move { method.invoke(ctx, arguments).await });
            let result = match call.catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(anyhow::anyhow!(
                    "Hub method '{target}' panicked: {}",
                    panic_text(payload.as_ref())
                )),
            };

            match (streaming, result) {
                (true, Ok(HubReturn::Stream(stream))) => {
                    if let Some(id) = id {
                        let drain = stream_results(&connection, id, stream, &cancellation, detailed);
                        if let Err(payload) = AssertUnwindSafe(drain).catch_unwind().await {
                            let err = anyhow::anyhow!(
                                "Stream '{id}' panicked: {}",
                                panic_text(payload.as_ref())
                            );
                            warn!("[Dispatch] {err}");
                            if !connection.is_aborted() {
                                connection.write_message(&HubMessage::Completion(
                                    CompletionMessage::with_error(
                                        id,
                                        error_message(STREAM_ERROR, &err, detailed),
                                    ),
                                ));
                            }
                        }
                    }
                }
                (false, Ok(HubReturn::Void)) => {
                    if let Some(id) = id {
                        connection.write_message(&HubMessage::Completion(CompletionMessage::empty(id)));
                    }
                }
                (false, Ok(HubReturn::Value(value))) => {
                    if let Some(id) = id {
                        connection.write_message(&HubMessage::Completion(
                            CompletionMessage::with_result(id, value),
                        ));
                    }
                }
                (_, Ok(other)) => {
                    let err = anyhow::anyhow!("Hub method '{target}' returned {other:?}");
                    warn!("[Dispatch] {err}");
                    if let Some(id) = id {
                        connection.write_message(&HubMessage::Completion(
                            CompletionMessage::with_error(
                                id,
                                error_message(&unexpected_error_message(&target), &err, detailed),
                            ),
                        ));
                    }
                }
                (_, Err(err)) => {
                    warn!("[Dispatch] Hub method '{target}' failed: {err:#}");
                    if let Some(id) = id {
                        connection.write_message(&HubMessage::Completion(
                            CompletionMessage::with_error(
                                id,
                                error_message(&unexpected_error_message(&target), &err, detailed),
                            ),
                        ));
                    }
                }
            }

            state.release(id, &stream_ids);
            drop(permit);
        });
    }
}

/// Drain `stream` as StreamItems, then send the final Completion.
///
/// A client cancel ends the stream with an empty completion. After a
/// connection abort nothing more is written.
async fn stream_results(
    connection: &HubConnectionContext,
    invocation_id: &str,
    mut stream: BoxStream<'static, anyhow::Result<Value>>,
    cancellation: &CancellationToken,
    detailed: bool,
) {
    let outcome = loop {
        tokio::select! {
            biased;
            () = cancellation.cancelled() => break CompletionOutcome::Empty,
            item = stream.next() => match item {
                Some(Ok(item)) => {
                    connection.write_message(&HubMessage::StreamItem(StreamItemMessage {
                        invocation_id: invocation_id.to_string(),
                        item,
                    }));
                }
                Some(Err(err)) => {
                    warn!("[Dispatch] Stream '{invocation_id}' failed: {err:#}");
                    break CompletionOutcome::Error(error_message(STREAM_ERROR, &err, detailed));
                }
                None => break CompletionOutcome::Empty,
            },
        }
    };

    if connection.is_aborted() {
        return;
    }
    connection.write_message(&HubMessage::Completion(CompletionMessage {
        invocation_id: invocation_id.to_string(),
        outcome,
    }));
}
