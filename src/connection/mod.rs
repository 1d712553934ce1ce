//! Per-connection state: identity, negotiated protocol, group mirror and
//! the serialized outbound writer.
//!
//! # Architecture
//!
//! ```text
//! broadcasts / dispatcher ──┐
//!        keepalive ─────────┼─► HubConnectionContext::write_*  ─► outbound queue
//!                           │        (state lock held while enqueuing)
//!                           │                                        │
//!                           │                               writer task (one per
//!                           │                               connection) ─► transport
//! ```
//!
//! Every write funnels through one unbounded queue drained by a single task,
//! so messages never interleave mid-frame and keep their enqueue order.
//! Once the connection starts closing, further writes are dropped. The queue
//! depth is tracked and a client that lets it grow past
//! [`OUTBOUND_HIGH_WATER_MARK`] is logged once per episode.

pub mod handler;
pub mod transport;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use handler::{ConnectionInfo, ConnectionOptions, HubConnectionHandler};
pub use transport::{TransportReader, TransportWriter};

use crate::constants::OUTBOUND_HIGH_WATER_MARK;
use crate::lifetime::SerializedHubMessage;
use crate::protocol::{CloseMessage, HubMessage, HubProtocol};

/// Error sent to the client when it stops sending anything.
pub const CLIENT_TIMEOUT_ERROR: &str =
    "Client hasn't sent a message/ping within the configured ClientTimeoutInterval.";

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Transport not attached yet.
    Connecting,
    /// Waiting for the client's handshake request.
    AwaitingHandshake,
    /// Handshake done; messages flow both ways.
    Active,
    /// Shutting down; new writes are dropped.
    Closing,
    /// Fully closed.
    Closed,
}

/// Item on the outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// Pre-framed bytes to write.
    Frame(Bytes),
    /// Stop after everything queued so far has been written.
    Shutdown,
}

/// Shared state of a single hub connection.
///
/// Cheap to share: the handler, the dispatcher, the lifetime manager and the
/// keepalive task all hold the same `Arc`.
pub struct HubConnectionContext {
    connection_id: String,
    user_id: Option<String>,
    protocol: OnceLock<Arc<dyn HubProtocol>>,
    /// Guards enqueuing as well as transitions, so nothing is queued after
    /// the state moves to `Closing`.
    state: Mutex<ConnectionState>,
    outbound: UnboundedSender<Outbound>,
    /// Frames queued but not yet taken by the writer.
    backlog: AtomicUsize,
    /// Set while the backlog is above the high-water mark.
    backlog_warned: AtomicBool,
    /// Mirror of group membership, used for cleanup on disconnect.
    groups: Mutex<HashSet<String>>,
    abort: CancellationToken,
    abort_error: Mutex<Option<String>>,
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
}

impl std::fmt::Debug for HubConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnectionContext")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("protocol", &self.protocol.get().map(|p| p.name().to_string()))
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HubConnectionContext {
    /// Create a connection in the `Connecting` state.
    ///
    /// Returns the receiving end of the outbound queue; hand it to
    /// [`run_writer`] together with the transport's write half.
    pub fn new(
        connection_id: impl Into<String>,
        user_id: Option<String>,
    ) -> (Arc<Self>, UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let context = Arc::new(Self {
            connection_id: connection_id.into(),
            user_id,
            protocol: OnceLock::new(),
            state: Mutex::new(ConnectionState::Connecting),
            outbound,
            backlog: AtomicUsize::new(0),
            backlog_warned: AtomicBool::new(false),
            groups: Mutex::new(HashSet::new()),
            abort: CancellationToken::new(),
            abort_error: Mutex::new(None),
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
        });
        (context, outbound_rx)
    }

    /// Server-unique connection id.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Authenticated user, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Negotiated protocol, once the handshake has completed.
    pub fn protocol(&self) -> Option<&Arc<dyn HubProtocol>> {
        self.protocol.get()
    }

    /// Record the negotiated protocol. Only the first call has any effect.
    pub fn set_protocol(&self, protocol: Arc<dyn HubProtocol>) -> bool {
        self.protocol.set(protocol).is_ok()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Move to `next`. Backwards or repeated transitions are ignored.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut state = lock(&self.state);
        if next <= *state {
            debug!(
                "[Connection] {} ignoring transition {:?} -> {:?}",
                self.connection_id, *state, next
            );
            return false;
        }
        *state = next;
        true
    }

    /// Snapshot of the groups this connection belongs to.
    pub fn groups(&self) -> HashSet<String> {
        lock(&self.groups).clone()
    }

    /// Lock the group mirror. Registries hold this while updating the
    /// shared group table so membership changes for one connection are
    /// serialized against its removal.
    pub(crate) fn groups_guard(&self) -> MutexGuard<'_, HashSet<String>> {
        lock(&self.groups)
    }

    /// Token cancelled when the connection is aborted.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Wait until the connection is aborted.
    pub async fn aborted(&self) {
        self.abort.cancelled().await;
    }

    /// True once [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Abort the connection. Handlers observe this through the abort token.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Abort the connection, reporting `error` in the final Close message.
    pub fn abort_with_error(&self, error: impl Into<String>) {
        {
            let mut slot = lock(&self.abort_error);
            if slot.is_none() {
                *slot = Some(error.into());
            }
        }
        self.abort.cancel();
    }

    /// Error recorded by [`abort_with_error`](Self::abort_with_error).
    pub fn abort_error(&self) -> Option<String> {
        lock(&self.abort_error).clone()
    }

    /// Note that bytes were received.
    pub fn mark_read(&self) {
        *lock(&self.last_read) = Instant::now();
    }

    /// Time since bytes were last received.
    pub fn since_last_read(&self) -> Duration {
        lock(&self.last_read).elapsed()
    }

    /// Time since a message was last queued for writing.
    pub fn since_last_write(&self) -> Duration {
        lock(&self.last_write).elapsed()
    }

    /// Frames waiting for the writer.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    fn note_queued(&self) {
        let depth = self.backlog.fetch_add(1, Ordering::Relaxed) + 1;
        if depth >= OUTBOUND_HIGH_WATER_MARK && !self.backlog_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "[Connection] {} has {depth} frames queued; the client is not keeping up",
                self.connection_id
            );
        }
    }

    fn note_written(&self) {
        let depth = self.backlog.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        if depth < OUTBOUND_HIGH_WATER_MARK / 2 && self.backlog_warned.swap(false, Ordering::Relaxed) {
            debug!("[Connection] {} backlog drained to {depth}", self.connection_id);
        }
    }

    /// Queue pre-framed bytes.
    ///
    /// Returns `false` if the connection is closing or the writer is gone.
    pub fn write_raw(&self, bytes: Bytes) -> bool {
        let state = lock(&self.state);
        if *state >= ConnectionState::Closing {
            debug!("[Connection] {} dropping write after close", self.connection_id);
            return false;
        }
        let queued = self.outbound.send(Outbound::Frame(bytes)).is_ok();
        drop(state);
        if queued {
            self.note_queued();
            *lock(&self.last_write) = Instant::now();
        }
        queued
    }

    /// Encode `message` with the negotiated protocol and queue it.
    pub fn write_message(&self, message: &HubMessage) -> bool {
        let Some(protocol) = self.protocol.get() else {
            warn!(
                "[Connection] {} cannot write {} before handshake",
                self.connection_id,
                message.kind()
            );
            return false;
        };
        match protocol.message_bytes(message) {
            Ok(bytes) => self.write_raw(bytes),
            Err(e) => {
                error!(
                    "[Connection] {} failed to encode {}: {e}",
                    self.connection_id,
                    message.kind()
                );
                false
            }
        }
    }

    /// Queue a message using bytes cached for this connection's protocol.
    pub fn write_serialized(&self, message: &SerializedHubMessage) -> bool {
        let Some(protocol) = self.protocol.get() else {
            return false;
        };
        match message.bytes_for(protocol.as_ref()) {
            Ok(bytes) => self.write_raw(bytes),
            Err(e) => {
                error!(
                    "[Connection] {} failed to encode broadcast: {e}",
                    self.connection_id
                );
                false
            }
        }
    }

    /// Begin closing: queue a final Close (when a protocol was negotiated)
    /// and stop the writer after it. Later writes are dropped.
    ///
    /// Returns `false` if the connection was already closing.
    pub fn close(&self, error: Option<String>) -> bool {
        let final_frame = self.protocol.get().and_then(|protocol| {
            protocol
                .message_bytes(&HubMessage::Close(CloseMessage {
                    error,
                    allow_reconnect: false,
                }))
                .ok()
        });

        let mut state = lock(&self.state);
        if *state >= ConnectionState::Closing {
            return false;
        }
        if let Some(frame) = final_frame {
            if self.outbound.send(Outbound::Frame(frame)).is_ok() {
                self.note_queued();
            }
        }
        let _ = self.outbound.send(Outbound::Shutdown);
        *state = ConnectionState::Closing;
        true
    }

    /// Stop the writer without sending a Close message.
    pub(crate) fn close_silently(&self) -> bool {
        let mut state = lock(&self.state);
        if *state >= ConnectionState::Closing {
            return false;
        }
        let _ = self.outbound.send(Outbound::Shutdown);
        *state = ConnectionState::Closing;
        true
    }
}

/// Drain the outbound queue into `writer` until shutdown or a write fault.
///
/// A write fault aborts the connection.
pub async fn run_writer<W: TransportWriter>(
    connection: Arc<HubConnectionContext>,
    mut writer: W,
    mut outbound_rx: UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbound_rx.recv().await {
        match item {
            Outbound::Frame(bytes) => {
                connection.note_written();
                if let Err(e) = writer.write(&bytes).await {
                    error!("[Connection] Write error for {}: {e}", connection.connection_id());
                    connection.abort();
                    break;
                }
            }
            Outbound::Shutdown => {
                if let Err(e) = writer.shutdown().await {
                    debug!(
                        "[Connection] Shutdown error for {}: {e}",
                        connection.connection_id()
                    );
                }
                break;
            }
        }
    }
}

/// Send pings while the client is quiet and abort when it stops talking.
///
/// Runs until the connection is aborted.
pub async fn run_keepalive(
    connection: Arc<HubConnectionContext>,
    keep_alive_interval: Duration,
    client_timeout: Duration,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick.min(keep_alive_interval));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = connection.aborted() => break,
            _ = interval.tick() => {}
        }

        if connection.state() >= ConnectionState::Closing {
            break;
        }
        if connection.since_last_read() >= client_timeout {
            warn!(
                "[Connection] {} timed out after {:?} without input",
                connection.connection_id(),
                client_timeout
            );
            connection.abort_with_error(CLIENT_TIMEOUT_ERROR);
            break;
        }
        if connection.since_last_write() >= keep_alive_interval {
            connection.write_message(&HubMessage::Ping);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonHubProtocol, PassthroughBinder};

    fn active() -> (Arc<HubConnectionContext>, UnboundedReceiver<Outbound>) {
        let (conn, rx) = HubConnectionContext::new("c1", Some("alice".into()));
        conn.set_protocol(Arc::new(JsonHubProtocol::new()));
        conn.transition(ConnectionState::AwaitingHandshake);
        conn.transition(ConnectionState::Active);
        (conn, rx)
    }

    fn frame(item: Outbound) -> Bytes {
        match item {
            Outbound::Frame(bytes) => bytes,
            Outbound::Shutdown => panic!("unexpected shutdown"),
        }
    }

    #[test]
    fn test_transitions_only_move_forward() {
        let (conn, _rx) = active();
        assert!(!conn.transition(ConnectionState::AwaitingHandshake));
        assert!(!conn.transition(ConnectionState::Active));
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(conn.transition(ConnectionState::Closed));
    }

    #[test]
    fn test_protocol_set_once() {
        let (conn, _rx) = active();
        assert!(!conn.set_protocol(Arc::new(JsonHubProtocol::new())));
        assert_eq!(conn.protocol().unwrap().name(), "json");
    }

    #[test]
    fn test_writes_keep_order_and_stop_after_close() {
        let (conn, mut rx) = active();
        assert!(conn.write_message(&HubMessage::Ping));
        assert!(conn.write_raw(Bytes::from_static(b"raw")));
        assert!(conn.close(Some("bye".into())));
        assert!(!conn.write_message(&HubMessage::Ping), "write after close must drop");
        assert!(!conn.close(None), "second close is a no-op");

        assert_eq!(&frame(rx.try_recv().unwrap())[..], b"{\"type\":6}\x1e");
        assert_eq!(&frame(rx.try_recv().unwrap())[..], b"raw");

        let close = frame(rx.try_recv().unwrap());
        let (message, _) = JsonHubProtocol::new()
            .try_parse_message(&close, &PassthroughBinder)
            .unwrap()
            .unwrap();
        assert_eq!(
            message,
            HubMessage::Close(CloseMessage { error: Some("bye".into()), allow_reconnect: false })
        );
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Shutdown));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_backlog_warning_fires_once_and_rearms() {
        let (conn, _rx) = active();
        for _ in 0..OUTBOUND_HIGH_WATER_MARK - 1 {
            conn.write_raw(Bytes::from_static(b"x"));
        }
        assert!(!conn.backlog_warned.load(Ordering::Relaxed));

        conn.write_raw(Bytes::from_static(b"x"));
        assert_eq!(conn.backlog(), OUTBOUND_HIGH_WATER_MARK);
        assert!(conn.backlog_warned.load(Ordering::Relaxed));

        for _ in 0..OUTBOUND_HIGH_WATER_MARK / 2 {
            conn.note_written();
        }
        assert!(conn.backlog_warned.load(Ordering::Relaxed), "still at half the mark");
        conn.note_written();
        assert!(!conn.backlog_warned.load(Ordering::Relaxed));
        assert_eq!(conn.backlog(), OUTBOUND_HIGH_WATER_MARK / 2 - 1);
    }

    #[tokio::test]
    async fn test_writer_drains_backlog_to_zero() {
        let (conn, rx) = active();
        let (mut client, server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(run_writer(Arc::clone(&conn), server, rx));

        conn.write_raw(Bytes::from_static(b"one"));
        conn.close(None);
        writer.await.unwrap();
        while TransportReader::read(&mut client).await.unwrap().is_some() {}
        assert_eq!(conn.backlog(), 0);
    }

    #[test]
    fn test_abort_error_keeps_first_reason() {
        let (conn, _rx) = active();
        conn.abort_with_error("first");
        conn.abort_with_error("second");
        assert!(conn.is_aborted());
        assert_eq!(conn.abort_error().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_writer_task_drains_then_stops() {
        let (conn, rx) = active();
        let (client, server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(run_writer(Arc::clone(&conn), server, rx));

        conn.write_raw(Bytes::from_static(b"one"));
        conn.write_raw(Bytes::from_static(b"two"));
        conn.close_silently();
        writer.await.unwrap();

        let mut client = client;
        let mut received = Vec::new();
        while let Some(chunk) = TransportReader::read(&mut client).await.unwrap() {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"onetwo");
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_then_times_out() {
        let (conn, mut rx) = active();
        let task = tokio::spawn(run_keepalive(
            Arc::clone(&conn),
            Duration::from_secs(1),
            Duration::from_secs(3),
            Duration::from_millis(250),
        ));

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert_eq!(&frame(rx.try_recv().unwrap())[..], b"{\"type\":6}\x1e");
        assert!(!conn.is_aborted());

        task.await.unwrap();
        assert!(conn.is_aborted());
        assert_eq!(conn.abort_error().as_deref(), Some(CLIENT_TIMEOUT_ERROR));
    }
}
