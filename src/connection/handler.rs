//! Drives one connection from handshake to close.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, error, info, warn};

use super::transport::{TransportReader, TransportWriter};
use super::{run_keepalive, run_writer, ConnectionState, HubConnectionContext};
use crate::constants::{
    DEFAULT_CLIENT_TIMEOUT_INTERVAL, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL,
    DEFAULT_MAXIMUM_RECEIVE_MESSAGE_SIZE, KEEP_ALIVE_TICK,
};
use crate::dispatcher::{ConnectionDispatcher, DispatchOutcome, HubDispatcher};
use crate::handshake::{self, HandshakeError, HandshakeResponse};
use crate::lifetime::HubLifetimeManager;
use crate::protocol::{HubProtocol, ProtocolRegistry};

const CLOSED_WITH_ERROR: &str = "Connection closed with an error.";
const TERMINATED_MID_MESSAGE: &str = "Connection terminated while reading a message.";
const HANDSHAKE_FAILED: &str = "An unexpected error occurred during connection handshake.";

/// Who is on the other end of a transport, as established by the host.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Authenticated user, if any.
    pub user_id: Option<String>,
    /// Connection id to use instead of a generated one.
    pub connection_id: Option<String>,
}

impl ConnectionInfo {
    /// Connection for `user_id`.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            connection_id: None,
        }
    }

    /// Use `connection_id` instead of a generated id.
    #[must_use]
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }
}

/// Timeouts and limits applied to every connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long a client may take to send its handshake request.
    pub handshake_timeout: Duration,
    /// Ping when nothing was written for this long.
    pub keep_alive_interval: Duration,
    /// Abort when nothing was read for this long.
    pub client_timeout_interval: Duration,
    /// Largest single message accepted; `None` disables the check.
    pub maximum_receive_message_size: Option<usize>,
    /// Include error details in Close messages.
    pub enable_detailed_errors: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            client_timeout_interval: DEFAULT_CLIENT_TIMEOUT_INTERVAL,
            maximum_receive_message_size: Some(DEFAULT_MAXIMUM_RECEIVE_MESSAGE_SIZE),
            enable_detailed_errors: false,
        }
    }
}

/// Runs hub connections over any transport.
pub struct HubConnectionHandler {
    protocols: ProtocolRegistry,
    dispatcher: Arc<HubDispatcher>,
    lifetime: Arc<dyn HubLifetimeManager>,
    options: ConnectionOptions,
}

impl std::fmt::Debug for HubConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnectionHandler")
            .field("protocols", &self.protocols)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl HubConnectionHandler {
    /// Handler negotiating among `protocols` and dispatching through `dispatcher`.
    pub fn new(
        protocols: ProtocolRegistry,
        dispatcher: Arc<HubDispatcher>,
        lifetime: Arc<dyn HubLifetimeManager>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            protocols,
            dispatcher,
            lifetime,
            options,
        }
    }

    /// Settings.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Serve one connection until either side closes it.
    ///
    /// Returns once the final Close (if any) has been written and the
    /// transport's write half shut down.
    pub async fn run_connection<R, W>(&self, mut reader: R, writer: W, info: ConnectionInfo)
    where
        R: TransportReader,
        W: TransportWriter + 'static,
    {
        let connection_id = info
            .connection_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (connection, outbound_rx) = HubConnectionContext::new(connection_id, info.user_id);
        let writer_task = tokio::spawn(run_writer(Arc::clone(&connection), writer, outbound_rx));
        connection.transition(ConnectionState::AwaitingHandshake);

        let mut buffer = BytesMut::new();
        let protocol = match tokio::time::timeout(
            self.options.handshake_timeout,
            self.handshake(&connection, &mut reader, &mut buffer),
        )
        .await
        {
            Ok(Some(protocol)) => protocol,
            Ok(None) => {
                finish(&connection, writer_task).await;
                return;
            }
            Err(_) => {
                warn!(
                    "[Hub] {} did not complete the handshake within {:?}",
                    connection.connection_id(),
                    self.options.handshake_timeout
                );
                connection.abort();
                connection.close_silently();
                finish(&connection, writer_task).await;
                return;
            }
        };

        let close_error = match self.start(&connection).await {
            Ok(dispatcher) => {
                let keepalive = tokio::spawn(run_keepalive(
                    Arc::clone(&connection),
                    self.options.keep_alive_interval,
                    self.options.client_timeout_interval,
                    KEEP_ALIVE_TICK,
                ));
                let error = self
                    .read_loop(&connection, &dispatcher, protocol.as_ref(), &mut reader, buffer)
                    .await;
                connection.abort();
                dispatcher.shutdown();
                keepalive.abort();
                error
            }
            Err(error) => {
                connection.abort();
                Some(error)
            }
        };
        let close_error = close_error.or_else(|| connection.abort_error());

        if let Err(e) = self
            .dispatcher
            .on_disconnected(&connection, close_error.clone())
            .await
        {
            warn!(
                "[Hub] on_disconnected hook failed for {}: {e:#}",
                connection.connection_id()
            );
        }
        if let Err(e) = self.lifetime.on_disconnected(&connection).await {
            error!(
                "[Hub] Failed to unregister {}: {e}",
                connection.connection_id()
            );
        }

        connection.close(close_error.clone());
        finish(&connection, writer_task).await;
        match close_error {
            Some(error) => info!("[Hub] {} closed: {error}", connection.connection_id()),
            None => info!("[Hub] {} closed", connection.connection_id()),
        }
    }

    /// Read and answer the handshake request.
    ///
    /// Returns the negotiated protocol, or `None` after the failure has been
    /// reported and the connection closed.
    async fn handshake<R: TransportReader>(
        &self,
        connection: &Arc<HubConnectionContext>,
        reader: &mut R,
        buffer: &mut BytesMut,
    ) -> Option<Arc<dyn HubProtocol>> {
        loop {
            match handshake::try_parse_request(buffer, self.options.maximum_receive_message_size) {
                Ok(Some((request, consumed))) => {
                    buffer.advance(consumed);
                    return match handshake::negotiate(&request, &self.protocols) {
                        Ok(protocol) => self.accept(connection, protocol),
                        Err(reason) => {
                            self.reject(connection, &reason);
                            None
                        }
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "[Hub] Bad handshake from {}: {e}",
                        connection.connection_id()
                    );
                    let reason = match e {
                        HandshakeError::TooLarge { .. } => e.to_string(),
                        _ => HANDSHAKE_FAILED.to_string(),
                    };
                    self.reject(connection, &reason);
                    return None;
                }
            }

            match reader.read().await {
                Ok(Some(bytes)) => {
                    connection.mark_read();
                    buffer.extend_from_slice(&bytes);
                }
                Ok(None) => {
                    debug!(
                        "[Hub] {} disconnected before the handshake",
                        connection.connection_id()
                    );
                    connection.close_silently();
                    return None;
                }
                Err(e) => {
                    error!(
                        "[Hub] Transport error during handshake for {}: {e}",
                        connection.connection_id()
                    );
                    connection.close_silently();
                    return None;
                }
            }
        }
    }

    fn accept(
        &self,
        connection: &Arc<HubConnectionContext>,
        protocol: Arc<dyn HubProtocol>,
    ) -> Option<Arc<dyn HubProtocol>> {
        let mut response = BytesMut::new();
        if let Err(e) = handshake::write_response(
            &HandshakeResponse::success(protocol.minor_version()),
            &mut response,
        ) {
            error!("[Hub] Failed to write handshake response: {e}");
            connection.close_silently();
            return None;
        }
        connection.set_protocol(Arc::clone(&protocol));
        connection.write_raw(response.freeze());
        connection.transition(ConnectionState::Active);
        info!(
            "[Hub] {} negotiated '{}' v{}",
            connection.connection_id(),
            protocol.name(),
            protocol.version()
        );
        Some(protocol)
    }

    fn reject(&self, connection: &Arc<HubConnectionContext>, reason: &str) {
        info!(
            "[Hub] Handshake rejected for {}: {reason}",
            connection.connection_id()
        );
        let mut response = BytesMut::new();
        if handshake::write_response(&HandshakeResponse::failure(reason), &mut response).is_ok() {
            connection.write_raw(response.freeze());
        }
        connection.close_silently();
    }

    /// Register the connection and run the connect hook.
    ///
    /// On failure returns the error to close with.
    async fn start(
        &self,
        connection: &Arc<HubConnectionContext>,
    ) -> Result<ConnectionDispatcher, String> {
        if let Err(e) = self.lifetime.on_connected(Arc::clone(connection)).await {
            error!(
                "[Hub] Failed to register {}: {e}",
                connection.connection_id()
            );
            return Err(self.closed_with_error(&e));
        }
        if let Err(e) = self.dispatcher.on_connected(connection).await {
            warn!(
                "[Hub] on_connected hook failed for {}: {e:#}",
                connection.connection_id()
            );
            return Err(self.closed_with_error(&e));
        }
        Ok(self.dispatcher.attach(Arc::clone(connection)))
    }

    /// Parse and dispatch messages until the client leaves or the connection
    /// is aborted. Returns the server's error to report in the final Close.
    async fn read_loop<R: TransportReader>(
        &self,
        connection: &Arc<HubConnectionContext>,
        dispatcher: &ConnectionDispatcher,
        protocol: &dyn HubProtocol,
        reader: &mut R,
        mut buffer: BytesMut,
    ) -> Option<String> {
        let max_size = self.options.maximum_receive_message_size;
        loop {
            loop {
                let window = match max_size {
                    Some(max) if buffer.len() > max => &buffer[..max],
                    _ => &buffer[..],
                };
                match protocol.try_parse_message(window, dispatcher) {
                    Ok(Some((message, consumed))) => {
                        buffer.advance(consumed);
                        debug!(
                            "[Hub] {} received {}",
                            connection.connection_id(),
                            message.kind()
                        );
                        // The client's own close reason is not echoed back.
                        if let DispatchOutcome::Close(_) = dispatcher.dispatch(message).await {
                            return None;
                        }
                        if connection.is_aborted() {
                            return connection.abort_error();
                        }
                    }
                    Ok(None) => {
                        if let Some(max) = max_size.filter(|max| buffer.len() > *max) {
                            warn!(
                                "[Hub] {} exceeded the maximum message size of {max}B",
                                connection.connection_id()
                            );
                            return Some(format!("The maximum message size of {max}B was exceeded."));
                        }
                        break;
                    }
                    Err(e) => {
                        error!(
                            "[Hub] Protocol error on {}: {e}",
                            connection.connection_id()
                        );
                        return Some(self.closed_with_error(&e));
                    }
                }
            }

            tokio::select! {
                biased;
                () = connection.aborted() => return connection.abort_error(),
                read = reader.read() => match read {
                    Ok(Some(bytes)) => {
                        connection.mark_read();
                        buffer.extend_from_slice(&bytes);
                    }
                    Ok(None) if buffer.is_empty() => return None,
                    Ok(None) => return Some(TERMINATED_MID_MESSAGE.to_string()),
                    Err(e) => {
                        error!(
                            "[Hub] Transport read error on {}: {e}",
                            connection.connection_id()
                        );
                        return None;
                    }
                },
            }
        }
    }

    fn closed_with_error(&self, detail: &dyn std::fmt::Display) -> String {
        if self.options.enable_detailed_errors {
            format!("{CLOSED_WITH_ERROR} {detail}")
        } else {
            CLOSED_WITH_ERROR.to_string()
        }
    }
}

/// Wait for the writer to drain, then mark the connection closed.
async fn finish(connection: &Arc<HubConnectionContext>, writer_task: tokio::task::JoinHandle<()>) {
    if let Err(e) = writer_task.await {
        error!(
            "[Hub] Writer task for {} failed: {e}",
            connection.connection_id()
        );
    }
    connection.transition(ConnectionState::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatcherOptions, HubMethods};
    use crate::lifetime::DefaultHubLifetimeManager;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn handler(options: ConnectionOptions) -> HubConnectionHandler {
        let lifetime: Arc<dyn HubLifetimeManager> = Arc::new(DefaultHubLifetimeManager::new());
        let dispatcher = Arc::new(HubDispatcher::new(
            Arc::new(HubMethods::builder().build()),
            Arc::clone(&lifetime),
            DispatcherOptions::default(),
        ));
        let protocols = ProtocolRegistry::from_names(&["json"]).unwrap();
        HubConnectionHandler::new(protocols, dispatcher, lifetime, options)
    }

    #[tokio::test]
    async fn test_rejects_unknown_protocol() {
        let handler = handler(ConnectionOptions::default());
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let task = tokio::spawn(async move {
            handler
                .run_connection(server_read, server_write, ConnectionInfo::default())
                .await;
        });
        client_write
            .write_all(b"{\"protocol\":\"xml\",\"version\":1}\x1e")
            .await
            .unwrap();

        let mut out = Vec::new();
        client_read.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"{\"error\":\"The protocol 'xml' is not supported.\"}\x1e");
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_writes_nothing() {
        let handler = handler(ConnectionOptions {
            handshake_timeout: Duration::from_secs(1),
            ..ConnectionOptions::default()
        });
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, _client_write) = tokio::io::split(client);

        let task = tokio::spawn(async move {
            handler
                .run_connection(server_read, server_write, ConnectionInfo::default())
                .await;
        });

        let mut out = Vec::new();
        client_read.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        task.await.unwrap();
    }

    #[test]
    fn test_connection_info_builders() {
        let info = ConnectionInfo::for_user("alice").with_connection_id("c1");
        assert_eq!(info.user_id.as_deref(), Some("alice"));
        assert_eq!(info.connection_id.as_deref(), Some("c1"));
    }
}
