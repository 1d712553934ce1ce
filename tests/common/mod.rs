//! Shared test client driving a hub connection over an in-memory duplex pipe.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use hubwire::connection::{ConnectionInfo, HubConnectionHandler};
use hubwire::handshake::{self, HandshakeRequest, HandshakeResponse};
use hubwire::protocol::{
    CborHubProtocol, CompletionMessage, InvocationMessage, JsonHubProtocol, MessagePackHubProtocol,
    PassthroughBinder, StreamItemMessage,
};
use hubwire::{HubMessage, HubProtocol};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Client end of one hub connection.
pub struct TestClient {
    reader: ReadHalf<DuplexStream>,
    writer: Option<WriteHalf<DuplexStream>>,
    buffer: BytesMut,
    protocol: Arc<dyn HubProtocol>,
    task: JoinHandle<()>,
}

fn protocol_named(name: &str) -> Arc<dyn HubProtocol> {
    match name {
        "messagepack" => Arc::new(MessagePackHubProtocol::new()),
        "cbor" => Arc::new(CborHubProtocol::new()),
        _ => Arc::new(JsonHubProtocol::new()),
    }
}

impl TestClient {
    /// Open a transport to `handler` without handshaking.
    pub fn start(handler: &Arc<HubConnectionHandler>, info: ConnectionInfo, protocol: &str) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (reader, writer) = tokio::io::split(client);
        let handler = Arc::clone(handler);
        let task = tokio::spawn(async move {
            handler.run_connection(server_read, server_write, info).await;
        });
        Self {
            reader,
            writer: Some(writer),
            buffer: BytesMut::new(),
            protocol: protocol_named(protocol),
            task,
        }
    }

    /// Open a transport and complete a successful handshake.
    pub async fn connect(handler: &Arc<HubConnectionHandler>, protocol: &str) -> Self {
        Self::connect_as(handler, ConnectionInfo::default(), protocol).await
    }

    /// Like [`connect`](Self::connect) with explicit connection info.
    pub async fn connect_as(
        handler: &Arc<HubConnectionHandler>,
        info: ConnectionInfo,
        protocol: &str,
    ) -> Self {
        let mut client = Self::start(handler, info, protocol);
        let response = client.handshake(protocol, 1).await;
        assert_eq!(response, HandshakeResponse::success(None), "handshake failed");
        client
    }

    /// Round-trip an invocation so the server has finished registering the
    /// connection. Any completion, even an error, proves the read loop runs.
    pub async fn ready(&mut self) {
        self.invoke("ready", "__ready", vec![]).await;
        let completion = self.completion().await;
        assert_eq!(completion.invocation_id, "ready");
    }

    /// Send a handshake request and read the response.
    pub async fn handshake(&mut self, protocol: &str, version: u32) -> HandshakeResponse {
        let mut out = BytesMut::new();
        handshake::write_request(
            &HandshakeRequest {
                protocol: protocol.to_string(),
                version,
            },
            &mut out,
        )
        .unwrap();
        self.send_raw(&out).await;
        self.handshake_response().await
    }

    /// Read the handshake response.
    pub async fn handshake_response(&mut self) -> HandshakeResponse {
        loop {
            if let Some((response, consumed)) = handshake::try_parse_response(&self.buffer).unwrap() {
                self.buffer.advance(consumed);
                return response;
            }
            assert!(self.fill().await, "connection closed before handshake response");
        }
    }

    /// Write raw bytes.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let writer = self.writer.as_mut().expect("writer already closed");
        writer.write_all(bytes).await.unwrap();
    }

    /// Encode and send `message` with the negotiated protocol.
    pub async fn send(&mut self, message: &HubMessage) {
        let bytes = self.protocol.message_bytes(message).unwrap();
        self.send_raw(&bytes).await;
    }

    /// Invoke `target` expecting a completion with `id`.
    pub async fn invoke(&mut self, id: &str, target: &str, args: Vec<Value>) {
        self.send(&HubMessage::Invocation(InvocationMessage::with_id(id, target, args)))
            .await;
    }

    /// Fire-and-forget invocation.
    pub async fn send_invocation(&mut self, target: &str, args: Vec<Value>) {
        self.send(&HubMessage::Invocation(InvocationMessage::new(target, args)))
            .await;
    }

    /// Send an upload stream item.
    pub async fn stream_item(&mut self, stream_id: &str, item: Value) {
        self.send(&HubMessage::StreamItem(StreamItemMessage {
            invocation_id: stream_id.to_string(),
            item,
        }))
        .await;
    }

    /// Complete an upload stream.
    pub async fn complete_stream(&mut self, stream_id: &str) {
        self.send(&HubMessage::Completion(CompletionMessage::empty(stream_id)))
            .await;
    }

    async fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 8192];
        let n = tokio::time::timeout(TIMEOUT, self.reader.read(&mut chunk))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        self.buffer.extend_from_slice(&chunk[..n]);
        n > 0
    }

    /// Next message other than Ping; `None` once the server closed the transport.
    pub async fn next(&mut self) -> Option<HubMessage> {
        loop {
            if let Some((message, consumed)) = self
                .protocol
                .try_parse_message(&self.buffer, &PassthroughBinder)
                .unwrap()
            {
                self.buffer.advance(consumed);
                if message == HubMessage::Ping {
                    continue;
                }
                return Some(message);
            }
            if !self.fill().await {
                assert!(self.buffer.is_empty(), "transport closed mid-message");
                return None;
            }
        }
    }

    /// Next message, which must be a Completion.
    pub async fn completion(&mut self) -> CompletionMessage {
        match self.next().await {
            Some(HubMessage::Completion(completion)) => completion,
            other => panic!("expected a completion, got {other:?}"),
        }
    }

    /// Next message, which must be an Invocation.
    pub async fn invocation(&mut self) -> InvocationMessage {
        match self.next().await {
            Some(HubMessage::Invocation(invocation)) => invocation,
            other => panic!("expected an invocation, got {other:?}"),
        }
    }

    /// Next message, which must be a Close; returns its error.
    pub async fn close_message(&mut self) -> Option<String> {
        match self.next().await {
            Some(HubMessage::Close(close)) => close.error,
            other => panic!("expected a close, got {other:?}"),
        }
    }

    /// True if nothing but pings arrives within `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.next()).await.is_err()
    }

    /// Every byte the server writes until it closes the transport.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.buffer).to_vec();
        tokio::time::timeout(TIMEOUT, self.reader.read_to_end(&mut out))
            .await
            .expect("server did not close the transport")
            .unwrap();
        out
    }

    /// Close our write half, as a client going away does.
    pub async fn hang_up(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Wait for the server side of the connection to finish.
    pub async fn finished(self) {
        tokio::time::timeout(TIMEOUT, self.task)
            .await
            .expect("connection task did not finish")
            .unwrap();
    }
}
