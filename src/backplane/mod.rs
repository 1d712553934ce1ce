//! Cross-server fan-out over a publish/subscribe bus.
//!
//! # Architecture
//!
//! ```text
//!  server A                         bus                          server B
//! ┌─────────────────────┐   <prefix>:all           ┌─────────────────────┐
//! │ BackplaneHub-       │── <prefix>:group:<g> ───►│ BackplaneHub-       │
//! │ LifetimeManager     │   <prefix>:user:<u>      │ LifetimeManager     │
//! │  (local registry)   │   <prefix>:connection:<c>│  (local registry)   │
//! │                     │── internal:groups ──────►│  apply if local     │
//! │  AckHandler ◄───────│◄─ internal:ack:<A> ──────│  then ack           │
//! └─────────────────────┘                          └─────────────────────┘
//! ```
//!
//! Every server subscribes to `all`, the group-management channel and its
//! own ack channel, plus the connection, user and group channels its local
//! connections need. Broadcasts are published once with the payload already
//! encoded for every protocol; each subscriber writes the matching bytes to
//! its local connections. Group changes for remote connections wait for the
//! owning server's acknowledgment.

pub mod ack;
pub mod manager;
pub mod memory;
pub mod protocol;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

pub use ack::{AckHandler, PendingAck};
pub use manager::{BackplaneHubLifetimeManager, BackplaneOptions};
pub use memory::{InMemoryBackplane, InMemoryBackplaneClient};
pub use protocol::{AckMessage, GroupAction, GroupCommand, InvocationEnvelope};

/// Backplane failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackplaneError {
    /// The owning server did not acknowledge a group command in time.
    AckTimeout {
        /// Command id.
        id: u64,
    },
    /// The bus is no longer available.
    Closed,
    /// A wire message could not be encoded.
    Encode(String),
    /// A wire message could not be decoded.
    Decode(String),
}

impl std::fmt::Display for BackplaneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AckTimeout { id } => {
                write!(f, "Timed out waiting for acknowledgment of group command {id}")
            }
            Self::Closed => write!(f, "Backplane connection closed"),
            Self::Encode(msg) => write!(f, "Failed to encode backplane message: {msg}"),
            Self::Decode(msg) => write!(f, "Failed to decode backplane message: {msg}"),
        }
    }
}

impl std::error::Error for BackplaneError {}

/// Pub/sub bus connecting the servers of one hub.
///
/// Delivery is best-effort and at most once per subscriber; ordering holds
/// per publisher per channel.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// Publish `payload` to every subscriber of `channel`, this server included.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BackplaneError>;

    /// Subscribe to `channel`. Messages published after this returns are
    /// delivered on the receiver. Subscribing again replaces the receiver.
    async fn subscribe(&self, channel: &str) -> Result<UnboundedReceiver<Bytes>, BackplaneError>;

    /// Stop receiving `channel`; the receiver ends.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BackplaneError>;
}

/// Channel names under a hub prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackplaneChannels {
    prefix: String,
}

impl BackplaneChannels {
    /// Channels for the hub named `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Broadcast to every connection.
    pub fn all(&self) -> String {
        format!("{}:all", self.prefix)
    }

    /// Members of `group`.
    pub fn group(&self, group: &str) -> String {
        format!("{}:group:{group}", self.prefix)
    }

    /// Connections of `user`.
    pub fn user(&self, user: &str) -> String {
        format!("{}:user:{user}", self.prefix)
    }

    /// A single connection.
    pub fn connection(&self, connection_id: &str) -> String {
        format!("{}:connection:{connection_id}", self.prefix)
    }

    /// Group add/remove commands.
    pub fn group_management(&self) -> String {
        format!("{}:internal:groups", self.prefix)
    }

    /// Acknowledgments addressed to `server_name`.
    pub fn ack(&self, server_name: &str) -> String {
        format!("{}:internal:ack:{server_name}", self.prefix)
    }
}
