//! Membership and fan-out.
//!
//! A [`HubLifetimeManager`] knows which connections exist, which groups and
//! users they belong to, and delivers invocations to them. The
//! [`DefaultHubLifetimeManager`] serves a single process; the
//! [`BackplaneHubLifetimeManager`](crate::backplane::BackplaneHubLifetimeManager)
//! spans several.
//!
//! Sends never fail because a target is missing: distributed deployments
//! cannot tell "never existed" from "connected elsewhere", so an unknown
//! connection, group or user simply receives nothing.

pub mod clients;
pub mod default;
pub mod registry;
pub mod serialized;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use clients::{ClientProxy, GroupManager, HubCallerClients, HubClients, SendTarget};
pub use default::DefaultHubLifetimeManager;
pub use registry::HubRegistry;
pub use serialized::SerializedHubMessage;

use crate::backplane::BackplaneError;
use crate::connection::HubConnectionContext;
use crate::protocol::ProtocolError;

/// Failures surfaced by a lifetime manager.
#[derive(Debug)]
pub enum LifetimeError {
    /// The backplane rejected or timed out an operation.
    Backplane(BackplaneError),
    /// A message could not be encoded.
    Protocol(ProtocolError),
}

impl std::fmt::Display for LifetimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backplane(e) => write!(f, "Backplane error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for LifetimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backplane(e) => Some(e),
            Self::Protocol(e) => Some(e),
        }
    }
}

impl From<BackplaneError> for LifetimeError {
    fn from(err: BackplaneError) -> Self {
        Self::Backplane(err)
    }
}

impl From<ProtocolError> for LifetimeError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

/// Membership authority and message router for a hub.
///
/// Every send resolves its target set, drops excluded ids, encodes the
/// invocation once per protocol in use and queues it on each target's
/// writer. A connection that disconnects mid-broadcast just misses the
/// message; per-connection delivery failures are logged, never returned.
#[async_trait]
pub trait HubLifetimeManager: Send + Sync {
    /// Register a connection that completed its handshake.
    async fn on_connected(&self, connection: Arc<HubConnectionContext>) -> Result<(), LifetimeError>;

    /// Remove a connection from the registry, its user and all its groups.
    async fn on_disconnected(&self, connection: &Arc<HubConnectionContext>) -> Result<(), LifetimeError>;

    /// Add a connection to a group. Unknown connections are ignored.
    async fn add_to_group(&self, connection_id: &str, group: &str) -> Result<(), LifetimeError>;

    /// Remove a connection from a group. Non-members are ignored.
    async fn remove_from_group(&self, connection_id: &str, group: &str) -> Result<(), LifetimeError>;

    /// Invoke `method` on every connection.
    async fn send_all(&self, method: &str, args: Vec<Value>) -> Result<(), LifetimeError>;

    /// Invoke `method` on every connection not in `excluded`.
    async fn send_all_except(
        &self,
        method: &str,
        args: Vec<Value>,
        excluded: &[String],
    ) -> Result<(), LifetimeError>;

    /// Invoke `method` on one connection.
    async fn send_connection(
        &self,
        connection_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError>;

    /// Invoke `method` on each listed connection.
    async fn send_connections(
        &self,
        connection_ids: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError>;

    /// Invoke `method` on the members of `group`.
    async fn send_group(&self, group: &str, method: &str, args: Vec<Value>) -> Result<(), LifetimeError>;

    /// Invoke `method` on the members of any of `groups`.
    async fn send_groups(
        &self,
        groups: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError>;

    /// Invoke `method` on the members of `group` not in `excluded`.
    async fn send_group_except(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
        excluded: &[String],
    ) -> Result<(), LifetimeError>;

    /// Invoke `method` on every connection of `user`.
    async fn send_user(&self, user: &str, method: &str, args: Vec<Value>) -> Result<(), LifetimeError>;

    /// Invoke `method` on every connection of any of `users`.
    async fn send_users(
        &self,
        users: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError>;
}
