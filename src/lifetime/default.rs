//! Single-process lifetime manager.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use super::{HubLifetimeManager, HubRegistry, LifetimeError, SerializedHubMessage};
use crate::connection::HubConnectionContext;

/// Queue `message` on every connection in `targets`.
///
/// Delivery failures (closing or closed connections) are logged and skipped.
pub(crate) fn deliver(
    targets: impl IntoIterator<Item = Arc<HubConnectionContext>>,
    message: &SerializedHubMessage,
) -> usize {
    let mut delivered = 0;
    for connection in targets {
        if connection.write_serialized(message) {
            delivered += 1;
        } else {
            debug!(
                "[Lifetime] Skipped delivery to {} (closing)",
                connection.connection_id()
            );
        }
    }
    delivered
}

/// Drop connections listed in `excluded`, and repeats.
pub(crate) fn filter_targets(
    targets: impl IntoIterator<Item = Arc<HubConnectionContext>>,
    excluded: &[String],
) -> Vec<Arc<HubConnectionContext>> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|c| !excluded.iter().any(|id| id == c.connection_id()))
        .filter(|c| seen.insert(c.connection_id().to_string()))
        .collect()
}

/// Lifetime manager for a hub served by one process.
#[derive(Debug, Default)]
pub struct DefaultHubLifetimeManager {
    registry: Arc<HubRegistry>,
}

impl DefaultHubLifetimeManager {
    /// Manager with its own empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager over an existing registry.
    pub fn with_registry(registry: Arc<HubRegistry>) -> Self {
        Self { registry }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<HubRegistry> {
        &self.registry
    }

    fn send_to(
        &self,
        targets: impl IntoIterator<Item = Arc<HubConnectionContext>>,
        excluded: &[String],
        method: &str,
        args: Vec<Value>,
    ) {
        let targets = filter_targets(targets, excluded);
        if targets.is_empty() {
            debug!("[Lifetime] '{method}' has no local targets");
            return;
        }
        let message = SerializedHubMessage::invocation(method, args);
        let delivered = deliver(targets, &message);
        debug!("[Lifetime] '{method}' delivered to {delivered} connection(s)");
    }
}

#[async_trait]
impl HubLifetimeManager for DefaultHubLifetimeManager {
    async fn on_connected(&self, connection: Arc<HubConnectionContext>) -> Result<(), LifetimeError> {
        info!(
            "[Lifetime] Connected: {}{}",
            connection.connection_id(),
            connection.user_id().map(|u| format!(" (user {u})")).unwrap_or_default()
        );
        self.registry.add_connection(connection);
        Ok(())
    }

    async fn on_disconnected(&self, connection: &Arc<HubConnectionContext>) -> Result<(), LifetimeError> {
        if self.registry.remove_connection(connection).is_some() {
            info!("[Lifetime] Disconnected: {}", connection.connection_id());
        }
        Ok(())
    }

    async fn add_to_group(&self, connection_id: &str, group: &str) -> Result<(), LifetimeError> {
        if !self.registry.add_to_group(connection_id, group) {
            debug!("[Lifetime] add_to_group ignored for unknown connection {connection_id}");
        }
        Ok(())
    }

    async fn remove_from_group(&self, connection_id: &str, group: &str) -> Result<(), LifetimeError> {
        self.registry.remove_from_group(connection_id, group);
        Ok(())
    }

    async fn send_all(&self, method: &str, args: Vec<Value>) -> Result<(), LifetimeError> {
        self.send_to(self.registry.all(), &[], method, args);
        Ok(())
    }

    async fn send_all_except(
        &self,
        method: &str,
        args: Vec<Value>,
        excluded: &[String],
    ) -> Result<(), LifetimeError> {
        self.send_to(self.registry.all(), excluded, method, args);
        Ok(())
    }

    async fn send_connection(
        &self,
        connection_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError> {
        self.send_to(self.registry.get(connection_id), &[], method, args);
        Ok(())
    }

    async fn send_connections(
        &self,
        connection_ids: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError> {
        let targets = connection_ids.iter().filter_map(|id| self.registry.get(id));
        self.send_to(targets, &[], method, args);
        Ok(())
    }

    async fn send_group(&self, group: &str, method: &str, args: Vec<Value>) -> Result<(), LifetimeError> {
        self.send_to(self.registry.group_members(group), &[], method, args);
        Ok(())
    }

    async fn send_groups(
        &self,
        groups: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError> {
        let targets = groups.iter().flat_map(|g| self.registry.group_members(g));
        self.send_to(targets, &[], method, args);
        Ok(())
    }

    async fn send_group_except(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
        excluded: &[String],
    ) -> Result<(), LifetimeError> {
        self.send_to(self.registry.group_members(group), excluded, method, args);
        Ok(())
    }

    async fn send_user(&self, user: &str, method: &str, args: Vec<Value>) -> Result<(), LifetimeError> {
        self.send_to(self.registry.user_connections(user), &[], method, args);
        Ok(())
    }

    async fn send_users(
        &self,
        users: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError> {
        let targets = users.iter().flat_map(|u| self.registry.user_connections(u));
        self.send_to(targets, &[], method, args);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, Outbound};
    use crate::protocol::{CborHubProtocol, HubMessage, HubProtocol, JsonHubProtocol, PassthroughBinder};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Client {
        conn: Arc<HubConnectionContext>,
        rx: UnboundedReceiver<Outbound>,
        protocol: Arc<dyn HubProtocol>,
    }

    impl Client {
        fn new(id: &str, user: Option<&str>, protocol: Arc<dyn HubProtocol>) -> Self {
            let (conn, rx) = HubConnectionContext::new(id, user.map(str::to_string));
            conn.set_protocol(Arc::clone(&protocol));
            conn.transition(ConnectionState::Active);
            Self { conn, rx, protocol }
        }

        fn json(id: &str) -> Self {
            Self::new(id, None, Arc::new(JsonHubProtocol::new()))
        }

        /// Targets of every invocation queued so far.
        fn received(&mut self) -> Vec<String> {
            let mut targets = Vec::new();
            while let Ok(Outbound::Frame(bytes)) = self.rx.try_recv() {
                let (message, _) = self
                    .protocol
                    .try_parse_message(&bytes, &PassthroughBinder)
                    .unwrap()
                    .unwrap();
                if let HubMessage::Invocation(inv) = message {
                    targets.push(inv.target);
                }
            }
            targets
        }
    }

    async fn manager_with(clients: &[&Client]) -> DefaultHubLifetimeManager {
        let manager = DefaultHubLifetimeManager::new();
        for client in clients {
            manager.on_connected(Arc::clone(&client.conn)).await.unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn test_send_all_and_except() {
        let mut a = Client::json("a");
        let mut b = Client::json("b");
        let manager = manager_with(&[&a, &b]).await;

        manager.send_all("Hello", vec![json!(1)]).await.unwrap();
        manager
            .send_all_except("Quiet", vec![], &["a".to_string()])
            .await
            .unwrap();

        assert_eq!(a.received(), vec!["Hello"]);
        assert_eq!(b.received(), vec!["Hello", "Quiet"]);
    }

    #[tokio::test]
    async fn test_group_send_before_and_after_removal() {
        let mut a = Client::json("a");
        let manager = manager_with(&[&a]).await;

        manager.add_to_group("a", "room").await.unwrap();
        manager.send_group("room", "Before", vec![]).await.unwrap();
        manager.remove_from_group("a", "room").await.unwrap();
        manager.send_group("room", "After", vec![]).await.unwrap();

        assert_eq!(a.received(), vec!["Before"]);
    }

    #[tokio::test]
    async fn test_unknown_targets_are_silent() {
        let manager = DefaultHubLifetimeManager::new();
        manager.send_connection("ghost", "M", vec![]).await.unwrap();
        manager.send_group("empty", "M", vec![]).await.unwrap();
        manager.send_user("nobody", "M", vec![]).await.unwrap();
        manager.add_to_group("ghost", "g").await.unwrap();
        assert!(!manager.registry().has_group("g"));
    }

    #[tokio::test]
    async fn test_groups_and_users_deliver_once_per_connection() {
        let mut a = Client::new("a", Some("alice"), Arc::new(JsonHubProtocol::new()));
        let mut b = Client::new("b", Some("alice"), Arc::new(CborHubProtocol::new()));
        let manager = manager_with(&[&a, &b]).await;
        manager.add_to_group("a", "g1").await.unwrap();
        manager.add_to_group("a", "g2").await.unwrap();

        manager
            .send_groups(&["g1".to_string(), "g2".to_string()], "Groups", vec![])
            .await
            .unwrap();
        manager.send_user("alice", "User", vec![]).await.unwrap();

        assert_eq!(a.received(), vec!["Groups", "User"]);
        assert_eq!(b.received(), vec!["User"]);
    }

    #[tokio::test]
    async fn test_disconnect_removes_from_groups_and_users() {
        let mut a = Client::new("a", Some("alice"), Arc::new(JsonHubProtocol::new()));
        let manager = manager_with(&[&a]).await;
        manager.add_to_group("a", "g").await.unwrap();
        manager.on_disconnected(&a.conn).await.unwrap();

        manager.send_group("g", "M", vec![]).await.unwrap();
        manager.send_user("alice", "M", vec![]).await.unwrap();
        manager.send_all("M", vec![]).await.unwrap();
        assert!(a.received().is_empty());
        assert_eq!(manager.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_closing_connection_is_skipped() {
        let mut a = Client::json("a");
        let mut b = Client::json("b");
        let manager = manager_with(&[&a, &b]).await;
        a.conn.close(None);

        manager.send_all("M", vec![]).await.unwrap();
        assert!(a.received().is_empty());
        assert_eq!(b.received(), vec!["M"]);
    }
}
