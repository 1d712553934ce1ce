//! Lifetime manager spanning several servers through a [`Backplane`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::protocol::{decode, encode};
use super::{
    AckHandler, AckMessage, Backplane, BackplaneChannels, BackplaneError, GroupAction, GroupCommand,
    InvocationEnvelope,
};
use crate::connection::HubConnectionContext;
use crate::constants::{DEFAULT_BACKPLANE_ACK_TIMEOUT, DEFAULT_BACKPLANE_PREFIX};
use crate::lifetime::default::{deliver, filter_targets};
use crate::lifetime::{HubLifetimeManager, HubRegistry, LifetimeError, SerializedHubMessage};
use crate::protocol::ProtocolRegistry;

/// Settings for a [`BackplaneHubLifetimeManager`].
#[derive(Debug, Clone)]
pub struct BackplaneOptions {
    /// Channel prefix shared by every server of the hub.
    pub prefix: String,
    /// This server's name on the bus. Must be unique per hub.
    pub server_name: String,
    /// How long a remote group change waits for its ack.
    pub ack_timeout: Duration,
}

impl Default for BackplaneOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_BACKPLANE_PREFIX.to_string(),
            server_name: uuid::Uuid::new_v4().to_string(),
            ack_timeout: DEFAULT_BACKPLANE_ACK_TIMEOUT,
        }
    }
}

/// What a subscribed channel carries.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelKind {
    All,
    Connection(String),
    Group(String),
    User(String),
    GroupManagement,
    Ack,
}

struct Inner {
    server_name: String,
    channels: BackplaneChannels,
    backplane: Arc<dyn Backplane>,
    protocols: ProtocolRegistry,
    registry: Arc<HubRegistry>,
    acks: AckHandler,
    ack_timeout: Duration,
    /// channel name → listener task
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, listener) in self.subscriptions.get_mut().drain() {
            listener.abort();
        }
    }
}

/// Lifetime manager for a hub served by several processes.
///
/// Local connections live in this server's [`HubRegistry`]; everything
/// addressed to a group, user or remote connection travels over the bus and
/// is delivered by whichever servers hold matching connections.
#[derive(Clone)]
pub struct BackplaneHubLifetimeManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BackplaneHubLifetimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackplaneHubLifetimeManager")
            .field("server_name", &self.inner.server_name)
            .field("connections", &self.inner.registry.connection_count())
            .finish_non_exhaustive()
    }
}

impl BackplaneHubLifetimeManager {
    /// Join the hub on `backplane`, encoding broadcasts for every protocol
    /// in `protocols`.
    pub async fn new(
        backplane: Arc<dyn Backplane>,
        protocols: ProtocolRegistry,
        options: BackplaneOptions,
    ) -> Result<Self, BackplaneError> {
        let inner = Arc::new(Inner {
            channels: BackplaneChannels::new(options.prefix.clone()),
            server_name: options.server_name,
            backplane,
            protocols,
            registry: Arc::new(HubRegistry::new()),
            acks: AckHandler::new(),
            ack_timeout: options.ack_timeout,
            subscriptions: Mutex::new(HashMap::new()),
        });

        for kind in [ChannelKind::All, ChannelKind::GroupManagement, ChannelKind::Ack] {
            inner.ensure_subscribed(kind).await?;
        }
        info!(
            "[Backplane] Server '{}' joined hub '{}'",
            inner.server_name, options.prefix
        );
        Ok(Self { inner })
    }

    /// This server's name on the bus.
    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    /// Connections attached to this server.
    pub fn registry(&self) -> &Arc<HubRegistry> {
        &self.inner.registry
    }

    /// Group commands still waiting for an ack.
    pub fn pending_acks(&self) -> usize {
        self.inner.acks.pending()
    }
}

impl Inner {
    fn channel(&self, kind: &ChannelKind) -> String {
        match kind {
            ChannelKind::All => self.channels.all(),
            ChannelKind::Connection(id) => self.channels.connection(id),
            ChannelKind::Group(group) => self.channels.group(group),
            ChannelKind::User(user) => self.channels.user(user),
            ChannelKind::GroupManagement => self.channels.group_management(),
            ChannelKind::Ack => self.channels.ack(&self.server_name),
        }
    }

    /// Whether any local connection still needs `kind`.
    fn in_use(&self, kind: &ChannelKind) -> bool {
        match kind {
            ChannelKind::Connection(id) => self.registry.contains(id),
            ChannelKind::Group(group) => self.registry.has_group(group),
            ChannelKind::User(user) => self.registry.has_user(user),
            ChannelKind::All | ChannelKind::GroupManagement | ChannelKind::Ack => true,
        }
    }

    async fn ensure_subscribed(self: &Arc<Self>, kind: ChannelKind) -> Result<(), BackplaneError> {
        let channel = self.channel(&kind);
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&channel) {
            return Ok(());
        }
        // Checked under the subscription lock, like `release_if_unused`, so
        // a member that left in the meantime does not leave a subscription.
        if !self.in_use(&kind) {
            debug!("[Backplane] Skipping subscribe to {channel}; no local members");
            return Ok(());
        }
        let rx = self.backplane.subscribe(&channel).await?;
        debug!("[Backplane] Subscribed to {channel}");
        subscriptions.insert(channel, spawn_listener(Arc::downgrade(self), kind, rx));
        Ok(())
    }

    async fn release_if_unused(&self, kind: ChannelKind) {
        let channel = self.channel(&kind);
        let mut subscriptions = self.subscriptions.lock().await;
        if self.in_use(&kind) {
            return;
        }
        let Some(listener) = subscriptions.remove(&channel) else {
            return;
        };
        if let Err(e) = self.backplane.unsubscribe(&channel).await {
            warn!("[Backplane] Failed to unsubscribe from {channel}: {e}");
        }
        listener.abort();
        debug!("[Backplane] Unsubscribed from {channel}");
    }

    async fn handle(self: &Arc<Self>, kind: &ChannelKind, payload: &[u8]) {
        match kind {
            ChannelKind::All => self.deliver_envelope(payload, self.registry.all()),
            ChannelKind::Connection(id) => self.deliver_envelope(payload, self.registry.get(id)),
            ChannelKind::Group(group) => {
                self.deliver_envelope(payload, self.registry.group_members(group));
            }
            ChannelKind::User(user) => {
                self.deliver_envelope(payload, self.registry.user_connections(user));
            }
            ChannelKind::GroupManagement => self.handle_group_command(payload).await,
            ChannelKind::Ack => match decode::<AckMessage>(payload) {
                Ok(ack) => {
                    if !self.acks.trigger(ack.id) {
                        debug!("[Backplane] Ack {} arrived after its waiter gave up", ack.id);
                    }
                }
                Err(e) => warn!("[Backplane] Dropping malformed ack: {e}"),
            },
        }
    }

    fn deliver_envelope(
        &self,
        payload: &[u8],
        targets: impl IntoIterator<Item = Arc<HubConnectionContext>>,
    ) {
        let envelope: InvocationEnvelope = match decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("[Backplane] Dropping malformed invocation: {e}");
                return;
            }
        };
        let targets = filter_targets(targets, &envelope.excluded_ids);
        if targets.is_empty() {
            return;
        }
        let message = SerializedHubMessage::from_encoded(envelope.payloads);
        let delivered = deliver(targets, &message);
        debug!(
            "[Backplane] '{}' delivered to {delivered} local connection(s)",
            envelope.target
        );
    }

    async fn handle_group_command(self: &Arc<Self>, payload: &[u8]) {
        let command: GroupCommand = match decode(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("[Backplane] Dropping malformed group command: {e}");
                return;
            }
        };
        if command.server_name == self.server_name || !self.registry.contains(&command.connection_id) {
            return;
        }
        if let Err(e) = self
            .apply_group_change(command.action, &command.connection_id, &command.group)
            .await
        {
            warn!(
                "[Backplane] Failed to apply {:?} of {} to '{}': {e}",
                command.action, command.connection_id, command.group
            );
            return;
        }
        let ack = match encode(&AckMessage { id: command.id }) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("[Backplane] Failed to encode ack {}: {e}", command.id);
                return;
            }
        };
        if let Err(e) = self
            .backplane
            .publish(&self.channels.ack(&command.server_name), ack)
            .await
        {
            warn!("[Backplane] Failed to ack command {} to '{}': {e}", command.id, command.server_name);
        }
    }

    /// Change a local connection's membership and the matching subscription.
    async fn apply_group_change(
        self: &Arc<Self>,
        action: GroupAction,
        connection_id: &str,
        group: &str,
    ) -> Result<(), BackplaneError> {
        match action {
            GroupAction::Add => {
                if self.registry.add_to_group(connection_id, group) {
                    self.ensure_subscribed(ChannelKind::Group(group.to_string()))
                        .await?;
                }
            }
            GroupAction::Remove => {
                if self.registry.remove_from_group(connection_id, group) {
                    self.release_if_unused(ChannelKind::Group(group.to_string()))
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Ask the server owning `connection_id` to change its membership, and
    /// wait until it has.
    async fn send_group_command(
        &self,
        action: GroupAction,
        connection_id: &str,
        group: &str,
    ) -> Result<(), BackplaneError> {
        let ack = self.acks.register();
        let id = ack.id();
        let command = GroupCommand {
            id,
            server_name: self.server_name.clone(),
            action,
            group: group.to_string(),
            connection_id: connection_id.to_string(),
        };
        let published = match encode(&command) {
            Ok(payload) => {
                self.backplane
                    .publish(&self.channels.group_management(), payload)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            self.acks.cancel(id);
            return Err(e);
        }

        self.acks.wait(ack, self.ack_timeout).await.inspect_err(|e| {
            warn!("[Backplane] {action:?} of {connection_id} to '{group}' failed: {e}");
        })
    }

    /// Encode `method(args)` once for every protocol and publish it on each
    /// of `channels`.
    async fn publish_invocation(
        &self,
        channels: &[String],
        method: &str,
        args: Vec<Value>,
        excluded: &[String],
    ) -> Result<(), LifetimeError> {
        if channels.is_empty() {
            return Ok(());
        }
        let message = SerializedHubMessage::invocation(method, args);
        let envelope = InvocationEnvelope {
            target: method.to_string(),
            excluded_ids: excluded.to_vec(),
            payloads: message.encode_all(self.protocols.iter())?,
        };
        let payload: Bytes = encode(&envelope)?;
        for channel in channels {
            self.backplane.publish(channel, payload.clone()).await?;
        }
        debug!("[Backplane] Published '{method}' to {} channel(s)", channels.len());
        Ok(())
    }
}

fn spawn_listener(
    inner: Weak<Inner>,
    kind: ChannelKind,
    mut rx: UnboundedReceiver<Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.handle(&kind, &payload).await;
        }
    })
}

#[async_trait]
impl HubLifetimeManager for BackplaneHubLifetimeManager {
    async fn on_connected(&self, connection: Arc<HubConnectionContext>) -> Result<(), LifetimeError> {
        let inner = &self.inner;
        let id = connection.connection_id().to_string();
        let user = connection.user_id().map(str::to_string);
        inner.registry.add_connection(connection);

        inner.ensure_subscribed(ChannelKind::Connection(id.clone())).await?;
        if let Some(user) = user {
            inner.ensure_subscribed(ChannelKind::User(user)).await?;
        }
        info!("[Backplane] Connected: {id} on '{}'", inner.server_name);
        Ok(())
    }

    async fn on_disconnected(&self, connection: &Arc<HubConnectionContext>) -> Result<(), LifetimeError> {
        let inner = &self.inner;
        // Groups come from the drain under the mirror lock, so a join that
        // races the disconnect is released too.
        let Some(groups) = inner.registry.remove_connection(connection) else {
            return Ok(());
        };

        let id = connection.connection_id();
        inner.release_if_unused(ChannelKind::Connection(id.to_string())).await;
        for group in groups {
            inner.release_if_unused(ChannelKind::Group(group)).await;
        }
        if let Some(user) = connection.user_id() {
            inner.release_if_unused(ChannelKind::User(user.to_string())).await;
        }
        info!("[Backplane] Disconnected: {id} from '{}'", inner.server_name);
        Ok(())
    }

    async fn add_to_group(&self, connection_id: &str, group: &str) -> Result<(), LifetimeError> {
        if self.inner.registry.contains(connection_id) {
            self.inner
                .apply_group_change(GroupAction::Add, connection_id, group)
                .await?;
            return Ok(());
        }
        self.inner
            .send_group_command(GroupAction::Add, connection_id, group)
            .await?;
        Ok(())
    }

    async fn remove_from_group(&self, connection_id: &str, group: &str) -> Result<(), LifetimeError> {
        if self.inner.registry.contains(connection_id) {
            self.inner
                .apply_group_change(GroupAction::Remove, connection_id, group)
                .await?;
            return Ok(());
        }
        self.inner
            .send_group_command(GroupAction::Remove, connection_id, group)
            .await?;
        Ok(())
    }

    async fn send_all(&self, method: &str, args: Vec<Value>) -> Result<(), LifetimeError> {
        let channel = self.inner.channels.all();
        self.inner.publish_invocation(&[channel], method, args, &[]).await
    }

    async fn send_all_except(
        &self,
        method: &str,
        args: Vec<Value>,
        excluded: &[String],
    ) -> Result<(), LifetimeError> {
        let channel = self.inner.channels.all();
        self.inner
            .publish_invocation(&[channel], method, args, excluded)
            .await
    }

    async fn send_connection(
        &self,
        connection_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError> {
        self.send_connections(&[connection_id.to_string()], method, args)
            .await
    }

    async fn send_connections(
        &self,
        connection_ids: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError> {
        let inner = &self.inner;
        let (local, remote): (Vec<_>, Vec<_>) = connection_ids
            .iter()
            .partition(|id| inner.registry.contains(id));

        // Local targets skip the bus.
        let local = filter_targets(local.iter().filter_map(|id| inner.registry.get(id)), &[]);
        if !local.is_empty() {
            deliver(local, &SerializedHubMessage::invocation(method, args.clone()));
        }

        let mut channels: Vec<String> = remote.iter().map(|id| inner.channels.connection(id)).collect();
        channels.dedup();
        inner.publish_invocation(&channels, method, args, &[]).await
    }

    async fn send_group(&self, group: &str, method: &str, args: Vec<Value>) -> Result<(), LifetimeError> {
        let channel = self.inner.channels.group(group);
        self.inner.publish_invocation(&[channel], method, args, &[]).await
    }

    async fn send_groups(
        &self,
        groups: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError> {
        let channels: Vec<String> = groups.iter().map(|g| self.inner.channels.group(g)).collect();
        self.inner.publish_invocation(&channels, method, args, &[]).await
    }

    async fn send_group_except(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
        excluded: &[String],
    ) -> Result<(), LifetimeError> {
        let channel = self.inner.channels.group(group);
        self.inner
            .publish_invocation(&[channel], method, args, excluded)
            .await
    }

    async fn send_user(&self, user: &str, method: &str, args: Vec<Value>) -> Result<(), LifetimeError> {
        let channel = self.inner.channels.user(user);
        self.inner.publish_invocation(&[channel], method, args, &[]).await
    }

    async fn send_users(
        &self,
        users: &[String],
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), LifetimeError> {
        let channels: Vec<String> = users.iter().map(|u| self.inner.channels.user(u)).collect();
        self.inner.publish_invocation(&channels, method, args, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::InMemoryBackplane;
    use crate::connection::{ConnectionState, Outbound};
    use crate::protocol::{HubMessage, HubProtocol, JsonHubProtocol, PassthroughBinder};
    use serde_json::json;

    struct Client {
        conn: Arc<HubConnectionContext>,
        rx: tokio::sync::mpsc::UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn new(id: &str, user: Option<&str>) -> Self {
            let (conn, rx) = HubConnectionContext::new(id, user.map(str::to_string));
            conn.set_protocol(Arc::new(JsonHubProtocol::new()));
            conn.transition(ConnectionState::Active);
            Self { conn, rx }
        }

        async fn next_target(&mut self) -> String {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("connection queue closed");
            let Outbound::Frame(bytes) = frame else {
                panic!("unexpected shutdown");
            };
            let (message, _) = JsonHubProtocol::new()
                .try_parse_message(&bytes, &PassthroughBinder)
                .unwrap()
                .unwrap();
            match message {
                HubMessage::Invocation(inv) => inv.target,
                other => panic!("unexpected {other:?}"),
            }
        }

        async fn assert_idle(&mut self) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(self.rx.try_recv().is_err(), "expected no message");
        }
    }

    async fn server(bus: &InMemoryBackplane, name: &str) -> BackplaneHubLifetimeManager {
        let protocols = ProtocolRegistry::from_names(&["json", "messagepack"]).unwrap();
        let options = BackplaneOptions {
            prefix: "test".into(),
            server_name: name.into(),
            ack_timeout: Duration::from_millis(200),
        };
        BackplaneHubLifetimeManager::new(Arc::new(bus.client()), protocols, options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_all_crosses_servers() {
        let bus = InMemoryBackplane::new();
        let a = server(&bus, "a").await;
        let b = server(&bus, "b").await;
        let mut c1 = Client::new("c1", None);
        let mut c2 = Client::new("c2", None);
        a.on_connected(Arc::clone(&c1.conn)).await.unwrap();
        b.on_connected(Arc::clone(&c2.conn)).await.unwrap();

        a.send_all("Hello", vec![json!("x")]).await.unwrap();
        assert_eq!(c1.next_target().await, "Hello");
        assert_eq!(c2.next_target().await, "Hello");

        b.send_all_except("Quiet", vec![], &["c1".to_string()]).await.unwrap();
        assert_eq!(c2.next_target().await, "Quiet");
        c1.assert_idle().await;
    }

    #[tokio::test]
    async fn test_remote_group_add_is_acknowledged_before_returning() {
        let bus = InMemoryBackplane::new();
        let a = server(&bus, "a").await;
        let b = server(&bus, "b").await;
        let mut c2 = Client::new("c2", None);
        b.on_connected(Arc::clone(&c2.conn)).await.unwrap();

        a.add_to_group("c2", "room").await.unwrap();
        assert!(b.registry().group_member_ids("room").contains(&"c2".to_string()));
        assert_eq!(a.pending_acks(), 0);

        a.send_group("room", "InRoom", vec![]).await.unwrap();
        assert_eq!(c2.next_target().await, "InRoom");

        a.remove_from_group("c2", "room").await.unwrap();
        assert!(!b.registry().has_group("room"));
        a.send_group("room", "Gone", vec![]).await.unwrap();
        c2.assert_idle().await;
    }

    #[tokio::test]
    async fn test_remote_group_change_for_unknown_connection_times_out() {
        let bus = InMemoryBackplane::new();
        let a = server(&bus, "a").await;
        let _b = server(&bus, "b").await;

        let err = a.add_to_group("ghost", "room").await.unwrap_err();
        assert!(matches!(
            err,
            LifetimeError::Backplane(BackplaneError::AckTimeout { .. })
        ));
        assert_eq!(a.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_group_subscription_follows_local_membership() {
        let bus = InMemoryBackplane::new();
        let a = server(&bus, "a").await;
        let c1 = Client::new("c1", None);
        let c2 = Client::new("c2", None);
        a.on_connected(Arc::clone(&c1.conn)).await.unwrap();
        a.on_connected(Arc::clone(&c2.conn)).await.unwrap();

        a.add_to_group("c1", "g").await.unwrap();
        a.add_to_group("c2", "g").await.unwrap();
        assert_eq!(bus.subscriber_count("test:group:g"), 1);

        a.remove_from_group("c1", "g").await.unwrap();
        assert_eq!(bus.subscriber_count("test:group:g"), 1);
        a.on_disconnected(&c2.conn).await.unwrap();
        assert_eq!(bus.subscriber_count("test:group:g"), 0);
        assert_eq!(bus.subscriber_count("test:connection:c2"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_releases_groups_joined_after_snapshot() {
        let bus = InMemoryBackplane::new();
        let a = server(&bus, "a").await;
        let c1 = Client::new("c1", None);
        a.on_connected(Arc::clone(&c1.conn)).await.unwrap();

        // A stale view of the groups misses the later join.
        let stale = c1.conn.groups();
        a.add_to_group("c1", "late").await.unwrap();
        assert!(stale.is_empty());
        assert_eq!(bus.subscriber_count("test:group:late"), 1);

        a.on_disconnected(&c1.conn).await.unwrap();
        assert_eq!(bus.subscriber_count("test:group:late"), 0);
        assert!(!a.registry().has_group("late"));
    }

    #[tokio::test]
    async fn test_group_join_after_removal_does_not_subscribe() {
        let bus = InMemoryBackplane::new();
        let a = server(&bus, "a").await;
        let c1 = Client::new("c1", None);
        a.on_connected(Arc::clone(&c1.conn)).await.unwrap();
        a.on_disconnected(&c1.conn).await.unwrap();

        a.inner
            .ensure_subscribed(ChannelKind::Group("orphan".to_string()))
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count("test:group:orphan"), 0);
    }

    #[tokio::test]
    async fn test_user_and_connection_sends_cross_servers() {
        let bus = InMemoryBackplane::new();
        let a = server(&bus, "a").await;
        let b = server(&bus, "b").await;
        let mut c1 = Client::new("c1", Some("alice"));
        let mut c2 = Client::new("c2", Some("alice"));
        a.on_connected(Arc::clone(&c1.conn)).await.unwrap();
        b.on_connected(Arc::clone(&c2.conn)).await.unwrap();

        a.send_user("alice", "ForAlice", vec![]).await.unwrap();
        assert_eq!(c1.next_target().await, "ForAlice");
        assert_eq!(c2.next_target().await, "ForAlice");

        a.send_connections(&["c1".to_string(), "c2".to_string()], "Direct", vec![])
            .await
            .unwrap();
        assert_eq!(c1.next_target().await, "Direct");
        assert_eq!(c2.next_target().await, "Direct");

        b.on_disconnected(&c2.conn).await.unwrap();
        assert_eq!(bus.subscriber_count("test:user:alice"), 1);
        a.send_connection("c2", "Late", vec![]).await.unwrap();
        c2.assert_idle().await;
    }
}
