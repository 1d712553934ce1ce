//! Client-addressing facades over a lifetime manager.
//!
//! ```ignore
//! ctx.clients().others().send("Joined", vec![json!(name)]).await?;
//! ctx.groups().add_to_group(ctx.connection_id(), "lobby").await?;
//! ```

use std::sync::Arc;

use serde_json::Value;

use super::{HubLifetimeManager, LifetimeError};

/// Who a [`ClientProxy`] sends to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// Every connection.
    All,
    /// Every connection except the listed ids.
    AllExcept(Vec<String>),
    /// One connection.
    Connection(String),
    /// Several connections.
    Connections(Vec<String>),
    /// Members of a group.
    Group(String),
    /// Members of any of several groups.
    Groups(Vec<String>),
    /// Members of a group except the listed ids.
    GroupExcept {
        /// Group name.
        group: String,
        /// Connection ids to skip.
        excluded: Vec<String>,
    },
    /// Connections of a user.
    User(String),
    /// Connections of several users.
    Users(Vec<String>),
}

/// A resolved audience that can be sent invocations.
#[derive(Clone)]
pub struct ClientProxy {
    lifetime: Arc<dyn HubLifetimeManager>,
    target: SendTarget,
}

impl std::fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProxy")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl ClientProxy {
    /// The audience.
    pub fn target(&self) -> &SendTarget {
        &self.target
    }

    /// Invoke `method` with `args` on every client in the audience.
    pub async fn send(&self, method: &str, args: Vec<Value>) -> Result<(), LifetimeError> {
        let lifetime = &self.lifetime;
        match &self.target {
            SendTarget::All => lifetime.send_all(method, args).await,
            SendTarget::AllExcept(excluded) => lifetime.send_all_except(method, args, excluded).await,
            SendTarget::Connection(id) => lifetime.send_connection(id, method, args).await,
            SendTarget::Connections(ids) => lifetime.send_connections(ids, method, args).await,
            SendTarget::Group(group) => lifetime.send_group(group, method, args).await,
            SendTarget::Groups(groups) => lifetime.send_groups(groups, method, args).await,
            SendTarget::GroupExcept { group, excluded } => {
                lifetime.send_group_except(group, method, args, excluded).await
            }
            SendTarget::User(user) => lifetime.send_user(user, method, args).await,
            SendTarget::Users(users) => lifetime.send_users(users, method, args).await,
        }
    }
}

/// Entry point for addressing clients.
#[derive(Clone)]
pub struct HubClients {
    lifetime: Arc<dyn HubLifetimeManager>,
}

impl std::fmt::Debug for HubClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClients").finish_non_exhaustive()
    }
}

impl HubClients {
    /// Facade over `lifetime`.
    pub fn new(lifetime: Arc<dyn HubLifetimeManager>) -> Self {
        Self { lifetime }
    }

    fn proxy(&self, target: SendTarget) -> ClientProxy {
        ClientProxy {
            lifetime: Arc::clone(&self.lifetime),
            target,
        }
    }

    /// Every connection.
    pub fn all(&self) -> ClientProxy {
        self.proxy(SendTarget::All)
    }

    /// Every connection except `excluded`.
    pub fn all_except(&self, excluded: Vec<String>) -> ClientProxy {
        self.proxy(SendTarget::AllExcept(excluded))
    }

    /// One connection.
    pub fn client(&self, connection_id: impl Into<String>) -> ClientProxy {
        self.proxy(SendTarget::Connection(connection_id.into()))
    }

    /// Several connections.
    pub fn clients(&self, connection_ids: Vec<String>) -> ClientProxy {
        self.proxy(SendTarget::Connections(connection_ids))
    }

    /// Members of `group`.
    pub fn group(&self, group: impl Into<String>) -> ClientProxy {
        self.proxy(SendTarget::Group(group.into()))
    }

    /// Members of any of `groups`.
    pub fn groups(&self, groups: Vec<String>) -> ClientProxy {
        self.proxy(SendTarget::Groups(groups))
    }

    /// Members of `group` except `excluded`.
    pub fn group_except(&self, group: impl Into<String>, excluded: Vec<String>) -> ClientProxy {
        self.proxy(SendTarget::GroupExcept {
            group: group.into(),
            excluded,
        })
    }

    /// Connections of `user`.
    pub fn user(&self, user: impl Into<String>) -> ClientProxy {
        self.proxy(SendTarget::User(user.into()))
    }

    /// Connections of any of `users`.
    pub fn users(&self, users: Vec<String>) -> ClientProxy {
        self.proxy(SendTarget::Users(users))
    }
}

/// [`HubClients`] plus audiences relative to the calling connection.
#[derive(Clone)]
pub struct HubCallerClients {
    clients: HubClients,
    caller_id: String,
}

impl std::fmt::Debug for HubCallerClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubCallerClients")
            .field("caller_id", &self.caller_id)
            .finish_non_exhaustive()
    }
}

impl HubCallerClients {
    /// Facade for the connection `caller_id`.
    pub fn new(lifetime: Arc<dyn HubLifetimeManager>, caller_id: String) -> Self {
        Self {
            clients: HubClients::new(lifetime),
            caller_id,
        }
    }

    /// The calling connection.
    pub fn caller(&self) -> ClientProxy {
        self.clients.client(self.caller_id.clone())
    }

    /// Every connection but the caller.
    pub fn others(&self) -> ClientProxy {
        self.clients.all_except(vec![self.caller_id.clone()])
    }

    /// Members of `group` other than the caller.
    pub fn others_in_group(&self, group: impl Into<String>) -> ClientProxy {
        self.clients.group_except(group, vec![self.caller_id.clone()])
    }
}

impl std::ops::Deref for HubCallerClients {
    type Target = HubClients;

    fn deref(&self) -> &HubClients {
        &self.clients
    }
}

/// Group membership changes.
#[derive(Clone)]
pub struct GroupManager {
    lifetime: Arc<dyn HubLifetimeManager>,
}

impl std::fmt::Debug for GroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupManager").finish_non_exhaustive()
    }
}

impl GroupManager {
    /// Manager over `lifetime`.
    pub fn new(lifetime: Arc<dyn HubLifetimeManager>) -> Self {
        Self { lifetime }
    }

    /// Add `connection_id` to `group`.
    ///
    /// With a backplane this waits for the owning server to apply the change.
    pub async fn add_to_group(&self, connection_id: &str, group: &str) -> Result<(), LifetimeError> {
        self.lifetime.add_to_group(connection_id, group).await
    }

    /// Remove `connection_id` from `group`.
    pub async fn remove_from_group(&self, connection_id: &str, group: &str) -> Result<(), LifetimeError> {
        self.lifetime.remove_from_group(connection_id, group).await
    }
}
