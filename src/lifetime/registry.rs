//! Thread-safe store of connections, groups and users.
//!
//! All three tables are `DashMap`s, so operations on different keys proceed
//! in parallel. Membership changes for one connection are serialized through
//! that connection's group mirror lock: joining a group and removing the
//! connection can race, but the connection never ends up in a group after
//! it has been removed.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use log::warn;

use crate::connection::HubConnectionContext;

/// Connection registry, group table and user index.
#[derive(Debug, Default)]
pub struct HubRegistry {
    connections: DashMap<String, Arc<HubConnectionContext>>,
    groups: DashMap<String, HashSet<String>>,
    users: DashMap<String, HashSet<String>>,
}

impl HubRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection`. A duplicate id replaces the earlier entry.
    pub fn add_connection(&self, connection: Arc<HubConnectionContext>) {
        let id = connection.connection_id().to_string();
        if let Some(user) = connection.user_id() {
            self.users
                .entry(user.to_string())
                .or_default()
                .insert(id.clone());
        }
        if let Some(previous) = self.connections.insert(id.clone(), connection) {
            warn!(
                "[Lifetime] Connection id '{id}' registered twice; replacing {:?}",
                previous
            );
        }
    }

    /// Remove `connection` from the registry, its user and every group.
    ///
    /// Only removes the entry if it is this exact connection, so a stale
    /// disconnect cannot evict a replacement with the same id. Returns the
    /// groups the connection was in when its mirror was drained, or `None`
    /// if nothing was removed.
    pub fn remove_connection(&self, connection: &Arc<HubConnectionContext>) -> Option<Vec<String>> {
        let id = connection.connection_id();
        self.connections
            .remove_if(id, |_, current| Arc::ptr_eq(current, connection))?;

        let groups: Vec<String> = {
            let mut mirror = connection.groups_guard();
            mirror.drain().collect()
        };
        for group in &groups {
            self.leave(group, id);
        }

        if let Some(user) = connection.user_id() {
            if let Some(mut ids) = self.users.get_mut(user) {
                ids.remove(id);
            }
            self.users.remove_if(user, |_, ids| ids.is_empty());
        }
        Some(groups)
    }

    /// Look up a connection.
    pub fn get(&self, connection_id: &str) -> Option<Arc<HubConnectionContext>> {
        self.connections.get(connection_id).map(|c| Arc::clone(c.value()))
    }

    /// True if `connection_id` is registered.
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Add a registered connection to `group`.
    ///
    /// Returns `false` if the connection is unknown.
    pub fn add_to_group(&self, connection_id: &str, group: &str) -> bool {
        let Some(connection) = self.get(connection_id) else {
            return false;
        };
        let mut mirror = connection.groups_guard();
        // Removal takes the connection out of the map before draining the
        // mirror, so this check under the mirror lock cannot go stale.
        if !self.contains(connection_id) {
            return false;
        }
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(connection_id.to_string());
        mirror.insert(group.to_string());
        true
    }

    /// Remove a connection from `group`. Returns `false` if it was not a member.
    pub fn remove_from_group(&self, connection_id: &str, group: &str) -> bool {
        match self.get(connection_id) {
            Some(connection) => {
                let mut mirror = connection.groups_guard();
                mirror.remove(group);
                self.leave(group, connection_id)
            }
            None => self.leave(group, connection_id),
        }
    }

    fn leave(&self, group: &str, connection_id: &str) -> bool {
        let removed = match self.groups.get_mut(group) {
            Some(mut members) => members.remove(connection_id),
            None => false,
        };
        self.groups.remove_if(group, |_, members| members.is_empty());
        removed
    }

    /// Every registered connection.
    pub fn all(&self) -> Vec<Arc<HubConnectionContext>> {
        self.connections.iter().map(|c| Arc::clone(c.value())).collect()
    }

    fn resolve(&self, ids: impl IntoIterator<Item = String>) -> Vec<Arc<HubConnectionContext>> {
        ids.into_iter().filter_map(|id| self.get(&id)).collect()
    }

    /// Ids of the members of `group`.
    pub fn group_member_ids(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Connections in `group`.
    pub fn group_members(&self, group: &str) -> Vec<Arc<HubConnectionContext>> {
        self.resolve(self.group_member_ids(group))
    }

    /// Connections of `user`.
    pub fn user_connections(&self, user: &str) -> Vec<Arc<HubConnectionContext>> {
        let ids: Vec<String> = self
            .users
            .get(user)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        self.resolve(ids)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// True if `group` has at least one member.
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// True if `user` has at least one connection.
    pub fn has_user(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str, user: Option<&str>) -> Arc<HubConnectionContext> {
        HubConnectionContext::new(id, user.map(str::to_string)).0
    }

    fn ids(conns: &[Arc<HubConnectionContext>]) -> Vec<String> {
        let mut ids: Vec<String> = conns.iter().map(|c| c.connection_id().to_string()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_groups_and_cleanup() {
        let registry = HubRegistry::new();
        let a = conn("a", None);
        let b = conn("b", None);
        registry.add_connection(Arc::clone(&a));
        registry.add_connection(Arc::clone(&b));

        assert!(registry.add_to_group("a", "g"));
        assert!(registry.add_to_group("b", "g"));
        assert!(!registry.add_to_group("missing", "g"));
        assert_eq!(ids(&registry.group_members("g")), vec!["a", "b"]);
        assert!(a.groups().contains("g"));

        assert!(registry.remove_from_group("a", "g"));
        assert!(!registry.remove_from_group("a", "g"), "second remove is a no-op");
        assert_eq!(ids(&registry.group_members("g")), vec!["b"]);

        assert_eq!(registry.remove_connection(&b), Some(vec!["g".to_string()]));
        assert!(!registry.has_group("g"), "empty group is dropped");
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_user_index() {
        let registry = HubRegistry::new();
        let tab1 = conn("t1", Some("alice"));
        let tab2 = conn("t2", Some("alice"));
        registry.add_connection(Arc::clone(&tab1));
        registry.add_connection(Arc::clone(&tab2));
        assert_eq!(ids(&registry.user_connections("alice")), vec!["t1", "t2"]);

        registry.remove_connection(&tab1);
        registry.remove_connection(&tab2);
        assert!(!registry.has_user("alice"));
        assert!(registry.user_connections("alice").is_empty());
    }

    #[test]
    fn test_duplicate_id_replaces_and_stale_removal_is_ignored() {
        let registry = HubRegistry::new();
        let old = conn("dup", None);
        let new = conn("dup", None);
        registry.add_connection(Arc::clone(&old));
        registry.add_connection(Arc::clone(&new));

        assert_eq!(registry.remove_connection(&old), None);
        assert!(Arc::ptr_eq(&registry.get("dup").unwrap(), &new));
    }

    #[test]
    fn test_concurrent_join_and_remove_never_leaves_member() {
        for _ in 0..100 {
            let registry = Arc::new(HubRegistry::new());
            let c = conn("c", None);
            registry.add_connection(Arc::clone(&c));

            let joiner = {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.add_to_group("c", "g"))
            };
            let remover = {
                let registry = Arc::clone(&registry);
                let c = Arc::clone(&c);
                std::thread::spawn(move || registry.remove_connection(&c))
            };
            joiner.join().unwrap();
            remover.join().unwrap();

            assert!(registry.group_members("g").is_empty());
            assert!(registry.group_member_ids("g").is_empty());
        }
    }
}
