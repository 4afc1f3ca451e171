//! Connection registry — which live connections each user holds.
//!
//! A user may hold several connections at once (tabs, devices). Entries
//! only exist for users with at least one authenticated connection.

use std::collections::HashSet;

use dashmap::DashMap;
use uuid::Uuid;

use crate::auth::UserId;

pub type ConnectionId = Uuid;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for `user_id`. Returns true if this is the user's
    /// first live connection. Registering the same pair twice is a no-op.
    pub fn register(&self, user_id: UserId, conn_id: ConnectionId) -> bool {
        let mut conns = self.users.entry(user_id).or_default();
        let first = conns.is_empty();
        conns.insert(conn_id);
        first
    }

    /// Remove a connection. Returns true if this removed the user's last
    /// connection. Unknown pairs are ignored.
    pub fn unregister(&self, user_id: UserId, conn_id: ConnectionId) -> bool {
        // Removal and pruning happen under one shard lock so a concurrent
        // register cannot land in a set that is about to be dropped.
        self.users
            .remove_if_mut(&user_id, |_, conns| {
                conns.remove(&conn_id);
                conns.is_empty()
            })
            .is_some()
    }

    /// Snapshot of the user's current connections.
    pub fn connections_for(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.users
            .get(&user_id)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users.contains_key(&user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.users.iter().map(|e| *e.key()).collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn connection_count(&self) -> usize {
        self.users.iter().map(|e| e.value().len()).sum()
    }
}
