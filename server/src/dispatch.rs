//! Fan-out of persisted messages to every live connection of a set of users.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::UserId;
use crate::protocol::ServerEvent;
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Sending half of a connection's outbound queue. The connection's writer
/// task owns the receiving half.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    outboxes: DashMap<ConnectionId, Outbox>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            outboxes: DashMap::new(),
        }
    }

    pub fn attach(&self, conn_id: ConnectionId, outbox: Outbox) {
        self.outboxes.insert(conn_id, outbox);
    }

    pub fn detach(&self, conn_id: ConnectionId) {
        self.outboxes.remove(&conn_id);
    }

    /// Push directly to one connection. Returns false if it is gone.
    pub fn send_to(&self, conn_id: ConnectionId, event: ServerEvent) -> bool {
        // Clone the sender out so no map guard is held while sending.
        let Some(outbox) = self.outboxes.get(&conn_id).map(|o| o.clone()) else {
            return false;
        };
        outbox.send(event).is_ok()
    }

    /// Push `event` to every live connection of every user in `participants`.
    ///
    /// Each connection receives at most one copy. Connections that closed
    /// after the registry snapshot are skipped silently. Returns the number
    /// of push attempts made.
    pub fn broadcast(&self, participants: &HashSet<UserId>, event: &ServerEvent) -> usize {
        let mut attempts = 0;
        for &user_id in participants {
            for conn_id in self.registry.connections_for(user_id) {
                attempts += 1;
                if !self.send_to(conn_id, event.clone()) {
                    debug!(user_id, conn_id = %conn_id, "push dropped: connection gone");
                }
            }
        }
        attempts
    }
}
