//! Group router: broadcast groups of live connections
//!
//! Each connection belongs to at most one group. Membership changes take a
//! single write lock, so join/leave/broadcast are atomic per call. Delivery
//! goes through each member's bounded outbound channel and never blocks.

mod key;

pub use key::{group_key, sanitize, MAX_GROUP_KEY_LEN};

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Identity of one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", &self.0.simple().to_string()[..8])
    }
}

/// Outbound half of a member's channel
pub type MemberSender = mpsc::Sender<String>;

#[derive(Default)]
struct Membership {
    groups: HashMap<String, HashMap<ConnectionId, MemberSender>>,
    /// Reverse index: the one group each connection is in
    joined: HashMap<ConnectionId, String>,
}

impl Membership {
    fn remove(&mut self, key: &str, connection: ConnectionId) -> bool {
        let Some(members) = self.groups.get_mut(key) else {
            return false;
        };
        let removed = members.remove(&connection).is_some();
        if members.is_empty() {
            self.groups.remove(key);
        }
        if removed {
            self.joined.remove(&connection);
        }
        removed
    }
}

/// Process-wide table of broadcast groups
#[derive(Default)]
pub struct GroupRouter {
    inner: RwLock<Membership>,
}

impl GroupRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a group, leaving any group it was in before.
    /// Joining the same group again replaces the sender.
    pub fn join(&self, key: &str, connection: ConnectionId, sender: MemberSender) {
        let mut inner = self.inner.write();

        if let Some(previous) = inner.joined.get(&connection).cloned() {
            if previous != key {
                inner.remove(&previous, connection);
                debug!(%connection, group = %previous, "Moved out of previous group");
            }
        }

        inner
            .groups
            .entry(key.to_string())
            .or_default()
            .insert(connection, sender);
        inner.joined.insert(connection, key.to_string());

        debug!(%connection, group = %key, "Joined group");
    }

    /// Remove a connection from a group. Returns whether it was a member;
    /// a second call is a no-op.
    pub fn leave(&self, key: &str, connection: ConnectionId) -> bool {
        let removed = self.inner.write().remove(key, connection);
        if removed {
            debug!(%connection, group = %key, "Left group");
        }
        removed
    }

    /// Send to every member. Returns the number of deliveries.
    pub fn broadcast(&self, key: &str, payload: &str) -> usize {
        self.deliver(key, payload, None)
    }

    /// Send to every member except `origin`
    pub fn broadcast_except(&self, key: &str, payload: &str, origin: ConnectionId) -> usize {
        self.deliver(key, payload, Some(origin))
    }

    fn deliver(&self, key: &str, payload: &str, skip: Option<ConnectionId>) -> usize {
        let inner = self.inner.read();
        let Some(members) = inner.groups.get(key) else {
            return 0;
        };

        let mut delivered = 0;
        for (connection, sender) in members {
            if Some(*connection) == skip {
                continue;
            }
            // Full or closed channels are skipped; the member's own
            // disconnect path removes it
            match sender.try_send(payload.to_string()) {
                Ok(()) => delivered += 1,
                Err(e) => trace!(%connection, group = %key, error = %e, "Broadcast skipped member"),
            }
        }
        delivered
    }

    pub fn member_count(&self, key: &str) -> usize {
        self.inner.read().groups.get(key).map_or(0, HashMap::len)
    }

    pub fn group_count(&self) -> usize {
        self.inner.read().groups.len()
    }
}
