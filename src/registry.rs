//! Process-local connection registry
//!
//! Maps connection ids to live connection records and keeps the inverse
//! channel→members index so channel broadcasts touch only the members, not
//! every connection. Both maps live behind one lock: removing a connection
//! clears its index entries in the same critical section, so the index never
//! references a dead connection.

use crate::auth::Identity;
use crate::errors::{FabricError, FabricResult};
use crate::protocol::{ConnectionId, ServerEvent};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One live client connection
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub connected_at: Instant,
    last_heartbeat: Instant,
    sender: mpsc::UnboundedSender<ServerEvent>,
    channels: HashSet<String>,
}

impl Connection {
    pub fn new(identity: Identity, sender: mpsc::UnboundedSender<ServerEvent>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            identity,
            connected_at: now,
            last_heartbeat: now,
            sender,
            channels: HashSet::new(),
        }
    }

    /// Queue an event on the connection's outbound channel
    pub fn send(&self, event: ServerEvent) -> FabricResult<()> {
        self.sender
            .send(event)
            .map_err(|_| FabricError::SendQueueClosed)
    }

    /// Record a heartbeat; Instant is monotonic so the timestamp never moves back
    fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Age of the most recent heartbeat
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }

    /// Channels this connection is a member of
    pub fn channels(&self) -> &HashSet<String> {
        &self.channels
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Connection>,
    channel_index: HashMap<String, HashSet<ConnectionId>>,
}

/// Registry of live connections, owned by one gateway instance
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to the registry
    pub async fn add(&self, connection: Connection) -> ConnectionId {
        let id = connection.id;
        let mut inner = self.inner.write().await;
        for channel in &connection.channels {
            inner
                .channel_index
                .entry(channel.clone())
                .or_default()
                .insert(id);
        }
        inner.connections.insert(id, connection);
        debug!("Connection {} added to registry", id);
        id
    }

    /// Remove a connection and all of its channel memberships
    ///
    /// Returns the removed record, or `None` if the id was already gone.
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let mut inner = self.inner.write().await;
        let connection = inner.connections.remove(&id)?;
        for channel in &connection.channels {
            if let Some(members) = inner.channel_index.get_mut(channel) {
                members.remove(&id);
                if members.is_empty() {
                    inner.channel_index.remove(channel);
                }
            }
        }
        debug!("Connection {} removed from registry", id);
        Some(connection)
    }

    /// Whether the id refers to a live connection
    pub async fn contains(&self, id: ConnectionId) -> bool {
        let inner = self.inner.read().await;
        inner.connections.contains_key(&id)
    }

    /// Identity snapshot of a connection
    pub async fn identity_of(&self, id: ConnectionId) -> Option<Identity> {
        let inner = self.inner.read().await;
        inner.connections.get(&id).map(|c| c.identity.clone())
    }

    /// Add a channel membership; returns false if the connection is unknown
    pub async fn join(&self, id: ConnectionId, channel: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(connection) = inner.connections.get_mut(&id) else {
            return false;
        };
        connection.channels.insert(channel.to_string());
        inner
            .channel_index
            .entry(channel.to_string())
            .or_default()
            .insert(id);
        true
    }

    /// Remove a channel membership
    pub async fn leave(&self, id: ConnectionId, channel: &str) {
        let mut inner = self.inner.write().await;
        if let Some(connection) = inner.connections.get_mut(&id) {
            connection.channels.remove(channel);
        }
        if let Some(members) = inner.channel_index.get_mut(channel) {
            members.remove(&id);
            if members.is_empty() {
                inner.channel_index.remove(channel);
            }
        }
    }

    /// Record a heartbeat; returns false if the connection is unknown
    pub async fn touch(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.connections.get_mut(&id) {
            Some(connection) => {
                connection.touch();
                true
            }
            None => false,
        }
    }

    /// Queue an event for one connection
    pub async fn send_to(&self, id: ConnectionId, event: ServerEvent) -> FabricResult<()> {
        let inner = self.inner.read().await;
        let connection = inner
            .connections
            .get(&id)
            .ok_or(FabricError::ConnectionNotFound(id))?;
        connection.send(event)
    }

    /// Snapshot of the connection ids subscribed to a channel
    pub async fn members_of(&self, channel: &str) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .channel_index
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the outbound senders for a channel's members
    pub(crate) async fn senders_of(
        &self,
        channel: &str,
    ) -> Vec<(ConnectionId, mpsc::UnboundedSender<ServerEvent>)> {
        let inner = self.inner.read().await;
        let Some(members) = inner.channel_index.get(channel) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| {
                inner
                    .connections
                    .get(id)
                    .map(|c| (*id, c.sender.clone()))
            })
            .collect()
    }

    /// Snapshot of every connection's outbound sender
    pub(crate) async fn all_senders(
        &self,
    ) -> Vec<(ConnectionId, mpsc::UnboundedSender<ServerEvent>)> {
        let inner = self.inner.read().await;
        inner
            .connections
            .values()
            .map(|c| (c.id, c.sender.clone()))
            .collect()
    }

    /// Connections whose last heartbeat is older than the timeout
    pub async fn stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .connections
            .values()
            .filter(|c| c.heartbeat_age() > timeout)
            .map(|c| c.id)
            .collect()
    }

    /// Number of live connections
    pub async fn connection_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.connections.len()
    }

    /// Distinct user ids among live connections
    pub async fn distinct_users(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let users: HashSet<&str> = inner
            .connections
            .values()
            .map(|c| c.identity.user_id.as_str())
            .collect();
        users.into_iter().map(String::from).collect()
    }

    /// Channel memberships of a connection
    pub async fn channels_of(&self, id: ConnectionId) -> Option<HashSet<String>> {
        let inner = self.inner.read().await;
        inner.connections.get(&id).map(|c| c.channels.clone())
    }

    /// Close all connections by dropping their records
    ///
    /// Dropping a record drops its outbound sender, which ends the owning
    /// socket task's write pump.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.write().await;
        let count = inner.connections.len();
        inner.connections.clear();
        inner.channel_index.clear();
        if count > 0 {
            info!("Cleared {} connections from registry", count);
        }
        count
    }
}
