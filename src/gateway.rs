//! Gateway: connection lifecycle, inbound dispatch, and outbound broadcast
//!
//! One gateway instance per process. It owns the connection registry,
//! authenticates handshakes against the token verifier and revocation store,
//! routes inbound client events through a typed dispatch on the event tag,
//! and exposes the broadcast operations that domain services call after
//! mutations (directly in-process, or via the pub/sub bridge from another
//! process).

use crate::auth::{Identity, RevocationStore, TokenVerifier};
use crate::channel::{self, authorize};
use crate::config::FabricConfig;
use crate::errors::{FabricError, FabricResult};
use crate::protocol::{ClientEvent, ConnectionId, NotificationPayload, ServerEvent};
use crate::registry::{Connection, ConnectionRegistry};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// WebSocket gateway for one server process
pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    verifier: Arc<dyn TokenVerifier>,
    revocations: Arc<dyn RevocationStore>,
    config: FabricConfig,
}

impl Gateway {
    pub fn new(
        config: FabricConfig,
        verifier: Arc<dyn TokenVerifier>,
        revocations: Arc<dyn RevocationStore>,
    ) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            verifier,
            revocations,
            config,
        }
    }

    /// The registry owned by this gateway
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Verify a bearer token and check it against the revocation store
    ///
    /// This is the single security gate: a connection is only registered
    /// after this returns an identity. Failures reject the handshake; the
    /// registry is untouched.
    pub async fn authenticate(&self, token: Option<&str>) -> FabricResult<Identity> {
        let token = token.ok_or_else(|| {
            warn!("Connection rejected: no token provided");
            FabricError::authentication("Authentication required")
        })?;

        let identity = self.verifier.verify(token).inspect_err(|e| {
            warn!("Connection rejected: {}", e);
        })?;

        if self.revocations.is_blacklisted(token).await? {
            warn!(user_id = %identity.user_id, "Connection rejected: token blacklisted");
            return Err(FabricError::authentication("Token is invalid"));
        }

        debug!(user_id = %identity.user_id, "Handshake authentication successful");
        Ok(identity)
    }

    /// Register an authenticated connection
    ///
    /// Auto-joins the user-scoped channel plus one channel per role and
    /// department, then queues the `connected` acknowledgement.
    pub async fn connect(
        &self,
        identity: Identity,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> ConnectionId {
        let connection = Connection::new(identity.clone(), sender);
        let id = self.registry.add(connection).await;

        self.registry.join(id, &channel::user_channel(&identity.user_id)).await;
        for role in &identity.roles {
            self.registry.join(id, &channel::role_channel(role)).await;
        }
        for dept in &identity.departments {
            self.registry.join(id, &channel::department_channel(dept)).await;
        }

        let total_clients = self.registry.connection_count().await;
        info!(
            connection_id = %id,
            user_id = %identity.user_id,
            total_clients,
            "Client connected"
        );

        let ack = ServerEvent::Connected {
            client_id: id,
            timestamp: Utc::now(),
        };
        if self.registry.send_to(id, ack).await.is_err() {
            // Socket already gone; the transport loop will call disconnect.
            debug!(connection_id = %id, "Connected ack dropped, socket closed");
        }

        id
    }

    /// Parse and dispatch a raw inbound text frame
    ///
    /// Malformed frames are logged and dropped; they never tear down the
    /// connection or the gateway.
    pub async fn handle_raw(&self, id: ConnectionId, text: &str) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.handle_event(id, event).await,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Dropping malformed client message");
            }
        }
    }

    /// Dispatch one inbound client event
    pub async fn handle_event(&self, id: ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::Heartbeat { .. } => self.on_heartbeat(id).await,
            ClientEvent::Subscribe { channels } => self.on_subscribe(id, channels).await,
            ClientEvent::Unsubscribe { channels } => self.on_unsubscribe(id, channels).await,
        }
    }

    /// Record a heartbeat and acknowledge it
    ///
    /// Silently ignored when the connection has already been evicted.
    async fn on_heartbeat(&self, id: ConnectionId) {
        if !self.registry.touch(id).await {
            return;
        }
        let ack = ServerEvent::HeartbeatAck {
            timestamp: Utc::now(),
        };
        let _ = self.registry.send_to(id, ack).await;
    }

    /// Process a subscribe request channel by channel
    ///
    /// Each requested channel is authorized independently; partial success is
    /// the normal case, not an error.
    async fn on_subscribe(&self, id: ConnectionId, channels: Vec<String>) {
        let Some(identity) = self.registry.identity_of(id).await else {
            return;
        };

        let mut granted = Vec::with_capacity(channels.len());
        for channel_name in channels {
            if authorize(&identity, &channel_name) {
                self.registry.join(id, &channel_name).await;
                info!(
                    connection_id = %id,
                    user_id = %identity.user_id,
                    channel = %channel_name,
                    "Client subscribed to channel"
                );
                granted.push(channel_name);
            } else {
                warn!(
                    connection_id = %id,
                    user_id = %identity.user_id,
                    channel = %channel_name,
                    "Client denied subscription to channel"
                );
                let error = ServerEvent::SubscriptionError {
                    channel: channel_name,
                    message: "Permission denied".to_string(),
                };
                let _ = self.registry.send_to(id, error).await;
            }
        }

        let ack = ServerEvent::Subscribed {
            channels: granted,
            timestamp: Utc::now(),
        };
        let _ = self.registry.send_to(id, ack).await;
    }

    /// Leave the named channels; no authorization needed to leave
    async fn on_unsubscribe(&self, id: ConnectionId, channels: Vec<String>) {
        for channel_name in &channels {
            self.registry.leave(id, channel_name).await;
            debug!(connection_id = %id, channel = %channel_name, "Client unsubscribed from channel");
        }
        let ack = ServerEvent::Unsubscribed {
            channels,
            timestamp: Utc::now(),
        };
        let _ = self.registry.send_to(id, ack).await;
    }

    /// Remove a connection and all its memberships
    ///
    /// Idempotent: disconnecting an id that is already gone is a no-op.
    pub async fn disconnect(&self, id: ConnectionId, reason: &str) {
        if let Some(connection) = self.registry.remove(id).await {
            info!(
                connection_id = %id,
                user_id = %connection.identity.user_id,
                reason = %reason,
                duration_ms = connection.connected_at.elapsed().as_millis() as u64,
                "Client disconnected"
            );
        }
    }

    /// Deliver an event to every local member of a channel
    ///
    /// Fire-and-forget over a membership snapshot taken at call time; the
    /// returned count is how many sends were queued, with no delivery
    /// guarantee behind it.
    pub async fn broadcast_to_channel(&self, channel_name: &str, event: ServerEvent) -> usize {
        let targets = self.registry.senders_of(channel_name).await;
        let mut delivered = 0;
        for (id, sender) in targets {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(connection_id = %id, "Skipped closed connection during broadcast");
            }
        }
        delivered
    }

    /// Deliver an event to members of any of the given channels, once each
    async fn broadcast_to_channels(&self, channel_names: &[&str], event: ServerEvent) -> usize {
        let mut seen: HashSet<ConnectionId> = HashSet::new();
        let mut delivered = 0;
        for channel_name in channel_names {
            for (id, sender) in self.registry.senders_of(channel_name).await {
                if seen.insert(id) && sender.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Deliver an event to every local connection
    pub async fn broadcast_all(&self, event: ServerEvent) -> usize {
        let targets = self.registry.all_senders().await;
        let mut delivered = 0;
        for (_, sender) in targets {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send a notification to every connection of one user
    pub async fn send_to_user(&self, user_id: &str, notification: NotificationPayload) -> usize {
        let event = ServerEvent::Notification {
            payload: notification,
            timestamp: Utc::now(),
            user_id: Some(user_id.to_string()),
        };
        let delivered = self
            .broadcast_to_channel(&channel::user_channel(user_id), event)
            .await;
        info!(user_id = %user_id, delivered, "Sent notification to user");
        delivered
    }

    /// Send an event to every connection holding a role
    pub async fn send_to_role(&self, role: &str, event: ServerEvent) -> usize {
        let delivered = self
            .broadcast_to_channel(&channel::role_channel(role), event)
            .await;
        info!(role = %role, delivered, "Broadcast to role");
        delivered
    }

    /// Announce a newly created ticket to the admin and support roles
    pub async fn broadcast_ticket_created(
        &self,
        ticket_id: &str,
        payload: serde_json::Value,
    ) -> usize {
        let event = ServerEvent::TicketCreated {
            payload,
            timestamp: Utc::now(),
            ticket_id: ticket_id.to_string(),
        };
        let delivered = self
            .broadcast_to_channels(
                &[&channel::role_channel("admin"), &channel::role_channel("support")],
                event,
            )
            .await;
        info!(ticket_id = %ticket_id, delivered, "Broadcast ticket created");
        delivered
    }

    /// Announce a ticket update to its watchers
    pub async fn broadcast_ticket_updated(
        &self,
        ticket_id: &str,
        payload: serde_json::Value,
    ) -> usize {
        let event = ServerEvent::TicketUpdated {
            payload,
            timestamp: Utc::now(),
            ticket_id: ticket_id.to_string(),
        };
        let channel_name = format!("ticket:{}", ticket_id);
        let delivered = self.broadcast_to_channel(&channel_name, event).await;
        info!(ticket_id = %ticket_id, delivered, "Broadcast ticket updated");
        delivered
    }

    /// Number of live connections on this process
    pub async fn online_clients_count(&self) -> usize {
        self.registry.connection_count().await
    }

    /// Distinct user ids connected to this process
    pub async fn online_users(&self) -> Vec<String> {
        self.registry.distinct_users().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{JwtVerifier, MemoryRevocationStore};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::sync::mpsc::UnboundedReceiver;

    const SECRET: &str = "test-secret";

    fn test_gateway() -> (Gateway, Arc<MemoryRevocationStore>) {
        let revocations = Arc::new(MemoryRevocationStore::new());
        let gateway = Gateway::new(
            FabricConfig::builder().jwt_secret(SECRET).build().unwrap(),
            Arc::new(JwtVerifier::new(SECRET)),
            revocations.clone(),
        );
        (gateway, revocations)
    }

    fn token(user_id: &str, roles: &[&str], departments: &[&str]) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = crate::auth::Claims {
            sub: user_id.to_string(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
            departments: departments.iter().map(|s| s.to_string()).collect(),
            exp: now + 3600,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn identity(user_id: &str, roles: &[&str], departments: &[&str]) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
            departments: departments.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn connect(
        gateway: &Gateway,
        user_id: &str,
        roles: &[&str],
        departments: &[&str],
    ) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = gateway.connect(identity(user_id, roles, departments), tx).await;
        (id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn authenticate_accepts_valid_token() {
        let (gateway, _) = test_gateway();
        let token = token("u1", &["support"], &["finance"]);
        let identity = gateway.authenticate(Some(&token)).await.unwrap();

        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.roles, vec!["support".to_string()]);
        assert_eq!(identity.departments, vec!["finance".to_string()]);
        assert_eq!(gateway.online_clients_count().await, 0);
    }

    #[tokio::test]
    async fn authenticate_rejects_missing_token() {
        let (gateway, _) = test_gateway();
        assert!(gateway.authenticate(None).await.is_err());
        assert_eq!(gateway.online_clients_count().await, 0);
    }

    #[tokio::test]
    async fn authenticate_rejects_blacklisted_token() {
        let (gateway, revocations) = test_gateway();
        let token = token("u1", &[], &[]);
        revocations.revoke(token.clone()).await;

        let result = gateway.authenticate(Some(&token)).await;
        assert!(matches!(result, Err(FabricError::Authentication { .. })));
        assert_eq!(gateway.online_clients_count().await, 0);
    }

    #[tokio::test]
    async fn connect_auto_joins_identity_channels() {
        let (gateway, _) = test_gateway();
        let (id, mut rx) = connect(&gateway, "u1", &["support"], &["finance"]).await;

        let channels = gateway.registry().channels_of(id).await.unwrap();
        assert!(channels.contains("user:u1"));
        assert!(channels.contains("role:support"));
        assert!(channels.contains("department:finance"));

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::Connected { client_id, .. }] if *client_id == id
        ));
    }

    #[tokio::test]
    async fn connect_runs_on_a_spawned_task() {
        // tokio::spawn requires the connect future to be Send
        let (gateway, _) = test_gateway();
        let gateway = Arc::new(gateway);
        let spawned = gateway.clone();
        let id = tokio::spawn(async move {
            let (tx, _rx) = mpsc::unbounded_channel();
            spawned.connect(identity("u1", &[], &[]), tx).await
        })
        .await
        .unwrap();

        assert!(gateway.registry().contains(id).await);
    }

    #[tokio::test]
    async fn subscribe_grants_and_denies_per_channel() {
        let (gateway, _) = test_gateway();
        let (id, mut rx) = connect(&gateway, "u1", &["support"], &[]).await;
        drain(&mut rx);

        gateway
            .handle_event(
                id,
                ClientEvent::Subscribe {
                    channels: vec!["role:admin".to_string(), "role:support".to_string()],
                },
            )
            .await;

        let events = drain(&mut rx);
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::SubscriptionError { channel, .. } => Some(channel.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec!["role:admin".to_string()]);

        let granted = events.iter().find_map(|e| match e {
            ServerEvent::Subscribed { channels, .. } => Some(channels.clone()),
            _ => None,
        });
        assert_eq!(granted, Some(vec!["role:support".to_string()]));

        let channels = gateway.registry().channels_of(id).await.unwrap();
        assert!(channels.contains("role:support"));
        assert!(!channels.contains("role:admin"));
    }

    #[tokio::test]
    async fn unsubscribe_needs_no_authorization() {
        let (gateway, _) = test_gateway();
        let (id, mut rx) = connect(&gateway, "u1", &["support"], &[]).await;
        drain(&mut rx);

        gateway
            .handle_event(
                id,
                ClientEvent::Unsubscribe {
                    channels: vec!["role:support".to_string()],
                },
            )
            .await;

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::Unsubscribed { channels, .. }] if channels == &["role:support".to_string()]
        ));
        let channels = gateway.registry().channels_of(id).await.unwrap();
        assert!(!channels.contains("role:support"));
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged() {
        let (gateway, _) = test_gateway();
        let (id, mut rx) = connect(&gateway, "u1", &[], &[]).await;
        drain(&mut rx);

        gateway
            .handle_event(
                id,
                ClientEvent::Heartbeat {
                    data: serde_json::json!({"seq": 1}),
                },
            )
            .await;

        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [ServerEvent::HeartbeatAck { .. }]));
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_connection_is_ignored() {
        let (gateway, _) = test_gateway();
        // Must not panic or register anything
        gateway
            .handle_event(
                ConnectionId::new(),
                ClientEvent::Heartbeat {
                    data: serde_json::Value::Null,
                },
            )
            .await;
        assert_eq!(gateway.online_clients_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let (gateway, _) = test_gateway();
        let (id, mut rx) = connect(&gateway, "u1", &[], &[]).await;
        drain(&mut rx);

        gateway.handle_raw(id, "{not json").await;
        gateway.handle_raw(id, r#"{"type":"unknown_event"}"#).await;

        assert!(drain(&mut rx).is_empty());
        assert!(gateway.registry().contains(id).await);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (gateway, _) = test_gateway();
        let (id, _rx) = connect(&gateway, "u1", &[], &[]).await;

        gateway.disconnect(id, "client namespace disconnect").await;
        assert_eq!(gateway.online_clients_count().await, 0);
        // Second call is a no-op
        gateway.disconnect(id, "client namespace disconnect").await;
        assert_eq!(gateway.online_clients_count().await, 0);
    }

    #[tokio::test]
    async fn send_to_user_reaches_only_that_users_connections() {
        let (gateway, _) = test_gateway();
        let (_, mut rx_a) = connect(&gateway, "u1", &[], &[]).await;
        let (_, mut rx_b) = connect(&gateway, "u1", &[], &[]).await;
        let (_, mut rx_c) = connect(&gateway, "u2", &[], &[]).await;
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        let notification =
            NotificationPayload::new("Reconciliation done", "All matched", crate::protocol::Severity::Success);
        let delivered = gateway.send_to_user("u1", notification).await;

        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn ticket_created_goes_to_admin_and_support_once() {
        let (gateway, _) = test_gateway();
        // Holds both roles; must still receive the event exactly once
        let (_, mut rx_both) = connect(&gateway, "u1", &["admin", "support"], &[]).await;
        let (_, mut rx_support) = connect(&gateway, "u2", &["support"], &[]).await;
        let (_, mut rx_none) = connect(&gateway, "u3", &[], &[]).await;
        drain(&mut rx_both);
        drain(&mut rx_support);
        drain(&mut rx_none);

        let delivered = gateway
            .broadcast_ticket_created("t-1", serde_json::json!({"title": "Printer on fire"}))
            .await;

        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut rx_both).len(), 1);
        assert_eq!(drain(&mut rx_support).len(), 1);
        assert!(drain(&mut rx_none).is_empty());
    }

    #[tokio::test]
    async fn broadcast_counts_only_open_connections() {
        let (gateway, _) = test_gateway();
        let (_, rx) = connect(&gateway, "u1", &[], &[]).await;
        drop(rx);

        let delivered = gateway
            .broadcast_to_channel(
                "user:u1",
                ServerEvent::HeartbeatAck {
                    timestamp: Utc::now(),
                },
            )
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn online_users_lists_distinct_users() {
        let (gateway, _) = test_gateway();
        let _conns = (
            connect(&gateway, "u1", &[], &[]).await,
            connect(&gateway, "u1", &[], &[]).await,
            connect(&gateway, "u2", &[], &[]).await,
        );

        assert_eq!(gateway.online_clients_count().await, 3);
        let mut users = gateway.online_users().await;
        users.sort();
        assert_eq!(users, vec!["u1".to_string(), "u2".to_string()]);
    }
}
