//! Wire protocol between clients and the gateway
//!
//! Inbound client events form a closed set dispatched by tag; outbound
//! server events carry the acknowledgements and notification payloads.
//! Everything on the wire is tagged JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for client connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

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
        write!(f, "{}", self.0)
    }
}

/// Inbound events a client may send after the handshake
///
/// Unknown tags and malformed payloads are rejected at deserialization and
/// dropped by the gateway; they never reach a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Liveness signal; the payload is opaque client data
    Heartbeat {
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Request to join the named channels
    Subscribe { channels: Vec<String> },
    /// Request to leave the named channels
    Unsubscribe { channels: Vec<String> },
}

/// Outbound events the gateway sends to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake acknowledgement
    Connected {
        client_id: ConnectionId,
        timestamp: DateTime<Utc>,
    },
    /// Heartbeat acknowledgement
    HeartbeatAck { timestamp: DateTime<Utc> },
    /// Channels the subscribe request was granted
    Subscribed {
        channels: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// A single channel from a subscribe request was denied
    SubscriptionError { channel: String, message: String },
    /// Unsubscribe acknowledgement
    Unsubscribed {
        channels: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// User-facing notification
    Notification {
        payload: NotificationPayload,
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    /// A support ticket was created
    TicketCreated {
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
        ticket_id: String,
    },
    /// A support ticket was updated
    TicketUpdated {
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
        ticket_id: String,
    },
    /// Generic typed broadcast
    Broadcast {
        event: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

/// Severity of a user-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing notification message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    /// Structured context for the client UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Client-side navigation target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl NotificationPayload {
    pub fn new<T: Into<String>, M: Into<String>>(
        title: T,
        message: M,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            message: message.into(),
            severity,
            data: None,
            link: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_link<S: Into<String>>(mut self, link: S) -> Self {
        self.link = Some(link.into());
        self
    }
}
