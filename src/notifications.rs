//! Notification router
//!
//! Listens on the well-known bus channels and turns domain events into
//! user-facing notifications pushed through the gateway. Events that address
//! a user go to that user's connections only; the rest are broadcast.

use crate::bridge::{bus, DomainEvent, PubSubBridge};
use crate::gateway::Gateway;
use crate::protocol::{NotificationPayload, ServerEvent, Severity};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event tags carried on the bus
pub mod event {
    pub const AI_ANALYSIS_STARTED: &str = "ai:analysis:started";
    pub const AI_ANALYSIS_COMPLETED: &str = "ai:analysis:completed";
    pub const AI_ANALYSIS_FAILED: &str = "ai:analysis:failed";

    pub const RECONCILIATION_STARTED: &str = "reconciliation:started";
    pub const RECONCILIATION_COMPLETED: &str = "reconciliation:completed";
    pub const RECONCILIATION_MATCHED: &str = "reconciliation:matched";
    pub const RECONCILIATION_UNMATCHED: &str = "reconciliation:unmatched";

    pub const TICKET_CREATED: &str = "ticket:created";
    pub const TICKET_UPDATED: &str = "ticket:updated";
    pub const TICKET_RESOLVED: &str = "ticket:resolved";

    pub const SYSTEM_ALERT: &str = "system:alert";
    pub const SYSTEM_WARNING: &str = "system:warning";
}

/// Notification fields as they appear inside a bus event's `data`
#[derive(Debug, Deserialize)]
struct NotificationRequest {
    title: String,
    message: String,
    #[serde(rename = "type", alias = "severity")]
    severity: Severity,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    link: Option<String>,
}

impl NotificationRequest {
    fn into_payload(self) -> NotificationPayload {
        let mut payload = NotificationPayload::new(self.title, self.message, self.severity);
        if let Some(data) = self.data {
            payload = payload.with_data(data);
        }
        if let Some(link) = self.link {
            payload = payload.with_link(link);
        }
        payload
    }
}

/// Routes bus events to connected clients
pub struct NotificationRouter {
    bridge: Arc<PubSubBridge>,
    gateway: Arc<Gateway>,
}

impl NotificationRouter {
    pub fn new(bridge: Arc<PubSubBridge>, gateway: Arc<Gateway>) -> Self {
        Self { bridge, gateway }
    }

    /// Subscribe the bus channels and register their listeners
    pub async fn initialize(&self) -> crate::errors::FabricResult<()> {
        self.bridge.subscribe(bus::AI_ANALYSIS).await?;
        self.bridge.subscribe(bus::RECONCILIATION).await?;
        self.bridge.subscribe(bus::NOTIFICATION).await?;
        self.bridge.subscribe(bus::BROADCAST).await?;

        let gateway = self.gateway.clone();
        self.bridge
            .on(bus::AI_ANALYSIS, move |event, _| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    if let Some((payload, user_id)) = map_ai_event(event) {
                        deliver(&gateway, payload, user_id).await;
                    }
                });
            })
            .await;

        let gateway = self.gateway.clone();
        self.bridge
            .on(bus::RECONCILIATION, move |event, _| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    if let Some((payload, user_id)) = map_reconciliation_event(event) {
                        deliver(&gateway, payload, user_id).await;
                    }
                });
            })
            .await;

        let gateway = self.gateway.clone();
        self.bridge
            .on(bus::NOTIFICATION, move |event, _| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    match serde_json::from_value::<NotificationRequest>(event.data) {
                        Ok(request) => {
                            deliver(&gateway, request.into_payload(), event.user_id).await;
                        }
                        Err(err) => {
                            warn!(event = %event.event, error = %err, "Dropping malformed notification request");
                        }
                    }
                });
            })
            .await;

        let gateway = self.gateway.clone();
        self.bridge
            .on(bus::BROADCAST, move |event, _| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    gateway
                        .broadcast_all(ServerEvent::Broadcast {
                            event: event.event,
                            payload: event.data,
                            timestamp: Utc::now(),
                        })
                        .await;
                });
            })
            .await;

        info!("Notification router initialized");
        Ok(())
    }

    /// Publish a custom notification onto the bus
    ///
    /// Routed back through the bus so every gateway process delivers it, not
    /// just this one.
    pub async fn notify(
        &self,
        payload: NotificationPayload,
        user_id: Option<&str>,
    ) -> crate::errors::FabricResult<usize> {
        let mut event = DomainEvent::new(event::SYSTEM_ALERT, serde_json::to_value(&payload)?);
        if let Some(user_id) = user_id {
            event = event.with_user(user_id);
        }
        self.bridge.publish(bus::NOTIFICATION, event).await
    }

    pub async fn notify_analysis_started(
        &self,
        reconciliation_id: &str,
        record_count: u64,
        user_id: &str,
    ) -> crate::errors::FabricResult<usize> {
        let event = DomainEvent::new(
            event::AI_ANALYSIS_STARTED,
            json!({ "reconciliation_id": reconciliation_id, "record_count": record_count }),
        )
        .with_user(user_id);
        self.bridge.publish(bus::AI_ANALYSIS, event).await
    }

    pub async fn notify_analysis_completed(
        &self,
        reconciliation_id: &str,
        analysis_count: u64,
        issue_count: u64,
        user_id: &str,
    ) -> crate::errors::FabricResult<usize> {
        let event = DomainEvent::new(
            event::AI_ANALYSIS_COMPLETED,
            json!({
                "reconciliation_id": reconciliation_id,
                "analysis_count": analysis_count,
                "issue_count": issue_count,
            }),
        )
        .with_user(user_id);
        self.bridge.publish(bus::AI_ANALYSIS, event).await
    }

    pub async fn notify_analysis_failed(
        &self,
        reconciliation_id: &str,
        error: &str,
        user_id: &str,
    ) -> crate::errors::FabricResult<usize> {
        let event = DomainEvent::new(
            event::AI_ANALYSIS_FAILED,
            json!({ "reconciliation_id": reconciliation_id, "error": error }),
        )
        .with_user(user_id);
        self.bridge.publish(bus::AI_ANALYSIS, event).await
    }
}

/// Push a notification to its audience
async fn deliver(gateway: &Gateway, payload: NotificationPayload, user_id: Option<String>) {
    match user_id {
        Some(user_id) => {
            gateway.send_to_user(&user_id, payload).await;
        }
        None => {
            gateway
                .broadcast_all(ServerEvent::Notification {
                    payload,
                    timestamp: Utc::now(),
                    user_id: None,
                })
                .await;
        }
    }
}

fn count(data: &Value, key: &str) -> u64 {
    data.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn reconciliation_link(data: &Value) -> Option<String> {
    data.get("reconciliation_id")
        .and_then(Value::as_str)
        .map(|id| format!("/finance/reconciliation/{}", id))
}

/// Map an AI analysis lifecycle event to a notification
///
/// Unknown tags are dropped.
fn map_ai_event(event: DomainEvent) -> Option<(NotificationPayload, Option<String>)> {
    let DomainEvent {
        event: tag,
        data,
        user_id,
        ..
    } = event;

    let payload = match tag.as_str() {
        event::AI_ANALYSIS_STARTED => NotificationPayload::new(
            "AI analysis started",
            format!("Analyzing {} flagged records", count(&data, "record_count")),
            Severity::Info,
        ),
        event::AI_ANALYSIS_COMPLETED => NotificationPayload::new(
            "AI analysis complete",
            format!(
                "Analyzed {} records, found {} issues",
                count(&data, "analysis_count"),
                count(&data, "issue_count"),
            ),
            Severity::Success,
        ),
        event::AI_ANALYSIS_FAILED => {
            let message = data
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("Analysis failed with an unknown error")
                .to_string();
            NotificationPayload::new("AI analysis failed", message, Severity::Error)
        }
        other => {
            warn!(event = %other, "Unknown AI analysis event");
            return None;
        }
    };

    let payload = match reconciliation_link(&data) {
        Some(link) => payload.with_link(link),
        None => payload,
    };
    Some((payload.with_data(data), user_id))
}

/// Map a reconciliation lifecycle event to a notification
fn map_reconciliation_event(event: DomainEvent) -> Option<(NotificationPayload, Option<String>)> {
    let DomainEvent {
        event: tag,
        data,
        user_id,
        ..
    } = event;

    let payload = match tag.as_str() {
        event::RECONCILIATION_STARTED => NotificationPayload::new(
            "Reconciliation started",
            format!("Processing {} records", count(&data, "record_count")),
            Severity::Info,
        ),
        event::RECONCILIATION_COMPLETED => NotificationPayload::new(
            "Reconciliation complete",
            format!(
                "{} matched, {} unmatched",
                count(&data, "matched_count"),
                count(&data, "unmatched_count"),
            ),
            Severity::Success,
        ),
        event::RECONCILIATION_UNMATCHED => NotificationPayload::new(
            "Unmatched records found",
            format!(
                "{} records need manual review",
                count(&data, "unmatched_count"),
            ),
            Severity::Warning,
        ),
        other => {
            debug!(event = %other, "Ignoring reconciliation event");
            return None;
        }
    };

    Some((payload.with_data(data), user_id))
}
