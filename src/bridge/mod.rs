//! Pub/sub bridge
//!
//! Connects the gateway to an external event bus. Services publish domain
//! events onto named bus channels; the bridge dispatches incoming events to
//! registered listeners, which in turn push notifications out through the
//! gateway.

pub mod broker;
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use broker::{Broker, BrokerMessage};
pub use memory::MemoryBroker;
#[cfg(feature = "redis-backend")]
pub use redis::RedisBroker;

use crate::errors::{FabricError, FabricResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Well-known bus channels
pub mod bus {
    /// AI analysis lifecycle events
    pub const AI_ANALYSIS: &str = "ai:analysis";
    /// Reconciliation run lifecycle events
    pub const RECONCILIATION: &str = "reconciliation";
    /// Direct notification requests
    pub const NOTIFICATION: &str = "notification";
    /// Fan-out broadcast requests
    pub const BROADCAST: &str = "websocket:broadcast";
}

/// Envelope carried on every bus channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Event tag, e.g. `ai:analysis:completed`
    pub event: String,
    /// Event-specific payload
    #[serde(default)]
    pub data: Value,
    /// Publish time, milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: i64,
    /// Target user, when the event addresses one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl DomainEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: 0,
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

type Listener = Arc<dyn Fn(DomainEvent, &str) + Send + Sync>;

/// Dispatching layer over a [`Broker`]
///
/// Listeners register per channel (or per pattern). Incoming broker messages
/// are parsed into [`DomainEvent`]s and handed to every listener registered
/// under the matched key. Pattern deliveries dispatch under the pattern, not
/// the literal channel.
pub struct PubSubBridge {
    broker: Arc<dyn Broker>,
    subscriptions: RwLock<HashSet<String>>,
    patterns: RwLock<HashSet<String>>,
    listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
    dispatch: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PubSubBridge {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            subscriptions: RwLock::new(HashSet::new()),
            patterns: RwLock::new(HashSet::new()),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            dispatch: Mutex::new(None),
        }
    }

    /// Take the broker's incoming stream and start the dispatch loop
    ///
    /// Must be called exactly once, before any subscriptions are made.
    pub async fn initialize(&self) -> FabricResult<()> {
        let mut incoming = self
            .broker
            .take_incoming()
            .await
            .ok_or_else(|| FabricError::broker("Broker stream already taken"))?;

        let listeners = self.listeners.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                let event: DomainEvent = match serde_json::from_slice(&message.payload) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(channel = %message.channel, error = %err, "Dropping malformed bus message");
                        continue;
                    }
                };
                // Pattern deliveries dispatch under the subscribed pattern
                let key = message.pattern.as_deref().unwrap_or(&message.channel);
                let registered = listeners.read().await;
                if let Some(handlers) = registered.get(key) {
                    for handler in handlers {
                        handler(event.clone(), &message.channel);
                    }
                }
            }
            debug!("Bridge dispatch loop ended");
        });

        *self.dispatch.lock().await = Some(handle);
        info!("Pub/sub bridge initialized");
        Ok(())
    }

    /// Register a listener for a channel or pattern
    pub async fn on<F>(&self, key: &str, handler: F)
    where
        F: Fn(DomainEvent, &str) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Subscribe to a literal bus channel
    pub async fn subscribe(&self, channel: &str) -> FabricResult<()> {
        {
            let subscriptions = self.subscriptions.read().await;
            if subscriptions.contains(channel) {
                warn!(channel, "Already subscribed, skipping");
                return Ok(());
            }
        }
        self.broker.subscribe(channel).await?;
        self.subscriptions.write().await.insert(channel.to_string());
        info!(channel, "Subscribed to bus channel");
        Ok(())
    }

    /// Subscribe to a glob-style channel pattern
    pub async fn psubscribe(&self, pattern: &str) -> FabricResult<()> {
        {
            let patterns = self.patterns.read().await;
            if patterns.contains(pattern) {
                warn!(pattern, "Already subscribed, skipping");
                return Ok(());
            }
        }
        self.broker.psubscribe(pattern).await?;
        self.patterns.write().await.insert(pattern.to_string());
        info!(pattern, "Subscribed to bus pattern");
        Ok(())
    }

    /// Drop a literal channel subscription
    pub async fn unsubscribe(&self, channel: &str) -> FabricResult<()> {
        self.broker.unsubscribe(channel).await?;
        self.subscriptions.write().await.remove(channel);
        Ok(())
    }

    /// Publish a domain event; the publish timestamp is stamped here
    pub async fn publish(&self, channel: &str, mut event: DomainEvent) -> FabricResult<usize> {
        event.timestamp = chrono::Utc::now().timestamp_millis();
        let payload = serde_json::to_vec(&event)?;
        let delivered = self.broker.publish(channel, &payload).await?;
        debug!(channel, event = %event.event, delivered, "Published bus event");
        Ok(delivered)
    }

    /// Publish a fan-out broadcast request
    pub async fn broadcast(&self, event: DomainEvent) -> FabricResult<usize> {
        self.publish(bus::BROADCAST, event).await
    }

    /// Publish a notification addressed to one user
    pub async fn send_to_user(
        &self,
        user_id: &str,
        event: DomainEvent,
    ) -> FabricResult<usize> {
        self.publish(bus::NOTIFICATION, event.with_user(user_id))
            .await
    }

    /// Channels currently subscribed (literal channels only)
    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().await.iter().cloned().collect()
    }

    /// Unsubscribe everything and stop the dispatch loop
    pub async fn cleanup(&self) -> FabricResult<()> {
        let channels: Vec<String> = self.subscriptions.write().await.drain().collect();
        for channel in channels {
            self.broker.unsubscribe(&channel).await?;
        }
        let patterns: Vec<String> = self.patterns.write().await.drain().collect();
        for pattern in patterns {
            self.broker.punsubscribe(&pattern).await?;
        }
        if let Some(handle) = self.dispatch.lock().await.take() {
            handle.abort();
        }
        info!("Pub/sub bridge cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn test_bridge() -> PubSubBridge {
        let bridge = PubSubBridge::new(Arc::new(MemoryBroker::new()));
        bridge.initialize().await.unwrap();
        bridge
    }

    #[tokio::test]
    async fn publish_round_trip_preserves_event() {
        let bridge = test_bridge().await;
        bridge.subscribe(bus::NOTIFICATION).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge
            .on(bus::NOTIFICATION, move |event, channel| {
                tx.send((event, channel.to_string())).unwrap();
            })
            .await;

        let sent = DomainEvent::new("ticket:created", json!({"ticket_id": "t-9"}))
            .with_user("u1");
        bridge.publish(bus::NOTIFICATION, sent.clone()).await.unwrap();

        let (received, channel) = rx.recv().await.unwrap();
        assert_eq!(channel, bus::NOTIFICATION);
        assert_eq!(received.event, "ticket:created");
        assert_eq!(received.data, json!({"ticket_id": "t-9"}));
        assert_eq!(received.user_id.as_deref(), Some("u1"));
        assert!(received.timestamp > 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_returns_zero() {
        let bridge = test_bridge().await;
        let count = bridge
            .publish(bus::RECONCILIATION, DomainEvent::new("noop", json!({})))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_skipped() {
        let bridge = test_bridge().await;
        bridge.subscribe(bus::AI_ANALYSIS).await.unwrap();
        bridge.subscribe(bus::AI_ANALYSIS).await.unwrap();
        assert_eq!(bridge.subscriptions().await, vec![bus::AI_ANALYSIS.to_string()]);
    }

    #[tokio::test]
    async fn pattern_delivery_dispatches_under_pattern() {
        let bridge = test_bridge().await;
        bridge.psubscribe("user:*").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge
            .on("user:*", move |event, channel| {
                tx.send((event.event, channel.to_string())).unwrap();
            })
            .await;

        bridge
            .publish("user:u7", DomainEvent::new("direct", json!({})))
            .await
            .unwrap();

        let (event, channel) = rx.recv().await.unwrap();
        assert_eq!(event, "direct");
        assert_eq!(channel, "user:u7");
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let broker = Arc::new(MemoryBroker::new());
        let bridge = PubSubBridge::new(broker.clone());
        bridge.initialize().await.unwrap();
        bridge.subscribe(bus::NOTIFICATION).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge
            .on(bus::NOTIFICATION, move |event, _| {
                tx.send(event.event).unwrap();
            })
            .await;

        broker.publish(bus::NOTIFICATION, b"not json").await.unwrap();
        bridge
            .publish(bus::NOTIFICATION, DomainEvent::new("after", json!({})))
            .await
            .unwrap();

        // Only the well-formed event arrives
        assert_eq!(rx.recv().await.unwrap(), "after");
        assert!(tokio::time::timeout(Duration::from_millis(20), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn cleanup_unsubscribes_everything() {
        let bridge = test_bridge().await;
        bridge.subscribe(bus::NOTIFICATION).await.unwrap();
        bridge.psubscribe("user:*").await.unwrap();

        bridge.cleanup().await.unwrap();
        assert!(bridge.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn send_to_user_targets_notification_channel() {
        let bridge = test_bridge().await;
        bridge.subscribe(bus::NOTIFICATION).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bridge
            .on(bus::NOTIFICATION, move |event, _| {
                tx.send(event).unwrap();
            })
            .await;

        bridge
            .send_to_user("u3", DomainEvent::new("system:alert", json!({"m": 1})))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.user_id.as_deref(), Some("u3"));
    }
}
