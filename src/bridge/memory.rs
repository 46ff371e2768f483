//! In-memory broker
//!
//! Loopback implementation of [`Broker`]: published payloads are delivered
//! to this instance's own subscriptions. Cross-process reach is the Redis
//! backend's job, but the subscription, pattern-matching, and delivery
//! semantics are the same, which makes this broker the default for
//! single-process deployments and tests.

use super::broker::{Broker, BrokerMessage};
use crate::errors::FabricResult;
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::{mpsc, Mutex, RwLock};
use wildmatch::WildMatch;

/// Loopback pub/sub broker
pub struct MemoryBroker {
    channels: RwLock<HashSet<String>>,
    patterns: RwLock<HashSet<String>>,
    sender: mpsc::UnboundedSender<BrokerMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<BrokerMessage>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            channels: RwLock::new(HashSet::new()),
            patterns: RwLock::new(HashSet::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &[u8]) -> FabricResult<usize> {
        let mut delivered = 0;

        if self.channels.read().await.contains(channel) {
            let message = BrokerMessage {
                channel: channel.to_string(),
                pattern: None,
                payload: payload.to_vec(),
            };
            if self.sender.send(message).is_ok() {
                delivered += 1;
            }
        }

        for pattern in self.patterns.read().await.iter() {
            if WildMatch::new(pattern).matches(channel) {
                let message = BrokerMessage {
                    channel: channel.to_string(),
                    pattern: Some(pattern.clone()),
                    payload: payload.to_vec(),
                };
                if self.sender.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }

        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> FabricResult<()> {
        self.channels.write().await.insert(channel.to_string());
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> FabricResult<()> {
        self.patterns.write().await.insert(pattern.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> FabricResult<()> {
        self.channels.write().await.remove(channel);
        Ok(())
    }

    async fn punsubscribe(&self, pattern: &str) -> FabricResult<()> {
        self.patterns.write().await.remove(pattern);
        Ok(())
    }

    async fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<BrokerMessage>> {
        self.receiver.lock().await.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_delivers_nothing() {
        let broker = MemoryBroker::new();
        let count = broker.publish("notification", b"{}").await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn exact_subscription_receives_message() {
        let broker = MemoryBroker::new();
        let mut incoming = broker.take_incoming().await.unwrap();
        broker.subscribe("notification").await.unwrap();

        let count = broker.publish("notification", b"payload").await.unwrap();
        assert_eq!(count, 1);

        let message = incoming.recv().await.unwrap();
        assert_eq!(message.channel, "notification");
        assert_eq!(message.pattern, None);
        assert_eq!(message.payload, b"payload");
    }

    #[tokio::test]
    async fn pattern_subscription_carries_matched_pattern() {
        let broker = MemoryBroker::new();
        let mut incoming = broker.take_incoming().await.unwrap();
        broker.psubscribe("user:*").await.unwrap();

        broker.publish("user:u1", b"payload").await.unwrap();
        let message = incoming.recv().await.unwrap();
        assert_eq!(message.channel, "user:u1");
        assert_eq!(message.pattern, Some("user:*".to_string()));

        // Non-matching channel is not delivered
        let count = broker.publish("role:admin", b"payload").await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        broker.subscribe("reconciliation").await.unwrap();
        broker.unsubscribe("reconciliation").await.unwrap();

        let count = broker.publish("reconciliation", b"{}").await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn incoming_stream_is_taken_once() {
        let broker = MemoryBroker::new();
        assert!(broker.take_incoming().await.is_some());
        assert!(broker.take_incoming().await.is_none());
    }
}
