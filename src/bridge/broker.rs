//! Broker abstraction for the pub/sub bridge
//!
//! The bridge speaks to a publish/subscribe primitive through this trait so
//! the same dispatch logic runs over the in-memory broker in tests and
//! single-process deployments, and over Redis in production.

use crate::errors::FabricResult;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A raw message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    /// Literal channel the message was published to
    pub channel: String,
    /// The matched pattern, for pattern subscriptions
    pub pattern: Option<String>,
    /// Serialized envelope bytes
    pub payload: Vec<u8>,
}

/// Publish/subscribe primitive
///
/// Publishing and subscribing are distinct roles: some brokers (Redis among
/// them) dedicate a connection to the subscriber role, so implementations
/// must not assume one connection serves both.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload; returns the number of subscribers that received it
    async fn publish(&self, channel: &str, payload: &[u8]) -> FabricResult<usize>;

    /// Register interest in a literal channel
    async fn subscribe(&self, channel: &str) -> FabricResult<()>;

    /// Register interest in a glob-style channel pattern
    async fn psubscribe(&self, pattern: &str) -> FabricResult<()>;

    /// Drop interest in a literal channel
    async fn unsubscribe(&self, channel: &str) -> FabricResult<()>;

    /// Drop interest in a pattern
    async fn punsubscribe(&self, pattern: &str) -> FabricResult<()>;

    /// Take the receiving end of the broker's message stream
    ///
    /// Yields `Some` exactly once; the bridge's dispatch loop is the single
    /// consumer.
    async fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<BrokerMessage>>;
}
