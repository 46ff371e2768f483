//! Real-time notification fabric
//!
//! A WebSocket gateway with token-authenticated handshakes, channel-scoped
//! subscriptions, heartbeat liveness monitoring, and a pub/sub bridge that
//! lets other services and other gateway processes push notifications to
//! connected clients.
//!
//! The pieces compose bottom-up:
//!
//! - [`registry::ConnectionRegistry`] tracks live connections and their
//!   channel memberships
//! - [`gateway::Gateway`] owns the registry and implements the connection
//!   lifecycle, inbound dispatch, and broadcast operations
//! - [`heartbeat::HeartbeatMonitor`] evicts connections that stop
//!   heartbeating
//! - [`bridge::PubSubBridge`] carries domain events between processes over
//!   a [`bridge::Broker`] (in-memory, or Redis with the `redis-backend`
//!   feature)
//! - [`notifications::NotificationRouter`] maps bus events to user-facing
//!   notifications and delivers them through the gateway
//! - [`server::FabricServer`] is the standalone transport: TCP accept loop,
//!   WebSocket upgrade, and the per-connection frame pump

pub mod auth;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod heartbeat;
pub mod notifications;
pub mod protocol;
pub mod registry;
pub mod server;

pub use auth::{Claims, Identity, JwtVerifier, MemoryRevocationStore, RevocationStore, TokenVerifier};
pub use bridge::{Broker, BrokerMessage, DomainEvent, MemoryBroker, PubSubBridge};
pub use config::{FabricConfig, FabricConfigBuilder, JwtConfig};
pub use errors::{FabricError, FabricResult};
pub use gateway::Gateway;
pub use heartbeat::HeartbeatMonitor;
pub use notifications::NotificationRouter;
pub use protocol::{
    ClientEvent, ConnectionId, NotificationPayload, Severity, ServerEvent,
};
pub use registry::{Connection, ConnectionRegistry};
pub use server::FabricServer;

#[cfg(feature = "redis-backend")]
pub use auth::RedisRevocationStore;
#[cfg(feature = "redis-backend")]
pub use bridge::RedisBroker;
