//! Token revocation lookup
//!
//! Revoked tokens are keyed by the raw token string under `blacklist:<token>`
//! so that logout can invalidate a token before it expires.

use crate::errors::FabricResult;
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::RwLock;

/// Key under which a revoked token is stored
pub fn blacklist_key(token: &str) -> String {
    format!("blacklist:{}", token)
}

/// Answers whether a raw token has been revoked
#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn is_blacklisted(&self, token: &str) -> FabricResult<bool>;
}

/// In-memory revocation store
///
/// Suitable for single-process deployments and tests; multi-process
/// deployments share revocations through [`RedisRevocationStore`].
#[derive(Debug, Default)]
pub struct MemoryRevocationStore {
    revoked: RwLock<HashSet<String>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a token as revoked
    pub async fn revoke<S: Into<String>>(&self, token: S) {
        let mut revoked = self.revoked.write().await;
        revoked.insert(token.into());
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn is_blacklisted(&self, token: &str) -> FabricResult<bool> {
        let revoked = self.revoked.read().await;
        Ok(revoked.contains(token))
    }
}

#[cfg(feature = "redis-backend")]
pub use self::redis_store::RedisRevocationStore;

#[cfg(feature = "redis-backend")]
mod redis_store {
    use super::{blacklist_key, RevocationStore};
    use crate::errors::{FabricError, FabricResult};
    use async_trait::async_trait;
    use redis::AsyncCommands;
    use tokio::sync::Mutex;
    use tracing::debug;

    /// Redis-backed revocation store
    ///
    /// Reads the `blacklist:<token>` keys written by the auth service at
    /// logout; entries expire with the token's own TTL.
    pub struct RedisRevocationStore {
        connection: Mutex<redis::aio::Connection>,
    }

    impl RedisRevocationStore {
        /// Connect to the Redis instance holding the blacklist
        pub async fn connect(url: &str) -> FabricResult<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| FabricError::broker(format!("Failed to create Redis client: {}", e)))?;
            let connection = client
                .get_async_connection()
                .await
                .map_err(|e| FabricError::broker(format!("Failed to connect to Redis: {}", e)))?;

            debug!("Revocation store connected to Redis");
            Ok(Self {
                connection: Mutex::new(connection),
            })
        }
    }

    #[async_trait]
    impl RevocationStore for RedisRevocationStore {
        async fn is_blacklisted(&self, token: &str) -> FabricResult<bool> {
            let mut conn = self.connection.lock().await;
            let exists: bool = conn
                .exists(blacklist_key(token))
                .await
                .map_err(|e| FabricError::broker(format!("Blacklist lookup failed: {}", e)))?;
            Ok(exists)
        }
    }
}
