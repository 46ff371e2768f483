//! Fabric configuration
//!
//! Heartbeat timing and the handshake window are tunables, not contracts:
//! the defaults match the production deployment (30s sweep, 60s client
//! timeout, 10s handshake), but any combination where the client timeout
//! exceeds the sweep period is valid.

use crate::errors::{FabricError, FabricResult};
use std::time::Duration;

/// Configuration for the gateway and heartbeat monitor
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Period between heartbeat sweeps
    pub heartbeat_interval: Duration,
    /// Age of the last heartbeat after which a connection is evicted
    pub client_timeout: Duration,
    /// Window within which the WebSocket upgrade and token check must finish
    pub handshake_timeout: Duration,
    /// JWT verification settings
    pub jwt: JwtConfig,
}

/// JWT verification settings
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// HMAC secret used to verify token signatures
    pub secret: String,
    /// Clock skew tolerance for expiry checks, in seconds
    pub leeway_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "change-me".to_string(),
            leeway_secs: 0,
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            jwt: JwtConfig::default(),
        }
    }
}

impl FabricConfig {
    pub fn builder() -> FabricConfigBuilder {
        FabricConfigBuilder::default()
    }
}

/// Builder for [`FabricConfig`]
#[derive(Debug, Default)]
pub struct FabricConfigBuilder {
    config: FabricConfig,
}

impl FabricConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.config.client_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn jwt_secret<S: Into<String>>(mut self, secret: S) -> Self {
        self.config.jwt.secret = secret.into();
        self
    }

    pub fn jwt_leeway_secs(mut self, leeway: u64) -> Self {
        self.config.jwt.leeway_secs = leeway;
        self
    }

    /// Validate and build the configuration
    ///
    /// The client timeout must be strictly greater than the sweep period,
    /// otherwise a well-behaved client heartbeating once per period could be
    /// evicted between two of its own heartbeats.
    pub fn build(self) -> FabricResult<FabricConfig> {
        if self.config.client_timeout <= self.config.heartbeat_interval {
            return Err(FabricError::configuration(format!(
                "client_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.config.client_timeout, self.config.heartbeat_interval
            )));
        }
        if self.config.handshake_timeout.is_zero() {
            return Err(FabricError::configuration(
                "handshake_timeout must be non-zero",
            ));
        }
        Ok(self.config)
    }
}
