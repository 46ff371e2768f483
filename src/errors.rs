//! Error types for the notification fabric
//!
//! Each variant maps to one failure class from the gateway's point of view:
//! authentication and transport errors terminate a single connection,
//! authorization and protocol errors are reported to the client while the
//! connection stays open, and broker errors surface to the publishing caller.
//! None of them may take the process down.

use crate::protocol::ConnectionId;
use thiserror::Error;

/// Errors raised by the notification fabric
#[derive(Debug, Error)]
pub enum FabricError {
    /// Handshake rejected: missing, invalid, expired, or blacklisted token
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Channel subscription denied by the authorization rules
    #[error("Permission denied for channel: {channel}")]
    Authorization { channel: String },

    /// Malformed inbound client message
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Socket-level failure on a client connection
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Pub/sub broker failure (publish or subscribe)
    #[error("Broker error: {message}")]
    Broker { message: String },

    /// Operation referenced a connection that is not registered
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The connection's outbound queue has been closed
    #[error("Connection send queue closed")]
    SendQueueClosed,

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Wire payload could not be encoded or decoded
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl FabricError {
    /// Stable error code for logs and client-facing payloads
    pub fn error_code(&self) -> &'static str {
        match self {
            FabricError::Authentication { .. } => "AUTHENTICATION_FAILED",
            FabricError::Authorization { .. } => "PERMISSION_DENIED",
            FabricError::Protocol { .. } => "PROTOCOL_ERROR",
            FabricError::Transport { .. } => "TRANSPORT_ERROR",
            FabricError::Broker { .. } => "BROKER_ERROR",
            FabricError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            FabricError::SendQueueClosed => "SEND_QUEUE_CLOSED",
            FabricError::Configuration { .. } => "CONFIGURATION_ERROR",
            FabricError::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create an authorization error for a denied channel
    pub fn authorization(channel: impl Into<String>) -> Self {
        Self::Authorization {
            channel: channel.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a broker error
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for FabricError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Authentication {
            message: err.to_string(),
        }
    }
}

/// Result type for fabric operations
pub type FabricResult<T> = Result<T, FabricError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            FabricError::authentication("bad token").error_code(),
            "AUTHENTICATION_FAILED"
        );
        assert_eq!(
            FabricError::authorization("role:admin").error_code(),
            "PERMISSION_DENIED"
        );
        assert_eq!(FabricError::SendQueueClosed.error_code(), "SEND_QUEUE_CLOSED");
    }

    #[test]
    fn serde_errors_convert() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let fabric: FabricError = err.into();
        assert_eq!(fabric.error_code(), "SERIALIZATION_ERROR");
    }
}
