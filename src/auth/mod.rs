//! Handshake authentication: token verification and revocation lookup
//!
//! The gateway consults both before a connection is registered. Verification
//! checks the token's signature and expiry and extracts the caller's
//! identity; the revocation store answers whether the raw token has been
//! blacklisted since issuance.

pub mod revocation;
pub mod token;

pub use revocation::{MemoryRevocationStore, RevocationStore};
pub use token::{Claims, Identity, JwtVerifier, TokenVerifier};

#[cfg(feature = "redis-backend")]
pub use revocation::RedisRevocationStore;
