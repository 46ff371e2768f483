//! JWT token verification

use crate::errors::{FabricError, FabricResult};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried in an access token
///
/// `roles` and `departments` default to empty when the issuer omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub departments: Vec<String>,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at time (Unix timestamp)
    pub iat: u64,
}

/// Verified identity of a connecting client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub roles: Vec<String>,
    pub departments: Vec<String>,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            roles: claims.roles,
            departments: claims.departments,
        }
    }
}

/// Verifies a bearer token and extracts the caller's identity
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> FabricResult<Identity>;
}

/// HMAC-based JWT verifier
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for tokens signed with the given secret
    pub fn new(secret: &str) -> Self {
        Self::with_leeway(secret, 0)
    }

    /// Create a verifier tolerating the given clock skew on expiry checks
    pub fn with_leeway(secret: &str, leeway_secs: u64) -> Self {
        let mut validation = Validation::default();
        validation.leeway = leeway_secs;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> FabricResult<Identity> {
        if token.is_empty() {
            return Err(FabricError::authentication("Authentication required"));
        }

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn sign(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn valid_claims() -> Claims {
        Claims {
            sub: "u1".to_string(),
            roles: vec!["support".to_string()],
            departments: vec!["finance".to_string()],
            exp: now() + 3600,
            iat: now(),
        }
    }

    #[test]
    fn valid_token_yields_matching_identity() {
        let claims = valid_claims();
        let token = sign(&claims, SECRET);
        let identity = JwtVerifier::new(SECRET).verify(&token).unwrap();

        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.roles, vec!["support".to_string()]);
        assert_eq!(identity.departments, vec!["finance".to_string()]);
    }

    #[test]
    fn missing_roles_default_to_empty() {
        let token = sign(
            &Claims {
                roles: vec![],
                departments: vec![],
                ..valid_claims()
            },
            SECRET,
        );
        let identity = JwtVerifier::new(SECRET).verify(&token).unwrap();
        assert!(identity.roles.is_empty());
        assert!(identity.departments.is_empty());
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let token = sign(&valid_claims(), "other-secret");
        let result = JwtVerifier::new(SECRET).verify(&token);
        assert!(matches!(
            result,
            Err(FabricError::Authentication { .. })
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let claims = Claims {
            exp: now() - 120,
            iat: now() - 3600,
            ..valid_claims()
        };
        let token = sign(&claims, SECRET);
        let result = JwtVerifier::new(SECRET).verify(&token);
        assert!(result.is_err());
    }

    #[test]
    fn leeway_tolerates_small_skew() {
        let claims = Claims {
            exp: now() - 10,
            iat: now() - 3600,
            ..valid_claims()
        };
        let token = sign(&claims, SECRET);
        assert!(JwtVerifier::with_leeway(SECRET, 60).verify(&token).is_ok());
    }

    #[test]
    fn empty_token_is_rejected() {
        let result = JwtVerifier::new(SECRET).verify("");
        assert!(result.is_err());
    }
}
