//! Bearer credential verification and issuance.
//!
//! Credentials are HS256 JWTs carrying `user_id`, `username` and `exp`.
//! Verification is stateless and safe to call from any connection task.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub type UserId = i64;

/// Authenticated principal bound to a connection for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

/// Claims carried in the credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub username: String,
    /// Expiration (Unix timestamp).
    pub exp: i64,
    /// Issued at (Unix timestamp).
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Why a credential was refused. Callers treat every variant the same way;
/// the distinction exists for logs.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no credential supplied")]
    Missing,

    #[error("handshake timed out")]
    Timeout,

    #[error("credential expired")]
    Expired,

    #[error("bad signature")]
    BadSignature,

    #[error("malformed credential: {0}")]
    Malformed(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            _ => AuthError::Malformed(e.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // No grace period: an expired credential is rejected at once.
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Validate signature and expiry, then extract the identity.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(Identity {
            user_id: data.claims.user_id,
            username: data.claims.username,
        })
    }
}

/// Signs credentials with the verifier's secret. Used by the login
/// collaborator and by tests.
#[derive(Clone)]
pub struct TokenIssuer {
    key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
        }
    }

    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        self.issue_with_expiry(identity, now + ttl.as_secs() as i64)
    }

    /// Sign with an explicit `exp`. A past value yields an already-expired token.
    pub fn issue_with_expiry(&self, identity: &Identity, exp: i64) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: identity.user_id,
            username: identity.username.clone(),
            exp,
            iat: Some(Utc::now().timestamp()),
        };
        encode(&Header::default(), &claims, &self.key).map_err(AuthError::from)
    }
}
