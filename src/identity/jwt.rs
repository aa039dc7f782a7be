//! HS256 access tokens
//!
//! Tokens carry a `user_id` claim and `token_type = "access"`, the same
//! layout the upstream account service issues.

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::SharedUserStore;

use super::{token_fingerprint, IdentityGate, UserIdentity};

const ACCESS_TOKEN_TYPE: &str = "access";

/// Claims carried by an access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub user_id: i64,
    pub token_type: String,
    /// Expiry, seconds since the epoch
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
    #[serde(default)]
    pub jti: String,
}

// ─────────────────────────────────────────────────────────────────
// Verification
// ─────────────────────────────────────────────────────────────────

/// Identity gate backed by a shared HS256 secret and the user store
pub struct JwtIdentityGate {
    key: DecodingKey,
    validation: Validation,
    users: SharedUserStore,
}

impl JwtIdentityGate {
    pub fn new(secret: &str, leeway_secs: u64, users: SharedUserStore) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            users,
        }
    }

    fn verify(&self, token: &str) -> Result<AccessClaims> {
        let data = decode::<AccessClaims>(token, &self.key, &self.validation).map_err(|e| {
            let reason = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired",
                ErrorKind::InvalidSignature => "bad signature",
                ErrorKind::InvalidAlgorithm => "unexpected algorithm",
                _ => "malformed token",
            };
            Error::unauthenticated(reason)
        })?;

        if data.claims.token_type != ACCESS_TOKEN_TYPE {
            return Err(Error::unauthenticated(format!(
                "token type '{}' is not an access token",
                data.claims.token_type
            )));
        }

        Ok(data.claims)
    }
}

#[async_trait]
impl IdentityGate for JwtIdentityGate {
    async fn authenticate(&self, token: Option<&str>) -> Result<UserIdentity> {
        let token = match token.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(Error::unauthenticated("no token presented")),
        };

        let claims = self.verify(token).map_err(|e| {
            debug!(token = %token_fingerprint(token), error = %e, "Token rejected");
            e
        })?;

        match self.users.find_user(claims.user_id).await? {
            Some(user) => Ok(user),
            None => {
                debug!(user_id = claims.user_id, "Token refers to a user that no longer exists");
                Err(Error::unauthenticated("user no longer exists"))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Issuing
// ─────────────────────────────────────────────────────────────────

/// Mints access tokens for provisioned users
pub struct TokenIssuer {
    key: EncodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn issue(&self, user: &UserIdentity) -> Result<String> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let claims = AccessClaims {
            user_id: user.id,
            token_type: ACCESS_TOKEN_TYPE.to_string(),
            exp: now + self.ttl.as_secs(),
            iat: now,
            jti: uuid::Uuid::new_v4().simple().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {}", e)))
    }
}
