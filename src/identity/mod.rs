//! Identity gate
//!
//! Turns the bearer token presented at connection time into a
//! [`UserIdentity`], or rejects the connection with `Unauthenticated`.

mod jwt;

pub use jwt::{AccessClaims, JwtIdentityGate, TokenIssuer};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Authenticated user, immutable for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: i64,
    pub handle: String,
}

/// Verifies a bearer token and resolves the user it was issued for.
///
/// Implementations have no side effects. Every failure is reported as
/// `Error::Unauthenticated`; the reason is for server logs only.
#[async_trait]
pub trait IdentityGate: Send + Sync {
    async fn authenticate(&self, token: Option<&str>) -> Result<UserIdentity>;
}

pub type SharedIdentityGate = Arc<dyn IdentityGate>;

/// Short, non-reversible token fingerprint for log lines
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..6])
}
