//! Authorization and quota collaborators for the tunnel broker
//!
//! The broker only needs two things from the identity side of the system:
//! turning a bearer token into an [`Identity`] and charging that identity for a
//! forwarded request. Both are traits so deployments can plug in their own
//! account storage; this crate ships an in-memory store and a JWT authorizer.

pub mod jwt;
pub mod quota;
pub mod token;

pub use jwt::{JwtAuthorizer, JwtClaims, JwtError};
pub use quota::{QuotaError, QuotaLedger, UnlimitedQuota};
pub use token::{extract_bearer, AuthError, StaticTokenStore, TokenAuthorizer};

// Re-export useful types
pub use async_trait::async_trait;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Authenticated owner of sessions and tunnels
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
