//! Bearer token extraction and the token → identity seam

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::quota::{QuotaError, QuotaLedger};
use crate::Identity;

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authorization header not found")]
    MissingHeader,

    #[error("Authorization header is empty")]
    EmptyHeader,

    #[error("Invalid Authorization header format")]
    InvalidFormat,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,
}

/// Pull the token out of an `Authorization: Bearer <token>` header value
pub fn extract_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::MissingHeader)?.trim();
    if value.is_empty() {
        return Err(AuthError::EmptyHeader);
    }

    match value.strip_prefix(BEARER_PREFIX) {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(AuthError::InvalidFormat),
    }
}

/// Resolves a bearer token to the identity that owns it
#[async_trait]
pub trait TokenAuthorizer: Send + Sync {
    async fn authorize(&self, token: &str) -> Result<Identity, AuthError>;
}

/// In-memory token table with optional per-identity request quotas
///
/// Identities without a configured quota are unlimited.
#[derive(Default)]
pub struct StaticTokenStore {
    tokens: DashMap<String, Identity>,
    quotas: DashMap<Identity, u64>,
}

impl StaticTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(self, token: impl Into<String>, identity: impl Into<String>) -> Self {
        self.insert(token, identity);
        self
    }

    pub fn with_quota(self, identity: impl Into<String>, remaining: u64) -> Self {
        self.set_quota(identity, remaining);
        self
    }

    pub fn insert(&self, token: impl Into<String>, identity: impl Into<String>) {
        self.tokens.insert(token.into(), Identity::new(identity));
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    pub fn set_quota(&self, identity: impl Into<String>, remaining: u64) {
        self.quotas.insert(Identity::new(identity), remaining);
    }

    pub fn remaining(&self, identity: &Identity) -> Option<u64> {
        self.quotas.get(identity).map(|q| *q)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenAuthorizer for StaticTokenStore {
    async fn authorize(&self, token: &str) -> Result<Identity, AuthError> {
        match self.tokens.get(token) {
            Some(identity) => {
                debug!("Token accepted for identity {}", identity.value());
                Ok(identity.clone())
            }
            None => Err(AuthError::InvalidToken("unknown token".to_string())),
        }
    }
}

#[async_trait]
impl QuotaLedger for StaticTokenStore {
    async fn check(&self, identity: &Identity) -> Result<u64, QuotaError> {
        match self.remaining(identity) {
            None => Ok(u64::MAX),
            Some(0) => Err(QuotaError::Exceeded(identity.clone())),
            Some(remaining) => Ok(remaining),
        }
    }

    async fn decrement(&self, identity: &Identity) -> Result<u64, QuotaError> {
        let Some(mut remaining) = self.quotas.get_mut(identity) else {
            return Ok(u64::MAX);
        };

        if *remaining == 0 {
            return Err(QuotaError::Exceeded(identity.clone()));
        }

        *remaining -= 1;
        Ok(*remaining)
    }
}
