//! Per-identity request accounting

use async_trait::async_trait;
use thiserror::Error;

use crate::Identity;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error("Quota exceeded for {0}")]
    Exceeded(Identity),

    #[error("Quota backend error: {0}")]
    Backend(String),
}

/// Charges an identity for forwarded requests and reports what is left
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Remaining requests without charging; [`QuotaError::Exceeded`] once exhausted
    async fn check(&self, identity: &Identity) -> Result<u64, QuotaError>;

    async fn decrement(&self, identity: &Identity) -> Result<u64, QuotaError>;
}

/// Ledger that never runs out
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaLedger for UnlimitedQuota {
    async fn check(&self, _identity: &Identity) -> Result<u64, QuotaError> {
        Ok(u64::MAX)
    }

    async fn decrement(&self, _identity: &Identity) -> Result<u64, QuotaError> {
        Ok(u64::MAX)
    }
}
