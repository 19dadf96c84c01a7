//! JWT (JSON Web Token) authorization

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::{AuthError, TokenAuthorizer};
use crate::Identity;

/// JWT claims accepted by the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (identity that owns the tunnels)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    #[serde(default)]
    pub iss: String,
}

impl JwtClaims {
    pub fn new(identity: impl Into<String>, issuer: impl Into<String>, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: identity.into(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer.into(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,
}

/// Authorizer that accepts HS256 tokens signed with a shared secret
///
/// Validates the signature and expiry only; the `sub` claim becomes the identity.
pub struct JwtAuthorizer {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthorizer {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let token_data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Encode a token using HMAC-SHA256
    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

#[async_trait]
impl TokenAuthorizer for JwtAuthorizer {
    async fn authorize(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.validate(token).map_err(|e| match e {
            JwtError::TokenExpired => AuthError::TokenExpired,
            JwtError::EncodingError(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            },
        })?;

        if claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("missing subject".to_string()));
        }

        Ok(Identity::new(claims.sub))
    }
}
