//! Session tokens.
//!
//! A token is an HS256 JWT naming the connection it resumes. Presenting it in
//! a later handshake reattaches the caller to that connection, as long as the
//! connection still exists.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use remoterl_common::Role;
use serde::{Deserialize, Serialize};

use crate::session::Connection;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Failed to sign token: {0}")]
    SigningFailed(String),
}

/// Session token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Connection id.
    pub sub: String,
    /// Session id, for trainers.
    #[serde(default)]
    pub sid: Option<String>,
    /// Account id.
    pub acct: String,
    pub role: Role,
    pub iat: u64,
    pub exp: u64,
}

/// Issues and verifies session tokens.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    /// An empty secret gets a random one; tokens then die with the process,
    /// as do the connections they would resume.
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let secret = if secret.is_empty() {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes.to_vec()
        } else {
            secret.as_bytes().to_vec()
        };
        Self {
            encoding: EncodingKey::from_secret(&secret),
            decoding: DecodingKey::from_secret(&secret),
            ttl,
        }
    }

    pub fn issue(&self, conn: &Connection) -> Result<String, TokenError> {
        let now = Utc::now().timestamp().max(0) as u64;
        let claims = SessionClaims {
            sub: conn.id.clone(),
            sid: conn.session_id.clone(),
            acct: conn.account_id.clone(),
            role: conn.role,
            iat: now,
            exp: now + self.ttl.as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::SigningFailed(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<SessionClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| TokenError::InvalidToken(e.to_string()))
    }
}
