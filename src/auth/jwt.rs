//! JWT Token Handler
//! Mints and validates access tokens and refresh secrets

use crate::auth::models::{Claims, TokenKind};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation,
};
use tracing::debug;
use uuid::Uuid;

/// Why a presented token was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Expired,
    Invalid,
}

/// JWT Handler for token operations
pub struct JwtHandler {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

/// A freshly signed token
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub claims: Claims,
}

impl JwtHandler {
    /// Create a new JWT handler with secret key
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Sign a token of `kind` for `user_id`, valid from `issued_at` for `ttl`.
    /// Every mint carries a fresh `jti`, so two tokens issued in the same
    /// second never share a signature.
    pub fn mint(
        &self,
        kind: TokenKind,
        user_id: Uuid,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<MintedToken> {
        let expires_at = issued_at
            .checked_add_signed(ttl)
            .context("Invalid timestamp")?;

        let claims = Claims {
            sub: user_id.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            typ: kind,
        };

        debug!(user_id = %user_id, kind = ?kind, "Minting JWT");

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .context("Failed to generate JWT")?;

        Ok(MintedToken { token, claims })
    }

    /// Validate a token's signature, expiry and kind and extract its claims
    pub fn validate(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenRejection> {
        let mut validation = Validation::default();
        validation.leeway = 0;

        let decoded = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenRejection::Expired,
                _ => TokenRejection::Invalid,
            }
        })?;

        if decoded.claims.typ != kind {
            return Err(TokenRejection::Invalid);
        }

        Ok(decoded.claims)
    }

    /// Validate an access token and return the user it was issued to
    pub fn validate_access(&self, token: &str) -> Result<Uuid, TokenRejection> {
        let claims = self.validate(token, TokenKind::Access)?;
        claims.user_id().ok_or(TokenRejection::Invalid)
    }

    /// Sanity-check a secret at startup
    pub fn self_test(&self) -> Result<()> {
        let minted = self.mint(TokenKind::Access, Uuid::nil(), Utc::now(), Duration::minutes(1))?;
        if self.validate(&minted.token, TokenKind::Access).is_err() {
            bail!("JWT self-test failed");
        }
        Ok(())
    }
}
