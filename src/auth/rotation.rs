//! Token Rotation Engine
//! Issues, rotates and revokes refresh tokens; mints short-lived access tokens
//!
//! Per-token lifecycle: `Active` -> `UsedGrace` -> `Retired`. A rotation
//! request is resolved against the stored row:
//!
//! - unknown `(secret, user)` pair: `TokenNotFound`
//! - used, outside the grace window: `TokenReplayed`
//! - used, inside the grace window: a new access token, no new refresh token
//! - unused but expired: `TokenExpired`
//! - unused: conditional mark-used + successor insert in one transaction
//!
//! Concurrent rotations of one row are linearized by the store's conditional
//! update; the loser re-reads the row and takes the grace path.

use crate::auth::{
    jwt::{JwtHandler, TokenRejection},
    models::{ClientInfo, SessionInfo, TokenKind},
    token_store::{hash_secret, RefreshTokenRecord, RotateOutcome, TokenState, TokenStore},
    user_store::UserDirectory,
};
use crate::clock::Clock;
use crate::config::TokenConfig;
use crate::error::{SessionError, SessionResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Access + refresh pair handed out on login
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Result of a successful rotation
#[derive(Debug, Clone)]
pub struct Rotation {
    pub access_token: String,
    /// `None` on a grace-window retry: the client keeps the cookie the first
    /// rotation already set.
    pub refresh_token: Option<String>,
}

pub struct TokenRotationEngine {
    store: Arc<dyn TokenStore>,
    directory: Arc<dyn UserDirectory>,
    jwt: Arc<JwtHandler>,
    clock: Arc<dyn Clock>,
    config: TokenConfig,
}

impl TokenRotationEngine {
    pub fn new(
        store: Arc<dyn TokenStore>,
        directory: Arc<dyn UserDirectory>,
        jwt: Arc<JwtHandler>,
        clock: Arc<dyn Clock>,
        config: TokenConfig,
    ) -> Self {
        Self {
            store,
            directory,
            jwt,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Open a new session for `user_id`
    pub async fn issue(&self, user_id: Uuid, client: &ClientInfo) -> SessionResult<IssuedTokens> {
        let now = self.clock.now();
        let (refresh_token, record) = self.new_refresh(user_id, client, now)?;
        self.store.insert(&record).await?;
        let access_token = self.mint_access(user_id, now)?;

        info!(user_id = %user_id, session = %record.id, "🔑 Session issued");

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            refresh_expires_at: record.expires_at,
        })
    }

    /// Resolve the owner of a presented refresh secret from its signed claims
    pub fn refresh_owner(&self, secret: &str) -> SessionResult<Uuid> {
        let claims = self
            .jwt
            .validate(secret, TokenKind::Refresh)
            .map_err(|rejection| match rejection {
                TokenRejection::Expired => SessionError::TokenExpired,
                TokenRejection::Invalid => SessionError::TokenNotFound,
            })?;
        claims.user_id().ok_or(SessionError::TokenNotFound)
    }

    /// Exchange a refresh secret for a new access token, rotating the secret
    /// when it is still `Active`
    pub async fn rotate(
        &self,
        old_secret: &str,
        user_id: Uuid,
        client: &ClientInfo,
    ) -> SessionResult<Rotation> {
        if self.directory.find_by_id(user_id).await?.is_none() {
            warn!(user_id = %user_id, "Refresh attempted for unknown user");
            return Err(SessionError::TokenNotFound);
        }

        let token_hash = hash_secret(old_secret);
        let Some(record) = self.store.find(&token_hash, user_id).await? else {
            warn!(user_id = %user_id, "Unknown refresh token presented");
            return Err(SessionError::TokenNotFound);
        };

        let now = self.clock.now();
        match record.state(now, self.config.grace_window) {
            TokenState::UsedGrace => return self.grace_retry(user_id, now),
            TokenState::Retired if record.is_used() => {
                return Err(self.on_replay(user_id).await);
            }
            TokenState::Retired => return Err(SessionError::TokenExpired),
            TokenState::Active => {}
        }

        let (refresh_token, successor) = self.new_refresh(user_id, client, now)?;
        match self.store.rotate(record.id, now, &successor).await? {
            RotateOutcome::Rotated => {
                debug!(user_id = %user_id, from = %record.id, to = %successor.id, "Refresh token rotated");
                Ok(Rotation {
                    access_token: self.mint_access(user_id, now)?,
                    refresh_token: Some(refresh_token),
                })
            }
            RotateOutcome::AlreadyUsed => {
                // Lost the race: whoever won set used_at, re-read it.
                let Some(current) = self.store.find(&token_hash, user_id).await? else {
                    return Err(SessionError::TokenNotFound);
                };
                match current.state(self.clock.now(), self.config.grace_window) {
                    TokenState::UsedGrace => self.grace_retry(user_id, now),
                    _ => Err(self.on_replay(user_id).await),
                }
            }
        }
    }

    /// Live sessions (active or inside their grace window), newest first
    pub async fn sessions(&self, user_id: Uuid) -> SessionResult<Vec<SessionInfo>> {
        let now = self.clock.now();
        let grace = self.config.grace_window;
        let sessions = self
            .store
            .list_for_user(user_id)
            .await?
            .into_iter()
            .filter(|r| r.state(now, grace) != TokenState::Retired)
            .map(|r| SessionInfo {
                id: r.id,
                ip_address: r.ip_address,
                user_agent: r.user_agent,
                created_at: r.issued_at,
                expires_at: r.expires_at,
                used: r.used_at.is_some(),
                used_at: r.used_at,
            })
            .collect();
        Ok(sessions)
    }

    /// End one session. Idempotent.
    pub async fn logout(&self, user_id: Uuid, secret: &str) -> SessionResult<bool> {
        let removed = self.store.delete(&hash_secret(secret), user_id).await?;
        if removed {
            info!(user_id = %user_id, "👋 Session logged out");
        }
        Ok(removed)
    }

    /// End every session of the user
    pub async fn logout_all(&self, user_id: Uuid) -> SessionResult<usize> {
        let removed = self.store.delete_all_for_user(user_id).await?;
        info!(user_id = %user_id, removed, "👋 All sessions logged out");
        Ok(removed)
    }

    /// Drop expired rows and used rows that can no longer be replayed
    pub async fn cleanup(&self) -> SessionResult<usize> {
        let now = self.clock.now();
        let removed = self
            .store
            .delete_stale(now, now - self.config.grace_window)
            .await?;
        Ok(removed)
    }

    fn grace_retry(&self, user_id: Uuid, now: DateTime<Utc>) -> SessionResult<Rotation> {
        debug!(user_id = %user_id, "Refresh retried inside grace window");
        Ok(Rotation {
            access_token: self.mint_access(user_id, now)?,
            refresh_token: None,
        })
    }

    async fn on_replay(&self, user_id: Uuid) -> SessionError {
        warn!(user_id = %user_id, "🚨 Used refresh token replayed outside grace window");
        if self.config.revoke_all_on_replay {
            match self.store.delete_all_for_user(user_id).await {
                Ok(removed) => warn!(user_id = %user_id, removed, "Revoked all sessions after replay"),
                Err(e) => return SessionError::Internal(e),
            }
        }
        SessionError::TokenReplayed
    }

    fn mint_access(&self, user_id: Uuid, now: DateTime<Utc>) -> SessionResult<String> {
        let minted = self
            .jwt
            .mint(TokenKind::Access, user_id, now, self.config.access_ttl)?;
        Ok(minted.token)
    }

    fn new_refresh(
        &self,
        user_id: Uuid,
        client: &ClientInfo,
        now: DateTime<Utc>,
    ) -> SessionResult<(String, RefreshTokenRecord)> {
        let minted = self
            .jwt
            .mint(TokenKind::Refresh, user_id, now, self.config.refresh_ttl)?;
        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            token_hash: hash_secret(&minted.token),
            user_id,
            issued_at: now,
            expires_at: now + self.config.refresh_ttl,
            used_at: None,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        };
        Ok((minted.token, record))
    }
}
