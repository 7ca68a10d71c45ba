//! Login brute-force throttle.
//!
//! Keyed by the claimed username (pre-authentication), so one client can burn
//! another user's budget; that trade-off is accepted. State lives only in the
//! shared [`KvCache`]: an attempt counter whose TTL is the block window, and a
//! block flag. Losing the cache resets every counter (fails open).

use crate::cache::KvCache;
use crate::config::LoginThrottleConfig;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// What a caller may be told after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Attempts left before the block trips (1..=max_attempts-1)
    Remaining(u32),
    Blocked,
}

pub struct LoginRateLimiter {
    cache: Arc<dyn KvCache>,
    config: LoginThrottleConfig,
}

impl LoginRateLimiter {
    pub fn new(cache: Arc<dyn KvCache>, config: LoginThrottleConfig) -> Self {
        Self { cache, config }
    }

    fn fail_key(username: &str) -> String {
        format!("failed_login:{username}")
    }

    fn block_key(username: &str) -> String {
        format!("blocked_user:{username}")
    }

    pub async fn is_blocked(&self, username: &str) -> Result<bool> {
        self.cache.exists(&Self::block_key(username)).await
    }

    /// Count a failed attempt and return the attempts so far in this window.
    /// Reaching `max_attempts` sets the block flag and clears the counter.
    pub async fn record_failure(&self, username: &str) -> Result<u32> {
        let key = Self::fail_key(username);
        let attempts = self.cache.incr(&key).await?;
        if attempts == 1 {
            self.cache.expire(&key, self.config.block_duration).await?;
        }

        if attempts >= i64::from(self.config.max_attempts) {
            // Two concurrent failures may both land here; setting the flag twice is harmless.
            self.cache
                .set(&Self::block_key(username), "1", Some(self.config.block_duration))
                .await?;
            self.cache.delete(&key).await?;
            warn!(
                username,
                block_secs = self.config.block_duration.as_secs(),
                "⛔ Login blocked after repeated failures"
            );
        }

        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    /// Clear the counter after a successful login
    pub async fn reset(&self, username: &str) -> Result<()> {
        if self.cache.delete(&Self::fail_key(username)).await? {
            info!(username, "Login attempt counter reset");
        }
        Ok(())
    }

    /// Translate an attempt count into what the caller is told. The attempt
    /// that trips the threshold reports `Blocked`, never "0 remaining".
    pub fn outcome(&self, attempts: u32) -> FailureOutcome {
        if attempts >= self.config.max_attempts {
            FailureOutcome::Blocked
        } else {
            FailureOutcome::Remaining(self.config.max_attempts - attempts)
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}
