//! Service configuration.
//!
//! Every knob is a CLI flag with an environment fallback; `.env` files are
//! loaded by `main` before parsing.

use clap::Parser;
use std::time::Duration;

pub const DEV_JWT_SECRET: &str = "dev-secret-change-in-production-minimum-32-characters";

/// Upper bounds on token lifetimes; larger settings are clamped.
pub const MAX_ACCESS_TOKEN_MINUTES: i64 = 24 * 60;
pub const MAX_REFRESH_TOKEN_DAYS: i64 = 365;
pub const MAX_REFRESH_GRACE_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Parser)]
#[command(name = "trustgate", about = "Session and trust layer for the task API")]
pub struct Config {
    /// Address the HTTP server binds to
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: String,

    /// SQLite database holding users, roles and refresh tokens
    #[arg(long, env = "AUTH_DB_PATH", default_value = "trustgate_auth.db")]
    pub auth_db_path: String,

    #[arg(long, env = "JWT_SECRET", default_value = DEV_JWT_SECRET, hide_env_values = true)]
    pub jwt_secret: String,

    #[arg(long, env = "ACCESS_TOKEN_EXPIRE_MINUTES", default_value_t = 15)]
    pub access_token_expire_minutes: i64,

    #[arg(long, env = "REFRESH_TOKEN_EXPIRE_DAYS", default_value_t = 7)]
    pub refresh_token_expire_days: i64,

    /// Seconds a rotated refresh token may be presented again as a retry
    #[arg(long, env = "REFRESH_GRACE_SECS", default_value_t = 30)]
    pub refresh_grace_secs: i64,

    /// Delete every session of a user when a refresh token replay is detected
    #[arg(long, env = "REVOKE_ALL_ON_REPLAY", default_value_t = false)]
    pub revoke_all_on_replay: bool,

    #[arg(long, env = "LOGIN_MAX_ATTEMPTS", default_value_t = 5)]
    pub login_max_attempts: u32,

    #[arg(long, env = "LOGIN_BLOCK_SECS", default_value_t = 600)]
    pub login_block_secs: u64,

    #[arg(long, env = "PERMISSION_CACHE_TTL_SECS", default_value_t = 300)]
    pub permission_cache_ttl_secs: u64,

    #[arg(long, env = "SESSION_CLEANUP_INTERVAL_SECS", default_value_t = 3600)]
    pub session_cleanup_interval_secs: u64,

    /// Milliseconds a socket write may take before the peer is dropped
    #[arg(long, env = "WS_SEND_TIMEOUT_MS", default_value_t = 5000)]
    pub ws_send_timeout_ms: u64,

    #[arg(long, env = "BCRYPT_COST", default_value_t = 10)]
    pub bcrypt_cost: u32,

    /// Creates an `admin` account on startup when no admin exists
    #[arg(long, env = "BOOTSTRAP_ADMIN_PASSWORD", hide_env_values = true)]
    pub bootstrap_admin_password: Option<String>,

    #[arg(long, env = "CORS_ALLOW_ORIGIN", default_value = "http://localhost:3000")]
    pub cors_allow_origin: String,
}

/// Lifetimes and replay policy for the token rotation engine.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_ttl: chrono::Duration,
    pub refresh_ttl: chrono::Duration,
    pub grace_window: chrono::Duration,
    pub revoke_all_on_replay: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl: chrono::Duration::minutes(15),
            refresh_ttl: chrono::Duration::days(7),
            grace_window: chrono::Duration::seconds(30),
            revoke_all_on_replay: false,
        }
    }
}

/// Login brute-force throttle.
#[derive(Debug, Clone)]
pub struct LoginThrottleConfig {
    pub max_attempts: u32,
    /// Lifetime of both the attempt counter window and the block flag.
    pub block_duration: Duration,
}

impl Default for LoginThrottleConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            block_duration: Duration::from_secs(600),
        }
    }
}

impl Config {
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            access_ttl: chrono::Duration::minutes(
                self.access_token_expire_minutes
                    .clamp(1, MAX_ACCESS_TOKEN_MINUTES),
            ),
            refresh_ttl: chrono::Duration::days(
                self.refresh_token_expire_days
                    .clamp(1, MAX_REFRESH_TOKEN_DAYS),
            ),
            grace_window: chrono::Duration::seconds(
                self.refresh_grace_secs.clamp(0, MAX_REFRESH_GRACE_SECS),
            ),
            revoke_all_on_replay: self.revoke_all_on_replay,
        }
    }

    pub fn login_throttle_config(&self) -> LoginThrottleConfig {
        LoginThrottleConfig {
            max_attempts: self.login_max_attempts.max(1),
            block_duration: Duration::from_secs(self.login_block_secs.max(1)),
        }
    }

    pub fn permission_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.permission_cache_ttl_secs)
    }

    pub fn ws_send_timeout(&self) -> Duration {
        Duration::from_millis(self.ws_send_timeout_ms.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.session_cleanup_interval_secs.max(1))
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_session_policy() {
        let config = Config::parse_from(["trustgate"]);
        assert!(config.uses_dev_secret());

        let tokens = config.token_config();
        assert_eq!(tokens.access_ttl, chrono::Duration::minutes(15));
        assert_eq!(tokens.refresh_ttl, chrono::Duration::days(7));
        assert_eq!(tokens.grace_window, chrono::Duration::seconds(30));
        assert!(!tokens.revoke_all_on_replay);

        let throttle = config.login_throttle_config();
        assert_eq!(throttle.max_attempts, 5);
        assert_eq!(throttle.block_duration, Duration::from_secs(600));
        assert_eq!(config.permission_cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.ws_send_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_out_of_range_lifetimes_are_clamped() {
        let huge = i64::MAX.to_string();
        let config = Config::parse_from([
            "trustgate",
            "--access-token-expire-minutes",
            huge.as_str(),
            "--refresh-token-expire-days",
            huge.as_str(),
            "--refresh-grace-secs",
            huge.as_str(),
        ]);
        let tokens = config.token_config();
        assert_eq!(
            tokens.access_ttl,
            chrono::Duration::minutes(MAX_ACCESS_TOKEN_MINUTES)
        );
        assert_eq!(
            tokens.refresh_ttl,
            chrono::Duration::days(MAX_REFRESH_TOKEN_DAYS)
        );
        assert_eq!(
            tokens.grace_window,
            chrono::Duration::seconds(MAX_REFRESH_GRACE_SECS)
        );

        let negative = Config::parse_from([
            "trustgate",
            "--refresh-token-expire-days=-3",
            "--refresh-grace-secs=-1",
        ]);
        assert_eq!(negative.token_config().refresh_ttl, chrono::Duration::days(1));
        assert_eq!(negative.token_config().grace_window, chrono::Duration::zero());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::parse_from([
            "trustgate",
            "--refresh-grace-secs",
            "10",
            "--login-max-attempts",
            "3",
            "--revoke-all-on-replay",
        ]);
        assert_eq!(
            config.token_config().grace_window,
            chrono::Duration::seconds(10)
        );
        assert!(config.token_config().revoke_all_on_replay);
        assert_eq!(config.login_throttle_config().max_attempts, 3);
    }
}
