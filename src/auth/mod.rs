//! Authentication Module
//! Sessions, refresh-token rotation, login throttling and permission checks

pub mod api;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod permissions;
pub mod rate_limiter;
pub mod rotation;
pub mod token_store;
pub mod user_store;

pub use jwt::JwtHandler;
pub use middleware::{auth_middleware, CurrentUser};
pub use permissions::{authorize, has_permission, verify_ownership, Authorization, PermissionCache, Scope};
pub use rate_limiter::LoginRateLimiter;
pub use rotation::TokenRotationEngine;
pub use token_store::{SqliteTokenStore, TokenStore};
pub use user_store::{UserDirectory, UserStore};
