//! Router and shared application state

use crate::auth::{
    api as auth_api, auth_middleware, JwtHandler, LoginRateLimiter, PermissionCache,
    SqliteTokenStore, TokenRotationEngine, TokenStore, UserStore,
};
use crate::cache::MemoryCache;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::middleware::request_logging;
use crate::ws::{api as ws_api, ConnectionBroadcaster};
use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<UserStore>,
    pub jwt: Arc<JwtHandler>,
    pub tokens: Arc<TokenRotationEngine>,
    pub limiter: Arc<LoginRateLimiter>,
    pub permissions: Arc<PermissionCache>,
    pub broadcaster: Arc<ConnectionBroadcaster>,
    pub cache: Arc<MemoryCache>,
}

impl AppState {
    /// Open the SQLite stores named by `config` and wire every component
    pub fn open(config: &Config) -> Result<Self> {
        let users = Arc::new(
            UserStore::new(&config.auth_db_path, config.bcrypt_cost)
                .context("Failed to open user store")?,
        );
        let store = Arc::new(
            SqliteTokenStore::new(&config.auth_db_path).context("Failed to open token store")?,
        );
        Ok(Self::assemble(
            users,
            store,
            Arc::new(MemoryCache::new()),
            Arc::new(SystemClock),
            config,
        ))
    }

    pub fn assemble(
        users: Arc<UserStore>,
        store: Arc<dyn TokenStore>,
        cache: Arc<MemoryCache>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let jwt = Arc::new(JwtHandler::new(&config.jwt_secret));
        let tokens = Arc::new(TokenRotationEngine::new(
            store,
            users.clone(),
            jwt.clone(),
            clock,
            config.token_config(),
        ));
        let limiter = Arc::new(LoginRateLimiter::new(
            cache.clone(),
            config.login_throttle_config(),
        ));
        let permissions = Arc::new(PermissionCache::new(
            cache.clone(),
            users.clone(),
            config.permission_cache_ttl(),
        ));

        Self {
            users,
            jwt,
            tokens,
            limiter,
            permissions,
            broadcaster: Arc::new(ConnectionBroadcaster::with_send_timeout(
                config.ws_send_timeout(),
            )),
            cache,
        }
    }
}

/// Create the API router
pub fn build_router(state: AppState, cors_origin: &str) -> Router {
    let public_routes = Router::new()
        .route("/auth/register/", post(auth_api::register))
        .route("/auth/login/", post(auth_api::login))
        .route("/auth/refresh/", post(auth_api::refresh))
        // Authenticates inside the handler so failures close with 1008.
        .route("/ws/tasks", get(ws_api::ws_tasks_handler));

    let protected_routes = Router::new()
        .route("/auth/sessions/", get(auth_api::sessions))
        .route("/auth/logout/", post(auth_api::logout))
        .route("/auth/logout_all/", post(auth_api::logout_all))
        .route("/users/me/", get(auth_api::me))
        .route("/notifications/:owner_id", post(ws_api::publish_notification))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", public_routes.merge(protected_routes))
        .layer(cors_layer(cors_origin))
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    match HeaderValue::from_str(origin) {
        Ok(value) => layer.allow_origin(value),
        Err(_) => {
            warn!("⚠️  Ignoring invalid CORS origin: {}", origin);
            layer
        }
    }
}

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
