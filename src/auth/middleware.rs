//! Authentication Middleware
//! Protects API endpoints with access-token validation

use crate::api::AppState;
use crate::auth::{jwt::TokenRejection, models::User, user_store::UserDirectory};
use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

/// The authenticated caller, inserted by [`auth_middleware`]
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

impl From<&User> for CurrentUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
        }
    }
}

/// Auth middleware that validates access tokens and resolves the caller
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = bearer_token(req.headers())
        .or_else(|| query_token(req.uri().query()))
        .ok_or(AuthError::MissingToken)?;

    let user = authenticate(&state, &token).await?;

    // Add the caller to request extensions so handlers can access it
    req.extensions_mut().insert(CurrentUser::from(&user));

    Ok(next.run(req).await)
}

/// Validate an access token and load the user it names
pub async fn authenticate(state: &AppState, token: &str) -> Result<User, AuthError> {
    let user_id = state.jwt.validate_access(token).map_err(|rejection| match rejection {
        TokenRejection::Expired => AuthError::ExpiredToken,
        TokenRejection::Invalid => AuthError::InvalidToken,
    })?;

    match state.users.find_by_id(user_id).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => {
            warn!(user_id = %user_id, "Access token for unknown user");
            Err(AuthError::InvalidToken)
        }
        Err(e) => {
            warn!("User lookup failed during authentication: {:#}", e);
            Err(AuthError::Unavailable)
        }
    }
}

/// `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// `?token=<token>`, for WebSocket clients that cannot set headers
pub fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(|t| t.to_string())
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingToken)
    }
}

/// Auth error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    ExpiredToken,
    Unavailable,
}

impl AuthError {
    pub fn message(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "Missing authorization token",
            AuthError::InvalidToken => "Invalid token",
            AuthError::ExpiredToken => "Token has expired",
            AuthError::Unavailable => "Authentication temporarily unavailable",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "detail": self.message() }));
        match self {
            AuthError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, body).into_response(),
            _ => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                body,
            )
                .into_response(),
        }
    }
}
