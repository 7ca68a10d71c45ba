//! Session-layer error taxonomy and its HTTP mapping.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid credentials")]
    InvalidCredentials { remaining_attempts: Option<u32> },
    #[error("User not found")]
    UserNotFound,
    #[error("A user with this name already exists")]
    UserAlreadyExists,
    #[error("{0}")]
    Validation(String),
    #[error("Too many failed login attempts, try again later")]
    RateLimitBlocked,
    #[error("Refresh token missing")]
    TokenMissing,
    #[error("Invalid refresh token")]
    TokenNotFound,
    #[error("Token has expired")]
    TokenExpired,
    #[error("Refresh token has already been used")]
    TokenReplayed,
    #[error("Insufficient permissions")]
    PermissionDenied,
    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

impl SessionError {
    pub fn status(&self) -> StatusCode {
        match self {
            SessionError::InvalidCredentials { .. }
            | SessionError::TokenMissing
            | SessionError::TokenNotFound
            | SessionError::TokenExpired
            | SessionError::TokenReplayed => StatusCode::UNAUTHORIZED,
            SessionError::RateLimitBlocked
            | SessionError::PermissionDenied
            | SessionError::ConnectionRejected(_) => StatusCode::FORBIDDEN,
            SessionError::UserNotFound => StatusCode::NOT_FOUND,
            SessionError::UserAlreadyExists => StatusCode::BAD_REQUEST,
            SessionError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            SessionError::InvalidCredentials {
                remaining_attempts: Some(remaining),
            } => json!({ "detail": self.to_string(), "remaining_attempts": remaining }),
            SessionError::Internal(e) => {
                error!("Internal error: {:#}", e);
                json!({ "detail": "Internal server error" })
            }
            _ => json!({ "detail": self.to_string() }),
        };

        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], Json(body)).into_response()
        } else {
            (status, Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            SessionError::InvalidCredentials {
                remaining_attempts: Some(3)
            }
            .status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(SessionError::TokenReplayed.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(SessionError::RateLimitBlocked.status(), StatusCode::FORBIDDEN);
        assert_eq!(SessionError::PermissionDenied.status(), StatusCode::FORBIDDEN);
        assert_eq!(SessionError::UserNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            SessionError::Internal(anyhow::anyhow!("db down")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_unauthorized_carries_challenge() {
        let response = SessionError::TokenNotFound.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );

        let forbidden = SessionError::PermissionDenied.into_response();
        assert!(forbidden.headers().get(header::WWW_AUTHENTICATE).is_none());
    }
}
