//! Authentication API Endpoints
//! Registration, login, refresh-token rotation and session management

use crate::api::AppState;
use crate::auth::{
    middleware::CurrentUser,
    models::{
        AccessTokenResponse, ClientInfo, LoginRequest, ProfileResponse, RegisterRequest,
        SessionInfo, UserResponse,
    },
    rate_limiter::FailureOutcome,
    rotation::Rotation,
    user_store::{verify_password, UserDirectory, DEFAULT_ROLE},
};
use crate::error::{SessionError, SessionResult};
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use std::net::SocketAddr;
use tracing::{info, warn};

pub const REFRESH_COOKIE: &str = "refresh_token";

/// Register endpoint - POST /api/v1/auth/register/
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> SessionResult<Json<UserResponse>> {
    validate_registration(&payload)?;

    if state.users.username_taken(&payload.username).await? {
        return Err(SessionError::UserAlreadyExists);
    }

    let user = state
        .users
        .create_user(
            &payload.username,
            &payload.email,
            &payload.password,
            &[DEFAULT_ROLE],
        )
        .await
        .map_err(registration_error)?;

    Ok(Json(UserResponse::from_user(&user)))
}

/// A concurrent registration can win between the availability check and the
/// insert; the store reports that as a typed conflict.
fn registration_error(e: anyhow::Error) -> SessionError {
    match e.downcast::<SessionError>() {
        Ok(typed) => typed,
        Err(other) => SessionError::Internal(other),
    }
}

/// Login endpoint - POST /api/v1/auth/login/
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Form(payload): Form<LoginRequest>,
) -> SessionResult<(CookieJar, Json<AccessTokenResponse>)> {
    let username = payload.username.trim().to_string();
    info!("🔐 Login attempt: {}", username);

    match state.limiter.is_blocked(&username).await {
        Ok(true) => {
            warn!("⛔ Login rejected, user is blocked: {}", username);
            return Err(SessionError::RateLimitBlocked);
        }
        Ok(false) => {}
        Err(e) => warn!("Rate limiter unavailable, continuing without it: {:#}", e),
    }

    let user = state
        .users
        .find_by_name(&username)
        .await?
        .ok_or(SessionError::UserNotFound)?;

    if !verify_password(&payload.password, &user.password_hash).await? {
        warn!("❌ Failed login attempt: {}", username);
        let remaining = match state.limiter.record_failure(&username).await {
            Ok(attempts) => match state.limiter.outcome(attempts) {
                FailureOutcome::Remaining(left) => Some(left),
                FailureOutcome::Blocked => return Err(SessionError::RateLimitBlocked),
            },
            Err(e) => {
                warn!("Failed to record login failure: {:#}", e);
                None
            }
        };
        return Err(SessionError::InvalidCredentials {
            remaining_attempts: remaining,
        });
    }

    if let Err(e) = state.limiter.reset(&username).await {
        warn!("Failed to reset login counter: {:#}", e);
    }

    let client = client_info(&headers, connect);
    let issued = state.tokens.issue(user.id, &client).await?;

    info!("✅ Login successful: {} ({})", user.username, client.ip_address);

    let jar = jar.add(refresh_cookie(&state, issued.refresh_token));
    Ok((jar, Json(AccessTokenResponse::bearer(issued.access_token))))
}

/// Refresh endpoint - POST /api/v1/auth/refresh/
pub async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let client = client_info(&headers, connect);

    match rotate_from_cookie(&state, &jar, &client).await {
        Ok(rotation) => {
            let jar = match rotation.refresh_token {
                Some(successor) => jar.add(refresh_cookie(&state, successor)),
                None => jar,
            };
            (
                jar,
                [
                    (header::CACHE_CONTROL, "no-store"),
                    (header::PRAGMA, "no-cache"),
                ],
                Json(AccessTokenResponse::bearer(rotation.access_token)),
            )
                .into_response()
        }
        Err(e) => {
            warn!("Refresh rejected ({}): {}", client.ip_address, e);
            (clear_refresh_cookie(jar), e).into_response()
        }
    }
}

async fn rotate_from_cookie(
    state: &AppState,
    jar: &CookieJar,
    client: &ClientInfo,
) -> SessionResult<Rotation> {
    let secret = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(SessionError::TokenMissing)?;
    let user_id = state.tokens.refresh_owner(&secret)?;
    state.tokens.rotate(&secret, user_id, client).await
}

/// Active sessions - GET /api/v1/auth/sessions/
pub async fn sessions(
    State(state): State<AppState>,
    user: CurrentUser,
) -> SessionResult<Json<Vec<SessionInfo>>> {
    Ok(Json(state.tokens.sessions(user.id).await?))
}

/// Logout - POST /api/v1/auth/logout/
pub async fn logout(
    State(state): State<AppState>,
    user: CurrentUser,
    jar: CookieJar,
) -> SessionResult<(CookieJar, StatusCode)> {
    if let Some(cookie) = jar.get(REFRESH_COOKIE) {
        state.tokens.logout(user.id, cookie.value()).await?;
    }
    Ok((clear_refresh_cookie(jar), StatusCode::NO_CONTENT))
}

/// Logout everywhere - POST /api/v1/auth/logout_all/
pub async fn logout_all(
    State(state): State<AppState>,
    user: CurrentUser,
    jar: CookieJar,
) -> SessionResult<(CookieJar, StatusCode)> {
    state.tokens.logout_all(user.id).await?;
    Ok((clear_refresh_cookie(jar), StatusCode::NO_CONTENT))
}

/// Current user - GET /api/v1/users/me/
pub async fn me(
    State(state): State<AppState>,
    user: CurrentUser,
) -> SessionResult<Json<ProfileResponse>> {
    let profile = state
        .users
        .find_by_id(user.id)
        .await?
        .ok_or(SessionError::UserNotFound)?;

    let mut permissions: Vec<String> = state
        .permissions
        .permissions_for(user.id)
        .await?
        .into_iter()
        .collect();
    permissions.sort();

    Ok(Json(ProfileResponse {
        user: UserResponse::from_user(&profile),
        permissions,
    }))
}

fn refresh_cookie(state: &AppState, value: String) -> Cookie<'static> {
    let max_age = state.tokens.config().refresh_ttl.num_seconds();
    Cookie::build((REFRESH_COOKIE, value))
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(time::Duration::seconds(max_age))
        .build()
}

fn clear_refresh_cookie(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(REFRESH_COOKIE).path("/"))
}

/// First `X-Forwarded-For` hop, else the peer address
pub fn client_info(headers: &HeaderMap, connect: Option<ConnectInfo<SocketAddr>>) -> ClientInfo {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let ip_address = forwarded
        .or_else(|| connect.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    ClientInfo {
        ip_address,
        user_agent,
    }
}

fn validate_registration(req: &RegisterRequest) -> SessionResult<()> {
    let name_len = req.username.chars().count();
    if !(3..=20).contains(&name_len) {
        return Err(SessionError::Validation(
            "Username must be between 3 and 20 characters".to_string(),
        ));
    }

    match req.email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
        _ => {
            return Err(SessionError::Validation(
                "Invalid email address".to_string(),
            ))
        }
    }

    let password = &req.password;
    if password.chars().count() < 8 {
        return Err(SessionError::Validation(
            "Password must be at least 8 characters".to_string(),
        ));
    }
    let strong = password.chars().any(|c| c.is_uppercase())
        && password.chars().any(|c| c.is_lowercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| !c.is_alphanumeric());
    if !strong {
        return Err(SessionError::Validation(
            "Password must contain upper and lower case letters, a digit and a symbol"
                .to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn request(username: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_registration_validation() {
        assert!(validate_registration(&request("alice", "a@b.io", "Passw0rd!")).is_ok());

        for bad in [
            request("al", "a@b.io", "Passw0rd!"),
            request("a".repeat(21).as_str(), "a@b.io", "Passw0rd!"),
            request("alice", "no-at-sign", "Passw0rd!"),
            request("alice", "@b.io", "Passw0rd!"),
            request("alice", "a@b.io", "Pw0!"),
            request("alice", "a@b.io", "password1!"),
            request("alice", "a@b.io", "Password!!"),
            request("alice", "a@b.io", "Passw0rd1"),
        ] {
            assert!(matches!(
                validate_registration(&bad),
                Err(SessionError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_registration_conflict_maps_to_bad_request() {
        let conflict = registration_error(anyhow::Error::new(SessionError::UserAlreadyExists));
        assert_eq!(conflict.status(), StatusCode::BAD_REQUEST);

        let other = registration_error(anyhow::anyhow!("disk full"));
        assert!(matches!(other, SessionError::Internal(_)));
    }

    #[test]
    fn test_client_info_prefers_forwarded_header() {
        let peer: SocketAddr = "10.0.0.9:4242".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(client_info(&headers, None).ip_address, "unknown");
        assert_eq!(
            client_info(&headers, Some(ConnectInfo(peer))).ip_address,
            "10.0.0.9"
        );

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8"));
        let info = client_info(&headers, Some(ConnectInfo(peer)));
        assert_eq!(info.ip_address, "203.0.113.7");
        assert_eq!(info.user_agent, "curl/8");
    }
}
