//! Authentication Models
//! Users, roles, token claims and the request/response bodies of the auth API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// User account as returned by the user directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // bcrypt hash - never serialize
    pub roles: Vec<Role>,
    pub created_at: String,
}

impl User {
    /// Permission names granted through any role, deduplicated by permission id
    /// since several roles may grant the same permission.
    pub fn permission_names(&self) -> HashSet<String> {
        let by_id: BTreeMap<i64, &str> = self
            .roles
            .iter()
            .flat_map(|role| role.permissions.iter())
            .map(|p| (p.id, p.name.as_str()))
            .collect();
        by_id.into_values().map(str::to_string).collect()
    }

    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub name: String,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// JWT Claims payload, shared by access tokens and refresh secrets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // subject (user_id)
    pub iat: i64,
    pub exp: i64,
    pub jti: String, // unique per mint
    pub typ: TokenKind,
}

impl Claims {
    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}

/// Where a session was opened from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: String,
    pub user_agent: String,
}

/// Login form body
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Registration body
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Access token response for login and refresh
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: String,
}

impl AccessTokenResponse {
    pub fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer".to_string(),
        }
    }
}

/// User response (sanitized)
#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub created_at: String,
}

impl UserResponse {
    pub fn from_user(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            roles: user.role_names(),
            created_at: user.created_at.clone(),
        }
    }
}

/// Profile of the calling user with their effective permissions
#[derive(Debug, Serialize, Deserialize)]
pub struct ProfileResponse {
    #[serde(flatten)]
    pub user: UserResponse,
    pub permissions: Vec<String>,
}

/// One row of `GET /auth/sessions/`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
}
