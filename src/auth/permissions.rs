//! Permission cache and authorization decisions.
//!
//! [`PermissionCache`] is cache-aside over the user directory. Entries are
//! never invalidated when roles change; a change becomes visible once the
//! entry's TTL lapses (300 s by default).

use crate::auth::user_store::UserDirectory;
use crate::cache::KvCache;
use crate::error::{SessionError, SessionResult};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct PermissionCache {
    cache: Arc<dyn KvCache>,
    directory: Arc<dyn UserDirectory>,
    ttl: Duration,
}

impl PermissionCache {
    pub fn new(cache: Arc<dyn KvCache>, directory: Arc<dyn UserDirectory>, ttl: Duration) -> Self {
        Self {
            cache,
            directory,
            ttl,
        }
    }

    fn key(user_id: Uuid) -> String {
        format!("perm:{user_id}")
    }

    /// Permission names held by `user_id`. Cache trouble degrades to a
    /// directory recompute; it never grants anything by itself.
    pub async fn permissions_for(&self, user_id: Uuid) -> SessionResult<HashSet<String>> {
        let key = Self::key(user_id);

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(names) => {
                    debug!(user_id = %user_id, "Permission cache hit");
                    return Ok(names.into_iter().collect());
                }
                Err(e) => warn!(user_id = %user_id, "Discarding unreadable permission entry: {}", e),
            },
            Ok(None) => debug!(user_id = %user_id, "Permission cache miss"),
            Err(e) => warn!(user_id = %user_id, "Permission cache unavailable: {:#}", e),
        }

        let permissions = self.recompute(user_id).await?;

        let mut names: Vec<&String> = permissions.iter().collect();
        names.sort();
        match serde_json::to_string(&names) {
            Ok(raw) => {
                if let Err(e) = self.cache.set(&key, &raw, Some(self.ttl)).await {
                    warn!(user_id = %user_id, "Failed to populate permission cache: {:#}", e);
                }
            }
            Err(e) => warn!(user_id = %user_id, "Failed to encode permissions: {}", e),
        }

        Ok(permissions)
    }

    /// Permission names straight from the directory, bypassing the cache
    pub async fn recompute(&self, user_id: Uuid) -> SessionResult<HashSet<String>> {
        let user = self
            .directory
            .find_by_id(user_id)
            .await?
            .ok_or(SessionError::UserNotFound)?;
        Ok(user.permission_names())
    }
}

/// How far an allowed action reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only resources owned by the acting user
    Own,
    /// Any resource
    Any,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Own => "own",
            Scope::Any => "any",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a per-request permission check, carried into ownership checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Denied,
    Allowed(Scope),
}

impl Authorization {
    pub fn require(self) -> SessionResult<Scope> {
        match self {
            Authorization::Allowed(scope) => Ok(scope),
            Authorization::Denied => Err(SessionError::PermissionDenied),
        }
    }
}

/// `"{resource}:{action}:{scope}"`, falling back to the scope-less form
pub fn has_permission(
    permissions: &HashSet<String>,
    resource: &str,
    action: &str,
    scope: Scope,
) -> bool {
    permissions.contains(&format!("{resource}:{action}:{scope}"))
        || permissions.contains(&format!("{resource}:{action}"))
}

/// Resolve the effective scope for one request
pub fn authorize(
    permissions: &HashSet<String>,
    resource: &str,
    action: &str,
    allow_own: bool,
) -> Authorization {
    if has_permission(permissions, resource, action, Scope::Any) {
        return Authorization::Allowed(Scope::Any);
    }
    if allow_own && has_permission(permissions, resource, action, Scope::Own) {
        return Authorization::Allowed(Scope::Own);
    }
    Authorization::Denied
}

/// Reject `own`-scoped access to somebody else's resource
pub fn verify_ownership(scope: Scope, resource_owner_id: Uuid, acting_user_id: Uuid) -> SessionResult<()> {
    if scope == Scope::Own && acting_user_id != resource_owner_id {
        return Err(SessionError::PermissionDenied);
    }
    Ok(())
}
