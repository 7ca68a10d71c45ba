//! User Storage
//! Users, roles and permissions in SQLite, exposed through [`UserDirectory`]

use crate::auth::models::{Permission, Role, User};
use crate::error::SessionError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bcrypt::{hash, verify};
use chrono::Utc;
use rusqlite::{params, types::Type, Connection, ErrorCode, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Lookup side of the user directory, as consumed by the session layer
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;
    async fn find_by_name(&self, username: &str) -> Result<Option<User>>;
}

/// Role to permission grants seeded on every start
const ROLE_GRANTS: &[(&str, &[&str])] = &[
    (
        "admin",
        &["task:create", "task:read:any", "task:update:any", "task:delete:any"],
    ),
    ("moderator", &["task:read:any", "task:delete:any"]),
    (
        "user",
        &["task:create", "task:read:own", "task:update:own", "task:delete:own"],
    ),
];

const PERMISSIONS: &[&str] = &[
    "task:create",
    "task:read:own",
    "task:update:own",
    "task:delete:own",
    "task:read:any",
    "task:update:any",
    "task:delete:any",
];

pub const DEFAULT_ROLE: &str = "user";

/// User storage with SQLite backend
#[derive(Clone)]
pub struct UserStore {
    conn: Arc<Mutex<Connection>>,
    bcrypt_cost: u32,
}

impl UserStore {
    /// Open (or create) the user database at `db_path`
    pub fn new(db_path: &str, bcrypt_cost: u32) -> Result<Self> {
        let conn = Connection::open(db_path).context("open auth db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        Self::from_connection(conn, bcrypt_cost)
    }

    pub fn in_memory(bcrypt_cost: u32) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, bcrypt_cost)
    }

    fn from_connection(conn: Connection, bcrypt_cost: u32) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            bcrypt_cost,
        })
    }

    /// Initialize database schema and seed roles/permissions
    fn init_db(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                email TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS roles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL
            );
            CREATE TABLE IF NOT EXISTS permissions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_roles (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                PRIMARY KEY (user_id, role_id)
            );
            CREATE TABLE IF NOT EXISTS role_permissions (
                role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                permission_id INTEGER NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
                PRIMARY KEY (role_id, permission_id)
            );",
        )
        .context("Failed to create user schema")?;

        for name in PERMISSIONS {
            conn.execute(
                "INSERT OR IGNORE INTO permissions (name) VALUES (?1)",
                params![name],
            )?;
        }

        for (role, grants) in ROLE_GRANTS {
            conn.execute("INSERT OR IGNORE INTO roles (name) VALUES (?1)", params![role])?;
            for permission in *grants {
                conn.execute(
                    "INSERT OR IGNORE INTO role_permissions (role_id, permission_id)
                     SELECT roles.id, permissions.id FROM roles, permissions
                     WHERE roles.name = ?1 AND permissions.name = ?2",
                    params![role, permission],
                )?;
            }
        }

        Ok(())
    }

    /// Create an `admin` account if no user holds the admin role yet
    pub async fn bootstrap_admin(&self, password: &str) -> Result<Option<User>> {
        let admins: i64 = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT COUNT(*) FROM user_roles ur JOIN roles r ON r.id = ur.role_id
                 WHERE r.name = 'admin'",
                [],
                |row| row.get(0),
            )
            .context("Failed to check for admin users")?
        };

        if admins > 0 {
            return Ok(None);
        }

        let admin = self
            .create_user("admin", "admin@localhost", password, &["admin"])
            .await?;
        info!("🔐 Bootstrap admin user created (username: admin)");
        warn!("⚠️  Unset BOOTSTRAP_ADMIN_PASSWORD once a real admin exists");
        Ok(Some(admin))
    }

    /// Create a new user holding `roles`
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        roles: &[&str],
    ) -> Result<User> {
        let cost = self.bcrypt_cost;
        let plain = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash(plain, cost))
            .await
            .context("Password hashing task failed")?
            .context("Failed to hash password")?;

        let id = Uuid::new_v4();
        let created_at = Utc::now().to_rfc3339();

        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO users (id, username, email, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), username, email, password_hash, created_at],
            )
            .map_err(|e| match e {
                // `username` is the only unique column a fresh row can collide on.
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    anyhow::Error::new(SessionError::UserAlreadyExists)
                }
                other => anyhow::Error::new(other).context("Failed to insert user"),
            })?;
            for role in roles {
                let inserted = tx.execute(
                    "INSERT INTO user_roles (user_id, role_id)
                     SELECT ?1, id FROM roles WHERE name = ?2",
                    params![id.to_string(), role],
                )?;
                if inserted == 0 {
                    anyhow::bail!("Unknown role: {role}");
                }
            }
            tx.commit()?;
        }

        info!("✅ Created user: {} ({})", username, roles.join(","));

        self.find_by_id(id)
            .await?
            .context("User vanished after insert")
    }

    /// Grant an additional role to an existing user
    pub async fn assign_role(&self, user_id: Uuid, role: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO user_roles (user_id, role_id)
             SELECT ?1, id FROM roles WHERE name = ?2",
            params![user_id.to_string(), role],
        )?;
        if inserted == 0 {
            warn!(user_id = %user_id, role, "Role not assigned (unknown role or already held)");
        }
        Ok(())
    }

    pub async fn username_taken(&self, username: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn load_user(conn: &Connection, column: &str, value: &str) -> Result<Option<User>> {
        let sql = format!(
            "SELECT id, username, email, password_hash, created_at FROM users WHERE {column} = ?1"
        );
        let user = conn
            .query_row(&sql, params![value], |row| {
                Ok(User {
                    id: parse_uuid(row, 0)?,
                    username: row.get(1)?,
                    email: row.get(2)?,
                    password_hash: row.get(3)?,
                    roles: Vec::new(),
                    created_at: row.get(4)?,
                })
            })
            .optional()?;

        let Some(mut user) = user else {
            return Ok(None);
        };
        user.roles = Self::load_roles(conn, user.id)?;
        Ok(Some(user))
    }

    fn load_roles(conn: &Connection, user_id: Uuid) -> Result<Vec<Role>> {
        let mut stmt = conn.prepare_cached(
            "SELECT r.id, r.name, p.id, p.name
             FROM user_roles ur
             JOIN roles r ON r.id = ur.role_id
             LEFT JOIN role_permissions rp ON rp.role_id = r.id
             LEFT JOIN permissions p ON p.id = rp.permission_id
             WHERE ur.user_id = ?1
             ORDER BY r.id, p.id",
        )?;

        let rows = stmt
            .query_map(params![user_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut roles: Vec<Role> = Vec::new();
        for (role_id, role_name, permission_id, permission_name) in rows {
            if roles.last().map(|r| r.id) != Some(role_id) {
                roles.push(Role {
                    id: role_id,
                    name: role_name,
                    permissions: Vec::new(),
                });
            }
            if let (Some(id), Some(name), Some(role)) = (permission_id, permission_name, roles.last_mut()) {
                role.permissions.push(Permission { id, name });
            }
        }
        Ok(roles)
    }
}

#[async_trait]
impl UserDirectory for UserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        Self::load_user(&conn, "id", &id.to_string())
    }

    async fn find_by_name(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        Self::load_user(&conn, "username", username)
    }
}

/// Check a plaintext password against a stored bcrypt hash.
/// Runs on the blocking pool; bcrypt is deliberately slow.
pub async fn verify_password(password: &str, password_hash: &str) -> Result<bool> {
    let plain = password.to_string();
    let hashed = password_hash.to_string();
    tokio::task::spawn_blocking(move || verify(plain, &hashed))
        .await
        .context("Password verification task failed")?
        .context("Failed to verify password")
}

pub(crate) fn parse_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
