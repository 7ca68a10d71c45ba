//! Refresh Token Storage
//! Durable refresh-token rows in SQLite, exposed through [`TokenStore`]
//!
//! Rows are keyed by the SHA-256 digest of the refresh secret; the raw secret
//! only ever lives in the client's cookie.

use crate::auth::user_store::parse_uuid;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One refresh token row.
///
/// `used_at` doubles as the `used` flag, so "used_at is set iff used" holds by
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub token_hash: String,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub ip_address: String,
    pub user_agent: String,
}

/// Lifecycle of a refresh token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Issued, unused, unexpired
    Active,
    /// Rotated, still inside the grace window
    UsedGrace,
    /// Expired, or used outside the grace window
    Retired,
}

impl RefreshTokenRecord {
    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn state(&self, now: DateTime<Utc>, grace_window: Duration) -> TokenState {
        match self.used_at {
            Some(used_at) if now - used_at <= grace_window => TokenState::UsedGrace,
            Some(_) => TokenState::Retired,
            None if self.is_expired(now) => TokenState::Retired,
            None => TokenState::Active,
        }
    }
}

/// Result of the conditional mark-used-and-insert-successor step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The row was still unused; it is now used and the successor exists.
    Rotated,
    /// Another caller marked the row first; nothing was written.
    AlreadyUsed,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, record: &RefreshTokenRecord) -> Result<()>;

    async fn find(&self, token_hash: &str, user_id: Uuid) -> Result<Option<RefreshTokenRecord>>;

    /// Atomically mark `old_id` used at `used_at` and insert `successor`.
    /// The update only matches while the row is still unused; when it matches
    /// nothing, the transaction is rolled back and `AlreadyUsed` returned.
    async fn rotate(
        &self,
        old_id: Uuid,
        used_at: DateTime<Utc>,
        successor: &RefreshTokenRecord,
    ) -> Result<RotateOutcome>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<RefreshTokenRecord>>;

    async fn delete(&self, token_hash: &str, user_id: Uuid) -> Result<bool>;

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<usize>;

    /// Delete rows expired at `now` and used rows whose `used_at` is older
    /// than `used_before`.
    async fn delete_stale(&self, now: DateTime<Utc>, used_before: DateTime<Utc>) -> Result<usize>;
}

/// Hex SHA-256 digest of a refresh secret
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

const COLUMNS: &str =
    "id, token_hash, user_id, issued_at, expires_at, used_at, ip_address, user_agent";

#[derive(Clone)]
pub struct SqliteTokenStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTokenStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open token db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS refresh_tokens (
                id TEXT PRIMARY KEY,
                token_hash TEXT UNIQUE NOT NULL,
                user_id TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                used_at INTEGER,
                ip_address TEXT NOT NULL,
                user_agent TEXT NOT NULL,
                CHECK (expires_at > issued_at),
                CHECK ((used = 0 AND used_at IS NULL) OR (used = 1 AND used_at IS NOT NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_refresh_tokens_user ON refresh_tokens(user_id);
            CREATE INDEX IF NOT EXISTS idx_refresh_tokens_expires ON refresh_tokens(expires_at);",
        )
        .context("Failed to create refresh token schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn insert_row(conn: &Connection, record: &RefreshTokenRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO refresh_tokens
                (id, token_hash, user_id, issued_at, expires_at, used, used_at, ip_address, user_agent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id.to_string(),
                record.token_hash,
                record.user_id.to_string(),
                record.issued_at.timestamp_millis(),
                record.expires_at.timestamp_millis(),
                record.is_used(),
                record.used_at.map(|t| t.timestamp_millis()),
                record.ip_address,
                record.user_agent,
            ],
        )
        .context("Failed to insert refresh token")?;
        Ok(())
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<RefreshTokenRecord> {
        Ok(RefreshTokenRecord {
            id: parse_uuid(row, 0)?,
            token_hash: row.get(1)?,
            user_id: parse_uuid(row, 2)?,
            issued_at: millis_to_datetime(row, 3)?,
            expires_at: millis_to_datetime(row, 4)?,
            used_at: match row.get::<_, Option<i64>>(5)? {
                Some(_) => Some(millis_to_datetime(row, 5)?),
                None => None,
            },
            ip_address: row.get(6)?,
            user_agent: row.get(7)?,
        })
    }
}

fn millis_to_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {millis}").into(),
        )
    })
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn insert(&self, record: &RefreshTokenRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::insert_row(&conn, record)
    }

    async fn find(&self, token_hash: &str, user_id: Uuid) -> Result<Option<RefreshTokenRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM refresh_tokens WHERE token_hash = ?1 AND user_id = ?2"
        ))?;
        let record = stmt
            .query_row(params![token_hash, user_id.to_string()], Self::map_row)
            .optional()?;
        Ok(record)
    }

    async fn rotate(
        &self,
        old_id: Uuid,
        used_at: DateTime<Utc>,
        successor: &RefreshTokenRecord,
    ) -> Result<RotateOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let marked = tx.execute(
            "UPDATE refresh_tokens SET used = 1, used_at = ?1 WHERE id = ?2 AND used = 0",
            params![used_at.timestamp_millis(), old_id.to_string()],
        )?;

        if marked == 0 {
            tx.rollback()?;
            return Ok(RotateOutcome::AlreadyUsed);
        }

        Self::insert_row(&tx, successor)?;
        tx.commit().context("Failed to commit token rotation")?;
        Ok(RotateOutcome::Rotated)
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<RefreshTokenRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM refresh_tokens WHERE user_id = ?1 ORDER BY issued_at DESC"
        ))?;
        let records = stmt
            .query_map(params![user_id.to_string()], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn delete(&self, token_hash: &str, user_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM refresh_tokens WHERE token_hash = ?1 AND user_id = ?2",
            params![token_hash, user_id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM refresh_tokens WHERE user_id = ?1",
            params![user_id.to_string()],
        )?;
        Ok(deleted)
    }

    async fn delete_stale(&self, now: DateTime<Utc>, used_before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM refresh_tokens
             WHERE expires_at < ?1 OR (used = 1 AND used_at < ?2)",
            params![now.timestamp_millis(), used_before.timestamp_millis()],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn record(user_id: Uuid, secret: &str, issued_at: DateTime<Utc>) -> RefreshTokenRecord {
        RefreshTokenRecord {
            id: Uuid::new_v4(),
            token_hash: hash_secret(secret),
            user_id,
            issued_at,
            expires_at: issued_at + Duration::days(7),
            used_at: None,
            ip_address: "127.0.0.1".to_string(),
            user_agent: "test-agent".to_string(),
        }
    }

    #[test]
    fn test_hash_secret_is_stable_hex() {
        let a = hash_secret("secret");
        assert_eq!(a.len(), 64);
        assert_eq!(a, hash_secret("secret"));
        assert_ne!(a, hash_secret("secret2"));
    }

    #[test]
    fn test_token_state_transitions() {
        let now = Utc::now();
        let grace = Duration::seconds(30);
        let mut rec = record(Uuid::new_v4(), "s", now);
        assert_eq!(rec.state(now, grace), TokenState::Active);
        assert_eq!(rec.state(now + Duration::days(8), grace), TokenState::Retired);

        rec.used_at = Some(now);
        assert_eq!(rec.state(now + Duration::seconds(30), grace), TokenState::UsedGrace);
        assert_eq!(rec.state(now + Duration::seconds(31), grace), TokenState::Retired);
    }

    #[tokio::test]
    async fn test_insert_find_roundtrip() {
        let temp = NamedTempFile::new().unwrap();
        let store = SqliteTokenStore::new(temp.path().to_str().unwrap()).unwrap();
        let user_id = Uuid::new_v4();
        let rec = record(user_id, "secret-a", Utc::now());
        store.insert(&rec).await.unwrap();

        let found = store.find(&rec.token_hash, user_id).await.unwrap().unwrap();
        assert_eq!(found.id, rec.id);
        assert_eq!(found.expires_at.timestamp_millis(), rec.expires_at.timestamp_millis());
        assert!(!found.is_used());

        // Wrong owner never matches
        assert!(store.find(&rec.token_hash, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotate_is_conditional() {
        let store = SqliteTokenStore::in_memory().unwrap();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let old = record(user_id, "old", now);
        store.insert(&old).await.unwrap();

        let first = record(user_id, "next-1", now);
        let second = record(user_id, "next-2", now);

        assert_eq!(
            store.rotate(old.id, now, &first).await.unwrap(),
            RotateOutcome::Rotated
        );
        assert_eq!(
            store.rotate(old.id, now, &second).await.unwrap(),
            RotateOutcome::AlreadyUsed
        );

        let rows = store.list_for_user(user_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(store.find(&second.token_hash, user_id).await.unwrap().is_none());

        let old_row = store.find(&old.token_hash, user_id).await.unwrap().unwrap();
        assert!(old_row.is_used());
    }

    #[tokio::test]
    async fn test_rotate_rolls_back_when_successor_insert_fails() {
        let store = SqliteTokenStore::in_memory().unwrap();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let old = record(user_id, "old", now);
        let other = record(user_id, "other", now);
        store.insert(&old).await.unwrap();
        store.insert(&other).await.unwrap();

        // Successor collides on token_hash, so the insert fails.
        let mut successor = record(user_id, "other", now);
        successor.id = Uuid::new_v4();
        assert!(store.rotate(old.id, now, &successor).await.is_err());

        let old_row = store.find(&old.token_hash, user_id).await.unwrap().unwrap();
        assert!(!old_row.is_used(), "mark-used must not commit without the successor");
    }

    #[tokio::test]
    async fn test_delete_and_delete_all() {
        let store = SqliteTokenStore::in_memory().unwrap();
        let user_id = Uuid::new_v4();
        let a = record(user_id, "a", Utc::now());
        let b = record(user_id, "b", Utc::now());
        let other = record(Uuid::new_v4(), "c", Utc::now());
        for r in [&a, &b, &other] {
            store.insert(r).await.unwrap();
        }

        assert!(store.delete(&a.token_hash, user_id).await.unwrap());
        assert!(!store.delete(&a.token_hash, user_id).await.unwrap());

        assert_eq!(store.delete_all_for_user(user_id).await.unwrap(), 1);
        assert_eq!(store.list_for_user(other.user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_stale() {
        let store = SqliteTokenStore::in_memory().unwrap();
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        let expired = record(user_id, "expired", now - Duration::days(8));
        let live = record(user_id, "live", now);
        let mut used_long_ago = record(user_id, "used-old", now - Duration::hours(1));
        used_long_ago.used_at = Some(now - Duration::minutes(10));
        let mut used_recently = record(user_id, "used-new", now - Duration::hours(1));
        used_recently.used_at = Some(now - Duration::seconds(5));

        for r in [&expired, &live, &used_long_ago, &used_recently] {
            store.insert(r).await.unwrap();
        }

        let deleted = store
            .delete_stale(now, now - Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let remaining: Vec<_> = store
            .list_for_user(user_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert!(remaining.contains(&live.id));
        assert!(remaining.contains(&used_recently.id));
    }
}
