//! Storage layer for the steward
//!
//! A single SQLite database accessed through a `deadpool-sqlite` connection
//! pool. Repositories borrow a [`Database`] handle and run their queries
//! inside [`Database::interact`], which moves the closure onto the pool's
//! blocking thread.

pub mod consolidation;
pub mod jobs;
pub mod memories;
pub mod policy;

use crate::error::{Result, StewardError};
use chrono::{DateTime, Utc};
use deadpool_sqlite::{Config, Pool, PoolConfig, Runtime};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Default connection pool size
const DEFAULT_POOL_SIZE: usize = 8;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Embedded migrations, applied in order and recorded in `_migrations_applied`
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_memory_schema.sql",
        include_str!("migrations/001_memory_schema.sql"),
    ),
    (
        "002_steward_schema.sql",
        include_str!("migrations/002_steward_schema.sql"),
    ),
];

/// Pooled handle to the steward database
#[derive(Clone)]
pub struct Database {
    pool: Pool,
    path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open (creating if needed) the database at `path` and apply migrations
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_pool_size(path, DEFAULT_POOL_SIZE).await
    }

    /// Open with a custom maximum pool size
    pub async fn with_pool_size<P: AsRef<Path>>(path: P, pool_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!(
            "Opening steward database at: {} (pool_size: {})",
            path.display(),
            pool_size
        );

        let mut config = Config::new(path.clone());
        config.pool = Some(PoolConfig::new(pool_size.max(1)));
        let pool = config.create_pool(Runtime::Tokio1).map_err(|e| {
            StewardError::Database(format!("Failed to create connection pool: {}", e))
        })?;

        let db = Self { pool, path };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against a pooled connection
    pub async fn interact<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.pool.get().await.map_err(|e| {
            StewardError::Pool(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.interact(move |conn| {
            configure_connection(conn)?;
            f(conn)
        })
        .await
            .map_err(|e| StewardError::Pool(format!("Pool interaction failed: {}", e)))?
    }

    /// Apply pending migrations
    async fn migrate(&self) -> Result<()> {
        self.interact(|conn| {
            // Persisted in the database file, so every later connection is WAL too
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS _migrations_applied (
                    migration_name TEXT PRIMARY KEY,
                    applied_at INTEGER NOT NULL
                )",
                [],
            )?;

            for (name, sql) in MIGRATIONS {
                let applied: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM _migrations_applied WHERE migration_name = ?1",
                    params![name],
                    |row| row.get(0),
                )?;
                if applied > 0 {
                    debug!("Skipping already applied migration: {}", name);
                    continue;
                }

                let tx = conn.transaction()?;
                tx.execute_batch(sql).map_err(|e| {
                    StewardError::Database(format!("Failed to apply migration {}: {}", name, e))
                })?;
                tx.execute(
                    "INSERT INTO _migrations_applied (migration_name, applied_at) VALUES (?1, ?2)",
                    params![name, to_millis(Utc::now())],
                )?;
                tx.commit()?;
                info!("Executed migration: {}", name);
            }
            Ok(())
        })
        .await
    }
}

/// Per-connection settings; pooled connections are recycled, so this runs on
/// every checkout and must stay idempotent
fn configure_connection(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(())
}

/// Unix milliseconds for a timestamp
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Read a UUID stored as TEXT
pub(crate) fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        Uuid::parse_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Parse a text column with `FromStr`; an unknown value fails the row
pub(crate) fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Decode a JSON text column that must be well formed
pub(crate) fn strict_json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a JSON column; malformed or missing text becomes `fallback`
pub(crate) fn json_col(row: &Row<'_>, idx: usize, fallback: Value) -> rusqlite::Result<Value> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(fallback))
}

/// Read a JSON array of UUID strings
pub(crate) fn uuid_list_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    let ids: Vec<String> = raw
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    ids.iter()
        .map(|s| {
            Uuid::parse_str(s).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            })
        })
        .collect()
}

pub(crate) fn uuid_list_json(ids: &[Uuid]) -> String {
    let strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();
    Value::from(strings).to_string()
}

/// Convert a `std::time::Duration` to milliseconds for arithmetic on stored timestamps
pub(crate) fn duration_millis(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
