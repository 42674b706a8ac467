#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **herd-store** – Persistent storage for the herd controller.
//!
//! This crate owns the canonical state of the managed fleet: groups,
//! servers, procedures, the append-only checkpoint log, statistics counters
//! and the cloud-provider plumbing tables. It is a thin layer over a
//! transactional SQLite database accessed through sqlx; the rest of the
//! workspace depends only on ACID transactions and the typed methods exposed
//! here. In-memory state elsewhere is a cache; every mutation lands here
//! first.
//!
//! Transient database failures are retried three times with a doubling
//! backoff starting at 100 ms before being surfaced as
//! [`Error::Persistence`].

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, warn};

use herd_types::Error;

pub mod checkpoint;
pub mod fleet;
pub mod procedure;
pub mod provider;
pub mod stats;

pub use checkpoint::{CheckpointRow, JobCheckpoint};
pub use procedure::ProcedureRow;
pub use provider::{Machine, Provider};
pub use stats::StatRow;

/// Retry attempts for transient database failures.
const RETRY_ATTEMPTS: u32 = 3;

/// Base backoff between retry attempts; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

//─────────────────────────────
//  Store handle
//─────────────────────────────

/// Handle to the controller's database.
///
/// Cloning is cheap; all clones share the same pool and version counter.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    version: Arc<AtomicU64>,
}

impl Store {
    /// Open or create the database at the given path and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(persistence_err)?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory database, used by tests and `storage.database = :memory:`.
    ///
    /// An in-memory SQLite database is private to its connection, so the
    /// pool is pinned to a single connection.
    pub async fn in_memory() -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(persistence_err)?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and run migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, Error> {
        let store = Self {
            pool,
            version: Arc::new(AtomicU64::new(1)),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Create the schema when it does not exist yet.
    async fn migrate(&self) -> Result<(), Error> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                group_id TEXT PRIMARY KEY,
                description TEXT,
                master_uuid TEXT,
                status TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                uuid TEXT PRIMARY KEY,
                group_id TEXT,
                address TEXT NOT NULL,
                user TEXT,
                passwd TEXT,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                weight REAL NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS procedures (
                uuid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                locks_blob TEXT NOT NULL DEFAULT '[]',
                started_at TEXT NOT NULL,
                finished_at TEXT,
                success INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                proc_uuid TEXT NOT NULL,
                job_uuid TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                phase TEXT NOT NULL,
                do_action TEXT NOT NULL,
                undo_action TEXT,
                args_blob TEXT NOT NULL,
                success INTEGER,
                PRIMARY KEY (proc_uuid, job_uuid)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS statistics (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                call_count INTEGER NOT NULL DEFAULT 0,
                call_abort INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (scope, key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS providers (
                provider_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                url TEXT NOT NULL,
                user TEXT,
                passwd TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS machines (
                machine_uuid TEXT PRIMARY KEY,
                provider_id TEXT NOT NULL,
                image TEXT,
                flavor TEXT,
                addresses TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_servers_group ON servers(group_id)",
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_seq ON checkpoints(proc_uuid, sequence)",
        ];
        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(persistence_err)?;
        }
        debug!("database schema is current");
        Ok(())
    }

    /// Begin a transaction on the underlying pool.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, Error> {
        self.pool.begin().await.map_err(persistence_err)
    }

    /// The shared connection pool, for composed statements.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current fleet-state version token, bumped on every group or server
    /// mutation. Carried in every RPC response so clients can invalidate
    /// caches.
    pub fn version_token(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Record a fleet mutation, advancing the version token. Callers using
    /// the transaction-scoped helpers bump this once per committed change.
    pub fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Run `op` with the transient-failure retry policy.
    pub(crate) async fn retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut backoff = RETRY_BACKOFF;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < RETRY_ATTEMPTS => {
                    warn!(what, attempt, error = %err, "transient database error, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(persistence_err(err)),
            }
        }
    }
}

/// Map a sqlx error into the workspace persistence error kind.
pub(crate) fn persistence_err(err: sqlx::Error) -> Error {
    Error::Persistence(err.to_string())
}

/// Whether an error is worth retrying.
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        assert_eq!(store.version_token(), 1);
    }

    #[tokio::test]
    async fn open_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herd.db");
        {
            let store = Store::open(&path).await.unwrap();
            store.bump_version();
        }
        assert!(path.exists());
        // Reopening an existing database must not fail.
        Store::open(&path).await.unwrap();
    }
}
