//! # Database
//!
//! SQLite database handle shared by every store in the bridge.
//!
//! ```text
//! ┌─────────────────┐
//! │  Stores         │  ConfigStore, LinkStore, Outbox, RoleSyncQueue, ...
//! └────────┬────────┘
//!          │  with_conn / with_tx
//!          ▼
//! ┌─────────────────┐
//! │    Database     │  Arc<Mutex<Connection>>: one writer at a time
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │   SQLite DB     │  file (WAL) in production, in-memory for tests
//! └─────────────────┘
//! ```
//!
//! Every read-then-write in the bridge runs inside [`Database::with_tx`],
//! which holds the connection lock and opens a `BEGIN IMMEDIATE`
//! transaction, so concurrent callers never interleave between the read
//! and the write.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, TransactionBehavior};

use super::schema;
use crate::error::{Error, Result};

/// The shared database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database.
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => {
                let conn = Connection::open(p)
                    .map_err(|e| Error::Database(format!("Failed to open database: {}", e)))?;
                conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
                conn
            }
            None => Connection::open_in_memory().map_err(|e| {
                Error::Database(format!("Failed to create in-memory database: {}", e))
            })?,
        };
        conn.busy_timeout(Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Initialize or migrate the database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let has_version_table: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )?;
        let version: Option<i32> = if has_version_table {
            conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?
        } else {
            None
        };

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::Database(format!("Failed to create tables: {}", e)))?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v < schema::SCHEMA_VERSION => {
                tracing::info!(
                    "Database schema version {} is older than current {}, running migrations",
                    v,
                    schema::SCHEMA_VERSION
                );

                if v < 2 {
                    tracing::info!("Running migration v1 → v2 (role-sync retry scheduling)");
                    conn.execute_batch(schema::MIGRATE_V1_TO_V2)
                        .map_err(|e| Error::Database(format!("Migration v1→v2 failed: {}", e)))?;
                }

                conn.execute(
                    "UPDATE schema_version SET version = ?",
                    params![schema::SCHEMA_VERSION],
                )?;
                tracing::info!(
                    "All migrations complete (now at version {})",
                    schema::SCHEMA_VERSION
                );
            }
            Some(v) => {
                tracing::debug!("Database schema version: {}", v);
            }
        }

        Ok(())
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_schema() {
        let db = Database::open(None).unwrap();
        let version: i32 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT version FROM schema_version", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_tx_rolls_back_on_error() {
        let db = Database::open(None).unwrap();
        let result: Result<()> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO releases (id, title, created_at) VALUES ('r1', 'Night Drive', 0)",
                [],
            )?;
            Err(Error::Internal("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM releases", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_reopen_file_database_keeps_version() {
        let dir = std::env::temp_dir().join(format!("label-bridge-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bridge.db");
        let path = path.to_str().unwrap();

        drop(Database::open(Some(path)).unwrap());
        let db = Database::open(Some(path)).unwrap();
        let rows: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(rows, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
