//! SQLite persistence layer for revtree.
//!
//! Provides a [`Database`] handle with WAL-mode journaling, automatic schema
//! migrations, and query helpers for every `revtree_*` table.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// Main database handle wrapping a SQLite connection.
///
/// The connection is opened in WAL mode with a busy timeout. The inner
/// connection is wrapped in a `Mutex` so that `Database` is `Send + Sync`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        debug!("database opened successfully with WAL mode");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run all schema migrations to bring the database up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        info!("initializing database schema");
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("database schema is up to date");
        Ok(())
    }

    /// Remove every revtree table and the schema version marker.
    pub fn drop_tables(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        schema::drop_tables(&conn)
    }

    /// Current schema version (0 when nothing is installed).
    pub fn schema_version(&self) -> Result<u32, DatabaseError> {
        schema::get_schema_version(&self.conn())
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Execute a closure inside a SQLite transaction. If the closure returns
    /// `Ok`, the transaction is committed; otherwise it is rolled back.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        self.transaction_with(TransactionBehavior::Deferred, f)
    }

    /// Like [`Database::transaction`], but takes the write lock up front
    /// (`BEGIN IMMEDIATE`) so that concurrent writers serialize.
    pub fn immediate_transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        self.transaction_with(TransactionBehavior::Immediate, f)
    }

    fn transaction_with<F, T>(&self, behavior: TransactionBehavior, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(behavior)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().expect("failed to create in-memory db");
        db.initialize().expect("failed to initialize schema");
        assert_eq!(db.schema_version().unwrap(), 2);
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revtree.db");
        let db = Database::new(&path).expect("failed to create file db");
        db.initialize().expect("failed to initialize schema");
        assert!(path.exists());
    }

    #[test]
    fn test_transaction_commit() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        db.immediate_transaction(|conn| {
            conn.execute(
                "INSERT INTO revtree_skipped (revision, reason) VALUES (?1, ?2)",
                rusqlite::params![42, "test"],
            )?;
            Ok(())
        })
        .unwrap();

        let reason: String = db
            .conn()
            .query_row(
                "SELECT reason FROM revtree_skipped WHERE revision = ?1",
                rusqlite::params![42],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(reason, "test");
    }

    #[test]
    fn test_transaction_rollback() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO revtree_skipped (revision, reason) VALUES (?1, ?2)",
                rusqlite::params![99, "rollback"],
            )?;
            Err(DatabaseError::NotFound {
                entity: "test".into(),
                id: "forced".into(),
            })
        });
        assert!(result.is_err());

        let count: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM revtree_skipped WHERE revision = ?1",
                rusqlite::params![99],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_drop_tables() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.drop_tables().unwrap();
        assert_eq!(db.schema_version().unwrap(), 0);
        db.initialize().unwrap();
        assert_eq!(db.schema_version().unwrap(), 2);
    }
}
