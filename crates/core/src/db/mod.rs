//! Metadata store.
//!
//! Repositories, branch rules, collaborators, pull requests, tokens and the
//! audit trail all live in one SQLite file. Git objects never do; those stay
//! in the bare repositories under the configured root.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// Milliseconds a writer waits on a locked file before SQLite gives up.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Shared handle to the metadata store.
///
/// A single connection sits behind a mutex; every service borrows it for the
/// duration of one query or one [`Database::transaction`] call.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the store at `path`, creating the file when it does not exist.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening metadata store");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::configure(&conn)?;

        debug!(path = %path.display(), "metadata store ready");
        Ok(Self::wrap(conn))
    }

    /// Transient store used by tests and one-shot tooling.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self::wrap(conn))
    }

    fn configure(conn: &Connection) -> Result<(), DatabaseError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;
        Ok(())
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Apply pending migrations.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let applied = schema::run_migrations(&conn)?;
        if applied > 0 {
            info!(applied, "metadata schema migrated");
        }
        Ok(())
    }

    /// Borrow the connection. A poisoned lock is taken over; the connection
    /// itself stays consistent because SQLite rolls back unfinished work.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("metadata store lock poisoned by a panicking holder");
                poisoned.into_inner()
            }
        }
    }

    /// Run `f` atomically. Any error from `f` discards everything it wrote.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_count(db: &Database, name: &str) -> i64 {
        db.conn()
            .query_row(
                "SELECT COUNT(*) FROM repositories WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .unwrap()
    }

    fn insert_repo(conn: &Connection, name: &str) -> Result<(), DatabaseError> {
        conn.execute(
            "INSERT INTO repositories (owner, name, default_branch, created_at)
             VALUES ('acme', ?1, 'main', '2025-01-01T00:00:00Z')",
            [name],
        )?;
        Ok(())
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.initialize().unwrap();
    }

    #[test]
    fn test_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prforge.db");
        {
            let db = Database::new(&path).unwrap();
            db.initialize().unwrap();
            db.transaction(|conn| insert_repo(conn, "widgets")).unwrap();
        }
        let db = Database::new(&path).unwrap();
        db.initialize().unwrap();
        assert_eq!(repo_count(&db, "widgets"), 1);
    }

    #[test]
    fn test_failed_transaction_leaves_nothing_behind() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            insert_repo(conn, "half-done")?;
            Err(DatabaseError::NotFound {
                entity: "pull request".into(),
                id: "acme/half-done#1".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(repo_count(&db, "half-done"), 0);
    }
}
