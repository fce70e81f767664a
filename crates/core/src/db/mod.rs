//! SQLite persistence layer for labsync.
//!
//! The database is a local index of what the forge already records: groups,
//! detected submissions, grading requests with their history, pending
//! annotations and the audit log. Everything in it can be rebuilt by
//! re-scanning the forge.
//!
//! Typed queries live in [`queries`] as methods on [`Database`]; the schema
//! and its migrations live in [`schema`].

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// How long a writer waits for the daemon or the CLI to release the file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle on the labsync database. One connection serves the poll
/// engine, the web server and the CLI of a process.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database file at `path`, creating it when missing.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        // The daemon and `labsync status` read the same file concurrently.
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::configure(conn)
    }

    /// A private database that lives as long as the handle.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bring the schema up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("database schema is up to date");
        Ok(())
    }

    /// Lock the connection. Every write is a single statement or a
    /// [`Database::transaction`], so a holder that panicked left nothing
    /// half-written and the lock is taken over.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("database lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` in a transaction: committed when it returns `Ok`, rolled back
    /// when it returns `Err`. Sequence allocation and status changes read
    /// and write through here so they never interleave.
    pub(crate) fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
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
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use rusqlite::params;

    use super::queries::Recorded;
    use super::*;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn insert_submission(conn: &Connection, sequence: i64, tag: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO submissions
                (lab_id, group_id, sequence, tag, commit_hash, problem_branch, detected_at)
             VALUES ('lab1', 'g1', ?1, ?2, ?2, 'problem', '2026-09-01T10:00:00Z')",
            params![sequence, tag],
        )
    }

    fn sequences(db: &Database) -> Vec<i64> {
        db.list_submissions("lab1", "g1")
            .unwrap()
            .into_iter()
            .map(|s| s.sequence)
            .collect()
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labsync.db");
        {
            let db = Database::new(&path).unwrap();
            db.initialize().unwrap();
            db.record_submission("lab1", "g1", "submission-1", "abc", "problem", None)
                .unwrap();
        }

        let db = Database::new(&path).unwrap();
        db.initialize().unwrap();
        assert_eq!(sequences(&db), vec![1]);
    }

    #[test]
    fn test_failed_transaction_leaves_sequence_free() {
        let db = setup_db();
        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            insert_submission(conn, 1, "submission-1")?;
            Err(DatabaseError::NotFound {
                entity: "grading thread".into(),
                id: "lab1/g1".into(),
            })
        });
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
        assert!(sequences(&db).is_empty());

        let Recorded::New(first) = db
            .record_submission("lab1", "g1", "submission-2", "def", "problem", None)
            .unwrap()
        else {
            panic!("expected a new submission");
        };
        assert_eq!(first.sequence, 1);
    }

    #[test]
    fn test_transaction_sees_its_own_writes() {
        let db = setup_db();
        let next: i64 = db
            .transaction(|conn| {
                insert_submission(conn, 1, "submission-1")?;
                Ok(conn.query_row(
                    "SELECT MAX(sequence) + 1 FROM submissions WHERE group_id = 'g1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(next, 2);
        assert_eq!(sequences(&db), vec![1]);
    }

    #[test]
    fn test_foreign_keys_are_enforced() {
        let db = setup_db();
        let orphan = db.conn().execute(
            "INSERT INTO grading_requests
                (submission_id, lab_id, group_id, status, thread_kind, thread_iid,
                 thread_url, created_at, updated_at)
             VALUES (99, 'lab1', 'g1', 'awaiting_grading', 'issue', 1, 'u', 't', 't')",
            [],
        );
        assert!(orphan.is_err());
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let db = setup_db();
        let crashed = catch_unwind(AssertUnwindSafe(|| {
            let _guard = db.conn();
            panic!("writer died");
        }));
        assert!(crashed.is_err());

        db.record_submission("lab1", "g1", "submission-1", "abc", "problem", None)
            .unwrap();
        assert_eq!(sequences(&db), vec![1]);
    }
}
