//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `user_version`
//! pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS groups (
            lab_id        TEXT    NOT NULL,
            group_id      TEXT    NOT NULL,
            members       TEXT    NOT NULL DEFAULT '[]',
            project_path  TEXT    NOT NULL,
            active        INTEGER NOT NULL DEFAULT 1,
            updated_at    TEXT    NOT NULL,
            PRIMARY KEY (lab_id, group_id)
        );

        CREATE TABLE IF NOT EXISTS submissions (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            lab_id          TEXT    NOT NULL,
            group_id        TEXT    NOT NULL,
            sequence        INTEGER NOT NULL,
            tag             TEXT    NOT NULL,
            commit_hash     TEXT    NOT NULL,
            problem_branch  TEXT    NOT NULL,
            message         TEXT,
            detected_at     TEXT    NOT NULL,
            UNIQUE (lab_id, group_id, sequence),
            UNIQUE (lab_id, group_id, tag),
            UNIQUE (lab_id, group_id, commit_hash)
        );

        CREATE TABLE IF NOT EXISTS seen_tags (
            lab_id       TEXT NOT NULL,
            group_id     TEXT NOT NULL,
            tag          TEXT NOT NULL,
            disposition  TEXT NOT NULL
                         CHECK (disposition IN ('submission', 'malformed', 'duplicate')),
            seen_at      TEXT NOT NULL,
            PRIMARY KEY (lab_id, group_id, tag)
        );

        CREATE TABLE IF NOT EXISTS held_tags (
            lab_id           TEXT    NOT NULL,
            group_id         TEXT    NOT NULL,
            tag              TEXT    NOT NULL,
            commit_hash      TEXT    NOT NULL,
            attempts         INTEGER NOT NULL DEFAULT 1,
            first_seen_at    TEXT    NOT NULL,
            last_attempt_at  TEXT    NOT NULL,
            PRIMARY KEY (lab_id, group_id, tag)
        );

        CREATE TABLE IF NOT EXISTS grading_threads (
            lab_id    TEXT    NOT NULL,
            group_id  TEXT    NOT NULL,
            kind      TEXT    NOT NULL CHECK (kind IN ('merge_request', 'issue')),
            iid       INTEGER NOT NULL,
            web_url   TEXT    NOT NULL,
            PRIMARY KEY (lab_id, group_id)
        );

        CREATE TABLE IF NOT EXISTS grading_requests (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            submission_id  INTEGER NOT NULL UNIQUE REFERENCES submissions (id),
            lab_id         TEXT    NOT NULL,
            group_id       TEXT    NOT NULL,
            status         TEXT    NOT NULL,
            grader         TEXT,
            thread_kind    TEXT    NOT NULL,
            thread_iid     INTEGER NOT NULL,
            thread_url     TEXT    NOT NULL,
            last_event_id  INTEGER,
            created_at     TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_grading_requests_group
            ON grading_requests (lab_id, group_id);

        CREATE TABLE IF NOT EXISTS grading_history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id  INTEGER NOT NULL REFERENCES grading_requests (id),
            status      TEXT    NOT NULL,
            actor       TEXT,
            at          TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_grading_history_request
            ON grading_history (request_id);

        CREATE TRIGGER IF NOT EXISTS grading_history_no_update
            BEFORE UPDATE ON grading_history
        BEGIN
            SELECT RAISE(ABORT, 'grading history is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS grading_history_no_delete
            BEFORE DELETE ON grading_history
        BEGIN
            SELECT RAISE(ABORT, 'grading history is append-only');
        END;

        CREATE TABLE IF NOT EXISTS annotations (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id  INTEGER NOT NULL REFERENCES grading_requests (id),
            body        TEXT    NOT NULL,
            event_id    INTEGER,
            created_at  TEXT    NOT NULL,
            posted_at   TEXT,
            UNIQUE (request_id, event_id)
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT    NOT NULL,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);

        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
];

/// Apply any migrations newer than the database's current `user_version`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
