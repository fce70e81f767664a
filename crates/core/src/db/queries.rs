//! Typed query helpers for every table in the labsync database.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{
    self, Annotation, GradingRequest, GradingStatus, Group, GroupStatusRow, StatusChange,
    Submission, ThreadKind, ThreadRef,
};

// ---------------------------------------------------------------------------
// Row structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

/// A row from the `held_tags` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldTag {
    pub lab_id: String,
    pub group_id: String,
    pub tag: String,
    pub commit_hash: String,
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
}

/// Why a tag will not be looked at again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagDisposition {
    Submission,
    Malformed,
    Duplicate,
}

impl TagDisposition {
    fn as_str(self) -> &'static str {
        match self {
            Self::Submission => "submission",
            Self::Malformed => "malformed",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Result of [`Database::record_submission`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// A new submission with the next sequence number.
    New(Submission),
    /// The commit was already recorded under an earlier tag.
    Duplicate(Submission),
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- groups -------------------------------------------------------------

    /// Insert or update a group. Membership and project mapping follow the
    /// roster; the row is never deleted.
    pub fn upsert_group(&self, group: &Group) -> Result<(), DatabaseError> {
        let members = serde_json::to_string(&group.members).map_err(|e| DatabaseError::Corrupt {
            entity: "group".into(),
            detail: e.to_string(),
        })?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO groups (lab_id, group_id, members, project_path, active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(lab_id, group_id) DO UPDATE SET
                members = excluded.members,
                project_path = excluded.project_path,
                active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                group.lab_id,
                group.id,
                members,
                group.project_path,
                group.active,
                timestamp(Utc::now())
            ],
        )?;
        debug!(lab = %group.lab_id, group = %group.id, "upserted group");
        Ok(())
    }

    /// Mark every group of `lab_id` not listed in `keep` as inactive.
    /// Returns how many groups were deactivated.
    pub fn deactivate_missing_groups(
        &self,
        lab_id: &str,
        keep: &[String],
    ) -> Result<usize, DatabaseError> {
        let existing = self.list_groups(lab_id, true)?;
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let conn = self.conn();
        let mut count = 0;
        for group in existing.iter().filter(|g| !keep.contains(g.id.as_str())) {
            conn.execute(
                "UPDATE groups SET active = 0, updated_at = ?3 WHERE lab_id = ?1 AND group_id = ?2",
                params![lab_id, group.id, timestamp(Utc::now())],
            )?;
            count += 1;
        }
        Ok(count)
    }

    /// List groups of a lab ordered by id.
    pub fn list_groups(
        &self,
        lab_id: &str,
        active_only: bool,
    ) -> Result<Vec<Group>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT lab_id, group_id, members, project_path, active
             FROM groups WHERE lab_id = ?1 AND (?2 = 0 OR active = 1)
             ORDER BY group_id",
        )?;
        let groups = stmt
            .query_map(params![lab_id, active_only], group_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    pub fn get_group(&self, lab_id: &str, group_id: &str) -> Result<Option<Group>, DatabaseError> {
        let conn = self.conn();
        let group = conn
            .query_row(
                "SELECT lab_id, group_id, members, project_path, active
                 FROM groups WHERE lab_id = ?1 AND group_id = ?2",
                params![lab_id, group_id],
                group_from_row,
            )
            .optional()?;
        Ok(group)
    }

    // -- seen / held tags ---------------------------------------------------

    /// Tags of a group that have been dealt with and will not be scanned
    /// again.
    pub fn seen_tags(
        &self,
        lab_id: &str,
        group_id: &str,
    ) -> Result<HashSet<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT tag FROM seen_tags WHERE lab_id = ?1 AND group_id = ?2")?;
        let tags = stmt
            .query_map(params![lab_id, group_id], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(tags)
    }

    pub fn mark_tag_seen(
        &self,
        lab_id: &str,
        group_id: &str,
        tag: &str,
        disposition: TagDisposition,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        mark_seen(&conn, lab_id, group_id, tag, disposition)
    }

    /// Record one more failed lineage resolution for `tag`. Returns the
    /// number of polls the tag has been held back so far.
    pub fn hold_tag(
        &self,
        lab_id: &str,
        group_id: &str,
        tag: &str,
        commit_hash: &str,
    ) -> Result<u32, DatabaseError> {
        let now = timestamp(Utc::now());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO held_tags
                (lab_id, group_id, tag, commit_hash, attempts, first_seen_at, last_attempt_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
             ON CONFLICT(lab_id, group_id, tag) DO UPDATE SET
                attempts = attempts + 1,
                commit_hash = excluded.commit_hash,
                last_attempt_at = excluded.last_attempt_at",
            params![lab_id, group_id, tag, commit_hash, now],
        )?;
        let attempts: u32 = conn.query_row(
            "SELECT attempts FROM held_tags WHERE lab_id = ?1 AND group_id = ?2 AND tag = ?3",
            params![lab_id, group_id, tag],
            |row| row.get(0),
        )?;
        debug!(lab = lab_id, group = group_id, tag, attempts, "held back tag");
        Ok(attempts)
    }

    /// Tags currently held back for a lab.
    pub fn list_held_tags(&self, lab_id: &str) -> Result<Vec<HeldTag>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT lab_id, group_id, tag, commit_hash, attempts, first_seen_at
             FROM held_tags WHERE lab_id = ?1 ORDER BY group_id, tag",
        )?;
        let held = stmt
            .query_map(params![lab_id], |row| {
                Ok(HeldTag {
                    lab_id: row.get(0)?,
                    group_id: row.get(1)?,
                    tag: row.get(2)?,
                    commit_hash: row.get(3)?,
                    attempts: row.get(4)?,
                    first_seen_at: parse_datetime(&row.get::<_, String>(5)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(held)
    }

    // -- submissions --------------------------------------------------------

    /// Record a detected submission tag.
    ///
    /// Runs in one transaction: assigns the next per-group sequence number,
    /// marks the tag as seen and releases it from the held-back list. A
    /// commit that is already recorded is reported as a duplicate and gets
    /// no new sequence number.
    pub fn record_submission(
        &self,
        lab_id: &str,
        group_id: &str,
        tag: &str,
        commit_hash: &str,
        problem_branch: &str,
        message: Option<&str>,
    ) -> Result<Recorded, DatabaseError> {
        self.transaction(|conn| {
            let existing = conn
                .query_row(
                    &format!(
                        "{SUBMISSION_SELECT}
                         WHERE lab_id = ?1 AND group_id = ?2 AND commit_hash = ?3"
                    ),
                    params![lab_id, group_id, commit_hash],
                    submission_from_row,
                )
                .optional()?;
            if let Some(existing) = existing {
                mark_seen(conn, lab_id, group_id, tag, TagDisposition::Duplicate)?;
                release_held(conn, lab_id, group_id, tag)?;
                return Ok(Recorded::Duplicate(existing));
            }

            let sequence: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM submissions
                 WHERE lab_id = ?1 AND group_id = ?2",
                params![lab_id, group_id],
                |row| row.get(0),
            )?;
            let detected_at = Utc::now();
            conn.execute(
                "INSERT INTO submissions
                    (lab_id, group_id, sequence, tag, commit_hash, problem_branch, message,
                     detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    lab_id,
                    group_id,
                    sequence,
                    tag,
                    commit_hash,
                    problem_branch,
                    message,
                    timestamp(detected_at)
                ],
            )?;
            let id = conn.last_insert_rowid();
            mark_seen(conn, lab_id, group_id, tag, TagDisposition::Submission)?;
            release_held(conn, lab_id, group_id, tag)?;
            debug!(id, lab = lab_id, group = group_id, tag, sequence, "recorded submission");

            Ok(Recorded::New(Submission {
                id,
                lab_id: lab_id.to_string(),
                group_id: group_id.to_string(),
                sequence,
                tag: tag.to_string(),
                commit_hash: commit_hash.to_string(),
                problem_branch: problem_branch.to_string(),
                message: message.map(str::to_string),
                detected_at,
            }))
        })
    }

    pub fn get_submission(&self, id: i64) -> Result<Submission, DatabaseError> {
        let conn = self.conn();
        conn.query_row(
            &format!("{SUBMISSION_SELECT} WHERE id = ?1"),
            params![id],
            submission_from_row,
        )
        .optional()?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "submission".into(),
            id: id.to_string(),
        })
    }

    /// All submissions of a group in sequence order.
    pub fn list_submissions(
        &self,
        lab_id: &str,
        group_id: &str,
    ) -> Result<Vec<Submission>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{SUBMISSION_SELECT} WHERE lab_id = ?1 AND group_id = ?2 ORDER BY sequence"
        ))?;
        let subs = stmt
            .query_map(params![lab_id, group_id], submission_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(subs)
    }

    /// Submissions of a group that have no grading request yet, in sequence
    /// order.
    pub fn unregistered_submissions(
        &self,
        lab_id: &str,
        group_id: &str,
    ) -> Result<Vec<Submission>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{SUBMISSION_SELECT} WHERE lab_id = ?1 AND group_id = ?2
               AND id NOT IN (SELECT submission_id FROM grading_requests)
             ORDER BY sequence"
        ))?;
        let subs = stmt
            .query_map(params![lab_id, group_id], submission_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(subs)
    }

    // -- grading threads ----------------------------------------------------

    pub fn get_grading_thread(
        &self,
        lab_id: &str,
        group_id: &str,
    ) -> Result<Option<ThreadRef>, DatabaseError> {
        let conn = self.conn();
        let thread = conn
            .query_row(
                "SELECT kind, iid, web_url FROM grading_threads
                 WHERE lab_id = ?1 AND group_id = ?2",
                params![lab_id, group_id],
                |row| {
                    Ok(ThreadRef {
                        kind: parse_kind(row, 0)?,
                        iid: row.get::<_, i64>(1)? as u64,
                        web_url: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(thread)
    }

    pub fn set_grading_thread(
        &self,
        lab_id: &str,
        group_id: &str,
        thread: &ThreadRef,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO grading_threads (lab_id, group_id, kind, iid, web_url)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(lab_id, group_id) DO UPDATE SET
                kind = excluded.kind, iid = excluded.iid, web_url = excluded.web_url",
            params![
                lab_id,
                group_id,
                thread.kind.to_string(),
                thread.iid as i64,
                thread.web_url
            ],
        )?;
        Ok(())
    }

    // -- grading requests ---------------------------------------------------

    /// Create the grading request for a submission together with its first
    /// history entry.
    pub fn insert_grading_request(
        &self,
        submission: &Submission,
        thread: &ThreadRef,
        status: GradingStatus,
        actor: Option<&str>,
    ) -> Result<GradingRequest, DatabaseError> {
        let id = self.transaction(|conn| {
            let now = timestamp(Utc::now());
            conn.execute(
                "INSERT INTO grading_requests
                    (submission_id, lab_id, group_id, status, thread_kind, thread_iid, thread_url,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    submission.id,
                    submission.lab_id,
                    submission.group_id,
                    status.to_string(),
                    thread.kind.to_string(),
                    thread.iid as i64,
                    thread.web_url,
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO grading_history (request_id, status, actor, at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, status.to_string(), actor, now],
            )?;
            Ok(id)
        })?;
        debug!(id, submission = submission.id, %status, "inserted grading request");
        self.get_grading_request(id)
    }

    pub fn get_grading_request(&self, id: i64) -> Result<GradingRequest, DatabaseError> {
        let conn = self.conn();
        let request = conn
            .query_row(
                &format!("{REQUEST_SELECT} WHERE id = ?1"),
                params![id],
                request_from_row,
            )
            .optional()?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "grading request".into(),
                id: id.to_string(),
            })?;
        with_history(&conn, request)
    }

    pub fn grading_request_for_submission(
        &self,
        submission_id: i64,
    ) -> Result<Option<GradingRequest>, DatabaseError> {
        let conn = self.conn();
        let request = conn
            .query_row(
                &format!("{REQUEST_SELECT} WHERE submission_id = ?1"),
                params![submission_id],
                request_from_row,
            )
            .optional()?;
        request.map(|r| with_history(&conn, r)).transpose()
    }

    /// The request of the group's most recently registered submission.
    pub fn latest_grading_request(
        &self,
        lab_id: &str,
        group_id: &str,
    ) -> Result<Option<GradingRequest>, DatabaseError> {
        let conn = self.conn();
        let request = conn
            .query_row(
                &format!(
                    "{REQUEST_SELECT}
                     WHERE lab_id = ?1 AND group_id = ?2 ORDER BY id DESC LIMIT 1"
                ),
                params![lab_id, group_id],
                request_from_row,
            )
            .optional()?;
        request.map(|r| with_history(&conn, r)).transpose()
    }

    /// All requests of a group, oldest first.
    pub fn list_grading_requests(
        &self,
        lab_id: &str,
        group_id: &str,
    ) -> Result<Vec<GradingRequest>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{REQUEST_SELECT} WHERE lab_id = ?1 AND group_id = ?2 ORDER BY id"
        ))?;
        let requests = stmt
            .query_map(params![lab_id, group_id], request_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        requests
            .into_iter()
            .map(|r| with_history(&conn, r))
            .collect()
    }

    /// Append a history entry and update the request's current status.
    ///
    /// The change is checked against the status stored at the time of the
    /// write. The stored timestamp is clamped so that history never goes
    /// backwards in time, even if the clock does.
    pub fn append_status_change(
        &self,
        request_id: i64,
        status: GradingStatus,
        actor: Option<&str>,
        grader: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<StatusChange, DatabaseError> {
        self.transaction(|conn| {
            let current = conn
                .query_row(
                    "SELECT status FROM grading_requests WHERE id = ?1",
                    params![request_id],
                    |row| parse_status(row, 0),
                )
                .optional()?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "grading request".into(),
                    id: request_id.to_string(),
                })?;
            if !current.can_transition_to(status) {
                return Err(DatabaseError::InvalidTransition {
                    request_id,
                    from: current.to_string(),
                    to: status.to_string(),
                });
            }

            let last: Option<String> = conn
                .query_row(
                    "SELECT at FROM grading_history WHERE request_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![request_id],
                    |row| row.get(0),
                )
                .optional()?;
            let at = match last.map(|s| parse_datetime(&s)) {
                Some(prev) if prev > at => prev,
                _ => at,
            };
            conn.execute(
                "INSERT INTO grading_history (request_id, status, actor, at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![request_id, status.to_string(), actor, timestamp(at)],
            )?;
            conn.execute(
                "UPDATE grading_requests
                 SET status = ?2, grader = COALESCE(?3, grader), updated_at = ?4
                 WHERE id = ?1",
                params![request_id, status.to_string(), grader, timestamp(at)],
            )?;
            Ok(StatusChange {
                status,
                actor: actor.map(str::to_string),
                at,
            })
        })
    }

    pub fn set_last_event_id(&self, request_id: i64, event_id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE grading_requests SET last_event_id = ?2 WHERE id = ?1",
            params![request_id, event_id],
        )?;
        Ok(())
    }

    // -- annotations --------------------------------------------------------

    /// Schedule a note for a grading thread. Scheduling the same event
    /// twice is a no-op; returns whether a new annotation was stored.
    pub fn schedule_annotation(
        &self,
        request_id: i64,
        body: &str,
        event_id: Option<i64>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO annotations (request_id, body, event_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![request_id, body, event_id, timestamp(Utc::now())],
        )?;
        Ok(inserted > 0)
    }

    pub fn pending_annotations(&self, request_id: i64) -> Result<Vec<Annotation>, DatabaseError> {
        self.annotations(request_id, true)
    }

    pub fn list_annotations(&self, request_id: i64) -> Result<Vec<Annotation>, DatabaseError> {
        self.annotations(request_id, false)
    }

    fn annotations(
        &self,
        request_id: i64,
        pending_only: bool,
    ) -> Result<Vec<Annotation>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, request_id, body, event_id, created_at, posted_at
             FROM annotations WHERE request_id = ?1 AND (?2 = 0 OR posted_at IS NULL)
             ORDER BY id",
        )?;
        let annotations = stmt
            .query_map(params![request_id, pending_only], |row| {
                Ok(Annotation {
                    id: row.get(0)?,
                    request_id: row.get(1)?,
                    body: row.get(2)?,
                    event_id: row.get(3)?,
                    created_at: parse_datetime(&row.get::<_, String>(4)?),
                    posted_at: row.get::<_, Option<String>>(5)?.map(|s| parse_datetime(&s)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(annotations)
    }

    pub fn mark_annotation_posted(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE annotations SET posted_at = ?2 WHERE id = ?1",
            params![id, timestamp(Utc::now())],
        )?;
        Ok(())
    }

    // -- overview -----------------------------------------------------------

    /// Current status of every group of a lab.
    pub fn group_status_rows(&self, lab_id: &str) -> Result<Vec<GroupStatusRow>, DatabaseError> {
        let groups = self.list_groups(lab_id, false)?;
        let mut rows = Vec::with_capacity(groups.len());
        for group in groups {
            let submissions = self.list_submissions(lab_id, &group.id)?;
            let latest = self.latest_grading_request(lab_id, &group.id)?;
            rows.push(GroupStatusRow {
                group_id: group.id,
                active: group.active,
                submissions: submissions.len() as i64,
                latest_tag: submissions.last().map(|s| s.tag.clone()),
                status: latest
                    .as_ref()
                    .map(|r| r.status)
                    .unwrap_or(GradingStatus::NoSubmission),
                grader: latest.as_ref().and_then(|r| r.grader.clone()),
                updated_at: latest.map(|r| r.updated_at),
            });
        }
        Ok(rows)
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit-log entry.
    pub fn insert_audit_log(
        &self,
        action: &str,
        details: Option<&str>,
        success: bool,
    ) -> Result<i64, DatabaseError> {
        let now = timestamp(Utc::now());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, details, success, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![action, details, success, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action, "inserted audit_log entry");
        Ok(id)
    }

    /// Insert an audit entry from a model struct.
    pub fn insert_audit_entry(&self, entry: &models::AuditEntry) -> Result<i64, DatabaseError> {
        self.insert_audit_log(&entry.action, Some(&entry.details), entry.success)
    }

    /// List recent audit-log entries, newest first.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    details: row.get(2)?,
                    success: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count total audit-log entries.
    pub fn count_audit_log(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Count audit entries that represent failures.
    pub fn count_errors(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE success = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- kv_state -----------------------------------------------------------

    /// Get a key-value state entry.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a key-value state entry (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = timestamp(Utc::now());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, "set kv_state");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

const SUBMISSION_SELECT: &str = "SELECT id, lab_id, group_id, sequence, tag, commit_hash, \
     problem_branch, message, detected_at FROM submissions";

const REQUEST_SELECT: &str = "SELECT id, submission_id, lab_id, group_id, status, grader, \
     thread_kind, thread_iid, thread_url, last_event_id, created_at, updated_at \
     FROM grading_requests";

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    let members: String = row.get(2)?;
    let members: Vec<String> = serde_json::from_str(&members).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Group {
        lab_id: row.get(0)?,
        id: row.get(1)?,
        members,
        project_path: row.get(3)?,
        active: row.get(4)?,
    })
}

fn submission_from_row(row: &Row<'_>) -> rusqlite::Result<Submission> {
    Ok(Submission {
        id: row.get(0)?,
        lab_id: row.get(1)?,
        group_id: row.get(2)?,
        sequence: row.get(3)?,
        tag: row.get(4)?,
        commit_hash: row.get(5)?,
        problem_branch: row.get(6)?,
        message: row.get(7)?,
        detected_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<GradingRequest> {
    Ok(GradingRequest {
        id: row.get(0)?,
        submission_id: row.get(1)?,
        lab_id: row.get(2)?,
        group_id: row.get(3)?,
        status: parse_status(row, 4)?,
        grader: row.get(5)?,
        thread: ThreadRef {
            kind: parse_kind(row, 6)?,
            iid: row.get::<_, i64>(7)? as u64,
            web_url: row.get(8)?,
        },
        last_event_id: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?),
        updated_at: parse_datetime(&row.get::<_, String>(11)?),
        history: Vec::new(),
    })
}

fn with_history(
    conn: &Connection,
    mut request: GradingRequest,
) -> Result<GradingRequest, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT status, actor, at FROM grading_history WHERE request_id = ?1 ORDER BY id",
    )?;
    request.history = stmt
        .query_map(params![request.id], |row| {
            Ok(StatusChange {
                status: parse_status(row, 0)?,
                actor: row.get(1)?,
                at: parse_datetime(&row.get::<_, String>(2)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(request)
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<GradingStatus> {
    let raw: String = row.get(idx)?;
    GradingStatus::from_str_val(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown grading status '{raw}'").into(),
        )
    })
}

fn parse_kind(row: &Row<'_>, idx: usize) -> rusqlite::Result<ThreadKind> {
    let raw: String = row.get(idx)?;
    ThreadKind::from_str_val(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown thread kind '{raw}'").into(),
        )
    })
}

fn mark_seen(
    conn: &Connection,
    lab_id: &str,
    group_id: &str,
    tag: &str,
    disposition: TagDisposition,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO seen_tags (lab_id, group_id, tag, disposition, seen_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![lab_id, group_id, tag, disposition.as_str(), timestamp(Utc::now())],
    )?;
    Ok(())
}

fn release_held(
    conn: &Connection,
    lab_id: &str,
    group_id: &str,
    tag: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM held_tags WHERE lab_id = ?1 AND group_id = ?2 AND tag = ?3",
        params![lab_id, group_id, tag],
    )?;
    Ok(())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn group(id: &str) -> Group {
        Group {
            lab_id: "lab1".into(),
            id: id.into(),
            members: vec!["alice".into(), "bob".into()],
            project_path: format!("course/groups/{id}/lab1"),
            active: true,
        }
    }

    fn thread() -> ThreadRef {
        ThreadRef {
            kind: ThreadKind::Issue,
            iid: 1,
            web_url: "https://git.example.edu/course/groups/g1/lab1/-/issues/1".into(),
        }
    }

    fn new_submission(db: &Database, tag: &str, commit: &str) -> Submission {
        match db
            .record_submission("lab1", "g1", tag, commit, "problem", None)
            .unwrap()
        {
            Recorded::New(s) => s,
            Recorded::Duplicate(_) => panic!("unexpected duplicate"),
        }
    }

    #[test]
    fn test_group_upsert_and_deactivate() {
        let db = setup_db();
        db.upsert_group(&group("g1")).unwrap();
        db.upsert_group(&group("g2")).unwrap();

        let mut changed = group("g1");
        changed.members.push("carol".into());
        db.upsert_group(&changed).unwrap();
        assert_eq!(db.get_group("lab1", "g1").unwrap().unwrap().members.len(), 3);

        let deactivated = db.deactivate_missing_groups("lab1", &["g1".into()]).unwrap();
        assert_eq!(deactivated, 1);
        assert_eq!(db.list_groups("lab1", true).unwrap().len(), 1);
        let all = db.list_groups("lab1", false).unwrap();
        assert_eq!(all.len(), 2);
        assert!(!all[1].active);
    }

    #[test]
    fn test_submission_sequence_and_dedup() {
        let db = setup_db();
        let first = new_submission(&db, "submission1", "aaa");
        let second = new_submission(&db, "submission2", "bbb");
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);

        let dup = db
            .record_submission("lab1", "g1", "submission2-again", "bbb", "problem", None)
            .unwrap();
        assert!(matches!(dup, Recorded::Duplicate(ref s) if s.id == second.id));

        let seen = db.seen_tags("lab1", "g1").unwrap();
        assert!(seen.contains("submission1"));
        assert!(seen.contains("submission2-again"));
        assert_eq!(db.list_submissions("lab1", "g1").unwrap().len(), 2);

        // Sequences are per group.
        let other = db
            .record_submission("lab1", "g2", "submission1", "aaa", "problem", None)
            .unwrap();
        assert!(matches!(other, Recorded::New(ref s) if s.sequence == 1));
    }

    #[test]
    fn test_held_tags_release_on_record() {
        let db = setup_db();
        assert_eq!(db.hold_tag("lab1", "g1", "submission1", "ccc").unwrap(), 1);
        assert_eq!(db.hold_tag("lab1", "g1", "submission1", "ccc").unwrap(), 2);
        assert_eq!(db.list_held_tags("lab1").unwrap().len(), 1);

        new_submission(&db, "submission1", "ccc");
        assert!(db.list_held_tags("lab1").unwrap().is_empty());
    }

    #[test]
    fn test_grading_request_history() {
        let db = setup_db();
        let sub = new_submission(&db, "submission1", "aaa");
        let req = db
            .insert_grading_request(&sub, &thread(), GradingStatus::AwaitingGrading, None)
            .unwrap();
        assert_eq!(req.history.len(), 1);
        assert_eq!(db.unregistered_submissions("lab1", "g1").unwrap().len(), 0);

        let later = Utc::now() + Duration::seconds(5);
        db.append_status_change(req.id, GradingStatus::Complete, Some("ta1"), Some("ta1"), later)
            .unwrap();
        // A change stamped in the past is clamped to the previous entry.
        let earlier = Utc::now() - Duration::hours(1);
        let stored = db
            .append_status_change(req.id, GradingStatus::AwaitingGrading, None, None, earlier)
            .unwrap();
        assert_eq!(stored.at, later.with_nanosecond_micros());

        let req = db.get_grading_request(req.id).unwrap();
        assert_eq!(req.status, GradingStatus::AwaitingGrading);
        assert_eq!(req.grader.as_deref(), Some("ta1"));
        assert_eq!(req.history.len(), 3);
        assert!(req.history.windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[test]
    fn test_status_change_checks_stored_status() {
        let db = setup_db();
        let sub = new_submission(&db, "submission1", "aaa");
        let req = db
            .insert_grading_request(&sub, &thread(), GradingStatus::AwaitingGrading, None)
            .unwrap();
        let ta = Some("ta1");
        db.append_status_change(req.id, GradingStatus::Complete, ta, ta, Utc::now())
            .unwrap();

        let err = db
            .append_status_change(req.id, GradingStatus::InProgress, ta, ta, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::InvalidTransition { ref from, ref to, .. }
                if from == "complete" && to == "in_progress"
        ));
        assert_eq!(db.get_grading_request(req.id).unwrap().history.len(), 2);
        assert!(matches!(
            db.append_status_change(999, GradingStatus::Complete, None, None, Utc::now()),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn test_latest_request_and_overview() {
        let db = setup_db();
        db.upsert_group(&Group {
            lab_id: "lab1".into(),
            id: "g1".into(),
            members: vec![],
            project_path: "p".into(),
            active: true,
        })
        .unwrap();
        let s1 = new_submission(&db, "submission1", "aaa");
        let s2 = new_submission(&db, "submission2", "bbb");
        db.insert_grading_request(&s1, &thread(), GradingStatus::AwaitingGrading, None)
            .unwrap();
        let r2 = db
            .insert_grading_request(&s2, &thread(), GradingStatus::AwaitingGrading, None)
            .unwrap();
        assert_eq!(db.latest_grading_request("lab1", "g1").unwrap().unwrap().id, r2.id);

        let rows = db.group_status_rows("lab1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].submissions, 2);
        assert_eq!(rows[0].latest_tag.as_deref(), Some("submission2"));
        assert_eq!(rows[0].status, GradingStatus::AwaitingGrading);
    }

    #[test]
    fn test_annotations_dedup_by_event() {
        let db = setup_db();
        let sub = new_submission(&db, "submission1", "aaa");
        let req = db
            .insert_grading_request(&sub, &thread(), GradingStatus::AwaitingGrading, None)
            .unwrap();
        assert!(db.schedule_annotation(req.id, "warning", Some(7)).unwrap());
        assert!(!db.schedule_annotation(req.id, "warning", Some(7)).unwrap());
        let pending = db.pending_annotations(req.id).unwrap();
        assert_eq!(pending.len(), 1);
        db.mark_annotation_posted(pending[0].id).unwrap();
        assert!(db.pending_annotations(req.id).unwrap().is_empty());
        assert_eq!(db.list_annotations(req.id).unwrap().len(), 1);
    }

    #[test]
    fn test_grading_thread_roundtrip() {
        let db = setup_db();
        assert!(db.get_grading_thread("lab1", "g1").unwrap().is_none());
        db.set_grading_thread("lab1", "g1", &thread()).unwrap();
        assert_eq!(db.get_grading_thread("lab1", "g1").unwrap(), Some(thread()));
    }

    #[test]
    fn test_audit_log() {
        let db = setup_db();
        db.insert_audit_log("poll", Some("2 groups"), true).unwrap();
        db.insert_audit_entry(&models::AuditEntry::failure("hotfix", "push rejected"))
            .unwrap();
        let entries = db.list_audit_log(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "hotfix");
        assert_eq!(db.count_audit_log().unwrap(), 2);
        assert_eq!(db.count_errors().unwrap(), 1);
    }

    #[test]
    fn test_kv_state() {
        let db = setup_db();
        assert!(db.get_state("foo").unwrap().is_none());
        db.set_state("foo", "bar").unwrap();
        assert_eq!(db.get_state("foo").unwrap().as_deref(), Some("bar"));
        db.set_state("foo", "baz").unwrap();
        assert_eq!(db.get_state("foo").unwrap().as_deref(), Some("baz"));
    }

    trait MicrosPrecision {
        fn with_nanosecond_micros(self) -> Self;
    }

    impl MicrosPrecision for DateTime<Utc> {
        fn with_nanosecond_micros(self) -> Self {
            parse_datetime(&timestamp(self))
        }
    }
}
