//! Domain model types used throughout labsync.
//!
//! These types bridge the poll engine, the database layer, the CLI and the
//! web API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// A student team working on one lab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub lab_id: String,
    pub id: String,
    /// Member usernames in roster order.
    pub members: Vec<String>,
    /// Forge path of the group's project.
    pub project_path: String,
    /// Deactivated groups are kept but no longer polled.
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Submissions
// ---------------------------------------------------------------------------

/// An immutable record of one submission tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Submission {
    pub id: i64,
    pub lab_id: String,
    pub group_id: String,
    /// Per-group detection order, starting at 1.
    pub sequence: i64,
    pub tag: String,
    pub commit_hash: String,
    /// Problem branch the submission was derived from.
    pub problem_branch: String,
    pub message: Option<String>,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Grading status
// ---------------------------------------------------------------------------

/// Review status of a group's submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GradingStatus {
    NoSubmission,
    AwaitingGrading,
    InProgress,
    Complete,
    Incomplete,
}

impl GradingStatus {
    /// Parse the stored string form.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "no_submission" => Some(Self::NoSubmission),
            "awaiting_grading" => Some(Self::AwaitingGrading),
            "in_progress" => Some(Self::InProgress),
            "complete" => Some(Self::Complete),
            "incomplete" => Some(Self::Incomplete),
            _ => None,
        }
    }

    /// Whether the transition graph allows moving from `self` to `next`.
    ///
    /// `awaiting_grading -> awaiting_grading` is allowed so that a grader
    /// can put the label back after removing it by mistake.
    pub fn can_transition_to(self, next: GradingStatus) -> bool {
        use GradingStatus::*;
        matches!(
            (self, next),
            (NoSubmission, AwaitingGrading)
                | (AwaitingGrading, AwaitingGrading)
                | (AwaitingGrading, InProgress)
                | (AwaitingGrading, Complete)
                | (AwaitingGrading, Incomplete)
                | (InProgress, Complete)
                | (InProgress, Incomplete)
                | (Complete, AwaitingGrading)
                | (Incomplete, AwaitingGrading)
        )
    }

    /// Complete or incomplete: the grader has finished with the submission.
    pub fn is_graded(self) -> bool {
        matches!(self, Self::Complete | Self::Incomplete)
    }
}

impl std::fmt::Display for GradingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSubmission => write!(f, "no_submission"),
            Self::AwaitingGrading => write!(f, "awaiting_grading"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Complete => write!(f, "complete"),
            Self::Incomplete => write!(f, "incomplete"),
        }
    }
}

// ---------------------------------------------------------------------------
// Grading requests
// ---------------------------------------------------------------------------

/// Kind of forge object used as a grading thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    MergeRequest,
    Issue,
}

impl ThreadKind {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "merge_request" => Some(Self::MergeRequest),
            "issue" => Some(Self::Issue),
            _ => None,
        }
    }
}

impl std::fmt::Display for ThreadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MergeRequest => write!(f, "merge_request"),
            Self::Issue => write!(f, "issue"),
        }
    }
}

/// Reference to a merge request or issue on the forge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadRef {
    pub kind: ThreadKind,
    /// Project-scoped id (`iid` in GitLab terms).
    pub iid: u64,
    pub web_url: String,
}

/// One entry of a grading request's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusChange {
    pub status: GradingStatus,
    pub actor: Option<String>,
    pub at: DateTime<Utc>,
}

/// Review lifecycle of one submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GradingRequest {
    pub id: i64,
    pub submission_id: i64,
    pub lab_id: String,
    pub group_id: String,
    pub status: GradingStatus,
    pub grader: Option<String>,
    pub thread: ThreadRef,
    /// Forge id of the last label event this request has seen.
    pub last_event_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StatusChange>,
}

// ---------------------------------------------------------------------------
// Label observations
// ---------------------------------------------------------------------------

/// Whether a label event added or removed the label.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LabelAction {
    Add,
    Remove,
}

/// One label change as recorded by the forge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelEvent {
    pub id: i64,
    pub actor: String,
    pub label: String,
    pub action: LabelAction,
    pub created_at: DateTime<Utc>,
}

/// Label state of a grading thread as read in one poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelObservation {
    /// Labels currently on the thread.
    pub labels: Vec<String>,
    /// The most recent event on a tracked label, if any.
    pub last_event: Option<LabelEvent>,
}

/// A warning scheduled for a grading thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Annotation {
    pub id: i64,
    pub request_id: i64,
    pub body: String,
    /// The label event that triggered the annotation, used for dedup.
    pub event_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Hotfix
// ---------------------------------------------------------------------------

/// Result of propagating a hotfix into one group's branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HotfixOutcome {
    AppliedClean { commit: String },
    AlreadyApplied,
    Conflict { paths: Vec<String> },
    Failed { error: String },
}

impl HotfixOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AppliedClean { .. } => "applied-clean",
            Self::AlreadyApplied => "already-applied",
            Self::Conflict { .. } => "conflict",
            Self::Failed { .. } => "failed",
        }
    }
}

/// One group's hotfix result. Not persisted beyond the run's report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HotfixAttempt {
    pub group_id: String,
    pub hotfix_branch: String,
    pub outcome: HotfixOutcome,
}

/// Summary of one hotfix run across all selected groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotfixReport {
    pub lab_id: String,
    pub hotfix_branch: String,
    pub problem_branch: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: Vec<HotfixAttempt>,
}

impl HotfixReport {
    /// `(applied, already_applied, conflicts, failed)`.
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        for attempt in &self.attempts {
            match attempt.outcome {
                HotfixOutcome::AppliedClean { .. } => counts.0 += 1,
                HotfixOutcome::AlreadyApplied => counts.1 += 1,
                HotfixOutcome::Conflict { .. } => counts.2 += 1,
                HotfixOutcome::Failed { .. } => counts.3 += 1,
            }
        }
        counts
    }

    pub fn attempt(&self, group_id: &str) -> Option<&HotfixAttempt> {
        self.attempts.iter().find(|a| a.group_id == group_id)
    }
}

// ---------------------------------------------------------------------------
// Poll cycle reports
// ---------------------------------------------------------------------------

/// What happened to one group during one poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupOutcome {
    pub lab_id: String,
    pub group_id: String,
    /// Tags recorded as new submissions.
    pub new_submissions: Vec<String>,
    /// Submission ids registered with a grading request.
    pub registered: Vec<i64>,
    /// Submission ids whose registration waits for an active review.
    pub deferred: Vec<i64>,
    pub status_changes: Vec<(i64, GradingStatus)>,
    /// Tags held back because their lineage is unresolved.
    pub held_back: Vec<String>,
    pub warnings: Vec<String>,
    /// Set when the group was skipped for this cycle.
    pub error: Option<String>,
}

impl GroupOutcome {
    pub fn new(lab_id: &str, group_id: &str) -> Self {
        Self {
            lab_id: lab_id.to_string(),
            group_id: group_id.to_string(),
            ..Self::default()
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.new_submissions.is_empty()
            && self.registered.is_empty()
            && self.status_changes.is_empty()
            && self.warnings.is_empty()
            && self.error.is_none()
    }
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub groups: Vec<GroupOutcome>,
    /// True when shutdown was requested before all groups were visited.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn new_submissions(&self) -> usize {
        self.groups.iter().map(|g| g.new_submissions.len()).sum()
    }

    pub fn failed_groups(&self) -> usize {
        self.groups.iter().filter(|g| g.error.is_some()).count()
    }

    pub fn group(&self, lab_id: &str, group_id: &str) -> Option<&GroupOutcome> {
        self.groups
            .iter()
            .find(|g| g.lab_id == lab_id && g.group_id == group_id)
    }
}

// ---------------------------------------------------------------------------
// Status overview
// ---------------------------------------------------------------------------

/// One row of the per-lab status overview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatusRow {
    pub group_id: String,
    pub active: bool,
    pub submissions: i64,
    pub latest_tag: Option<String>,
    pub status: GradingStatus,
    pub grader: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: false,
            timestamp: Utc::now(),
        }
    }
}
