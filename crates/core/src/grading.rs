//! Grading state machine.
//!
//! Every submission gets a grading request; all requests of a group share
//! one forge thread (a merge request or an issue) whose status label is the
//! grader's interface. Registration writes the label, and reconciliation
//! reads it back:
//!
//! ```text
//! no_submission -> awaiting_grading -> in_progress -> complete | incomplete
//!                        |  ^                               |
//!                        |  +-------------------------------+
//!                        +-> complete | incomplete
//! ```
//!
//! Reconciliation is level-triggered: it looks at the labels present now
//! and the most recent label event, so states a grader passes through
//! between two polls are never seen.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::{GradingConfig, GradingMode, LabConfig};
use crate::db::Database;
use crate::errors::{DatabaseError, GitError, GradingError};
use crate::forge::{Forge, NewThread};
use crate::git::remote_url::tag_web_url;
use crate::git::RemoteRepository;
use crate::models::{
    GradingRequest, GradingStatus, Group, LabelAction, LabelObservation, Submission, ThreadKind,
    ThreadRef,
};
use crate::roster::GraderSet;

/// The group a grading operation is about.
#[derive(Debug, Clone, Copy)]
pub struct GradingTarget<'a> {
    pub lab: &'a LabConfig,
    pub group: &'a Group,
}

impl GradingTarget<'_> {
    fn project(&self) -> &str {
        &self.group.project_path
    }
}

/// Result of [`GradingMachine::register`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "registration", rename_all = "snake_case")]
pub enum Registration {
    /// A new grading request was opened.
    Created(GradingRequest),
    /// The submission already had a request.
    Existing(GradingRequest),
    /// A grader is still reviewing an earlier submission.
    Deferred { blocking_request: i64 },
}

/// Result of [`GradingMachine::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Unchanged,
    Applied(GradingStatus),
    /// Someone outside the grader set edited the labels.
    Rejected { actor: String },
    /// Several status labels and no way to tell which is meant.
    Ambiguous,
}

/// Drives grading requests through their lifecycle.
pub struct GradingMachine {
    db: Arc<Database>,
    forge: Arc<dyn Forge>,
    config: GradingConfig,
    api_url: String,
    token: Option<String>,
}

impl GradingMachine {
    pub fn new(
        db: Arc<Database>,
        forge: Arc<dyn Forge>,
        config: GradingConfig,
        api_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            db,
            forge,
            config,
            api_url: api_url.into(),
            token,
        }
    }

    fn thread_kind(&self) -> ThreadKind {
        match self.config.mode {
            GradingMode::MergeRequest => ThreadKind::MergeRequest,
            GradingMode::Issue => ThreadKind::Issue,
        }
    }

    pub fn label_for(&self, status: GradingStatus) -> Option<&str> {
        match status {
            GradingStatus::NoSubmission => None,
            GradingStatus::AwaitingGrading => Some(&self.config.awaiting_label),
            GradingStatus::InProgress => Some(&self.config.in_progress_label),
            GradingStatus::Complete => Some(&self.config.complete_label),
            GradingStatus::Incomplete => Some(&self.config.incomplete_label),
        }
    }

    pub fn status_for(&self, label: &str) -> Option<GradingStatus> {
        [
            GradingStatus::AwaitingGrading,
            GradingStatus::InProgress,
            GradingStatus::Complete,
            GradingStatus::Incomplete,
        ]
        .into_iter()
        .find(|s| self.label_for(*s) == Some(label))
    }

    /// Labels of a grading thread and the latest change to a status label.
    pub async fn observe(
        &self,
        project: &str,
        thread: &ThreadRef,
    ) -> Result<LabelObservation, GradingError> {
        let tracked = self.config.status_labels();
        Ok(self.forge.label_state(project, thread, &tracked).await?)
    }

    /// Status of the group's latest request, or `NoSubmission`.
    pub fn current_status(
        &self,
        lab_id: &str,
        group_id: &str,
    ) -> Result<GradingStatus, GradingError> {
        Ok(self
            .db
            .latest_grading_request(lab_id, group_id)?
            .map(|r| r.status)
            .unwrap_or(GradingStatus::NoSubmission))
    }

    /// The grading request of a submission.
    pub fn request_for(&self, submission_id: i64) -> Result<GradingRequest, GradingError> {
        self.db
            .grading_request_for_submission(submission_id)?
            .ok_or(GradingError::NotRegistered(submission_id))
    }

    // -- registration -------------------------------------------------------

    /// Open a grading request for `submission`.
    ///
    /// In merge-request mode the submission commit is first published to the
    /// submission branch through `repo`, so the merge request shows it.
    #[instrument(
        skip_all,
        fields(lab = %target.lab.id, group = %target.group.id, tag = %submission.tag)
    )]
    pub async fn register(
        &self,
        target: GradingTarget<'_>,
        submission: &Submission,
        repo: Option<&mut RemoteRepository>,
    ) -> Result<Registration, GradingError> {
        if let Some(existing) = self.db.grading_request_for_submission(submission.id)? {
            debug!(request = existing.id, "submission already registered");
            return Ok(Registration::Existing(existing));
        }

        let latest = self
            .db
            .latest_grading_request(&target.lab.id, &target.group.id)?;
        let mut superseded = None;
        if let Some(latest) = latest.filter(|r| r.status == GradingStatus::InProgress) {
            if !self.reserve_expired(&latest, Utc::now()) {
                info!(
                    blocking_request = latest.id,
                    "grader is reviewing an earlier submission, deferring"
                );
                return Ok(Registration::Deferred {
                    blocking_request: latest.id,
                });
            }
            superseded = Some(latest);
        }

        if self.config.mode == GradingMode::MergeRequest {
            match repo {
                Some(repo) => self.publish(repo, submission)?,
                None => warn!("no mirror available, submission branch not updated"),
            }
        }

        let thread = self.ensure_thread(target, submission).await?;
        let project = target.project();

        let awaiting = self.config.awaiting_label.clone();
        let remove: Vec<String> = self
            .config
            .status_labels()
            .iter()
            .filter(|l| **l != awaiting)
            .map(|l| l.to_string())
            .collect();
        self.forge
            .edit_labels(project, &thread, &[awaiting], &remove)
            .await?;

        let request = self.db.insert_grading_request(
            submission,
            &thread,
            GradingStatus::AwaitingGrading,
            None,
        )?;

        // The announcement goes through the outbox so that a failed post is
        // retried by a later flush instead of being written twice.
        let mut note = self.announcement(target, submission);
        if let Some(old) = &superseded {
            note.push_str(&format!(
                "\n\nThe review of the previous submission{} exceeded the reservation \
                 time and has been re-opened for this submission.",
                old.grader
                    .as_deref()
                    .map(|g| format!(" by @{g}"))
                    .unwrap_or_default()
            ));
        }
        self.db.schedule_annotation(request.id, &note, None)?;

        // Our own label edits are now the latest events; start reading
        // grader decisions after them.
        let observation = self.observe(project, &thread).await?;
        if let Some(event) = observation.last_event {
            self.db.set_last_event_id(request.id, event.id)?;
        }

        info!(request = request.id, iid = thread.iid, "registered grading request");
        let request = self.db.get_grading_request(request.id)?;
        self.flush_annotations(target, &request).await?;
        Ok(Registration::Created(request))
    }

    fn reserve_expired(&self, request: &GradingRequest, now: DateTime<Utc>) -> bool {
        let Some(max) = self.config.maximum_reserve_secs else {
            return false;
        };
        let since = request
            .history
            .iter()
            .rev()
            .find(|h| h.status == GradingStatus::InProgress)
            .map(|h| h.at)
            .unwrap_or(request.updated_at);
        (now - since).num_seconds() >= max as i64
    }

    fn publish(
        &self,
        repo: &mut RemoteRepository,
        submission: &Submission,
    ) -> Result<(), GitError> {
        let commit = repo.resolve(&submission.commit_hash)?;
        repo.publish(commit, &self.config.submission_branch, self.token.as_deref())
    }

    /// The group's thread: from the database, else an open one on the
    /// forge with the expected title, else a new one.
    async fn ensure_thread(
        &self,
        target: GradingTarget<'_>,
        submission: &Submission,
    ) -> Result<ThreadRef, GradingError> {
        if let Some(thread) = self
            .db
            .get_grading_thread(&target.lab.id, &target.group.id)?
        {
            return Ok(thread);
        }

        let kind = self.thread_kind();
        let title = self.config.title_for(&target.group.id, target.lab.display_name());
        let thread = match self.forge.find_thread(target.project(), kind, &title).await? {
            Some(thread) => {
                info!(iid = thread.iid, "adopting existing grading thread");
                thread
            }
            None => {
                let new = NewThread {
                    kind,
                    title,
                    description: self.description(target),
                    source_branch: self.config.submission_branch.clone(),
                    target_branch: submission.problem_branch.clone(),
                    labels: Vec::new(),
                };
                self.forge.create_thread(target.project(), &new).await?
            }
        };
        self.db
            .set_grading_thread(&target.lab.id, &target.group.id, &thread)?;
        Ok(thread)
    }

    fn description(&self, target: GradingTarget<'_>) -> String {
        let members = if target.group.members.is_empty() {
            "(none)".to_string()
        } else {
            target
                .group
                .members
                .iter()
                .map(|m| format!("@{m}"))
                .collect::<Vec<_>>()
                .join(" ")
        };
        format!(
            "Grading of group {} on {}.\n\nMembers: {}\n\n\
             Graders: set `{}` while reviewing, then `{}` or `{}`.",
            target.group.id,
            target.lab.display_name(),
            members,
            self.config.in_progress_label,
            self.config.complete_label,
            self.config.incomplete_label,
        )
    }

    fn announcement(&self, target: GradingTarget<'_>, submission: &Submission) -> String {
        let short = &submission.commit_hash[..submission.commit_hash.len().min(8)];
        let mut note = format!(
            "New submission [`{}`]({}) at commit `{}`, based on problem branch `{}`.",
            submission.tag,
            tag_web_url(&self.api_url, target.project(), &submission.tag),
            short,
            submission.problem_branch,
        );
        let message = submission.message.as_deref().filter(|m| !m.trim().is_empty());
        if let Some(message) = message {
            note.push_str("\n\n");
            for line in message.lines() {
                note.push_str("> ");
                note.push_str(line);
                note.push('\n');
            }
        }
        note
    }

    // -- reconciliation -----------------------------------------------------

    /// Bring `request` in line with the labels observed on its thread.
    ///
    /// An observation whose latest event was already handled is a no-op.
    /// On an invalid transition the event is still marked as handled so
    /// the same error is not reported on every poll.
    #[instrument(skip_all, fields(request = request.id))]
    pub fn reconcile(
        &self,
        request: &GradingRequest,
        observation: &LabelObservation,
        graders: &GraderSet,
    ) -> Result<ReconcileOutcome, GradingError> {
        let Some(event) = &observation.last_event else {
            return Ok(ReconcileOutcome::Unchanged);
        };
        if request.last_event_id == Some(event.id) || self.status_for(&event.label).is_none() {
            return Ok(ReconcileOutcome::Unchanged);
        }

        if graders.is_system(&event.actor) {
            debug!(actor = %event.actor, "bookkeeping label change");
            self.db.set_last_event_id(request.id, event.id)?;
            return Ok(ReconcileOutcome::Unchanged);
        }

        if !graders.is_grader(&event.actor) {
            warn!(actor = %event.actor, label = %event.label, "label change by non-grader ignored");
            let body = format!(
                "@{} changed the label `{}`, but only graders can change the grading status. \
                 The status stays `{}`.",
                event.actor, event.label, request.status
            );
            self.db.schedule_annotation(request.id, &body, Some(event.id))?;
            self.db.set_last_event_id(request.id, event.id)?;
            return Ok(ReconcileOutcome::Rejected {
                actor: event.actor.clone(),
            });
        }

        let present: Vec<GradingStatus> = observation
            .labels
            .iter()
            .filter_map(|l| self.status_for(l))
            .collect();
        let observed = match present.as_slice() {
            [] => None,
            [only] => Some(*only),
            _ => {
                let latest = (event.action == LabelAction::Add)
                    .then(|| self.status_for(&event.label))
                    .flatten()
                    .filter(|s| present.contains(s));
                if latest.is_none() {
                    warn!(labels = ?observation.labels, "several grading labels present");
                    let body = format!(
                        "Several grading labels are present ({}). The status stays `{}`; \
                         please keep exactly one.",
                        observation.labels.join(", "),
                        request.status
                    );
                    self.db.schedule_annotation(request.id, &body, Some(event.id))?;
                    self.db.set_last_event_id(request.id, event.id)?;
                    return Ok(ReconcileOutcome::Ambiguous);
                }
                latest
            }
        };

        self.db.set_last_event_id(request.id, event.id)?;
        let Some(observed) = observed.filter(|s| *s != request.status) else {
            return Ok(ReconcileOutcome::Unchanged);
        };

        self.transition(request, observed, Some(&event.actor), event.created_at)?;
        info!(
            from = %request.status,
            to = %observed,
            grader = %event.actor,
            "grading status changed"
        );
        Ok(ReconcileOutcome::Applied(observed))
    }

    /// Record a grading decision directly.
    pub fn record_outcome(
        &self,
        request: &GradingRequest,
        status: GradingStatus,
        grader: Option<&str>,
    ) -> Result<GradingRequest, GradingError> {
        self.transition(request, status, grader, Utc::now())?;
        Ok(self.db.get_grading_request(request.id)?)
    }

    /// Validated against the stored status, not the caller's copy, so a
    /// stale request cannot record a change the graph forbids.
    fn transition(
        &self,
        request: &GradingRequest,
        status: GradingStatus,
        actor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), GradingError> {
        let grader = actor.filter(|_| status != GradingStatus::AwaitingGrading);
        match self
            .db
            .append_status_change(request.id, status, actor, grader, at)
        {
            Ok(_) => Ok(()),
            Err(DatabaseError::InvalidTransition { from, to, .. }) => {
                Err(GradingError::InvalidTransition { from, to })
            }
            Err(e) => Err(e.into()),
        }
    }

    // -- thread upkeep ------------------------------------------------------

    /// Post scheduled annotations as notes. Returns how many were posted.
    pub async fn flush_annotations(
        &self,
        target: GradingTarget<'_>,
        request: &GradingRequest,
    ) -> Result<usize, GradingError> {
        let pending = self.db.pending_annotations(request.id)?;
        for annotation in &pending {
            self.forge
                .post_note(target.project(), &request.thread, &annotation.body)
                .await?;
            self.db.mark_annotation_posted(annotation.id)?;
        }
        if !pending.is_empty() {
            debug!(request = request.id, count = pending.len(), "posted annotations");
        }
        Ok(pending.len())
    }

    /// Rewrite the thread description so member mentions follow the roster.
    /// Returns `false` when the group has no thread yet.
    pub async fn refresh_description(
        &self,
        target: GradingTarget<'_>,
    ) -> Result<bool, GradingError> {
        let Some(thread) = self
            .db
            .get_grading_thread(&target.lab.id, &target.group.id)?
        else {
            return Ok(false);
        };
        self.forge
            .update_description(target.project(), &thread, &self.description(target))
            .await?;
        debug!(group = %target.group.id, "refreshed thread description");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::MemoryForge;
    use crate::models::{Annotation, LabelEvent};

    struct Setup {
        db: Arc<Database>,
        forge: Arc<MemoryForge>,
        machine: GradingMachine,
        lab: LabConfig,
        group: Group,
        graders: GraderSet,
    }

    fn setup(reserve: Option<u64>) -> Setup {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let forge = Arc::new(MemoryForge::new("labsync"));
        let config = GradingConfig {
            mode: GradingMode::Issue,
            maximum_reserve_secs: reserve,
            ..GradingConfig::default()
        };
        let machine = GradingMachine::new(
            Arc::clone(&db),
            forge.clone() as Arc<dyn Forge>,
            config,
            "https://forge.test/api/v4",
            None,
        );
        let lab = LabConfig {
            id: "lab1".into(),
            name: None,
            enabled: true,
            primary_project: "c/lab1".into(),
            group_namespace: "c/groups".into(),
            problem_branches: vec!["problem".into()],
            main_branch: "main".into(),
            submission_tag_prefix: "submission".into(),
        };
        let group = Group {
            lab_id: "lab1".into(),
            id: "g1".into(),
            members: vec!["alice".into(), "bob".into()],
            project_path: "c/groups/g1/lab1".into(),
            active: true,
        };
        db.upsert_group(&group).unwrap();
        Setup {
            db,
            forge,
            machine,
            lab,
            group,
            graders: GraderSet::new(["ta1"], ["labsync"]),
        }
    }

    impl Setup {
        fn target(&self) -> GradingTarget<'_> {
            GradingTarget {
                lab: &self.lab,
                group: &self.group,
            }
        }

        fn submission(&self, tag: &str, commit: &str) -> Submission {
            match self
                .db
                .record_submission("lab1", "g1", tag, commit, "problem", Some("please grade"))
                .unwrap()
            {
                crate::db::queries::Recorded::New(s) => s,
                other => panic!("unexpected {other:?}"),
            }
        }

        async fn register(&self, submission: &Submission) -> Registration {
            self.machine
                .register(self.target(), submission, None)
                .await
                .unwrap()
        }

        async fn created(&self, submission: &Submission) -> GradingRequest {
            match self.register(submission).await {
                Registration::Created(r) => r,
                other => panic!("expected created, got {other:?}"),
            }
        }

        async fn observe(&self, request: &GradingRequest) -> LabelObservation {
            self.machine
                .observe(&self.group.project_path, &request.thread)
                .await
                .unwrap()
        }

        fn relabel(&self, request: &GradingRequest, actor: &str, from: &str, to: &str) {
            self.forge
                .relabel(&self.group.project_path, &request.thread, actor, from, to)
                .unwrap();
        }

        async fn reconcile(&self, request_id: i64) -> ReconcileOutcome {
            let request = self.db.get_grading_request(request_id).unwrap();
            let observation = self.observe(&request).await;
            self.machine
                .reconcile(&request, &observation, &self.graders)
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_register_opens_thread_and_awaits_grading() {
        let s = setup(Some(3600));
        let sub = s.submission("submission1", "abcdef1234");
        let request = s.created(&sub).await;

        assert_eq!(request.status, GradingStatus::AwaitingGrading);
        assert_eq!(request.history.len(), 1);
        assert!(request.last_event_id.is_some());

        let thread = s.forge.thread("c/groups/g1/lab1", &request.thread).unwrap();
        assert_eq!(thread.title, "Grading for g1 on lab1");
        assert!(thread.description.contains("@alice @bob"));
        assert_eq!(thread.labels, vec!["waiting-for-grading"]);
        assert_eq!(thread.notes.len(), 1);
        assert!(thread.notes[0].contains("submission1"));
        assert!(thread.notes[0].contains("> please grade"));
        assert_eq!(
            s.machine.current_status("lab1", "g1").unwrap(),
            GradingStatus::AwaitingGrading
        );
    }

    #[tokio::test]
    async fn test_register_twice_returns_same_request() {
        let s = setup(Some(3600));
        let sub = s.submission("submission1", "abc");
        let first = s.created(&sub).await;
        match s.register(&sub).await {
            Registration::Existing(again) => {
                assert_eq!(again.id, first.id);
                assert_eq!(again.history.len(), 1);
            }
            other => panic!("expected existing, got {other:?}"),
        }
        assert_eq!(s.forge.threads("c/groups/g1/lab1").len(), 1);
    }

    #[tokio::test]
    async fn test_grader_label_is_applied() {
        let s = setup(Some(3600));
        let sub = s.submission("submission1", "abc");
        let request = s.created(&sub).await;

        s.relabel(&request, "ta1", "waiting-for-grading", "complete");
        assert_eq!(
            s.reconcile(request.id).await,
            ReconcileOutcome::Applied(GradingStatus::Complete)
        );
        let after = s.db.get_grading_request(request.id).unwrap();
        assert_eq!(after.status, GradingStatus::Complete);
        assert_eq!(after.grader.as_deref(), Some("ta1"));
        assert_eq!(after.history.len(), 2);

        // Same observation again is a no-op.
        assert_eq!(s.reconcile(request.id).await, ReconcileOutcome::Unchanged);
        assert_eq!(s.db.get_grading_request(request.id).unwrap().history.len(), 2);
    }

    #[tokio::test]
    async fn test_unrelated_label_does_not_hide_grader_decision() {
        let s = setup(Some(3600));
        let sub = s.submission("submission1", "abc");
        let request = s.created(&sub).await;

        s.relabel(&request, "ta1", "waiting-for-grading", "complete");
        s.forge
            .add_label(&s.group.project_path, &request.thread, "alice", "question")
            .unwrap();
        assert_eq!(
            s.reconcile(request.id).await,
            ReconcileOutcome::Applied(GradingStatus::Complete)
        );
        assert_eq!(s.reconcile(request.id).await, ReconcileOutcome::Unchanged);

        let after = s.db.get_grading_request(request.id).unwrap();
        assert_eq!(after.status, GradingStatus::Complete);
        let annotations = s.db.list_annotations(request.id).unwrap();
        assert!(annotations.iter().all(|a| a.event_id.is_none()));
    }

    #[tokio::test]
    async fn test_non_grader_label_is_rejected_once() {
        let s = setup(Some(3600));
        let sub = s.submission("submission1", "abc");
        let request = s.created(&sub).await;
        s.relabel(&request, "ta1", "waiting-for-grading", "complete");
        s.reconcile(request.id).await;

        s.relabel(&request, "alice", "complete", "incomplete");
        assert_eq!(
            s.reconcile(request.id).await,
            ReconcileOutcome::Rejected {
                actor: "alice".into()
            }
        );
        assert_eq!(s.reconcile(request.id).await, ReconcileOutcome::Unchanged);

        let after = s.db.get_grading_request(request.id).unwrap();
        assert_eq!(after.status, GradingStatus::Complete);
        let warnings: Vec<Annotation> = s
            .db
            .list_annotations(request.id)
            .unwrap()
            .into_iter()
            .filter(|a| a.event_id.is_some())
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].body.contains("@alice"));

        assert_eq!(s.machine.flush_annotations(s.target(), &after).await.unwrap(), 1);
        assert_eq!(s.machine.flush_annotations(s.target(), &after).await.unwrap(), 0);
        let notes = s.forge.thread(&s.group.project_path, &after.thread).unwrap().notes;
        assert!(notes.last().unwrap().contains("only graders"));
    }

    #[tokio::test]
    async fn test_system_user_edit_is_bookkeeping() {
        let s = setup(Some(3600));
        let sub = s.submission("submission1", "abc");
        let request = s.created(&sub).await;
        let mut observation = s.observe(&request).await;
        observation.last_event = Some(LabelEvent {
            id: 999,
            actor: "labsync".into(),
            label: "complete".into(),
            action: LabelAction::Add,
            created_at: Utc::now(),
        });
        observation.labels = vec!["complete".into()];
        assert_eq!(
            s.machine.reconcile(&request, &observation, &s.graders).unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(
            s.db.get_grading_request(request.id).unwrap().status,
            GradingStatus::AwaitingGrading
        );
    }

    #[tokio::test]
    async fn test_multiple_labels_latest_add_wins() {
        let s = setup(Some(3600));
        let sub = s.submission("submission1", "abc");
        let request = s.created(&sub).await;
        s.forge
            .add_label(&s.group.project_path, &request.thread, "ta1", "grading")
            .unwrap();
        assert_eq!(
            s.reconcile(request.id).await,
            ReconcileOutcome::Applied(GradingStatus::InProgress)
        );

        // A grader removes a stale label, leaving two: ambiguous.
        s.forge
            .add_label(&s.group.project_path, &request.thread, "ta1", "complete")
            .unwrap();
        s.forge
            .remove_label(&s.group.project_path, &request.thread, "ta1", "waiting-for-grading")
            .unwrap();
        assert_eq!(s.reconcile(request.id).await, ReconcileOutcome::Ambiguous);
        assert_eq!(
            s.db.get_grading_request(request.id).unwrap().status,
            GradingStatus::InProgress
        );

        s.forge
            .remove_label(&s.group.project_path, &request.thread, "ta1", "complete")
            .unwrap();
        s.forge
            .add_label(&s.group.project_path, &request.thread, "ta1", "complete")
            .unwrap();
        assert_eq!(
            s.reconcile(request.id).await,
            ReconcileOutcome::Applied(GradingStatus::Complete)
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_is_reported_once() {
        let s = setup(Some(3600));
        let sub = s.submission("submission1", "abc");
        let request = s.created(&sub).await;
        s.relabel(&request, "ta1", "waiting-for-grading", "complete");
        s.reconcile(request.id).await;

        s.relabel(&request, "ta1", "complete", "grading");
        let request = s.db.get_grading_request(request.id).unwrap();
        let observation = s.observe(&request).await;
        assert!(matches!(
            s.machine.reconcile(&request, &observation, &s.graders),
            Err(GradingError::InvalidTransition { .. })
        ));
        let request = s.db.get_grading_request(request.id).unwrap();
        assert_eq!(
            s.machine.reconcile(&request, &observation, &s.graders).unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(request.status, GradingStatus::Complete);
    }

    #[tokio::test]
    async fn test_resubmission_during_review_is_deferred() {
        let s = setup(None);
        let first = s.submission("submission1", "abc");
        let request = s.created(&first).await;
        s.relabel(&request, "ta1", "waiting-for-grading", "grading");
        s.reconcile(request.id).await;

        let second = s.submission("submission2", "def");
        assert_eq!(
            s.register(&second).await,
            Registration::Deferred {
                blocking_request: request.id
            }
        );

        s.relabel(&request, "ta1", "grading", "incomplete");
        s.reconcile(request.id).await;
        let next = s.created(&second).await;
        assert_eq!(next.thread, request.thread);
        assert_eq!(
            s.machine.current_status("lab1", "g1").unwrap(),
            GradingStatus::AwaitingGrading
        );
        let labels = s.forge.thread(&s.group.project_path, &next.thread).unwrap().labels;
        assert_eq!(labels, vec!["waiting-for-grading"]);
    }

    #[tokio::test]
    async fn test_expired_reserve_reopens() {
        let s = setup(Some(0));
        let first = s.submission("submission1", "abc");
        let request = s.created(&first).await;
        s.relabel(&request, "ta1", "waiting-for-grading", "grading");
        s.reconcile(request.id).await;

        let second = s.submission("submission2", "def");
        let next = s.created(&second).await;
        assert_ne!(next.id, request.id);
        let notes = s.forge.thread(&s.group.project_path, &next.thread).unwrap().notes;
        assert!(notes.last().unwrap().contains("re-opened"));
        assert!(notes.last().unwrap().contains("@ta1"));
    }

    #[tokio::test]
    async fn test_record_outcome_validates_and_appends() {
        let s = setup(Some(3600));
        let sub = s.submission("submission1", "abc");
        let request = s.created(&sub).await;

        let graded = s
            .machine
            .record_outcome(&request, GradingStatus::Incomplete, Some("ta1"))
            .unwrap();
        assert_eq!(graded.status, GradingStatus::Incomplete);
        assert!(graded.history.windows(2).all(|w| w[0].at <= w[1].at));

        assert!(matches!(
            s.machine.record_outcome(&graded, GradingStatus::Complete, Some("ta1")),
            Err(GradingError::InvalidTransition { .. })
        ));
        assert!(matches!(
            s.machine.request_for(12345),
            Err(GradingError::NotRegistered(12345))
        ));
    }

    #[tokio::test]
    async fn test_stale_request_cannot_skip_the_graph() {
        let s = setup(Some(3600));
        let sub = s.submission("submission1", "abc");
        let snapshot = s.created(&sub).await;

        s.machine
            .record_outcome(&snapshot, GradingStatus::Complete, Some("ta1"))
            .unwrap();
        assert!(matches!(
            s.machine.record_outcome(&snapshot, GradingStatus::Incomplete, Some("ta1")),
            Err(GradingError::InvalidTransition { ref from, ref to })
                if from == "complete" && to == "incomplete"
        ));
        let stored = s.db.get_grading_request(snapshot.id).unwrap();
        let statuses: Vec<GradingStatus> = stored.history.iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![GradingStatus::AwaitingGrading, GradingStatus::Complete]
        );
    }

    #[tokio::test]
    async fn test_failed_announcement_is_posted_once_later() {
        let s = setup(Some(3600));
        let sub = s.submission("submission1", "abc");
        s.forge.set_notes_broken(true);
        assert!(s.machine.register(s.target(), &sub, None).await.is_err());

        let request = s.machine.request_for(sub.id).unwrap();
        assert_eq!(s.db.pending_annotations(request.id).unwrap().len(), 1);
        let thread = s.forge.thread(&s.group.project_path, &request.thread).unwrap();
        assert!(thread.notes.is_empty());

        s.forge.set_notes_broken(false);
        assert!(matches!(s.register(&sub).await, Registration::Existing(_)));
        assert_eq!(s.machine.flush_annotations(s.target(), &request).await.unwrap(), 1);
        assert_eq!(s.machine.flush_annotations(s.target(), &request).await.unwrap(), 0);
        let notes = s.forge.thread(&s.group.project_path, &request.thread).unwrap().notes;
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("submission1"));
    }

    #[tokio::test]
    async fn test_refresh_description_follows_roster() {
        let mut s = setup(Some(3600));
        assert!(!s.machine.refresh_description(s.target()).await.unwrap());

        let sub = s.submission("submission1", "abc");
        let request = s.created(&sub).await;
        s.group.members.push("carol".into());
        assert!(s.machine.refresh_description(s.target()).await.unwrap());
        let thread = s.forge.thread(&s.group.project_path, &request.thread).unwrap();
        assert!(thread.description.contains("@carol"));
    }

    #[tokio::test]
    async fn test_existing_open_thread_is_adopted() {
        let s = setup(Some(3600));
        let existing = s
            .forge
            .create_thread(
                &s.group.project_path,
                &NewThread {
                    kind: ThreadKind::Issue,
                    title: "Grading for g1 on lab1".into(),
                    description: String::new(),
                    source_branch: String::new(),
                    target_branch: String::new(),
                    labels: Vec::new(),
                },
            )
            .await
            .unwrap();
        let sub = s.submission("submission1", "abc");
        let request = s.created(&sub).await;
        assert_eq!(request.thread, existing);
    }

    #[test]
    fn test_label_mapping() {
        let s = setup(Some(3600));
        assert_eq!(s.machine.status_for("grading"), Some(GradingStatus::InProgress));
        assert_eq!(s.machine.status_for("bug"), None);
        assert_eq!(s.machine.label_for(GradingStatus::Complete), Some("complete"));
        assert_eq!(s.machine.label_for(GradingStatus::NoSubmission), None);
    }
}
