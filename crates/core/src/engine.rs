//! Poll engine.
//!
//! One poll cycle walks every selected lab and, group by group, turns new
//! tags into submissions, submissions into grading requests and grader
//! labels into status changes:
//!
//! 1. Resolve the bot account and grader set (authentication failures abort
//!    the cycle).
//! 2. Sync the lab roster.
//! 3. Per active group: fetch the mirror, list submission tags, record new
//!    submissions, reconcile the latest grading request, register pending
//!    submissions and post scheduled annotations.
//! 4. Store a cycle summary and an audit entry.
//!
//! A lock flag prevents concurrent cycles. Groups are processed one at a
//! time and the shutdown flag is honoured between groups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::{AppConfig, LabConfig};
use crate::db::queries::{Recorded, TagDisposition};
use crate::db::Database;
use crate::detector::{KnownTags, ScanItem, SubmissionDetector};
use crate::errors::{
    ConfigError, CoreError, DetectError, EngineError, ForgeError, GitError, GradingError,
    RosterError,
};
use crate::forge::{Forge, ForgeTag};
use crate::git::RemoteRepository;
use crate::grading::{GradingMachine, GradingTarget, ReconcileOutcome, Registration};
use crate::models::{AuditEntry, CycleReport, Group, GroupOutcome};
use crate::registry::Registry;
use crate::retry::{retry_blocking, RetryPolicy};
use crate::roster::{GraderDirectory, GraderSet, RosterSource};

/// `kv_state` key holding the JSON [`CycleSummary`] of the last cycle.
pub const LAST_CYCLE_KEY: &str = "last_cycle";

/// Which labs and groups a cycle looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleFilter {
    /// Lab ids; empty means every enabled lab.
    pub labs: Vec<String>,
    /// Restrict to one group (within the selected labs).
    pub group: Option<String>,
}

impl CycleFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn labs(labs: Vec<String>) -> Self {
        Self { labs, group: None }
    }

    pub fn group(lab: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            labs: vec![lab.into()],
            group: Some(group.into()),
        }
    }

    fn selects_group(&self, group_id: &str) -> bool {
        self.group.as_deref().map_or(true, |g| g == group_id)
    }
}

/// Compact form of a [`CycleReport`] kept in `kv_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub groups: usize,
    pub new_submissions: usize,
    pub registered: usize,
    pub status_changes: usize,
    pub held_back: usize,
    pub failed_groups: usize,
    pub interrupted: bool,
}

impl From<&CycleReport> for CycleSummary {
    fn from(report: &CycleReport) -> Self {
        let sum = |f: fn(&GroupOutcome) -> usize| -> usize { report.groups.iter().map(f).sum() };
        Self {
            started_at: report.started_at,
            finished_at: report.finished_at,
            groups: report.groups.len(),
            new_submissions: report.new_submissions(),
            registered: sum(|g| g.registered.len()),
            status_changes: sum(|g| g.status_changes.len()),
            held_back: sum(|g| g.held_back.len()),
            failed_groups: report.failed_groups(),
            interrupted: report.interrupted,
        }
    }
}

struct EngineState {
    registry: Registry,
    graders: GraderDirectory,
}

/// Drives poll cycles. Shared between the scheduler and the CLI.
pub struct PollEngine {
    config: AppConfig,
    db: Arc<Database>,
    forge: Arc<dyn Forge>,
    grading: GradingMachine,
    detectors: HashMap<String, SubmissionDetector>,
    retry: RetryPolicy,
    /// Mirrors and grader cache; only touched by the running cycle.
    state: tokio::sync::Mutex<EngineState>,
    /// Atomic flag preventing concurrent poll cycles.
    running: Arc<AtomicBool>,
}

impl PollEngine {
    pub fn new(
        config: AppConfig,
        db: Arc<Database>,
        forge: Arc<dyn Forge>,
        roster: Arc<dyn RosterSource>,
    ) -> Result<Self, ConfigError> {
        let detectors = config
            .labs
            .iter()
            .map(|lab| Ok((lab.id.clone(), SubmissionDetector::new(lab)?)))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;
        let grading = GradingMachine::new(
            Arc::clone(&db),
            Arc::clone(&forge),
            config.grading.clone(),
            config.forge.api_url.clone(),
            config.forge.token.clone(),
        );
        let state = EngineState {
            registry: Registry::new(&config, Arc::clone(&db), roster),
            graders: GraderDirectory::new(
                &config.forge,
                Duration::from_secs(config.roster.refresh_secs),
            ),
        };
        info!(labs = config.labs.len(), "initializing poll engine");
        Ok(Self {
            retry: config.retry.policy(),
            config,
            db,
            forge,
            grading,
            detectors,
            state: tokio::sync::Mutex::new(state),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Execute one poll cycle over the labs and groups selected by `filter`.
    ///
    /// Per-group failures are reported in the group's outcome and do not
    /// stop the cycle. When `shutdown` is set the cycle stops after the
    /// current group and the report is marked interrupted.
    pub async fn run_cycle(
        &self,
        filter: &CycleFilter,
        shutdown: &AtomicBool,
    ) -> Result<CycleReport, EngineError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyRunning);
        }
        let _guard = CycleLockGuard(Arc::clone(&self.running));

        let mut report = CycleReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            groups: Vec::new(),
            interrupted: false,
        };
        let _ = self.db.set_state("poll_state", "polling");

        let result = self.do_cycle(filter, shutdown, &mut report).await;
        report.finished_at = Utc::now();

        let audit = match &result {
            Ok(()) => {
                let summary = CycleSummary::from(&report);
                if let Ok(json) = serde_json::to_string(&summary) {
                    let _ = self.db.set_state(LAST_CYCLE_KEY, &json);
                }
                let details = format!(
                    "groups: {}, new submissions: {}, registered: {}, status changes: {}, \
                     failed groups: {}{}",
                    summary.groups,
                    summary.new_submissions,
                    summary.registered,
                    summary.status_changes,
                    summary.failed_groups,
                    if summary.interrupted { ", interrupted" } else { "" }
                );
                if summary.failed_groups == 0 {
                    AuditEntry::success("poll_cycle", &details)
                } else {
                    AuditEntry::failure("poll_cycle", &details)
                }
            }
            Err(e) => AuditEntry::failure("poll_cycle", &format!("poll failed: {e}")),
        };
        let _ = self.db.set_state("poll_state", if result.is_ok() { "idle" } else { "error" });
        let _ = self.db.set_state("last_poll_at", &report.finished_at.to_rfc3339());
        let _ = self.db.insert_audit_entry(&audit);

        result.map(|()| report)
    }

    async fn do_cycle(
        &self,
        filter: &CycleFilter,
        shutdown: &AtomicBool,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        let labs = self.config.selected_labs(&filter.labs)?;

        let bot = match self.forge.current_user().await {
            Ok(user) => user.username,
            Err(e) => return Err(EngineError::Fatal(format!("forge unavailable: {e}"))),
        };

        let mut state = self.state.lock().await;
        let EngineState { registry, graders } = &mut *state;
        let graders = match graders.grader_set(self.forge.as_ref(), &bot).await {
            Ok(set) => set,
            Err(RosterError::Forge(e)) if e.is_fatal() => {
                return Err(EngineError::Fatal(format!("grader lookup: {e}")))
            }
            Err(e) => return Err(e.into()),
        };
        if graders.is_empty() {
            warn!("no graders configured; every label change will be rejected");
        }

        'labs: for lab in labs {
            self.sync_lab_roster(registry, lab).await?;
            let Some(detector) = self.detectors.get(&lab.id) else {
                return Err(EngineError::Fatal(format!("no detector for lab '{}'", lab.id)));
            };

            let groups: Vec<Group> = registry
                .active_groups(&lab.id)?
                .into_iter()
                .filter(|g| filter.selects_group(&g.id))
                .collect();
            debug!(lab = %lab.id, groups = groups.len(), "polling lab");

            for group in &groups {
                if shutdown.load(Ordering::SeqCst) {
                    info!("shutdown requested, ending cycle early");
                    report.interrupted = true;
                    break 'labs;
                }

                let mut outcome = GroupOutcome::new(&lab.id, &group.id);
                if let Err(e) = self
                    .poll_group(registry, lab, group, detector, &graders, &mut outcome)
                    .await
                {
                    if is_fatal(&e) {
                        report.groups.push(outcome);
                        return Err(EngineError::Fatal(e.to_string()));
                    }
                    warn!(lab = %lab.id, group = %group.id, error = %e, "group poll failed");
                    outcome.error = Some(e.to_string());
                }
                if !outcome.is_quiet() {
                    info!(
                        lab = %lab.id,
                        group = %group.id,
                        new = outcome.new_submissions.len(),
                        registered = outcome.registered.len(),
                        changes = outcome.status_changes.len(),
                        held = outcome.held_back.len(),
                        "group polled"
                    );
                }
                report.groups.push(outcome);
            }
        }
        Ok(())
    }

    /// Sync the roster and refresh thread descriptions of groups whose
    /// membership changed.
    async fn sync_lab_roster(
        &self,
        registry: &mut Registry,
        lab: &LabConfig,
    ) -> Result<(), EngineError> {
        let sync = registry.sync_roster(lab).await?;
        for group_id in &sync.updated {
            let Some(group) = registry.group(&lab.id, group_id)? else {
                continue;
            };
            registry.forget_repository(&lab.id, group_id);
            let target = GradingTarget { lab, group: &group };
            if let Err(e) = self.grading.refresh_description(target).await {
                warn!(group = %group_id, error = %e, "could not refresh thread description");
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(lab = %lab.id, group = %group.id))]
    async fn poll_group(
        &self,
        registry: &mut Registry,
        lab: &LabConfig,
        group: &Group,
        detector: &SubmissionDetector,
        graders: &GraderSet,
        outcome: &mut GroupOutcome,
    ) -> Result<(), CoreError> {
        let tags = self
            .forge
            .list_tags(&group.project_path, detector.prefix())
            .await?;

        let repo = registry.repository(lab, group)?;
        let token = self.config.forge.token.as_deref();
        retry_blocking(&self.retry, "fetch", GitError::is_transient, || repo.fetch(token))?;
        self.record_tags(repo, lab, group, detector, tags, outcome)?;

        let target = GradingTarget { lab, group };

        // Reconcile before registering so a review that started since the
        // last poll defers new submissions instead of being overwritten.
        let reconciled = match self.db.latest_grading_request(&lab.id, &group.id)? {
            Some(request) => {
                let observation = self
                    .grading
                    .observe(&group.project_path, &request.thread)
                    .await?;
                match self.grading.reconcile(&request, &observation, graders) {
                    Ok(ReconcileOutcome::Unchanged) => {}
                    Ok(ReconcileOutcome::Applied(status)) => {
                        outcome.status_changes.push((request.id, status));
                    }
                    Ok(ReconcileOutcome::Rejected { actor }) => outcome
                        .warnings
                        .push(format!("label change by non-grader '{actor}' ignored")),
                    Ok(ReconcileOutcome::Ambiguous) => outcome
                        .warnings
                        .push("several grading labels present".to_string()),
                    Err(e @ GradingError::InvalidTransition { .. }) => {
                        warn!(request = request.id, error = %e, "ignoring label change");
                        outcome.warnings.push(e.to_string());
                    }
                    Err(e) => return Err(e.into()),
                }
                Some(request)
            }
            None => None,
        };

        for submission in self.db.unregistered_submissions(&lab.id, &group.id)? {
            match self
                .grading
                .register(target, &submission, Some(&mut *repo))
                .await?
            {
                Registration::Created(request) => {
                    outcome.registered.push(submission.id);
                    debug!(request = request.id, tag = %submission.tag, "submission registered");
                }
                Registration::Existing(_) => {}
                Registration::Deferred { .. } => {
                    outcome.deferred.push(submission.id);
                    break;
                }
            }
        }

        // Warnings for the reconciled request, then anything left over on
        // the latest one (an announcement whose post failed).
        if let Some(request) = &reconciled {
            self.grading.flush_annotations(target, request).await?;
        }
        if let Some(latest) = self.db.latest_grading_request(&lab.id, &group.id)? {
            if reconciled.as_ref().map(|r| r.id) != Some(latest.id) {
                self.grading.flush_annotations(target, &latest).await?;
            }
        }
        Ok(())
    }

    /// Classify the forge tags against the mirror and persist the result.
    ///
    /// Sequence numbers follow tag creation order, so while an earlier tag
    /// is held back within its grace period later submissions of the group
    /// wait as well. Once the held tag has been warned about it no longer
    /// blocks the ones after it.
    fn record_tags(
        &self,
        repo: &RemoteRepository,
        lab: &LabConfig,
        group: &Group,
        detector: &SubmissionDetector,
        tags: Vec<ForgeTag>,
        outcome: &mut GroupOutcome,
    ) -> Result<(), CoreError> {
        let known = KnownTags {
            seen: self.db.seen_tags(&lab.id, &group.id)?,
            commits: self
                .db
                .list_submissions(&lab.id, &group.id)?
                .into_iter()
                .map(|s| s.commit_hash)
                .collect(),
        };

        let mut blocked_by: Option<String> = None;
        for item in detector.scan(repo, tags, known) {
            match item {
                Ok(ScanItem::Submission(found)) if blocked_by.is_some() => {
                    debug!(
                        tag = %found.tag,
                        held = blocked_by.as_deref().unwrap_or_default(),
                        "waiting for an earlier held-back tag"
                    );
                    outcome.held_back.push(found.tag);
                }
                Ok(ScanItem::Submission(found)) => {
                    match self.db.record_submission(
                        &lab.id,
                        &group.id,
                        &found.tag,
                        &found.commit,
                        &found.problem_branch,
                        found.message.as_deref(),
                    )? {
                        Recorded::New(submission) => {
                            info!(
                                tag = %submission.tag,
                                sequence = submission.sequence,
                                "new submission"
                            );
                            outcome.new_submissions.push(submission.tag);
                        }
                        Recorded::Duplicate(earlier) => {
                            debug!(
                                tag = %found.tag,
                                earlier = %earlier.tag,
                                "commit already submitted"
                            );
                        }
                    }
                }
                Ok(ScanItem::Malformed { tag, reason }) => {
                    warn!(tag = %tag, reason = %reason, "malformed submission tag");
                    self.db
                        .mark_tag_seen(&lab.id, &group.id, &tag, TagDisposition::Malformed)?;
                    outcome.warnings.push(format!("malformed tag '{tag}': {reason}"));
                }
                Ok(ScanItem::Duplicate { tag, commit }) => {
                    debug!(tag = %tag, %commit, "tag points at an earlier submission");
                    self.db
                        .mark_tag_seen(&lab.id, &group.id, &tag, TagDisposition::Duplicate)?;
                }
                Err(DetectError::UnresolvedLineage { tag, commit }) => {
                    let attempts = self.db.hold_tag(&lab.id, &group.id, &tag, &commit)?;
                    if attempts >= self.config.daemon.lineage_warn_after_cycles {
                        warn!(
                            tag = %tag,
                            %commit,
                            attempts,
                            "tag still does not descend from a problem branch"
                        );
                    } else {
                        debug!(tag = %tag, %commit, attempts, "holding back tag");
                        blocked_by.get_or_insert_with(|| tag.clone());
                    }
                    outcome.held_back.push(tag);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Errors that no other group could get past either.
fn is_fatal(error: &CoreError) -> bool {
    let forge = match error {
        CoreError::Forge(e) => e,
        CoreError::Grading(GradingError::Forge(e)) => e,
        CoreError::Roster(RosterError::Forge(e)) => e,
        CoreError::Config(_) => return true,
        _ => return false,
    };
    ForgeError::is_fatal(forge)
}

/// Drop guard that resets the `running` flag, even if a cycle panics.
struct CycleLockGuard(Arc<AtomicBool>);

impl Drop for CycleLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
