//! Hotfix propagation.
//!
//! A hotfix is a branch of the primary project that forks from a problem
//! branch. Propagating it merges the hotfix tip into every group's main
//! branch, unless the group already has the fix.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use git2::Oid;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::LabConfig;
use crate::db::Database;
use crate::errors::{GitError, HotfixError};
use crate::git::client::{ORIGIN, PRIMARY};
use crate::git::{MergeComputation, RemoteRepository};
use crate::models::{Group, HotfixAttempt, HotfixOutcome, HotfixReport};
use crate::registry::Registry;
use crate::retry::{retry_blocking, RetryPolicy};

/// Knobs for one hotfix run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HotfixOptions {
    /// Glob patterns over group ids; empty selects every active group.
    pub groups: Vec<String>,
    /// Problem branch the hotfix forks from. Defaults to the lab's first.
    pub problem_branch: Option<String>,
    /// Classify only; push nothing.
    pub dry_run: bool,
}

impl HotfixOptions {
    pub fn selects(&self, group_id: &str) -> bool {
        self.groups.is_empty()
            || self
                .groups
                .iter()
                .any(|pattern| glob_match::glob_match(pattern, group_id))
    }
}

/// Merges hotfix branches into group projects.
pub struct HotfixPropagator {
    db: Arc<Database>,
    retry: RetryPolicy,
    token: Option<String>,
}

impl HotfixPropagator {
    pub fn new(db: Arc<Database>, retry: RetryPolicy, token: Option<String>) -> Self {
        Self { db, retry, token }
    }

    /// Propagate `hotfix_branch` into every selected active group of `lab`.
    ///
    /// Per-group failures end up in the report as [`HotfixOutcome::Failed`].
    /// A hotfix branch that is missing, unrelated to the problem branch or
    /// empty aborts the run, since no group could be handled. Changes are
    /// compared from the merge base of the hotfix and each group's branch,
    /// so a hotfix already merged into the problem branch still reaches
    /// groups that forked before it.
    #[instrument(skip(self, registry, options), fields(lab = %lab.id, dry_run = options.dry_run))]
    pub fn run(
        &self,
        registry: &mut Registry,
        lab: &LabConfig,
        hotfix_branch: &str,
        options: &HotfixOptions,
    ) -> Result<HotfixReport, HotfixError> {
        let problem_branch = options
            .problem_branch
            .clone()
            .or_else(|| lab.problem_branches.first().cloned())
            .unwrap_or_else(|| lab.main_branch.clone());

        let mut report = HotfixReport {
            lab_id: lab.id.clone(),
            hotfix_branch: hotfix_branch.to_string(),
            problem_branch: problem_branch.clone(),
            dry_run: options.dry_run,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            attempts: Vec::new(),
        };

        let groups: Vec<Group> = registry
            .active_groups(&lab.id)?
            .into_iter()
            .filter(|g| options.selects(&g.id))
            .collect();
        info!(groups = groups.len(), hotfix_branch, %problem_branch, "propagating hotfix");

        for group in &groups {
            let outcome = match self.propagate(
                registry,
                lab,
                group,
                hotfix_branch,
                &problem_branch,
                options.dry_run,
            ) {
                Ok(outcome) => outcome,
                Err(
                    e @ (HotfixError::BranchNotFound(_)
                    | HotfixError::UnrelatedHistory { .. }
                    | HotfixError::EmptyHotfix(_)),
                ) => {
                    self.audit(&report, Some(&e.to_string()))?;
                    return Err(e);
                }
                Err(e) => {
                    warn!(group = %group.id, error = %e, "hotfix failed for group");
                    HotfixOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            info!(group = %group.id, outcome = outcome.label(), "hotfix classified");
            report.attempts.push(HotfixAttempt {
                group_id: group.id.clone(),
                hotfix_branch: hotfix_branch.to_string(),
                outcome,
            });
        }

        report.finished_at = Utc::now();
        self.audit(&report, None)?;
        Ok(report)
    }

    fn propagate(
        &self,
        registry: &mut Registry,
        lab: &LabConfig,
        group: &Group,
        hotfix_branch: &str,
        problem_branch: &str,
        dry_run: bool,
    ) -> Result<HotfixOutcome, HotfixError> {
        let repo = registry.repository(lab, group)?;
        let token = self.token.as_deref();
        retry_blocking(&self.retry, "fetch", GitError::is_transient, || repo.fetch(token))?;

        let hotfix = repo
            .try_branch_head(PRIMARY, hotfix_branch)?
            .ok_or_else(|| HotfixError::BranchNotFound(hotfix_branch.to_string()))?;
        let problem = repo.branch_head(PRIMARY, problem_branch)?;
        if repo.merge_base(hotfix, problem)?.is_none() {
            return Err(HotfixError::UnrelatedHistory {
                hotfix: hotfix_branch.to_string(),
                problem: problem_branch.to_string(),
            });
        }

        let head = repo.branch_head(ORIGIN, &lab.main_branch)?;
        if repo.is_ancestor(hotfix, head)? {
            return Ok(HotfixOutcome::AlreadyApplied);
        }
        let Some(base) = repo.merge_base(hotfix, head)? else {
            return Ok(HotfixOutcome::Failed {
                error: format!("{} shares no history with '{hotfix_branch}'", lab.main_branch),
            });
        };

        let wanted = repo.patch_ids(hotfix, Some(base))?;
        if wanted.is_empty() {
            return Err(HotfixError::EmptyHotfix(hotfix_branch.to_string()));
        }
        if already_applied(repo, &wanted, base, head)? {
            return Ok(HotfixOutcome::AlreadyApplied);
        }

        match repo.merge(head, hotfix)? {
            MergeComputation::Conflicts(paths) => Ok(HotfixOutcome::Conflict { paths }),
            MergeComputation::Clean(tree) => {
                let (author, message) = repo.author_and_message(hotfix)?;
                let commit = repo.commit_tree(tree, &[head, hotfix], &message, &author, &author)?;
                if !dry_run {
                    repo.push(commit, &lab.main_branch, false, token)?;
                }
                Ok(HotfixOutcome::AppliedClean {
                    commit: commit.to_string(),
                })
            }
        }
    }

    fn audit(&self, report: &HotfixReport, aborted: Option<&str>) -> Result<(), HotfixError> {
        let (applied, already, conflicts, failed) = report.counts();
        let mut details = format!(
            "lab={} hotfix={} problem={} dry_run={} applied={applied} \
             already_applied={already} conflicts={conflicts} failed={failed}",
            report.lab_id, report.hotfix_branch, report.problem_branch, report.dry_run,
        );
        if let Some(reason) = aborted {
            details.push_str(&format!(" aborted: {reason}"));
        }
        let success = aborted.is_none() && failed == 0;
        self.db.insert_audit_log("hotfix", Some(&details), success)?;
        Ok(())
    }
}

/// Patch-equality check: the group has the fix when every change the hotfix
/// makes on top of `base`, the merge base with the group's branch, also
/// appears among the group's own commits since that base.
fn already_applied(
    repo: &RemoteRepository,
    wanted: &[(Oid, Oid)],
    base: Oid,
    head: Oid,
) -> Result<bool, GitError> {
    let present: HashSet<Oid> = repo
        .patch_ids(head, Some(base))?
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    Ok(wanted.iter().all(|(_, id)| present.contains(id)))
}
