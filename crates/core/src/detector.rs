//! Submission tag detection.
//!
//! A scan walks the forge's tags for a group in creation order, skips the
//! ones already dealt with and classifies the rest:
//!
//! - names matching `^<prefix>[A-Za-z0-9._-]*$` whose commit descends from a
//!   problem branch become submissions;
//! - names that only resemble the prefix are reported as malformed;
//! - tags on a commit that is already a submission are duplicates;
//! - tags whose commit cannot be placed on any problem branch are held back
//!   as [`DetectError::UnresolvedLineage`] and retried on the next poll.

use std::collections::HashSet;

use git2::Oid;
use regex_lite::Regex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::LabConfig;
use crate::errors::{ConfigError, DetectError, GitError};
use crate::forge::ForgeTag;
use crate::git::client::PRIMARY;
use crate::git::RemoteRepository;

/// A tag that qualifies as a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedSubmission {
    pub tag: String,
    pub commit: String,
    /// Nearest problem branch the commit descends from.
    pub problem_branch: String,
    pub message: Option<String>,
}

/// One classified tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ScanItem {
    Submission(DetectedSubmission),
    Malformed { tag: String, reason: String },
    Duplicate { tag: String, commit: String },
}

impl ScanItem {
    pub fn tag(&self) -> &str {
        match self {
            ScanItem::Submission(s) => &s.tag,
            ScanItem::Malformed { tag, .. } | ScanItem::Duplicate { tag, .. } => tag,
        }
    }
}

/// What the database already knows about a group's tags.
#[derive(Debug, Clone, Default)]
pub struct KnownTags {
    /// Tags that will not be looked at again.
    pub seen: HashSet<String>,
    /// Commits already recorded as submissions.
    pub commits: HashSet<String>,
}

/// How a tag name relates to the submission prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NameClass {
    Strict,
    Malformed(String),
    Unrelated,
}

/// Classifies tags for one lab.
#[derive(Debug, Clone)]
pub struct SubmissionDetector {
    prefix: String,
    pattern: Regex,
    problem_branches: Vec<String>,
}

impl SubmissionDetector {
    pub fn new(lab: &LabConfig) -> Result<Self, ConfigError> {
        let pattern = format!(
            "^{}[A-Za-z0-9._-]*$",
            regex_lite::escape(&lab.submission_tag_prefix)
        );
        let pattern = Regex::new(&pattern).map_err(|e| ConfigError::InvalidValue {
            field: "labs.submission_tag_prefix".into(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            prefix: lab.submission_tag_prefix.clone(),
            pattern,
            problem_branches: lab.problem_branches.clone(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn classify(&self, name: &str) -> NameClass {
        if self.pattern.is_match(name) {
            return NameClass::Strict;
        }
        let lower = name.to_ascii_lowercase();
        if !lower.starts_with(&self.prefix.to_ascii_lowercase()) {
            return NameClass::Unrelated;
        }
        let reason = if !name.starts_with(&self.prefix) {
            format!("prefix must be exactly '{}'", self.prefix)
        } else if name.contains('/') {
            "tag name must be a single path segment".to_string()
        } else {
            format!(
                "characters after '{}' must be letters, digits, '.', '_' or '-'",
                self.prefix
            )
        };
        NameClass::Malformed(reason)
    }

    /// Scan `tags` in forge creation order (ties by name), skipping tags in
    /// `known.seen`. The scan is lazy: nothing is resolved until the
    /// iterator is advanced.
    pub fn scan<'a>(
        &'a self,
        repo: &'a RemoteRepository,
        mut tags: Vec<ForgeTag>,
        known: KnownTags,
    ) -> SubmissionScan<'a> {
        tags.retain(|t| !known.seen.contains(&t.name));
        tags.sort_by(|a, b| {
            (a.created_at.is_none(), a.created_at, &a.name).cmp(&(
                b.created_at.is_none(),
                b.created_at,
                &b.name,
            ))
        });
        SubmissionScan {
            detector: self,
            repo,
            tags: tags.into_iter(),
            commits: known.commits,
        }
    }

    /// The nearest problem branch whose head is an ancestor of (or equal
    /// to) `commit`: fewest commits between head and submission, ties
    /// broken by configured order.
    pub fn resolve_lineage(
        &self,
        repo: &RemoteRepository,
        commit: Oid,
    ) -> Result<Option<String>, GitError> {
        let mut best: Option<(usize, &str)> = None;
        for branch in &self.problem_branches {
            let Some(head) = repo.try_branch_head(PRIMARY, branch)? else {
                trace!(branch = %branch, "problem branch not present on primary");
                continue;
            };
            if !repo.is_ancestor(head, commit)? {
                continue;
            }
            let distance = repo.distance(head, commit)?;
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, branch.as_str()));
            }
        }
        Ok(best.map(|(_, branch)| branch.to_string()))
    }
}

/// Lazy iterator returned by [`SubmissionDetector::scan`].
pub struct SubmissionScan<'a> {
    detector: &'a SubmissionDetector,
    repo: &'a RemoteRepository,
    tags: std::vec::IntoIter<ForgeTag>,
    commits: HashSet<String>,
}

impl SubmissionScan<'_> {
    fn examine(&mut self, tag: ForgeTag) -> Option<Result<ScanItem, DetectError>> {
        match self.detector.classify(&tag.name) {
            NameClass::Unrelated => {
                trace!(tag = %tag.name, "ignoring unrelated tag");
                None
            }
            NameClass::Malformed(reason) => Some(Ok(ScanItem::Malformed {
                tag: tag.name,
                reason,
            })),
            NameClass::Strict => Some(self.resolve(tag)),
        }
    }

    fn resolve(&mut self, tag: ForgeTag) -> Result<ScanItem, DetectError> {
        if self.commits.contains(&tag.commit) {
            return Ok(ScanItem::Duplicate {
                tag: tag.name,
                commit: tag.commit,
            });
        }

        let unresolved = || DetectError::UnresolvedLineage {
            tag: tag.name.clone(),
            commit: tag.commit.clone(),
        };
        // The forge may list a tag whose commit has not been fetched yet.
        let oid = match self.repo.resolve(&tag.commit) {
            Ok(oid) => oid,
            Err(GitError::RefNotFound(_)) => return Err(unresolved()),
            Err(e) => return Err(e.into()),
        };
        let problem_branch = self
            .detector
            .resolve_lineage(self.repo, oid)?
            .ok_or_else(unresolved)?;

        let message = match tag.message {
            Some(message) => Some(message),
            None => self.repo.tag(&tag.name).ok().and_then(|t| t.message),
        };
        debug!(
            tag = %tag.name,
            commit = %tag.commit,
            problem_branch = %problem_branch,
            "detected submission"
        );
        self.commits.insert(tag.commit.clone());
        Ok(ScanItem::Submission(DetectedSubmission {
            tag: tag.name,
            commit: tag.commit,
            problem_branch,
            message,
        }))
    }
}

impl Iterator for SubmissionScan<'_> {
    type Item = Result<ScanItem, DetectError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(tag) = self.tags.next() {
            if let Some(item) = self.examine(tag) {
                return Some(item);
            }
        }
        None
    }
}
