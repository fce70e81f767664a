//! Local bare mirror of one group project, via `git2`.
//!
//! Each mirror has two remotes: `origin` is the group's project and
//! `primary` is the lab's official project carrying the problem branches.
//! Branches of both remotes are fetched into `refs/remotes/<remote>/*`;
//! only origin's tags are fetched, into `refs/tags/*`.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use git2::{
    AutotagOption, Cred, ErrorCode, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository,
    Signature, Sort,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::GitError;

/// Remote name of the group project.
pub const ORIGIN: &str = "origin";
/// Remote name of the lab's primary project.
pub const PRIMARY: &str = "primary";

const ORIGIN_REFSPECS: [&str; 2] = [
    "+refs/heads/*:refs/remotes/origin/*",
    "+refs/tags/*:refs/tags/*",
];
const PRIMARY_REFSPECS: [&str; 1] = ["+refs/heads/*:refs/remotes/primary/*"];

/// A tag in the mirror, peeled to the commit it marks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    pub name: String,
    pub commit: String,
    /// Message of an annotated tag; `None` for lightweight tags.
    pub message: Option<String>,
}

/// Outcome of computing a three-way merge in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeComputation {
    /// The merge is clean; the tree to commit.
    Clean(Oid),
    /// Paths with conflicting changes, sorted.
    Conflicts(Vec<String>),
}

/// Handle on a group's local mirror.
pub struct RemoteRepository {
    repo: Repository,
    path: PathBuf,
}

impl RemoteRepository {
    /// Open an existing mirror.
    #[cfg(test)]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let path = path.as_ref();
        let repo = Repository::open_bare(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    /// Open the mirror at `path`, creating a bare repository if needed, and
    /// make sure both remotes point at the given URLs.
    #[instrument(fields(path = %path.display()))]
    pub fn open_or_init(
        path: &Path,
        origin_url: &str,
        primary_url: &str,
    ) -> Result<Self, GitError> {
        let repo = if path.join("HEAD").exists() {
            Repository::open_bare(path)?
        } else {
            info!("initialising mirror");
            std::fs::create_dir_all(path)?;
            Repository::init_bare(path)?
        };
        ensure_remote(&repo, ORIGIN, origin_url)?;
        ensure_remote(&repo, PRIMARY, primary_url)?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    // -- network ------------------------------------------------------------

    /// Fetch branches and tags of the group project and branches of the
    /// primary project.
    #[instrument(skip(self, token), fields(path = %self.path.display()))]
    pub fn fetch(&self, token: Option<&str>) -> Result<(), GitError> {
        self.fetch_remote(ORIGIN, &ORIGIN_REFSPECS, token)?;
        self.fetch_remote(PRIMARY, &PRIMARY_REFSPECS, token)?;
        Ok(())
    }

    fn fetch_remote(
        &self,
        name: &str,
        refspecs: &[&str],
        token: Option<&str>,
    ) -> Result<(), GitError> {
        debug!(remote = name, "fetching");
        let mut remote = self.repo.find_remote(name)?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(credential_callbacks(token));
        fetch_opts.download_tags(AutotagOption::None);
        remote.fetch(refspecs, Some(&mut fetch_opts), Some("labsync: fetch"))?;
        Ok(())
    }

    /// Point `branch` of the group project at `commit` (non-force unless
    /// `force`). The local remote-tracking ref is updated on success.
    #[instrument(skip(self, token), fields(path = %self.path.display()))]
    pub fn push(
        &self,
        commit: Oid,
        branch: &str,
        force: bool,
        token: Option<&str>,
    ) -> Result<(), GitError> {
        info!(%commit, branch, force, "pushing");
        let scratch = format!("refs/labsync/push/{branch}");
        self.repo.reference(&scratch, commit, true, "labsync: stage push")?;

        let rejection: RefCell<Option<String>> = RefCell::new(None);
        let result = {
            let mut callbacks = credential_callbacks(token);
            callbacks.push_update_reference(|refname, status| {
                if let Some(msg) = status {
                    warn!(refname, msg, "push rejected");
                    *rejection.borrow_mut() = Some(msg.to_string());
                }
                Ok(())
            });
            let mut push_opts = PushOptions::new();
            push_opts.remote_callbacks(callbacks);
            let force_marker = if force { "+" } else { "" };
            let refspec = format!("{force_marker}{scratch}:refs/heads/{branch}");
            self.repo
                .find_remote(ORIGIN)
                .and_then(|mut remote| remote.push(&[refspec.as_str()], Some(&mut push_opts)))
        };

        if let Ok(mut staged) = self.repo.find_reference(&scratch) {
            let _ = staged.delete();
        }

        match result {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::NotFastForward => {
                return Err(GitError::PushRejected {
                    branch: branch.to_string(),
                    detail: e.message().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(detail) = rejection.into_inner() {
            return Err(GitError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }

        self.repo.reference(
            &format!("refs/remotes/{ORIGIN}/{branch}"),
            commit,
            true,
            "labsync: push",
        )?;
        info!("push completed");
        Ok(())
    }

    /// Force-update `branch` of the group project to `commit`.
    pub fn publish(&self, commit: Oid, branch: &str, token: Option<&str>) -> Result<(), GitError> {
        self.push(commit, branch, true, token)
    }

    // -- refs ---------------------------------------------------------------

    /// All tags, peeled to commits, in name order.
    pub fn list_tags(&self) -> Result<Vec<TagInfo>, GitError> {
        let names = self.repo.tag_names(None)?;
        let mut tags = Vec::with_capacity(names.len());
        for name in names.iter().flatten() {
            tags.push(self.tag(name)?);
        }
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    /// Look up one tag.
    pub fn tag(&self, name: &str) -> Result<TagInfo, GitError> {
        let reference = self
            .repo
            .find_reference(&format!("refs/tags/{name}"))
            .map_err(|_| GitError::RefNotFound(format!("refs/tags/{name}")))?;
        let commit = reference.peel_to_commit()?;
        let message = reference
            .target()
            .and_then(|oid| self.repo.find_tag(oid).ok())
            .and_then(|tag| tag.message().map(|m| m.trim_end().to_string()))
            .filter(|m| !m.is_empty());
        Ok(TagInfo {
            name: name.to_string(),
            commit: commit.id().to_string(),
            message,
        })
    }

    /// Commit at the tip of `remote`'s `branch`.
    pub fn branch_head(&self, remote: &str, branch: &str) -> Result<Oid, GitError> {
        self.try_branch_head(remote, branch)?
            .ok_or_else(|| GitError::RefNotFound(format!("refs/remotes/{remote}/{branch}")))
    }

    pub fn try_branch_head(&self, remote: &str, branch: &str) -> Result<Option<Oid>, GitError> {
        match self.repo.find_reference(&format!("refs/remotes/{remote}/{branch}")) {
            Ok(reference) => Ok(Some(reference.peel_to_commit()?.id())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Branch names fetched from `remote`.
    pub fn list_branches(&self, remote: &str) -> Result<Vec<String>, GitError> {
        let prefix = format!("refs/remotes/{remote}/");
        let mut names = Vec::new();
        for reference in self.repo.references_glob(&format!("{prefix}*"))? {
            let reference = reference?;
            if let Some(name) = reference.name().and_then(|n| n.strip_prefix(&prefix)) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn resolve(&self, commit: &str) -> Result<Oid, GitError> {
        let oid = Oid::from_str(commit).map_err(|_| GitError::RefNotFound(commit.to_string()))?;
        self.repo
            .find_commit(oid)
            .map(|c| c.id())
            .map_err(|_| GitError::RefNotFound(commit.to_string()))
    }

    // -- graph --------------------------------------------------------------

    /// Whether `ancestor` is reachable from (or equal to) `descendant`.
    pub fn is_ancestor(&self, ancestor: Oid, descendant: Oid) -> Result<bool, GitError> {
        if ancestor == descendant {
            return Ok(true);
        }
        Ok(self.repo.graph_descendant_of(descendant, ancestor)?)
    }

    /// Number of commits reachable from `tip` but not from `base`.
    pub fn distance(&self, base: Oid, tip: Oid) -> Result<usize, GitError> {
        let (ahead, _behind) = self.repo.graph_ahead_behind(tip, base)?;
        Ok(ahead)
    }

    /// Best common ancestor of two commits, if they share history.
    pub fn merge_base(&self, a: Oid, b: Oid) -> Result<Option<Oid>, GitError> {
        match self.repo.merge_base(a, b) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Patch-ids of the non-merge commits reachable from `tip` but not from
    /// `hide`, newest first. Commits with an empty diff are skipped.
    pub fn patch_ids(&self, tip: Oid, hide: Option<Oid>) -> Result<Vec<(Oid, Oid)>, GitError> {
        let mut walk = self.repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL)?;
        walk.push(tip)?;
        if let Some(hide) = hide {
            walk.hide(hide)?;
        }

        let mut ids = Vec::new();
        for oid in walk {
            let commit = self.repo.find_commit(oid?)?;
            if commit.parent_count() > 1 {
                continue;
            }
            let parent_tree = match commit.parent_count() {
                0 => None,
                _ => Some(commit.parent(0)?.tree()?),
            };
            let diff = self
                .repo
                .diff_tree_to_tree(parent_tree.as_ref(), Some(&commit.tree()?), None)?;
            if diff.deltas().count() == 0 {
                continue;
            }
            ids.push((commit.id(), diff.patchid(None)?));
        }
        Ok(ids)
    }

    // -- merging ------------------------------------------------------------

    /// Three-way merge of two commits computed in memory. Nothing in the
    /// repository is modified.
    pub fn merge(&self, ours: Oid, theirs: Oid) -> Result<MergeComputation, GitError> {
        let ours = self.repo.find_commit(ours)?;
        let theirs = self.repo.find_commit(theirs)?;
        let mut index = self.repo.merge_commits(&ours, &theirs, None)?;

        if index.has_conflicts() {
            let mut paths = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let entry = conflict
                    .our
                    .as_ref()
                    .or(conflict.their.as_ref())
                    .or(conflict.ancestor.as_ref());
                if let Some(entry) = entry {
                    paths.push(String::from_utf8_lossy(&entry.path).into_owned());
                }
            }
            paths.sort();
            paths.dedup();
            debug!(conflicts = paths.len(), "merge has conflicts");
            return Ok(MergeComputation::Conflicts(paths));
        }

        let tree = index.write_tree_to(&self.repo)?;
        Ok(MergeComputation::Clean(tree))
    }

    /// Create a commit object for `tree` without moving any ref.
    pub fn commit_tree(
        &self,
        tree: Oid,
        parents: &[Oid],
        message: &str,
        author: &Signature<'_>,
        committer: &Signature<'_>,
    ) -> Result<Oid, GitError> {
        let tree = self.repo.find_tree(tree)?;
        let parents = parents
            .iter()
            .map(|oid| self.repo.find_commit(*oid))
            .collect::<Result<Vec<_>, _>>()?;
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
        let oid = self
            .repo
            .commit(None, author, committer, message, &tree, &parent_refs)?;
        debug!(%oid, "created commit");
        Ok(oid)
    }

    /// Author signature and full message of a commit.
    pub fn author_and_message(
        &self,
        commit: Oid,
    ) -> Result<(Signature<'static>, String), GitError> {
        let commit = self.repo.find_commit(commit)?;
        let message = String::from_utf8_lossy(commit.message_bytes()).into_owned();
        let author = commit.author().to_owned();
        Ok((author, message))
    }
}

fn ensure_remote(repo: &Repository, name: &str, url: &str) -> Result<(), GitError> {
    match repo.find_remote(name) {
        Ok(remote) if remote.url() == Some(url) => Ok(()),
        Ok(_) => {
            debug!(remote = name, url, "updating remote url");
            repo.remote_set_url(name, url)?;
            Ok(())
        }
        Err(e) if e.code() == ErrorCode::NotFound => {
            debug!(remote = name, url, "adding remote");
            repo.remote(name, url)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn credential_callbacks<'a>(token: Option<&str>) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(tok) = token {
        let tok = tok.to_string();
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext("oauth2", &tok)
        });
    }
    callbacks
}
