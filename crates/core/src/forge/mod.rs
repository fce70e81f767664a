//! Git forge capability.
//!
//! Everything labsync needs from the forge's REST API sits behind the
//! [`Forge`] trait: submission tags with their creation time, grading
//! threads (merge requests or issues) with their labels and notes, group
//! membership, and the project settings provisioning relies on (webhooks
//! and protected tags). [`GitLabForge`] talks to a GitLab v4 API;
//! [`MemoryForge`] is an in-memory stand-in for tests and dry runs.

pub mod gitlab;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ForgeError;
use crate::models::{LabelObservation, ThreadKind, ThreadRef};

pub use gitlab::GitLabForge;
pub use memory::MemoryForge;

/// A tag as reported by the forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeTag {
    pub name: String,
    /// Commit the tag points at.
    pub commit: String,
    pub message: Option<String>,
    /// Creation time as recorded by the forge. Lightweight tags fall back
    /// to the commit time.
    pub created_at: Option<DateTime<Utc>>,
}

/// The account labsync authenticates as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeUser {
    pub id: u64,
    pub username: String,
}

/// Parameters for a new grading thread.
#[derive(Debug, Clone)]
pub struct NewThread {
    pub kind: ThreadKind,
    pub title: String,
    pub description: String,
    /// Merge requests only.
    pub source_branch: String,
    /// Merge requests only.
    pub target_branch: String,
    pub labels: Vec<String>,
}

/// A webhook registered on a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectHook {
    pub id: u64,
    pub url: String,
}

/// A webhook to register. It fires on tag pushes and on issue and merge
/// request changes, which is what the webhook listener reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHook {
    pub url: String,
    /// Sent back in the `X-Gitlab-Token` header.
    pub secret: Option<String>,
}

/// Operations labsync performs against the forge.
#[async_trait]
pub trait Forge: Send + Sync {
    /// The authenticated account. Fails with
    /// [`ForgeError::AuthenticationFailed`] when the token is unusable.
    async fn current_user(&self) -> Result<ForgeUser, ForgeError>;

    /// Tags of `project` whose names start with `prefix`, ignoring case.
    async fn list_tags(&self, project: &str, prefix: &str) -> Result<Vec<ForgeTag>, ForgeError>;

    /// An open thread of `kind` with exactly this title.
    async fn find_thread(
        &self,
        project: &str,
        kind: ThreadKind,
        title: &str,
    ) -> Result<Option<ThreadRef>, ForgeError>;

    async fn create_thread(
        &self,
        project: &str,
        thread: &NewThread,
    ) -> Result<ThreadRef, ForgeError>;

    async fn update_description(
        &self,
        project: &str,
        thread: &ThreadRef,
        description: &str,
    ) -> Result<(), ForgeError>;

    async fn post_note(
        &self,
        project: &str,
        thread: &ThreadRef,
        body: &str,
    ) -> Result<(), ForgeError>;

    async fn edit_labels(
        &self,
        project: &str,
        thread: &ThreadRef,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ForgeError>;

    /// Current labels of a thread and its most recent event on one of the
    /// `tracked` labels. Events on any other label are left out.
    async fn label_state(
        &self,
        project: &str,
        thread: &ThreadRef,
        tracked: &[&str],
    ) -> Result<LabelObservation, ForgeError>;

    /// Usernames of all members of a forge group, including inherited ones.
    async fn group_members(&self, group: &str) -> Result<Vec<String>, ForgeError>;

    async fn list_hooks(&self, project: &str) -> Result<Vec<ProjectHook>, ForgeError>;

    async fn create_hook(&self, project: &str, hook: &NewHook) -> Result<ProjectHook, ForgeError>;

    /// Name patterns of the project's protected tags.
    async fn protected_tags(&self, project: &str) -> Result<Vec<String>, ForgeError>;

    /// Protect tags matching the wildcard `pattern`. Developers may still
    /// create them; nobody below maintainer may move or delete them.
    async fn protect_tags(&self, project: &str, pattern: &str) -> Result<(), ForgeError>;
}

/// Case-insensitive prefix test used to filter tag listings.
pub(crate) fn starts_with_ignore_case(name: &str, prefix: &str) -> bool {
    name.len() >= prefix.len()
        && name.is_char_boundary(prefix.len())
        && name[..prefix.len()].eq_ignore_ascii_case(prefix)
}
