//! In-memory forge.
//!
//! Keeps projects, tags, threads, hooks and group memberships in a
//! `Mutex`ed map and records every label change as a label event, the way
//! GitLab does.
//! Test helpers let a scenario play the part of students and graders.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{Forge, ForgeTag, ForgeUser, NewHook, NewThread, ProjectHook};
use crate::errors::ForgeError;
use crate::models::{LabelAction, LabelEvent, LabelObservation, ThreadKind, ThreadRef};

/// A grading thread as stored by [`MemoryForge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryThread {
    pub kind: ThreadKind,
    pub iid: u64,
    pub title: String,
    pub description: String,
    pub source_branch: String,
    pub target_branch: String,
    pub labels: Vec<String>,
    pub notes: Vec<String>,
    pub events: Vec<LabelEvent>,
    pub open: bool,
}

impl MemoryThread {
    fn web_url(&self, project: &str) -> String {
        let segment = match self.kind {
            ThreadKind::MergeRequest => "merge_requests",
            ThreadKind::Issue => "issues",
        };
        format!("https://forge.test/{project}/-/{segment}/{}", self.iid)
    }
}

#[derive(Debug, Default)]
struct ProjectState {
    tags: Vec<ForgeTag>,
    threads: Vec<MemoryThread>,
    hooks: Vec<(u64, NewHook)>,
    protected_tags: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    username: String,
    projects: HashMap<String, ProjectState>,
    groups: HashMap<String, Vec<String>>,
    next_event_id: i64,
    next_hook_id: u64,
    auth_broken: bool,
    notes_broken: bool,
    transient_failures: u32,
    calls: u64,
}

impl State {
    /// Counts the call and applies injected failures.
    fn check(&mut self) -> Result<(), ForgeError> {
        self.calls += 1;
        if self.auth_broken {
            return Err(ForgeError::AuthenticationFailed("HTTP 401".into()));
        }
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(ForgeError::ApiError {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        Ok(())
    }

    fn project_mut(&mut self, project: &str) -> Result<&mut ProjectState, ForgeError> {
        self.projects
            .get_mut(project)
            .ok_or_else(|| ForgeError::NotFound(project.to_string()))
    }

    fn thread_mut(
        &mut self,
        project: &str,
        kind: ThreadKind,
        iid: u64,
    ) -> Result<&mut MemoryThread, ForgeError> {
        self.projects
            .get_mut(project)
            .and_then(|p| p.threads.iter_mut().find(|t| t.kind == kind && t.iid == iid))
            .ok_or_else(|| ForgeError::NotFound(format!("{project} {kind} {iid}")))
    }

    fn label_change(
        &mut self,
        project: &str,
        kind: ThreadKind,
        iid: u64,
        actor: &str,
        label: &str,
        action: LabelAction,
    ) -> Result<(), ForgeError> {
        self.next_event_id += 1;
        let id = self.next_event_id;
        let thread = self.thread_mut(project, kind, iid)?;
        let present = thread.labels.iter().any(|l| l == label);
        match action {
            LabelAction::Add if present => return Ok(()),
            LabelAction::Remove if !present => return Ok(()),
            LabelAction::Add => thread.labels.push(label.to_string()),
            LabelAction::Remove => thread.labels.retain(|l| l != label),
        }
        thread.events.push(LabelEvent {
            id,
            actor: actor.to_string(),
            label: label.to_string(),
            action,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

/// [`Forge`] implementation that lives entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryForge {
    state: Mutex<State>,
}

impl MemoryForge {
    /// A forge that authenticates as `username`.
    pub fn new(username: &str) -> Self {
        let forge = Self::default();
        forge.state().username = username.to_string();
        forge
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `project` exist without any tags.
    pub fn create_project(&self, project: &str) {
        self.state().projects.entry(project.to_string()).or_default();
    }

    /// Push a tag to `project`, as a student would.
    pub fn add_tag(&self, project: &str, name: &str, commit: &str, message: Option<&str>) {
        self.state()
            .projects
            .entry(project.to_string())
            .or_default()
            .tags
            .push(ForgeTag {
                name: name.to_string(),
                commit: commit.to_string(),
                message: message.map(str::to_string),
                created_at: Some(Utc::now()),
            });
    }

    pub fn set_group_members(&self, group: &str, members: &[&str]) {
        self.state()
            .groups
            .insert(group.to_string(), members.iter().map(|m| m.to_string()).collect());
    }

    /// Add a label to a thread on behalf of `actor`.
    pub fn add_label(
        &self,
        project: &str,
        thread: &ThreadRef,
        actor: &str,
        label: &str,
    ) -> Result<(), ForgeError> {
        self.state()
            .label_change(project, thread.kind, thread.iid, actor, label, LabelAction::Add)
    }

    /// Remove a label from a thread on behalf of `actor`.
    pub fn remove_label(
        &self,
        project: &str,
        thread: &ThreadRef,
        actor: &str,
        label: &str,
    ) -> Result<(), ForgeError> {
        self.state()
            .label_change(project, thread.kind, thread.iid, actor, label, LabelAction::Remove)
    }

    /// Swap `from` for `to` on behalf of `actor`, removing first.
    pub fn relabel(
        &self,
        project: &str,
        thread: &ThreadRef,
        actor: &str,
        from: &str,
        to: &str,
    ) -> Result<(), ForgeError> {
        self.remove_label(project, thread, actor, from)?;
        self.add_label(project, thread, actor, to)
    }

    pub fn close_thread(&self, project: &str, thread: &ThreadRef) -> Result<(), ForgeError> {
        self.state().thread_mut(project, thread.kind, thread.iid)?.open = false;
        Ok(())
    }

    /// Every thread of a project, open or closed.
    pub fn threads(&self, project: &str) -> Vec<MemoryThread> {
        self.state()
            .projects
            .get(project)
            .map(|p| p.threads.clone())
            .unwrap_or_default()
    }

    pub fn thread(&self, project: &str, thread: &ThreadRef) -> Option<MemoryThread> {
        self.threads(project)
            .into_iter()
            .find(|t| t.kind == thread.kind && t.iid == thread.iid)
    }

    /// Webhooks registered on `project`, oldest first.
    pub fn hooks(&self, project: &str) -> Vec<NewHook> {
        self.state()
            .projects
            .get(project)
            .map(|p| p.hooks.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    /// Protected tag patterns of `project`.
    pub fn tag_protection(&self, project: &str) -> Vec<String> {
        self.state()
            .projects
            .get(project)
            .map(|p| p.protected_tags.clone())
            .unwrap_or_default()
    }

    /// Make every call fail with a 401 until switched back.
    pub fn set_auth_broken(&self, broken: bool) {
        self.state().auth_broken = broken;
    }

    /// Make note posting fail with a 500 until switched back.
    pub fn set_notes_broken(&self, broken: bool) {
        self.state().notes_broken = broken;
    }

    /// Fail the next `n` calls with a 503.
    pub fn fail_next(&self, n: u32) {
        self.state().transient_failures = n;
    }

    /// Number of API calls served so far, failed ones included.
    pub fn calls(&self) -> u64 {
        self.state().calls
    }
}

#[async_trait]
impl Forge for MemoryForge {
    async fn current_user(&self) -> Result<ForgeUser, ForgeError> {
        let mut state = self.state();
        state.check()?;
        Ok(ForgeUser {
            id: 1,
            username: state.username.clone(),
        })
    }

    async fn list_tags(&self, project: &str, prefix: &str) -> Result<Vec<ForgeTag>, ForgeError> {
        let mut state = self.state();
        state.check()?;
        let project = state
            .projects
            .get(project)
            .ok_or_else(|| ForgeError::NotFound(project.to_string()))?;
        Ok(project
            .tags
            .iter()
            .filter(|t| super::starts_with_ignore_case(&t.name, prefix))
            .cloned()
            .collect())
    }

    async fn find_thread(
        &self,
        project: &str,
        kind: ThreadKind,
        title: &str,
    ) -> Result<Option<ThreadRef>, ForgeError> {
        let mut state = self.state();
        state.check()?;
        Ok(state.projects.get(project).and_then(|p| {
            p.threads
                .iter()
                .find(|t| t.open && t.kind == kind && t.title == title)
                .map(|t| ThreadRef {
                    kind,
                    iid: t.iid,
                    web_url: t.web_url(project),
                })
        }))
    }

    async fn create_thread(
        &self,
        project: &str,
        thread: &NewThread,
    ) -> Result<ThreadRef, ForgeError> {
        let mut state = self.state();
        state.check()?;
        let username = state.username.clone();
        let entry = state.projects.entry(project.to_string()).or_default();
        let iid = entry
            .threads
            .iter()
            .filter(|t| t.kind == thread.kind)
            .map(|t| t.iid)
            .max()
            .unwrap_or(0)
            + 1;
        entry.threads.push(MemoryThread {
            kind: thread.kind,
            iid,
            title: thread.title.clone(),
            description: thread.description.clone(),
            source_branch: thread.source_branch.clone(),
            target_branch: thread.target_branch.clone(),
            labels: Vec::new(),
            notes: Vec::new(),
            events: Vec::new(),
            open: true,
        });
        let web_url = entry.threads[entry.threads.len() - 1].web_url(project);
        for label in &thread.labels {
            state.label_change(project, thread.kind, iid, &username, label, LabelAction::Add)?;
        }
        Ok(ThreadRef {
            kind: thread.kind,
            iid,
            web_url,
        })
    }

    async fn update_description(
        &self,
        project: &str,
        thread: &ThreadRef,
        description: &str,
    ) -> Result<(), ForgeError> {
        let mut state = self.state();
        state.check()?;
        state.thread_mut(project, thread.kind, thread.iid)?.description = description.to_string();
        Ok(())
    }

    async fn post_note(
        &self,
        project: &str,
        thread: &ThreadRef,
        body: &str,
    ) -> Result<(), ForgeError> {
        let mut state = self.state();
        state.check()?;
        if state.notes_broken {
            return Err(ForgeError::ApiError {
                status: 500,
                body: "note could not be saved".into(),
            });
        }
        state
            .thread_mut(project, thread.kind, thread.iid)?
            .notes
            .push(body.to_string());
        Ok(())
    }

    async fn edit_labels(
        &self,
        project: &str,
        thread: &ThreadRef,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ForgeError> {
        let mut state = self.state();
        state.check()?;
        let username = state.username.clone();
        for label in remove {
            state.label_change(
                project,
                thread.kind,
                thread.iid,
                &username,
                label,
                LabelAction::Remove,
            )?;
        }
        for label in add {
            state.label_change(
                project,
                thread.kind,
                thread.iid,
                &username,
                label,
                LabelAction::Add,
            )?;
        }
        Ok(())
    }

    async fn label_state(
        &self,
        project: &str,
        thread: &ThreadRef,
        tracked: &[&str],
    ) -> Result<LabelObservation, ForgeError> {
        let mut state = self.state();
        state.check()?;
        let thread = state.thread_mut(project, thread.kind, thread.iid)?;
        Ok(LabelObservation {
            labels: thread.labels.clone(),
            last_event: thread
                .events
                .iter()
                .rev()
                .find(|e| tracked.contains(&e.label.as_str()))
                .cloned(),
        })
    }

    async fn group_members(&self, group: &str) -> Result<Vec<String>, ForgeError> {
        let mut state = self.state();
        state.check()?;
        state
            .groups
            .get(group)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(group.to_string()))
    }

    async fn list_hooks(&self, project: &str) -> Result<Vec<ProjectHook>, ForgeError> {
        let mut state = self.state();
        state.check()?;
        Ok(state
            .project_mut(project)?
            .hooks
            .iter()
            .map(|(id, h)| ProjectHook {
                id: *id,
                url: h.url.clone(),
            })
            .collect())
    }

    async fn create_hook(&self, project: &str, hook: &NewHook) -> Result<ProjectHook, ForgeError> {
        let mut state = self.state();
        state.check()?;
        state.next_hook_id += 1;
        let id = state.next_hook_id;
        state.project_mut(project)?.hooks.push((id, hook.clone()));
        Ok(ProjectHook {
            id,
            url: hook.url.clone(),
        })
    }

    async fn protected_tags(&self, project: &str) -> Result<Vec<String>, ForgeError> {
        let mut state = self.state();
        state.check()?;
        Ok(state.project_mut(project)?.protected_tags.clone())
    }

    async fn protect_tags(&self, project: &str, pattern: &str) -> Result<(), ForgeError> {
        let mut state = self.state();
        state.check()?;
        let project = state.project_mut(project)?;
        if project.protected_tags.iter().any(|p| p == pattern) {
            return Err(ForgeError::ApiError {
                status: 409,
                body: "Protected tag already exists".into(),
            });
        }
        project.protected_tags.push(pattern.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_issue(title: &str, labels: &[&str]) -> NewThread {
        NewThread {
            kind: ThreadKind::Issue,
            title: title.into(),
            description: "desc".into(),
            source_branch: String::new(),
            target_branch: String::new(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_thread_lifecycle() {
        let forge = MemoryForge::new("bot");
        let thread = forge
            .create_thread("c/g1/lab1", &new_issue("Grading", &["waiting"]))
            .await
            .unwrap();
        assert_eq!(thread.iid, 1);
        assert_eq!(
            forge.find_thread("c/g1/lab1", ThreadKind::Issue, "Grading").await.unwrap(),
            Some(thread.clone())
        );

        let tracked = ["waiting", "grading"];
        let state = forge.label_state("c/g1/lab1", &thread, &tracked).await.unwrap();
        assert_eq!(state.labels, vec!["waiting"]);
        assert_eq!(state.last_event.as_ref().unwrap().actor, "bot");

        forge.relabel("c/g1/lab1", &thread, "ta1", "waiting", "grading").unwrap();
        forge.add_label("c/g1/lab1", &thread, "alice", "question").unwrap();
        let state = forge.label_state("c/g1/lab1", &thread, &tracked).await.unwrap();
        assert_eq!(state.labels, vec!["grading", "question"]);
        let last = state.last_event.unwrap();
        assert_eq!((last.actor.as_str(), last.label.as_str()), ("ta1", "grading"));
        assert_eq!(last.action, LabelAction::Add);

        forge.close_thread("c/g1/lab1", &thread).unwrap();
        assert!(forge
            .find_thread("c/g1/lab1", ThreadKind::Issue, "Grading")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_redundant_label_change_records_no_event() {
        let forge = MemoryForge::new("bot");
        let thread = forge
            .create_thread("p", &new_issue("t", &["a"]))
            .await
            .unwrap();
        forge.add_label("p", &thread, "ta1", "a").unwrap();
        assert_eq!(forge.thread("p", &thread).unwrap().events.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let forge = MemoryForge::new("bot");
        forge.fail_next(1);
        let err = forge.current_user().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(forge.current_user().await.unwrap().username, "bot");

        forge.set_auth_broken(true);
        assert!(forge.current_user().await.unwrap_err().is_fatal());
        assert_eq!(forge.calls(), 3);
    }

    #[tokio::test]
    async fn test_project_settings() {
        let forge = MemoryForge::new("bot");
        forge.create_project("p");
        let hook = NewHook {
            url: "https://labsync.test/webhook/gitlab".into(),
            secret: Some("s".into()),
        };
        let created = forge.create_hook("p", &hook).await.unwrap();
        assert_eq!(forge.list_hooks("p").await.unwrap(), vec![created]);
        assert_eq!(forge.hooks("p"), vec![hook]);

        forge.protect_tags("p", "submission*").await.unwrap();
        assert!(forge.protect_tags("p", "submission*").await.is_err());
        assert_eq!(forge.protected_tags("p").await.unwrap(), vec!["submission*"]);
        assert!(matches!(
            forge.list_hooks("missing").await,
            Err(ForgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_tags_filters_prefix() {
        let forge = MemoryForge::new("bot");
        forge.add_tag("p", "submission1", "abc", None);
        forge.add_tag("p", "Submission2", "bcd", None);
        forge.add_tag("p", "v1.0", "def", None);
        let tags = forge.list_tags("p", "submission").await.unwrap();
        assert_eq!(tags.len(), 2);
        assert!(matches!(
            forge.list_tags("missing", "submission").await,
            Err(ForgeError::NotFound(_))
        ));
    }
}
