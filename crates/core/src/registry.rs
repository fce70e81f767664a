//! Group and project registry.
//!
//! Keeps the database's group table in step with the roster and hands out
//! the local mirror of each group project, opening or creating it on first
//! use and keeping the handle for the lifetime of the process.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{AppConfig, LabConfig};
use crate::db::Database;
use crate::errors::{DatabaseError, GitError, RosterError};
use crate::git::remote_url::derive_project_url;
use crate::git::RemoteRepository;
use crate::models::Group;
use crate::roster::RosterSource;

/// What a roster sync changed for one lab.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RosterSync {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deactivated: usize,
}

/// Maps `(lab, group)` to groups and their mirrors.
pub struct Registry {
    db: Arc<Database>,
    roster: Arc<dyn RosterSource>,
    api_url: String,
    git_base_url: Option<String>,
    mirrors_dir: PathBuf,
    repositories: HashMap<(String, String), RemoteRepository>,
}

impl Registry {
    pub fn new(config: &AppConfig, db: Arc<Database>, roster: Arc<dyn RosterSource>) -> Self {
        Self {
            db,
            roster,
            api_url: config.forge.api_url.clone(),
            git_base_url: config.forge.git_base_url.clone(),
            mirrors_dir: config.daemon.mirrors_dir(),
            repositories: HashMap::new(),
        }
    }

    /// Load the lab's groups from the roster, upsert them and deactivate
    /// groups that left the roster. Groups are never deleted.
    pub async fn sync_roster(&mut self, lab: &LabConfig) -> Result<RosterSync, RosterError> {
        let roster = Arc::clone(&self.roster);
        let groups = roster.groups(lab).await?;

        let mut sync = RosterSync::default();
        let mut keep = Vec::with_capacity(groups.len());
        for group in &groups {
            match self.db.get_group(&lab.id, &group.id)? {
                None => sync.added.push(group.id.clone()),
                Some(existing) if existing != *group => sync.updated.push(group.id.clone()),
                Some(_) => {}
            }
            self.db.upsert_group(group)?;
            if group.active {
                keep.push(group.id.clone());
            }
        }
        sync.deactivated = self.db.deactivate_missing_groups(&lab.id, &keep)?;

        if !sync.added.is_empty() || !sync.updated.is_empty() || sync.deactivated > 0 {
            info!(
                lab = %lab.id,
                added = sync.added.len(),
                updated = sync.updated.len(),
                deactivated = sync.deactivated,
                "roster synchronised"
            );
        }
        Ok(sync)
    }

    /// Active groups of a lab, ordered by id.
    pub fn active_groups(&self, lab_id: &str) -> Result<Vec<Group>, DatabaseError> {
        self.db.list_groups(lab_id, true)
    }

    pub fn group(&self, lab_id: &str, group_id: &str) -> Result<Option<Group>, DatabaseError> {
        self.db.get_group(lab_id, group_id)
    }

    /// Location of a group's mirror.
    pub fn mirror_path(&self, lab_id: &str, group_id: &str) -> PathBuf {
        self.mirrors_dir.join(lab_id).join(format!("{group_id}.git"))
    }

    /// The group's mirror, opened or created on first use. Remote URLs are
    /// refreshed from the current project mapping whenever the mirror is
    /// first opened by this process.
    pub fn repository(
        &mut self,
        lab: &LabConfig,
        group: &Group,
    ) -> Result<&mut RemoteRepository, GitError> {
        let path = self.mirror_path(&lab.id, &group.id);
        let git_base = self.git_base_url.as_deref();
        let origin = derive_project_url(&self.api_url, git_base, &group.project_path);
        let primary = derive_project_url(&self.api_url, git_base, &lab.primary_project);

        match self.repositories.entry((lab.id.clone(), group.id.clone())) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                debug!(lab = %lab.id, group = %group.id, path = %path.display(), "opening mirror");
                let repo = RemoteRepository::open_or_init(&path, &origin, &primary)?;
                Ok(entry.insert(repo))
            }
        }
    }

    /// Drop a cached mirror handle, e.g. after its project mapping changed.
    pub fn forget_repository(&mut self, lab_id: &str, group_id: &str) -> bool {
        self.repositories
            .remove(&(lab_id.to_string(), group_id.to_string()))
            .is_some()
    }
}
