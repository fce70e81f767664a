//! TOML roster file reader/writer.
//!
//! The roster file format:
//!
//! ```toml
//! [[groups]]
//! id = "group-07"
//! members = ["alice", "bob"]
//! labs = ["lab1"]                              # optional, default all labs
//! project = "course/groups/group-07/{lab}"     # optional override
//! active = true                                # optional, default true
//! ```
//!
//! `{lab}` in a project override is replaced with the lab id.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::RosterSource;
use crate::config::LabConfig;
use crate::errors::RosterError;
use crate::models::Group;

/// One `[[groups]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    pub id: String,

    #[serde(default)]
    pub members: Vec<String>,

    /// Labs the group takes part in. All labs when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labs: Option<Vec<String>>,

    /// Project path override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl RosterEntry {
    pub fn takes_part_in(&self, lab_id: &str) -> bool {
        self.labs
            .as_ref()
            .map_or(true, |labs| labs.iter().any(|l| l == lab_id))
    }

    pub fn project_path(&self, lab: &LabConfig) -> String {
        match &self.project {
            Some(project) => project.replace("{lab}", &lab.id),
            None => lab.group_project_path(&self.id),
        }
    }
}

/// Wrapper around the TOML roster file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RosterFileData {
    #[serde(default)]
    pub groups: Vec<RosterEntry>,
}

/// A roster stored in a TOML file. The file is re-read on every
/// [`RosterSource::groups`] call so edits take effect on the next sync.
#[derive(Debug, Clone)]
pub struct RosterFile {
    path: PathBuf,
}

impl RosterFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the roster file.
    pub fn load(&self) -> Result<RosterFileData, RosterError> {
        let path = self.path.as_path();
        info!(path = %path.display(), "loading roster file");

        if !path.exists() {
            return Err(RosterError::FileError {
                path: path.display().to_string(),
                detail: "file not found".into(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let data: RosterFileData =
            toml::from_str(&contents).map_err(|e| RosterError::ParseError(e.to_string()))?;

        let mut ids = HashSet::new();
        for entry in &data.groups {
            if entry.id.trim().is_empty() || entry.id.contains('/') {
                return Err(RosterError::ParseError(format!(
                    "invalid group id '{}'",
                    entry.id
                )));
            }
            if !ids.insert(entry.id.as_str()) {
                return Err(RosterError::ParseError(format!(
                    "duplicate group id '{}'",
                    entry.id
                )));
            }
        }

        debug!(count = data.groups.len(), "loaded roster entries");
        Ok(data)
    }

    /// Write the roster back to disk in TOML format.
    #[cfg(test)]
    pub fn save(&self, data: &RosterFileData) -> Result<(), RosterError> {
        info!(path = %self.path.display(), "saving roster file");
        let toml_str =
            toml::to_string_pretty(data).map_err(|e| RosterError::ParseError(e.to_string()))?;
        std::fs::write(&self.path, toml_str)?;
        debug!(count = data.groups.len(), "saved roster entries");
        Ok(())
    }
}

#[async_trait]
impl RosterSource for RosterFile {
    async fn groups(&self, lab: &LabConfig) -> Result<Vec<Group>, RosterError> {
        let data = self.load()?;
        let mut groups = Vec::new();
        for entry in data.groups.into_iter().filter(|e| e.takes_part_in(&lab.id)) {
            let project_path = entry.project_path(lab);
            if project_path.trim_matches('/').is_empty() {
                return Err(RosterError::MissingProject {
                    lab: lab.id.clone(),
                    group: entry.id,
                });
            }
            groups.push(Group {
                lab_id: lab.id.clone(),
                id: entry.id,
                members: entry.members,
                project_path,
                active: entry.active,
            });
        }
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }
}
