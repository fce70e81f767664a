//! Who belongs to which group, and who may grade.
//!
//! Group membership comes from a [`RosterSource`]; the default source is a
//! TOML [`RosterFile`]. Grader identity is the union of the configured
//! graders and the members of the forge grader group, read through a
//! [`ReadThroughCache`].

pub mod file;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::cache::ReadThroughCache;
use crate::config::{ForgeConfig, LabConfig};
use crate::errors::RosterError;
use crate::forge::Forge;
use crate::models::Group;

pub use file::RosterFile;

/// A source of lab groups.
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// All groups taking part in `lab`, active or not.
    async fn groups(&self, lab: &LabConfig) -> Result<Vec<Group>, RosterError>;
}

/// Accounts whose label edits count as grading decisions, and accounts
/// whose edits are bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraderSet {
    graders: HashSet<String>,
    system_users: HashSet<String>,
}

impl GraderSet {
    pub fn new<G, S>(graders: G, system_users: S) -> Self
    where
        G: IntoIterator,
        G::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        Self {
            graders: graders.into_iter().map(Into::into).collect(),
            system_users: system_users.into_iter().map(Into::into).collect(),
        }
    }

    /// System users are never graders, even when listed as one.
    pub fn is_grader(&self, username: &str) -> bool {
        !self.is_system(username) && self.graders.contains(username)
    }

    pub fn is_system(&self, username: &str) -> bool {
        self.system_users.contains(username)
    }

    pub fn len(&self) -> usize {
        self.graders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graders.is_empty()
    }
}

/// Builds [`GraderSet`]s from configuration and the forge grader group.
#[derive(Debug)]
pub struct GraderDirectory {
    graders: Vec<String>,
    system_users: Vec<String>,
    grader_group: Option<String>,
    members: ReadThroughCache<String, Vec<String>>,
}

impl GraderDirectory {
    pub fn new(config: &ForgeConfig, refresh: Duration) -> Self {
        Self {
            graders: config.graders.clone(),
            system_users: config.system_users.clone(),
            grader_group: config.grader_group.clone(),
            members: ReadThroughCache::with_ttl(refresh),
        }
    }

    /// The current grader set. `bot` is the account labsync itself runs as
    /// and is always a system user.
    pub async fn grader_set(
        &mut self,
        forge: &dyn Forge,
        bot: &str,
    ) -> Result<GraderSet, RosterError> {
        let mut graders = self.graders.clone();
        if let Some(group) = &self.grader_group {
            let members = self
                .members
                .get_or_load(group, || forge.group_members(group))
                .await?;
            graders.extend(members);
        }
        let system = self
            .system_users
            .iter()
            .cloned()
            .chain(std::iter::once(bot.to_string()));
        let set = GraderSet::new(graders, system);
        debug!(graders = set.len(), "resolved grader set");
        Ok(set)
    }

    /// Reload the grader group membership now.
    pub async fn refresh(&mut self, forge: &dyn Forge) -> Result<(), RosterError> {
        if let Some(group) = &self.grader_group {
            let members = self
                .members
                .refresh(group, || forge.group_members(group))
                .await?;
            info!(group = %group, count = members.len(), "refreshed grader group");
        }
        Ok(())
    }

    pub fn invalidate(&mut self) {
        self.members.invalidate_all();
    }
}
