//! Group project provisioning.
//!
//! Before students start pushing, every group project gets the labsync
//! webhook and protected submission tags. Both steps look at what the
//! project already has, so a run can be repeated after the roster grows.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::LabConfig;
use crate::errors::{DatabaseError, ForgeError};
use crate::forge::{Forge, NewHook};
use crate::registry::Registry;

/// What a run did about one project setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Created,
    /// Already in place.
    Present,
    /// Not requested.
    Skipped,
}

/// Provisioning result for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedGroup {
    pub group_id: String,
    pub project: String,
    pub hook: Step,
    /// Tag pattern this run protected, if it was not protected before.
    pub protected: Option<String>,
    pub error: Option<String>,
}

/// Wildcard pattern guarding a lab's submission tags. Only names with the
/// exact prefix become submissions, and forge wildcards are case sensitive
/// too, so one pattern covers them.
pub fn tag_pattern(lab: &LabConfig) -> String {
    format!("{}*", lab.submission_tag_prefix)
}

/// Applies webhook and tag protection settings to group projects.
pub struct Provisioner {
    forge: Arc<dyn Forge>,
}

impl Provisioner {
    pub fn new(forge: Arc<dyn Forge>) -> Self {
        Self { forge }
    }

    /// Provision every active group of `lab`. Without `hook` only tags are
    /// protected. A group whose project rejects a call is reported with its
    /// error and the run moves on.
    #[instrument(skip(self, registry, hook), fields(lab = %lab.id))]
    pub async fn run(
        &self,
        registry: &Registry,
        lab: &LabConfig,
        hook: Option<&NewHook>,
    ) -> Result<Vec<ProvisionedGroup>, DatabaseError> {
        let groups = registry.active_groups(&lab.id)?;
        let pattern = tag_pattern(lab);
        info!(groups = groups.len(), %pattern, "provisioning group projects");

        let mut results = Vec::with_capacity(groups.len());
        for group in groups {
            let mut result = ProvisionedGroup {
                group_id: group.id.clone(),
                project: group.project_path.clone(),
                hook: Step::Skipped,
                protected: None,
                error: None,
            };
            if let Err(e) = self.provision(hook, &pattern, &mut result).await {
                warn!(group = %group.id, error = %e, "provisioning failed");
                result.error = Some(e.to_string());
            }
            results.push(result);
        }
        Ok(results)
    }

    async fn provision(
        &self,
        hook: Option<&NewHook>,
        pattern: &str,
        result: &mut ProvisionedGroup,
    ) -> Result<(), ForgeError> {
        let project = result.project.clone();
        if let Some(hook) = hook {
            let existing = self.forge.list_hooks(&project).await?;
            result.hook = if existing.iter().any(|h| h.url == hook.url) {
                Step::Present
            } else {
                self.forge.create_hook(&project, hook).await?;
                Step::Created
            };
        }

        let protected = self.forge.protected_tags(&project).await?;
        if !protected.iter().any(|p| p == pattern) {
            self.forge.protect_tags(&project, pattern).await?;
            result.protected = Some(pattern.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab(prefix: &str) -> LabConfig {
        serde_json::from_value(serde_json::json!({
            "id": "lab1",
            "primary_project": "cs101/lab1",
            "group_namespace": "cs101/groups",
            "problem_branches": ["problem"],
            "submission_tag_prefix": prefix,
        }))
        .unwrap()
    }

    #[test]
    fn test_tag_pattern_follows_prefix() {
        assert_eq!(tag_pattern(&lab("submission")), "submission*");
        assert_eq!(tag_pattern(&lab("Handin")), "Handin*");
    }
}
