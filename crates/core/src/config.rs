//! TOML-based configuration for labsync.
//!
//! All sensitive values (forge token, webhook secret) are stored as `_env`
//! fields that reference environment variable names. The actual secrets are
//! resolved at runtime via [`AppConfig::resolve_env_vars`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / polling settings.
    pub daemon: DaemonConfig,

    /// Forge (GitLab) API and access settings.
    #[serde(default)]
    pub forge: ForgeConfig,

    /// Retry policy for network operations.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Grading workflow settings.
    #[serde(default)]
    pub grading: GradingConfig,

    /// Webhook listener settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Roster source settings.
    #[serde(default)]
    pub roster: RosterConfig,

    /// Labs tracked in this course.
    #[serde(default)]
    pub labs: Vec<LabConfig>,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Course identifier, used in logs and grading request titles.
    pub course: String,

    /// Seconds between polling cycles (default 300).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (database, mirrors).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Number of polls a tag may stay unresolved before it is reported.
    #[serde(default = "default_lineage_warn_after")]
    pub lineage_warn_after_cycles: u32,
}

fn default_poll_interval() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/labsync")
}
fn default_lineage_warn_after() -> u32 {
    3
}

impl DaemonConfig {
    /// Path of the SQLite database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("labsync.db")
    }

    /// Root directory of the per-group bare mirrors.
    pub fn mirrors_dir(&self) -> PathBuf {
        self.data_dir.join("mirrors")
    }
}

// ---------------------------------------------------------------------------
// Forge
// ---------------------------------------------------------------------------

/// GitLab API and access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// API base URL (default `https://gitlab.com/api/v4`).
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Clone base URL. Derived from `api_url` when unset.
    #[serde(default)]
    pub git_base_url: Option<String>,

    /// Environment variable holding the private access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Environment variable holding the webhook secret token.
    #[serde(default)]
    pub webhook_secret_env: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Bot accounts whose label edits are bookkeeping, not grading.
    #[serde(default)]
    pub system_users: Vec<String>,

    /// Forge group whose members are graders.
    #[serde(default)]
    pub grader_group: Option<String>,

    /// Additional grader usernames.
    #[serde(default)]
    pub graders: Vec<String>,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,

    /// Resolved webhook secret.
    #[serde(skip)]
    pub webhook_secret: Option<String>,
}

fn default_api_url() -> String {
    "https://gitlab.com/api/v4".into()
}
fn default_token_env() -> String {
    "GITLAB_TOKEN".into()
}
fn default_request_timeout() -> u64 {
    30
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            git_base_url: None,
            token_env: default_token_env(),
            webhook_secret_env: None,
            request_timeout_secs: default_request_timeout(),
            system_users: Vec::new(),
            grader_group: None,
            graders: Vec::new(),
            token: None,
            webhook_secret: None,
        }
    }
}

impl ForgeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for transient network failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    8_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Grading
// ---------------------------------------------------------------------------

/// Which forge object tracks a group's grading.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GradingMode {
    /// A merge request from the submission branch into the problem branch.
    #[default]
    MergeRequest,
    /// A plain issue in the group project.
    Issue,
}

/// Grading workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingConfig {
    #[serde(default)]
    pub mode: GradingMode,

    #[serde(default = "default_awaiting_label")]
    pub awaiting_label: String,

    #[serde(default = "default_in_progress_label")]
    pub in_progress_label: String,

    #[serde(default = "default_complete_label")]
    pub complete_label: String,

    #[serde(default = "default_incomplete_label")]
    pub incomplete_label: String,

    /// Branch in the group project that mirrors the latest submission.
    #[serde(default = "default_submission_branch")]
    pub submission_branch: String,

    /// How long an in-progress review blocks registration of a newer
    /// submission. Unset means it blocks until the grader finishes.
    #[serde(default = "default_maximum_reserve")]
    pub maximum_reserve_secs: Option<u64>,

    /// Grading request title; `{group}` and `{lab}` are substituted.
    #[serde(default = "default_title_template")]
    pub title_template: String,
}

fn default_awaiting_label() -> String {
    "waiting-for-grading".into()
}
fn default_in_progress_label() -> String {
    "grading".into()
}
fn default_complete_label() -> String {
    "complete".into()
}
fn default_incomplete_label() -> String {
    "incomplete".into()
}
fn default_submission_branch() -> String {
    "grading-submission".into()
}
fn default_maximum_reserve() -> Option<u64> {
    Some(4 * 60 * 60)
}
fn default_title_template() -> String {
    "Grading for {group} on {lab}".into()
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            mode: GradingMode::default(),
            awaiting_label: default_awaiting_label(),
            in_progress_label: default_in_progress_label(),
            complete_label: default_complete_label(),
            incomplete_label: default_incomplete_label(),
            submission_branch: default_submission_branch(),
            maximum_reserve_secs: default_maximum_reserve(),
            title_template: default_title_template(),
        }
    }
}

impl GradingConfig {
    /// All status labels in `[awaiting, in_progress, complete, incomplete]`
    /// order.
    pub fn status_labels(&self) -> [&str; 4] {
        [
            &self.awaiting_label,
            &self.in_progress_label,
            &self.complete_label,
            &self.incomplete_label,
        ]
    }

    pub fn title_for(&self, group: &str, lab: &str) -> String {
        self.title_template
            .replace("{group}", group)
            .replace("{lab}", lab)
    }
}

// ---------------------------------------------------------------------------
// Web listener
// ---------------------------------------------------------------------------

/// Webhook listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen address (default `127.0.0.1:4200`).
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Base URL at which the forge reaches this listener. Project webhooks
    /// registered by `labsync provision` point below it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

impl WebConfig {
    /// Webhook URL for project hooks, if a public URL is configured.
    pub fn hook_url(&self) -> Option<String> {
        self.public_url
            .as_deref()
            .map(|base| format!("{}/webhook/gitlab", base.trim_end_matches('/')))
    }
}

fn default_listen() -> String {
    "127.0.0.1:4200".into()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            public_url: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// Roster source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterConfig {
    /// Path to the TOML roster file.
    #[serde(default = "default_roster_file")]
    pub file: PathBuf,

    /// Seconds a cached grader membership list stays valid.
    #[serde(default = "default_roster_refresh")]
    pub refresh_secs: u64,
}

fn default_roster_file() -> PathBuf {
    PathBuf::from("roster.toml")
}
fn default_roster_refresh() -> u64 {
    900
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            file: default_roster_file(),
            refresh_secs: default_roster_refresh(),
        }
    }
}

// ---------------------------------------------------------------------------
// Labs
// ---------------------------------------------------------------------------

/// One lab assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabConfig {
    /// Short identifier (e.g. `lab1`), also the last path segment of group
    /// projects.
    pub id: String,

    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Forge path of the official project carrying the problem branches.
    pub primary_project: String,

    /// Namespace under which group projects live as
    /// `{group_namespace}/{group}/{lab}`.
    pub group_namespace: String,

    /// Known problem branches on the primary project, in preference order.
    pub problem_branches: Vec<String>,

    /// Group working branch that hotfixes are merged into.
    #[serde(default = "default_main_branch")]
    pub main_branch: String,

    /// Prefix that submission tags start with.
    #[serde(default = "default_tag_prefix")]
    pub submission_tag_prefix: String,
}

fn default_true() -> bool {
    true
}
fn default_main_branch() -> String {
    "main".into()
}
fn default_tag_prefix() -> String {
    "submission".into()
}

impl LabConfig {
    /// Forge path of a group's project for this lab.
    pub fn group_project_path(&self, group_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.group_namespace.trim_end_matches('/'),
            group_id,
            self.id
        )
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(labs = config.labs.len(), "configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// Missing variables log a warning but do not fail; the daemon decides
    /// at startup whether a token is required.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        self.forge.token = resolve_optional_env(&self.forge.token_env, "forge.token_env");

        if let Some(ref env_name) = self.forge.webhook_secret_env {
            self.forge.webhook_secret = resolve_optional_env(env_name, "forge.webhook_secret_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.course.trim().is_empty() {
            return Err(invalid("daemon.course", "course identifier must not be empty"));
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(invalid("daemon.poll_interval_secs", "poll interval must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "at least one attempt is required"));
        }
        if self.forge.api_url.is_empty() {
            return Err(invalid("forge.api_url", "API URL must not be empty"));
        }
        if let Some(ref url) = self.web.public_url {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(invalid("web.public_url", "public URL must be http(s)"));
            }
        }

        let labels = self.grading.status_labels();
        if labels.iter().any(|l| l.trim().is_empty()) {
            return Err(invalid("grading", "status labels must not be empty"));
        }
        let distinct: HashSet<&str> = labels.iter().copied().collect();
        if distinct.len() != labels.len() {
            return Err(invalid("grading", "status labels must be distinct"));
        }

        if self.labs.is_empty() {
            return Err(invalid("labs", "at least one [[labs]] entry is required"));
        }
        let mut seen = HashSet::new();
        for lab in &self.labs {
            if lab.id.is_empty() || lab.id.contains('/') {
                return Err(invalid("labs.id", "lab id must be a non-empty path segment"));
            }
            if !seen.insert(lab.id.as_str()) {
                return Err(invalid("labs.id", &format!("duplicate lab id '{}'", lab.id)));
            }
            if lab.primary_project.is_empty() {
                return Err(invalid(
                    "labs.primary_project",
                    &format!("lab '{}' has no primary project", lab.id),
                ));
            }
            if lab.problem_branches.is_empty() {
                return Err(invalid(
                    "labs.problem_branches",
                    &format!("lab '{}' needs at least one problem branch", lab.id),
                ));
            }
            if lab.submission_tag_prefix.is_empty() || lab.submission_tag_prefix.contains('/') {
                return Err(invalid(
                    "labs.submission_tag_prefix",
                    &format!("lab '{}' needs a single-segment tag prefix", lab.id),
                ));
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a lab by id.
    pub fn lab(&self, id: &str) -> Result<&LabConfig, ConfigError> {
        self.labs
            .iter()
            .find(|l| l.id == id)
            .ok_or_else(|| ConfigError::UnknownLab(id.to_string()))
    }

    /// Enabled labs, optionally restricted to the given ids.
    pub fn selected_labs(&self, only: &[String]) -> Result<Vec<&LabConfig>, ConfigError> {
        for id in only {
            self.lab(id)?;
        }
        Ok(self
            .labs
            .iter()
            .filter(|l| l.enabled)
            .filter(|l| only.is_empty() || only.contains(&l.id))
            .collect())
    }

    /// Find the lab and group owning a forge project path.
    pub fn locate_project(&self, project_path: &str) -> Option<(&LabConfig, String)> {
        self.labs.iter().find_map(|lab| {
            let prefix = format!("{}/", lab.group_namespace.trim_end_matches('/'));
            let rest = project_path.strip_prefix(&prefix)?;
            let (group, lab_id) = rest.split_once('/')?;
            (lab_id == lab.id && !group.contains('/')).then(|| (lab, group.to_string()))
        })
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
