//! Error types for the labsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Forge(#[from] ForgeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Roster(#[from] RosterError),

    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error(transparent)]
    Grading(#[from] GradingError),

    #[error(transparent)]
    Hotfix(#[from] HotfixError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local Git (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// Push was rejected (non-fast-forward, protected branch, hook).
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GitError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GitError::Git2Error(e) => matches!(
                e.class(),
                git2::ErrorClass::Net | git2::ErrorClass::Http | git2::ErrorClass::Ssl
            ),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Forge API errors
// ---------------------------------------------------------------------------

/// Errors from the git forge REST API.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// HTTP-level transport error (network, TLS, timeout).
    #[error("forge HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("forge API error (HTTP {status}): {body}")]
    ApiError { status: u16, body: String },

    /// Authentication token is missing or invalid.
    #[error("forge authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Rate limit exceeded.
    #[error("forge rate limit exceeded, retry after {retry_after}")]
    RateLimited { retry_after: String },

    /// A project, merge request or issue does not exist.
    #[error("forge object not found: {0}")]
    NotFound(String),

    /// JSON deserialization failure.
    #[error("forge response parse error: {0}")]
    ParseError(String),
}

impl ForgeError {
    /// Timeouts, connection failures, rate limits and 5xx responses are
    /// worth retrying. Authentication failures and 404s are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ForgeError::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ForgeError::ApiError { status, .. } => *status >= 500,
            ForgeError::RateLimited { .. } => true,
            ForgeError::AuthenticationFailed(_)
            | ForgeError::NotFound(_)
            | ForgeError::ParseError(_) => false,
        }
    }

    /// Whether the error means the whole poll cycle cannot proceed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ForgeError::AuthenticationFailed(_))
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// A lab id was requested that is not configured.
    #[error("unknown lab '{0}'")]
    UnknownLab(String),

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored value could not be decoded.
    #[error("corrupt {entity} row: {detail}")]
    Corrupt { entity: String, detail: String },

    /// A status change not allowed from the stored status.
    #[error("grading request {request_id} cannot go from {from} to {to}")]
    InvalidTransition {
        request_id: i64,
        from: String,
        to: String,
    },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Roster errors
// ---------------------------------------------------------------------------

/// Errors from the roster source.
#[derive(Debug, Error)]
pub enum RosterError {
    /// The roster file could not be loaded.
    #[error("roster file error at '{path}': {detail}")]
    FileError { path: String, detail: String },

    /// TOML parse error when reading the roster file.
    #[error("roster parse error: {0}")]
    ParseError(String),

    /// A group has no usable project mapping.
    #[error("group '{group}' has no project mapping for lab '{lab}'")]
    MissingProject { lab: String, group: String },

    /// Fetching grader membership from the forge failed.
    #[error("roster forge error: {0}")]
    Forge(#[from] ForgeError),

    /// Persisting the synchronised roster failed.
    #[error("roster database error: {0}")]
    Database(#[from] DatabaseError),

    /// Generic I/O error.
    #[error("roster I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Submission detection errors
// ---------------------------------------------------------------------------

/// Errors from the submission detector.
#[derive(Debug, Error)]
pub enum DetectError {
    /// The tagged commit does not descend from any known problem branch
    /// head. The tag is held back and retried on the next poll.
    #[error("tag '{tag}' at {commit} does not descend from any known problem branch")]
    UnresolvedLineage { tag: String, commit: String },

    /// Underlying Git error while scanning.
    #[error("detect git error: {0}")]
    Git(#[from] GitError),
}

// ---------------------------------------------------------------------------
// Grading errors
// ---------------------------------------------------------------------------

/// Errors from the grading state machine.
#[derive(Debug, Error)]
pub enum GradingError {
    /// A status change that the transition graph does not allow.
    #[error("invalid grading transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// No grading request exists for the submission.
    #[error("no grading request for submission {0}")]
    NotRegistered(i64),

    /// Forge failure while updating the grading thread.
    #[error("grading forge error: {0}")]
    Forge(#[from] ForgeError),

    /// Database failure while persisting grading state.
    #[error("grading database error: {0}")]
    Database(#[from] DatabaseError),

    /// Publishing the submission branch failed.
    #[error("grading git error: {0}")]
    Git(#[from] GitError),
}

// ---------------------------------------------------------------------------
// Hotfix errors
// ---------------------------------------------------------------------------

/// Errors from the hotfix propagator that concern a whole run rather than a
/// single group.
#[derive(Debug, Error)]
pub enum HotfixError {
    /// The hotfix branch does not exist on the primary project.
    #[error("hotfix branch '{0}' not found on the primary project")]
    BranchNotFound(String),

    /// The hotfix branch shares no history with any problem branch.
    #[error("hotfix branch '{hotfix}' does not descend from problem branch '{problem}'")]
    UnrelatedHistory { hotfix: String, problem: String },

    /// The hotfix branch carries no changes of its own.
    #[error("hotfix branch '{0}' has no changes to propagate")]
    EmptyHotfix(String),

    /// Underlying Git error.
    #[error("hotfix git error: {0}")]
    Git(#[from] GitError),

    /// Roster or registry failure while enumerating groups.
    #[error("hotfix roster error: {0}")]
    Roster(#[from] RosterError),

    /// Database failure.
    #[error("hotfix database error: {0}")]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

/// Errors that abort a whole poll cycle.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another cycle is already running.
    #[error("poll cycle already in progress")]
    AlreadyRunning,

    /// A failure that affects every group (authentication, mapping).
    #[error("poll cycle aborted: {0}")]
    Fatal(String),

    /// Configuration problem surfaced during the cycle.
    #[error("poll configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Roster failure.
    #[error("poll roster error: {0}")]
    Roster(#[from] RosterError),

    /// Database failure.
    #[error("poll database error: {0}")]
    Database(#[from] DatabaseError),
}
