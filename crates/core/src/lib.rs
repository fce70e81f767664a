//! labsync core library.
//!
//! Watches student group projects on a GitLab-style forge for submission
//! tags, tracks each submission through grading via status labels on a
//! per-group merge request or issue, and merges problem-branch hotfixes into
//! group projects. Group projects are provisioned with the labsync webhook
//! and protected submission tags.

pub mod cache;
pub mod config;
pub mod db;
pub mod detector;
pub mod engine;
pub mod errors;
pub mod forge;
pub mod git;
pub mod grading;
pub mod hotfix;
pub mod models;
pub mod provision;
pub mod registry;
pub mod retry;
pub mod roster;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use engine::{CycleFilter, PollEngine};
pub use forge::{Forge, GitLabForge};
pub use grading::GradingMachine;
pub use hotfix::{HotfixOptions, HotfixPropagator};
pub use provision::Provisioner;
pub use registry::Registry;
pub use roster::{RosterFile, RosterSource};
