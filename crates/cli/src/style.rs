//! Shared styling utilities for CLI output.

use comfy_table::{Cell, Color};
use console::Style;

use labsync_core::models::{GradingStatus, HotfixOutcome};

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Table cell for a grading status.
pub fn status_cell(status: GradingStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        GradingStatus::NoSubmission => cell,
        GradingStatus::AwaitingGrading => cell.fg(Color::Yellow),
        GradingStatus::InProgress => cell.fg(Color::Blue),
        GradingStatus::Complete => cell.fg(Color::Green),
        GradingStatus::Incomplete => cell.fg(Color::Red),
    }
}

/// Table cell for a hotfix outcome.
pub fn outcome_cell(outcome: &HotfixOutcome) -> Cell {
    let cell = Cell::new(outcome.label());
    match outcome {
        HotfixOutcome::AppliedClean { .. } => cell.fg(Color::Green),
        HotfixOutcome::AlreadyApplied => cell.fg(Color::DarkGrey),
        HotfixOutcome::Conflict { .. } => cell.fg(Color::Yellow),
        HotfixOutcome::Failed { .. } => cell.fg(Color::Red),
    }
}
