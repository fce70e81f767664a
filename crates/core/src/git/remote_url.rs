//! Clone URL derivation for GitLab projects.
//!
//! Builds the HTTPS (or `file://`) URL of a project from the configured API
//! URL, or from an explicit clone base override.

/// Derive the clone URL of the project at `project_path`
/// (`namespace/.../name`).
///
/// Resolution order:
/// 1. If `git_base_url` is `Some(non-empty)`, use it as the base.
/// 2. Otherwise derive from `api_url`:
///    - `https://<host>/api/v4`  → `https://<host>`
///    - `https://<host>/api/v4/` → `https://<host>` (trailing slash)
///    - Anything else            → strip trailing slash, use as-is
///
/// The resulting URL is `{base}/{project_path}.git`.
pub fn derive_project_url(api_url: &str, git_base_url: Option<&str>, project_path: &str) -> String {
    let base = derive_git_base_url(api_url, git_base_url);
    format!("{}/{}.git", base, project_path.trim_matches('/'))
}

/// Derive just the clone base URL (without project path).
///
/// See [`derive_project_url`] for resolution rules.
pub fn derive_git_base_url(api_url: &str, git_base_url: Option<&str>) -> String {
    if let Some(explicit) = git_base_url {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return trimmed.trim_end_matches('/').to_string();
        }
    }

    let url = api_url.trim().trim_end_matches('/');

    if let Some(base) = url.strip_suffix("/api/v4") {
        return base.to_string();
    }

    url.to_string()
}

/// Web URL of a tag, used in grading notes.
pub fn tag_web_url(api_url: &str, project_path: &str, tag: &str) -> String {
    format!(
        "{}/{}/-/tags/{}",
        derive_git_base_url(api_url, None),
        project_path.trim_matches('/'),
        tag
    )
}
