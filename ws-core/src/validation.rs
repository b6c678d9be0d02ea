//! Centralized validation logic for user-supplied identifiers.
//!
//! Workspace names end up in container names, directory names and database
//! unique indexes, so they are restricted to a conservative slug alphabet.

use regex::Regex;

use crate::error::{Result, WsError};

const WORKSPACE_NAME_PATTERN: &str = r"^[a-zA-Z0-9_.\-]+$";

/// Validate a workspace name against the slug pattern.
///
/// # Returns
/// * `Ok(())` if valid
/// * `Err(WsError::Validation)` if invalid
pub fn validate_workspace_name(name: &str) -> Result<()> {
    let name_regex = Regex::new(WORKSPACE_NAME_PATTERN)
        .map_err(|e| WsError::Internal(format!("Invalid regex pattern: {}", e)))?;
    if !name.is_empty() && name.chars().all(|c| c == '.') {
        return Err(WsError::Validation(format!(
            "Invalid workspace name '{}': a name cannot consist only of dots",
            name
        )));
    }
    if name_regex.is_match(name) {
        Ok(())
    } else {
        Err(WsError::Validation(format!(
            "Invalid workspace name '{}': only letters, digits, '-', '_' and '.' are allowed",
            name
        )))
    }
}

/// Derive a slug from a repository URL, e.g. `https://host/org/My Repo.git` -> `my-repo`.
pub fn workspace_name_from_repo_url(repo_url: &str) -> String {
    let base = repo_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(repo_url)
        .to_lowercase();
    let base = base.strip_suffix(".git").unwrap_or(&base);

    base.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Pick `initial`, or `initial2`, `initial3`, ... whichever is not taken yet.
pub fn suggest_unique_name(initial: &str, existing: &[String]) -> String {
    if !existing.iter().any(|n| n == initial) {
        return initial.to_string();
    }
    (2..)
        .map(|i| format!("{initial}{i}"))
        .find(|candidate| !existing.iter().any(|n| n == candidate))
        .unwrap_or_else(|| initial.to_string())
}
