// Name and path checks applied before anything reaches a subprocess.
use regex::Regex;
use std::path::{Component, Path};
use std::sync::LazyLock;

use crate::errors::{AppError, Result};

static DATABASE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]{0,62}$").expect("valid regex"));

static UNSAFE_SEGMENT_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("valid regex"));

pub fn is_valid_database_name(name: &str) -> bool {
    DATABASE_NAME.is_match(name)
}

pub fn validate_database_name(name: &str) -> Result<()> {
    if is_valid_database_name(name) {
        Ok(())
    } else {
        Err(AppError::InvalidIdentifier(format!(
            "'{}' is not an acceptable database name",
            name
        )))
    }
}

/// Rejects paths that climb out of their directory.
pub fn validate_artifact_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(AppError::InvalidIdentifier("empty artifact path".to_string()));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(AppError::InvalidIdentifier(format!(
            "artifact path {} contains '..'",
            path.display()
        )));
    }
    if path.file_name().is_none() {
        return Err(AppError::InvalidIdentifier(format!(
            "artifact path {} has no file name",
            path.display()
        )));
    }
    Ok(())
}

/// Collapses anything outside `[A-Za-z0-9_-]` so the value can be embedded in a folder name.
pub fn folder_segment(raw: &str) -> String {
    let cleaned = UNSAFE_SEGMENT_CHARS.replace_all(raw.trim(), "-");
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned.to_string()
    }
}
