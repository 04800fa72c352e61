//! Report artifacts produced by successful runs.
//!
//! The pipeline writes the Markdown file; this module only locates it
//! inside the project root and reads it back for preview or removal.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::RunError;

/// Preview of a run's report file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPreview {
    /// Resolved absolute path
    pub path: String,

    /// File content, cut at the configured character limit
    pub content: String,

    /// Whether `content` was cut
    pub truncated: bool,
}

impl ArtifactPreview {
    /// Read an artifact, keeping at most `max_chars` characters
    pub fn load(path: &Path, max_chars: usize) -> Result<Self, RunError> {
        if !path.is_file() {
            return Err(RunError::ArtifactUnavailable(format!(
                "file does not exist: {}",
                path.display()
            )));
        }

        let bytes = std::fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes);

        let truncated = text.chars().count() > max_chars;
        let content = if truncated {
            text.chars().take(max_chars).collect()
        } else {
            text.into_owned()
        };

        Ok(Self {
            path: path.display().to_string(),
            content,
            truncated,
        })
    }
}

/// Resolve an output path recorded by the pipeline.
///
/// Relative paths are taken from `project_root`. The result must exist and
/// stay inside the project root.
pub fn resolve_artifact_path(project_root: &Path, path_text: &str) -> Result<PathBuf, RunError> {
    let path = PathBuf::from(path_text);
    let path = if path.is_absolute() {
        path
    } else {
        project_root.join(path)
    };

    let resolved = path.canonicalize().map_err(|_| {
        RunError::ArtifactUnavailable(format!("file does not exist: {}", path.display()))
    })?;
    let root = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());

    if !resolved.starts_with(&root) {
        return Err(RunError::Validation(format!(
            "artifact path is outside the project root: {}",
            resolved.display()
        )));
    }

    Ok(resolved)
}
