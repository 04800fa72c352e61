//! Error kinds shared by the store, the orchestrator and the API layer.

use thiserror::Error;

/// Errors surfaced by run operations.
///
/// Executor failures are not represented here: they never fail a
/// submission and only show up later as a `failed` run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Malformed submission, rejected before any run is created
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Unknown run id
    #[error("Run {0} not found")]
    NotFound(i64),

    /// Admission limit reached, or the run is in the wrong state
    #[error("{0}")]
    Conflict(String),

    /// The run exists but has no readable artifact
    #[error("Artifact unavailable: {0}")]
    ArtifactUnavailable(String),

    /// Persistence failure, scoped to the operation that raised it
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Returned when a stored or submitted enum value is not recognised.
#[derive(Debug, Error)]
#[error("Unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl From<ParseEnumError> for RunError {
    fn from(err: ParseEnumError) -> Self {
        RunError::Validation(err.to_string())
    }
}
