//! Run records and the partial updates applied to them.
//!
//! A Run is one tracked execution of the report pipeline, from submission
//! to exactly one terminal status.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ParseEnumError, RunError};

/// Named counters accumulated over a run (e.g. `unique_articles`).
pub type RunStats = BTreeMap<String, Value>;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";
pub const DEFAULT_WEEKLY_CONFIG_PATH: &str = "config/weekly_config.yaml";

/// A report-generation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Strictly increasing, never reused
    pub id: i64,

    /// Which report the pipeline produces
    pub mode: RunMode,

    pub status: RunStatus,

    /// 0-100, never decreases while running
    pub progress: u8,

    /// Label of the active pipeline stage
    pub current_step: String,

    /// When the run was submitted
    pub started_at: DateTime<Utc>,

    /// Last time any field changed
    pub updated_at: DateTime<Utc>,

    pub ended_at: Option<DateTime<Utc>>,

    pub duration_seconds: Option<f64>,

    /// Report file, set only on success
    pub output_path: Option<String>,

    /// Set only on failure
    pub error_message: Option<String>,

    #[serde(default)]
    pub stats: RunStats,

    /// Submission parameters, immutable once the run exists
    pub options: RunOptions,
}

impl Run {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Report flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Regular digest over the configured feeds
    Daily,

    /// Weekly newsletter issue
    Weekly,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // "standard" is what the pipeline CLI calls the daily digest
            "daily" | "standard" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            _ => Err(ParseEnumError::new("mode", s)),
        }
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Queued or running
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseEnumError::new("status", s)),
        }
    }
}

/// Parameters a run was submitted with; copied verbatim on rerun
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Fetch and filter only, skip the AI step
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_config_path")]
    pub config_path: String,

    #[serde(default = "default_weekly_config_path")]
    pub weekly_config_path: String,

    /// Cap on articles sent to the AI step (daily mode)
    #[serde(default)]
    pub max_articles: Option<u32>,

    /// Look-back window in hours (daily mode)
    #[serde(default)]
    pub hours: Option<u32>,

    /// Passed through to the pipeline command line
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_config_path() -> String {
    DEFAULT_CONFIG_PATH.to_string()
}

fn default_weekly_config_path() -> String {
    DEFAULT_WEEKLY_CONFIG_PATH.to_string()
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            config_path: default_config_path(),
            weekly_config_path: default_weekly_config_path(),
            max_articles: None,
            hours: None,
            extra_args: Vec::new(),
        }
    }
}

impl RunOptions {
    /// Trim and check a submission.
    ///
    /// Blank config paths fall back to the defaults and blank extra
    /// arguments are dropped. Zero limits are rejected.
    pub fn validated(mut self) -> Result<Self, RunError> {
        self.config_path = self.config_path.trim().to_string();
        if self.config_path.is_empty() {
            self.config_path = default_config_path();
        }

        self.weekly_config_path = self.weekly_config_path.trim().to_string();
        if self.weekly_config_path.is_empty() {
            self.weekly_config_path = default_weekly_config_path();
        }

        if self.max_articles == Some(0) {
            return Err(RunError::Validation(
                "max_articles must be greater than zero".to_string(),
            ));
        }

        if self.hours == Some(0) {
            return Err(RunError::Validation(
                "hours must be greater than zero".to_string(),
            ));
        }

        self.extra_args = self
            .extra_args
            .into_iter()
            .map(|arg| arg.trim().to_string())
            .filter(|arg| !arg.is_empty())
            .collect();

        Ok(self)
    }
}

/// Partial update of a run's mutable fields, applied atomically by the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub current_step: Option<String>,
    pub progress: Option<u8>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
    /// Merged into the existing stats, never replacing them
    pub stats: RunStats,
}

impl RunPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn ended_at(mut self, ended_at: DateTime<Utc>) -> Self {
        self.ended_at = Some(ended_at);
        self
    }

    pub fn duration_seconds(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn output_path(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn stats(mut self, stats: RunStats) -> Self {
        merge_stats(&mut self.stats, stats);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the present fields to a run
    pub fn apply(&self, run: &mut Run) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(ref step) = self.current_step {
            run.current_step = step.clone();
        }
        if let Some(progress) = self.progress {
            run.progress = progress;
        }
        if let Some(ended_at) = self.ended_at {
            run.ended_at = Some(ended_at);
        }
        if let Some(duration) = self.duration_seconds {
            run.duration_seconds = Some(duration);
        }
        if let Some(ref path) = self.output_path {
            run.output_path = Some(path.clone());
        }
        if let Some(ref message) = self.error_message {
            run.error_message = Some(message.clone());
        }
        merge_stats(&mut run.stats, self.stats.clone());
    }
}

/// Merge `patch` into `stats`.
///
/// Object values are merged one level deep so per-category counters
/// accumulate; everything else is overwritten. Keys are never removed.
pub fn merge_stats(stats: &mut RunStats, patch: RunStats) {
    for (key, value) in patch {
        match (stats.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                existing.extend(incoming);
            }
            (_, value) => {
                stats.insert(key, value);
            }
        }
    }
}
