//! Executor interfaces for the report pipeline.
//!
//! The orchestrator never looks inside the pipeline. It hands an executor
//! the run's options plus a [`RunContext`], and the executor reports back
//! through that context while it works.

pub mod command;
pub mod log_parser;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{LogLevel, RunMode, RunOptions, RunStats};

// Re-export the command-line executor
pub use command::CommandExecutor;

/// Step label and progress of a run the moment its executor is invoked
pub const LAUNCH_STEP: &str = "starting";
pub const LAUNCH_PROGRESS: u8 = 2;

/// Callbacks available to an executor during a run.
///
/// Calls are synchronous and take effect in call order: each one is
/// persisted before it is broadcast.
pub trait RunContext: Send + Sync {
    /// Report stage progress (0-100, never lowered) and counters to merge.
    /// An empty `step` keeps the current label.
    fn emit_progress(&self, progress: u8, step: &str, stats: RunStats);

    /// Record one log line
    fn emit_log(&self, level: LogLevel, module: &str, message: &str);

    /// Poll at stage boundaries; return [`ExecutionOutcome::Cancelled`] when true
    fn is_cancelled(&self) -> bool;
}

/// How an execution ended, short of failing
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The pipeline finished its work
    Completed {
        /// Report file, if the pipeline wrote one (dry runs may not)
        output_path: Option<String>,

        /// Final counters, merged into the run's stats
        stats: RunStats,
    },

    /// The executor observed cancellation and stopped early
    Cancelled,
}

impl ExecutionOutcome {
    pub fn completed(output_path: Option<String>, stats: RunStats) -> Self {
        Self::Completed { output_path, stats }
    }
}

/// The pipeline reported a failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{description}")]
pub struct ExecutorFailure {
    pub description: String,

    /// The executor had nothing better than a generic description; the
    /// run's last logged line is recorded instead when there is one
    pub prefer_last_log: bool,
}

impl ExecutorFailure {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            prefer_last_log: false,
        }
    }

    /// A failure without a message of its own (e.g. a bare exit code)
    pub fn unexplained(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            prefer_last_log: true,
        }
    }
}

/// Trait for report pipeline executors
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// One-line description of what `execute` will launch, for the run log
    fn describe(&self, mode: RunMode, options: &RunOptions) -> String;

    /// Run the pipeline to completion, cancellation, or failure
    async fn execute(
        &self,
        mode: RunMode,
        options: &RunOptions,
        ctx: &dyn RunContext,
    ) -> Result<ExecutionOutcome, ExecutorFailure>;
}
