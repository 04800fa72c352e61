//! Domain types for the run orchestrator.
//!
//! This module contains the core data structures:
//! - Run: Report-generation run state and partial updates
//! - LogEntry: Captured pipeline output
//! - StreamEvent: What live subscribers receive
//! - ArtifactPreview: The report file a run produced

pub mod artifact;
pub mod events;
pub mod log;
pub mod run;

// Re-export commonly used types
pub use artifact::{resolve_artifact_path, ArtifactPreview};
pub use events::{DeletedEvent, DoneEvent, StreamEvent};
pub use log::{LogEntry, LogLevel, NewLogEntry};
pub use run::{merge_stats, Run, RunMode, RunOptions, RunPatch, RunStats, RunStatus};
