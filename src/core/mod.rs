//! Core orchestration logic.
//!
//! This module contains:
//! - RunStore: Durable runs and log entries (SQLite)
//! - EventBroadcaster: Per-run live fan-out with backfill
//! - RunOrchestrator: Admission, execution and teardown of runs

pub mod broadcaster;
pub mod orchestrator;
pub mod run_store;

// Re-export commonly used types
pub use broadcaster::{EventBroadcaster, Subscription};
pub use orchestrator::{DeleteOutcome, OrchestratorSettings, RunOrchestrator, LIFECYCLE_MODULE};
pub use run_store::{RunStore, INTERRUPTED_MESSAGE, MAX_LOGS_PAGE, MAX_RUNS_PAGE};
