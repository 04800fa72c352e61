//! rss-agent - Run orchestrator and live event streaming for the RSS
//! report pipeline dashboard
//!
//! Accepts report-generation requests, runs the pipeline on a background
//! task, records every status change and log line in SQLite, and streams
//! them live to any number of subscribers.
//!
//! # Architecture
//!
//! - Runs and their log entries are the durable record (`RunStore`)
//! - One orchestrator owns admission, cancellation and teardown
//! - Each run has a broadcaster; late subscribers get a backfill of
//!   everything published so far, then the live stream
//! - Runs still active when the process stopped are failed on restart
//!
//! # Modules
//!
//! - `adapters`: Pipeline executors (command-line pipeline, log parsing)
//! - `core`: Orchestration logic (RunStore, EventBroadcaster, RunOrchestrator)
//! - `domain`: Data structures (Run, LogEntry, StreamEvent, ArtifactPreview)
//! - `api`: HTTP API (axum, SSE)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Serve the dashboard API
//! rss-agent serve --port 8765
//!
//! # Run a weekly report in the foreground
//! rss-agent run weekly --dry-run
//!
//! # Inspect history
//! rss-agent runs
//! rss-agent logs 12
//! ```

pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use adapters::{CommandExecutor, ExecutionOutcome, ExecutorFailure, PipelineExecutor, RunContext};
pub use crate::core::{EventBroadcaster, OrchestratorSettings, RunOrchestrator, RunStore, Subscription};
pub use domain::{LogEntry, LogLevel, Run, RunMode, RunOptions, RunStatus, StreamEvent};
pub use error::RunError;
