//! Events pushed to live subscribers of a run.
//!
//! Serialized as `{"type": "...", "data": ...}`, the shape the dashboard
//! consumes from the event stream.

use serde::{Deserialize, Serialize};

use super::log::LogEntry;
use super::run::{Run, RunStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// One appended log line
    Log(LogEntry),

    /// Full snapshot of the run after a change
    Run(Run),

    /// The run reached a terminal status; nothing follows
    Done(DoneEvent),

    /// The run record was deleted; nothing follows
    Deleted(DeletedEvent),
}

impl StreamEvent {
    pub fn done(run_id: i64, status: RunStatus) -> Self {
        Self::Done(DoneEvent { run_id, status })
    }

    pub fn deleted(run_id: i64) -> Self {
        Self::Deleted(DeletedEvent { run_id })
    }

    /// Name used for the SSE `event:` field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::Run(_) => "run",
            Self::Done(_) => "done",
            Self::Deleted(_) => "deleted",
        }
    }

    /// True for `done` and `deleted`
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Deleted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneEvent {
    pub run_id: i64,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedEvent {
    pub run_id: i64,
}
