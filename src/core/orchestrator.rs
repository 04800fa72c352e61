//! Run lifecycle coordination.
//!
//! The orchestrator admits runs, drives each one on its own task through
//! the executor, and owns the registry of active runs and their
//! broadcasters. Store writes always happen before the matching broadcast.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::adapters::{
    ExecutionOutcome, ExecutorFailure, PipelineExecutor, RunContext, LAUNCH_PROGRESS, LAUNCH_STEP,
};
use crate::domain::{
    resolve_artifact_path, ArtifactPreview, LogEntry, LogLevel, NewLogEntry, Run, RunMode,
    RunOptions, RunPatch, RunStats, RunStatus,
};
use crate::error::RunError;

use super::broadcaster::{EventBroadcaster, Subscription};
use super::run_store::RunStore;

/// Module name on log lines written by the orchestrator itself
pub const LIFECYCLE_MODULE: &str = "orchestrator";

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Runs allowed to be queued or running at once
    pub max_concurrent_runs: usize,

    /// Per-subscriber channel capacity
    pub subscriber_capacity: usize,

    /// How long a finished run's broadcaster stays registered
    pub release_grace: Duration,

    /// Directory artifacts must resolve inside
    pub project_root: PathBuf,

    /// Artifact preview cut-off, in characters
    pub preview_max_chars: usize,
}

impl OrchestratorSettings {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            max_concurrent_runs: 1,
            subscriber_capacity: 256,
            release_grace: Duration::from_secs(30),
            project_root: project_root.into(),
            preview_max_chars: 120_000,
        }
    }

    pub fn with_max_concurrent_runs(mut self, limit: usize) -> Self {
        self.max_concurrent_runs = limit.max(1);
        self
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity.max(1);
        self
    }

    pub fn with_release_grace(mut self, grace: Duration) -> Self {
        self.release_grace = grace;
        self
    }

    pub fn with_preview_max_chars(mut self, max_chars: usize) -> Self {
        self.preview_max_chars = max_chars;
        self
    }
}

/// Result of deleting a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub deleted: bool,
    pub artifact_deleted: bool,
}

#[derive(Default)]
struct Registry {
    /// Queued or running runs
    active: HashMap<i64, CancellationToken>,
    /// Live broadcasters, kept through the release grace window
    broadcasters: HashMap<i64, Arc<EventBroadcaster>>,
}

/// Coordinates run admission, execution and teardown
#[derive(Clone)]
pub struct RunOrchestrator {
    store: Arc<RunStore>,
    executor: Arc<dyn PipelineExecutor>,
    settings: Arc<OrchestratorSettings>,
    registry: Arc<Mutex<Registry>>,
}

impl RunOrchestrator {
    /// Create an orchestrator, failing any run a previous process left active
    pub fn new(
        store: Arc<RunStore>,
        executor: Arc<dyn PipelineExecutor>,
        settings: OrchestratorSettings,
    ) -> Result<Self, RunError> {
        let interrupted = store.reconcile_interrupted()?;
        if !interrupted.is_empty() {
            let ids: Vec<i64> = interrupted.iter().map(|run| run.id).collect();
            warn!(?ids, "Marked runs interrupted by a restart as failed");
        }

        Ok(Self {
            store,
            executor,
            settings: Arc::new(settings),
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a run. Must be called from within a Tokio runtime.
    ///
    /// The store insert runs under the registry lock so admission and
    /// creation are one step. Store calls block the calling thread for the
    /// length of one SQLite statement.
    #[instrument(skip(self, options))]
    pub fn start_run(&self, mode: RunMode, options: RunOptions) -> Result<i64, RunError> {
        let options = options.validated()?;

        let mut registry = self.registry();
        if registry.active.len() >= self.settings.max_concurrent_runs {
            return Err(RunError::Conflict(format!(
                "A run is already in progress (limit {}); wait for it to finish",
                self.settings.max_concurrent_runs
            )));
        }

        let run_id = self.store.create_run(mode, &options)?;
        let run = self.store.get_run(run_id)?;
        let token = CancellationToken::new();
        let broadcaster = Arc::new(EventBroadcaster::new(run, self.settings.subscriber_capacity));

        registry.active.insert(run_id, token.clone());
        registry.broadcasters.insert(run_id, Arc::clone(&broadcaster));
        drop(registry);

        info!(run_id, "Run queued");

        let orchestrator = self.clone();
        tokio::spawn(
            async move {
                orchestrator
                    .execute_run(run_id, mode, options, token, broadcaster)
                    .await
            }
            .instrument(info_span!("run", run_id, mode = %mode)),
        );

        Ok(run_id)
    }

    /// Start a new run with another run's options
    #[instrument(skip(self))]
    pub fn rerun(&self, source_id: i64) -> Result<i64, RunError> {
        let source = self.store.get_run(source_id)?;
        self.start_run(source.mode, source.options)
    }

    /// Request cooperative cancellation of a running run
    #[instrument(skip(self))]
    pub fn cancel_run(&self, run_id: i64) -> Result<Run, RunError> {
        let registry = self.registry();
        let run = self.store.get_run(run_id)?;

        match registry.active.get(&run_id) {
            Some(token) if run.status == RunStatus::Running => {
                token.cancel();
                info!("Cancellation requested");
                Ok(run)
            }
            _ => Err(RunError::Conflict(format!(
                "Run {} is not running (status: {})",
                run_id, run.status
            ))),
        }
    }

    /// Remove a finished run and, optionally, its report file
    #[instrument(skip(self))]
    pub fn delete_run(&self, run_id: i64, delete_artifact: bool) -> Result<DeleteOutcome, RunError> {
        let mut registry = self.registry();
        let run = self.store.get_run(run_id)?;
        if registry.active.contains_key(&run_id) {
            return Err(RunError::Conflict(format!(
                "Run {} is still {}; cancel it first",
                run_id, run.status
            )));
        }

        let deleted = self.store.delete_run(run_id)?;
        if let Some(broadcaster) = registry.broadcasters.remove(&run_id) {
            broadcaster.publish_deleted();
        }
        drop(registry);

        let artifact_deleted = deleted && delete_artifact && self.remove_artifact(&run);
        info!(artifact_deleted, "Run deleted");

        Ok(DeleteOutcome {
            deleted,
            artifact_deleted,
        })
    }

    fn remove_artifact(&self, run: &Run) -> bool {
        let Some(path_text) = run.output_path.as_deref() else {
            return false;
        };

        let path = match resolve_artifact_path(&self.settings.project_root, path_text) {
            Ok(path) => path,
            Err(e) => {
                warn!(run_id = run.id, error = %e, "Artifact not removed");
                return false;
            }
        };

        match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = run.id, path = %path.display(), error = %e, "Failed to remove artifact");
                false
            }
        }
    }

    pub fn get_run(&self, run_id: i64) -> Result<Run, RunError> {
        self.store.get_run(run_id)
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>, RunError> {
        self.store.list_runs(limit)
    }

    /// Log entries with id greater than `after_id`
    pub fn list_logs(
        &self,
        run_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, RunError> {
        self.store.get_run(run_id)?;
        self.store.list_logs(run_id, after_id, limit)
    }

    /// Read the report a successful run produced
    pub fn artifact_preview(&self, run_id: i64) -> Result<ArtifactPreview, RunError> {
        let run = self.store.get_run(run_id)?;
        let path_text = run.output_path.as_deref().ok_or_else(|| {
            RunError::ArtifactUnavailable(format!("Run {} has no output file", run_id))
        })?;

        let path = resolve_artifact_path(&self.settings.project_root, path_text)?;
        ArtifactPreview::load(&path, self.settings.preview_max_chars)
    }

    /// Follow a run's events.
    ///
    /// Runs whose broadcaster was already released replay their stored
    /// history instead.
    pub fn subscribe(&self, run_id: i64) -> Result<Subscription, RunError> {
        let broadcaster = self.registry().broadcasters.get(&run_id).cloned();
        match broadcaster {
            Some(broadcaster) => Ok(broadcaster.subscribe()),
            None => {
                let run = self.store.get_run(run_id)?;
                let logs = self.store.all_logs(run_id)?;
                Ok(Subscription::detached(logs, run))
            }
        }
    }

    pub fn is_active(&self, run_id: i64) -> bool {
        self.registry().active.contains_key(&run_id)
    }

    pub fn active_count(&self) -> usize {
        self.registry().active.len()
    }

    async fn execute_run(
        self,
        run_id: i64,
        mode: RunMode,
        options: RunOptions,
        token: CancellationToken,
        broadcaster: Arc<EventBroadcaster>,
    ) {
        let started = Instant::now();
        let reporter = RunReporter::new(
            run_id,
            Arc::clone(&self.store),
            Arc::clone(&broadcaster),
            token.clone(),
        );

        reporter.begin(&self.executor.describe(mode, &options));
        let result = AssertUnwindSafe(self.executor.execute(mode, &options, &reporter))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ExecutorFailure::new("Executor panicked")));

        let status = self.finish_run(&reporter, &token, result, started);
        info!(%status, elapsed_ms = started.elapsed().as_millis() as u64, "Run finished");

        tokio::time::sleep(self.settings.release_grace).await;
        let mut registry = self.registry();
        if registry
            .broadcasters
            .get(&run_id)
            .is_some_and(|current| Arc::ptr_eq(current, &broadcaster))
        {
            registry.broadcasters.remove(&run_id);
            debug!(subscribers = broadcaster.subscriber_count(), "Broadcaster released");
        }
    }

    fn finish_run(
        &self,
        reporter: &RunReporter,
        token: &CancellationToken,
        result: Result<ExecutionOutcome, ExecutorFailure>,
        started: Instant,
    ) -> RunStatus {
        let run_id = reporter.run_id;
        let patch = RunPatch::new()
            .ended_at(Utc::now())
            .duration_seconds(started.elapsed().as_secs_f64());

        let (status, patch) = match result {
            Ok(ExecutionOutcome::Completed { output_path, stats }) if !token.is_cancelled() => {
                reporter.emit_log(LogLevel::Info, LIFECYCLE_MODULE, "Run succeeded");
                let mut patch = patch
                    .status(RunStatus::Success)
                    .current_step("finished")
                    .progress(100)
                    .stats(stats);
                if let Some(path) = output_path {
                    patch = patch.output_path(path);
                }
                (RunStatus::Success, patch)
            }
            Err(failure) if !token.is_cancelled() => {
                let message = self.failure_message(run_id, failure);
                reporter.emit_log(
                    LogLevel::Error,
                    LIFECYCLE_MODULE,
                    &format!("Run failed: {}", message),
                );
                (RunStatus::Failed, patch.status(RunStatus::Failed).error_message(message))
            }
            // An observed cancel token wins over whatever the executor returned.
            _ => {
                reporter.emit_log(LogLevel::Warning, LIFECYCLE_MODULE, "Run cancelled");
                (RunStatus::Cancelled, patch.status(RunStatus::Cancelled).current_step("cancelled"))
            }
        };

        let snapshot = match self.store.update_run(run_id, &patch) {
            Ok(run) => Some(run),
            Err(e) => {
                error!(error = %e, "Failed to record final run status");
                self.store.get_run(run_id).ok()
            }
        };

        let mut registry = self.registry();
        registry.active.remove(&run_id);
        if let Some(run) = snapshot {
            reporter.broadcaster.publish_run(run);
        }
        reporter.broadcaster.publish_done(status);

        status
    }

    /// Error message recorded for a failed run.
    ///
    /// A failure with no message of its own is described by the run's last
    /// pipeline log line when there is one.
    fn failure_message(&self, run_id: i64, failure: ExecutorFailure) -> String {
        if !failure.prefer_last_log {
            return failure.description;
        }

        match self.store.latest_log(run_id) {
            Ok(Some(entry)) if entry.module != LIFECYCLE_MODULE && !entry.message.trim().is_empty() => {
                entry.message
            }
            Ok(_) => failure.description,
            Err(e) => {
                warn!(error = %e, "Failed to read the last log line");
                failure.description
            }
        }
    }
}

/// The executor's view of a running run.
///
/// Each callback writes the store and then broadcasts, under one lock, so
/// subscribers see updates in callback order. Store writes are synchronous
/// and run on the executor's task.
struct RunReporter {
    run_id: i64,
    store: Arc<RunStore>,
    broadcaster: Arc<EventBroadcaster>,
    token: CancellationToken,
    /// Last recorded progress; held for the whole of every callback
    sequence: Mutex<u8>,
}

impl RunReporter {
    fn new(
        run_id: i64,
        store: Arc<RunStore>,
        broadcaster: Arc<EventBroadcaster>,
        token: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            store,
            broadcaster,
            token,
            sequence: Mutex::new(0),
        }
    }

    fn sequence(&self) -> MutexGuard<'_, u8> {
        self.sequence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the run to `running` and record what is about to execute
    fn begin(&self, description: &str) {
        {
            let mut progress = self.sequence();
            let patch = RunPatch::new()
                .status(RunStatus::Running)
                .current_step(LAUNCH_STEP)
                .progress(LAUNCH_PROGRESS);
            match self.store.update_run(self.run_id, &patch) {
                Ok(run) => {
                    *progress = run.progress;
                    self.broadcaster.publish_run(run);
                }
                Err(e) => error!(error = %e, "Failed to mark run as running"),
            }
        }

        self.emit_log(
            LogLevel::Info,
            LIFECYCLE_MODULE,
            &format!("Starting run: {}", description),
        );
    }
}

impl RunContext for RunReporter {
    fn emit_progress(&self, progress: u8, step: &str, stats: RunStats) {
        let mut current = self.sequence();
        let progress = progress.min(100).max(*current);

        let mut patch = RunPatch::new().progress(progress).stats(stats);
        if !step.is_empty() {
            patch = patch.current_step(step);
        }

        match self.store.update_run(self.run_id, &patch) {
            Ok(run) => {
                *current = run.progress;
                self.broadcaster.publish_run(run);
            }
            Err(e) => warn!(run_id = self.run_id, error = %e, "Failed to record progress"),
        }
    }

    fn emit_log(&self, level: LogLevel, module: &str, message: &str) {
        let _sequence = self.sequence();
        let entry = NewLogEntry::new(level, module, message);

        match self.store.append_log(self.run_id, &entry) {
            Ok(entry) => {
                self.broadcaster.publish_log(entry);
            }
            Err(e) => warn!(run_id = self.run_id, error = %e, "Failed to record log line"),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
