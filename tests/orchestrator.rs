//! Orchestrator Integration Tests
//!
//! Drives the orchestrator with scripted executors and checks run
//! lifecycles, admission control, cancellation and stream delivery.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

use rss_agent::adapters::{ExecutionOutcome, ExecutorFailure, PipelineExecutor, RunContext};
use rss_agent::core::{OrchestratorSettings, RunOrchestrator, RunStore, Subscription};
use rss_agent::domain::{LogLevel, RunMode, RunOptions, RunPatch, RunStats, RunStatus, StreamEvent};
use rss_agent::RunError;

/// Executor whose behaviour is set up per test
#[derive(Default)]
struct ScriptedExecutor {
    logs_before_gate: usize,
    logs_after_gate: usize,
    gate: Option<Arc<Semaphore>>,
    reached_gate: Arc<Notify>,
    hold_until_cancelled: bool,
    failure: Option<String>,
    /// Fail the way a bare non-zero exit does, with no message of its own
    unexplained_failure: bool,
    panic: bool,
    /// Writes `output/report-<n>.md` under this root and reports it
    artifact_root: Option<PathBuf>,
    artifacts_written: AtomicUsize,
}

#[async_trait]
impl PipelineExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn describe(&self, mode: RunMode, options: &RunOptions) -> String {
        format!("scripted {} dry_run={}", mode, options.dry_run)
    }

    async fn execute(
        &self,
        _mode: RunMode,
        _options: &RunOptions,
        ctx: &dyn RunContext,
    ) -> Result<ExecutionOutcome, ExecutorFailure> {
        for i in 0..self.logs_before_gate {
            ctx.emit_log(LogLevel::Info, "scripted", &format!("before {}", i));
            ctx.emit_progress((10 + i).min(90) as u8, "working", RunStats::new());
        }
        self.reached_gate.notify_one();

        if let Some(ref gate) = self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| ExecutorFailure::new("gate closed"))?;
        }

        while self.hold_until_cancelled {
            if ctx.is_cancelled() {
                return Ok(ExecutionOutcome::Cancelled);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for i in 0..self.logs_after_gate {
            ctx.emit_log(LogLevel::Info, "scripted", &format!("after {}", i));
        }

        if self.panic {
            panic!("scripted panic");
        }
        if let Some(ref failure) = self.failure {
            ctx.emit_log(LogLevel::Error, "scripted", failure);
            return Err(ExecutorFailure::new(failure.clone()));
        }
        if self.unexplained_failure {
            return Err(ExecutorFailure::unexplained("Pipeline exited with code 2"));
        }

        let output_path = match self.artifact_root {
            Some(ref root) => {
                let n = self.artifacts_written.fetch_add(1, Ordering::SeqCst);
                let relative = format!("output/report-{}.md", n);
                std::fs::create_dir_all(root.join("output")).unwrap();
                std::fs::write(root.join(&relative), "# Report\n").unwrap();
                Some(relative)
            }
            None => None,
        };

        let mut stats = RunStats::new();
        stats.insert(
            "unique_articles".to_string(),
            json!(self.logs_before_gate + self.logs_after_gate),
        );
        Ok(ExecutionOutcome::completed(output_path, stats))
    }
}

struct Harness {
    orchestrator: RunOrchestrator,
    store: Arc<RunStore>,
    /// Keeps the database and artifacts alive for the test
    _root: TempDir,
}

fn harness_in(
    root: TempDir,
    executor: ScriptedExecutor,
    configure: impl FnOnce(OrchestratorSettings) -> OrchestratorSettings,
) -> Harness {
    let store = Arc::new(RunStore::open(&root.path().join("runs.db")).unwrap());
    let settings =
        configure(OrchestratorSettings::new(root.path()).with_release_grace(Duration::from_millis(50)));
    let orchestrator =
        RunOrchestrator::new(Arc::clone(&store), Arc::new(executor), settings).unwrap();

    Harness {
        orchestrator,
        store,
        _root: root,
    }
}

fn harness_with(executor: ScriptedExecutor, max_concurrent_runs: usize) -> Harness {
    harness_in(TempDir::new().unwrap(), executor, |settings| {
        settings.with_max_concurrent_runs(max_concurrent_runs)
    })
}

fn harness(executor: ScriptedExecutor) -> Harness {
    harness_with(executor, 1)
}

async fn collect(subscription: Subscription) -> Vec<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(10), async move {
        let mut subscription = subscription;
        let mut events = Vec::new();
        while let Some(event) = subscription.next().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("stream did not finish")
}

async fn wait_for(orchestrator: &RunOrchestrator, run_id: i64) -> Vec<StreamEvent> {
    collect(orchestrator.subscribe(run_id).unwrap()).await
}

async fn wait_until_running(orchestrator: &RunOrchestrator, run_id: i64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while orchestrator.get_run(run_id).unwrap().status != RunStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run never started");
}

fn log_ids(events: &[StreamEvent]) -> Vec<i64> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Log(entry) => Some(entry.id),
            _ => None,
        })
        .collect()
}

fn done_count(events: &[StreamEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, StreamEvent::Done(_)))
        .count()
}

#[tokio::test]
async fn test_scenario_a_dry_run_succeeds() {
    let h = harness(ScriptedExecutor {
        logs_before_gate: 3,
        ..Default::default()
    });

    let options = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };
    let run_id = h.orchestrator.start_run(RunMode::Daily, options).unwrap();
    let events = wait_for(&h.orchestrator, run_id).await;

    let statuses: Vec<RunStatus> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Run(run) => Some(run.status),
            _ => None,
        })
        .fold(Vec::new(), |mut seen, status| {
            if seen.last() != Some(&status) {
                seen.push(status);
            }
            seen
        });
    assert_eq!(
        statuses,
        vec![RunStatus::Queued, RunStatus::Running, RunStatus::Success]
    );
    assert_eq!(
        events.last(),
        Some(&StreamEvent::done(run_id, RunStatus::Success))
    );

    let run = h.orchestrator.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.progress, 100);
    assert!(run.error_message.is_none());
    assert!(run.ended_at.is_some());
    assert!(run.duration_seconds.is_some());
    assert!(run.options.dry_run);
    assert_eq!(run.stats["unique_articles"], json!(3));
}

#[tokio::test]
async fn test_scenario_b_second_submission_conflicts() {
    let h = harness(ScriptedExecutor {
        hold_until_cancelled: true,
        ..Default::default()
    });

    let first = h
        .orchestrator
        .start_run(RunMode::Weekly, RunOptions::default())
        .unwrap();
    wait_until_running(&h.orchestrator, first).await;

    let second = h.orchestrator.start_run(RunMode::Daily, RunOptions::default());
    assert!(matches!(second, Err(RunError::Conflict(_))));

    assert_eq!(h.orchestrator.get_run(first).unwrap().status, RunStatus::Running);
    assert_eq!(h.orchestrator.list_runs(10).unwrap().len(), 1);

    h.orchestrator.cancel_run(first).unwrap();
    wait_for(&h.orchestrator, first).await;

    // The slot frees up as soon as `done` is out
    let third = h
        .orchestrator
        .start_run(RunMode::Daily, RunOptions::default())
        .unwrap();
    assert!(third > first);
    wait_until_running(&h.orchestrator, third).await;
    h.orchestrator.cancel_run(third).unwrap();
    wait_for(&h.orchestrator, third).await;
}

#[tokio::test]
async fn test_scenario_c_cancel_emits_single_done() {
    let h = harness(ScriptedExecutor {
        logs_before_gate: 2,
        hold_until_cancelled: true,
        ..Default::default()
    });

    let run_id = h
        .orchestrator
        .start_run(RunMode::Daily, RunOptions::default())
        .unwrap();
    let subscription = h.orchestrator.subscribe(run_id).unwrap();
    wait_until_running(&h.orchestrator, run_id).await;

    let snapshot = h.orchestrator.cancel_run(run_id).unwrap();
    assert_eq!(snapshot.status, RunStatus::Running);

    let events = collect(subscription).await;
    assert_eq!(done_count(&events), 1);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::done(run_id, RunStatus::Cancelled))
    );

    let run = h.orchestrator.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.output_path.is_none());
    assert!(run.error_message.is_none());

    // Nothing is logged once the run is over
    let stored: Vec<i64> = h.store.all_logs(run_id).unwrap().iter().map(|e| e.id).collect();
    assert_eq!(log_ids(&events), stored);

    assert!(matches!(
        h.orchestrator.cancel_run(run_id),
        Err(RunError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_cancel_of_queued_run_conflicts() {
    let h = harness(ScriptedExecutor {
        logs_before_gate: 1,
        ..Default::default()
    });

    // The run task has not been polled yet on this single-threaded runtime
    let run_id = h
        .orchestrator
        .start_run(RunMode::Daily, RunOptions::default())
        .unwrap();
    assert!(matches!(
        h.orchestrator.cancel_run(run_id),
        Err(RunError::Conflict(message)) if message.contains("queued")
    ));

    let events = wait_for(&h.orchestrator, run_id).await;
    assert_eq!(
        events.last(),
        Some(&StreamEvent::done(run_id, RunStatus::Success))
    );
}

#[tokio::test]
async fn test_scenario_d_delete_with_and_without_artifact() {
    let root = TempDir::new().unwrap();
    let project_root = root.path().to_path_buf();
    let h = harness_in(
        root,
        ScriptedExecutor {
            artifact_root: Some(project_root.clone()),
            ..Default::default()
        },
        |settings| settings,
    );

    let keep = h
        .orchestrator
        .start_run(RunMode::Daily, RunOptions::default())
        .unwrap();
    wait_for(&h.orchestrator, keep).await;
    let kept_file = project_root.join("output/report-0.md");
    assert!(kept_file.exists());

    let outcome = h.orchestrator.delete_run(keep, false).unwrap();
    assert!(outcome.deleted);
    assert!(!outcome.artifact_deleted);
    assert!(kept_file.exists());
    assert!(matches!(h.orchestrator.get_run(keep), Err(RunError::NotFound(_))));

    let remove = h
        .orchestrator
        .start_run(RunMode::Daily, RunOptions::default())
        .unwrap();
    wait_for(&h.orchestrator, remove).await;
    let removed_file = project_root.join("output/report-1.md");

    let preview = h.orchestrator.artifact_preview(remove).unwrap();
    assert_eq!(preview.content, "# Report\n");

    let outcome = h.orchestrator.delete_run(remove, true).unwrap();
    assert!(outcome.artifact_deleted);
    assert!(!removed_file.exists());
    assert!(matches!(
        h.orchestrator.delete_run(remove, true),
        Err(RunError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_running_run_conflicts() {
    let h = harness(ScriptedExecutor {
        hold_until_cancelled: true,
        ..Default::default()
    });

    let run_id = h
        .orchestrator
        .start_run(RunMode::Weekly, RunOptions::default())
        .unwrap();
    wait_until_running(&h.orchestrator, run_id).await;

    assert!(matches!(
        h.orchestrator.delete_run(run_id, false),
        Err(RunError::Conflict(_))
    ));
    assert!(h.orchestrator.get_run(run_id).is_ok());

    h.orchestrator.cancel_run(run_id).unwrap();
    wait_for(&h.orchestrator, run_id).await;

    assert!(h.orchestrator.delete_run(run_id, false).unwrap().deleted);
    assert!(matches!(
        h.orchestrator.get_run(run_id),
        Err(RunError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_failure_records_error_message() {
    let h = harness(ScriptedExecutor {
        logs_before_gate: 1,
        failure: Some("feed list missing".to_string()),
        ..Default::default()
    });

    let run_id = h
        .orchestrator
        .start_run(RunMode::Daily, RunOptions::default())
        .unwrap();
    let events = wait_for(&h.orchestrator, run_id).await;

    assert_eq!(
        events.last(),
        Some(&StreamEvent::done(run_id, RunStatus::Failed))
    );
    let run = h.orchestrator.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("feed list missing"));
    assert!(run.output_path.is_none());
    assert!(run.progress < 100);
}

#[tokio::test]
async fn test_bare_failure_records_last_pipeline_line() {
    let h = harness(ScriptedExecutor {
        logs_before_gate: 2,
        unexplained_failure: true,
        ..Default::default()
    });

    let run_id = h
        .orchestrator
        .start_run(RunMode::Weekly, RunOptions::default())
        .unwrap();
    wait_for(&h.orchestrator, run_id).await;

    let run = h.orchestrator.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("before 1"));
}

#[tokio::test]
async fn test_bare_failure_without_pipeline_output_keeps_description() {
    let h = harness(ScriptedExecutor {
        unexplained_failure: true,
        ..Default::default()
    });

    let run_id = h
        .orchestrator
        .start_run(RunMode::Daily, RunOptions::default())
        .unwrap();
    wait_for(&h.orchestrator, run_id).await;

    let run = h.orchestrator.get_run(run_id).unwrap();
    assert_eq!(run.error_message.as_deref(), Some("Pipeline exited with code 2"));
}

#[tokio::test]
async fn test_panicking_executor_fails_the_run() {
    let h = harness(ScriptedExecutor {
        panic: true,
        ..Default::default()
    });

    let run_id = h
        .orchestrator
        .start_run(RunMode::Weekly, RunOptions::default())
        .unwrap();
    wait_for(&h.orchestrator, run_id).await;

    let run = h.orchestrator.get_run(run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("Executor panicked"));
    assert!(!h.orchestrator.is_active(run_id));
}

#[tokio::test]
async fn test_rerun_copies_options_and_leaves_source() {
    let h = harness(ScriptedExecutor::default());

    let options = RunOptions {
        dry_run: true,
        config_path: "config/custom.yaml".to_string(),
        max_articles: Some(25),
        hours: Some(48),
        extra_args: vec!["--verbose".to_string()],
        ..RunOptions::default()
    };
    let source = h
        .orchestrator
        .start_run(RunMode::Daily, options.clone())
        .unwrap();
    wait_for(&h.orchestrator, source).await;

    let rerun = h.orchestrator.rerun(source).unwrap();
    wait_for(&h.orchestrator, rerun).await;

    let source_run = h.orchestrator.get_run(source).unwrap();
    let rerun_run = h.orchestrator.get_run(rerun).unwrap();
    assert!(rerun > source);
    assert_eq!(rerun_run.mode, RunMode::Daily);
    assert_eq!(rerun_run.options, source_run.options);
    assert_eq!(rerun_run.options, options);

    h.orchestrator.delete_run(rerun, true).unwrap();
    assert_eq!(h.orchestrator.get_run(source).unwrap(), source_run);

    assert!(matches!(h.orchestrator.rerun(9_999), Err(RunError::NotFound(9_999))));
}

#[tokio::test]
async fn test_invalid_options_create_nothing() {
    let h = harness(ScriptedExecutor::default());

    let options = RunOptions {
        max_articles: Some(0),
        ..RunOptions::default()
    };
    assert!(matches!(
        h.orchestrator.start_run(RunMode::Daily, options),
        Err(RunError::Validation(_))
    ));
    assert!(h.orchestrator.list_runs(10).unwrap().is_empty());
    assert_eq!(h.orchestrator.active_count(), 0);
}

#[tokio::test]
async fn test_late_subscriber_gets_backfill_then_live() {
    let gate = Arc::new(Semaphore::new(0));
    let reached = Arc::new(Notify::new());
    let h = harness(ScriptedExecutor {
        logs_before_gate: 5,
        logs_after_gate: 4,
        gate: Some(Arc::clone(&gate)),
        reached_gate: Arc::clone(&reached),
        ..Default::default()
    });

    let run_id = h
        .orchestrator
        .start_run(RunMode::Weekly, RunOptions::default())
        .unwrap();
    reached.notified().await;

    let mut subscription = h.orchestrator.subscribe(run_id).unwrap();
    let backfilled = subscription.pending_backfill();
    let mut backfill = Vec::new();
    for _ in 0..backfilled {
        backfill.push(subscription.next().await.unwrap());
    }

    // Lifecycle line plus the five emitted before the gate, then the snapshot
    assert_eq!(log_ids(&backfill).len(), 6);
    assert!(matches!(backfill.last(), Some(StreamEvent::Run(run)) if run.status == RunStatus::Running));

    gate.add_permits(1);
    let live = collect(subscription).await;

    let mut ids = log_ids(&backfill);
    ids.extend(log_ids(&live));
    let stored: Vec<i64> = h.store.all_logs(run_id).unwrap().iter().map(|e| e.id).collect();
    assert_eq!(ids, stored);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(done_count(&live), 1);
}

#[tokio::test]
async fn test_slow_subscriber_still_sees_every_line_and_done() {
    let h = harness_in(
        TempDir::new().unwrap(),
        ScriptedExecutor {
            logs_before_gate: 20,
            logs_after_gate: 10,
            ..Default::default()
        },
        |settings| settings.with_subscriber_capacity(4),
    );

    let run_id = h
        .orchestrator
        .start_run(RunMode::Weekly, RunOptions::default())
        .unwrap();
    let subscription = h.orchestrator.subscribe(run_id).unwrap();

    // Read nothing until the run is over
    tokio::time::timeout(Duration::from_secs(10), async {
        while h.orchestrator.is_active(run_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("run did not finish");

    let events = collect(subscription).await;
    let stored: Vec<i64> = h.store.all_logs(run_id).unwrap().iter().map(|e| e.id).collect();
    assert_eq!(stored.len(), 32);
    assert_eq!(log_ids(&events), stored);
    assert_eq!(done_count(&events), 1);
    assert_eq!(
        events.last(),
        Some(&StreamEvent::done(run_id, RunStatus::Success))
    );
}

#[tokio::test]
async fn test_subscribe_after_release_replays_history() {
    let h = harness(ScriptedExecutor {
        logs_before_gate: 2,
        ..Default::default()
    });

    let run_id = h
        .orchestrator
        .start_run(RunMode::Daily, RunOptions::default())
        .unwrap();
    let live = wait_for(&h.orchestrator, run_id).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let replay = wait_for(&h.orchestrator, run_id).await;
    assert_eq!(log_ids(&replay), log_ids(&live));
    assert_eq!(
        replay.last(),
        Some(&StreamEvent::done(run_id, RunStatus::Success))
    );
    assert!(matches!(
        h.orchestrator.subscribe(4_242),
        Err(RunError::NotFound(4_242))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_respect_limit() {
    let h = harness_with(
        ScriptedExecutor {
            hold_until_cancelled: true,
            ..Default::default()
        },
        2,
    );

    let attempts: Vec<_> = (0..10)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.start_run(RunMode::Daily, RunOptions::default()) })
        })
        .collect();

    let mut started = Vec::new();
    let mut conflicts = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(run_id) => started.push(run_id),
            Err(RunError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(started.len(), 2);
    assert_eq!(conflicts, 8);
    assert_eq!(h.orchestrator.active_count(), 2);

    for run_id in started {
        wait_until_running(&h.orchestrator, run_id).await;
        h.orchestrator.cancel_run(run_id).unwrap();
        wait_for(&h.orchestrator, run_id).await;
    }
    assert_eq!(h.orchestrator.active_count(), 0);
}

#[tokio::test]
async fn test_restart_fails_interrupted_runs() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(RunStore::open(&root.path().join("runs.db")).unwrap());
    let stale = store.create_run(RunMode::Weekly, &RunOptions::default()).unwrap();
    store
        .update_run(stale, &RunPatch::new().status(RunStatus::Running).progress(45))
        .unwrap();

    let orchestrator = RunOrchestrator::new(
        Arc::clone(&store),
        Arc::new(ScriptedExecutor::default()),
        OrchestratorSettings::new(root.path()),
    )
    .unwrap();

    let run = orchestrator.get_run(stale).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.unwrap().contains("interrupted"));
    assert_eq!(run.progress, 45);

    // Admission is not blocked by the stale row
    let fresh = orchestrator
        .start_run(RunMode::Daily, RunOptions::default())
        .unwrap();
    wait_for(&orchestrator, fresh).await;
}
