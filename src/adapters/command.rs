//! Command-line executor for the report pipeline.
//!
//! Spawns the pipeline script, streams its merged stdout/stderr through the
//! log parser, and polls for cancellation while it runs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::log_parser::{parse_log_line, StageTracker};
use super::{
    ExecutionOutcome, ExecutorFailure, PipelineExecutor, RunContext, LAUNCH_PROGRESS, LAUNCH_STEP,
};
use crate::domain::{LogLevel, RunMode, RunOptions};

/// Longest error message carried over from the pipeline's output
const MAX_ERROR_CHARS: usize = 400;

/// Executor that runs `<program> <script> <args...>` in the project root
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    script: String,
    working_dir: PathBuf,
    cancel_poll: Duration,
}

impl CommandExecutor {
    /// Create an executor for `python main.py` in the given directory
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "python".to_string(),
            script: "main.py".to_string(),
            working_dir: working_dir.into(),
            cancel_poll: Duration::from_millis(250),
        }
    }

    /// Use a different interpreter or binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Use a different entry script
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    /// How often cancellation is checked while the process runs
    pub fn with_cancel_poll(mut self, interval: Duration) -> Self {
        self.cancel_poll = interval.max(Duration::from_millis(10));
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Arguments passed to the program, script first
    pub fn build_args(&self, mode: RunMode, options: &RunOptions) -> Vec<String> {
        let mut args = vec![self.script.clone()];

        match mode {
            RunMode::Weekly => {
                args.push("--weekly".to_string());
                args.push("--weekly-config".to_string());
                args.push(options.weekly_config_path.clone());
            }
            RunMode::Daily => {
                args.push("--config".to_string());
                args.push(options.config_path.clone());
                if let Some(max_articles) = options.max_articles {
                    args.push("--max-articles".to_string());
                    args.push(max_articles.to_string());
                }
                if let Some(hours) = options.hours {
                    args.push("--hours".to_string());
                    args.push(hours.to_string());
                }
            }
        }

        if options.dry_run {
            args.push("--dry-run".to_string());
        }

        args.extend(options.extra_args.iter().cloned());
        args
    }

    fn spawn(&self, args: &[String]) -> Result<Child, ExecutorFailure> {
        Command::new(&self.program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorFailure::new(format!("Failed to launch {}: {}", self.program, e)))
    }
}

#[async_trait]
impl PipelineExecutor for CommandExecutor {
    fn name(&self) -> &str {
        "command"
    }

    fn describe(&self, mode: RunMode, options: &RunOptions) -> String {
        std::iter::once(self.program.clone())
            .chain(self.build_args(mode, options))
            .map(|part| shell_quote(&part))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn execute(
        &self,
        mode: RunMode,
        options: &RunOptions,
        ctx: &dyn RunContext,
    ) -> Result<ExecutionOutcome, ExecutorFailure> {
        let args = self.build_args(mode, options);
        let mut child = self.spawn(&args)?;
        debug!(program = %self.program, pid = ?child.id(), "Pipeline process started");

        let (tx, mut lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let mut poll = tokio::time::interval(self.cancel_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut output = OutputState::new(mode);

        // Output first: both pipes close when the process exits.
        loop {
            let cancelled = tokio::select! {
                line = lines.recv() => match line {
                    Some(line) => {
                        output.consume(&line, ctx);
                        false
                    }
                    None => break,
                },
                _ = poll.tick() => ctx.is_cancelled(),
            };

            if cancelled {
                terminate(&mut child).await;
                return Ok(ExecutionOutcome::Cancelled);
            }
        }

        let status = loop {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = poll.tick() => None,
            };

            match waited {
                Some(status) => {
                    break status.map_err(|e| {
                        ExecutorFailure::new(format!("Failed to wait for pipeline: {}", e))
                    })?
                }
                None if ctx.is_cancelled() => {
                    terminate(&mut child).await;
                    return Ok(ExecutionOutcome::Cancelled);
                }
                None => {}
            }
        };

        if ctx.is_cancelled() {
            return Ok(ExecutionOutcome::Cancelled);
        }

        if status.success() {
            return Ok(ExecutionOutcome::completed(
                output.tracker.output_path().map(str::to_string),
                output.tracker.stats().clone(),
            ));
        }

        let code = status
            .code()
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        match output.first_error {
            Some(error) => Err(ExecutorFailure::new(error)),
            None => Err(ExecutorFailure::unexplained(format!(
                "Pipeline exited with code {}",
                code
            ))),
        }
    }
}

/// What the executor remembers from the pipeline's output
struct OutputState {
    tracker: StageTracker,
    first_error: Option<String>,
}

impl OutputState {
    fn new(mode: RunMode) -> Self {
        Self {
            tracker: StageTracker::new(mode, LAUNCH_PROGRESS, LAUNCH_STEP),
            first_error: None,
        }
    }

    fn consume(&mut self, line: &str, ctx: &dyn RunContext) {
        if line.trim().is_empty() {
            return;
        }

        let parsed = parse_log_line(line);
        ctx.emit_log(parsed.level, &parsed.module, &parsed.message);

        if parsed.level == LogLevel::Error && self.first_error.is_none() {
            self.first_error = Some(parsed.message.chars().take(MAX_ERROR_CHARS).collect());
        }

        let update = self.tracker.observe(&parsed.message);
        if update.progress.is_some() || update.step.is_some() || !update.stats.is_empty() {
            ctx.emit_progress(
                self.tracker.progress(),
                update.step.as_deref().unwrap_or(""),
                update.stats,
            );
        }
    }
}

/// Read a pipe line by line, tolerating invalid UTF-8
fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read pipeline output");
                    break;
                }
            }
        }
    });
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to stop pipeline process");
    }
}

fn shell_quote(part: &str) -> String {
    let plain = !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::domain::RunStats;

    #[derive(Default)]
    struct RecordingContext {
        logs: Mutex<Vec<(LogLevel, String, String)>>,
        progress: Mutex<Vec<(u8, String)>>,
        cancelled: AtomicBool,
    }

    impl RunContext for RecordingContext {
        fn emit_progress(&self, progress: u8, step: &str, _stats: RunStats) {
            self.progress.lock().unwrap().push((progress, step.to_string()));
        }

        fn emit_log(&self, level: LogLevel, module: &str, message: &str) {
            self.logs
                .lock()
                .unwrap()
                .push((level, module.to_string(), message.to_string()));
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_daily_args() {
        let executor = CommandExecutor::new("/srv/rss");
        let options = RunOptions {
            dry_run: true,
            max_articles: Some(20),
            hours: Some(12),
            extra_args: vec!["--verbose".to_string()],
            ..RunOptions::default()
        };

        assert_eq!(
            executor.build_args(RunMode::Daily, &options),
            vec![
                "main.py",
                "--config",
                "config/config.yaml",
                "--max-articles",
                "20",
                "--hours",
                "12",
                "--dry-run",
                "--verbose",
            ]
        );
    }

    #[test]
    fn test_weekly_args_ignore_daily_limits() {
        let executor = CommandExecutor::new("/srv/rss");
        let options = RunOptions {
            max_articles: Some(20),
            ..RunOptions::default()
        };

        assert_eq!(
            executor.build_args(RunMode::Weekly, &options),
            vec!["main.py", "--weekly", "--weekly-config", "config/weekly_config.yaml"]
        );
    }

    #[test]
    fn test_describe_quotes_arguments() {
        let executor = CommandExecutor::new("/srv/rss").with_program("python3");
        let options = RunOptions {
            extra_args: vec!["--title".to_string(), "AI weekly".to_string()],
            ..RunOptions::default()
        };

        assert_eq!(
            executor.describe(RunMode::Weekly, &options),
            "python3 main.py --weekly --weekly-config config/weekly_config.yaml --title 'AI weekly'"
        );
    }

    #[cfg(unix)]
    fn script_executor(dir: &tempfile::TempDir, body: &str) -> CommandExecutor {
        std::fs::write(dir.path().join("pipeline.sh"), body).unwrap();
        CommandExecutor::new(dir.path())
            .with_program("sh")
            .with_script("pipeline.sh")
            .with_cancel_poll(Duration::from_millis(20))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_process() {
        let dir = tempfile::tempdir().unwrap();
        let executor = script_executor(
            &dir,
            "echo '2026-02-11 10:00:00,000 - __main__ - INFO - 📡 Step 1: 抓取RSS订阅...'\n\
             echo '2026-02-11 10:00:05,000 - __main__ - INFO - 过滤后剩余 12 篇文章待处理'\n\
             echo '2026-02-11 10:01:00,000 - src.formatters.output_formatter - INFO - 报告已保存到: output/daily.md'\n\
             echo '抓取失败: https://example.com/feed timeout' >&2\n",
        );
        let ctx = RecordingContext::default();

        let outcome = executor
            .execute(RunMode::Daily, &RunOptions::default(), &ctx)
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Completed { output_path, stats } => {
                assert_eq!(output_path.as_deref(), Some("output/daily.md"));
                assert_eq!(stats["filtered_articles"], serde_json::json!(12));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let mut logs = ctx.logs.lock().unwrap().clone();
        assert_eq!(logs.len(), 4);
        // stdout and stderr interleave freely
        logs.sort_by_key(|(_, module, _)| module == "stdout");
        assert_eq!(logs[0].1, "__main__");
        assert_eq!(
            logs[3],
            (
                LogLevel::Error,
                "stdout".to_string(),
                "抓取失败: https://example.com/feed timeout".to_string(),
            )
        );
        assert_eq!(ctx.progress.lock().unwrap()[0], (20, "fetch sources".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_uses_first_error_line() {
        let dir = tempfile::tempdir().unwrap();
        let executor = script_executor(
            &dir,
            "echo '开始生成 Weekly NO42'\n\
             echo '2026-02-11 10:00:00,000 - src.generators.weekly_generator - ERROR - 读取配置失败: weekly_config.yaml'\n\
             echo 'bye'\nexit 3\n",
        );
        let ctx = RecordingContext::default();

        let failure = executor
            .execute(RunMode::Weekly, &RunOptions::default(), &ctx)
            .await
            .unwrap_err();

        assert_eq!(failure.description, "读取配置失败: weekly_config.yaml");
        assert!(!failure.prefer_last_log);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_without_output_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let executor = script_executor(&dir, "exit 4\n");
        let ctx = RecordingContext::default();

        let failure = executor
            .execute(RunMode::Weekly, &RunOptions::default(), &ctx)
            .await
            .unwrap_err();

        assert_eq!(failure.description, "Pipeline exited with code 4");
        assert!(failure.prefer_last_log);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_stops_process() {
        let dir = tempfile::tempdir().unwrap();
        let executor = script_executor(&dir, "sleep 30\n");
        let ctx = RecordingContext::default();
        ctx.cancelled.store(true, Ordering::SeqCst);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(RunMode::Daily, &RunOptions::default(), &ctx),
        )
        .await
        .expect("cancellation should stop the process")
        .unwrap();

        assert_eq!(outcome, ExecutionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let executor = CommandExecutor::new(".").with_program("definitely-not-a-real-binary-xyz");
        let ctx = RecordingContext::default();

        let failure = executor
            .execute(RunMode::Daily, &RunOptions::default(), &ctx)
            .await
            .unwrap_err();

        assert!(failure.description.starts_with("Failed to launch"));
    }
}
