//! SQLite-backed record of runs and their log lines.
//!
//! One connection sits behind a mutex, so every operation is atomic with
//! respect to every other; multi-statement changes run in a transaction.
//! Both tables use `AUTOINCREMENT`, which keeps ids monotonic and never
//! hands out an id again, even after rows are deleted.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::domain::{LogEntry, NewLogEntry, Run, RunMode, RunOptions, RunPatch, RunStatus};
use crate::error::{ParseEnumError, RunError};

/// Upper bound for `list_runs`
pub const MAX_RUNS_PAGE: usize = 500;

/// Upper bound for `list_logs`
pub const MAX_LOGS_PAGE: usize = 2000;

/// Step label of a freshly submitted run
pub const QUEUED_STEP: &str = "queued";

/// Error message given to runs found active at startup
pub const INTERRUPTED_MESSAGE: &str = "interrupted: the service stopped while the run was active";

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    current_step TEXT NOT NULL,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    ended_at TEXT,
    duration_seconds REAL,
    output_path TEXT,
    error_message TEXT,
    stats_json TEXT NOT NULL DEFAULT '{}',
    options_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    module TEXT NOT NULL,
    message TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC);
CREATE INDEX IF NOT EXISTS idx_logs_run_id_id ON logs(run_id, id);
"#;

const RUN_COLUMNS: &str = "id, mode, status, progress, current_step, started_at, updated_at, \
     ended_at, duration_seconds, output_path, error_message, stats_json, options_json";

const LOG_COLUMNS: &str = "id, run_id, timestamp, level, module, message";

/// Durable run history
pub struct RunStore {
    conn: Mutex<Connection>,
}

impl RunStore {
    /// Open (or create) the database file, creating parent directories
    pub fn open(path: &Path) -> Result<Self, RunError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened run store");
        Self::with_connection(conn)
    }

    /// Non-persistent store, used by tests and dry tooling
    pub fn open_in_memory() -> Result<Self, RunError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RunError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a `queued` run and return its id
    pub fn create_run(&self, mode: RunMode, options: &RunOptions) -> Result<i64, RunError> {
        let options_json = serde_json::to_string(options)?;
        let now = Utc::now();

        let conn = self.conn();
        conn.execute(
            "INSERT INTO runs (mode, status, progress, current_step, started_at, updated_at, \
             stats_json, options_json) VALUES (?1, ?2, 0, ?3, ?4, ?4, '{}', ?5)",
            params![
                mode.as_str(),
                RunStatus::Queued.as_str(),
                QUEUED_STEP,
                now,
                options_json
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get_run(&self, id: i64) -> Result<Run, RunError> {
        let conn = self.conn();
        fetch_run(&conn, id)?.ok_or(RunError::NotFound(id))
    }

    /// Most recently started first
    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>, RunError> {
        let limit = limit.clamp(1, MAX_RUNS_PAGE) as i64;

        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1"
        ))?;
        let runs = stmt
            .query_map(params![limit], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }

    /// Apply a patch in one transaction and return the updated run.
    ///
    /// A run that already holds a terminal status cannot be given another.
    pub fn update_run(&self, id: i64, patch: &RunPatch) -> Result<Run, RunError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut run = fetch_run(&tx, id)?.ok_or(RunError::NotFound(id))?;
        if run.status.is_terminal() && patch.status.is_some() {
            return Err(RunError::Conflict(format!(
                "Run {} already finished with status {}",
                id, run.status
            )));
        }

        patch.apply(&mut run);
        run.updated_at = Utc::now();
        write_run(&tx, &run)?;
        tx.commit()?;

        Ok(run)
    }

    /// Append a log line and return it with its assigned id
    pub fn append_log(&self, run_id: i64, entry: &NewLogEntry) -> Result<LogEntry, RunError> {
        let conn = self.conn();

        let exists = conn
            .query_row("SELECT 1 FROM runs WHERE id = ?1", params![run_id], |_| Ok(()))
            .optional()?;
        if exists.is_none() {
            return Err(RunError::NotFound(run_id));
        }

        conn.execute(
            "INSERT INTO logs (run_id, timestamp, level, module, message) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                entry.timestamp,
                entry.level.as_str(),
                entry.module,
                entry.message
            ],
        )?;

        Ok(LogEntry {
            id: conn.last_insert_rowid(),
            run_id,
            timestamp: entry.timestamp,
            level: entry.level,
            module: entry.module.clone(),
            message: entry.message.clone(),
        })
    }

    /// Entries with `id > after_id`, ascending
    pub fn list_logs(
        &self,
        run_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, RunError> {
        let limit = limit.clamp(1, MAX_LOGS_PAGE) as i64;

        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM logs WHERE run_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3"
        ))?;
        let logs = stmt
            .query_map(params![run_id, after_id.max(0), limit], log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(logs)
    }

    /// Every entry of a run, read page by page
    pub fn all_logs(&self, run_id: i64) -> Result<Vec<LogEntry>, RunError> {
        let mut logs: Vec<LogEntry> = Vec::new();
        loop {
            let after_id = logs.last().map(|entry| entry.id).unwrap_or(0);
            let page = self.list_logs(run_id, after_id, MAX_LOGS_PAGE)?;
            let done = page.len() < MAX_LOGS_PAGE;
            logs.extend(page);
            if done {
                return Ok(logs);
            }
        }
    }

    pub fn latest_log(&self, run_id: i64) -> Result<Option<LogEntry>, RunError> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                &format!("SELECT {LOG_COLUMNS} FROM logs WHERE run_id = ?1 ORDER BY id DESC LIMIT 1"),
                params![run_id],
                log_from_row,
            )
            .optional()?;

        Ok(entry)
    }

    /// Remove a run and its logs. Returns false if the run did not exist.
    pub fn delete_run(&self, id: i64) -> Result<bool, RunError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM logs WHERE run_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        tx.commit()?;

        Ok(removed > 0)
    }

    /// Mark runs left active by a previous process as failed.
    ///
    /// Returns the reconciled runs.
    pub fn reconcile_interrupted(&self) -> Result<Vec<Run>, RunError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let stale = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE status IN ('queued', 'running') ORDER BY id ASC"
            ))?;
            let runs = stmt
                .query_map([], run_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            runs
        };

        let now = Utc::now();
        let mut reconciled = Vec::with_capacity(stale.len());
        for mut run in stale {
            let duration = (now - run.started_at).num_milliseconds().max(0) as f64 / 1000.0;
            RunPatch::new()
                .status(RunStatus::Failed)
                .ended_at(now)
                .duration_seconds(duration)
                .error_message(INTERRUPTED_MESSAGE)
                .apply(&mut run);
            run.updated_at = now;
            write_run(&tx, &run)?;

            warn!(run_id = run.id, "Reconciled interrupted run as failed");
            reconciled.push(run);
        }

        tx.commit()?;

        if !reconciled.is_empty() {
            info!(count = reconciled.len(), "Reconciled interrupted runs");
        }

        Ok(reconciled)
    }
}

fn fetch_run(conn: &Connection, id: i64) -> Result<Option<Run>, RunError> {
    let run = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            params![id],
            run_from_row,
        )
        .optional()?;

    Ok(run)
}

/// Write every mutable column. `options` is never rewritten.
fn write_run(conn: &Connection, run: &Run) -> Result<(), RunError> {
    let stats_json = serde_json::to_string(&run.stats)?;
    conn.execute(
        "UPDATE runs SET status = ?1, progress = ?2, current_step = ?3, updated_at = ?4, \
         ended_at = ?5, duration_seconds = ?6, output_path = ?7, error_message = ?8, \
         stats_json = ?9 WHERE id = ?10",
        params![
            run.status.as_str(),
            run.progress,
            run.current_step,
            run.updated_at,
            run.ended_at,
            run.duration_seconds,
            run.output_path,
            run.error_message,
            stats_json,
            run.id
        ],
    )?;

    Ok(())
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        mode: parse_column(row, 1)?,
        status: parse_column(row, 2)?,
        progress: row.get(3)?,
        current_step: row.get(4)?,
        started_at: row.get(5)?,
        updated_at: row.get(6)?,
        ended_at: row.get(7)?,
        duration_seconds: row.get(8)?,
        output_path: row.get(9)?,
        error_message: row.get(10)?,
        stats: json_column(row, 11)?,
        options: json_column(row, 12)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get(0)?,
        run_id: row.get(1)?,
        timestamp: row.get(2)?,
        level: parse_column(row, 3)?,
        module: row.get(4)?,
        message: row.get(5)?,
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
