//! `/api/runs` handlers.

use std::convert::Infallible;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    response::{
        sse::{Event, KeepAlive},
        Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::DeleteOutcome;
use crate::domain::{ArtifactPreview, LogEntry, Run, RunMode, RunOptions, StreamEvent};
use crate::error::RunError;

use super::ApiContextRef;

const DEFAULT_RUNS_LIMIT: usize = 50;
const DEFAULT_LOGS_LIMIT: usize = 500;

pub fn router() -> Router<ApiContextRef> {
    Router::new()
        .route("/", get(list_runs).post(start_run))
        .route("/{id}", get(get_run).delete(delete_run))
        .route("/{id}/logs", get(list_logs))
        .route("/{id}/events", get(stream_events))
        .route("/{id}/rerun", post(rerun))
        .route("/{id}/cancel", post(cancel_run))
        .route("/{id}/artifact", get(artifact))
}

/// Body of `POST /api/runs`
#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    /// `daily` (alias `standard`) or `weekly`
    #[serde(default = "default_mode")]
    pub mode: String,

    #[serde(flatten)]
    pub options: RunOptions,
}

fn default_mode() -> String {
    RunMode::Weekly.to_string()
}

#[derive(Serialize)]
struct StartedResponse {
    run_id: i64,
    run: Run,
}

#[derive(Serialize)]
struct RunResponse {
    run: Run,
}

#[derive(Serialize)]
struct RunsResponse {
    runs: Vec<Run>,
}

#[derive(Serialize)]
struct LogsResponse {
    logs: Vec<LogEntry>,
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ListLogsQuery {
    after_id: Option<i64>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    delete_artifact: bool,
}

async fn start_run(
    State(context): State<ApiContextRef>,
    payload: Result<Json<StartRunRequest>, JsonRejection>,
) -> Result<Json<StartedResponse>, RunError> {
    let Json(request) = payload.map_err(|rejection| RunError::Validation(rejection.body_text()))?;
    let mode: RunMode = request.mode.trim().parse()?;

    let orchestrator = &context.orchestrator;
    let run_id = orchestrator.start_run(mode, request.options)?;
    let run = orchestrator.get_run(run_id)?;
    info!(run_id, %mode, "Run submitted");

    Ok(Json(StartedResponse { run_id, run }))
}

async fn list_runs(
    State(context): State<ApiContextRef>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<RunsResponse>, RunError> {
    let runs = context
        .orchestrator
        .list_runs(query.limit.unwrap_or(DEFAULT_RUNS_LIMIT))?;
    Ok(Json(RunsResponse { runs }))
}

async fn get_run(
    State(context): State<ApiContextRef>,
    Path(id): Path<i64>,
) -> Result<Json<RunResponse>, RunError> {
    let run = context.orchestrator.get_run(id)?;
    Ok(Json(RunResponse { run }))
}

async fn list_logs(
    State(context): State<ApiContextRef>,
    Path(id): Path<i64>,
    Query(query): Query<ListLogsQuery>,
) -> Result<Json<LogsResponse>, RunError> {
    let logs = context.orchestrator.list_logs(
        id,
        query.after_id.unwrap_or(0),
        query.limit.unwrap_or(DEFAULT_LOGS_LIMIT),
    )?;
    Ok(Json(LogsResponse { logs }))
}

/// Converts a stream event into an SSE frame carrying its JSON
fn to_sse_event(event: StreamEvent) -> Result<Event, Infallible> {
    match serde_json::to_string(&event) {
        Ok(json) => Ok(Event::default().data(json)),
        Err(_) => Ok(Event::default().data("Error serializing event")),
    }
}

async fn stream_events(
    State(context): State<ApiContextRef>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, RunError> {
    let subscription = context.orchestrator.subscribe(id)?;
    let stream = subscription.into_stream().map(to_sse_event);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn rerun(
    State(context): State<ApiContextRef>,
    Path(id): Path<i64>,
) -> Result<Json<StartedResponse>, RunError> {
    let orchestrator = &context.orchestrator;
    let run_id = orchestrator.rerun(id)?;
    let run = orchestrator.get_run(run_id)?;
    info!(source_id = id, run_id, "Rerun submitted");

    Ok(Json(StartedResponse { run_id, run }))
}

async fn cancel_run(
    State(context): State<ApiContextRef>,
    Path(id): Path<i64>,
) -> Result<Json<RunResponse>, RunError> {
    let run = context.orchestrator.cancel_run(id)?;
    Ok(Json(RunResponse { run }))
}

async fn delete_run(
    State(context): State<ApiContextRef>,
    Path(id): Path<i64>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<DeleteOutcome>, RunError> {
    let outcome = context.orchestrator.delete_run(id, query.delete_artifact)?;
    Ok(Json(outcome))
}

async fn artifact(
    State(context): State<ApiContextRef>,
    Path(id): Path<i64>,
) -> Result<Json<ArtifactPreview>, RunError> {
    let preview = context.orchestrator.artifact_preview(id)?;
    Ok(Json(preview))
}
