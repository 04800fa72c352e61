//! HTTP API for the report dashboard.
//!
//! Thin translation from requests to [`RunOrchestrator`] calls. Errors are
//! rendered as JSON `{"error": "..."}` bodies by [`error`].

use std::sync::Arc;

use axum::Router;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use crate::core::RunOrchestrator;

mod error;
mod health;
mod runs;

pub type ApiContextRef = Arc<ApiContext>;

/// Shared state of every handler
pub struct ApiContext {
    pub orchestrator: RunOrchestrator,
}

impl ApiContext {
    pub fn new(orchestrator: RunOrchestrator) -> Self {
        Self { orchestrator }
    }
}

/// Build the application router
pub fn router(context: ApiContextRef) -> Router {
    Router::new()
        .nest("/api/health", health::router())
        .nest("/api/runs", runs::router())
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::ERROR)))
        .with_state(context)
}
