use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::error::RunError;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl RunError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RunError::Validation(_) => StatusCode::BAD_REQUEST,
            RunError::NotFound(_) | RunError::ArtifactUnavailable(_) => StatusCode::NOT_FOUND,
            RunError::Conflict(_) => StatusCode::CONFLICT,
            RunError::Store(_) | RunError::Serialization(_) | RunError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for RunError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let error_response = ErrorResponse {
            error: self.to_string(),
        };
        let body = serde_json::to_string(&error_response)
            .unwrap_or_else(|_| format!("{{\"error\": \"{}\"}}", status));

        let mut response = Response::new(body.into());
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        response
    }
}
