//! # HTTP API
//!
//! Thin transport over [`Orchestrator`]: request parsing, status codes and
//! error mapping. All lifecycle decisions live in `proctor_core`.

pub mod evaluations;
pub mod testcases;
pub mod ws;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use proctor_core::{Orchestrator, OrchestratorError, ProctorConfig};
use serde::Serialize;
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<ProctorConfig>,
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub detail: String,
}

/// [`OrchestratorError`] rendered as `{ "detail": ... }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Validation(detail) | OrchestratorError::InvalidState(detail) => {
                Self::bad_request(detail)
            }
            OrchestratorError::NotFound { entity, .. } => Self {
                status: StatusCode::NOT_FOUND,
                detail: format!("{} not found", entity),
            },
            other => {
                tracing::error!("Request failed: {:#}", other);
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    detail: "Unexpected server error".to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Proctor API",
        version = "1.0.0",
        description = "Evaluation orchestration: plans, test case dispatch and live status"
    ),
    paths(
        evaluations::create_evaluation,
        evaluations::list_evaluations,
        evaluations::get_evaluation,
        evaluations::update_evaluation,
        evaluations::update_summary,
        evaluations::regenerate_summary,
        evaluations::status_events,
        testcases::next_test_case,
        testcases::update_test_case
    ),
    components(schemas(
        ErrorBody,
        evaluations::CreateEvaluationRequest,
        evaluations::UpdateEvaluationRequest,
        evaluations::SummaryUpdateRequest,
        testcases::UpdateTestCaseRequest
    )),
    tags(
        (name = "evaluations", description = "Evaluation lifecycle"),
        (name = "testcases", description = "Executor dispatch and reporting")
    )
)]
pub struct ApiDoc;

async fn serve_openapi() -> impl IntoResponse {
    match ApiDoc::openapi().to_json() {
        Ok(spec) => ([(header::CONTENT_TYPE, "application/json")], spec).into_response(),
        Err(e) => {
            tracing::error!("Failed to render OpenAPI document: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/evaluations", evaluations::evaluation_routes())
        .nest("/api/v1/testcases", testcases::testcase_routes())
        .route("/api/v1/events/ws", get(ws::status_socket))
        .route("/api/v1/openapi.json", get(serve_openapi))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let not_found = ApiError::from(OrchestratorError::not_found("Evaluation", 3));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.detail(), "Evaluation not found");

        let invalid = ApiError::from(OrchestratorError::invalid_state(
            "Evaluation must be COMPLETED before regenerating the summary.",
        ));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let store = ApiError::from(OrchestratorError::Store(anyhow::anyhow!("locked")));
        assert_eq!(store.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(store.detail(), "Unexpected server error");
    }

    #[test]
    fn test_openapi_lists_routes() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/v1/evaluations"));
        assert!(doc.paths.paths.contains_key("/api/v1/testcases/next"));
    }
}
