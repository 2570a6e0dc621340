//! # Evaluations API
//!
//! Create, inspect and administer evaluations, plus the bounded SSE status
//! stream.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
    routing::{get, patch, post},
    Router,
};
use futures::stream::{Stream, StreamExt};
use proctor_core::state::EvaluationStatus;
use proctor_core::NewEvaluation;
use serde::Deserialize;
use std::convert::Infallible;
use utoipa::{IntoParams, ToSchema};

use super::{ApiResult, AppState, ErrorBody};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateEvaluationRequest {
    #[serde(default)]
    pub high_level_goal: Option<String>,
    /// `cloud` or `local`; defaults to `cloud`
    #[serde(default)]
    pub execution_mode: Option<String>,
    #[serde(default, alias = "assigned_executor")]
    pub assigned_executor_id: Option<String>,
    /// Candidate executors; at least one is required
    #[serde(default)]
    pub executor_ids: Vec<String>,
}

impl From<CreateEvaluationRequest> for NewEvaluation {
    fn from(req: CreateEvaluationRequest) -> Self {
        NewEvaluation {
            goal: req.high_level_goal,
            execution_mode: req.execution_mode,
            assigned_executor: req.assigned_executor_id,
            executor_ids: req.executor_ids,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateEvaluationRequest {
    #[schema(value_type = String, example = "SUMMARIZING")]
    pub status: EvaluationStatus,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub results: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SummaryUpdateRequest {
    /// Replacement for `results.summary`
    #[schema(value_type = Object)]
    pub summary: serde_json::Value,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub fn evaluation_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_evaluation).get(list_evaluations))
        .route("/:id", get(get_evaluation).patch(update_evaluation))
        .route("/:id/summary", patch(update_summary))
        .route("/:id/regenerate-summary", post(regenerate_summary))
        .route("/:id/events", get(status_events))
}

/// Create an evaluation; plan and cases are generated in the background
#[utoipa::path(
    post,
    path = "/api/v1/evaluations",
    tag = "evaluations",
    request_body = CreateEvaluationRequest,
    responses(
        (status = 202, description = "Evaluation accepted, status GENERATING"),
        (status = 400, description = "Invalid request", body = ErrorBody)
    )
)]
pub async fn create_evaluation(
    State(state): State<AppState>,
    Json(req): Json<CreateEvaluationRequest>,
) -> ApiResult<impl IntoResponse> {
    let evaluation = state.orchestrator.create_evaluation(req.into()).await?;
    Ok((StatusCode::ACCEPTED, Json(evaluation)))
}

/// List evaluations, newest first
#[utoipa::path(
    get,
    path = "/api/v1/evaluations",
    tag = "evaluations",
    params(ListParams),
    responses((status = 200, description = "Evaluations"))
)]
pub async fn list_evaluations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<impl IntoResponse> {
    let limit = params.limit.unwrap_or(50).max(1) as usize;
    let offset = params.offset.unwrap_or(0).max(0) as usize;
    Ok(Json(state.orchestrator.list_evaluations(limit, offset)?))
}

/// Evaluation with its active plan and test cases
#[utoipa::path(
    get,
    path = "/api/v1/evaluations/{id}",
    tag = "evaluations",
    params(("id" = i64, Path, description = "Evaluation id")),
    responses(
        (status = 200, description = "Status snapshot"),
        (status = 404, description = "Evaluation not found", body = ErrorBody)
    )
)]
pub async fn get_evaluation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.get_status(id)?))
}

/// Administrative status override
#[utoipa::path(
    patch,
    path = "/api/v1/evaluations/{id}",
    tag = "evaluations",
    params(("id" = i64, Path, description = "Evaluation id")),
    request_body = UpdateEvaluationRequest,
    responses(
        (status = 200, description = "Updated evaluation"),
        (status = 404, description = "Evaluation not found", body = ErrorBody)
    )
)]
pub async fn update_evaluation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateEvaluationRequest>,
) -> ApiResult<impl IntoResponse> {
    let evaluation = state
        .orchestrator
        .update_evaluation(id, req.status, req.results)
        .await?;
    Ok(Json(evaluation))
}

/// Replace the summary inside the evaluation results
#[utoipa::path(
    patch,
    path = "/api/v1/evaluations/{id}/summary",
    tag = "evaluations",
    params(("id" = i64, Path, description = "Evaluation id")),
    request_body = SummaryUpdateRequest,
    responses(
        (status = 200, description = "Updated evaluation"),
        (status = 404, description = "Evaluation not found", body = ErrorBody)
    )
)]
pub async fn update_summary(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<SummaryUpdateRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.update_summary(id, req.summary)?))
}

/// Summarize a COMPLETED evaluation again
#[utoipa::path(
    post,
    path = "/api/v1/evaluations/{id}/regenerate-summary",
    tag = "evaluations",
    params(("id" = i64, Path, description = "Evaluation id")),
    responses(
        (status = 202, description = "Evaluation moved to SUMMARIZING"),
        (status = 400, description = "Evaluation is not COMPLETED", body = ErrorBody),
        (status = 404, description = "Evaluation not found", body = ErrorBody)
    )
)]
pub async fn regenerate_summary(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let evaluation = state.orchestrator.regenerate_summary(id).await?;
    Ok((StatusCode::ACCEPTED, Json(evaluation)))
}

/// Server-sent `status` events until a terminal status or the wait bound
#[utoipa::path(
    get,
    path = "/api/v1/evaluations/{id}/events",
    tag = "evaluations",
    params(("id" = i64, Path, description = "Evaluation id")),
    responses((status = 200, description = "text/event-stream of status changes"))
)]
pub async fn status_events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = state
        .orchestrator
        .status_stream(id)
        .map(|event| Ok(Event::default().event(event.name()).data(event.data())));

    Sse::new(stream).keep_alive(KeepAlive::default())
}
