//! # Test Cases API
//!
//! Executor-facing endpoints: poll for the next case, report on it.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, patch},
    Router,
};
use proctor_core::orchestration::CaseReport;
use proctor_core::state::CaseStatus;
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use super::{ApiResult, AppState, ErrorBody};

#[derive(Debug, Deserialize, IntoParams)]
pub struct NextCaseParams {
    pub executor_id: String,
}

/// Fields an executor may report; absent fields are left unchanged
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateTestCaseRequest {
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "COMPLETED")]
    pub status: Option<CaseStatus>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub result: Option<serde_json::Value>,
    #[serde(default, alias = "assigned_executor_id")]
    pub executor_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub input_data: Option<serde_json::Value>,
    #[serde(default)]
    pub execution_order: Option<i64>,
}

impl From<UpdateTestCaseRequest> for CaseReport {
    fn from(req: UpdateTestCaseRequest) -> Self {
        CaseReport {
            status: req.status,
            result: req.result,
            executor_id: req.executor_id,
            name: req.name,
            description: req.description,
            input_data: req.input_data,
            execution_order: req.execution_order,
        }
    }
}

pub fn testcase_routes() -> Router<AppState> {
    Router::new()
        .route("/next", get(next_test_case))
        .route("/:id", patch(update_test_case))
}

/// Claim the oldest pending case for an executor
#[utoipa::path(
    get,
    path = "/api/v1/testcases/next",
    tag = "testcases",
    params(NextCaseParams),
    responses(
        (status = 200, description = "Case assigned to the caller"),
        (status = 204, description = "No pending case"),
        (status = 400, description = "Missing executor id", body = ErrorBody)
    )
)]
pub async fn next_test_case(
    State(state): State<AppState>,
    Query(params): Query<NextCaseParams>,
) -> ApiResult<Response> {
    let claimed = state.orchestrator.next_case(&params.executor_id)?;
    Ok(match claimed {
        Some(case) => Json(case).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// Report status or result for a case
#[utoipa::path(
    patch,
    path = "/api/v1/testcases/{id}",
    tag = "testcases",
    params(("id" = i64, Path, description = "Test case id")),
    request_body = UpdateTestCaseRequest,
    responses(
        (status = 200, description = "Updated case"),
        (status = 404, description = "Test case not found", body = ErrorBody)
    )
)]
pub async fn update_test_case(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateTestCaseRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.report_case(id, req.into()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_report() {
        let req: UpdateTestCaseRequest = serde_json::from_str(
            r#"{"status": "FAILED", "result": {"error": "timeout"}, "assigned_executor_id": "r1"}"#,
        )
        .unwrap();

        let report: CaseReport = req.into();
        assert_eq!(report.status, Some(CaseStatus::Failed));
        assert_eq!(report.executor_id.as_deref(), Some("r1"));
        assert!(report.name.is_none());
        assert!(report.execution_order.is_none());
    }
}
