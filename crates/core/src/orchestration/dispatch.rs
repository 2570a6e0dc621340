//! # Dispatch Queue
//!
//! Hands PENDING cases to polling executors in global FIFO order and applies
//! executor reports.

use super::completion::CompletionDetector;
use super::state_machine::EvaluationStateMachine;
use crate::config::LateReportPolicy;
use crate::state::{CaseManager, CaseStatus, CaseUpdate, ReportOutcome, TestCase};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Executor report for one case. Only the provided fields change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    #[serde(default)]
    pub status: Option<CaseStatus>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub executor_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_data: Option<serde_json::Value>,
    #[serde(default)]
    pub execution_order: Option<i64>,
}

impl CaseReport {
    pub fn status(status: CaseStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

impl From<CaseReport> for CaseUpdate {
    fn from(report: CaseReport) -> Self {
        CaseUpdate {
            status: report.status,
            result: report.result,
            assigned_executor: report.executor_id,
            name: report.name,
            description: report.description,
            input_data: report.input_data,
            execution_order: report.execution_order,
        }
    }
}

pub struct DispatchQueue {
    cases: CaseManager,
    state: Arc<EvaluationStateMachine>,
    completion: Arc<CompletionDetector>,
    late_report_policy: LateReportPolicy,
}

impl DispatchQueue {
    pub fn new(
        cases: CaseManager,
        state: Arc<EvaluationStateMachine>,
        completion: Arc<CompletionDetector>,
        late_report_policy: LateReportPolicy,
    ) -> Self {
        Self {
            cases,
            state,
            completion,
            late_report_policy,
        }
    }

    /// Claim the oldest PENDING case for `executor_id`
    pub fn next(&self, executor_id: &str) -> Result<Option<TestCase>> {
        let claimed = self.cases.claim_next(executor_id)?;
        match &claimed {
            Some(case) => tracing::debug!(
                "Assigned case {} (evaluation {}) to {}",
                case.id,
                case.evaluation_id,
                executor_id
            ),
            None => tracing::debug!("No pending case for {}", executor_id),
        }
        Ok(claimed)
    }

    /// Apply a report. `None` for an unknown case.
    ///
    /// A report against an evaluation that is already COMPLETED reopens it
    /// (READY) without running completion detection, or is dropped under
    /// [`LateReportPolicy::Ignore`].
    pub async fn report(&self, case_id: i64, report: CaseReport) -> Result<Option<TestCase>> {
        let reopen = self.late_report_policy == LateReportPolicy::Reopen;

        match self.cases.apply_report(case_id, &report.into(), reopen)? {
            ReportOutcome::Missing => Ok(None),
            ReportOutcome::Ignored(case) => {
                tracing::info!(
                    "Ignoring late report for case {}; evaluation {} is COMPLETED",
                    case_id,
                    case.evaluation_id
                );
                Ok(Some(case))
            }
            ReportOutcome::Reopened { case, evaluation } => {
                tracing::info!(
                    "Evaluation {} moved to READY after late update of case {}",
                    evaluation.id,
                    case_id
                );
                self.state.announce(&evaluation).await;
                Ok(Some(case))
            }
            ReportOutcome::Updated(case) => {
                if let Err(e) = self.completion.maybe_finalize(case.plan_id).await {
                    tracing::error!(
                        "Completion check failed for plan {} after case {}: {:#}",
                        case.plan_id,
                        case_id,
                        e
                    );
                }
                Ok(Some(case))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EvaluationStatus;
    use crate::test_support::{Pipeline, RecordingSink};
    use serde_json::json;

    fn queue(p: &Pipeline, policy: LateReportPolicy) -> DispatchQueue {
        DispatchQueue::new(
            p.cases.clone(),
            Arc::clone(&p.state),
            Arc::clone(&p.completion),
            policy,
        )
    }

    #[test]
    fn test_report_maps_onto_partial_update() {
        let report = CaseReport {
            executor_id: Some("exec-9".to_string()),
            execution_order: Some(4),
            ..CaseReport::status(CaseStatus::InProgress)
        };
        let update: CaseUpdate = report.into();

        assert_eq!(update.status, Some(CaseStatus::InProgress));
        assert_eq!(update.assigned_executor.as_deref(), Some("exec-9"));
        assert_eq!(update.execution_order, Some(4));
        assert!(update.result.is_none());
        assert!(update.name.is_none());
    }

    #[tokio::test]
    async fn test_result_only_report_keeps_status() {
        let p = Pipeline::new();
        let dispatch = queue(&p, LateReportPolicy::Reopen);
        let (evaluation_id, _, cases) = p.seed(EvaluationStatus::Ready, 1);
        let claimed = dispatch.next("exec-a").unwrap().unwrap();
        assert_eq!(claimed.id, cases[0].id);

        let report = CaseReport {
            result: Some(json!({"log": "step 1 ok"})),
            ..Default::default()
        };
        let updated = dispatch.report(claimed.id, report).await.unwrap().unwrap();

        assert_eq!(updated.status, CaseStatus::Assigned);
        assert_eq!(updated.assigned_executor.as_deref(), Some("exec-a"));
        assert_eq!(updated.result, Some(json!({"log": "step 1 ok"})));
        assert_eq!(p.status_of(evaluation_id), EvaluationStatus::Ready);
        assert_eq!(p.supervisor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_report_while_summarizing_changes_case_only() {
        let p = Pipeline::new();
        let dispatch = queue(&p, LateReportPolicy::Reopen);
        let (evaluation_id, _, cases) = p.seed(EvaluationStatus::Summarizing, 1);

        let updated = dispatch
            .report(
                cases[0].id,
                CaseReport::status(CaseStatus::Failed).with_result(json!("late")),
            )
            .await
            .unwrap()
            .unwrap();
        p.supervisor.wait_idle().await;

        assert_eq!(updated.status, CaseStatus::Failed);
        assert_eq!(p.status_of(evaluation_id), EvaluationStatus::Summarizing);
        assert_eq!(p.summarizer.calls(), 0);
    }

    #[tokio::test]
    async fn test_late_report_reopens_and_announces() {
        let p = Pipeline::new();
        let dispatch = queue(&p, LateReportPolicy::Reopen);
        let (evaluation_id, _, cases) = p.seed(EvaluationStatus::Completed, 1);
        let sink = RecordingSink::new();
        p.state.broadcaster().subscribe(sink.clone(), evaluation_id).await;

        let updated = dispatch
            .report(cases[0].id, CaseReport::status(CaseStatus::Completed))
            .await
            .unwrap()
            .unwrap();
        p.supervisor.wait_idle().await;

        assert_eq!(updated.status, CaseStatus::Completed);
        assert_eq!(p.status_of(evaluation_id), EvaluationStatus::Ready);
        assert_eq!(p.summarizer.calls(), 0);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, Some(EvaluationStatus::Ready));
    }

    #[tokio::test]
    async fn test_late_report_dropped_under_ignore() {
        let p = Pipeline::new();
        let dispatch = queue(&p, LateReportPolicy::Ignore);
        let (evaluation_id, _, cases) = p.seed(EvaluationStatus::Completed, 1);

        let unchanged = dispatch
            .report(cases[0].id, CaseReport::status(CaseStatus::Failed))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(unchanged, cases[0]);
        assert_eq!(p.status_of(evaluation_id), EvaluationStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_case_and_empty_queue() {
        let p = Pipeline::new();
        let dispatch = queue(&p, LateReportPolicy::Reopen);

        assert!(dispatch.next("exec-a").unwrap().is_none());
        assert!(dispatch
            .report(31, CaseReport::status(CaseStatus::Completed))
            .await
            .unwrap()
            .is_none());
    }
}
