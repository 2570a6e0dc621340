//! # Completion Detector
//!
//! After every case report: if all cases of the plan are COMPLETED or
//! FAILED, move the evaluation to SUMMARIZING and start the summarizer.
//! The sibling read and the status write share one store transaction, so
//! of two reports finishing the last two cases only one wins the claim.

use super::state_machine::EvaluationStateMachine;
use super::summary::SummaryRunner;
use super::supervisor::{TaskKind, TaskSupervisor};
use crate::state::{CompletionClaim, Evaluation, EvaluationManager, EvaluationStatus};
use anyhow::Result;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    PlanMissing,
    /// Some sibling is still open
    InProgress,
    /// Lost the race, or the evaluation was already past this point
    AlreadyFinalized(EvaluationStatus),
    SummaryStarted(Evaluation),
}

pub struct CompletionDetector {
    evaluations: EvaluationManager,
    state: Arc<EvaluationStateMachine>,
    summaries: Arc<SummaryRunner>,
    supervisor: Arc<TaskSupervisor>,
}

impl CompletionDetector {
    pub fn new(
        evaluations: EvaluationManager,
        state: Arc<EvaluationStateMachine>,
        summaries: Arc<SummaryRunner>,
        supervisor: Arc<TaskSupervisor>,
    ) -> Self {
        Self {
            evaluations,
            state,
            summaries,
            supervisor,
        }
    }

    pub async fn maybe_finalize(&self, plan_id: i64) -> Result<FinalizeOutcome> {
        match self.evaluations.claim_plan_completion(plan_id)? {
            CompletionClaim::Missing => Ok(FinalizeOutcome::PlanMissing),
            CompletionClaim::InProgress => Ok(FinalizeOutcome::InProgress),
            CompletionClaim::AlreadyFinalized(status) => {
                tracing::debug!("Plan {} already finalized ({})", plan_id, status);
                Ok(FinalizeOutcome::AlreadyFinalized(status))
            }
            CompletionClaim::Claimed(evaluation) => {
                tracing::info!(
                    "Evaluation {} moved to SUMMARIZING (plan {} finished)",
                    evaluation.id,
                    plan_id
                );
                self.state.announce(&evaluation).await;
                self.launch_summary(evaluation.id, plan_id);
                Ok(FinalizeOutcome::SummaryStarted(evaluation))
            }
        }
    }

    /// Run the summarizer for `plan_id` as a supervised background task
    pub fn launch_summary(&self, evaluation_id: i64, plan_id: i64) {
        let summaries = Arc::clone(&self.summaries);
        self.supervisor
            .spawn(TaskKind::Summarize, evaluation_id, async move {
                summaries.run(evaluation_id, plan_id).await.map(|_| ())
            });
    }

    /// Summarize whatever plan is active for `evaluation_id`; an evaluation
    /// without a plan is completed with `summary_error`
    pub fn launch_active_summary(&self, evaluation_id: i64) {
        let summaries = Arc::clone(&self.summaries);
        self.supervisor
            .spawn(TaskKind::Summarize, evaluation_id, async move {
                summaries.run_active(evaluation_id).await.map(|_| ())
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::events::StatusEventKind;
    use crate::state::{CaseStatus, CaseUpdate};
    use crate::test_support::{Pipeline, RecordingSink};

    fn finish(p: &Pipeline, case_id: i64, status: CaseStatus) {
        p.cases
            .apply_update(case_id, &CaseUpdate::status(status))
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_plan() {
        let p = Pipeline::new();
        assert_eq!(
            p.completion.maybe_finalize(999).await.unwrap(),
            FinalizeOutcome::PlanMissing
        );
    }

    #[tokio::test]
    async fn test_open_sibling_keeps_plan_running() {
        let p = Pipeline::new();
        let (evaluation_id, plan_id, cases) = p.seed(EvaluationStatus::Ready, 2);
        finish(&p, cases[0].id, CaseStatus::Completed);

        assert_eq!(
            p.completion.maybe_finalize(plan_id).await.unwrap(),
            FinalizeOutcome::InProgress
        );
        assert_eq!(p.status_of(evaluation_id), EvaluationStatus::Ready);
        assert_eq!(p.supervisor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_all_terminal_summarizes_and_completes() {
        let p = Pipeline::new();
        let (evaluation_id, plan_id, cases) = p.seed(EvaluationStatus::InProgress, 2);
        let sink = RecordingSink::new();
        p.state.broadcaster().subscribe(sink.clone(), evaluation_id).await;
        finish(&p, cases[0].id, CaseStatus::Completed);
        finish(&p, cases[1].id, CaseStatus::Failed);

        match p.completion.maybe_finalize(plan_id).await.unwrap() {
            FinalizeOutcome::SummaryStarted(evaluation) => {
                assert_eq!(evaluation.status, EvaluationStatus::Summarizing)
            }
            other => panic!("expected summary start, got {:?}", other),
        }
        p.supervisor.wait_idle().await;

        assert_eq!(p.status_of(evaluation_id), EvaluationStatus::Completed);
        assert_eq!(p.summarizer.calls(), 1);
        let statuses: Vec<_> = sink.events().iter().map(|e| (e.kind, e.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (StatusEventKind::Status, Some(EvaluationStatus::Summarizing)),
                (StatusEventKind::Status, Some(EvaluationStatus::Completed)),
                (StatusEventKind::Close, None),
            ]
        );
    }

    #[tokio::test]
    async fn test_finalized_evaluation_is_not_summarized_again() {
        let p = Pipeline::new();
        let (evaluation_id, plan_id, cases) = p.seed(EvaluationStatus::Completed, 1);
        finish(&p, cases[0].id, CaseStatus::Completed);

        assert_eq!(
            p.completion.maybe_finalize(plan_id).await.unwrap(),
            FinalizeOutcome::AlreadyFinalized(EvaluationStatus::Completed)
        );
        p.supervisor.wait_idle().await;
        assert_eq!(p.summarizer.calls(), 0);
        assert_eq!(p.status_of(evaluation_id), EvaluationStatus::Completed);
    }

    #[tokio::test]
    async fn test_second_finalize_loses() {
        let p = Pipeline::new();
        let (_, plan_id, cases) = p.seed(EvaluationStatus::Ready, 1);
        finish(&p, cases[0].id, CaseStatus::Completed);

        assert!(matches!(
            p.completion.maybe_finalize(plan_id).await.unwrap(),
            FinalizeOutcome::SummaryStarted(_)
        ));
        assert!(matches!(
            p.completion.maybe_finalize(plan_id).await.unwrap(),
            FinalizeOutcome::AlreadyFinalized(_)
        ));
        p.supervisor.wait_idle().await;
        assert_eq!(p.summarizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_plan_is_complete() {
        let p = Pipeline::new();
        let (evaluation_id, plan_id, _) = p.seed(EvaluationStatus::Ready, 0);

        assert!(matches!(
            p.completion.maybe_finalize(plan_id).await.unwrap(),
            FinalizeOutcome::SummaryStarted(_)
        ));
        p.supervisor.wait_idle().await;
        assert_eq!(p.status_of(evaluation_id), EvaluationStatus::Completed);
    }
}
