//! # Orchestration Coordinator
//!
//! Bootstraps an evaluation: goal -> plan -> cases -> READY. Any failure
//! drives the evaluation to FAILED so it never stays in GENERATING.
//!
//! ```text
//! GENERATING ──plan──▶ plan READY ──cases──▶ cases PENDING ──▶ READY
//!      │                                                        │
//!      └──────────────── any error ──▶ FAILED          0 cases ─┴─▶ SUMMARIZING
//! ```

use super::completion::CompletionDetector;
use super::state_machine::EvaluationStateMachine;
use crate::agents::{PlanDraft, PlanGenerator};
use crate::state::{
    CaseManager, EvaluationManager, EvaluationStatus, NewCase, PlanManager, PlanStatus, TestCase,
    TestPlan,
};
use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use std::sync::Arc;

pub struct OrchestrationCoordinator {
    evaluations: EvaluationManager,
    plans: PlanManager,
    cases: CaseManager,
    generator: Arc<dyn PlanGenerator>,
    state: Arc<EvaluationStateMachine>,
    completion: Arc<CompletionDetector>,
}

impl OrchestrationCoordinator {
    pub fn new(
        evaluations: EvaluationManager,
        plans: PlanManager,
        cases: CaseManager,
        generator: Arc<dyn PlanGenerator>,
        state: Arc<EvaluationStateMachine>,
        completion: Arc<CompletionDetector>,
    ) -> Self {
        Self {
            evaluations,
            plans,
            cases,
            generator,
            state,
            completion,
        }
    }

    /// Generate plan and cases, then move to READY. On error the evaluation
    /// is moved to FAILED and the error is returned for the task record.
    #[tracing::instrument(skip(self, candidate_executors))]
    pub async fn bootstrap(&self, evaluation_id: i64, candidate_executors: &[String]) -> Result<()> {
        tracing::info!(
            "Bootstrapping evaluation {} (executors={:?})",
            evaluation_id,
            candidate_executors
        );

        match self.prepare(evaluation_id, candidate_executors).await {
            Ok((plan, cases)) => {
                tracing::info!(
                    "Evaluation {} prepared with plan {} and {} cases",
                    evaluation_id,
                    plan.id,
                    cases.len()
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to bootstrap evaluation {}: {:#}", evaluation_id, e);
                if let Err(write_err) = self
                    .state
                    .transition(evaluation_id, EvaluationStatus::Failed)
                    .await
                {
                    tracing::error!(
                        "Could not mark evaluation {} FAILED: {:#}",
                        evaluation_id,
                        write_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Idempotent core shared with the recovery pass: reuse the active plan
    /// and its cases when they exist, generate what is missing, then READY.
    pub async fn prepare(
        &self,
        evaluation_id: i64,
        candidate_executors: &[String],
    ) -> Result<(TestPlan, Vec<TestCase>)> {
        let evaluation = self
            .evaluations
            .load(evaluation_id)?
            .with_context(|| format!("Evaluation {} not found", evaluation_id))?;
        let goal = evaluation.high_level_goal.clone().unwrap_or_default();

        let plan = match self.plans.active_for(evaluation_id)? {
            Some(plan) => plan,
            None => self.plans.create(evaluation_id)?,
        };

        let (plan, draft) = match (&plan.status, &plan.summary) {
            (PlanStatus::Ready | PlanStatus::Completed, Some(summary)) => {
                let draft = PlanDraft {
                    summary: summary.clone(),
                };
                (plan, draft)
            }
            _ => {
                let draft = self.generator.generate_plan(&goal).await?;
                let plan = self.plans.mark_ready(plan.id, &draft.summary)?;
                tracing::info!("Plan {} ready for evaluation {}", plan.id, evaluation_id);
                (plan, draft)
            }
        };

        let mut cases = self.cases.list_for_plan(plan.id)?;
        if cases.is_empty() {
            let drafts = self.generator.generate_cases(&goal, &draft).await?;
            let new_cases = with_executor_hints(
                drafts.into_iter().map(NewCase::from).collect(),
                candidate_executors,
            );
            cases = self
                .cases
                .insert_batch(plan.id, evaluation_id, &new_cases)?;
            tracing::info!("Generated {} cases for plan {}", cases.len(), plan.id);
        }

        self.state
            .transition(evaluation_id, EvaluationStatus::Ready)
            .await?;

        if cases.is_empty() {
            self.completion.maybe_finalize(plan.id).await?;
        }

        Ok((plan, cases))
    }
}

/// Pre-hint each case with a uniformly random candidate. Cases stay PENDING.
fn with_executor_hints(mut cases: Vec<NewCase>, candidates: &[String]) -> Vec<NewCase> {
    if candidates.is_empty() {
        return cases;
    }

    let mut rng = rand::thread_rng();
    for case in &mut cases {
        case.assigned_executor = candidates.choose(&mut rng).cloned();
    }
    cases
}
