//! # Summary Runner
//!
//! Drives one summarization of a plan: collect its cases, call the
//! summarizer, store the results and finish SUMMARIZING -> COMPLETED.
//! A summarizer failure still completes the evaluation; the error is kept
//! in `results.summary_error` next to any earlier summary.

use super::state_machine::EvaluationStateMachine;
use crate::agents::Summarizer;
use crate::state::{CaseManager, Evaluation, EvaluationManager, PlanManager};
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const NO_PLAN: &str = "No test plan exists for this evaluation";

pub struct SummaryRunner {
    evaluations: EvaluationManager,
    plans: PlanManager,
    cases: CaseManager,
    summarizer: Arc<dyn Summarizer>,
    state: Arc<EvaluationStateMachine>,
}

impl SummaryRunner {
    pub fn new(
        evaluations: EvaluationManager,
        plans: PlanManager,
        cases: CaseManager,
        summarizer: Arc<dyn Summarizer>,
        state: Arc<EvaluationStateMachine>,
    ) -> Self {
        Self {
            evaluations,
            plans,
            cases,
            summarizer,
            state,
        }
    }

    /// Returns `None` when the evaluation left SUMMARIZING while the
    /// summarizer was running; its status is then left alone.
    ///
    /// Any failure before the final write (missing plan, unreadable cases,
    /// summarizer error) still completes the evaluation with `summary_error`.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, evaluation_id: i64, plan_id: i64) -> Result<Option<Evaluation>> {
        let results = match self.summarize(plan_id).await {
            Ok(summary) => json!({ "summary": summary }),
            Err(e) => {
                tracing::warn!(
                    "Summarization failed for evaluation {} (plan {}): {:#}",
                    evaluation_id,
                    plan_id,
                    e
                );
                self.error_results(evaluation_id, &format!("{:#}", e))
            }
        };

        let completed = self.complete(evaluation_id, &results).await?;
        if completed.is_some() {
            tracing::info!(
                "Summarized evaluation {} via plan {}",
                evaluation_id,
                plan_id
            );
        }
        Ok(completed)
    }

    /// Summarize the active plan, or complete with `summary_error` when the
    /// evaluation has no plan at all
    pub async fn run_active(&self, evaluation_id: i64) -> Result<Option<Evaluation>> {
        match self.plans.active_for(evaluation_id)? {
            Some(plan) => self.run(evaluation_id, plan.id).await,
            None => {
                tracing::warn!(
                    "No test plan for evaluation {}; completing without summary",
                    evaluation_id
                );
                let results = self.error_results(evaluation_id, NO_PLAN);
                self.complete(evaluation_id, &results).await
            }
        }
    }

    async fn summarize(&self, plan_id: i64) -> Result<Value> {
        let plan = self
            .plans
            .load(plan_id)?
            .with_context(|| format!("Plan {} not found", plan_id))?;
        let cases = self.cases.list_for_plan(plan_id)?;
        self.summarizer.summarize(&plan, &cases).await
    }

    fn error_results(&self, evaluation_id: i64, error: &str) -> Value {
        let previous = match self.evaluations.load(evaluation_id) {
            Ok(evaluation) => evaluation.and_then(|ev| ev.results),
            Err(e) => {
                tracing::warn!(
                    "Could not read previous results of evaluation {}: {:#}",
                    evaluation_id,
                    e
                );
                None
            }
        };
        merge_results(previous, "summary_error", Value::String(error.to_string()))
    }

    async fn complete(&self, evaluation_id: i64, results: &Value) -> Result<Option<Evaluation>> {
        let completed = self
            .state
            .complete_with_results(evaluation_id, results)
            .await?;
        if completed.is_none() {
            tracing::warn!(
                "Evaluation {} left SUMMARIZING during summarization; result discarded",
                evaluation_id
            );
        }
        Ok(completed)
    }
}

/// Previous results with `key` set; other keys are kept and non-object
/// results move under `previous_results`
pub(crate) fn merge_results(previous: Option<Value>, key: &str, value: Value) -> Value {
    let mut results = match previous {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert("previous_results".to_string(), other);
            map
        }
        None => Map::new(),
    };
    results.insert(key.to_string(), value);
    Value::Object(results)
}
