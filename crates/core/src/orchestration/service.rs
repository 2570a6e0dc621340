//! # Orchestrator
//!
//! The entry point the transport layer talks to. Owns one instance of every
//! orchestration component, wired against a shared [`ProctorDb`]. Built once
//! at process start and passed to handlers.

use super::broadcaster::{EventSink, SinkId, StatusBroadcaster};
use super::completion::CompletionDetector;
use super::coordinator::OrchestrationCoordinator;
use super::dispatch::{CaseReport, DispatchQueue};
use super::recovery::{RecoveryReport, RecoveryScanner};
use super::state_machine::EvaluationStateMachine;
use super::stream::{status_stream, StreamEvent};
use super::summary::{merge_results, SummaryRunner};
use super::supervisor::{TaskKind, TaskSupervisor};
use crate::agents::{ChatModel, LlmClient, LlmPlanGenerator, LlmSummarizer, PlanGenerator, Summarizer};
use crate::config::{ProctorConfig, StreamSettings};
use crate::error::{OrchestratorError, Result};
use crate::state::{
    CaseManager, Evaluation, EvaluationManager, EvaluationStatus, NewEvaluationRow, PlanManager,
    ProctorDb, TestCase, TestPlan,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_EXECUTION_MODE: &str = "cloud";
pub const MAX_LIST_LIMIT: usize = 200;

/// Request to start a new evaluation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEvaluation {
    #[serde(default, alias = "high_level_goal")]
    pub goal: Option<String>,
    #[serde(default)]
    pub execution_mode: Option<String>,
    #[serde(default, alias = "assigned_executor_id")]
    pub assigned_executor: Option<String>,
    /// Candidates the generated cases are pre-hinted to
    #[serde(default)]
    pub executor_ids: Vec<String>,
}

/// Evaluation with its active plan and every case
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub evaluation: Evaluation,
    pub plan: Option<TestPlan>,
    pub cases: Vec<TestCase>,
    pub updated_at: DateTime<Utc>,
}

pub struct Orchestrator {
    evaluations: EvaluationManager,
    plans: PlanManager,
    cases: CaseManager,
    state: Arc<EvaluationStateMachine>,
    supervisor: Arc<TaskSupervisor>,
    completion: Arc<CompletionDetector>,
    coordinator: Arc<OrchestrationCoordinator>,
    dispatch: DispatchQueue,
    recovery: RecoveryScanner,
    stream: StreamSettings,
}

impl Orchestrator {
    pub fn new(
        db: &ProctorDb,
        generator: Arc<dyn PlanGenerator>,
        summarizer: Arc<dyn Summarizer>,
        config: &ProctorConfig,
    ) -> Self {
        let evaluations = EvaluationManager::new(db);
        let plans = PlanManager::new(db);
        let cases = CaseManager::new(db);

        let broadcaster = Arc::new(StatusBroadcaster::new());
        let state = Arc::new(EvaluationStateMachine::new(
            evaluations.clone(),
            broadcaster,
        ));
        let supervisor = Arc::new(TaskSupervisor::new());

        let summaries = Arc::new(SummaryRunner::new(
            evaluations.clone(),
            plans.clone(),
            cases.clone(),
            summarizer,
            Arc::clone(&state),
        ));
        let completion = Arc::new(CompletionDetector::new(
            evaluations.clone(),
            Arc::clone(&state),
            Arc::clone(&summaries),
            Arc::clone(&supervisor),
        ));
        let coordinator = Arc::new(OrchestrationCoordinator::new(
            evaluations.clone(),
            plans.clone(),
            cases.clone(),
            generator,
            Arc::clone(&state),
            Arc::clone(&completion),
        ));
        let dispatch = DispatchQueue::new(
            cases.clone(),
            Arc::clone(&state),
            Arc::clone(&completion),
            config.late_report_policy,
        );
        let recovery = RecoveryScanner::new(
            evaluations.clone(),
            summaries,
            Arc::clone(&coordinator),
        );

        Self {
            evaluations,
            plans,
            cases,
            state,
            supervisor,
            completion,
            coordinator,
            dispatch,
            recovery,
            stream: config.stream.clone(),
        }
    }

    /// Wire the LLM-backed planner and summarizer from `config.llm`
    pub fn with_llm(db: &ProctorDb, config: &ProctorConfig) -> Result<Self> {
        let client = LlmClient::new(&config.llm)
            .map_err(|e| OrchestratorError::Collaborator(format!("{:#}", e)))?;
        tracing::info!("Planner and summarizer use model {}", client.model());
        let model: Arc<dyn ChatModel> = Arc::new(client);

        Ok(Self::new(
            db,
            Arc::new(LlmPlanGenerator::new(Arc::clone(&model))),
            Arc::new(LlmSummarizer::new(model)),
            config,
        ))
    }

    pub fn supervisor(&self) -> &Arc<TaskSupervisor> {
        &self.supervisor
    }

    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        self.state.broadcaster()
    }

    /// Wait until no bootstrap or summary task is running
    pub async fn wait_idle(&self) {
        self.supervisor.wait_idle().await;
    }

    /// Persist a GENERATING evaluation and start its bootstrap in the
    /// background. Nothing is written when validation fails.
    pub async fn create_evaluation(&self, request: NewEvaluation) -> Result<Evaluation> {
        let executors: Vec<String> = request
            .executor_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if executors.is_empty() {
            return Err(OrchestratorError::validation(
                "executor_ids must contain at least one executor",
            ));
        }

        let execution_mode = match request.execution_mode.as_deref().map(str::trim) {
            None => DEFAULT_EXECUTION_MODE.to_string(),
            Some("") => {
                return Err(OrchestratorError::validation(
                    "execution_mode must not be empty",
                ))
            }
            Some(mode) => mode.to_string(),
        };

        let row = NewEvaluationRow {
            execution_mode,
            assigned_executor: non_blank(request.assigned_executor),
            high_level_goal: non_blank(request.goal),
        };

        let evaluation = self.evaluations.create(&row)?;
        tracing::info!(
            "Created evaluation {} (mode={}, executor={:?}, goal={:?})",
            evaluation.id,
            evaluation.execution_mode,
            evaluation.assigned_executor,
            evaluation.high_level_goal
        );
        self.state.announce(&evaluation).await;

        let coordinator = Arc::clone(&self.coordinator);
        let evaluation_id = evaluation.id;
        self.supervisor
            .spawn(TaskKind::Bootstrap, evaluation_id, async move {
                coordinator.bootstrap(evaluation_id, &executors).await
            });

        Ok(evaluation)
    }

    pub fn get_evaluation(&self, evaluation_id: i64) -> Result<Evaluation> {
        self.evaluations
            .load(evaluation_id)?
            .ok_or_else(|| OrchestratorError::not_found("Evaluation", evaluation_id))
    }

    pub fn get_status(&self, evaluation_id: i64) -> Result<StatusSnapshot> {
        let evaluation = self.get_evaluation(evaluation_id)?;
        let plan = self.plans.active_for(evaluation_id)?;
        let cases = self.cases.list_for_evaluation(evaluation_id)?;

        Ok(StatusSnapshot {
            updated_at: evaluation.updated_at,
            evaluation,
            plan,
            cases,
        })
    }

    /// Newest first; `limit` is clamped to 1..=200
    pub fn list_evaluations(&self, limit: usize, offset: usize) -> Result<Vec<Evaluation>> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        Ok(self.evaluations.list(limit, offset)?)
    }

    pub fn next_case(&self, executor_id: &str) -> Result<Option<TestCase>> {
        let executor_id = executor_id.trim();
        if executor_id.is_empty() {
            return Err(OrchestratorError::validation("executor_id is required"));
        }
        Ok(self.dispatch.next(executor_id)?)
    }

    pub async fn report_case(&self, case_id: i64, report: CaseReport) -> Result<TestCase> {
        self.dispatch
            .report(case_id, report)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("Test case", case_id))
    }

    /// Administrative status override. SUMMARIZING without results starts
    /// summarization of the active plan.
    pub async fn update_evaluation(
        &self,
        evaluation_id: i64,
        status: EvaluationStatus,
        results: Option<Value>,
    ) -> Result<Evaluation> {
        let evaluation = self
            .state
            .override_status(evaluation_id, status, results.as_ref())
            .await?
            .ok_or_else(|| OrchestratorError::not_found("Evaluation", evaluation_id))?;

        if status == EvaluationStatus::Summarizing && results.is_none() {
            tracing::info!(
                "Evaluation {} summarization started via explicit SUMMARIZING update",
                evaluation_id
            );
            self.completion.launch_active_summary(evaluation_id);
        }

        Ok(evaluation)
    }

    /// Replace `results.summary`, keeping every other key
    pub fn update_summary(&self, evaluation_id: i64, summary: Value) -> Result<Evaluation> {
        let evaluation = self.get_evaluation(evaluation_id)?;
        let results = merge_results(evaluation.results, "summary", summary);

        let updated = self
            .evaluations
            .set_results(evaluation_id, &results)?
            .ok_or_else(|| OrchestratorError::not_found("Evaluation", evaluation_id))?;
        tracing::info!("Updated summary for evaluation {}", evaluation_id);
        Ok(updated)
    }

    /// COMPLETED -> SUMMARIZING and summarize the active plan again
    pub async fn regenerate_summary(&self, evaluation_id: i64) -> Result<Evaluation> {
        let evaluation = self.get_evaluation(evaluation_id)?;
        if evaluation.status != EvaluationStatus::Completed {
            return Err(OrchestratorError::invalid_state(
                "Evaluation must be COMPLETED before regenerating the summary.",
            ));
        }

        let plan = self.plans.active_for(evaluation_id)?.ok_or_else(|| {
            OrchestratorError::invalid_state(
                "No test plan exists for this evaluation; cannot regenerate summary.",
            )
        })?;

        let summarizing = self
            .state
            .transition_if(
                evaluation_id,
                EvaluationStatus::Summarizing,
                &[EvaluationStatus::Completed],
            )
            .await?
            .ok_or_else(|| {
                OrchestratorError::invalid_state(
                    "Evaluation must be COMPLETED before regenerating the summary.",
                )
            })?;

        self.completion.launch_summary(evaluation_id, plan.id);
        Ok(summarizing)
    }

    pub async fn subscribe(&self, sink: Arc<dyn EventSink>, evaluation_id: i64) {
        self.broadcaster().subscribe(sink, evaluation_id).await;
    }

    pub async fn unsubscribe(&self, sink_id: SinkId, evaluation_id: i64) {
        self.broadcaster().unsubscribe(sink_id, evaluation_id).await;
    }

    /// Drop a disconnected handle from every subscription
    pub async fn remove(&self, sink_id: SinkId) {
        self.broadcaster().remove(sink_id).await;
    }

    /// Long-poll stream using the configured interval and bound
    pub fn status_stream(
        &self,
        evaluation_id: i64,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        self.status_stream_with(
            evaluation_id,
            self.stream.poll_interval(),
            self.stream.max_wait(),
        )
    }

    pub fn status_stream_with(
        &self,
        evaluation_id: i64,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        status_stream(
            self.evaluations.clone(),
            evaluation_id,
            poll_interval,
            max_wait,
        )
    }

    /// Resume interrupted summaries and generations
    pub async fn recover(&self) -> Result<RecoveryReport> {
        Ok(self.recovery.run_on_startup().await?)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
