//! Deterministic collaborators and sinks shared by the unit tests.

use crate::agents::{CaseDraft, PlanDraft, PlanGenerator, Summarizer};
use crate::orchestration::broadcaster::{next_sink_id, EventSink, SinkId, StatusBroadcaster};
use crate::orchestration::completion::CompletionDetector;
use crate::orchestration::events::StatusEvent;
use crate::orchestration::state_machine::EvaluationStateMachine;
use crate::orchestration::summary::SummaryRunner;
use crate::orchestration::supervisor::TaskSupervisor;
use crate::state::{
    CaseManager, EvaluationManager, EvaluationStatus, NewCase, NewEvaluationRow, PlanManager,
    ProctorDb, TestCase, TestPlan,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Plan generator returning a fixed number of cases
pub struct ScriptedPlanGenerator {
    case_count: usize,
    fail_plan: bool,
    fail_cases: bool,
    pub plan_calls: AtomicUsize,
    pub case_calls: AtomicUsize,
}

impl ScriptedPlanGenerator {
    pub fn with_cases(case_count: usize) -> Arc<Self> {
        Arc::new(Self {
            case_count,
            fail_plan: false,
            fail_cases: false,
            plan_calls: AtomicUsize::new(0),
            case_calls: AtomicUsize::new(0),
        })
    }

    pub fn failing_plan() -> Arc<Self> {
        Arc::new(Self {
            fail_plan: true,
            ..Self::unwrapped(0)
        })
    }

    pub fn failing_cases() -> Arc<Self> {
        Arc::new(Self {
            fail_cases: true,
            ..Self::unwrapped(0)
        })
    }

    fn unwrapped(case_count: usize) -> Self {
        Self {
            case_count,
            fail_plan: false,
            fail_cases: false,
            plan_calls: AtomicUsize::new(0),
            case_calls: AtomicUsize::new(0),
        }
    }

    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    pub fn case_calls(&self) -> usize {
        self.case_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlanGenerator for ScriptedPlanGenerator {
    async fn generate_plan(&self, goal: &str) -> Result<PlanDraft> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_plan {
            anyhow::bail!("planner offline");
        }
        Ok(PlanDraft {
            summary: json!({ "goal": goal, "steps": ["open app", "check"] }),
        })
    }

    async fn generate_cases(&self, _goal: &str, _plan: &PlanDraft) -> Result<Vec<CaseDraft>> {
        self.case_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_cases {
            anyhow::bail!("case generation offline");
        }
        Ok((1..=self.case_count)
            .map(|n| CaseDraft {
                name: format!("case {}", n),
                description: Some(format!("scripted case {}", n)),
                input_data: Some(json!({ "n": n })),
                execution_order: None,
            })
            .collect())
    }
}

/// Summarizer that counts calls and can be slowed down or made to fail
pub struct ScriptedSummarizer {
    fail: bool,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedSummarizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(&self, _plan: &TestPlan, cases: &[TestCase]) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            anyhow::bail!("summarizer offline");
        }
        Ok(json!(format!("{} cases summarized", cases.len())))
    }
}

/// Sink that keeps every event it receives
pub struct RecordingSink {
    id: SinkId,
    fail: bool,
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: next_sink_id(),
            fail: false,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            id: next_sink_id(),
            fail: true,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    fn id(&self) -> SinkId {
        self.id
    }

    async fn send(&self, event: &StatusEvent) -> Result<()> {
        if self.fail {
            anyhow::bail!("connection reset");
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Store, state machine, supervisor and completion detector wired together
/// over an in-memory database
pub struct Pipeline {
    pub db: ProctorDb,
    pub evaluations: EvaluationManager,
    pub plans: PlanManager,
    pub cases: CaseManager,
    pub state: Arc<EvaluationStateMachine>,
    pub supervisor: Arc<TaskSupervisor>,
    pub summarizer: Arc<ScriptedSummarizer>,
    pub completion: Arc<CompletionDetector>,
}

impl Pipeline {
    pub fn new() -> Self {
        let db = ProctorDb::open_in_memory().unwrap();
        let evaluations = EvaluationManager::new(&db);
        let plans = PlanManager::new(&db);
        let cases = CaseManager::new(&db);
        let state = Arc::new(EvaluationStateMachine::new(
            evaluations.clone(),
            Arc::new(StatusBroadcaster::new()),
        ));
        let supervisor = Arc::new(TaskSupervisor::new());
        let summarizer = ScriptedSummarizer::new();
        let summaries = Arc::new(SummaryRunner::new(
            evaluations.clone(),
            plans.clone(),
            cases.clone(),
            summarizer.clone(),
            Arc::clone(&state),
        ));
        let completion = Arc::new(CompletionDetector::new(
            evaluations.clone(),
            Arc::clone(&state),
            summaries,
            Arc::clone(&supervisor),
        ));

        Self {
            db,
            evaluations,
            plans,
            cases,
            state,
            supervisor,
            summarizer,
            completion,
        }
    }

    /// Evaluation in `status` with one plan holding `case_count` PENDING
    /// cases; returns (evaluation_id, plan_id, cases)
    pub fn seed(&self, status: EvaluationStatus, case_count: usize) -> (i64, i64, Vec<TestCase>) {
        let evaluation = self
            .evaluations
            .create(&NewEvaluationRow {
                execution_mode: "cloud".to_string(),
                ..Default::default()
            })
            .unwrap();
        self.evaluations.set_status(evaluation.id, status).unwrap();
        let plan = self.plans.create(evaluation.id).unwrap();
        let drafts: Vec<NewCase> = (1..=case_count)
            .map(|n| NewCase::named(format!("case {}", n)))
            .collect();
        let cases = self
            .cases
            .insert_batch(plan.id, evaluation.id, &drafts)
            .unwrap();
        (evaluation.id, plan.id, cases)
    }

    pub fn status_of(&self, evaluation_id: i64) -> EvaluationStatus {
        self.evaluations.load(evaluation_id).unwrap().unwrap().status
    }
}
