//! # Agents
//!
//! The generative collaborators the orchestrator drives: a plan generator
//! that turns a goal into a plan and its cases, and a summarizer that turns
//! finished cases into a report. Both are traits so the orchestrator never
//! depends on a particular model backend.

pub mod json;
pub mod llm_client;
pub mod planner;
pub mod prompts;
pub mod summarizer;

pub use llm_client::{ChatModel, LlmClient};
pub use planner::LlmPlanGenerator;
pub use summarizer::LlmSummarizer;

use crate::state::{NewCase, TestCase, TestPlan};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Used whenever an evaluation has no goal text
pub const DEFAULT_GOAL: &str = "Run an app evaluation";

/// Generated plan, opaque to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub summary: serde_json::Value,
}

/// One generated case before it is persisted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_data: Option<serde_json::Value>,
    #[serde(default)]
    pub execution_order: Option<i64>,
}

impl From<CaseDraft> for NewCase {
    fn from(draft: CaseDraft) -> Self {
        NewCase {
            name: draft.name,
            description: draft.description,
            input_data: draft.input_data,
            execution_order: draft.execution_order,
            assigned_executor: None,
        }
    }
}

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate_plan(&self, goal: &str) -> Result<PlanDraft>;

    /// An empty list is valid: the plan is immediately complete
    async fn generate_cases(&self, goal: &str, plan: &PlanDraft) -> Result<Vec<CaseDraft>>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Best-effort report over a finished plan
    async fn summarize(&self, plan: &TestPlan, cases: &[TestCase]) -> Result<serde_json::Value>;
}
