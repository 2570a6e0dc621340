//! Model-backed [`Summarizer`] producing a Markdown report.

use super::json::strip_enclosing_fence;
use super::prompts::{self, render};
use super::{ChatModel, Summarizer};
use crate::state::{TestCase, TestPlan};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

const EMPTY_SUMMARY: &str = "Test plan completed.";

pub struct LlmSummarizer {
    model: Arc<dyn ChatModel>,
}

impl LlmSummarizer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

/// `[{name, status, result}]` as sent to the model
pub fn case_payload(cases: &[TestCase]) -> Value {
    Value::Array(
        cases
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "status": c.status.as_str(),
                    "result": c.result,
                })
            })
            .collect(),
    )
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, plan: &TestPlan, cases: &[TestCase]) -> Result<Value> {
        let plan_summary =
            serde_json::to_string(plan.summary.as_ref().unwrap_or(&json!({})))?;
        let test_cases = serde_json::to_string(&case_payload(cases))?;

        let user_prompt = render(
            prompts::SUMMARIZER_USER,
            &[("plan_summary", &plan_summary), ("test_cases", &test_cases)],
        );

        let raw = self
            .model
            .complete(prompts::SUMMARIZER_SYSTEM, &user_prompt)
            .await?;

        let text = if raw.trim().is_empty() {
            EMPTY_SUMMARY.to_string()
        } else {
            strip_enclosing_fence(&raw)
        };

        tracing::info!(
            "Summarized plan {} ({} cases, {} chars)",
            plan.id,
            cases.len(),
            text.len()
        );
        Ok(Value::String(text))
    }
}
