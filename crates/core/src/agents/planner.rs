//! # Planner
//!
//! Model-backed [`PlanGenerator`]. Unusable model output never fails the
//! bootstrap: the plan falls back to the raw text and the cases fall back to
//! a single smoke test. Only transport errors propagate.

use super::json::safe_json_loads;
use super::prompts::{self, render};
use super::{CaseDraft, ChatModel, PlanDraft, PlanGenerator, DEFAULT_GOAL};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

const FALLBACK_PLAN_SUMMARY: &str = "Auto-generated test plan.";

pub struct LlmPlanGenerator {
    model: Arc<dyn ChatModel>,
}

impl LlmPlanGenerator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

fn goal_or_default(goal: &str) -> &str {
    if goal.trim().is_empty() {
        DEFAULT_GOAL
    } else {
        goal
    }
}

/// Log-friendly preview of model output
fn preview(text: &str) -> String {
    const MAX: usize = 500;
    if text.chars().count() > MAX {
        let head: String = text.chars().take(MAX).collect();
        format!("{}…", head)
    } else {
        text.to_string()
    }
}

/// Plan summary from raw model output
pub fn parse_plan(raw: &str) -> PlanDraft {
    match safe_json_loads(raw) {
        Some(summary) => PlanDraft { summary },
        None => {
            tracing::warn!("Planner output is not JSON; storing raw text");
            let text = if raw.trim().is_empty() {
                FALLBACK_PLAN_SUMMARY
            } else {
                raw
            };
            PlanDraft {
                summary: json!({ "summary": text }),
            }
        }
    }
}

/// Deterministic case list used when the model output is unusable
pub fn fallback_cases(goal: &str) -> Vec<CaseDraft> {
    vec![CaseDraft {
        name: "Smoke test".to_string(),
        description: Some(format!(
            "Basic sanity check for goal: {}",
            goal_or_default(goal)
        )),
        input_data: Some(json!({})),
        execution_order: Some(1),
    }]
}

/// Case drafts from raw model output: a bare array or `{"cases": [...]}`
pub fn parse_cases(raw: &str, goal: &str) -> Vec<CaseDraft> {
    let items = match safe_json_loads(raw) {
        Some(Value::Array(items)) => items,
        Some(Value::Object(mut obj)) => match obj.remove("cases") {
            Some(Value::Array(items)) => items,
            _ => {
                tracing::debug!("Case output has no `cases` array; using fallback");
                return fallback_cases(goal);
            }
        },
        _ => {
            tracing::debug!("Case output is not JSON; using fallback");
            return fallback_cases(goal);
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| draft_from_value(idx + 1, item))
        .collect()
}

fn draft_from_value(position: usize, item: &Value) -> CaseDraft {
    let text = |key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    };

    CaseDraft {
        name: text("name").unwrap_or_else(|| format!("Test Case {}", position)),
        description: text("description"),
        input_data: item.get("input_data").filter(|v| v.is_object()).cloned(),
        execution_order: item
            .get("execution_order")
            .and_then(Value::as_i64)
            .filter(|order| *order != 0)
            .or(Some(position as i64)),
    }
}

#[async_trait]
impl PlanGenerator for LlmPlanGenerator {
    async fn generate_plan(&self, goal: &str) -> Result<PlanDraft> {
        let goal = goal_or_default(goal);
        let user_prompt = render(prompts::PLANNER_PLAN, &[("high_level_goal", goal)]);

        let raw = self
            .model
            .complete(prompts::PLANNER_SYSTEM, &user_prompt)
            .await?;
        tracing::info!(
            "Planner response: {} chars; preview={:?}",
            raw.len(),
            preview(&raw)
        );

        Ok(parse_plan(&raw))
    }

    async fn generate_cases(&self, goal: &str, plan: &PlanDraft) -> Result<Vec<CaseDraft>> {
        let plan_summary = serde_json::to_string(&plan.summary)?;
        let user_prompt = render(
            prompts::PLANNER_CASES,
            &[
                ("high_level_goal", goal_or_default(goal)),
                ("plan_summary", &plan_summary),
            ],
        );

        let raw = self
            .model
            .complete(prompts::PLANNER_SYSTEM, &user_prompt)
            .await?;
        tracing::info!(
            "Case response: {} chars; preview={:?}",
            raw.len(),
            preview(&raw)
        );

        Ok(parse_cases(&raw, goal))
    }
}
