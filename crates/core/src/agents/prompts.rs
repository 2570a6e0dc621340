//! Default prompt templates bundled at compile time.
//!
//! Templates use `{name}` placeholders. Rendering is a single pass, so
//! substituted values are never expanded again and literal JSON braces in the
//! templates survive untouched.

use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Planner - shared system instructions
pub const PLANNER_SYSTEM: &str = include_str!("defaults/planner_system.md");

/// Planner - goal to plan (`{high_level_goal}`)
pub const PLANNER_PLAN: &str = include_str!("defaults/planner_plan.md");

/// Planner - plan to cases (`{high_level_goal}`, `{plan_summary}`)
pub const PLANNER_CASES: &str = include_str!("defaults/planner_cases.md");

/// Summarizer - system instructions
pub const SUMMARIZER_SYSTEM: &str = include_str!("defaults/summarizer_system.md");

/// Summarizer - results to report (`{plan_summary}`, `{test_cases}`)
pub const SUMMARIZER_USER: &str = include_str!("defaults/summarizer_user.md");

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").unwrap());

/// Substitute `{key}` occurrences. Unknown placeholders are left as-is.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
