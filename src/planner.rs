//! LLM-based plan generation with designed degradation.
//!
//! The provider is asked for a JSON array of step strings. The fallback path
//! is not an edge case: malformed output degrades to ordinal-marked line
//! splitting, and anything still unusable degrades to a single-step plan of
//! the goal itself. Planning never fails a task.

use regex::Regex;
use tracing::{debug, warn};

use crate::traits::{ChatMessage, ModelProvider};

const PLAN_PROMPT: &str = r#"You are a task planner. Given a goal, break it down into discrete, actionable steps.

Each step should be:
- Atomic (can succeed or fail independently)
- Verifiable (clear what "done" means)
- Ordered (dependencies respected)
- Actionable (starts with a verb)

Keep it concise: 3-8 steps typical, max 10. Do NOT include meta-steps like
"understand the request" or "report results".

Return ONLY a JSON array of step description strings. No other text.

Example:
Goal: "Deploy the app to production"
["Run the test suite", "Build the production container", "Push to container registry", "Deploy to production", "Verify production health"]
"#;

/// Produce an ordered plan for a goal. One bounded provider call; any
/// failure degrades to `[goal]` rather than erroring.
pub async fn build_plan(
    provider: &dyn ModelProvider,
    model: &str,
    goal: &str,
    context: Option<&str>,
) -> Vec<String> {
    let mut prompt = format!("{PLAN_PROMPT}\nGoal: {goal:?}");
    if let Some(ctx) = context {
        prompt.push_str(&format!("\n\nContext:\n{ctx}"));
    }

    let messages = vec![ChatMessage::user(prompt)];
    let text = match provider.chat(model, &messages, &[]).await {
        Ok(resp) => resp.content.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "Plan generation call failed, using single-step plan");
            return vec![goal.to_string()];
        }
    };

    let steps = parse_plan(&text, goal);
    debug!(steps = steps.len(), "Plan built");
    steps
}

/// Parse planner output: first JSON-array-shaped substring, then
/// ordinal-marked lines, then `[goal]`.
pub fn parse_plan(text: &str, goal: &str) -> Vec<String> {
    if let Some(steps) = extract_json_steps(text) {
        return steps;
    }
    let lines = split_step_lines(text);
    if !lines.is_empty() {
        return lines;
    }
    vec![goal.to_string()]
}

/// Find the first `[`..`]` substring and parse it as an array of strings.
/// Returns None on parse failure or an empty array.
fn extract_json_steps(text: &str) -> Option<Vec<String>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    let steps: Vec<String> = serde_json::from_str(&text[start..=end]).ok()?;
    let steps: Vec<String> = steps
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if steps.is_empty() {
        None
    } else {
        Some(steps)
    }
}

/// Keep lines carrying an ordinal or bullet marker ("1.", "2)", "-", "*"),
/// stripped of the marker. Prose without step markers is not a plan.
fn split_step_lines(text: &str) -> Vec<String> {
    let marker = Regex::new(r"^\s*(?:\d+[.)]|[-*])\s+(.*\S)\s*$").expect("valid step-line regex");
    text.lines()
        .filter_map(|line| marker.captures(line).map(|c| c[1].to_string()))
        .collect()
}

pub fn plan_as_numbered_list(plan: &[String]) -> String {
    plan.iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {}", i + 1, step))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Summary of a plan for approval requests and notifications.
pub fn plan_summary(goal: &str, plan: &[String]) -> String {
    format!("Plan for \"{}\":\n{}", goal, plan_as_numbered_list(plan))
}
