//! Tool dispatch for the execution loop.
//!
//! A static registry of named tools, filtered per task by an allow-list and
//! by which optional capabilities are enabled. A malfunctioning tool call
//! becomes an error string in the transcript, never a crashed loop.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::traits::Tool;

/// Name of the clarification pseudo-tool. It has a schema like any other
/// tool but is intercepted by the execution loop, which suspends instead of
/// dispatching.
pub const CLARIFICATION_TOOL: &str = "ask_clarification";

/// Names of the background-task capability tools, always-on when a task has
/// `can_background` set.
pub const BACKGROUND_TOOLS: [&str; 2] = ["start_background_task", "check_background_task"];

pub struct ToolGateway {
    tools: Vec<Arc<dyn Tool>>,
    max_output: usize,
}

impl ToolGateway {
    /// Build the registry. Duplicate names fail here, not at call time.
    pub fn new(tools: Vec<Arc<dyn Tool>>, max_output: usize) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        for tool in &tools {
            if !seen.insert(tool.name().to_string()) {
                anyhow::bail!("Duplicate tool registered: {}", tool.name());
            }
        }
        Ok(Self { tools, max_output })
    }

    /// Check a task allow-list against the registry. Unknown names fail at
    /// spawn, not when the model eventually calls them.
    pub fn validate_allow_list(&self, allowed: &HashSet<String>) -> anyhow::Result<()> {
        for name in allowed {
            if !self.tools.iter().any(|t| t.name() == name.as_str()) {
                anyhow::bail!("Unknown tool in allow-list: {}", name);
            }
        }
        Ok(())
    }

    /// The effective tool set for one task: registry ∩ allow-list, plus the
    /// clarification schema when enabled. Background tools are ordinary
    /// registry members but only surface when the capability is on.
    pub fn schemas_for(
        &self,
        allowed: Option<&HashSet<String>>,
        can_clarify: bool,
        can_background: bool,
    ) -> Vec<Value> {
        let mut schemas: Vec<Value> = self
            .tools
            .iter()
            .filter(|t| self.tool_visible(t.name(), allowed, can_background))
            .map(|t| t.schema())
            .collect();
        if can_clarify {
            schemas.push(clarification_schema());
        }
        schemas
    }

    fn tool_visible(
        &self,
        name: &str,
        allowed: Option<&HashSet<String>>,
        can_background: bool,
    ) -> bool {
        if BACKGROUND_TOOLS.contains(&name) {
            // Always-on capability: ignores the allow-list, gated only by the flag.
            return can_background;
        }
        match allowed {
            Some(set) => set.contains(name),
            None => true,
        }
    }

    /// Dispatch one call. Errors are captured as result strings and output
    /// is truncated to bound transcript growth.
    pub async fn execute(
        &self,
        name: &str,
        arguments: &str,
        allowed: Option<&HashSet<String>>,
        can_background: bool,
    ) -> String {
        if !self.tool_visible(name, allowed, can_background) {
            return format!("Error [{}]: tool not available for this task", name);
        }
        for tool in &self.tools {
            if tool.name() == name {
                return match tool.call(arguments).await {
                    Ok(output) => truncate(&output, self.max_output),
                    Err(e) => {
                        warn!(tool = name, error = %e, "Tool call failed");
                        format!("Error [{}]: {}", name, e)
                    }
                };
            }
        }
        // The model can hallucinate names; feed the mistake back as text.
        format!("Error [{}]: unknown tool", name)
    }
}

fn clarification_schema() -> Value {
    json!({
        "name": CLARIFICATION_TOOL,
        "description": "Ask the user a clarifying question and wait for their answer. Use sparingly; if no answer arrives you must continue with your best judgment.",
        "parameters": {
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask"
                }
            },
            "required": ["question"]
        }
    })
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[Truncated {} of {} bytes]", &text[..end], text.len() - end, text.len())
}
