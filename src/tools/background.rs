//! Built-in background-task capability tools.
//!
//! Exposed to the executor model only when a task has `can_background` set.
//! Both hold a weak engine reference; a task outliving its engine gets an
//! error string rather than a hung call.

use std::sync::Weak;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::TaskEngine;
use crate::task::TaskSpec;
use crate::traits::Tool;

pub struct StartBackgroundTaskTool {
    engine: Weak<TaskEngine>,
}

impl StartBackgroundTaskTool {
    pub fn new(engine: Weak<TaskEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Tool for StartBackgroundTaskTool {
    fn name(&self) -> &str {
        "start_background_task"
    }

    fn schema(&self) -> Value {
        json!({
            "name": "start_background_task",
            "description": "Start an independent background task that pursues its own goal. Returns the new task id immediately; poll it with check_background_task.",
            "parameters": {
                "type": "object",
                "properties": {
                    "goal": {
                        "type": "string",
                        "description": "What the background task should accomplish"
                    },
                    "context": {
                        "type": "string",
                        "description": "Optional free-text context for the background task"
                    }
                },
                "required": ["goal"]
            }
        })
    }

    async fn call(&self, arguments: &str) -> anyhow::Result<String> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("Engine is shutting down"))?;
        let args: Value = serde_json::from_str(arguments).unwrap_or(json!({}));
        let goal = args["goal"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: goal"))?;

        let mut spec = TaskSpec::new(goal);
        spec.context = args["context"].as_str().map(|s| s.to_string());
        let id = engine.spawn(spec).await?;
        Ok(format!(
            "Started background task {}. Use check_background_task to poll its status.",
            id
        ))
    }
}

pub struct CheckBackgroundTaskTool {
    engine: Weak<TaskEngine>,
}

impl CheckBackgroundTaskTool {
    pub fn new(engine: Weak<TaskEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Tool for CheckBackgroundTaskTool {
    fn name(&self) -> &str {
        "check_background_task"
    }

    fn schema(&self) -> Value {
        json!({
            "name": "check_background_task",
            "description": "Check the status of a background task started with start_background_task.",
            "parameters": {
                "type": "object",
                "properties": {
                    "task_id": {
                        "type": "string",
                        "description": "The task id to check"
                    }
                },
                "required": ["task_id"]
            }
        })
    }

    async fn call(&self, arguments: &str) -> anyhow::Result<String> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("Engine is shutting down"))?;
        let args: Value = serde_json::from_str(arguments).unwrap_or(json!({}));
        let task_id = args["task_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: task_id"))?;

        let Some(snapshot) = engine.get_status(task_id).await else {
            return Ok(format!("No task found with id {}", task_id));
        };

        let mut out = format!(
            "Task {}: status={}, turn_count={}",
            snapshot.id, snapshot.status, snapshot.turn_count
        );
        if let Some(result) = &snapshot.result {
            out.push_str(&format!("\nResult: {}", result));
        }
        if let Some(error) = &snapshot.error {
            out.push_str(&format!("\nError: {}", error));
        }
        Ok(out)
    }
}
