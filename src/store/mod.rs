//! Durable task records.
//!
//! The persisted shape is capped: enough to inspect history after a crash,
//! not guaranteed sufficient to resume execution. Interrupted tasks are
//! marked failed on restart, never silently re-entered mid-loop.

mod memory;
mod sqlite;

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PersistenceConfig;
use crate::task::{Task, TaskStatus};

/// The capped wire shape of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub goal: String,
    pub context: Option<String>,
    pub planner_model: String,
    pub executor_model: String,
    pub max_turns: u32,
    pub timeout_ms: u64,
    pub status: String,
    pub plan: Vec<String>,
    pub turn_count: u32,
    pub tokens_used: u64,
    pub result: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub max_turns_reached: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last N transcript messages, content capped per message.
    pub messages: Vec<RecordMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMessage {
    pub role: String,
    pub content: String,
}

impl TaskRecord {
    pub fn from_task(task: &Task, caps: &PersistenceConfig) -> Self {
        let skip = task.messages.len().saturating_sub(caps.max_messages);
        let messages = task
            .messages
            .iter()
            .skip(skip)
            .map(|m| RecordMessage {
                role: m.role.clone(),
                content: truncate_str(m.content.as_deref().unwrap_or(""), caps.max_message_len),
            })
            .collect();

        Self {
            id: task.id.clone(),
            goal: task.goal.clone(),
            context: task
                .context
                .as_deref()
                .map(|c| truncate_str(c, caps.max_context)),
            planner_model: task.planner_model.clone(),
            executor_model: task.executor_model.clone(),
            max_turns: task.max_turns,
            timeout_ms: task.timeout_ms,
            status: task.status.to_string(),
            plan: task.plan.clone(),
            turn_count: task.turn_count,
            tokens_used: task.tokens_used,
            result: task
                .result
                .as_deref()
                .map(|r| truncate_str(r, caps.max_result)),
            error: task
                .error
                .as_deref()
                .map(|e| truncate_str(e, caps.max_result)),
            max_turns_reached: task.max_turns_reached,
            created_at: task.created_at,
            completed_at: task.completed_at,
            messages,
        }
    }

    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().map(|s| s.is_terminal()).unwrap_or(false)
    }
}

/// Truncate on a char boundary, marking the cut.
pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
