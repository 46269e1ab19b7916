use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::traits::ChatMessage;

/// Lifecycle of a task. Exactly one status is active at a time; terminal
/// statuses (`Completed`, `Failed`, `Aborted`) are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    WaitingDependency,
    Planning,
    WaitingApproval,
    Running,
    WaitingClarification,
    Completed,
    Failed,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted)
    }

    /// The persisted wire form (snake_case), also used in notifications.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::WaitingDependency => "waiting_dependency",
            TaskStatus::Planning => "planning",
            TaskStatus::WaitingApproval => "waiting_approval",
            TaskStatus::Running => "running",
            TaskStatus::WaitingClarification => "waiting_clarification",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "waiting_dependency" => Some(TaskStatus::WaitingDependency),
            "planning" => Some(TaskStatus::Planning),
            "waiting_approval" => Some(TaskStatus::WaitingApproval),
            "running" => Some(TaskStatus::Running),
            "waiting_clarification" => Some(TaskStatus::WaitingClarification),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "aborted" => Some(TaskStatus::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spawn options for a new task. Everything except `goal` has a sensible
/// default; `None` limits fall back to the engine config.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub goal: String,
    pub context: Option<String>,
    /// Model selector handed to the provider for the planning call.
    pub planner_model: String,
    /// Model selector handed to the provider for execution turns.
    pub executor_model: String,
    pub max_turns: Option<u32>,
    pub timeout_ms: Option<u64>,
    /// When present, only these registry tools are exposed to the task.
    pub allowed_tools: Option<HashSet<String>>,
    /// Expose the ask_clarification capability to the executor.
    pub can_clarify: bool,
    /// Expose the background-task tools to the executor.
    pub can_background: bool,
    /// Pause for caller sign-off on the plan before execution.
    pub require_plan_approval: bool,
    /// Block on another task's completion before starting.
    pub depends_on: Option<String>,
    /// Notification destination for progress and terminal outcomes.
    pub origin: String,
}

impl TaskSpec {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            context: None,
            planner_model: "default".to_string(),
            executor_model: "default".to_string(),
            max_turns: None,
            timeout_ms: None,
            allowed_tools: None,
            can_clarify: false,
            can_background: false,
            require_plan_approval: false,
            depends_on: None,
            origin: "caller".to_string(),
        }
    }
}

/// The durable unit of work. Owned exclusively by its execution loop;
/// everyone else observes through snapshots.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub goal: String,
    pub context: Option<String>,
    pub planner_model: String,
    pub executor_model: String,
    pub max_turns: u32,
    pub timeout_ms: u64,
    pub allowed_tools: Option<HashSet<String>>,
    pub can_clarify: bool,
    pub can_background: bool,
    pub require_plan_approval: bool,
    pub depends_on: Option<String>,
    pub origin: String,
    pub status: TaskStatus,
    /// Set once after planning; remaining-step slicing happens only when a
    /// new task is spawned for a respawn.
    pub plan: Vec<String>,
    /// Append-only transcript consumed by the provider.
    pub messages: Vec<ChatMessage>,
    pub turn_count: u32,
    pub tokens_used: u64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub max_turns_reached: bool,
    /// Non-null only while status is WaitingClarification/WaitingApproval.
    pub clarification_question: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(spec: TaskSpec, default_max_turns: u32, default_timeout_ms: u64) -> Self {
        Self {
            id: short_id(),
            goal: spec.goal,
            context: spec.context,
            planner_model: spec.planner_model,
            executor_model: spec.executor_model,
            max_turns: spec.max_turns.unwrap_or(default_max_turns),
            timeout_ms: spec.timeout_ms.unwrap_or(default_timeout_ms),
            allowed_tools: spec.allowed_tools,
            can_clarify: spec.can_clarify,
            can_background: spec.can_background,
            require_plan_approval: spec.require_plan_approval,
            depends_on: spec.depends_on,
            origin: spec.origin,
            status: TaskStatus::Pending,
            plan: Vec::new(),
            messages: Vec::new(),
            turn_count: 0,
            tokens_used: 0,
            result: None,
            error: None,
            max_turns_reached: false,
            clarification_question: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to a new status. Terminal statuses stamp `completed_at` exactly
    /// once; transitions out of a terminal status are a logic error.
    pub fn transition(&mut self, status: TaskStatus) {
        debug_assert!(
            !self.status.is_terminal(),
            "transition out of terminal status {}",
            self.status
        );
        self.status = status;
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            goal: self.goal.clone(),
            status: self.status,
            plan: self.plan.clone(),
            turn_count: self.turn_count,
            tokens_used: self.tokens_used,
            result: self.result.clone(),
            error: self.error.clone(),
            max_turns_reached: self.max_turns_reached,
            clarification_question: self.clarification_question.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Read model returned by `TaskEngine::get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub goal: String,
    pub status: TaskStatus,
    pub plan: Vec<String>,
    pub turn_count: u32,
    pub tokens_used: u64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub max_turns_reached: bool,
    pub clarification_question: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Opaque short task identifier (first uuid segment).
fn short_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}
