//! The task engine: registry, spawn, and the plan→execute→retry control flow.
//!
//! Each spawned task runs its own logically-sequential loop on a tokio task;
//! different tasks progress concurrently. Abort is cooperative: the cancel
//! token is checked at loop boundaries, never mid-provider-call, so callers
//! must tolerate a short tail of activity after abort.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clarify::ClarificationGate;
use crate::config::EngineConfig;
use crate::gateway::{ToolGateway, BACKGROUND_TOOLS, CLARIFICATION_TOOL};
use crate::planner;
use crate::providers::ProviderError;
use crate::store::{truncate_str, RecordMessage, TaskRecord};
use crate::task::{Task, TaskSnapshot, TaskSpec, TaskStatus};
use crate::tools::{CheckBackgroundTaskTool, StartBackgroundTaskTool};
use crate::traits::{ChatMessage, ModelProvider, Notifier, ProviderResponse, TaskStore, Tool, ToolCall};
use crate::watchdog::{Watchdog, WatchdogEntry, WatchdogEvent};

/// Placeholder answer used when a clarification wait times out.
pub const BEST_JUDGMENT_ANSWER: &str = "No answer received. Continue with your best judgment.";

static STEP_DONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*STEP DONE:\s*(\d+)\s*$").expect("valid step-done regex"));

struct TaskHandle {
    task: Arc<RwLock<Task>>,
    cancel: CancellationToken,
}

/// How one task's drive ended. The caller performs the terminal transition
/// and the single outcome notification.
enum Outcome {
    Completed(String),
    Failed(String),
    Aborted,
}

pub struct TaskEngine {
    provider: Arc<dyn ModelProvider>,
    gateway: ToolGateway,
    notifier: Arc<dyn Notifier>,
    store: Option<Arc<dyn TaskStore>>,
    config: EngineConfig,
    tasks: RwLock<HashMap<String, TaskHandle>>,
    clarifications: ClarificationGate,
    watchdog: Arc<Watchdog>,
    watchdog_tx: mpsc::UnboundedSender<WatchdogEvent>,
    /// Self-reference for handing owned clones to spawned loops.
    self_ref: Weak<TaskEngine>,
}

impl TaskEngine {
    /// Build the engine and start its watchdog. `tools` is the host's tool
    /// registry; the clarification and background-task capability names are
    /// reserved for the engine's own built-ins.
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Vec<Arc<dyn Tool>>,
        notifier: Arc<dyn Notifier>,
        store: Option<Arc<dyn TaskStore>>,
        config: EngineConfig,
    ) -> anyhow::Result<Arc<Self>> {
        for tool in &tools {
            let name = tool.name();
            if name == CLARIFICATION_TOOL || BACKGROUND_TOOLS.contains(&name) {
                anyhow::bail!("Tool name '{}' is reserved by the engine", name);
            }
        }
        // Reject duplicates among host tools before the cyclic construction;
        // with reserved names excluded above, the full list below is then
        // guaranteed collision-free.
        {
            let mut seen = std::collections::HashSet::new();
            for tool in &tools {
                if !seen.insert(tool.name().to_string()) {
                    anyhow::bail!("Duplicate tool registered: {}", tool.name());
                }
            }
        }

        let (watchdog_tx, watchdog_rx) = mpsc::unbounded_channel();
        let watchdog = Arc::new(Watchdog::new(config.watchdog.clone()));
        let max_tool_output = config.max_tool_output;

        let engine = Arc::new_cyclic(|weak| {
            let mut all = tools;
            all.push(Arc::new(StartBackgroundTaskTool::new(weak.clone())) as Arc<dyn Tool>);
            all.push(Arc::new(CheckBackgroundTaskTool::new(weak.clone())) as Arc<dyn Tool>);
            let gateway = ToolGateway::new(all, max_tool_output)
                .expect("tool names validated before construction");
            Self {
                provider,
                gateway,
                notifier,
                store,
                config,
                tasks: RwLock::new(HashMap::new()),
                clarifications: ClarificationGate::new(),
                watchdog: watchdog.clone(),
                watchdog_tx,
                self_ref: weak.clone(),
            }
        });

        watchdog.start(Arc::downgrade(&engine), watchdog_rx);
        Ok(engine)
    }

    // ==================== Exposed surface ====================

    /// Spawn a new task. Returns its id immediately; the loop runs in the
    /// background and reports through the notifier.
    pub async fn spawn(&self, spec: TaskSpec) -> anyhow::Result<String> {
        self.spawn_internal(spec, 0).await
    }

    pub async fn get_status(&self, task_id: &str) -> Option<TaskSnapshot> {
        let tasks = self.tasks.read().await;
        let handle = tasks.get(task_id)?;
        let snapshot = handle.task.read().await.snapshot();
        Some(snapshot)
    }

    /// Resolve a pending clarification (or plan approval) by task id.
    pub async fn answer_clarification(&self, task_id: &str, answer: &str) -> bool {
        self.clarifications.resolve(task_id, answer).await
    }

    /// Signal abort. Takes effect at the task's next checkpoint.
    pub async fn abort(&self, task_id: &str) -> bool {
        let tasks = self.tasks.read().await;
        if let Some(handle) = tasks.get(task_id) {
            if !handle.task.read().await.status.is_terminal() {
                info!(task_id, "Abort signalled");
                handle.cancel.cancel();
                return true;
            }
        }
        false
    }

    pub async fn abort_all(&self) -> usize {
        let tasks = self.tasks.read().await;
        let mut count = 0;
        for handle in tasks.values() {
            if !handle.task.read().await.status.is_terminal() {
                handle.cancel.cancel();
                count += 1;
            }
        }
        count
    }

    /// Drop terminal tasks from the registry and the store. Running tasks
    /// are untouched.
    pub async fn clear_all(&self) -> usize {
        let mut tasks = self.tasks.write().await;
        let mut terminal = Vec::new();
        for (id, handle) in tasks.iter() {
            if handle.task.read().await.status.is_terminal() {
                terminal.push(id.clone());
            }
        }
        for id in &terminal {
            tasks.remove(id);
            if let Some(store) = &self.store {
                if let Err(e) = store.remove(id).await {
                    warn!(task_id = %id, error = %e, "Failed to remove persisted record");
                }
            }
        }
        terminal.len()
    }

    /// Liveness signal from the host (the engine's own loops report
    /// automatically each turn).
    pub fn report_activity(&self, task_id: &str) {
        self.send_event(WatchdogEvent::Activity {
            task_id: task_id.to_string(),
        });
    }

    /// Step-completion signal from the host, for hosts that attribute model
    /// output to plan steps themselves.
    pub fn step_completed(&self, task_id: &str, step: usize) {
        self.send_event(WatchdogEvent::StepCompleted {
            task_id: task_id.to_string(),
            step,
        });
    }

    pub async fn watchdog_status(&self) -> Vec<WatchdogEntry> {
        self.watchdog.snapshots().await
    }

    /// Startup recovery: restore persisted records into the registry.
    /// Interrupted (non-terminal) records are marked failed, never silently
    /// resumed mid-loop. Returns how many were marked interrupted.
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let records = store.restore_all().await?;
        let mut interrupted = 0;
        for mut record in records {
            if !record.is_terminal() {
                warn!(task_id = %record.id, status = %record.status, "Marking interrupted task as failed");
                record.status = TaskStatus::Failed.to_string();
                record.error = Some("Task interrupted by engine restart".to_string());
                record.completed_at = Some(Utc::now());
                store.persist(&record).await?;
                interrupted += 1;
            }
            let task = task_from_record(&record);
            self.tasks.write().await.insert(
                task.id.clone(),
                TaskHandle {
                    task: Arc::new(RwLock::new(task)),
                    cancel: CancellationToken::new(),
                },
            );
        }
        Ok(interrupted)
    }

    // ==================== Spawn & lifecycle ====================

    pub(crate) async fn spawn_internal(
        &self,
        spec: TaskSpec,
        respawn_count: u32,
    ) -> anyhow::Result<String> {
        if let Some(allowed) = &spec.allowed_tools {
            self.gateway.validate_allow_list(allowed)?;
        }
        let Some(engine) = self.self_ref.upgrade() else {
            anyhow::bail!("Engine is shutting down");
        };

        let task = Task::new(spec, self.config.max_turns, self.config.timeout_ms);
        let id = task.id.clone();
        let cancel = CancellationToken::new();
        let task_arc = Arc::new(RwLock::new(task));

        self.tasks.write().await.insert(
            id.clone(),
            TaskHandle {
                task: task_arc.clone(),
                cancel: cancel.clone(),
            },
        );

        info!(task_id = %id, respawn_count, "Task spawned");
        tokio::spawn(async move {
            engine.run_task(task_arc, cancel, respawn_count).await;
        });
        Ok(id)
    }

    /// Spawn a continuation for a stalled task, seeded with its remaining
    /// plan steps. Called by the watchdog; the incremented respawn count is
    /// carried into the new task's registration.
    pub(crate) async fn respawn_continuation(
        &self,
        task_id: &str,
        remaining: &[String],
        from_step: usize,
        respawn_count: u32,
    ) -> Option<String> {
        let spec = {
            let tasks = self.tasks.read().await;
            let handle = tasks.get(task_id)?;
            let task = handle.task.read().await;

            let resume = format!(
                "Resuming from step {} of the original plan. Remaining steps:\n{}",
                from_step + 1,
                planner::plan_as_numbered_list(remaining)
            );
            let context = match &task.context {
                Some(c) => format!("{c}\n\n{resume}"),
                None => resume,
            };

            let mut spec = TaskSpec::new(task.goal.clone());
            spec.context = Some(context);
            spec.planner_model = task.planner_model.clone();
            spec.executor_model = task.executor_model.clone();
            spec.max_turns = Some(task.max_turns);
            spec.timeout_ms = Some(task.timeout_ms);
            spec.allowed_tools = task.allowed_tools.clone();
            spec.can_clarify = task.can_clarify;
            spec.can_background = task.can_background;
            spec.origin = task.origin.clone();
            spec
        };

        match self.spawn_internal(spec, respawn_count).await {
            Ok(new_id) => Some(new_id),
            Err(e) => {
                error!(task_id, error = %e, "Respawn failed");
                None
            }
        }
    }

    async fn run_task(
        self: Arc<Self>,
        task: Arc<RwLock<Task>>,
        cancel: CancellationToken,
        respawn_count: u32,
    ) {
        let (id, origin, timeout_ms) = {
            let t = task.read().await;
            (t.id.clone(), t.origin.clone(), t.timeout_ms)
        };
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        self.persist(&task).await;

        let outcome = match tokio::time::timeout_at(
            deadline,
            self.drive(&task, &cancel, respawn_count, deadline),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Failed(format!("Task timed out after {}ms", timeout_ms)),
        };

        self.clarifications.cancel_pending(&id).await;

        let text = {
            let mut t = task.write().await;
            t.clarification_question = None;
            match outcome {
                Outcome::Completed(result) => {
                    t.result = Some(result.clone());
                    t.transition(TaskStatus::Completed);
                    let flag = if t.max_turns_reached {
                        " (turn limit reached)"
                    } else {
                        ""
                    };
                    format!("Task {} completed{}: {}", id, flag, truncate_str(&result, 2_000))
                }
                Outcome::Failed(err) => {
                    t.error = Some(err.clone());
                    t.transition(TaskStatus::Failed);
                    format!("Task {} failed: {}", id, err)
                }
                Outcome::Aborted => {
                    t.transition(TaskStatus::Aborted);
                    format!("Task {} aborted.", id)
                }
            }
        };
        self.persist(&task).await;

        let status = task.read().await.status;
        info!(task_id = %id, status = %status, "Task finished");
        match status {
            TaskStatus::Completed => self.send_event(WatchdogEvent::TaskCompleted {
                task_id: id.clone(),
            }),
            _ => self.send_event(WatchdogEvent::TaskFailed {
                task_id: id.clone(),
            }),
        }

        // Exactly one notification per terminal transition.
        self.notify_origin(&origin, &text).await;
    }

    /// Dependency wait → planning → approval → execution loop. Terminal
    /// transitions are left to the caller.
    async fn drive(
        &self,
        task: &Arc<RwLock<Task>>,
        cancel: &CancellationToken,
        respawn_count: u32,
        deadline: tokio::time::Instant,
    ) -> Outcome {
        let (id, origin, dep) = {
            let t = task.read().await;
            (t.id.clone(), t.origin.clone(), t.depends_on.clone())
        };

        if let Some(dep_id) = dep {
            self.set_status(task, TaskStatus::WaitingDependency).await;
            match self.wait_for_dependency(&dep_id, deadline, cancel).await {
                DepWait::Aborted => return Outcome::Aborted,
                DepWait::Failed(reason) => return Outcome::Failed(reason),
                DepWait::Completed(result) => {
                    if let Some(text) = result {
                        let mut t = task.write().await;
                        let addition = format!("Result from dependency task {}:\n{}", dep_id, text);
                        t.context = Some(match &t.context {
                            Some(c) => format!("{c}\n\n{addition}"),
                            None => addition,
                        });
                    }
                }
            }
        }
        if cancel.is_cancelled() {
            return Outcome::Aborted;
        }

        self.set_status(task, TaskStatus::Planning).await;
        let (goal, context, planner_model) = {
            let t = task.read().await;
            (t.goal.clone(), t.context.clone(), t.planner_model.clone())
        };
        let plan =
            planner::build_plan(self.provider.as_ref(), &planner_model, &goal, context.as_deref())
                .await;
        if cancel.is_cancelled() {
            return Outcome::Aborted;
        }
        {
            let mut t = task.write().await;
            t.plan = plan.clone();
        }
        self.send_event(WatchdogEvent::Registered {
            task_id: id.clone(),
            plan: plan.clone(),
            respawn_count,
            origin: origin.clone(),
        });
        self.persist(task).await;

        let require_approval = task.read().await.require_plan_approval;
        if require_approval {
            let summary = planner::plan_summary(&goal, &plan);
            {
                let mut t = task.write().await;
                t.transition(TaskStatus::WaitingApproval);
                t.clarification_question = Some(summary.clone());
            }
            self.persist(task).await;
            self.notify_origin(&origin, &format!("Task {} awaiting plan approval.\n{}", id, summary))
                .await;

            // Any answer approves; silence approves after the timeout. A
            // silent supervisor must not wedge autonomous work.
            let answer = self
                .clarifications
                .wait(&id, self.config.clarification_timeout(), cancel)
                .await;
            {
                let mut t = task.write().await;
                t.clarification_question = None;
            }
            if cancel.is_cancelled() {
                return Outcome::Aborted;
            }
            if let Some(answer) = answer {
                let mut t = task.write().await;
                let addition = format!("Plan approval note from caller: {}", answer);
                t.context = Some(match &t.context {
                    Some(c) => format!("{c}\n\n{addition}"),
                    None => addition,
                });
            }
        }

        self.set_status(task, TaskStatus::Running).await;
        self.execute_loop(task, cancel).await
    }

    // ==================== Execution loop ====================

    async fn execute_loop(&self, task: &Arc<RwLock<Task>>, cancel: &CancellationToken) -> Outcome {
        let (id, origin, executor_model, max_turns, allowed, can_clarify, can_background) = {
            let t = task.read().await;
            (
                t.id.clone(),
                t.origin.clone(),
                t.executor_model.clone(),
                t.max_turns,
                t.allowed_tools.clone(),
                t.can_clarify,
                t.can_background,
            )
        };
        let schemas = self
            .gateway
            .schemas_for(allowed.as_ref(), can_clarify, can_background);

        {
            let mut t = task.write().await;
            if t.messages.is_empty() {
                let prompt = build_system_prompt(&t.goal, t.context.as_deref(), &t.plan);
                t.messages.push(ChatMessage::system(prompt));
                t.messages
                    .push(ChatMessage::user("Begin working on the task now."));
            }
        }

        let mut tools_used: Vec<String> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Outcome::Aborted;
            }
            let turn = {
                let mut t = task.write().await;
                if t.turn_count >= max_turns {
                    break;
                }
                t.turn_count += 1;
                t.turn_count
            };
            self.send_event(WatchdogEvent::Activity {
                task_id: id.clone(),
            });

            let messages = task.read().await.messages.clone();
            let resp = match self
                .chat_with_retry(&executor_model, &messages, &schemas)
                .await
            {
                Ok(resp) => resp,
                Err(e) => return Outcome::Failed(format!("Provider call failed: {e}")),
            };
            self.count_usage(task, &resp).await;

            if let Some(content) = &resp.content {
                self.report_steps_from_text(&id, content);
            }

            if resp.tool_calls.is_empty() {
                // No tool calls: the text is the final result.
                let text = resp.content.unwrap_or_default();
                task.write()
                    .await
                    .messages
                    .push(ChatMessage::assistant(text.clone()));
                self.persist(task).await;
                return Outcome::Completed(text);
            }

            // Tools run sequentially: effects may be ordered and results
            // must stay attributable to the correct call id.
            let calls = resp.tool_calls.clone();
            let mut results: Vec<String> = Vec::with_capacity(calls.len());
            for call in &calls {
                let result = if call.name == CLARIFICATION_TOOL {
                    self.handle_clarification(task, cancel, call).await
                } else {
                    self.send_event(WatchdogEvent::Activity {
                        task_id: id.clone(),
                    });
                    if !tools_used.contains(&call.name) {
                        tools_used.push(call.name.clone());
                    }
                    self.gateway
                        .execute(&call.name, &call.arguments, allowed.as_ref(), can_background)
                        .await
                };
                results.push(result);
            }

            {
                let mut t = task.write().await;
                t.messages
                    .push(ChatMessage::assistant_tool_calls(resp.content.clone(), calls.clone()));
                for (call, result) in calls.iter().zip(results) {
                    t.messages
                        .push(ChatMessage::tool_result(&call.id, &call.name, result));
                }
            }
            self.persist(task).await;

            if self.config.report_every > 0 && turn % self.config.report_every == 0 {
                let tokens = task.read().await.tokens_used;
                self.notify_origin(
                    &origin,
                    &format!(
                        "Task {} progress: turn {}/{}, tools used: [{}], {} tokens",
                        id,
                        turn,
                        max_turns,
                        tools_used.join(", "),
                        tokens
                    ),
                )
                .await;
            }
        }

        // Turn budget exhausted: soft-degrade to a best-effort summary
        // rather than failing.
        info!(task_id = %id, max_turns, "Turn limit reached, requesting final summary");
        task.write().await.max_turns_reached = true;
        let summary = self.final_summary(task, &executor_model).await;
        Outcome::Completed(summary)
    }

    async fn handle_clarification(
        &self,
        task: &Arc<RwLock<Task>>,
        cancel: &CancellationToken,
        call: &ToolCall,
    ) -> String {
        let question = serde_json::from_str::<Value>(&call.arguments)
            .ok()
            .and_then(|v| v["question"].as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "The task needs clarification.".to_string());

        let (id, origin) = {
            let mut t = task.write().await;
            t.transition(TaskStatus::WaitingClarification);
            t.clarification_question = Some(question.clone());
            (t.id.clone(), t.origin.clone())
        };
        self.persist(task).await;
        self.notify_origin(&origin, &format!("Task {} needs clarification: {}", id, question))
            .await;

        let answer = self
            .clarifications
            .wait(&id, self.config.clarification_timeout(), cancel)
            .await;

        {
            let mut t = task.write().await;
            t.clarification_question = None;
            if !cancel.is_cancelled() {
                t.transition(TaskStatus::Running);
            }
        }
        self.persist(task).await;

        answer.unwrap_or_else(|| BEST_JUDGMENT_ANSWER.to_string())
    }

    /// Provider call with bounded retry on transient errors. Delays come
    /// from config (10s/20s/30s by default); non-transient errors and
    /// budget exhaustion escalate to the caller.
    async fn chat_with_retry(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> anyhow::Result<ProviderResponse> {
        let mut attempt = 0usize;
        loop {
            match self.provider.chat(model, messages, tools).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    let retryable = e
                        .downcast_ref::<ProviderError>()
                        .map(|pe| pe.is_retryable())
                        .unwrap_or(false);
                    if !retryable || attempt >= self.config.retry_delays_secs.len() {
                        return Err(e);
                    }
                    let delay = self.config.retry_delays_secs[attempt];
                    warn!(
                        attempt = attempt + 1,
                        delay_secs = delay,
                        error = %e,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One additional non-tool call for a final summary after the turn
    /// budget runs out. Falls back to the last transcript entry.
    async fn final_summary(&self, task: &Arc<RwLock<Task>>, model: &str) -> String {
        let mut messages = task.read().await.messages.clone();
        messages.push(ChatMessage::user(
            "You have reached the turn limit. Summarize what you accomplished and what remains, as your final answer.",
        ));

        match self.provider.chat(model, &messages, &[]).await {
            Ok(resp) => {
                self.count_usage(task, &resp).await;
                match resp.content {
                    Some(text) if !text.is_empty() => text,
                    _ => last_transcript_text(task).await,
                }
            }
            Err(e) => {
                warn!(error = %e, "Final summary call failed, using last transcript entry");
                last_transcript_text(task).await
            }
        }
    }

    // ==================== Dependency resolution ====================

    async fn wait_for_dependency(
        &self,
        dep_id: &str,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
    ) -> DepWait {
        let poll = self.config.dependency_poll();
        loop {
            if cancel.is_cancelled() {
                return DepWait::Aborted;
            }
            match self.get_status(dep_id).await {
                Some(snap) if snap.status == TaskStatus::Completed => {
                    return DepWait::Completed(snap.result);
                }
                Some(snap) if snap.status.is_terminal() => {
                    return DepWait::Failed(format!(
                        "Dependency task {} failed or was aborted ({})",
                        dep_id, snap.status
                    ));
                }
                Some(_) => {}
                None => {
                    return DepWait::Failed(format!("Dependency task {} not found", dep_id));
                }
            }
            if tokio::time::Instant::now() + poll >= deadline {
                return DepWait::Failed(format!(
                    "Dependency task {} failed or timed out",
                    dep_id
                ));
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = cancel.cancelled() => return DepWait::Aborted,
            }
        }
    }

    // ==================== Shared plumbing ====================

    async fn set_status(&self, task: &Arc<RwLock<Task>>, status: TaskStatus) {
        task.write().await.transition(status);
        self.persist(task).await;
    }

    async fn count_usage(&self, task: &Arc<RwLock<Task>>, resp: &ProviderResponse) {
        if let Some(usage) = &resp.usage {
            task.write().await.tokens_used += usage.total();
        }
    }

    /// Forward `STEP DONE: <n>` markers from assistant text to the watchdog.
    /// The marker is a prompt contract like the planner's JSON array: the
    /// model may omit or garble it, and absence is fine.
    fn report_steps_from_text(&self, task_id: &str, text: &str) {
        for cap in STEP_DONE.captures_iter(text) {
            if let Ok(step) = cap[1].parse::<usize>() {
                if step > 0 {
                    self.step_completed(task_id, step - 1);
                }
            }
        }
    }

    fn send_event(&self, event: WatchdogEvent) {
        // Receiver gone means the watchdog loop is shutting down with us.
        let _ = self.watchdog_tx.send(event);
    }

    pub(crate) async fn notify_origin(&self, origin: &str, text: &str) {
        if let Err(e) = self.notifier.notify(origin, text).await {
            warn!(origin, error = %e, "Notification delivery failed");
        }
    }

    async fn persist(&self, task: &Arc<RwLock<Task>>) {
        let Some(store) = &self.store else {
            return;
        };
        let record = {
            let t = task.read().await;
            TaskRecord::from_task(&t, &self.config.persistence)
        };
        if let Err(e) = store.persist(&record).await {
            warn!(task_id = %record.id, error = %e, "Persist failed");
        }
    }
}

#[cfg(test)]
impl TaskEngine {
    /// Insert a task directly into the registry, bypassing the loop. Used by
    /// watchdog tests that need a non-terminal task without live execution.
    pub(crate) async fn insert_task_for_test(&self, task: Task) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.tasks.write().await.insert(
            task.id.clone(),
            TaskHandle {
                task: Arc::new(RwLock::new(task)),
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub(crate) async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub(crate) async fn task_ids(&self) -> Vec<String> {
        self.tasks.read().await.keys().cloned().collect()
    }

    pub(crate) fn watchdog_handle(&self) -> Arc<Watchdog> {
        self.watchdog.clone()
    }

    pub(crate) async fn transcript(&self, task_id: &str) -> Vec<ChatMessage> {
        let tasks = self.tasks.read().await;
        match tasks.get(task_id) {
            Some(handle) => handle.task.read().await.messages.clone(),
            None => Vec::new(),
        }
    }
}

enum DepWait {
    Completed(Option<String>),
    Failed(String),
    Aborted,
}

fn build_system_prompt(goal: &str, context: Option<&str>, plan: &[String]) -> String {
    let mut prompt = format!(
        "You are an autonomous task executor. Work toward the goal using the available tools.\n\nGoal: {}\n",
        goal
    );
    if let Some(ctx) = context {
        prompt.push_str(&format!("\nContext:\n{}\n", ctx));
    }
    prompt.push_str(&format!(
        "\nPlan:\n{}\n\nRules:\n\
         - Work through the plan in order, using tools as needed.\n\
         - When you finish a plan step, include a line `STEP DONE: <step number>` in your message.\n\
         - When the goal is satisfied, reply with your final answer and make no tool calls.",
        planner::plan_as_numbered_list(plan)
    ));
    prompt
}

async fn last_transcript_text(task: &Arc<RwLock<Task>>) -> String {
    let t = task.read().await;
    t.messages
        .iter()
        .rev()
        .find_map(|m| m.content.clone().filter(|c| !c.is_empty()))
        .unwrap_or_else(|| "Turn limit reached with no transcript.".to_string())
}

fn task_from_record(record: &TaskRecord) -> Task {
    let mut task = Task::new(
        TaskSpec::new(record.goal.clone()),
        record.max_turns,
        record.timeout_ms,
    );
    task.id = record.id.clone();
    task.context = record.context.clone();
    task.planner_model = record.planner_model.clone();
    task.executor_model = record.executor_model.clone();
    task.status = record.status().unwrap_or(TaskStatus::Failed);
    task.plan = record.plan.clone();
    task.turn_count = record.turn_count;
    task.tokens_used = record.tokens_used;
    task.result = record.result.clone();
    task.error = record.error.clone();
    task.max_turns_reached = record.max_turns_reached;
    task.created_at = record.created_at;
    task.completed_at = record.completed_at;
    task.messages = record
        .messages
        .iter()
        .map(|m: &RecordMessage| ChatMessage {
            role: m.role.clone(),
            content: Some(m.content.clone()),
            tool_call_id: None,
            tool_name: None,
            tool_calls: None,
        })
        .collect();
    task
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_done_markers_are_parsed() {
        let text = "Finished the fetch.\nSTEP DONE: 1\nMoving on.\n STEP DONE: 2";
        let steps: Vec<usize> = STEP_DONE
            .captures_iter(text)
            .map(|c| c[1].parse().unwrap())
            .collect();
        assert_eq!(steps, vec![1, 2]);
    }

    #[test]
    fn step_done_ignores_inline_mentions() {
        let text = "I will soon say STEP DONE: 3 but not on its own line";
        assert_eq!(STEP_DONE.captures_iter(text).count(), 0);
    }

    #[test]
    fn system_prompt_carries_goal_plan_and_rules() {
        let prompt = build_system_prompt(
            "ship it",
            Some("prod only"),
            &["build".to_string(), "deploy".to_string()],
        );
        assert!(prompt.contains("Goal: ship it"));
        assert!(prompt.contains("prod only"));
        assert!(prompt.contains("1. build"));
        assert!(prompt.contains("2. deploy"));
        assert!(prompt.contains("STEP DONE"));
    }
}
