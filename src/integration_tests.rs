//! End-to-end scenarios against a scripted provider.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::EngineConfig;
use crate::engine::{TaskEngine, BEST_JUDGMENT_ANSWER};
use crate::store::{MemoryTaskStore, TaskRecord};
use crate::task::{Task, TaskSnapshot, TaskSpec, TaskStatus};
use crate::testing::{RecordingNotifier, ScriptStep, ScriptedProvider, StaticTool};
use crate::traits::{TaskStore, Tool};
use crate::watchdog::{WatchdogEntry, WatchdogStatus};

const PLAN_TWO_STEPS: &str = r#"["Gather data", "Write summary"]"#;

fn test_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.retry_delays_secs = vec![0, 0, 0];
    cfg.dependency_poll_ms = 10;
    cfg.report_every = 0;
    cfg
}

fn build_engine(
    steps: Vec<ScriptStep>,
    tools: Vec<Arc<dyn Tool>>,
    cfg: EngineConfig,
) -> (
    Arc<TaskEngine>,
    Arc<ScriptedProvider>,
    Arc<RecordingNotifier>,
    Arc<MemoryTaskStore>,
) {
    let provider = Arc::new(ScriptedProvider::new(steps));
    let notifier = Arc::new(RecordingNotifier::new());
    let store = Arc::new(MemoryTaskStore::new());
    let engine = TaskEngine::new(
        provider.clone(),
        tools,
        notifier.clone(),
        Some(store.clone()),
        cfg,
    )
    .expect("engine builds");
    (engine, provider, notifier, store)
}

async fn wait_terminal(engine: &Arc<TaskEngine>, id: &str) -> TaskSnapshot {
    for _ in 0..1_000 {
        if let Some(snap) = engine.get_status(id).await {
            if snap.status.is_terminal() {
                return snap;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} did not reach a terminal status");
}

async fn wait_status(engine: &Arc<TaskEngine>, id: &str, status: TaskStatus) {
    for _ in 0..1_000 {
        if let Some(snap) = engine.get_status(id).await {
            if snap.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} never reached {status}");
}

/// Keep answering until the gate has a pending slot (the status flips just
/// before the slot is registered).
async fn answer_when_pending(engine: &Arc<TaskEngine>, id: &str, answer: &str) {
    for _ in 0..1_000 {
        if engine.answer_clarification(id, answer).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("clarification for {id} never became pending");
}

#[tokio::test]
async fn plain_text_response_completes_task() {
    let (engine, _, notifier, _) = build_engine(
        vec![ScriptStep::text(PLAN_TWO_STEPS), ScriptStep::text("all done")],
        vec![],
        test_config(),
    );

    let id = engine.spawn(TaskSpec::new("summarize the data")).await.unwrap();
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.status, TaskStatus::Completed);
    assert_eq!(snap.result.as_deref(), Some("all done"));
    assert_eq!(snap.plan, vec!["Gather data", "Write summary"]);
    assert_eq!(snap.turn_count, 1);
    assert!(!snap.max_turns_reached);
    assert!(snap.completed_at.is_some());

    // Exactly one terminal notification.
    let sent = notifier.sent().await;
    let terminal: Vec<_> = sent
        .iter()
        .filter(|(_, text)| text.contains("completed") || text.contains("failed") || text.contains("aborted"))
        .collect();
    assert_eq!(terminal.len(), 1);
    assert!(terminal[0].1.contains(&id));
}

#[tokio::test]
async fn malformed_planner_output_degrades_to_goal_plan() {
    let (engine, _, _, _) = build_engine(
        vec![ScriptStep::text("no JSON here"), ScriptStep::text("ok")],
        vec![],
        test_config(),
    );

    let id = engine.spawn(TaskSpec::new("write the report")).await.unwrap();
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.plan, vec!["write the report"]);
    assert_eq!(snap.status, TaskStatus::Completed);
}

#[tokio::test]
async fn tool_error_never_aborts_the_loop() {
    let (engine, _, _, _) = build_engine(
        vec![
            ScriptStep::text(r#"["Do the thing"]"#),
            ScriptStep::call("boom", "{}"),
            ScriptStep::text("recovered"),
        ],
        vec![Arc::new(StaticTool::failing("boom", "kaput"))],
        test_config(),
    );

    let id = engine.spawn(TaskSpec::new("survive a bad tool")).await.unwrap();
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.status, TaskStatus::Completed);
    assert_eq!(snap.result.as_deref(), Some("recovered"));
    assert_eq!(snap.turn_count, 2);

    let transcript = engine.transcript(&id).await;
    let tool_msg = transcript
        .iter()
        .find(|m| m.role == "tool")
        .expect("tool result message present");
    assert_eq!(tool_msg.content.as_deref(), Some("Error [boom]: kaput"));
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
}

#[tokio::test]
async fn turn_exhaustion_soft_degrades_to_summary() {
    let (engine, _, _, _) = build_engine(
        vec![
            ScriptStep::text(r#"["Step one", "Step two"]"#),
            ScriptStep::call("echo", "{}"),
            ScriptStep::text("summary text"),
        ],
        vec![Arc::new(StaticTool::ok("echo", "hi"))],
        test_config(),
    );

    let mut spec = TaskSpec::new("bounded work");
    spec.max_turns = Some(1);
    let id = engine.spawn(spec).await.unwrap();
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.status, TaskStatus::Completed);
    assert!(snap.max_turns_reached);
    assert_eq!(snap.result.as_deref(), Some("summary text"));
    assert_eq!(snap.turn_count, 1);
}

#[tokio::test]
async fn turn_count_never_exceeds_max_turns() {
    // The provider asks for a tool on every turn; the fallback repeats it.
    let (engine, _, _, _) = build_engine(
        vec![
            ScriptStep::text(r#"["Loop forever"]"#),
            ScriptStep::call("echo", "{}"),
        ],
        vec![Arc::new(StaticTool::ok("echo", "hi"))],
        test_config(),
    );

    let mut spec = TaskSpec::new("bounded");
    spec.max_turns = Some(3);
    let id = engine.spawn(spec).await.unwrap();
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.turn_count, 3);
    assert_eq!(snap.status, TaskStatus::Completed);
    assert!(snap.max_turns_reached);
}

#[tokio::test]
async fn transient_errors_are_retried_then_succeed() {
    let (engine, provider, _, _) = build_engine(
        vec![
            ScriptStep::text(r#"["One step"]"#),
            ScriptStep::TransientError,
            ScriptStep::TransientError,
            ScriptStep::text("ok after retries"),
        ],
        vec![],
        test_config(),
    );

    let id = engine.spawn(TaskSpec::new("flaky provider")).await.unwrap();
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.status, TaskStatus::Completed);
    assert_eq!(snap.result.as_deref(), Some("ok after retries"));
    // Plan call + first attempt + two retries.
    assert_eq!(provider.call_count(), 4);
}

#[tokio::test]
async fn fatal_provider_error_fails_immediately() {
    let (engine, provider, _, _) = build_engine(
        vec![
            ScriptStep::text(r#"["One step"]"#),
            ScriptStep::FatalError("bad key".to_string()),
        ],
        vec![],
        test_config(),
    );

    let id = engine.spawn(TaskSpec::new("doomed")).await.unwrap();
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.status, TaskStatus::Failed);
    assert!(snap.error.as_deref().unwrap().contains("bad key"));
    // No retries on a fatal error.
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test]
async fn transient_retry_budget_escalates_to_failure() {
    let (engine, provider, _, _) = build_engine(
        vec![
            ScriptStep::text(r#"["One step"]"#),
            ScriptStep::TransientError,
        ],
        vec![],
        test_config(),
    );

    let id = engine.spawn(TaskSpec::new("always overloaded")).await.unwrap();
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.status, TaskStatus::Failed);
    // Plan call + initial attempt + three retries.
    assert_eq!(provider.call_count(), 5);
}

#[tokio::test]
async fn dependency_failure_fails_dependent_without_provider_calls() {
    let (engine, provider, _, _) = build_engine(
        vec![
            // Task A: planning degrades, then the single turn fails fatally.
            ScriptStep::FatalError("down".to_string()),
            ScriptStep::FatalError("down".to_string()),
        ],
        vec![],
        test_config(),
    );

    let a = engine.spawn(TaskSpec::new("task a")).await.unwrap();
    let snap_a = wait_terminal(&engine, &a).await;
    assert_eq!(snap_a.status, TaskStatus::Failed);
    let calls_after_a = provider.call_count();

    let mut spec_b = TaskSpec::new("task b");
    spec_b.depends_on = Some(a.clone());
    let b = engine.spawn(spec_b).await.unwrap();
    let snap_b = wait_terminal(&engine, &b).await;

    assert_eq!(snap_b.status, TaskStatus::Failed);
    assert!(snap_b.error.as_deref().unwrap().to_lowercase().contains("dependency"));
    assert_eq!(snap_b.turn_count, 0);
    // B never called its provider.
    assert_eq!(provider.call_count(), calls_after_a);
}

#[tokio::test]
async fn missing_dependency_fails_dependent() {
    let (engine, _, _, _) = build_engine(vec![], vec![], test_config());

    let mut spec = TaskSpec::new("orphan");
    spec.depends_on = Some("no-such-id".to_string());
    let id = engine.spawn(spec).await.unwrap();
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.status, TaskStatus::Failed);
    assert!(snap.error.as_deref().unwrap().contains("Dependency"));
}

#[tokio::test]
async fn dependency_result_feeds_dependent_context() {
    let (engine, _, _, _) = build_engine(
        vec![
            ScriptStep::text(r#"["Produce the numbers"]"#),
            ScriptStep::text("A RESULT: 42"),
            ScriptStep::text(r#"["Use the numbers"]"#),
            ScriptStep::text("b done"),
        ],
        vec![],
        test_config(),
    );

    let a = engine.spawn(TaskSpec::new("task a")).await.unwrap();
    assert_eq!(wait_terminal(&engine, &a).await.status, TaskStatus::Completed);

    let mut spec_b = TaskSpec::new("task b");
    spec_b.depends_on = Some(a.clone());
    let b = engine.spawn(spec_b).await.unwrap();
    let snap_b = wait_terminal(&engine, &b).await;
    assert_eq!(snap_b.status, TaskStatus::Completed);

    let transcript = engine.transcript(&b).await;
    let system = transcript.first().expect("system prompt seeded");
    assert!(system.content.as_deref().unwrap().contains("A RESULT: 42"));
}

#[tokio::test]
async fn clarification_timeout_resolves_to_best_judgment() {
    let mut cfg = test_config();
    cfg.clarification_timeout_secs = 0;
    let (engine, _, notifier, _) = build_engine(
        vec![
            ScriptStep::text(r#"["Pick an environment"]"#),
            ScriptStep::call("ask_clarification", r#"{"question": "Which env?"}"#),
            ScriptStep::text("proceeded on best judgment"),
        ],
        vec![],
        cfg,
    );

    let mut spec = TaskSpec::new("deploy somewhere");
    spec.can_clarify = true;
    let id = engine.spawn(spec).await.unwrap();
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.status, TaskStatus::Completed);
    assert!(snap.clarification_question.is_none());

    let transcript = engine.transcript(&id).await;
    let tool_msg = transcript.iter().find(|m| m.role == "tool").unwrap();
    assert_eq!(tool_msg.content.as_deref(), Some(BEST_JUDGMENT_ANSWER));

    let sent = notifier.sent().await;
    assert!(sent.iter().any(|(_, text)| text.contains("needs clarification")));
}

#[tokio::test]
async fn clarification_answer_flows_back_into_transcript() {
    let (engine, _, _, _) = build_engine(
        vec![
            ScriptStep::text(r#"["Pick an environment"]"#),
            ScriptStep::call("ask_clarification", r#"{"question": "Which env?"}"#),
            ScriptStep::text("deployed"),
        ],
        vec![],
        test_config(),
    );

    let mut spec = TaskSpec::new("deploy");
    spec.can_clarify = true;
    let id = engine.spawn(spec).await.unwrap();

    wait_status(&engine, &id, TaskStatus::WaitingClarification).await;
    let snap = engine.get_status(&id).await.unwrap();
    assert_eq!(snap.clarification_question.as_deref(), Some("Which env?"));

    answer_when_pending(&engine, &id, "use prod").await;
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.status, TaskStatus::Completed);
    let transcript = engine.transcript(&id).await;
    let tool_msg = transcript.iter().find(|m| m.role == "tool").unwrap();
    assert_eq!(tool_msg.content.as_deref(), Some("use prod"));
}

#[tokio::test]
async fn abort_during_clarification_reaches_aborted() {
    let (engine, _, notifier, _) = build_engine(
        vec![
            ScriptStep::text(r#"["Ask first"]"#),
            ScriptStep::call("ask_clarification", r#"{"question": "Really?"}"#),
        ],
        vec![],
        test_config(),
    );

    let mut spec = TaskSpec::new("abortable");
    spec.can_clarify = true;
    let id = engine.spawn(spec).await.unwrap();

    wait_status(&engine, &id, TaskStatus::WaitingClarification).await;
    assert!(engine.abort(&id).await);
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.status, TaskStatus::Aborted);
    let sent = notifier.sent().await;
    assert_eq!(sent.iter().filter(|(_, t)| t.contains("aborted")).count(), 1);
}

#[tokio::test]
async fn abort_on_unknown_or_terminal_task_returns_false() {
    let (engine, _, _, _) = build_engine(
        vec![ScriptStep::text(r#"["One"]"#), ScriptStep::text("done")],
        vec![],
        test_config(),
    );

    assert!(!engine.abort("no-such-task").await);

    let id = engine.spawn(TaskSpec::new("quick")).await.unwrap();
    wait_terminal(&engine, &id).await;
    assert!(!engine.abort(&id).await);
}

#[tokio::test]
async fn plan_approval_gates_execution_until_answered() {
    let (engine, _, notifier, _) = build_engine(
        vec![
            ScriptStep::text(r#"["Step A", "Step B"]"#),
            ScriptStep::text("approved and done"),
        ],
        vec![],
        test_config(),
    );

    let mut spec = TaskSpec::new("needs sign-off");
    spec.require_plan_approval = true;
    let id = engine.spawn(spec).await.unwrap();

    wait_status(&engine, &id, TaskStatus::WaitingApproval).await;
    let sent = notifier.sent().await;
    assert!(sent.iter().any(|(_, t)| t.contains("awaiting plan approval")));

    answer_when_pending(&engine, &id, "looks good").await;
    let snap = wait_terminal(&engine, &id).await;

    assert_eq!(snap.status, TaskStatus::Completed);
    let transcript = engine.transcript(&id).await;
    let system = transcript.first().unwrap();
    assert!(system.content.as_deref().unwrap().contains("looks good"));
}

#[tokio::test]
async fn restart_marks_interrupted_tasks_failed() {
    let store = Arc::new(MemoryTaskStore::new());
    let caps = crate::config::PersistenceConfig::default();

    // A task that was mid-run when the process died.
    let mut running = Task::new(TaskSpec::new("was running"), 20, 600_000);
    running.transition(TaskStatus::Running);
    running.turn_count = 4;
    let running_id = running.id.clone();
    store.persist(&TaskRecord::from_task(&running, &caps)).await.unwrap();

    // A task that had already finished.
    let mut done = Task::new(TaskSpec::new("was done"), 20, 600_000);
    done.transition(TaskStatus::Completed);
    done.result = Some("finished".to_string());
    let done_id = done.id.clone();
    store.persist(&TaskRecord::from_task(&done, &caps)).await.unwrap();

    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = TaskEngine::new(provider, vec![], notifier, Some(store.clone()), test_config())
        .unwrap();

    let interrupted = engine.recover().await.unwrap();
    assert_eq!(interrupted, 1);

    let snap = engine.get_status(&running_id).await.unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert!(snap.error.as_deref().unwrap().contains("interrupted"));
    assert_eq!(snap.turn_count, 4);

    let snap = engine.get_status(&done_id).await.unwrap();
    assert_eq!(snap.status, TaskStatus::Completed);

    // The store now agrees: nothing is left in a running state.
    let records = store.restore_all().await.unwrap();
    assert!(records.iter().all(|r| r.is_terminal()));
}

#[tokio::test]
async fn clear_all_drops_only_terminal_tasks() {
    let (engine, _, _, store) = build_engine(
        vec![ScriptStep::text(r#"["One"]"#), ScriptStep::text("done")],
        vec![],
        test_config(),
    );

    let id = engine.spawn(TaskSpec::new("short-lived")).await.unwrap();
    wait_terminal(&engine, &id).await;

    assert_eq!(engine.clear_all().await, 1);
    assert!(engine.get_status(&id).await.is_none());
    assert!(store.restore_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_tool_in_allow_list_fails_spawn() {
    let (engine, _, _, _) = build_engine(
        vec![],
        vec![Arc::new(StaticTool::ok("echo", "hi"))],
        test_config(),
    );

    let mut spec = TaskSpec::new("bad allow list");
    spec.allowed_tools = Some(HashSet::from(["no_such_tool".to_string()]));
    let err = engine.spawn(spec).await.err().unwrap();
    assert!(err.to_string().contains("no_such_tool"));
}

#[tokio::test]
async fn step_done_markers_advance_watchdog_bookkeeping() {
    let (engine, _, _, _) = build_engine(
        vec![
            ScriptStep::text(r#"["First", "Second", "Third"]"#),
            ScriptStep::text("STEP DONE: 1\nSTEP DONE: 2\nall wrapped up"),
        ],
        vec![],
        test_config(),
    );

    let id = engine.spawn(TaskSpec::new("stepwise")).await.unwrap();
    wait_terminal(&engine, &id).await;

    // Events drain asynchronously; poll the supervision view.
    for _ in 0..1_000 {
        let entries = engine.watchdog_status().await;
        if let Some(entry) = entries.iter().find(|e| e.task_id == id) {
            if entry.current_step == 2 && entry.status == WatchdogStatus::Completed {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("watchdog entry never reflected step completion");
}

#[tokio::test]
async fn progress_reports_fire_on_cadence_without_affecting_flow() {
    let mut cfg = test_config();
    cfg.report_every = 1;
    let (engine, _, notifier, _) = build_engine(
        vec![
            ScriptStep::text(r#"["Step one"]"#),
            ScriptStep::call("echo", "{}"),
            ScriptStep::text("finished"),
        ],
        vec![Arc::new(StaticTool::ok("echo", "hi"))],
        cfg,
    );

    let id = engine.spawn(TaskSpec::new("observable")).await.unwrap();
    let snap = wait_terminal(&engine, &id).await;
    assert_eq!(snap.status, TaskStatus::Completed);

    let sent = notifier.sent().await;
    let progress: Vec<_> = sent.iter().filter(|(_, t)| t.contains("progress")).collect();
    // Turn 1 ended in tool calls and reported; turn 2 ended the task.
    assert_eq!(progress.len(), 1);
    assert!(progress[0].1.contains("echo"));
}

#[tokio::test]
async fn abort_all_signals_every_live_task() {
    let (engine, _, _, _) = build_engine(
        vec![
            ScriptStep::text(r#"["Ask"]"#),
            ScriptStep::call("ask_clarification", r#"{"question": "a?"}"#),
            ScriptStep::text(r#"["Ask"]"#),
            ScriptStep::call("ask_clarification", r#"{"question": "b?"}"#),
        ],
        vec![],
        test_config(),
    );

    let mut spec_a = TaskSpec::new("first");
    spec_a.can_clarify = true;
    let a = engine.spawn(spec_a).await.unwrap();
    wait_status(&engine, &a, TaskStatus::WaitingClarification).await;

    let mut spec_b = TaskSpec::new("second");
    spec_b.can_clarify = true;
    let b = engine.spawn(spec_b).await.unwrap();
    wait_status(&engine, &b, TaskStatus::WaitingClarification).await;

    assert_eq!(engine.abort_all().await, 2);
    assert_eq!(wait_terminal(&engine, &a).await.status, TaskStatus::Aborted);
    assert_eq!(wait_terminal(&engine, &b).await.status, TaskStatus::Aborted);
}

// ==================== Watchdog supervision scenarios ====================

fn stalled_entry(task_id: &str, idle_secs: i64, current_step: usize, respawn_count: u32, plan: &[&str]) -> WatchdogEntry {
    WatchdogEntry {
        task_id: task_id.to_string(),
        plan: plan.iter().map(|s| s.to_string()).collect(),
        current_step,
        last_activity: Utc::now() - chrono::Duration::seconds(idle_secs),
        respawn_count,
        status: WatchdogStatus::Running,
        completed_at: None,
        origin: "caller".to_string(),
    }
}

#[tokio::test]
async fn watchdog_respawns_stalled_task_with_remaining_steps() {
    let (engine, _, notifier, _) = build_engine(vec![], vec![], test_config());

    // A task that registered a 3-step plan, finished step 1, then went quiet
    // for 6 minutes. Its loop is not actually running.
    let mut task = Task::new(TaskSpec::new("original goal"), 20, 600_000);
    task.transition(TaskStatus::Running);
    task.plan = vec!["First".to_string(), "Second".to_string(), "Third".to_string()];
    let stalled_id = task.id.clone();
    engine.insert_task_for_test(task).await;

    let watchdog = engine.watchdog_handle();
    watchdog
        .inject_entry(stalled_entry(&stalled_id, 360, 1, 0, &["First", "Second", "Third"]))
        .await;

    watchdog.sweep(&Arc::downgrade(&engine)).await;

    // Exactly one new task exists alongside the stalled one.
    assert_eq!(engine.task_count().await, 2);
    let new_id = engine
        .task_ids()
        .await
        .into_iter()
        .find(|id| id != &stalled_id)
        .expect("continuation task spawned");

    // The old entry is a terminal mirror now.
    let old_entry = watchdog.entry(&stalled_id).await.unwrap();
    assert!(old_entry.status.is_terminal());

    let snap = wait_terminal(&engine, &new_id).await;
    assert_eq!(snap.goal, "original goal");

    // The continuation's context embeds both remaining step descriptions.
    let transcript = engine.transcript(&new_id).await;
    let system = transcript.first().unwrap().content.clone().unwrap();
    assert!(system.contains("Resuming from step 2"));
    assert!(system.contains("Second"));
    assert!(system.contains("Third"));

    // The new entry carries the incremented respawn count.
    for _ in 0..1_000 {
        if let Some(entry) = watchdog.entry(&new_id).await {
            assert_eq!(entry.respawn_count, 1);
            let sent = notifier.sent().await;
            assert!(sent.iter().any(|(_, t)| t.contains("respawned")));
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("continuation task never registered with the watchdog");
}

#[tokio::test]
async fn watchdog_respawn_budget_terminates_lineage() {
    let (engine, _, notifier, _) = build_engine(vec![], vec![], test_config());

    let mut task = Task::new(TaskSpec::new("stubborn goal"), 20, 600_000);
    task.transition(TaskStatus::Running);
    task.plan = vec!["Only step".to_string()];
    let stalled_id = task.id.clone();
    engine.insert_task_for_test(task).await;

    let watchdog = engine.watchdog_handle();
    watchdog
        .inject_entry(stalled_entry(&stalled_id, 360, 0, 3, &["Only step"]))
        .await;

    watchdog.sweep(&Arc::downgrade(&engine)).await;

    // The fourth stall must not spawn again.
    assert_eq!(engine.task_count().await, 1);
    let entry = watchdog.entry(&stalled_id).await.unwrap();
    assert_eq!(entry.status, WatchdogStatus::Failed);

    let sent = notifier.sent().await;
    assert!(sent.iter().any(|(_, t)| t.contains("respawn budget exhausted")));
}

#[tokio::test]
async fn watchdog_without_remaining_steps_fails_instead_of_respawning() {
    let (engine, _, notifier, _) = build_engine(vec![], vec![], test_config());

    let mut task = Task::new(TaskSpec::new("finished plan"), 20, 600_000);
    task.transition(TaskStatus::Running);
    task.plan = vec!["Only step".to_string()];
    let stalled_id = task.id.clone();
    engine.insert_task_for_test(task).await;

    let watchdog = engine.watchdog_handle();
    watchdog
        .inject_entry(stalled_entry(&stalled_id, 360, 1, 0, &["Only step"]))
        .await;

    watchdog.sweep(&Arc::downgrade(&engine)).await;

    assert_eq!(engine.task_count().await, 1);
    let entry = watchdog.entry(&stalled_id).await.unwrap();
    assert_eq!(entry.status, WatchdogStatus::Failed);
    let sent = notifier.sent().await;
    assert!(sent.iter().any(|(_, t)| t.contains("no unconsumed plan steps")));
}

#[tokio::test]
async fn watchdog_reconciles_silently_completed_task() {
    let (engine, _, notifier, _) = build_engine(vec![], vec![], test_config());

    // The task finished between sweeps, but its entry never heard about it.
    let mut task = Task::new(TaskSpec::new("already done"), 20, 600_000);
    task.transition(TaskStatus::Running);
    task.transition(TaskStatus::Completed);
    task.result = Some("done quietly".to_string());
    let id = task.id.clone();
    engine.insert_task_for_test(task).await;

    let watchdog = engine.watchdog_handle();
    watchdog
        .inject_entry(stalled_entry(&id, 360, 0, 0, &["A", "B"]))
        .await;

    watchdog.sweep(&Arc::downgrade(&engine)).await;

    // Reconciled, not respawned.
    assert_eq!(engine.task_count().await, 1);
    let entry = watchdog.entry(&id).await.unwrap();
    assert_eq!(entry.status, WatchdogStatus::Completed);
    assert!(notifier.sent().await.is_empty());
}
