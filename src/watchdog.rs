//! Liveness supervision for running tasks.
//!
//! The watchdog keeps its own bookkeeping view of every spawned task, fed by
//! events from the execution loops over a channel. A periodic sweep detects
//! entries with no activity past the stall threshold, aborts the underlying
//! task, and respawns a continuation seeded with the remaining plan steps,
//! bounded by a respawn budget. The sweep only touches bookkeeping and
//! issues fire-and-forget signals; it never blocks on task work.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::config::WatchdogConfig;
use crate::engine::TaskEngine;

/// Supervision mirror of a task's state. Coarser than `TaskStatus`: the
/// watchdog only cares about liveness and terminal outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogStatus {
    Running,
    Stuck,
    Completed,
    Failed,
}

impl WatchdogStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WatchdogStatus::Completed | WatchdogStatus::Failed)
    }
}

/// Bookkeeping for one supervised task. On respawn the identity changes:
/// the old entry goes terminal and a new entry (new task id) carries the
/// incremented respawn count.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogEntry {
    pub task_id: String,
    pub plan: Vec<String>,
    /// Index of the next unconsumed plan step.
    pub current_step: usize,
    pub last_activity: DateTime<Utc>,
    pub respawn_count: u32,
    pub status: WatchdogStatus,
    pub completed_at: Option<DateTime<Utc>>,
    /// Notification destination, carried through respawns.
    pub origin: String,
}

/// Events pushed by the execution loops (and the engine surface) to the
/// watchdog's intake channel.
#[derive(Debug)]
pub enum WatchdogEvent {
    Registered {
        task_id: String,
        plan: Vec<String>,
        respawn_count: u32,
        origin: String,
    },
    Activity {
        task_id: String,
    },
    StepCompleted {
        task_id: String,
        step: usize,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
    },
}

pub struct Watchdog {
    entries: RwLock<HashMap<String, WatchdogEntry>>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Start the intake/sweep loop. Holds only a `Weak` engine reference so
    /// supervision never keeps the engine alive; the loop exits when the
    /// engine is gone and the event channel closes.
    pub fn start(
        self: Arc<Self>,
        engine: Weak<TaskEngine>,
        mut rx: mpsc::UnboundedReceiver<WatchdogEvent>,
    ) {
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh engine
            // isn't swept before anything has had a chance to run.
            ticker.tick().await;
            loop {
                tokio::select! {
                    ev = rx.recv() => match ev {
                        Some(ev) => self.apply(ev).await,
                        None => break,
                    },
                    _ = ticker.tick() => self.sweep(&engine).await,
                }
            }
        });
    }

    pub(crate) async fn apply(&self, event: WatchdogEvent) {
        let mut entries = self.entries.write().await;
        match event {
            WatchdogEvent::Registered {
                task_id,
                plan,
                respawn_count,
                origin,
            } => {
                entries.insert(
                    task_id.clone(),
                    WatchdogEntry {
                        task_id,
                        plan,
                        current_step: 0,
                        last_activity: Utc::now(),
                        respawn_count,
                        status: WatchdogStatus::Running,
                        completed_at: None,
                        origin,
                    },
                );
            }
            WatchdogEvent::Activity { task_id } => {
                if let Some(entry) = entries.get_mut(&task_id) {
                    entry.last_activity = Utc::now();
                }
            }
            WatchdogEvent::StepCompleted { task_id, step } => {
                if let Some(entry) = entries.get_mut(&task_id) {
                    entry.last_activity = Utc::now();
                    // Monotonic: a late or duplicate report never rewinds.
                    entry.current_step = entry.current_step.max(step + 1).min(entry.plan.len());
                }
            }
            WatchdogEvent::TaskCompleted { task_id } => {
                if let Some(entry) = entries.get_mut(&task_id) {
                    entry.status = WatchdogStatus::Completed;
                    entry.completed_at = Some(Utc::now());
                }
            }
            WatchdogEvent::TaskFailed { task_id } => {
                if let Some(entry) = entries.get_mut(&task_id) {
                    entry.status = WatchdogStatus::Failed;
                    entry.completed_at = Some(Utc::now());
                }
            }
        }
    }

    /// One supervision pass: detect stalls, reconcile or respawn, collect
    /// expired terminal entries.
    pub(crate) async fn sweep(&self, engine: &Weak<TaskEngine>) {
        let now = Utc::now();
        let stall = chrono::Duration::seconds(self.config.stall_after_secs as i64);

        let stuck: Vec<String> = {
            let mut entries = self.entries.write().await;
            let mut stuck = Vec::new();
            for entry in entries.values_mut() {
                if entry.status == WatchdogStatus::Running && now - entry.last_activity > stall {
                    entry.status = WatchdogStatus::Stuck;
                    stuck.push(entry.task_id.clone());
                }
            }
            stuck
        };

        for task_id in stuck {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            self.handle_stuck(&engine, &task_id).await;
        }

        // GC terminal entries past their retention window.
        let gc_cutoff = now - chrono::Duration::seconds(self.config.entry_gc_secs as i64);
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| {
            !(e.status.is_terminal() && e.completed_at.map(|t| t < gc_cutoff).unwrap_or(false))
        });
    }

    async fn handle_stuck(&self, engine: &Arc<TaskEngine>, task_id: &str) {
        // The task may have finished between sweeps without the watchdog's
        // knowledge. Reconcile instead of killing completed work.
        if let Some(snapshot) = engine.get_status(task_id).await {
            if snapshot.status.is_terminal() {
                let mirror = if snapshot.status == crate::task::TaskStatus::Completed {
                    WatchdogStatus::Completed
                } else {
                    WatchdogStatus::Failed
                };
                info!(task_id, status = %snapshot.status, "Reconciling stale entry to terminal task status");
                let mut entries = self.entries.write().await;
                if let Some(entry) = entries.get_mut(task_id) {
                    entry.status = mirror;
                    entry.completed_at = Some(Utc::now());
                }
                return;
            }
        }

        warn!(task_id, "Task stalled, aborting");
        engine.abort(task_id).await;

        let (remaining, from_step, respawn_count, origin) = {
            let entries = self.entries.read().await;
            match entries.get(task_id) {
                Some(e) => (
                    e.plan.get(e.current_step..).unwrap_or(&[]).to_vec(),
                    e.current_step,
                    e.respawn_count,
                    e.origin.clone(),
                ),
                None => return,
            }
        };

        if !remaining.is_empty() && respawn_count < self.config.max_respawns {
            match engine
                .respawn_continuation(task_id, &remaining, from_step, respawn_count + 1)
                .await
            {
                Some(new_id) => {
                    info!(task_id, new_id = %new_id, respawn = respawn_count + 1, "Respawned stalled task");
                    self.finish_entry(task_id, WatchdogStatus::Failed).await;
                    engine
                        .notify_origin(
                            &origin,
                            &format!(
                                "Task {} stalled and was respawned as {} (attempt {}/{}), resuming from step {}.",
                                task_id,
                                new_id,
                                respawn_count + 1,
                                self.config.max_respawns,
                                from_step + 1
                            ),
                        )
                        .await;
                }
                None => {
                    self.finish_entry(task_id, WatchdogStatus::Failed).await;
                    engine
                        .notify_origin(
                            &origin,
                            &format!("Task {} stalled and could not be respawned.", task_id),
                        )
                        .await;
                }
            }
        } else {
            let reason = if remaining.is_empty() {
                "no unconsumed plan steps remain"
            } else {
                "respawn budget exhausted"
            };
            warn!(task_id, reason, "Stalled task terminated");
            self.finish_entry(task_id, WatchdogStatus::Failed).await;
            engine
                .notify_origin(
                    &origin,
                    &format!("Task {} stalled and was terminated: {}.", task_id, reason),
                )
                .await;
        }
    }

    async fn finish_entry(&self, task_id: &str, status: WatchdogStatus) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(task_id) {
            entry.status = status;
            entry.completed_at = Some(Utc::now());
        }
    }

    pub async fn snapshots(&self) -> Vec<WatchdogEntry> {
        let entries = self.entries.read().await;
        let mut rows: Vec<WatchdogEntry> = entries.values().cloned().collect();
        rows.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        rows
    }

    #[cfg(test)]
    pub(crate) async fn inject_entry(&self, entry: WatchdogEntry) {
        self.entries
            .write()
            .await
            .insert(entry.task_id.clone(), entry);
    }

    #[cfg(test)]
    pub(crate) async fn entry(&self, task_id: &str) -> Option<WatchdogEntry> {
        self.entries.read().await.get(task_id).cloned()
    }
}
