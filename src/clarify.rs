//! Suspend/resume point for clarification questions and plan approval.
//!
//! One pending answer slot exists per task. The waiting loop is woken by an
//! external answer, by the timeout, or by task abort; it never hangs.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct ClarificationGate {
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl ClarificationGate {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Park the caller until an answer arrives, the timeout elapses, or the
    /// task is aborted. Returns `None` for the latter two; the loop decides
    /// what a missing answer means (best-judgment placeholder, or approval).
    pub async fn wait(
        &self,
        task_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            // A replaced slot drops the old sender; its waiter sees a closed
            // channel. The loop is sequential so this only happens if a task
            // somehow re-enters the gate, which resolves the stale wait.
            pending.insert(task_id.to_string(), tx);
        }

        let answer = tokio::select! {
            res = rx => res.ok(),
            _ = tokio::time::sleep(timeout) => {
                debug!(task_id, "Clarification timed out");
                None
            }
            _ = cancel.cancelled() => {
                debug!(task_id, "Clarification interrupted by abort");
                None
            }
        };

        self.pending.lock().await.remove(task_id);
        answer
    }

    /// Resolve a pending wait by task id. Returns false when nothing is
    /// pending (wrong id, or the slot already timed out).
    pub async fn resolve(&self, task_id: &str, answer: &str) -> bool {
        let tx = self.pending.lock().await.remove(task_id);
        match tx {
            Some(tx) => tx.send(answer.to_string()).is_ok(),
            None => false,
        }
    }

    /// Whether a task currently has a pending question.
    pub async fn is_pending(&self, task_id: &str) -> bool {
        self.pending.lock().await.contains_key(task_id)
    }

    /// Drop any pending slot without an answer. Used at task teardown when
    /// the waiting future was torn down by the task-level timeout and never
    /// ran its own cleanup.
    pub async fn cancel_pending(&self, task_id: &str) {
        self.pending.lock().await.remove(task_id);
    }
}

impl Default for ClarificationGate {
    fn default() -> Self {
        Self::new()
    }
}
