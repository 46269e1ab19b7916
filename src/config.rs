use serde::Deserialize;
use std::time::Duration;

/// Engine-wide tunables. Hosts embed this in their own config file;
/// every field has a default so `EngineConfig::default()` is a working setup.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Default turn budget for tasks that don't specify one.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Default wall-clock budget (ms) for tasks that don't specify one.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Backoff delays (seconds) between retries of transient provider errors.
    /// The length of this list is the retry budget.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,
    /// How long a pending clarification waits before self-resolving (seconds).
    #[serde(default = "default_clarification_timeout")]
    pub clarification_timeout_secs: u64,
    /// Poll interval while waiting on a dependency task (milliseconds).
    #[serde(default = "default_dependency_poll_ms")]
    pub dependency_poll_ms: u64,
    /// Emit a progress notification every N turns. 0 disables.
    #[serde(default = "default_report_every")]
    pub report_every: u32,
    /// Tool output larger than this is truncated before entering the transcript.
    #[serde(default = "default_max_tool_output")]
    pub max_tool_output: usize,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            timeout_ms: default_timeout_ms(),
            retry_delays_secs: default_retry_delays(),
            clarification_timeout_secs: default_clarification_timeout(),
            dependency_poll_ms: default_dependency_poll_ms(),
            report_every: default_report_every(),
            max_tool_output: default_max_tool_output(),
            watchdog: WatchdogConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn clarification_timeout(&self) -> Duration {
        Duration::from_secs(self.clarification_timeout_secs)
    }

    pub fn dependency_poll(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogConfig {
    /// Sweep interval (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// A running task with no activity for this long is considered stuck (seconds).
    #[serde(default = "default_stall_after")]
    pub stall_after_secs: u64,
    /// Respawn budget per task lineage.
    #[serde(default = "default_max_respawns")]
    pub max_respawns: u32,
    /// Terminal entries are garbage-collected this long after completion (seconds).
    #[serde(default = "default_entry_gc")]
    pub entry_gc_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            stall_after_secs: default_stall_after(),
            max_respawns: default_max_respawns(),
            entry_gc_secs: default_entry_gc(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    /// Max persisted context length (chars).
    #[serde(default = "default_max_context")]
    pub max_context: usize,
    /// Max persisted result/error length (chars).
    #[serde(default = "default_max_result")]
    pub max_result: usize,
    /// How many trailing transcript messages to persist.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Per-message content cap when persisting (chars).
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_context: default_max_context(),
            max_result: default_max_result(),
            max_messages: default_max_messages(),
            max_message_len: default_max_message_len(),
        }
    }
}

fn default_max_turns() -> u32 {
    20
}

fn default_timeout_ms() -> u64 {
    600_000
}

fn default_retry_delays() -> Vec<u64> {
    vec![10, 20, 30]
}

fn default_clarification_timeout() -> u64 {
    300
}

fn default_dependency_poll_ms() -> u64 {
    2_000
}

fn default_report_every() -> u32 {
    5
}

fn default_max_tool_output() -> usize {
    10_000
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_stall_after() -> u64 {
    300
}

fn default_max_respawns() -> u32 {
    3
}

fn default_entry_gc() -> u64 {
    1_800
}

fn default_max_context() -> usize {
    2_000
}

fn default_max_result() -> usize {
    4_000
}

fn default_max_messages() -> usize {
    20
}

fn default_max_message_len() -> usize {
    2_000
}
