use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::TaskRecord;

/// A message in a task's transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Present on assistant messages that requested tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
            tool_call_id: None,
            tool_name: None,
            tool_calls: Some(calls),
        }
    }

    pub fn tool_result(call_id: &str, tool_name: &str, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_call_id: Some(call_id.to_string()),
            tool_name: Some(tool_name.to_string()),
            tool_calls: None,
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_call_id: None,
            tool_name: None,
            tool_calls: None,
        }
    }
}

/// A single tool call as returned by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String, // JSON string
}

/// Token usage statistics from an LLM API response.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

/// The LLM's response: content text, tool calls, or both.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

/// Model provider — sends a transcript + tool schemas to an LLM, gets back
/// a response. Failures should be `crate::providers::ProviderError` wrapped
/// in anyhow so the engine can classify transient vs. fatal; anything else
/// is treated as fatal.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> anyhow::Result<ProviderResponse>;
}

/// Tool trait — a named input/output function exposed to the executor model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Returns the function schema as a JSON Value (name, description, parameters).
    fn schema(&self) -> Value;
    /// Execute the tool with the given JSON arguments string, returns result text.
    async fn call(&self, arguments: &str) -> anyhow::Result<String>;
}

/// Fire-and-forget delivery of progress/result text to the originating caller.
/// The engine swallows delivery failures; implementations may retry internally.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, destination: &str, text: &str) -> anyhow::Result<()>;
}

/// Opaque durable persistence for task records. Last-write-wins per task id;
/// `restore_all` must enumerate every stored record at startup.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn persist(&self, record: &TaskRecord) -> anyhow::Result<()>;
    async fn restore_all(&self) -> anyhow::Result<Vec<TaskRecord>>;
    async fn remove(&self, task_id: &str) -> anyhow::Result<()>;
}
