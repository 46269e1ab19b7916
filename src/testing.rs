//! Test doubles shared by unit and integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::providers::ProviderError;
use crate::traits::{
    ChatMessage, ModelProvider, Notifier, ProviderResponse, TokenUsage, Tool, ToolCall,
};

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Plain text, no tool calls.
    Text(String),
    /// A single tool-call request.
    CallTool { name: String, arguments: String },
    /// A retryable 503.
    TransientError,
    /// A non-retryable 401.
    FatalError(String),
}

impl ScriptStep {
    pub fn text(s: &str) -> Self {
        ScriptStep::Text(s.to_string())
    }

    pub fn call(name: &str, arguments: &str) -> Self {
        ScriptStep::CallTool {
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }
}

/// Pops pre-programmed responses in order; repeats the last one when the
/// script runs out.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptStep>>,
    fallback: Mutex<Option<ScriptStep>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            fallback: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn chat(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _tools: &[Value],
    ) -> anyhow::Result<ProviderResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = self.script.lock().await;
            match script.pop_front() {
                Some(step) => {
                    *self.fallback.lock().await = Some(step.clone());
                    step
                }
                None => self
                    .fallback
                    .lock()
                    .await
                    .clone()
                    .unwrap_or_else(|| ScriptStep::text("done")),
            }
        };

        match step {
            ScriptStep::Text(text) => Ok(ProviderResponse {
                content: Some(text),
                tool_calls: vec![],
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                }),
            }),
            ScriptStep::CallTool { name, arguments } => Ok(ProviderResponse {
                content: None,
                tool_calls: vec![ToolCall {
                    id: format!("call_{n}"),
                    name,
                    arguments,
                }],
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                }),
            }),
            ScriptStep::TransientError => {
                Err(ProviderError::from_status(503, "overloaded").into())
            }
            ScriptStep::FatalError(msg) => Err(ProviderError::from_status(401, &msg).into()),
        }
    }
}

/// Records every notification instead of delivering it.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, destination: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .await
            .push((destination.to_string(), text.to_string()));
        Ok(())
    }
}

/// A tool with a fixed name that either echoes a canned output or fails.
pub struct StaticTool {
    name: String,
    output: Result<String, String>,
}

impl StaticTool {
    pub fn ok(name: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            output: Ok(output.to_string()),
        }
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            output: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> Value {
        json!({
            "name": self.name,
            "description": "test tool",
            "parameters": {"type": "object", "properties": {}}
        })
    }

    async fn call(&self, _arguments: &str) -> anyhow::Result<String> {
        match &self.output {
            Ok(out) => Ok(out.clone()),
            Err(msg) => anyhow::bail!("{}", msg),
        }
    }
}
