use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::FalconError;
use crate::types::AgentRun;

/// External code-generation agent, invoked once per pipeline step with a
/// working directory and a prompt. Implementations never share state
/// across invocations.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        working_dir: &Path,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AgentRun, FalconError>;
}

// ── Chat model wire types ────────────────────────────────────────────────

/// One message of an OpenAI-style chat transcript.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
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

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant turn carrying tool calls and no text.
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCallRef>) -> Self {
        Self {
            role: "assistant".into(),
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Tool result keyed to the originating call id.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRef {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionRef,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionRef {
    pub name: String,
    /// Raw JSON argument string, exactly as accumulated from the stream.
    pub arguments: String,
}

/// One fragment of a streamed model response.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A text fragment of the final answer.
    Text(String),
    /// A tool-call fragment; fragments with the same index concatenate.
    ToolCall {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// Mid-stream failure; the consumer terminates with an error event.
    Error(String),
}

/// Streaming LLM provider boundary. The ReAct loop consumes `stream_chat`;
/// the wiki Q&A path uses the non-streaming `complete`.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<Value>,
    ) -> Result<mpsc::UnboundedReceiver<StreamDelta>, FalconError>;

    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, FalconError>;
}
