//! The ReAct loop behind "chat with repo".
//!
//! Streams model output while accumulating tool-call fragments; when a turn
//! ends with tool calls they are dispatched in index order against the
//! ingested store and their results appended to the transcript, then the
//! loop continues. A turn with only text terminates the loop. Iteration is
//! bounded; hitting the cap emits a closing text delta and `done`.

use std::collections::BTreeMap;
use std::sync::Arc;

use falcon_core::agent::{ChatMessage, ChatModel, FunctionRef, StreamDelta, ToolCallRef};
use falcon_core::db::Db;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::shell;

pub const MAX_ITERATIONS: usize = 15;

const ITERATION_CAP_MESSAGE: &str = "\n\n---\nI've reached the maximum exploration depth. \
Here's my best answer based on what I've found so far.";

/// One event of the agent's lazily produced stream.
#[derive(Debug, Clone)]
pub enum AgentLoopEvent {
    TextDelta { content: String },
    ToolStart { name: String, arguments: Value },
    ToolEnd { name: String },
    Done,
    Error { content: String },
}

impl AgentLoopEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Done => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            Self::TextDelta { content } => json!({ "content": content }),
            Self::ToolStart { name, arguments } => {
                json!({ "name": name, "arguments": arguments })
            }
            Self::ToolEnd { name } => json!({ "name": name }),
            Self::Done => json!({}),
            Self::Error { content } => json!({ "content": content }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// Prior conversation turn supplied by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

#[derive(Default)]
struct ToolCallAcc {
    id: String,
    name: String,
    arguments: String,
}

/// Run the agent loop, pushing events to `tx` as they occur. The event
/// stream always ends with `done` or `error`.
pub async fn run_agent(
    db: Arc<Db>,
    model: Arc<dyn ChatModel>,
    repo_id: &str,
    question: &str,
    history: &[HistoryMessage],
    tx: &UnboundedSender<AgentLoopEvent>,
) {
    let mut messages = vec![ChatMessage::system(shell::SYSTEM_PROMPT)];
    for h in history {
        match h.role.as_str() {
            "user" => messages.push(ChatMessage::user(h.content.clone())),
            "assistant" => messages.push(ChatMessage::assistant(h.content.clone())),
            _ => {}
        }
    }
    messages.push(ChatMessage::user(question));

    for iteration in 0..MAX_ITERATIONS {
        let mut stream = match model.stream_chat(messages.clone(), shell::tool_schemas()).await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = tx.send(AgentLoopEvent::Error {
                    content: e.to_string(),
                });
                return;
            }
        };

        // index → accumulated call; fragments concatenate per index.
        let mut tool_calls: BTreeMap<u32, ToolCallAcc> = BTreeMap::new();

        while let Some(delta) = stream.recv().await {
            match delta {
                StreamDelta::Text(content) => {
                    let _ = tx.send(AgentLoopEvent::TextDelta { content });
                }
                StreamDelta::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let acc = tool_calls.entry(index).or_default();
                    if let Some(id) = id {
                        acc.id = id;
                    }
                    if let Some(name) = name {
                        acc.name = name;
                    }
                    acc.arguments.push_str(&arguments);
                }
                StreamDelta::Error(e) => {
                    let _ = tx.send(AgentLoopEvent::Error { content: e });
                    return;
                }
            }
        }

        if tool_calls.is_empty() {
            let _ = tx.send(AgentLoopEvent::Done);
            return;
        }

        info!(iteration, tool_calls = tool_calls.len(), "dispatching tool calls");

        let refs: Vec<ToolCallRef> = tool_calls
            .values()
            .map(|acc| ToolCallRef {
                id: acc.id.clone(),
                call_type: "function".into(),
                function: FunctionRef {
                    name: acc.name.clone(),
                    arguments: acc.arguments.clone(),
                },
            })
            .collect();
        messages.push(ChatMessage::assistant_tool_calls(refs));

        // BTreeMap iteration follows tool-call index order.
        for acc in tool_calls.values() {
            let arguments: Value =
                serde_json::from_str(&acc.arguments).unwrap_or_else(|_| json!({}));

            let _ = tx.send(AgentLoopEvent::ToolStart {
                name: acc.name.clone(),
                arguments: arguments.clone(),
            });
            let result = shell::execute_tool(&db, repo_id, &acc.name, &arguments);
            let _ = tx.send(AgentLoopEvent::ToolEnd {
                name: acc.name.clone(),
            });

            messages.push(ChatMessage::tool(acc.id.clone(), result));
        }
    }

    let _ = tx.send(AgentLoopEvent::TextDelta {
        content: ITERATION_CAP_MESSAGE.into(),
    });
    let _ = tx.send(AgentLoopEvent::Done);
}
