//! OpenAI-compatible Chat Completions client.
//!
//! `stream_chat` consumes the SSE response body and forwards text and
//! tool-call fragments as they arrive; `complete` is the plain
//! request/response path used for wiki Q&A.

use async_trait::async_trait;
use falcon_core::agent::{ChatMessage, ChatModel, StreamDelta};
use falcon_core::config::Config;
use falcon_core::error::FalconError;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_key: config.openai_api_key.clone(),
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            model: config.chat_model.clone(),
            client: reqwest::Client::new(),
        }
    }

    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post_chat(&self, body: Value) -> Result<reqwest::Response, FalconError> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FalconError::Agent(format!("chat request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FalconError::Agent(format!(
                "chat model returned {status}: {body}"
            )));
        }
        Ok(resp)
    }
}

// ── Streamed chunk DTOs ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    index: u32,
    id: Option<String>,
    function: Option<DeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct DeltaFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Pop complete SSE frames (separated by a blank line) off the front of the
/// buffer, leaving any incomplete trailing bytes for the next network chunk.
fn drain_frames(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
        let frame: Vec<u8> = buffer.drain(..pos + 2).collect();
        frames.push(String::from_utf8_lossy(&frame[..pos]).into_owned());
    }
    frames
}

fn forward_chunk(chunk: &ChatChunk, tx: &mpsc::UnboundedSender<StreamDelta>) {
    for choice in &chunk.choices {
        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                let _ = tx.send(StreamDelta::Text(content.clone()));
            }
        }
        for tc in choice.delta.tool_calls.iter().flatten() {
            let (name, arguments) = match &tc.function {
                Some(f) => (f.name.clone(), f.arguments.clone().unwrap_or_default()),
                None => (None, String::new()),
            };
            let _ = tx.send(StreamDelta::ToolCall {
                index: tc.index,
                id: tc.id.clone(),
                name,
                arguments,
            });
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<Value>,
    ) -> Result<mpsc::UnboundedReceiver<StreamDelta>, FalconError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }

        let resp = self.post_chat(body).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            // Raw bytes: a multibyte UTF-8 sequence may span network chunks,
            // so only complete frames are ever decoded.
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(StreamDelta::Error(format!("stream read failed: {e}")));
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);

                for frame in drain_frames(&mut buffer) {
                    for line in frame.lines() {
                        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
                            continue;
                        };
                        if data == "[DONE]" {
                            return;
                        }
                        match serde_json::from_str::<ChatChunk>(data) {
                            Ok(chunk) => forward_chunk(&chunk, &tx),
                            Err(e) => debug!("skipping unparseable stream chunk: {e}"),
                        }
                    }
                }
            }
            // Stream ended without [DONE]; receiver sees channel close.
            warn!("chat stream ended without DONE sentinel");
        });

        Ok(rx)
    }

    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, FalconError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
        });
        let resp = self.post_chat(body).await?;
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| FalconError::Agent(format!("bad chat response: {e}")))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}
