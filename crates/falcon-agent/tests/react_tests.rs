use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use falcon_agent::react::{run_agent, AgentLoopEvent, HistoryMessage, MAX_ITERATIONS};
use falcon_core::agent::{ChatMessage, ChatModel, StreamDelta};
use falcon_core::db::Db;
use falcon_core::error::FalconError;
use falcon_core::types::FileRecord;
use serde_json::Value;
use tokio::sync::mpsc;

// ── fixtures ──────────────────────────────────────────────────────────────

fn fixture_db() -> Arc<Db> {
    let db = Db::open(":memory:").expect("open db");
    db.migrate().expect("migrate");
    db.insert_repo("r1", "https://example.com/r1.git", "example/r1")
        .expect("repo");
    db.insert_file_records(
        "r1",
        &[FileRecord {
            path: "README.md".into(),
            name: "README.md".into(),
            extension: Some(".md".into()),
            parent_path: String::new(),
            depth: 1,
            is_directory: false,
            content: Some("hello".into()),
        }],
    )
    .expect("records");
    Arc::new(db)
}

/// A model whose every turn is scripted as a list of deltas.
struct ScriptedModel {
    turns: Vec<Vec<StreamDelta>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn new(turns: Vec<Vec<StreamDelta>>) -> Self {
        Self {
            turns,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream_chat(
        &self,
        _messages: Vec<ChatMessage>,
        _tools: Vec<Value>,
    ) -> Result<mpsc::UnboundedReceiver<StreamDelta>, FalconError> {
        let turn = self.calls.fetch_add(1, Ordering::SeqCst);
        let deltas = self
            .turns
            .get(turn.min(self.turns.len().saturating_sub(1)))
            .cloned()
            .unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        for delta in deltas {
            let _ = tx.send(delta);
        }
        Ok(rx)
    }

    async fn complete(&self, _messages: Vec<ChatMessage>) -> Result<String, FalconError> {
        Ok(String::new())
    }
}

fn tool_call_turn() -> Vec<StreamDelta> {
    vec![
        StreamDelta::ToolCall {
            index: 0,
            id: Some("call_1".into()),
            name: Some("list_files".into()),
            arguments: r#"{"pa"#.into(),
        },
        StreamDelta::ToolCall {
            index: 0,
            id: None,
            name: None,
            arguments: r#"th": ""}"#.into(),
        },
    ]
}

async fn collect(
    model: Arc<dyn ChatModel>,
    history: &[HistoryMessage],
) -> Vec<AgentLoopEvent> {
    let db = fixture_db();
    let (tx, mut rx) = mpsc::unbounded_channel();
    run_agent(db, model, "r1", "what is in this repo?", history, &tx).await;
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

// ── tests ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn text_only_turn_terminates_with_done() {
    let model = Arc::new(ScriptedModel::new(vec![vec![
        StreamDelta::Text("The repo ".into()),
        StreamDelta::Text("has one file.".into()),
    ]]));
    let events = collect(model, &[]).await;

    let kinds: Vec<&str> = events.iter().map(AgentLoopEvent::kind).collect();
    assert_eq!(kinds, vec!["text_delta", "text_delta", "done"]);

    let AgentLoopEvent::TextDelta { content } = &events[0] else {
        panic!("expected text delta");
    };
    assert_eq!(content, "The repo ");
}

#[tokio::test]
async fn tool_call_turn_dispatches_then_continues() {
    let model = Arc::new(ScriptedModel::new(vec![
        tool_call_turn(),
        vec![StreamDelta::Text("Just a README.".into())],
    ]));
    let events = collect(model, &[]).await;

    let kinds: Vec<&str> = events.iter().map(AgentLoopEvent::kind).collect();
    assert_eq!(kinds, vec!["tool_start", "tool_end", "text_delta", "done"]);

    // Fragmented arguments were concatenated and parsed.
    let AgentLoopEvent::ToolStart { name, arguments } = &events[0] else {
        panic!("expected tool_start");
    };
    assert_eq!(name, "list_files");
    assert_eq!(arguments["path"].as_str(), Some(""));
}

#[tokio::test]
async fn malformed_arguments_become_empty_object() {
    let model = Arc::new(ScriptedModel::new(vec![
        vec![StreamDelta::ToolCall {
            index: 0,
            id: Some("call_1".into()),
            name: Some("list_files".into()),
            arguments: "{not json".into(),
        }],
        vec![StreamDelta::Text("done looking".into())],
    ]));
    let events = collect(model, &[]).await;

    let AgentLoopEvent::ToolStart { arguments, .. } = &events[0] else {
        panic!("expected tool_start");
    };
    assert_eq!(arguments, &serde_json::json!({}));
}

#[tokio::test]
async fn tool_calls_dispatch_in_index_order() {
    let model = Arc::new(ScriptedModel::new(vec![
        vec![
            // Arrive out of order; dispatch must follow index order.
            StreamDelta::ToolCall {
                index: 1,
                id: Some("call_b".into()),
                name: Some("read_file".into()),
                arguments: r#"{"path": "README.md"}"#.into(),
            },
            StreamDelta::ToolCall {
                index: 0,
                id: Some("call_a".into()),
                name: Some("list_files".into()),
                arguments: r#"{"path": ""}"#.into(),
            },
        ],
        vec![StreamDelta::Text("ok".into())],
    ]));
    let events = collect(model, &[]).await;

    let tool_starts: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentLoopEvent::ToolStart { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tool_starts, vec!["list_files", "read_file"]);
}

/// A model that always returns a tool call runs exactly MAX_ITERATIONS
/// times, then the loop closes with a final text delta and done.
#[tokio::test]
async fn iteration_cap_emits_closing_delta_then_done() {
    let model = Arc::new(ScriptedModel::new(vec![tool_call_turn()]));
    let events = collect(Arc::clone(&model) as Arc<dyn ChatModel>, &[]).await;

    let tool_starts = events
        .iter()
        .filter(|e| matches!(e, AgentLoopEvent::ToolStart { .. }))
        .count();
    assert_eq!(tool_starts, MAX_ITERATIONS);
    assert_eq!(model.calls.load(Ordering::SeqCst), MAX_ITERATIONS);

    let tail: Vec<&str> = events
        .iter()
        .rev()
        .take(2)
        .map(AgentLoopEvent::kind)
        .collect();
    assert_eq!(tail, vec!["done", "text_delta"]);

    let AgentLoopEvent::TextDelta { content } = &events[events.len() - 2] else {
        panic!("expected closing text delta");
    };
    assert!(content.contains("maximum exploration depth"));
}

#[tokio::test]
async fn model_error_surfaces_as_error_event() {
    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        async fn stream_chat(
            &self,
            _messages: Vec<ChatMessage>,
            _tools: Vec<Value>,
        ) -> Result<mpsc::UnboundedReceiver<StreamDelta>, FalconError> {
            Err(FalconError::Agent("model unavailable".into()))
        }

        async fn complete(&self, _messages: Vec<ChatMessage>) -> Result<String, FalconError> {
            Err(FalconError::Agent("model unavailable".into()))
        }
    }

    let events = collect(Arc::new(FailingModel), &[]).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), "error");
}

#[tokio::test]
async fn history_is_threaded_into_the_transcript() {
    // Scripted model ignores messages, so this just exercises the path.
    let history = vec![
        HistoryMessage {
            role: "user".into(),
            content: "earlier question".into(),
        },
        HistoryMessage {
            role: "assistant".into(),
            content: "earlier answer".into(),
        },
    ];
    let model = Arc::new(ScriptedModel::new(vec![vec![StreamDelta::Text("hi".into())]]));
    let events = collect(model, &history).await;
    assert_eq!(events.last().map(AgentLoopEvent::kind), Some("done"));
}
