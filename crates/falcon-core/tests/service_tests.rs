use std::sync::Arc;

use async_trait::async_trait;
use falcon_core::agent::{ChatMessage, ChatModel, StreamDelta};
use falcon_core::chat::{ChatEvent, ChatService};
use falcon_core::config::Config;
use falcon_core::db::Db;
use falcon_core::error::FalconError;
use falcon_core::types::WikiStatus;
use falcon_core::wiki::WikiService;
use serde_json::{json, Value};
use tokio::sync::mpsc;

// ── fixtures ──────────────────────────────────────────────────────────────

fn test_config(storage_root: &std::path::Path) -> Arc<Config> {
    Arc::new(Config {
        database_path: ":memory:".into(),
        wiki_storage_root: storage_root.display().to_string(),
        codex_bin: "codex".into(),
        codex_api_key: String::new(),
        codex_timeout_seconds: 300,
        codex_max_concurrent: 3,
        max_concurrent_jobs: 2,
        job_max_attempts: 3,
        job_poll_interval_seconds: 0.05,
        use_remote_sandbox: false,
        sandbox_api_key: String::new(),
        sandbox_api_url: String::new(),
        github_api_token: String::new(),
        openai_api_key: String::new(),
        openai_base_url: String::new(),
        chat_model: "gpt-4o".into(),
        max_file_size: 512 * 1024,
        bind: "127.0.0.1".into(),
        port: 0,
    })
}

fn open_db() -> Arc<Db> {
    let db = Db::open(":memory:").expect("open db");
    db.migrate().expect("migrate");
    Arc::new(db)
}

struct CannedModel {
    answer: String,
}

#[async_trait]
impl ChatModel for CannedModel {
    async fn stream_chat(
        &self,
        _messages: Vec<ChatMessage>,
        _tools: Vec<Value>,
    ) -> Result<mpsc::UnboundedReceiver<StreamDelta>, FalconError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(StreamDelta::Text(self.answer.clone()));
        Ok(rx)
    }

    async fn complete(&self, _messages: Vec<ChatMessage>) -> Result<String, FalconError> {
        Ok(self.answer.clone())
    }
}

// ── wiki service ──────────────────────────────────────────────────────────

#[tokio::test]
async fn create_wiki_enrolls_wiki_and_job() {
    let storage = tempfile::tempdir().expect("tempdir");
    let db = open_db();
    let service = WikiService::new(Arc::clone(&db), test_config(storage.path()));

    let wiki_id = service
        .create_wiki(
            "octocat",
            "Hello-World",
            "https://github.com/octocat/Hello-World",
            "master",
        )
        .expect("create");

    let wiki = db.get_wiki(&wiki_id).expect("get").expect("exists");
    assert_eq!(wiki.status, WikiStatus::Queued);
    assert_eq!(wiki.storage_path, format!("octocat/Hello-World/{wiki_id}"));

    // The paired job is immediately claimable.
    let job = db.claim_next_job("w").expect("claim").expect("job exists");
    assert_eq!(job.wiki_id, wiki_id);
    assert_eq!(job.kind, "wiki_generation");
}

#[tokio::test]
async fn create_wiki_dedupes_non_failed() {
    let storage = tempfile::tempdir().expect("tempdir");
    let db = open_db();
    let service = WikiService::new(Arc::clone(&db), test_config(storage.path()));

    let url = "https://github.com/octocat/Hello-World";
    let first = service
        .create_wiki("octocat", "Hello-World", url, "master")
        .expect("create");
    let second = service
        .create_wiki("octocat", "Hello-World", url, "master")
        .expect("create");
    assert_eq!(first, second);

    // A failed wiki no longer blocks re-creation.
    db.mark_wiki_failed(&first, "boom").expect("fail");
    let third = service
        .create_wiki("octocat", "Hello-World", url, "master")
        .expect("create");
    assert_ne!(first, third);
}

#[tokio::test]
async fn status_reports_progress_only_when_pages_known() {
    let storage = tempfile::tempdir().expect("tempdir");
    let db = open_db();
    let service = WikiService::new(Arc::clone(&db), test_config(storage.path()));

    let wiki_id = service
        .create_wiki("o", "r", "https://github.com/o/r", "main")
        .expect("create");

    let status = service.get_status(&wiki_id).expect("status").expect("some");
    assert!(status.progress.is_none());

    db.update_page_counts(&wiki_id, 4, 1).expect("counts");
    let status = service.get_status(&wiki_id).expect("status").expect("some");
    let progress = status.progress.expect("progress");
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.total, 4);

    assert!(service.get_status("missing").expect("status").is_none());
}

#[tokio::test]
async fn manifest_is_unavailable_until_completed() {
    let storage = tempfile::tempdir().expect("tempdir");
    let db = open_db();
    let config = test_config(storage.path());
    let service = WikiService::new(Arc::clone(&db), Arc::clone(&config));

    let wiki_id = service
        .create_wiki("o", "r", "https://github.com/o/r", "main")
        .expect("create");
    assert!(service.get_manifest(&wiki_id).await.expect("manifest").is_none());

    let wiki = db.get_wiki(&wiki_id).expect("get").expect("exists");
    let dir = storage.path().join(&wiki.storage_path);
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(dir.join("manifest.json"), json!({ "pages": [] }).to_string())
        .expect("write manifest");

    db.update_wiki_status(&wiki_id, WikiStatus::Completed).expect("status");
    let manifest = service
        .get_manifest(&wiki_id)
        .await
        .expect("manifest")
        .expect("present");
    assert!(manifest["pages"].as_array().is_some());
}

#[tokio::test]
async fn delete_wiki_removes_storage_directory() {
    let storage = tempfile::tempdir().expect("tempdir");
    let db = open_db();
    let service = WikiService::new(Arc::clone(&db), test_config(storage.path()));

    let wiki_id = service
        .create_wiki("o", "r", "https://github.com/o/r", "main")
        .expect("create");
    let wiki = db.get_wiki(&wiki_id).expect("get").expect("exists");
    let dir = storage.path().join(&wiki.storage_path);
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(dir.join("manifest.json"), "{}").expect("write");

    assert!(service.delete_wiki(&wiki_id).await.expect("delete"));
    assert!(!dir.exists());
    assert!(!service.delete_wiki(&wiki_id).await.expect("delete again"));
}

// ── chat service ──────────────────────────────────────────────────────────

async fn drain(mut rx: mpsc::UnboundedReceiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn chat_round_trip_persists_transcript() {
    let storage = tempfile::tempdir().expect("tempdir");
    let db = open_db();
    let config = test_config(storage.path());
    let wikis = WikiService::new(Arc::clone(&db), Arc::clone(&config));
    let model = Arc::new(CannedModel {
        answer: "The auth module lives in src/auth.py.".into(),
    });
    let chat = ChatService::new(Arc::clone(&db), wikis.clone(), model);

    let wiki_id = wikis
        .create_wiki("o", "r", "https://github.com/o/r", "main")
        .expect("create");

    // Completed wiki with one stored page referenced by the manifest.
    let wiki = db.get_wiki(&wiki_id).expect("get").expect("exists");
    let dir = storage.path().join(&wiki.storage_path);
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(
        dir.join("manifest.json"),
        json!({
            "pages": [{
                "slug": "auth",
                "title": "Authentication",
                "section": "modules",
                "file_path": "auth.md",
                "summary": "auth module internals",
                "key_exports": [],
                "source_files": ["src/auth.py"]
            }]
        })
        .to_string(),
    )
    .expect("manifest");
    std::fs::write(dir.join("auth.md"), "---\ntitle: Authentication\n---\nAuth docs.")
        .expect("page");
    db.replace_wiki_pages(
        &wiki_id,
        &[falcon_core::types::PageIndexEntry {
            slug: "auth".into(),
            title: "Authentication".into(),
            section: "modules".into(),
            sort_order: 0,
            summary: Some("auth module internals".into()),
            file_path: "auth.md".into(),
        }],
    )
    .expect("pages");
    db.update_wiki_status(&wiki_id, WikiStatus::Completed).expect("status");

    let (tx, rx) = mpsc::unbounded_channel();
    chat.handle_message(&wiki_id, "how does auth work", None, &tx)
        .await;
    drop(tx);

    let events = drain(rx).await;
    assert_eq!(events[0].kind(), "thinking");
    let last = events.last().expect("events");
    assert_eq!(last.kind(), "complete");

    let ChatEvent::Complete {
        response,
        sources,
        conversation_id,
    } = last
    else {
        panic!("expected complete event");
    };
    assert!(response.contains("auth"));
    assert_eq!(sources, &["auth".to_string()]);

    let messages = chat
        .get_conversation(&wiki_id, conversation_id)
        .expect("conversation")
        .expect("exists");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[1].role, "assistant");
    assert_eq!(
        messages[1].context_pages.as_deref(),
        Some(&["auth".to_string()][..])
    );
}

#[tokio::test]
async fn chat_with_unknown_wiki_errors() {
    let storage = tempfile::tempdir().expect("tempdir");
    let db = open_db();
    let config = test_config(storage.path());
    let wikis = WikiService::new(Arc::clone(&db), config);
    let chat = ChatService::new(
        Arc::clone(&db),
        wikis,
        Arc::new(CannedModel { answer: String::new() }),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    chat.handle_message("missing", "hello", None, &tx).await;
    drop(tx);

    let events = drain(rx).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), "error");
}
