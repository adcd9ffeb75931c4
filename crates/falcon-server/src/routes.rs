use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use falcon_core::{
    error::FalconError,
    ingest::ingest_repo,
    types::Wiki,
};
use falcon_agent::react::{self, HistoryMessage};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::AppState;

// ── Error helpers ─────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn not_found(detail: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": detail })))
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct CreateWikiBody {
    pub github_url: String,
    pub branch: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct WikiQuery {
    pub owner: Option<String>,
    pub repo: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct WikiChatBody {
    pub message: String,
    pub conversation_id: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct IngestBody {
    pub url: String,
}

#[derive(Deserialize)]
pub(crate) struct RepoChatBody {
    pub question: String,
    pub history: Option<Vec<HistoryMessage>>,
}

// ── Shared helpers ────────────────────────────────────────────────────────

/// Extract `(owner, repo)` from a GitHub URL.
fn parse_github_url(url: &str) -> Option<(String, String)> {
    let re = regex::Regex::new(r"^https?://github\.com/([^/]+)/([^/]+?)(?:\.git)?/?$").ok()?;
    let caps = re.captures(url)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

fn wiki_json(wiki: &Wiki) -> Value {
    json!({
        "wiki_id": wiki.id,
        "owner": wiki.owner,
        "repo": wiki.repo,
        "github_url": wiki.github_url,
        "branch": wiki.branch,
        "commit_sha": wiki.commit_sha,
        "status": wiki.status,
        "total_pages": wiki.total_pages,
        "completed_pages": wiki.completed_pages,
        "error_message": wiki.error_message,
        "created_at": wiki.created_at,
        "started_at": wiki.started_at,
        "completed_at": wiki.completed_at,
    })
}

fn sse_from_receiver(
    rx: mpsc::UnboundedReceiver<Event>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn sse_event(kind: &str, data: Value) -> Event {
    Event::default().event(kind).data(data.to_string())
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_jobs": state.orchestrator.active_jobs().await,
    }))
}

// ── Wikis ─────────────────────────────────────────────────────────────────

pub(crate) async fn create_wiki(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateWikiBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some((owner, repo)) = parse_github_url(&body.github_url) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "Invalid GitHub URL" })),
        ));
    };
    let branch = body.branch.unwrap_or_else(|| "main".to_string());

    let wiki_id = state
        .wikis
        .create_wiki(&owner, &repo, &body.github_url, &branch)
        .map_err(|e| (internal(e), Json(json!({ "detail": "internal error" }))))?;

    Ok(Json(json!({ "wiki_id": wiki_id, "status": "queued" })))
}

pub(crate) async fn find_wikis(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WikiQuery>,
) -> Result<Json<Value>, StatusCode> {
    let wikis = state
        .wikis
        .find_wikis(q.owner.as_deref(), q.repo.as_deref())
        .map_err(internal)?;
    Ok(Json(json!(wikis.iter().map(wiki_json).collect::<Vec<_>>())))
}

pub(crate) async fn get_wiki(
    State(state): State<Arc<AppState>>,
    Path(wiki_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.wikis.get_wiki(&wiki_id) {
        Ok(Some(wiki)) => Ok(Json(wiki_json(&wiki))),
        Ok(None) => Err(not_found("Wiki not found")),
        Err(e) => Err((internal(e), Json(json!({ "detail": "internal error" })))),
    }
}

pub(crate) async fn get_wiki_status(
    State(state): State<Arc<AppState>>,
    Path(wiki_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.wikis.get_status(&wiki_id) {
        Ok(Some(status)) => Ok(Json(json!(status))),
        Ok(None) => Err(not_found("Wiki not found")),
        Err(e) => Err((internal(e), Json(json!({ "detail": "internal error" })))),
    }
}

pub(crate) async fn get_manifest(
    State(state): State<Arc<AppState>>,
    Path(wiki_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.wikis.get_manifest(&wiki_id).await {
        Ok(Some(manifest)) => Ok(Json(manifest)),
        Ok(None) => Err(not_found("Manifest not found")),
        Err(e) => Err((internal(e), Json(json!({ "detail": "internal error" })))),
    }
}

pub(crate) async fn list_pages(
    State(state): State<Arc<AppState>>,
    Path(wiki_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let pages = state.wikis.list_pages(&wiki_id).map_err(internal)?;
    Ok(Json(json!(pages)))
}

pub(crate) async fn get_page(
    State(state): State<Arc<AppState>>,
    Path((wiki_id, slug)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.wikis.get_page(&wiki_id, &slug).await {
        Ok(Some(page)) => Ok(Json(json!(page))),
        Ok(None) => Err(not_found("Page not found")),
        Err(e) => Err((internal(e), Json(json!({ "detail": "internal error" })))),
    }
}

pub(crate) async fn delete_wiki(
    State(state): State<Arc<AppState>>,
    Path(wiki_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    state.wikis.delete_wiki(&wiki_id).await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Wiki SSE: generation events ───────────────────────────────────────────

pub(crate) async fn wiki_events(
    State(state): State<Arc<AppState>>,
    Path(wiki_id): Path<String>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let (sub_id, mut sub_rx) = state.bus.subscribe(&wiki_id);
    let (tx, rx) = mpsc::unbounded_channel::<Event>();

    let bus = Arc::clone(&state.bus);
    tokio::spawn(async move {
        while let Some(event) = sub_rx.recv().await {
            let frame = sse_event(event.kind(), event.data());
            if tx.send(frame).is_err() {
                break;
            }
            if event.is_terminal() {
                break;
            }
        }
        bus.unsubscribe(&wiki_id, sub_id);
    });

    sse_from_receiver(rx)
}

// ── Wiki chat ─────────────────────────────────────────────────────────────

pub(crate) async fn wiki_chat(
    State(state): State<Arc<AppState>>,
    Path(wiki_id): Path<String>,
    Json(body): Json<WikiChatBody>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (tx, rx) = mpsc::unbounded_channel::<Event>();

    let chat = state.chat.clone();
    tokio::spawn(async move {
        chat.handle_message(&wiki_id, &body.message, body.conversation_id, &event_tx)
            .await;
    });
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let terminal = event.is_terminal();
            if tx.send(sse_event(event.kind(), event.data())).is_err() {
                break;
            }
            if terminal {
                break;
            }
        }
    });

    sse_from_receiver(rx)
}

pub(crate) async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path((wiki_id, conversation_id)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.chat.get_conversation(&wiki_id, &conversation_id) {
        Ok(Some(messages)) => Ok(Json(json!(messages))),
        Ok(None) => Err(not_found("Conversation not found")),
        Err(e) => Err((internal(e), Json(json!({ "detail": "internal error" })))),
    }
}

// ── Ingested repos ────────────────────────────────────────────────────────

pub(crate) async fn create_repo(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestBody>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    match ingest_repo(&state.db, &state.config, &body.url).await {
        Ok(outcome) => Ok((StatusCode::CREATED, Json(json!(outcome)))),
        Err(FalconError::Acquisition(msg)) => {
            Err((StatusCode::BAD_REQUEST, Json(json!({ "detail": msg }))))
        }
        Err(e) => Err((internal(e), Json(json!({ "detail": "internal error" })))),
    }
}

pub(crate) async fn list_repos(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let repos = state.db.list_repos().map_err(internal)?;
    let arr: Vec<Value> = repos
        .iter()
        .map(|r| {
            json!({
                "repo_id": r.id,
                "name": r.name,
                "url": r.url,
                "status": r.status,
                "ingested_at": r.ingested_at,
            })
        })
        .collect();
    Ok(Json(json!(arr)))
}

pub(crate) async fn get_repo(
    State(state): State<Arc<AppState>>,
    Path(repo_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let repo = state
        .db
        .get_repo(&repo_id)
        .map_err(|e| (internal(e), Json(json!({ "detail": "internal error" }))))?;
    let Some(repo) = repo else {
        return Err(not_found("Repo not found"));
    };
    let file_count = state
        .db
        .count_repo_files(&repo_id)
        .map_err(|e| (internal(e), Json(json!({ "detail": "internal error" }))))?;
    Ok(Json(json!({
        "repo_id": repo.id,
        "name": repo.name,
        "url": repo.url,
        "status": repo.status,
        "ingested_at": repo.ingested_at,
        "file_count": file_count,
    })))
}

pub(crate) async fn delete_repo(
    State(state): State<Arc<AppState>>,
    Path(repo_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    let deleted = state
        .db
        .delete_repo(&repo_id)
        .map_err(|e| (internal(e), Json(json!({ "detail": "internal error" }))))?;
    if !deleted {
        return Err(not_found("Repo not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Repo chat (ReAct agent) ───────────────────────────────────────────────

pub(crate) async fn repo_chat(
    State(state): State<Arc<AppState>>,
    Path(repo_id): Path<String>,
    Json(body): Json<RepoChatBody>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>,
    (StatusCode, Json<Value>),
> {
    let repo = state
        .db
        .get_repo(&repo_id)
        .map_err(|e| (internal(e), Json(json!({ "detail": "internal error" }))))?;
    let Some(repo) = repo else {
        return Err(not_found("Repo not found"));
    };
    if repo.status != "ready" {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({
                "detail": format!(
                    "Repo is not ready (status: {}). Wait for ingestion to complete.",
                    repo.status
                ),
            })),
        ));
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (tx, rx) = mpsc::unbounded_channel::<Event>();

    let db = Arc::clone(&state.db);
    let model = Arc::clone(&state.model);
    let history = body.history.unwrap_or_default();
    tokio::spawn(async move {
        react::run_agent(db, model, &repo_id, &body.question, &history, &event_tx).await;
    });
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let terminal = event.is_terminal();
            if tx.send(sse_event(event.kind(), event.data())).is_err() {
                break;
            }
            if terminal {
                break;
            }
        }
    });

    Ok(sse_from_receiver(rx))
}
