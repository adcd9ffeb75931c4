mod routes;

use std::path::Path;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use falcon_agent::{codex::CodexRunner, openai::OpenAiClient};
use falcon_core::{
    agent::{AgentRunner, ChatModel},
    bus::EventBus,
    chat::ChatService,
    config::Config,
    db::Db,
    github::GitHubClient,
    orchestrator::JobOrchestrator,
    wiki::WikiService,
};
use tower_http::cors::CorsLayer;
use tracing::info;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub wikis: WikiService,
    pub chat: ChatService,
    pub model: Arc<dyn ChatModel>,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "falcon_server=info,falcon_core=info,falcon_agent=info,tower_http=warn".into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    std::fs::create_dir_all(&config.wiki_storage_root)?;
    if let Some(parent) = Path::new(&config.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db = Arc::new(Db::open(&config.database_path)?);
    db.migrate()?;

    let bus = Arc::new(EventBus::new());
    let github = Arc::new(GitHubClient::new(config.github_api_token.clone()));
    let runner: Arc<dyn AgentRunner> = Arc::new(CodexRunner::from_config(&config));
    let model: Arc<dyn ChatModel> = Arc::new(OpenAiClient::from_config(&config));

    let orchestrator = Arc::new(JobOrchestrator::new(
        Arc::clone(&db),
        Arc::clone(&config),
        Arc::clone(&bus),
        Arc::clone(&runner),
        Arc::clone(&github),
    ));
    orchestrator.start().await?;

    let wikis = WikiService::new(Arc::clone(&db), Arc::clone(&config));
    let chat = ChatService::new(Arc::clone(&db), wikis.clone(), Arc::clone(&model));

    let state = Arc::new(AppState {
        db,
        config: Arc::clone(&config),
        bus,
        orchestrator: Arc::clone(&orchestrator),
        wikis,
        chat,
        model,
    });

    let app = Router::new()
        // Health
        .route("/health", get(routes::health))
        // Wikis
        .route("/api/wikis", post(routes::create_wiki))
        .route("/api/wikis", get(routes::find_wikis))
        .route("/api/wikis/:id", get(routes::get_wiki))
        .route("/api/wikis/:id", delete(routes::delete_wiki))
        .route("/api/wikis/:id/status", get(routes::get_wiki_status))
        .route("/api/wikis/:id/manifest", get(routes::get_manifest))
        .route("/api/wikis/:id/pages", get(routes::list_pages))
        .route("/api/wikis/:id/pages/*slug", get(routes::get_page))
        .route("/api/wikis/:id/events", get(routes::wiki_events))
        // Wiki chat
        .route("/api/wikis/:id/chat", post(routes::wiki_chat))
        .route("/api/wikis/:id/chat/:conv", get(routes::get_conversation))
        // Ingested repos
        .route("/repos", post(routes::create_repo))
        .route("/repos", get(routes::list_repos))
        .route("/repos/:id", get(routes::get_repo))
        .route("/repos/:id", delete(routes::delete_repo))
        .route("/repos/:id/chat", post(routes::repo_chat))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.bind, config.port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install ctrl-c handler: {e}");
    }
}
