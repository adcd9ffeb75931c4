use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ── Status enums ─────────────────────────────────────────────────────────

/// Wiki generation lifecycle. Transitions run strictly
/// queued → cloning → analyzing → generating → indexing → completed,
/// with any state allowed to fall into `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WikiStatus {
    Queued,
    Cloning,
    Analyzing,
    Generating,
    Indexing,
    Completed,
    Failed,
}

impl WikiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Cloning => "cloning",
            Self::Analyzing => "analyzing",
            Self::Generating => "generating",
            Self::Indexing => "indexing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "cloning" => Some(Self::Cloning),
            "analyzing" => Some(Self::Analyzing),
            "generating" => Some(Self::Generating),
            "indexing" => Some(Self::Indexing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

// ── Wiki ─────────────────────────────────────────────────────────────────

/// A wiki row as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wiki {
    pub id: String,
    pub owner: String,
    pub repo: String,
    pub github_url: String,
    pub branch: String,
    /// Commit fingerprint of the generated snapshot; null until Phase 1 completes.
    pub commit_sha: Option<String>,
    pub status: WikiStatus,
    pub total_pages: i64,
    pub completed_pages: i64,
    /// Relative path under the wiki storage root. Set at creation, never reused.
    pub storage_path: String,
    /// Opaque analysis plan JSON produced by Phase 2.
    pub analysis_plan: Option<String>,
    pub repo_languages: Option<String>,
    pub repo_description: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Job ──────────────────────────────────────────────────────────────────

/// A durable work-queue entry. Only `wiki_generation` jobs exist today.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub wiki_id: String,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub priority: i64,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Conversations ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub context_pages: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

// ── Wiki pages ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PageSummary {
    pub slug: String,
    pub title: String,
    pub section: String,
    pub order: i64,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageDetail {
    pub slug: String,
    pub title: String,
    pub section: String,
    pub content_md: String,
    pub frontmatter: Value,
}

/// One row of the page index, parsed from the manifest after generation.
#[derive(Debug, Clone)]
pub struct PageIndexEntry {
    pub slug: String,
    pub title: String,
    pub section: String,
    pub sort_order: i64,
    pub summary: Option<String>,
    pub file_path: String,
}

// ── Ingested repositories ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RepoRow {
    pub id: String,
    pub url: String,
    pub name: String,
    /// "ingesting" | "ready" | "error"
    pub status: String,
    pub ingested_at: DateTime<Utc>,
}

/// One walked entry of a cloned tree, ready for the bulk-insert path.
/// Paths use forward slashes regardless of host OS; `parent_path` is the
/// empty string at the repo root; `depth` counts path segments.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub name: String,
    pub extension: Option<String>,
    pub parent_path: String,
    pub depth: i64,
    pub is_directory: bool,
    pub content: Option<String>,
}

// ── Source host metadata ─────────────────────────────────────────────────

/// Repository metadata fetched from the source-hosting API.
#[derive(Debug, Clone, Serialize)]
pub struct RepoMetadata {
    pub owner: String,
    pub name: String,
    pub description: Option<String>,
    pub default_branch: String,
    pub latest_commit_sha: String,
    /// Language → percentage of the codebase, one decimal, summing to ~100.
    pub languages: serde_json::Map<String, Value>,
    pub html_url: String,
}

// ── Generation events ────────────────────────────────────────────────────

/// Ephemeral progress event published on the event bus while a wiki
/// generates. Never persisted; late subscribers never see past events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WikiEvent {
    StatusChange { status: WikiStatus },
    PageComplete { slug: String, progress: String },
    Complete { wiki_id: String },
    Error { message: String },
}

impl WikiEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusChange { .. } => "status_change",
            Self::PageComplete { .. } => "page_complete",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// The `data` payload for the SSE frame.
    pub fn data(&self) -> Value {
        match self {
            Self::StatusChange { status } => json!({ "status": status }),
            Self::PageComplete { slug, progress } => {
                json!({ "slug": slug, "progress": progress })
            }
            Self::Complete { wiki_id } => json!({ "wiki_id": wiki_id }),
            Self::Error { message } => json!({ "message": message }),
        }
    }

    /// SSE generators stop after `complete` or `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

// ── Agent runner output ──────────────────────────────────────────────────

/// Captured result of one external code-generation agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRun {
    /// Child exit code; -1 when the invocation timed out and was killed.
    pub exit_code: i32,
    /// Structured events parsed from the agent's line-oriented stream.
    pub events: Vec<Value>,
    /// Text of the last completed message item, or a concatenation fallback.
    pub final_message: String,
    pub stderr: String,
}

impl AgentRun {
    pub fn timed_out(&self) -> bool {
        self.exit_code == -1
    }
}
