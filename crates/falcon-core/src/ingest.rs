//! Repository ingestion: clone → walk → filter → bulk-load.
//!
//! The clone lives in a scratch tempdir that is reclaimed on every exit
//! path; after ingestion only the database holds the repo's data.

use std::path::Path;
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::db::Db;
use crate::error::FalconError;
use crate::types::FileRecord;

/// Directory names pruned in place during the walk: version-control
/// metadata, dependency caches, build outputs, IDE metadata.
const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".env",
    "vendor",
    "dist",
    "build",
    ".next",
    ".nuxt",
    "target",
    "bin",
    "obj",
    ".idea",
    ".vscode",
    ".DS_Store",
    ".svn",
    ".hg",
    "coverage",
    ".cache",
    ".parcel-cache",
    ".turbo",
];

/// Binary/media/archive/compiled/large-data extensions never worth indexing.
const SKIP_EXTENSIONS: &[&str] = &[
    // Images
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".bmp", ".webp",
    // Fonts
    ".woff", ".woff2", ".ttf", ".eot", ".otf",
    // Media
    ".mp3", ".mp4", ".wav", ".avi", ".mov", ".webm",
    // Archives
    ".zip", ".tar", ".gz", ".rar", ".7z", ".bz2",
    // Documents
    ".pdf", ".doc", ".docx", ".xls", ".xlsx",
    // Binaries
    ".exe", ".dll", ".so", ".dylib", ".bin",
    // Compiled
    ".pyc", ".pyo", ".class", ".o", ".a", ".obj", ".wasm",
    // Data (large)
    ".sqlite", ".db", ".pickle", ".pkl",
    // Maps
    ".map",
];

const SKIP_FILENAMES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "Cargo.lock",
    "composer.lock",
    "Gemfile.lock",
    "go.sum",
    ".DS_Store",
    "Thumbs.db",
];

#[derive(Debug, Serialize)]
pub struct IngestOutcome {
    pub repo_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<usize>,
}

/// Ingest a git repository into the indexed store.
///
/// Returns `already_exists` with the original id when the URL was ingested
/// before. Any failure after the repo row exists transitions it to `error`
/// and propagates.
pub async fn ingest_repo(db: &Db, config: &Config, url: &str) -> Result<IngestOutcome, FalconError> {
    if let Some(existing) = db.get_repo_by_url(url)? {
        return Ok(IngestOutcome {
            repo_id: existing.id,
            status: "already_exists".into(),
            file_count: None,
        });
    }

    let repo_id = uuid::Uuid::new_v4().to_string();
    let name = extract_repo_name(url);
    db.insert_repo(&repo_id, url, &name)?;

    match ingest_inner(db, config, url, &repo_id).await {
        Ok(file_count) => {
            db.set_repo_status(&repo_id, "ready")?;
            info!(repo_id, file_count, "ingested {url}");
            Ok(IngestOutcome {
                repo_id,
                status: "ready".into(),
                file_count: Some(file_count),
            })
        }
        Err(e) => {
            if let Err(db_err) = db.set_repo_status(&repo_id, "error") {
                warn!("failed to mark repo {repo_id} as error: {db_err}");
            }
            Err(e)
        }
    }
}

async fn ingest_inner(
    db: &Db,
    config: &Config,
    url: &str,
    repo_id: &str,
) -> Result<usize, FalconError> {
    let scratch = tempfile::Builder::new()
        .prefix("falcon_ingest_")
        .tempdir()
        .map_err(|e| FalconError::Acquisition(format!("tempdir: {e}")))?;
    let clone_path = scratch.path().join("repo");

    let output = Command::new("git")
        .args(["clone", "--depth", "1", "--single-branch", url])
        .arg(&clone_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| FalconError::Acquisition(format!("failed to spawn git: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(FalconError::Acquisition(format!(
            "git clone failed (exit {}): {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }

    // The walk is pure blocking filesystem work.
    let max_file_size = config.max_file_size;
    let walk_root = clone_path.clone();
    let records = tokio::task::spawn_blocking(move || collect_file_records(&walk_root, max_file_size))
        .await
        .map_err(|e| FalconError::Fatal(anyhow::anyhow!("ingest walk task failed: {e}")))?;

    db.insert_file_records(repo_id, &records)?;
    Ok(records.len())
}

/// Walk the cloned tree, pruning skip-directories in place, and emit one
/// record per kept directory and file.
fn collect_file_records(root: &Path, max_file_size: u64) -> Vec<FileRecord> {
    let mut records = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(e.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                continue;
            }
        };

        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let path = to_forward_slashes(rel);
        let name = entry.file_name().to_string_lossy().into_owned();
        let parent_path = parent_of(&path);
        let depth = entry.depth() as i64;

        if entry.file_type().is_dir() {
            records.push(FileRecord {
                path,
                name,
                extension: None,
                parent_path,
                depth,
                is_directory: true,
                content: None,
            });
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        if SKIP_FILENAMES.contains(&name.as_str()) {
            continue;
        }
        let extension = get_extension(&name);
        if let Some(ref ext) = extension {
            if SKIP_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.len() > max_file_size {
            continue;
        }
        // Binary files fail UTF-8 decoding and are omitted entirely.
        let Ok(bytes) = std::fs::read(entry.path()) else {
            continue;
        };
        let Ok(content) = String::from_utf8(bytes) else {
            continue;
        };

        records.push(FileRecord {
            path,
            name,
            extension,
            parent_path,
            depth,
            is_directory: false,
            content: Some(content),
        });
    }

    records
}

fn to_forward_slashes(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

/// Lowercased extension including the leading dot, or None. A leading dot
/// alone (".gitignore") is a name, not an extension.
fn get_extension(filename: &str) -> Option<String> {
    let idx = filename.rfind('.')?;
    if idx == 0 {
        return None;
    }
    Some(filename[idx..].to_lowercase())
}

/// "https://github.com/expressjs/express.git" → "expressjs/express"
/// "git@bitbucket.org:team/repo.git"          → "team/repo"
fn extract_repo_name(url: &str) -> String {
    let clean = url.trim_end_matches('/');
    let clean = clean.strip_suffix(".git").unwrap_or(clean);

    if clean.contains("://") {
        let parts: Vec<&str> = clean.split('/').collect();
        if parts.len() >= 2 {
            return parts[parts.len() - 2..].join("/");
        }
        return parts.last().copied().unwrap_or(clean).to_string();
    }
    if let Some((_, rest)) = clean.rsplit_once(':') {
        return rest.to_string();
    }
    clean.to_string()
}
