//! Transactional operations on wiki state and on-disk wiki storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::error::FalconError;
use crate::types::{Job, JobStatus, PageDetail, PageSummary, Wiki, WikiStatus};

#[derive(Clone)]
pub struct WikiService {
    db: Arc<Db>,
    config: Arc<Config>,
}

#[derive(Debug, Serialize)]
pub struct ProgressInfo {
    pub completed: i64,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct WikiStatusInfo {
    pub status: WikiStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl WikiService {
    pub fn new(db: Arc<Db>, config: Arc<Config>) -> Self {
        Self { db, config }
    }

    /// Enroll a wiki and its generation job. `(owner, repo, branch)` is
    /// unique among non-failed wikis, so an existing one is returned as-is
    /// instead of enqueueing a duplicate.
    pub fn create_wiki(
        &self,
        owner: &str,
        repo: &str,
        github_url: &str,
        branch: &str,
    ) -> Result<String, FalconError> {
        if let Some(existing) = self.db.find_active_wiki(owner, repo, branch)? {
            return Ok(existing.id);
        }

        let wiki_id = uuid::Uuid::new_v4().to_string();
        let storage_path = format!("{owner}/{repo}/{wiki_id}");
        let now = Utc::now();

        self.db.insert_wiki(&Wiki {
            id: wiki_id.clone(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            github_url: github_url.to_string(),
            branch: branch.to_string(),
            commit_sha: None,
            status: WikiStatus::Queued,
            total_pages: 0,
            completed_pages: 0,
            storage_path,
            analysis_plan: None,
            repo_languages: None,
            repo_description: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        })?;

        self.db.insert_job(&Job {
            id: uuid::Uuid::new_v4().to_string(),
            kind: "wiki_generation".into(),
            wiki_id: wiki_id.clone(),
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: self.config.job_max_attempts,
            priority: 0,
            worker_id: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        })?;

        info!(wiki_id, owner, repo, branch, "enrolled wiki generation");
        Ok(wiki_id)
    }

    pub fn get_wiki(&self, wiki_id: &str) -> Result<Option<Wiki>, FalconError> {
        Ok(self.db.get_wiki(wiki_id)?)
    }

    pub fn find_wikis(
        &self,
        owner: Option<&str>,
        repo: Option<&str>,
    ) -> Result<Vec<Wiki>, FalconError> {
        Ok(self.db.list_wikis(owner, repo)?)
    }

    pub fn get_status(&self, wiki_id: &str) -> Result<Option<WikiStatusInfo>, FalconError> {
        let Some(wiki) = self.db.get_wiki(wiki_id)? else {
            return Ok(None);
        };
        let progress = (wiki.total_pages > 0).then_some(ProgressInfo {
            completed: wiki.completed_pages,
            total: wiki.total_pages,
        });
        Ok(Some(WikiStatusInfo {
            status: wiki.status,
            progress,
            started_at: wiki.started_at,
        }))
    }

    /// The raw manifest, available only once the wiki is completed.
    pub async fn get_manifest(&self, wiki_id: &str) -> Result<Option<Value>, FalconError> {
        let Some(wiki) = self.db.get_wiki(wiki_id)? else {
            return Ok(None);
        };
        if wiki.status != WikiStatus::Completed {
            return Ok(None);
        }
        let path = self.storage_dir(&wiki.storage_path).join("manifest.json");
        let Ok(text) = tokio::fs::read_to_string(&path).await else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&text).ok())
    }

    pub fn list_pages(&self, wiki_id: &str) -> Result<Vec<PageSummary>, FalconError> {
        Ok(self.db.list_wiki_pages(wiki_id)?)
    }

    pub async fn get_page(
        &self,
        wiki_id: &str,
        slug: &str,
    ) -> Result<Option<PageDetail>, FalconError> {
        let Some((storage_path, file_path)) = self.db.get_wiki_page_path(wiki_id, slug)? else {
            return Ok(None);
        };
        let path = self.storage_dir(&storage_path).join(&file_path);
        let Ok(text) = tokio::fs::read_to_string(&path).await else {
            return Ok(None);
        };

        let (frontmatter, content_md) = split_frontmatter(&text);
        Ok(Some(PageDetail {
            slug: slug.to_string(),
            title: frontmatter["title"].as_str().unwrap_or_default().to_string(),
            section: frontmatter["section"].as_str().unwrap_or_default().to_string(),
            content_md: content_md.to_string(),
            frontmatter,
        }))
    }

    /// Read one stored page's raw markdown (used as chat context).
    pub async fn read_page_markdown(
        &self,
        wiki_id: &str,
        slug: &str,
    ) -> Result<Option<String>, FalconError> {
        let Some((storage_path, file_path)) = self.db.get_wiki_page_path(wiki_id, slug)? else {
            return Ok(None);
        };
        let path = self.storage_dir(&storage_path).join(&file_path);
        Ok(tokio::fs::read_to_string(&path).await.ok())
    }

    /// Remove the wiki row (cascading jobs, conversations, messages and
    /// page index) and its storage directory. Returns false if absent.
    pub async fn delete_wiki(&self, wiki_id: &str) -> Result<bool, FalconError> {
        let Some(storage_path) = self.db.delete_wiki(wiki_id)? else {
            return Ok(false);
        };
        if !storage_path.is_empty() {
            let dir = self.storage_dir(&storage_path);
            if dir.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(wiki_id, "failed to remove wiki storage {}: {e}", dir.display());
                }
            }
        }
        Ok(true)
    }

    fn storage_dir(&self, storage_path: &str) -> PathBuf {
        Path::new(&self.config.wiki_storage_root).join(storage_path)
    }
}

/// Split YAML frontmatter off a markdown document. Returns an empty object
/// and the whole text when no valid frontmatter block is present.
pub fn split_frontmatter(text: &str) -> (Value, &str) {
    if let Some(rest) = text.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---\n") {
            let yaml = &rest[..end];
            let body = &rest[end + 5..];
            if let Ok(v) = serde_yaml::from_str::<Value>(yaml) {
                return (v, body);
            }
        }
    }
    (Value::Object(serde_json::Map::new()), text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_is_parsed_and_stripped() {
        let doc = "---\ntitle: \"Overview\"\nsection: architecture\norder: 1\n---\n# Overview\n\nBody text.\n";
        let (fm, body) = split_frontmatter(doc);
        assert_eq!(fm["title"].as_str(), Some("Overview"));
        assert_eq!(fm["section"].as_str(), Some("architecture"));
        assert_eq!(fm["order"].as_i64(), Some(1));
        assert!(body.starts_with("# Overview"));
    }

    #[test]
    fn missing_frontmatter_returns_whole_document() {
        let doc = "# Just markdown\n";
        let (fm, body) = split_frontmatter(doc);
        assert!(fm.as_object().map(|o| o.is_empty()).unwrap_or(false));
        assert_eq!(body, doc);
    }

    #[test]
    fn unterminated_frontmatter_is_not_parsed() {
        let doc = "---\ntitle: broken\n";
        let (fm, body) = split_frontmatter(doc);
        assert!(fm.as_object().map(|o| o.is_empty()).unwrap_or(false));
        assert_eq!(body, doc);
    }
}
