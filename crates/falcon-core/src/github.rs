use serde_json::Value;
use tracing::info;

use crate::error::FalconError;
use crate::types::RepoMetadata;

/// Client for the source-hosting API (GitHub). The authorization token is
/// optional; without it unauthenticated rate limits apply.
pub struct GitHubClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl GitHubClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.github.com".into(),
            token: token.into(),
        }
    }

    /// Override the API base URL (tests point this at a local stub).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", "falcon");
        if !self.token.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.token));
        }
        req
    }

    async fn get_json(&self, url: &str) -> Result<Value, FalconError> {
        let resp = self
            .request(url)
            .send()
            .await
            .map_err(|e| FalconError::SourceHost(format!("request to {url} failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FalconError::SourceHost(format!(
                "{url} returned {status}: {body}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| FalconError::SourceHost(format!("bad JSON from {url}: {e}")))
    }

    /// Fetch default branch, latest commit, description and language split
    /// for a repository. Languages come back as percentages with one
    /// decimal, summing to ~100; an empty language map stays empty.
    pub async fn get_metadata(&self, owner: &str, repo: &str) -> Result<RepoMetadata, FalconError> {
        let info = self
            .get_json(&format!("{}/repos/{owner}/{repo}", self.base_url))
            .await?;

        let default_branch = info["default_branch"].as_str().unwrap_or("main").to_string();
        let description = info["description"].as_str().map(str::to_string);
        let html_url = info["html_url"].as_str().unwrap_or_default().to_string();

        let raw_languages = self
            .get_json(&format!("{}/repos/{owner}/{repo}/languages", self.base_url))
            .await?;
        let languages = percentages(&raw_languages);

        let commits = self
            .get_json(&format!(
                "{}/repos/{owner}/{repo}/commits?per_page=1&sha={default_branch}",
                self.base_url
            ))
            .await?;
        let latest_commit_sha = commits
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|c| c["sha"].as_str())
            .unwrap_or_default()
            .to_string();

        info!(owner, repo, %default_branch, "fetched repo metadata");

        Ok(RepoMetadata {
            owner: owner.to_string(),
            name: repo.to_string(),
            description,
            default_branch,
            latest_commit_sha,
            languages,
            html_url,
        })
    }
}

/// Convert the byte counts from the languages endpoint into percentages
/// rounded to one decimal place.
fn percentages(raw: &Value) -> serde_json::Map<String, Value> {
    let mut out = serde_json::Map::new();
    let Some(map) = raw.as_object() else {
        return out;
    };
    let total: f64 = map.values().filter_map(Value::as_f64).sum();
    let total = if total > 0.0 { total } else { 1.0 };
    for (lang, bytes) in map {
        let Some(bytes) = bytes.as_f64() else { continue };
        let pct = (bytes / total * 1000.0).round() / 10.0;
        out.insert(lang.clone(), Value::from(pct));
    }
    out
}
