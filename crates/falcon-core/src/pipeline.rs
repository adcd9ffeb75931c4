//! The wiki generation pipeline: a five-phase state machine per wiki.
//!
//! queued → cloning → analyzing → generating → indexing → completed, with
//! any phase allowed to fail. Every transition is persisted before the next
//! phase starts so crash recovery always observes a consistent status. The
//! sandbox is destroyed on every exit path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::{
    agent::AgentRunner,
    bus::EventBus,
    config::Config,
    db::Db,
    directives,
    error::FalconError,
    github::GitHubClient,
    sandbox::{Sandbox, SandboxManager},
    types::{AgentRun, PageIndexEntry, RepoMetadata, Wiki, WikiEvent, WikiStatus},
};

pub struct WikiPipeline {
    db: Arc<Db>,
    config: Arc<Config>,
    bus: Arc<EventBus>,
    runner: Arc<dyn AgentRunner>,
    github: Arc<GitHubClient>,
    sandboxes: SandboxManager,
}

impl WikiPipeline {
    pub fn new(
        db: Arc<Db>,
        config: Arc<Config>,
        bus: Arc<EventBus>,
        runner: Arc<dyn AgentRunner>,
        github: Arc<GitHubClient>,
    ) -> Self {
        let sandboxes = SandboxManager::from_config(&config);
        Self {
            db,
            config,
            bus,
            runner,
            github,
            sandboxes,
        }
    }

    /// Drive one wiki through all five phases.
    pub async fn execute(&self, wiki_id: &str) -> Result<(), FalconError> {
        let wiki = self
            .db
            .get_wiki(wiki_id)?
            .ok_or_else(|| FalconError::NotFound(format!("wiki {wiki_id}")))?;

        // Phase 1: repository acquisition
        self.set_status(wiki_id, WikiStatus::Cloning)?;
        let sandbox = self.sandboxes.create(&wiki.github_url, &wiki.branch).await?;

        let result = self.run_phases(&wiki, &sandbox).await;
        self.sandboxes.destroy(sandbox).await;
        result
    }

    async fn run_phases(&self, wiki: &Wiki, sandbox: &Sandbox) -> Result<(), FalconError> {
        let wiki_id = wiki.id.as_str();
        let working_dir = sandbox.working_dir.as_path();

        let metadata = self.github.get_metadata(&wiki.owner, &wiki.repo).await?;
        let languages_json = serde_json::to_string(&metadata.languages)
            .map_err(|e| FalconError::Fatal(e.into()))?;
        self.db.update_commit_info(
            wiki_id,
            &metadata.latest_commit_sha,
            &languages_json,
            metadata.description.as_deref(),
        )?;

        // Phase 2: repository analysis
        self.set_status(wiki_id, WikiStatus::Analyzing)?;
        let plan = self.analyze(wiki, working_dir, &metadata).await?;
        self.db
            .set_analysis_plan(wiki_id, &plan.to_string())?;

        let total_pages = count_pages(&plan);
        self.db.update_page_counts(wiki_id, total_pages, 0)?;

        // Phase 3: wave-parallel page generation
        self.set_status(wiki_id, WikiStatus::Generating)?;
        self.generate_pages(wiki_id, working_dir, &plan, total_pages)
            .await?;

        // Phase 4: manifest generation
        self.set_status(wiki_id, WikiStatus::Indexing)?;
        let manifest = self.index_manifest(working_dir, &plan, &metadata).await?;

        // Phase 5: storage and completion
        self.finalize(wiki, working_dir, &manifest).await?;
        self.set_status(wiki_id, WikiStatus::Completed)?;
        self.bus.publish(
            wiki_id,
            WikiEvent::Complete {
                wiki_id: wiki_id.to_string(),
            },
        );
        info!(wiki_id, total_pages, "wiki generation completed");
        Ok(())
    }

    fn set_status(&self, wiki_id: &str, status: WikiStatus) -> Result<(), FalconError> {
        self.db.update_wiki_status(wiki_id, status)?;
        self.bus
            .publish(wiki_id, WikiEvent::StatusChange { status });
        Ok(())
    }

    // ── Phase 2 ───────────────────────────────────────────────────────────

    async fn analyze(
        &self,
        wiki: &Wiki,
        working_dir: &Path,
        metadata: &RepoMetadata,
    ) -> Result<Value, FalconError> {
        tokio::fs::write(working_dir.join("AGENTS.md"), directives::ANALYZER_DIRECTIVE).await?;

        let prompt = directives::analysis_prompt(&wiki.owner, &wiki.repo, metadata);
        let run = self
            .runner
            .run(working_dir, &prompt, self.agent_timeout())
            .await?;
        if run.exit_code != 0 {
            return Err(agent_failure("analysis", &run, self.config.codex_timeout_seconds));
        }

        // The plan is an opaque structured blob; the agent's final message
        // carries it as a JSON object.
        let plan = extract_json_object(&run.final_message).unwrap_or_else(|| {
            warn!(wiki_id = %wiki.id, "analysis output had no JSON object, using empty plan");
            json!({
                "repository": { "owner": wiki.owner, "name": wiki.repo },
                "sections": [],
                "modules": [],
            })
        });
        Ok(plan)
    }

    // ── Phase 3 ───────────────────────────────────────────────────────────

    async fn generate_pages(
        &self,
        wiki_id: &str,
        working_dir: &Path,
        plan: &Value,
        total_pages: i64,
    ) -> Result<(), FalconError> {
        tokio::fs::write(working_dir.join("AGENTS.md"), directives::WRITER_DIRECTIVE).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.codex_max_concurrent));
        let timeout = self.agent_timeout();

        for (wave_name, pages) in organize_waves(plan) {
            info!(wiki_id, wave = wave_name, pages = pages.len(), "generating wave");

            let mut handles = Vec::new();
            for page in pages {
                let semaphore = Arc::clone(&semaphore);
                let runner = Arc::clone(&self.runner);
                let db = Arc::clone(&self.db);
                let bus = Arc::clone(&self.bus);
                let prompt = directives::writing_prompt(&page, plan);
                let slug = page["slug"].as_str().unwrap_or_default().to_string();
                let working_dir = working_dir.to_path_buf();
                let wiki_id = wiki_id.to_string();

                handles.push(tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    match runner.run(&working_dir, &prompt, timeout).await {
                        Ok(run) if run.exit_code == 0 => {}
                        Ok(run) => {
                            error!(wiki_id = %wiki_id, slug = %slug, exit_code = run.exit_code,
                                "page generation failed: {}", run.stderr.trim());
                        }
                        Err(e) => error!(wiki_id = %wiki_id, slug = %slug, "page generation error: {e}"),
                    }
                    match db.increment_completed_pages(&wiki_id) {
                        Ok(completed) => {
                            bus.publish(
                                &wiki_id,
                                WikiEvent::PageComplete {
                                    slug,
                                    progress: format!("{completed}/{total_pages}"),
                                },
                            );
                        }
                        Err(e) => warn!(wiki_id = %wiki_id, "increment_completed_pages: {e}"),
                    }
                }));
            }

            // Waves run sequentially so later waves can reference earlier ones.
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(wiki_id, "page generation task panicked: {e}");
                }
            }
        }

        Ok(())
    }

    // ── Phase 4 ───────────────────────────────────────────────────────────

    async fn index_manifest(
        &self,
        working_dir: &Path,
        plan: &Value,
        metadata: &RepoMetadata,
    ) -> Result<Value, FalconError> {
        let prompt = directives::indexing_prompt(metadata);
        let manifest_path = working_dir.join("manifest.json");

        let run_ok = match self
            .runner
            .run(working_dir, &prompt, self.agent_timeout())
            .await
        {
            Ok(run) if run.exit_code == 0 => true,
            Ok(run) => {
                error!(exit_code = run.exit_code, "manifest generation failed: {}", run.stderr.trim());
                false
            }
            Err(e) => {
                error!("manifest generation error: {e}");
                false
            }
        };

        if run_ok {
            if let Ok(text) = tokio::fs::read_to_string(&manifest_path).await {
                if let Ok(manifest) = serde_json::from_str::<Value>(&text) {
                    return Ok(manifest);
                }
                warn!("manifest.json was not valid JSON, rebuilding from plan");
            } else {
                warn!("agent did not write manifest.json, rebuilding from plan");
            }
        }

        let fallback = build_fallback_manifest(plan, metadata);
        let text = serde_json::to_string_pretty(&fallback)
            .map_err(|e| FalconError::Fatal(e.into()))?;
        tokio::fs::write(&manifest_path, text).await?;
        Ok(fallback)
    }

    // ── Phase 5 ───────────────────────────────────────────────────────────

    /// Copy the manifest plus every manifest-described page from the
    /// sandbox into persistent storage and populate the page index.
    async fn finalize(
        &self,
        wiki: &Wiki,
        working_dir: &Path,
        manifest: &Value,
    ) -> Result<(), FalconError> {
        let storage_dir = Path::new(&self.config.wiki_storage_root).join(&wiki.storage_path);
        tokio::fs::create_dir_all(&storage_dir).await?;

        let src_manifest = working_dir.join("manifest.json");
        if src_manifest.exists() {
            tokio::fs::copy(&src_manifest, storage_dir.join("manifest.json")).await?;
        }

        let mut index = Vec::new();
        for (i, page) in manifest["pages"].as_array().into_iter().flatten().enumerate() {
            let slug = page["slug"].as_str().unwrap_or_default().to_string();
            if slug.is_empty() {
                continue;
            }
            let file_path = page["file_path"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{slug}.md"));

            let src = working_dir.join(&file_path);
            if src.exists() {
                let dst = storage_dir.join(&file_path);
                if let Some(parent) = dst.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&src, &dst).await?;
            } else {
                warn!(wiki_id = %wiki.id, slug = %slug, "page file missing in sandbox: {file_path}");
            }

            index.push(PageIndexEntry {
                slug,
                title: page["title"].as_str().unwrap_or_default().to_string(),
                section: page["section"].as_str().unwrap_or_default().to_string(),
                sort_order: page["order"].as_i64().unwrap_or(i as i64),
                summary: page["summary"].as_str().map(str::to_string),
                file_path,
            });
        }

        self.db.replace_wiki_pages(&wiki.id, &index)?;
        Ok(())
    }

    fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.config.codex_timeout_seconds)
    }
}

fn agent_failure(phase: &str, run: &AgentRun, timeout_s: u64) -> FalconError {
    if run.timed_out() {
        FalconError::AgentTimeout(timeout_s)
    } else {
        FalconError::Agent(format!(
            "{phase} agent exited with {}: {}",
            run.exit_code,
            run.stderr.trim()
        ))
    }
}

/// Total page count across every section of the plan.
pub fn count_pages(plan: &Value) -> i64 {
    plan["sections"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|s| s["pages"].as_array())
        .map(Vec::len)
        .sum::<usize>() as i64
}

/// Flatten the plan's pages (stamping each with its section id) and group
/// them into ordered generation waves: architecture and unsectioned pages
/// first, then modules, then guides and API reference.
pub fn organize_waves(plan: &Value) -> Vec<(&'static str, Vec<Value>)> {
    let mut all_pages = Vec::new();
    for section in plan["sections"].as_array().into_iter().flatten() {
        let section_id = section["id"].as_str().unwrap_or_default().to_string();
        for page in section["pages"].as_array().into_iter().flatten() {
            let mut page = page.clone();
            if let Some(obj) = page.as_object_mut() {
                obj.insert("section".into(), Value::from(section_id.clone()));
            }
            all_pages.push(page);
        }
    }

    let section_of = |p: &Value| p["section"].as_str().unwrap_or_default().to_string();
    let mut waves = Vec::new();

    let wave1: Vec<Value> = all_pages
        .iter()
        .filter(|p| matches!(section_of(p).as_str(), "" | "architecture"))
        .cloned()
        .collect();
    if !wave1.is_empty() {
        waves.push(("architecture", wave1));
    }

    let wave2: Vec<Value> = all_pages
        .iter()
        .filter(|p| section_of(p) == "modules")
        .cloned()
        .collect();
    if !wave2.is_empty() {
        waves.push(("modules", wave2));
    }

    let wave3: Vec<Value> = all_pages
        .iter()
        .filter(|p| matches!(section_of(p).as_str(), "guides" | "api-reference"))
        .cloned()
        .collect();
    if !wave3.is_empty() {
        waves.push(("guides", wave3));
    }

    waves
}

/// Extract the outermost-looking JSON object from free-form agent output.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text[start..].rfind('}')?;
    serde_json::from_str(&text[start..start + end + 1]).ok()
}

/// Manifest assembled from metadata and the analysis plan when the agent
/// fails to produce one. Pages, graph and source index stay empty; stats
/// are zeroed.
pub fn build_fallback_manifest(plan: &Value, metadata: &RepoMetadata) -> Value {
    json!({
        "version": "1.0",
        "repository": {
            "owner": metadata.owner,
            "name": metadata.name,
            "url": metadata.html_url,
            "default_branch": metadata.default_branch,
            "commit_sha": metadata.latest_commit_sha,
            "languages": metadata.languages,
            "description": metadata.description,
        },
        "falcon_version": env!("CARGO_PKG_VERSION"),
        "sections": plan["sections"].clone(),
        "pages": [],
        "source_index": {},
        "graph": { "nodes": [], "edges": [] },
        "stats": {
            "total_pages": 0,
            "total_source_files_covered": 0,
            "total_source_files_in_repo": 0,
            "coverage_percent": 0.0,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Value {
        json!({
            "sections": [
                {
                    "id": "architecture",
                    "pages": [
                        { "slug": "architecture/overview", "title": "Overview" },
                        { "slug": "architecture/design", "title": "Design" }
                    ]
                },
                {
                    "id": "modules",
                    "pages": [ { "slug": "modules/core", "title": "Core" } ]
                },
                {
                    "id": "guides",
                    "pages": [ { "slug": "guides/setup", "title": "Setup" } ]
                },
                {
                    "id": "api-reference",
                    "pages": [ { "slug": "api-reference/http", "title": "HTTP API" } ]
                }
            ]
        })
    }

    #[test]
    fn counts_pages_across_sections() {
        assert_eq!(count_pages(&plan()), 5);
        assert_eq!(count_pages(&json!({ "sections": [] })), 0);
    }

    #[test]
    fn waves_are_ordered_architecture_modules_guides() {
        let waves = organize_waves(&plan());
        let names: Vec<&str> = waves.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["architecture", "modules", "guides"]);
        assert_eq!(waves[0].1.len(), 2);
        assert_eq!(waves[1].1.len(), 1);
        // Guides and API reference share the final wave.
        assert_eq!(waves[2].1.len(), 2);
    }

    #[test]
    fn unsectioned_pages_land_in_the_first_wave() {
        let plan = json!({
            "sections": [
                { "id": "", "pages": [ { "slug": "overview", "title": "Overview" } ] }
            ]
        });
        let waves = organize_waves(&plan);
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].0, "architecture");
    }

    #[test]
    fn extracts_json_from_prose() {
        let text = "Here is the plan:\n{\"sections\": []}\nDone.";
        let v = extract_json_object(text).expect("json");
        assert!(v["sections"].as_array().is_some());
        assert!(extract_json_object("no json here").is_none());
    }
}
