//! Agent directives and prompt builders.
//!
//! The three directive documents are written into the working tree as
//! `AGENTS.md` before the corresponding agent invocation; the prompt
//! builders produce the per-invocation instruction text.

use serde_json::Value;

use crate::types::RepoMetadata;

pub const ANALYZER_DIRECTIVE: &str = include_str!("directives/analyzer.md");
pub const WRITER_DIRECTIVE: &str = include_str!("directives/writer.md");
pub const QA_DIRECTIVE: &str = include_str!("directives/qa.md");

pub fn analysis_prompt(owner: &str, repo: &str, metadata: &RepoMetadata) -> String {
    let languages: Vec<&str> = metadata.languages.keys().map(String::as_str).collect();
    format!(
        r#"Analyze this repository and produce a documentation plan.
The repo is {owner}/{repo}: {description}.
Primary languages: {languages}.

Focus on identifying:
1. The main modules and their boundaries
2. How modules depend on each other
3. Key public APIs and entry points
4. What documentation sections and pages would best explain this codebase

Read the top-level files first (README, config files), then explore each major directory.

Output a JSON object with this structure:
{{
  "modules": [
    {{"name": "...", "directory": "...", "purpose": "...", "key_files": [...], "depends_on": [...]}}
  ],
  "sections": [
    {{
      "id": "architecture",
      "title": "Architecture",
      "order": 1,
      "description": "...",
      "pages": [
        {{
          "slug": "architecture/system-design",
          "title": "System Design",
          "source_files": [...],
          "source_dirs": [...],
          "summary": "..."
        }}
      ]
    }}
  ],
  "entry_points": [...],
  "config_files": [...]
}}"#,
        description = metadata.description.as_deref().unwrap_or("No description"),
        languages = languages.join(", "),
    )
}

pub fn writing_prompt(page: &Value, plan: &Value) -> String {
    let slug = page["slug"].as_str().unwrap_or_default();
    let title = page["title"].as_str().unwrap_or(slug);
    let section = page["section"].as_str().unwrap_or_default();
    let summary = page["summary"].as_str().unwrap_or("See source files");

    let file_list = page["source_files"]
        .as_array()
        .map(|files| {
            files
                .iter()
                .filter_map(Value::as_str)
                .map(|f| format!("  - {f}"))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let other_pages: Vec<String> = plan["sections"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|s| s["pages"].as_array())
        .flatten()
        .filter(|p| p["slug"].as_str() != Some(slug))
        .map(|p| {
            format!(
                "  - {}: {}",
                p["slug"].as_str().unwrap_or_default(),
                p["title"].as_str().unwrap_or_default()
            )
        })
        .take(20)
        .collect();

    format!(
        r#"Write the wiki page "{title}" for section "{section}".

This page should cover these source files:
{file_list}

Summary of what to cover: {summary}

Other wiki pages that exist (for cross-references):
{other_pages}

Write the documentation as a markdown file with YAML frontmatter.
The frontmatter must include: title, slug, section, order, source_files, source_dirs,
depends_on, depended_by, key_exports, module_type, languages, complexity, generated_at.

Focus on explaining the architecture, key functions, data flow, and usage patterns.
Include actual code snippets from the source files.
Include Mermaid diagrams where they help explain relationships or flows.
Target 500-1500 words."#,
        other_pages = other_pages.join("\n"),
    )
}

pub fn indexing_prompt(metadata: &RepoMetadata) -> String {
    format!(
        r#"Read all the generated wiki markdown files in the current directory and produce a manifest.json file.

The manifest should contain:
1. Repository info: owner={owner}, name={name}, url={url},
   default_branch={default_branch}, commit_sha={commit_sha}
2. A "sections" array listing all wiki sections
3. A "pages" array with every page's slug, title, section, file_path, summary, source_files, key_exports, depends_on
4. A "source_index" mapping each source file path to the wiki page slugs that cover it
5. A "graph" with nodes (pages) and edges (depends_on relationships)
6. A "stats" object with total_pages, total_source_files_covered, and coverage_percent

Write the manifest.json file to the current directory."#,
        owner = metadata.owner,
        name = metadata.name,
        url = metadata.html_url,
        default_branch = metadata.default_branch,
        commit_sha = metadata.latest_commit_sha,
    )
}
