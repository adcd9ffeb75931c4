//! Deterministic lexical ranking of wiki pages against a question.

use serde_json::Value;

/// Extensions stripped from source-file basenames before token matching.
const SOURCE_SUFFIXES: &[&str] = &[
    ".py", ".rs", ".js", ".jsx", ".ts", ".tsx", ".go", ".java", ".rb", ".c", ".cc", ".cpp", ".h",
    ".hpp", ".cs", ".php", ".swift", ".kt",
];

/// Rank manifest pages by lexical relevance and return up to `max_pages`
/// slugs by descending score. Zero-score pages are omitted; ties keep
/// manifest order.
pub fn select_context_pages(manifest: &Value, question: &str, max_pages: usize) -> Vec<String> {
    let question_lower = question.to_lowercase();
    let mut question_terms: Vec<&str> = question_lower.split_whitespace().collect();
    question_terms.sort_unstable();
    question_terms.dedup();
    let denom = question_terms.len().max(1) as f64;

    let mut scored: Vec<(String, f64)> = Vec::new();

    for page in manifest["pages"].as_array().into_iter().flatten() {
        let mut score = 0.0;

        let title = page["title"].as_str().unwrap_or_default().to_lowercase();
        score += 3.0 * overlap(&question_terms, &title) as f64 / denom;

        let summary = page["summary"].as_str().unwrap_or_default().to_lowercase();
        score += 2.0 * overlap(&question_terms, &summary) as f64 / denom;

        for export in page["key_exports"].as_array().into_iter().flatten() {
            if let Some(export) = export.as_str() {
                if !export.is_empty() && question_lower.contains(&export.to_lowercase()) {
                    score += 5.0;
                }
            }
        }

        for file in page["source_files"].as_array().into_iter().flatten() {
            let Some(file) = file.as_str() else { continue };
            let stem = file_stem_tokens(file);
            if question_terms.iter().any(|t| stem.contains(t)) {
                score += 2.0;
            }
        }

        if score > 0.0 {
            let slug = page["slug"].as_str().unwrap_or_default().to_string();
            scored.push((slug, score));
        }
    }

    // Stable sort keeps insertion order on ties.
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(max_pages).map(|(slug, _)| slug).collect()
}

/// Size of the intersection between the question terms and the
/// whitespace-tokenized text.
fn overlap(question_terms: &[&str], text: &str) -> usize {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    question_terms.iter().filter(|t| tokens.contains(*t)).count()
}

/// Basename of a source file with underscores spaced out and the
/// source-language suffix stripped, lowercased for matching.
fn file_stem_tokens(path: &str) -> String {
    let basename = path.rsplit('/').next().unwrap_or(path);
    let mut stem = basename.to_string();
    for suffix in SOURCE_SUFFIXES {
        if let Some(stripped) = stem.strip_suffix(suffix) {
            stem = stripped.to_string();
            break;
        }
    }
    stem.replace('_', " ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> Value {
        json!({
            "pages": [
                {
                    "slug": "architecture/auth",
                    "title": "Authentication Flow",
                    "summary": "How login and session handling work",
                    "key_exports": ["AuthService"],
                    "source_files": ["src/auth_service.py"]
                },
                {
                    "slug": "modules/storage",
                    "title": "Storage Layer",
                    "summary": "Database access patterns",
                    "key_exports": ["Store"],
                    "source_files": ["src/storage.py"]
                },
                {
                    "slug": "guides/deploy",
                    "title": "Deployment Guide",
                    "summary": "Shipping to production",
                    "key_exports": [],
                    "source_files": ["deploy/run.sh"]
                }
            ]
        })
    }

    #[test]
    fn ranks_by_relevance_and_omits_zero_scores() {
        let selected = select_context_pages(&manifest(), "how does authentication work", 5);
        assert_eq!(selected.first().map(String::as_str), Some("architecture/auth"));
        assert!(!selected.contains(&"guides/deploy".to_string()));
    }

    #[test]
    fn key_export_substring_match_dominates() {
        let selected = select_context_pages(&manifest(), "where is AuthService defined", 1);
        assert_eq!(selected, vec!["architecture/auth".to_string()]);
    }

    #[test]
    fn source_file_stem_matches_question_tokens() {
        let selected = select_context_pages(&manifest(), "storage internals", 5);
        assert!(selected.contains(&"modules/storage".to_string()));
    }

    #[test]
    fn respects_max_pages() {
        let selected = select_context_pages(&manifest(), "auth storage deployment shipping", 1);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn empty_question_selects_nothing() {
        assert!(select_context_pages(&manifest(), "", 5).is_empty());
    }
}
