//! Virtual shell tools backed by the indexed store.
//!
//! Three tools replicate the shell commands an engineer would reach for:
//!
//!   list_files   →  ls, find        ("What files exist?")
//!   read_file    →  cat, head, tail ("Show me file content")
//!   search_code  →  rg              ("Where is this pattern?")
//!
//! Every call is a database query against ingested repo files, and every
//! output is a single text blob capped for direct injection into an LLM
//! context. Overflow appends a truncation notice telling the caller to
//! narrow the query.

use falcon_core::db::{Db, SearchGlob};
use regex::Regex;
use serde_json::{json, Value};

// Output caps — prevent flooding the model's context window
const MAX_LIST_RESULTS: usize = 200;
const MAX_FILE_LINES: usize = 500;
const MAX_SEARCH_MATCHES: usize = 50;

pub const SYSTEM_PROMPT: &str = "\
You are a code exploration assistant. You have access to a repository's codebase \
through the tools provided. Your job is to answer questions about the code \
accurately and thoroughly.

## How to explore

1. Start with `list_files` to understand the repo structure.
2. Use `search_code` to find where specific patterns, functions, or classes are defined or used.
3. Use `read_file` to read the actual code. Use `start_line`/`end_line` for large files.

## Rules

- NEVER guess. Always verify by reading the code before answering.
- Reference specific file paths and line numbers in your answers (e.g., `src/auth.py:42`).
- If a file is too large, read it in sections rather than all at once.
- When searching, start broad and narrow down. If a search returns too many results, add a glob filter.
- You can call multiple tools in parallel when they are independent.
";

// ── Tool 1: list_files ───────────────────────────────────────────────────

/// Directory mode lists one level like `ls`; any `*` or `?` in the path
/// switches to glob mode over the repo's full path list.
pub fn list_files(db: &Db, repo_id: &str, path: &str) -> String {
    let mut path = path.trim_matches('/').to_string();
    if path == "." {
        path.clear();
    }

    let is_glob = path.contains('*') || path.contains('?');
    if !is_glob {
        return match db.list_dir(repo_id, &path) {
            Ok(rows) if rows.is_empty() => {
                let shown = if path.is_empty() { "." } else { &path };
                format!("ls: cannot access '{shown}': No such file or directory")
            }
            Ok(rows) => rows
                .into_iter()
                .map(|(name, is_dir)| if is_dir { format!("{name}/") } else { name })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("Error executing list_files: {e}"),
        };
    }

    let pattern = match glob::Pattern::new(&path) {
        Ok(p) => p,
        Err(e) => return format!("Invalid glob pattern: {e}"),
    };
    let rows = match db.all_paths(repo_id) {
        Ok(rows) => rows,
        Err(e) => return format!("Error executing list_files: {e}"),
    };

    // `*` and `?` stay within one path segment; only `**` spans segments.
    let options = glob::MatchOptions {
        require_literal_separator: true,
        ..glob::MatchOptions::default()
    };
    let matched: Vec<(String, bool)> = rows
        .into_iter()
        .filter(|(p, _)| pattern.matches_with(p, options))
        .collect();

    if matched.is_empty() {
        return format!("No files matching: {path}");
    }

    let total = matched.len();
    let mut lines: Vec<String> = matched
        .into_iter()
        .take(MAX_LIST_RESULTS)
        .map(|(p, is_dir)| if is_dir { format!("{p}/") } else { p })
        .collect();
    if total > MAX_LIST_RESULTS {
        lines.push(format!(
            "\n... {} more results. Narrow your glob.",
            total - MAX_LIST_RESULTS
        ));
    }
    lines.join("\n")
}

// ── Tool 2: read_file ────────────────────────────────────────────────────

/// Content annotated with right-aligned 1-indexed line numbers. A negative
/// `start_line` selects the trailing |start_line| lines; otherwise the
/// slice is `lines[start-1..end]` with defaults covering the whole file.
pub fn read_file(
    db: &Db,
    repo_id: &str,
    path: &str,
    start_line: Option<i64>,
    end_line: Option<i64>,
) -> String {
    let path = path.trim_matches('/').trim_start_matches("./");

    let row = match db.get_file(repo_id, path) {
        Ok(row) => row,
        Err(e) => return format!("Error executing read_file: {e}"),
    };
    let Some((is_directory, content)) = row else {
        return format!("Error: {path}: No such file or directory");
    };
    if is_directory {
        return format!("Error: {path}: Is a directory");
    }
    let content = content.unwrap_or_default();

    let lines: Vec<&str> = content.split('\n').collect();
    let total = lines.len();

    let (selected, first_num) = match start_line {
        Some(s) if s < 0 => {
            // tail mode
            let take = (s.unsigned_abs() as usize).min(total);
            (&lines[total - take..], total - take + 1)
        }
        _ => {
            let s = start_line.unwrap_or(1).max(1) as usize - 1;
            let e = match end_line {
                Some(e) if e >= 0 => (e as usize).min(total),
                _ => total,
            };
            if s >= total || s >= e {
                (&lines[0..0], s + 1)
            } else {
                (&lines[s..e], s + 1)
            }
        }
    };

    let truncated = selected.len() > MAX_FILE_LINES;
    let selected = &selected[..selected.len().min(MAX_FILE_LINES)];

    let last_num = first_num + selected.len().saturating_sub(1);
    let width = last_num.to_string().len();
    let mut output: Vec<String> = Vec::with_capacity(selected.len());
    for (i, line) in selected.iter().enumerate() {
        output.push(format!("{:>width$} | {line}", first_num + i));
    }

    let mut result = output.join("\n");
    if truncated {
        result.push_str(&format!(
            "\n\n... truncated ({total} total lines). \
             Use start_line/end_line to read specific sections."
        ));
    }
    result
}

// ── Tool 3: search_code ──────────────────────────────────────────────────

/// Maximal alphanumeric/underscore runs of length >= 3, used as literal
/// substring prefilters before the real regex runs line-by-line.
fn extract_literals(pattern: &str) -> Vec<String> {
    let mut literals = Vec::new();
    let mut run = String::new();
    for c in pattern.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            run.push(c);
        } else {
            if run.len() >= 3 {
                literals.push(std::mem::take(&mut run));
            } else {
                run.clear();
            }
        }
    }
    if run.len() >= 3 {
        literals.push(run);
    }
    literals
}

/// `*.py` style globs become an extension-equality predicate; anything else
/// becomes a name pattern with `*`→`%`, `?`→`_`.
fn parse_search_glob(glob: &str) -> SearchGlob {
    if let Some(ext) = glob.strip_prefix('*') {
        let mut chars = ext.chars();
        if chars.next() == Some('.')
            && !ext[1..].is_empty()
            && ext[1..].chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return SearchGlob::Extension(ext.to_string());
        }
    }
    SearchGlob::NamePattern(glob.replace('*', "%").replace('?', "_"))
}

/// Ripgrep-style `path:line:content` output in repository path order,
/// capped at 50 matches.
pub fn search_code(db: &Db, repo_id: &str, pattern: &str, glob: Option<&str>) -> String {
    let compiled = match Regex::new(pattern) {
        Ok(r) => r,
        Err(e) => return format!("Invalid regex: {e}"),
    };

    let literals = extract_literals(pattern);
    let search_glob = glob.map(parse_search_glob);

    let rows = match db.search_candidates(repo_id, &literals, search_glob.as_ref()) {
        Ok(rows) => rows,
        Err(e) => return format!("Error executing search_code: {e}"),
    };
    if rows.is_empty() {
        return format!("No matches found for pattern: {pattern}");
    }

    let mut output = Vec::new();
    let mut match_count = 0usize;

    for (path, content) in &rows {
        for (line_idx, line) in content.split('\n').enumerate() {
            if compiled.is_match(line) {
                output.push(format!("{path}:{}:{line}", line_idx + 1));
                match_count += 1;
                if match_count >= MAX_SEARCH_MATCHES {
                    output.push(format!(
                        "\n... truncated at {MAX_SEARCH_MATCHES} matches. \
                         Narrow with glob or a more specific pattern."
                    ));
                    return output.join("\n");
                }
            }
        }
    }

    if output.is_empty() {
        // Prefilter candidates existed but the full regex matched no line.
        return format!("No matches found for pattern: {pattern}");
    }
    output.join("\n")
}

// ── Dispatcher ───────────────────────────────────────────────────────────

/// Route a tool call from the agent loop. Unknown tools and malformed
/// arguments come back as text so the loop never crashes.
pub fn execute_tool(db: &Db, repo_id: &str, name: &str, arguments: &Value) -> String {
    match name {
        "list_files" => {
            let path = arguments["path"].as_str().unwrap_or("");
            list_files(db, repo_id, path)
        }
        "read_file" => {
            let Some(path) = arguments["path"].as_str() else {
                return "Error: read_file requires a path".into();
            };
            read_file(
                db,
                repo_id,
                path,
                arguments["start_line"].as_i64(),
                arguments["end_line"].as_i64(),
            )
        }
        "search_code" => {
            let Some(pattern) = arguments["pattern"].as_str() else {
                return "Error: search_code requires a pattern".into();
            };
            search_code(db, repo_id, pattern, arguments["glob"].as_str())
        }
        other => format!("Unknown tool: {other}"),
    }
}

/// Function-calling schemas for the three tools, shipped with every model
/// call. They must match the dispatcher's argument handling exactly.
pub fn tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "list_files",
                "description": "List files and directories in the repository. \
Pass a directory path to list its contents (like `ls`), \
or use glob patterns (*, **, ?) to search recursively (like `find`).\n\n\
Examples:\n  list_files(path=\"\")              → list repo root\n  \
list_files(path=\"src/auth\")      → list contents of src/auth/\n  \
list_files(path=\"**/*.py\")       → find all Python files\n  \
list_files(path=\"src/**/*.test.ts\") → find test files under src/",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Directory path to list, or glob pattern to search. \
Use '' for repo root. Use ** for recursive matching, * for single-level matching."
                        }
                    },
                    "required": ["path"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "read_file",
                "description": "Read the contents of a file, optionally a specific line range.\n\n\
Examples:\n  read_file(path=\"src/auth.py\")                        → entire file\n  \
read_file(path=\"src/auth.py\", end_line=20)           → first 20 lines\n  \
read_file(path=\"src/auth.py\", start_line=-10)        → last 10 lines\n  \
read_file(path=\"src/auth.py\", start_line=50, end_line=70) → lines 50-70",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Path to the file to read."
                        },
                        "start_line": {
                            "type": "integer",
                            "description": "Start line (1-indexed). \
Negative values count from end: -10 means last 10 lines."
                        },
                        "end_line": {
                            "type": "integer",
                            "description": "End line (1-indexed, inclusive)."
                        }
                    },
                    "required": ["path"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "search_code",
                "description": "Search for a regex pattern across all files in the repository. \
Returns matching lines with file paths and line numbers, \
formatted like ripgrep output (path:line:content).\n\n\
Examples:\n  search_code(pattern=\"def authenticate\")               → find function def\n  \
search_code(pattern=\"import.*redis\", glob=\"*.py\")     → search Python files only\n  \
search_code(pattern=\"TODO|FIXME\")                     → find all TODOs",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "pattern": {
                            "type": "string",
                            "description": "Regex pattern to search for in file contents."
                        },
                        "glob": {
                            "type": "string",
                            "description": "Optional file filter. \
Use '*.py' for Python files, 'test_*' for test files, etc."
                        }
                    },
                    "required": ["pattern"]
                }
            }
        }),
    ]
}
