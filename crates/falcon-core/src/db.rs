use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    ConversationMessage, FileRecord, Job, JobStatus, PageIndexEntry, PageSummary, RepoRow, Wiki,
    WikiStatus,
};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Unified persistent store: the wiki/job schema and the ingested-file
/// schema live in one SQLite file. All access is serialized through the
/// connection mutex; statements that must be atomic (the job claim) are
/// single SQL statements.
pub struct Db {
    conn: Mutex<Connection>,
}

/// Optional glob predicate for `search_candidates`.
pub enum SearchGlob {
    /// `*.py` style — exact match on the `extension` column.
    Extension(String),
    /// Any other glob — `name LIKE` pattern with `*`→`%`, `?`→`_` applied.
    NamePattern(String),
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ── Row mappers ───────────────────────────────────────────────────────────

const WIKI_COLS: &str = "id, owner, repo, github_url, branch, commit_sha, status, \
     total_pages, completed_pages, storage_path, analysis_plan, repo_languages, \
     repo_description, error_message, created_at, started_at, completed_at";

fn row_to_wiki(row: &rusqlite::Row<'_>) -> rusqlite::Result<Wiki> {
    let status_str: String = row.get(6)?;
    let created_at_str: String = row.get(14)?;
    Ok(Wiki {
        id: row.get(0)?,
        owner: row.get(1)?,
        repo: row.get(2)?,
        github_url: row.get(3)?,
        branch: row.get(4)?,
        commit_sha: row.get(5)?,
        status: WikiStatus::parse(&status_str).unwrap_or(WikiStatus::Failed),
        total_pages: row.get(7)?,
        completed_pages: row.get(8)?,
        storage_path: row.get(9)?,
        analysis_plan: row.get(10)?,
        repo_languages: row.get(11)?,
        repo_description: row.get(12)?,
        error_message: row.get(13)?,
        created_at: parse_ts(&created_at_str),
        started_at: parse_ts_opt(row.get(15)?),
        completed_at: parse_ts_opt(row.get(16)?),
    })
}

const JOB_COLS: &str = "id, kind, wiki_id, status, attempts, max_attempts, priority, \
     worker_id, error_message, created_at, started_at, completed_at";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let status_str: String = row.get(3)?;
    let created_at_str: String = row.get(9)?;
    Ok(Job {
        id: row.get(0)?,
        kind: row.get(1)?,
        wiki_id: row.get(2)?,
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Failed),
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        priority: row.get(6)?,
        worker_id: row.get(7)?,
        error_message: row.get(8)?,
        created_at: parse_ts(&created_at_str),
        started_at: parse_ts_opt(row.get(10)?),
        completed_at: parse_ts_opt(row.get(11)?),
    })
}

fn row_to_repo(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepoRow> {
    let ingested_at_str: String = row.get(4)?;
    Ok(RepoRow {
        id: row.get(0)?,
        url: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        ingested_at: parse_ts(&ingested_at_str),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationMessage> {
    let context_pages_str: Option<String> = row.get(3)?;
    let created_at_str: String = row.get(4)?;
    Ok(ConversationMessage {
        id: row.get(0)?,
        role: row.get(1)?,
        content: row.get(2)?,
        context_pages: context_pages_str.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_ts(&created_at_str),
    })
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Wikis ─────────────────────────────────────────────────────────────

    pub fn insert_wiki(&self, wiki: &Wiki) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let created_at = wiki.created_at.format("%Y-%m-%d %H:%M:%S").to_string();
        conn.execute(
            "INSERT INTO wikis \
             (id, owner, repo, github_url, branch, commit_sha, status, total_pages, \
              completed_pages, storage_path, analysis_plan, repo_languages, \
              repo_description, error_message, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                wiki.id,
                wiki.owner,
                wiki.repo,
                wiki.github_url,
                wiki.branch,
                wiki.commit_sha,
                wiki.status.as_str(),
                wiki.total_pages,
                wiki.completed_pages,
                wiki.storage_path,
                wiki.analysis_plan,
                wiki.repo_languages,
                wiki.repo_description,
                wiki.error_message,
                created_at,
            ],
        )
        .context("insert_wiki")?;
        Ok(())
    }

    pub fn get_wiki(&self, id: &str) -> Result<Option<Wiki>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {WIKI_COLS} FROM wikis WHERE id = ?1"),
                params![id],
                row_to_wiki,
            )
            .optional()
            .context("get_wiki")?;
        Ok(result)
    }

    /// Find a non-failed wiki for `(owner, repo, branch)`. At most one can
    /// exist at a time.
    pub fn find_active_wiki(&self, owner: &str, repo: &str, branch: &str) -> Result<Option<Wiki>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!(
                    "SELECT {WIKI_COLS} FROM wikis \
                     WHERE owner = ?1 AND repo = ?2 AND branch = ?3 AND status != 'failed' \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![owner, repo, branch],
                row_to_wiki,
            )
            .optional()
            .context("find_active_wiki")?;
        Ok(result)
    }

    pub fn list_wikis(&self, owner: Option<&str>, repo: Option<&str>) -> Result<Vec<Wiki>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {WIKI_COLS} FROM wikis \
             WHERE (?1 IS NULL OR owner = ?1) AND (?2 IS NULL OR repo = ?2) \
             ORDER BY created_at DESC, id DESC"
        ))?;
        let wikis = stmt
            .query_map(params![owner, repo], row_to_wiki)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_wikis")?;
        Ok(wikis)
    }

    /// Persist a phase transition. Entering `cloning` stamps `started_at`;
    /// reaching `completed` stamps `completed_at`.
    pub fn update_wiki_status(&self, id: &str, status: WikiStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let extra = match status {
            WikiStatus::Cloning => ", started_at = datetime('now')",
            WikiStatus::Completed => ", completed_at = datetime('now')",
            _ => "",
        };
        conn.execute(
            &format!("UPDATE wikis SET status = ?1{extra} WHERE id = ?2"),
            params![status.as_str(), id],
        )
        .context("update_wiki_status")?;
        Ok(())
    }

    pub fn update_commit_info(
        &self,
        id: &str,
        commit_sha: &str,
        languages_json: &str,
        description: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE wikis SET commit_sha = ?1, repo_languages = ?2, repo_description = ?3 \
             WHERE id = ?4",
            params![commit_sha, languages_json, description, id],
        )
        .context("update_commit_info")?;
        Ok(())
    }

    pub fn set_analysis_plan(&self, id: &str, plan_json: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE wikis SET analysis_plan = ?1 WHERE id = ?2",
            params![plan_json, id],
        )
        .context("set_analysis_plan")?;
        Ok(())
    }

    pub fn update_page_counts(&self, id: &str, total: i64, completed: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE wikis SET total_pages = ?1, completed_pages = ?2 WHERE id = ?3",
            params![total, completed, id],
        )
        .context("update_page_counts")?;
        Ok(())
    }

    /// Increment `completed_pages` and return the new count.
    pub fn increment_completed_pages(&self, id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let completed = conn
            .query_row(
                "UPDATE wikis SET completed_pages = completed_pages + 1 WHERE id = ?1 \
                 RETURNING completed_pages",
                params![id],
                |row| row.get(0),
            )
            .context("increment_completed_pages")?;
        Ok(completed)
    }

    pub fn mark_wiki_failed(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE wikis SET status = 'failed', error_message = ?1, \
             completed_at = datetime('now') WHERE id = ?2",
            params![error, id],
        )
        .context("mark_wiki_failed")?;
        Ok(())
    }

    /// Delete a wiki row (cascades jobs, conversations, messages and page
    /// index rows). Returns the storage path so the caller can remove the
    /// on-disk directory, or None if the wiki did not exist.
    pub fn delete_wiki(&self, id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let storage_path: Option<String> = conn
            .query_row(
                "SELECT storage_path FROM wikis WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("delete_wiki lookup")?;
        if storage_path.is_some() {
            conn.execute("DELETE FROM wikis WHERE id = ?1", params![id])
                .context("delete_wiki")?;
        }
        Ok(storage_path)
    }

    // ── Jobs ──────────────────────────────────────────────────────────────

    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let created_at = job.created_at.format("%Y-%m-%d %H:%M:%S").to_string();
        conn.execute(
            "INSERT INTO jobs \
             (id, kind, wiki_id, status, attempts, max_attempts, priority, \
              worker_id, error_message, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job.id,
                job.kind,
                job.wiki_id,
                job.status.as_str(),
                job.attempts,
                job.max_attempts,
                job.priority,
                job.worker_id,
                job.error_message,
                created_at,
            ],
        )
        .context("insert_job")?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1"),
                params![id],
                row_to_job,
            )
            .optional()
            .context("get_job")?;
        Ok(result)
    }

    /// Atomically claim the next runnable job. A single UPDATE selects the
    /// highest-priority oldest queued job with attempts remaining, marks it
    /// running, stamps `started_at`, bumps `attempts` and returns the row —
    /// no two workers can ever observe the same job as claimable.
    pub fn claim_next_job(&self, worker_id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                &format!(
                    "UPDATE jobs SET status = 'running', started_at = datetime('now'), \
                     attempts = attempts + 1, worker_id = ?1 \
                     WHERE id = (SELECT id FROM jobs \
                                 WHERE status = 'queued' AND attempts < max_attempts \
                                 ORDER BY priority DESC, created_at ASC LIMIT 1) \
                     RETURNING {JOB_COLS}"
                ),
                params![worker_id],
                row_to_job,
            )
            .optional()
            .context("claim_next_job")?;
        Ok(result)
    }

    pub fn complete_job(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE jobs SET status = 'completed', completed_at = datetime('now') WHERE id = ?1",
            params![id],
        )
        .context("complete_job")?;
        Ok(())
    }

    /// Return a failed job to the queue for another attempt.
    pub fn retry_job(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE jobs SET status = 'queued', worker_id = NULL, error_message = ?1 \
             WHERE id = ?2",
            params![error, id],
        )
        .context("retry_job")?;
        Ok(())
    }

    pub fn fail_job(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE jobs SET status = 'failed', error_message = ?1, \
             completed_at = datetime('now') WHERE id = ?2",
            params![error, id],
        )
        .context("fail_job")?;
        Ok(())
    }

    /// Crash recovery: any job left `running` by a dead process goes back to
    /// the queue with its worker cleared. Returns the number reclaimed.
    pub fn reset_running_jobs(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE jobs SET status = 'queued', worker_id = NULL WHERE status = 'running'",
                [],
            )
            .context("reset_running_jobs")?;
        Ok(n)
    }

    // ── Conversations ─────────────────────────────────────────────────────

    pub fn create_conversation(&self, id: &str, wiki_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO conversations (id, wiki_id, created_at) VALUES (?1, ?2, ?3)",
            params![id, wiki_id, now_str()],
        )
        .context("create_conversation")?;
        Ok(())
    }

    pub fn conversation_belongs(&self, conversation_id: &str, wiki_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM conversations WHERE id = ?1 AND wiki_id = ?2",
                params![conversation_id, wiki_id],
                |row| row.get(0),
            )
            .optional()
            .context("conversation_belongs")?;
        Ok(found.is_some())
    }

    pub fn insert_conversation_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        context_pages: Option<&[String]>,
    ) -> Result<String> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let id = uuid::Uuid::new_v4().to_string();
        let context_json = match context_pages {
            Some(pages) => Some(serde_json::to_string(pages).context("serialize context_pages")?),
            None => None,
        };
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, context_pages, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, conversation_id, role, content, context_json, now_str()],
        )
        .context("insert_conversation_message")?;
        Ok(id)
    }

    pub fn get_conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMessage>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, role, content, context_pages, created_at \
             FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let messages = stmt
            .query_map(params![conversation_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_conversation_messages")?;
        Ok(messages)
    }

    // ── Wiki pages ────────────────────────────────────────────────────────

    /// Populate the page index from a manifest in one transaction, replacing
    /// any previous rows for this wiki.
    pub fn replace_wiki_pages(&self, wiki_id: &str, pages: &[PageIndexEntry]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("replace_wiki_pages begin")?;
        tx.execute("DELETE FROM wiki_pages WHERE wiki_id = ?1", params![wiki_id])
            .context("replace_wiki_pages delete")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO wiki_pages (wiki_id, slug, title, section, sort_order, summary, file_path) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for page in pages {
                stmt.execute(params![
                    wiki_id,
                    page.slug,
                    page.title,
                    page.section,
                    page.sort_order,
                    page.summary,
                    page.file_path,
                ])
                .context("replace_wiki_pages insert")?;
            }
        }
        tx.commit().context("replace_wiki_pages commit")?;
        Ok(())
    }

    pub fn list_wiki_pages(&self, wiki_id: &str) -> Result<Vec<PageSummary>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT slug, title, section, sort_order, summary \
             FROM wiki_pages WHERE wiki_id = ?1 ORDER BY sort_order ASC, slug ASC",
        )?;
        let pages = stmt
            .query_map(params![wiki_id], |row| {
                Ok(PageSummary {
                    slug: row.get(0)?,
                    title: row.get(1)?,
                    section: row.get(2)?,
                    order: row.get(3)?,
                    summary: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_wiki_pages")?;
        Ok(pages)
    }

    /// Resolve a page slug to `(storage_path, file_path)`.
    pub fn get_wiki_page_path(&self, wiki_id: &str, slug: &str) -> Result<Option<(String, String)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT w.storage_path, p.file_path FROM wikis w \
                 JOIN wiki_pages p ON w.id = p.wiki_id \
                 WHERE w.id = ?1 AND p.slug = ?2",
                params![wiki_id, slug],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("get_wiki_page_path")?;
        Ok(result)
    }

    // ── Ingested repositories ─────────────────────────────────────────────

    pub fn get_repo_by_url(&self, url: &str) -> Result<Option<RepoRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT id, url, name, status, ingested_at FROM repos WHERE url = ?1",
                params![url],
                row_to_repo,
            )
            .optional()
            .context("get_repo_by_url")?;
        Ok(result)
    }

    pub fn insert_repo(&self, id: &str, url: &str, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO repos (id, url, name, status, ingested_at) \
             VALUES (?1, ?2, ?3, 'ingesting', ?4)",
            params![id, url, name, now_str()],
        )
        .context("insert_repo")?;
        Ok(())
    }

    pub fn set_repo_status(&self, id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE repos SET status = ?1 WHERE id = ?2",
            params![status, id],
        )
        .context("set_repo_status")?;
        Ok(())
    }

    pub fn get_repo(&self, id: &str) -> Result<Option<RepoRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT id, url, name, status, ingested_at FROM repos WHERE id = ?1",
                params![id],
                row_to_repo,
            )
            .optional()
            .context("get_repo")?;
        Ok(result)
    }

    pub fn list_repos(&self) -> Result<Vec<RepoRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, url, name, status, ingested_at FROM repos \
             ORDER BY ingested_at DESC, id DESC",
        )?;
        let repos = stmt
            .query_map([], row_to_repo)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_repos")?;
        Ok(repos)
    }

    /// Delete a repo row; the FK cascade removes its file rows. Returns
    /// false if the repo did not exist.
    pub fn delete_repo(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute("DELETE FROM repos WHERE id = ?1", params![id])
            .context("delete_repo")?;
        Ok(n > 0)
    }

    pub fn count_repo_files(&self, repo_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count = conn
            .query_row(
                "SELECT COUNT(*) FROM files WHERE repo_id = ?1 AND is_directory = 0",
                params![repo_id],
                |row| row.get(0),
            )
            .context("count_repo_files")?;
        Ok(count)
    }

    /// Bulk-load one ingestion's worth of file records in a single
    /// transaction.
    pub fn insert_file_records(&self, repo_id: &str, records: &[FileRecord]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("insert_file_records begin")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO files \
                 (repo_id, path, name, extension, parent_path, depth, is_directory, content) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for r in records {
                stmt.execute(params![
                    repo_id,
                    r.path,
                    r.name,
                    r.extension,
                    r.parent_path,
                    r.depth,
                    r.is_directory,
                    r.content,
                ])
                .context("insert_file_records insert")?;
            }
        }
        tx.commit().context("insert_file_records commit")?;
        Ok(())
    }

    // ── File queries backing the virtual shell tools ──────────────────────

    /// Children of one directory: directories first, then files, each in
    /// lexical order.
    pub fn list_dir(&self, repo_id: &str, parent_path: &str) -> Result<Vec<(String, bool)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT name, is_directory FROM files \
             WHERE repo_id = ?1 AND parent_path = ?2 \
             ORDER BY is_directory DESC, name ASC",
        )?;
        let rows = stmt
            .query_map(params![repo_id, parent_path], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_dir")?;
        Ok(rows)
    }

    /// Every path in the repo, in path order, for glob filtering.
    pub fn all_paths(&self, repo_id: &str) -> Result<Vec<(String, bool)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT path, is_directory FROM files WHERE repo_id = ?1 ORDER BY path ASC",
        )?;
        let rows = stmt
            .query_map(params![repo_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("all_paths")?;
        Ok(rows)
    }

    /// Fetch one entry: `(is_directory, content)`.
    pub fn get_file(&self, repo_id: &str, path: &str) -> Result<Option<(bool, Option<String>)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT is_directory, content FROM files WHERE repo_id = ?1 AND path = ?2",
                params![repo_id, path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("get_file")?;
        Ok(result)
    }

    /// Candidate rows for `search_code`: one substring predicate per
    /// extracted literal plus an optional glob predicate, always bounded by
    /// `repo_id` and `is_directory = 0`. Results in path order.
    pub fn search_candidates(
        &self,
        repo_id: &str,
        literals: &[String],
        glob: Option<&SearchGlob>,
    ) -> Result<Vec<(String, String)>> {
        let mut conditions = vec!["repo_id = ?".to_string(), "is_directory = 0".to_string()];
        let mut values: Vec<String> = vec![repo_id.to_string()];

        for lit in literals {
            conditions.push("content LIKE ?".to_string());
            values.push(format!("%{lit}%"));
        }

        match glob {
            Some(SearchGlob::Extension(ext)) => {
                conditions.push("extension = ?".to_string());
                values.push(ext.clone());
            }
            Some(SearchGlob::NamePattern(pattern)) => {
                conditions.push("name LIKE ?".to_string());
                values.push(pattern.clone());
            }
            None => {}
        }

        let sql = format!(
            "SELECT path, content FROM files WHERE {} ORDER BY path ASC",
            conditions.join(" AND ")
        );

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((row.get(0)?, row.get::<_, Option<String>>(1)?.unwrap_or_default()))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("search_candidates")?;
        Ok(rows)
    }
}
