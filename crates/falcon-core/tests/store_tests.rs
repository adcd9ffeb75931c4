use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use falcon_core::db::Db;
use falcon_core::types::{FileRecord, Job, JobStatus, PageIndexEntry, Wiki, WikiStatus};

// ── helpers ───────────────────────────────────────────────────────────────

fn open_db() -> Db {
    let db = Db::open(":memory:").expect("open in-memory db");
    db.migrate().expect("migrate");
    db
}

fn make_wiki(id: &str) -> Wiki {
    Wiki {
        id: id.to_string(),
        owner: "octocat".into(),
        repo: "Hello-World".into(),
        github_url: "https://github.com/octocat/Hello-World".into(),
        branch: "master".into(),
        commit_sha: None,
        status: WikiStatus::Queued,
        total_pages: 0,
        completed_pages: 0,
        storage_path: format!("octocat/Hello-World/{id}"),
        analysis_plan: None,
        repo_languages: None,
        repo_description: None,
        error_message: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

fn make_job(id: &str, wiki_id: &str, priority: i64) -> Job {
    Job {
        id: id.to_string(),
        kind: "wiki_generation".into(),
        wiki_id: wiki_id.to_string(),
        status: JobStatus::Queued,
        attempts: 0,
        max_attempts: 3,
        priority,
        worker_id: None,
        error_message: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

// ── wikis ─────────────────────────────────────────────────────────────────

#[test]
fn wiki_roundtrip_and_status_timestamps() {
    let db = open_db();
    db.insert_wiki(&make_wiki("w1")).expect("insert");

    let wiki = db.get_wiki("w1").expect("get").expect("exists");
    assert_eq!(wiki.status, WikiStatus::Queued);
    assert!(wiki.started_at.is_none());
    assert!(wiki.completed_at.is_none());

    db.update_wiki_status("w1", WikiStatus::Cloning).expect("cloning");
    let wiki = db.get_wiki("w1").expect("get").expect("exists");
    assert_eq!(wiki.status, WikiStatus::Cloning);
    assert!(wiki.started_at.is_some());

    db.update_wiki_status("w1", WikiStatus::Completed).expect("completed");
    let wiki = db.get_wiki("w1").expect("get").expect("exists");
    assert!(wiki.completed_at.is_some());
}

#[test]
fn find_active_wiki_ignores_failed() {
    let db = open_db();
    db.insert_wiki(&make_wiki("w1")).expect("insert");
    db.mark_wiki_failed("w1", "boom").expect("fail");

    assert!(db
        .find_active_wiki("octocat", "Hello-World", "master")
        .expect("find")
        .is_none());

    db.insert_wiki(&make_wiki("w2")).expect("insert");
    let found = db
        .find_active_wiki("octocat", "Hello-World", "master")
        .expect("find")
        .expect("exists");
    assert_eq!(found.id, "w2");
}

#[test]
fn completed_pages_increment_is_monotonic() {
    let db = open_db();
    db.insert_wiki(&make_wiki("w1")).expect("insert");
    db.update_page_counts("w1", 3, 0).expect("counts");

    assert_eq!(db.increment_completed_pages("w1").expect("inc"), 1);
    assert_eq!(db.increment_completed_pages("w1").expect("inc"), 2);
    assert_eq!(db.increment_completed_pages("w1").expect("inc"), 3);

    let wiki = db.get_wiki("w1").expect("get").expect("exists");
    assert!(wiki.completed_pages <= wiki.total_pages);
}

#[test]
fn delete_wiki_cascades_everything() {
    let db = open_db();
    db.insert_wiki(&make_wiki("w1")).expect("insert wiki");
    db.insert_job(&make_job("j1", "w1", 0)).expect("insert job");
    db.create_conversation("c1", "w1").expect("conversation");
    db.insert_conversation_message("c1", "user", "hi", None)
        .expect("message");
    db.replace_wiki_pages(
        "w1",
        &[PageIndexEntry {
            slug: "overview".into(),
            title: "Overview".into(),
            section: "architecture".into(),
            sort_order: 0,
            summary: None,
            file_path: "overview.md".into(),
        }],
    )
    .expect("pages");

    let storage_path = db.delete_wiki("w1").expect("delete").expect("existed");
    assert!(storage_path.contains("w1"));

    assert!(db.get_wiki("w1").expect("get").is_none());
    assert!(db.get_job("j1").expect("get").is_none());
    assert!(!db.conversation_belongs("c1", "w1").expect("belongs"));
    assert!(db.list_wiki_pages("w1").expect("pages").is_empty());
}

// ── jobs ──────────────────────────────────────────────────────────────────

#[test]
fn claim_orders_by_priority_then_age() {
    let db = open_db();
    db.insert_wiki(&make_wiki("w1")).expect("wiki");
    db.insert_wiki(&{
        let mut w = make_wiki("w2");
        w.branch = "other".into();
        w
    })
    .expect("wiki");

    db.insert_job(&make_job("low", "w1", 0)).expect("job");
    db.insert_job(&make_job("high", "w2", 5)).expect("job");

    let first = db.claim_next_job("worker-a").expect("claim").expect("job");
    assert_eq!(first.id, "high");
    assert_eq!(first.status, JobStatus::Running);
    assert_eq!(first.attempts, 1);
    assert_eq!(first.worker_id.as_deref(), Some("worker-a"));
    assert!(first.started_at.is_some());

    let second = db.claim_next_job("worker-a").expect("claim").expect("job");
    assert_eq!(second.id, "low");

    assert!(db.claim_next_job("worker-a").expect("claim").is_none());
}

#[test]
fn retry_requeues_until_attempts_exhausted() {
    let db = open_db();
    db.insert_wiki(&make_wiki("w1")).expect("wiki");
    db.insert_job(&make_job("j1", "w1", 0)).expect("job");

    for attempt in 1..=3 {
        let job = db.claim_next_job("w").expect("claim").expect("claimable");
        assert_eq!(job.attempts, attempt);
        if job.attempts < job.max_attempts {
            db.retry_job(&job.id, "transient").expect("retry");
        } else {
            db.fail_job(&job.id, "exhausted").expect("fail");
        }
    }

    // attempts == max_attempts, nothing left to claim
    assert!(db.claim_next_job("w").expect("claim").is_none());
    let job = db.get_job("j1").expect("get").expect("exists");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job.attempts <= job.max_attempts);
}

#[test]
fn reset_running_jobs_recovers_orphans() {
    let db = open_db();
    db.insert_wiki(&make_wiki("w1")).expect("wiki");
    db.insert_job(&make_job("j1", "w1", 0)).expect("job");

    let job = db.claim_next_job("dead-worker").expect("claim").expect("job");
    assert_eq!(job.status, JobStatus::Running);

    // Simulated restart
    let reclaimed = db.reset_running_jobs().expect("reset");
    assert_eq!(reclaimed, 1);

    let job = db.get_job("j1").expect("get").expect("exists");
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.worker_id.is_none());

    // Attempts advance monotonically across the re-execution
    let job = db.claim_next_job("new-worker").expect("claim").expect("job");
    assert_eq!(job.attempts, 2);
}

/// No two workers ever observe the same job as claimable: 100 jobs, 8
/// concurrent workers, every job claimed exactly once.
#[test]
fn concurrent_claims_are_exclusive() {
    let db = Arc::new(open_db());
    for i in 0..100 {
        let mut wiki = make_wiki(&format!("w{i}"));
        wiki.branch = format!("b{i}");
        db.insert_wiki(&wiki).expect("wiki");
        db.insert_job(&make_job(&format!("j{i}"), &format!("w{i}"), 0))
            .expect("job");
    }

    let mut handles = Vec::new();
    for worker in 0..8 {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            let worker_id = format!("worker-{worker}");
            let mut claimed = Vec::new();
            while let Some(job) = db.claim_next_job(&worker_id).expect("claim") {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all_claimed = Vec::new();
    for handle in handles {
        all_claimed.extend(handle.join().expect("join"));
    }

    assert_eq!(all_claimed.len(), 100);
    let unique: HashSet<&String> = all_claimed.iter().collect();
    assert_eq!(unique.len(), 100, "a job was claimed twice");
}

// ── conversations ─────────────────────────────────────────────────────────

#[test]
fn conversation_messages_are_append_only_and_ordered() {
    let db = open_db();
    db.insert_wiki(&make_wiki("w1")).expect("wiki");
    db.create_conversation("c1", "w1").expect("conversation");

    db.insert_conversation_message("c1", "user", "first", None)
        .expect("msg");
    db.insert_conversation_message(
        "c1",
        "assistant",
        "second",
        Some(&["overview".to_string()]),
    )
    .expect("msg");

    let messages = db.get_conversation_messages("c1").expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[0].content, "first");
    assert_eq!(messages[1].role, "assistant");
    assert_eq!(
        messages[1].context_pages.as_deref(),
        Some(&["overview".to_string()][..])
    );
}

// ── ingested file rows ────────────────────────────────────────────────────

fn file(path: &str, is_dir: bool, content: Option<&str>) -> FileRecord {
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("").to_string();
    let extension = name
        .rfind('.')
        .filter(|&i| i > 0)
        .map(|i| name[i..].to_lowercase());
    FileRecord {
        path: path.to_string(),
        depth: path.split('/').count() as i64,
        name,
        extension,
        parent_path: parent,
        is_directory: is_dir,
        content: content.map(str::to_string),
    }
}

#[test]
fn file_rows_honor_directory_content_invariant() {
    let db = open_db();
    db.insert_repo("r1", "https://example.com/r1.git", "example/r1")
        .expect("repo");
    db.insert_file_records(
        "r1",
        &[
            file("src", true, None),
            file("src/a.py", false, Some("print('a')")),
            file("README.md", false, Some("hello")),
        ],
    )
    .expect("records");

    for (path, is_dir) in db.all_paths("r1").expect("paths") {
        let (row_is_dir, content) = db.get_file("r1", &path).expect("get").expect("exists");
        assert_eq!(row_is_dir, is_dir);
        if is_dir {
            assert!(content.is_none());
        } else {
            assert!(content.is_some());
        }
    }

    assert_eq!(db.count_repo_files("r1").expect("count"), 2);
}

#[test]
fn parent_path_matches_path_with_last_segment_removed() {
    let db = open_db();
    db.insert_repo("r1", "https://example.com/r1.git", "example/r1")
        .expect("repo");
    db.insert_file_records(
        "r1",
        &[
            file("src", true, None),
            file("src/b", true, None),
            file("src/b/c.py", false, Some("x")),
            file("top.txt", false, Some("y")),
        ],
    )
    .expect("records");

    for (path, _) in db.all_paths("r1").expect("paths") {
        let expected_parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        let children = db.list_dir("r1", expected_parent).expect("list");
        let name = path.rsplit('/').next().unwrap_or(&path);
        assert!(
            children.iter().any(|(n, _)| n == name),
            "{path} not listed under {expected_parent:?}"
        );
    }
}

#[test]
fn delete_repo_cascades_file_rows() {
    let db = open_db();
    db.insert_repo("r1", "https://example.com/r1.git", "example/r1")
        .expect("repo");
    db.insert_file_records("r1", &[file("a.txt", false, Some("x"))])
        .expect("records");

    assert!(db.delete_repo("r1").expect("delete"));
    assert!(db.all_paths("r1").expect("paths").is_empty());
    assert!(!db.delete_repo("r1").expect("delete again"));
}
