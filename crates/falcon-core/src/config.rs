use anyhow::Result;
use std::collections::HashMap;

/// Full application configuration loaded from environment / .env file.
/// All keys are `FALCON_` prefixed.
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub database_path: String,
    pub wiki_storage_root: String,

    // Codex CLI
    pub codex_bin: String,
    pub codex_api_key: String,
    pub codex_timeout_seconds: u64,
    pub codex_max_concurrent: usize,

    // Job queue
    pub max_concurrent_jobs: usize,
    pub job_max_attempts: i64,
    pub job_poll_interval_seconds: f64,

    // Sandbox
    pub use_remote_sandbox: bool,
    pub sandbox_api_key: String,
    pub sandbox_api_url: String,

    // Source host
    pub github_api_token: String,

    // Chat model
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub chat_model: String,

    // Ingestion
    pub max_file_size: u64,

    // Web
    pub bind: String,
    pub port: u16,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_f64(key: &str, dotenv: &HashMap<String, String>, default: f64) -> f64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        Ok(Config {
            database_path: get_str("FALCON_DATABASE_PATH", &dotenv, "store/falcon.db"),
            wiki_storage_root: get_str("FALCON_WIKI_STORAGE_ROOT", &dotenv, "wiki_storage"),
            codex_bin: get_str("FALCON_CODEX_BIN", &dotenv, "codex"),
            codex_api_key: get_str("FALCON_CODEX_API_KEY", &dotenv, ""),
            codex_timeout_seconds: get_u64("FALCON_CODEX_TIMEOUT_SECONDS", &dotenv, 300),
            codex_max_concurrent: get_usize("FALCON_CODEX_MAX_CONCURRENT", &dotenv, 3),
            max_concurrent_jobs: get_usize("FALCON_MAX_CONCURRENT_JOBS", &dotenv, 2),
            job_max_attempts: get_i64("FALCON_JOB_MAX_ATTEMPTS", &dotenv, 3),
            job_poll_interval_seconds: get_f64("FALCON_JOB_POLL_INTERVAL_SECONDS", &dotenv, 1.0),
            use_remote_sandbox: get_bool("FALCON_USE_REMOTE_SANDBOX", &dotenv, false),
            sandbox_api_key: get_str("FALCON_SANDBOX_API_KEY", &dotenv, ""),
            sandbox_api_url: get_str(
                "FALCON_SANDBOX_API_URL",
                &dotenv,
                "https://app.daytona.io/api",
            ),
            github_api_token: get_str("FALCON_GITHUB_API_TOKEN", &dotenv, ""),
            openai_api_key: get_str("FALCON_OPENAI_API_KEY", &dotenv, ""),
            openai_base_url: get_str(
                "FALCON_OPENAI_BASE_URL",
                &dotenv,
                "https://api.openai.com/v1",
            ),
            chat_model: get_str("FALCON_CHAT_MODEL", &dotenv, "gpt-4o"),
            max_file_size: get_u64("FALCON_MAX_FILE_SIZE", &dotenv, 512 * 1024),
            bind: get_str("FALCON_BIND", &dotenv, "127.0.0.1"),
            port: get_u16("FALCON_PORT", &dotenv, 8000),
        })
    }
}
