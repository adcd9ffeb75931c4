//! Runs the codex CLI as the wiki-generation agent backend.
//!
//! Codex is invoked in non-interactive mode with `--json`, producing a
//! line-oriented stream of structured events on stdout. Unparseable lines
//! are logged and skipped. On timeout the child is killed and the partial
//! event stream collected so far is returned with `exit_code = -1`.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use falcon_core::{agent::AgentRunner, config::Config, error::FalconError, types::AgentRun};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::event::extract_final_message;

pub struct CodexRunner {
    pub codex_bin: String,
    pub api_key: String,
}

impl CodexRunner {
    pub fn from_config(config: &Config) -> Self {
        Self {
            codex_bin: config.codex_bin.clone(),
            api_key: config.codex_api_key.clone(),
        }
    }
}

#[async_trait]
impl AgentRunner for CodexRunner {
    async fn run(
        &self,
        working_dir: &Path,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AgentRun, FalconError> {
        info!(
            working_dir = %working_dir.display(),
            prompt_len = prompt.len(),
            "spawning codex subprocess"
        );

        let mut cmd = Command::new(&self.codex_bin);
        cmd.args(["exec", "--json", "--full-auto", "--sandbox", "workspace-write"])
            .arg(prompt)
            .current_dir(working_dir)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !self.api_key.is_empty() {
            cmd.env("CODEX_API_KEY", &self.api_key);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| FalconError::Agent(format!("failed to spawn {}: {e}", self.codex_bin)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FalconError::Agent("failed to take codex stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FalconError::Agent("failed to take codex stderr".into()))?;

        // Shared so a timeout still yields whatever was collected.
        let events: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));

        let reader_events = Arc::clone(&events);
        let reader_stderr = Arc::clone(&stderr_buf);
        let reader = tokio::spawn(async move {
            let mut stdout_lines = BufReader::new(stdout).lines();
            let mut stderr_lines = BufReader::new(stderr).lines();
            let mut stdout_done = false;
            let mut stderr_done = false;

            while !stdout_done || !stderr_done {
                tokio::select! {
                    line = stdout_lines.next_line(), if !stdout_done => {
                        match line {
                            Ok(Some(l)) => {
                                let l = l.trim();
                                if l.is_empty() {
                                    continue;
                                }
                                match serde_json::from_str::<Value>(l) {
                                    Ok(event) => {
                                        reader_events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
                                    }
                                    Err(_) => warn!("non-JSON codex output: {l}"),
                                }
                            }
                            _ => stdout_done = true,
                        }
                    }
                    line = stderr_lines.next_line(), if !stderr_done => {
                        match line {
                            Ok(Some(l)) => {
                                let mut buf = reader_stderr.lock().unwrap_or_else(|e| e.into_inner());
                                buf.push_str(&l);
                                buf.push('\n');
                            }
                            _ => stderr_done = true,
                        }
                    }
                }
            }
        });

        let exit_code = match tokio::time::timeout(timeout, async {
            let _ = reader.await;
            child.wait().await
        })
        .await
        {
            Ok(Ok(status)) => status.code().unwrap_or(1),
            Ok(Err(e)) => {
                return Err(FalconError::Agent(format!("failed to wait for codex: {e}")));
            }
            Err(_elapsed) => {
                warn!(timeout_s = timeout.as_secs(), "codex timed out, killing child");
                let _ = child.start_kill();
                let _ = child.wait().await;
                let events = std::mem::take(
                    &mut *events.lock().unwrap_or_else(|e| e.into_inner()),
                );
                let final_message = extract_final_message(&events);
                return Ok(AgentRun {
                    exit_code: -1,
                    events,
                    final_message,
                    stderr: "Timeout".into(),
                });
            }
        };

        let events = std::mem::take(&mut *events.lock().unwrap_or_else(|e| e.into_inner()));
        let stderr = std::mem::take(&mut *stderr_buf.lock().unwrap_or_else(|e| e.into_inner()));
        let final_message = extract_final_message(&events);

        info!(
            exit_code,
            events = events.len(),
            output_len = final_message.len(),
            "codex subprocess finished"
        );

        Ok(AgentRun {
            exit_code,
            events,
            final_message,
            stderr,
        })
    }
}
