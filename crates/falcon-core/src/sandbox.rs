//! Scoped acquisition of a working directory holding a shallow clone.
//!
//! Two backends behind one contract: a local tempdir plus the external git
//! client (development), and a remote sandbox provider (production). Both
//! yield a `Sandbox` that the pipeline must hand back to `destroy` on every
//! exit path; the local tempdir doubles as a drop guard so a panic still
//! reclaims the directory.

use std::path::PathBuf;
use std::process::Stdio;

use serde_json::json;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::FalconError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Local,
    Remote,
}

#[derive(Debug)]
pub struct Sandbox {
    pub working_dir: PathBuf,
    pub kind: SandboxKind,
    /// Keeps the local scratch directory alive until destroy (or drop).
    scratch: Option<TempDir>,
    remote_id: Option<String>,
}

pub struct SandboxManager {
    use_remote: bool,
    api_key: String,
    api_url: String,
    client: reqwest::Client,
}

impl SandboxManager {
    pub fn from_config(config: &Config) -> Self {
        Self {
            use_remote: config.use_remote_sandbox,
            api_key: config.sandbox_api_key.clone(),
            api_url: config.sandbox_api_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn create(&self, github_url: &str, branch: &str) -> Result<Sandbox, FalconError> {
        if self.use_remote {
            self.create_remote(github_url, branch).await
        } else {
            self.create_local(github_url, branch).await
        }
    }

    pub async fn destroy(&self, sandbox: Sandbox) {
        match sandbox.kind {
            SandboxKind::Local => {
                if let Some(scratch) = sandbox.scratch {
                    let path = scratch.path().display().to_string();
                    if let Err(e) = scratch.close() {
                        warn!("failed to remove local sandbox {path}: {e}");
                    } else {
                        info!("cleaned up local sandbox {path}");
                    }
                }
            }
            SandboxKind::Remote => {
                let Some(id) = sandbox.remote_id else { return };
                // Destruction is best-effort; a leaked remote sandbox
                // auto-stops on the provider side.
                let result = self
                    .client
                    .delete(format!("{}/sandboxes/{id}", self.api_url))
                    .bearer_auth(&self.api_key)
                    .send()
                    .await;
                match result {
                    Ok(resp) if resp.status().is_success() => {
                        info!("destroyed remote sandbox {id}");
                    }
                    Ok(resp) => warn!("remote sandbox {id} destroy returned {}", resp.status()),
                    Err(e) => warn!("remote sandbox {id} destroy failed: {e}"),
                }
            }
        }
    }

    async fn create_local(&self, github_url: &str, branch: &str) -> Result<Sandbox, FalconError> {
        let scratch = tempfile::Builder::new()
            .prefix("falcon_")
            .tempdir()
            .map_err(|e| FalconError::Acquisition(format!("tempdir: {e}")))?;
        let repo_dir = scratch.path().join("repo");

        let output = Command::new("git")
            .args(["clone", "--depth=1", "-b", branch, github_url])
            .arg(&repo_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| FalconError::Acquisition(format!("failed to spawn git: {e}")))?;

        if !output.status.success() {
            // TempDir drop removes the partially created directory.
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(FalconError::Acquisition(format!(
                "git clone failed: {}",
                stderr.trim()
            )));
        }

        info!("cloned {github_url} ({branch}) into {}", repo_dir.display());
        Ok(Sandbox {
            working_dir: repo_dir,
            kind: SandboxKind::Local,
            scratch: Some(scratch),
            remote_id: None,
        })
    }

    async fn create_remote(&self, github_url: &str, branch: &str) -> Result<Sandbox, FalconError> {
        let resp = self
            .client
            .post(format!("{}/sandboxes", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "language": "python", "auto_stop_interval": 30 }))
            .send()
            .await
            .map_err(|e| FalconError::Acquisition(format!("sandbox create request: {e}")))?;
        if !resp.status().is_success() {
            return Err(FalconError::Acquisition(format!(
                "sandbox provider returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FalconError::Acquisition(format!("sandbox create response: {e}")))?;
        let id = body["id"]
            .as_str()
            .ok_or_else(|| FalconError::Acquisition("sandbox response missing id".into()))?
            .to_string();

        let exec = self
            .client
            .post(format!("{}/sandboxes/{id}/exec", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "command": format!("git clone --depth=1 -b {branch} {github_url} /workspace/repo"),
            }))
            .send()
            .await
            .map_err(|e| FalconError::Acquisition(format!("sandbox clone exec: {e}")))?;
        if !exec.status().is_success() {
            let failed = Sandbox {
                working_dir: PathBuf::from("/workspace/repo"),
                kind: SandboxKind::Remote,
                scratch: None,
                remote_id: Some(id.clone()),
            };
            self.destroy(failed).await;
            return Err(FalconError::Acquisition(format!(
                "clone in remote sandbox returned {}",
                exec.status()
            )));
        }

        info!("cloned {github_url} ({branch}) in remote sandbox {id}");
        Ok(Sandbox {
            working_dir: PathBuf::from("/workspace/repo"),
            kind: SandboxKind::Remote,
            scratch: None,
            remote_id: Some(id),
        })
    }
}
