use thiserror::Error;

/// Error taxonomy shared across the pipeline, services and HTTP surface.
///
/// `Acquisition`, `SourceHost`, `Agent` and `AgentTimeout` are
/// pipeline-internal and retryable: the orchestrator re-queues the job until
/// attempts are exhausted. `Execution` is a tool-dispatch failure and is
/// surfaced into the agent transcript as text, never as a crash.
#[derive(Debug, Error)]
pub enum FalconError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("sandbox acquisition failed: {0}")]
    Acquisition(String),

    #[error("source host error: {0}")]
    SourceHost(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("agent timed out after {0}s")]
    AgentTimeout(u64),

    #[error("tool execution error: {0}")]
    Execution(String),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for FalconError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Fatal(e.into())
    }
}

impl From<std::io::Error> for FalconError {
    fn from(e: std::io::Error) -> Self {
        Self::Fatal(e.into())
    }
}
