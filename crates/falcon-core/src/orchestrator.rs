//! Durable bounded-concurrency job queue.
//!
//! Jobs live in the store; workers claim them with a single atomic UPDATE
//! so exactly one worker ever owns a job. On startup, jobs orphaned in
//! `running` by a crash are reset to `queued`. On shutdown every in-flight
//! task is cancelled; local sandboxes are reclaimed by their drop guards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    agent::AgentRunner,
    bus::EventBus,
    config::Config,
    db::Db,
    error::FalconError,
    github::GitHubClient,
    pipeline::WikiPipeline,
    types::{Job, WikiEvent},
};

pub struct JobOrchestrator {
    db: Arc<Db>,
    config: Arc<Config>,
    bus: Arc<EventBus>,
    runner: Arc<dyn AgentRunner>,
    github: Arc<GitHubClient>,
    semaphore: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    running: Arc<AtomicBool>,
    worker_id: String,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobOrchestrator {
    pub fn new(
        db: Arc<Db>,
        config: Arc<Config>,
        bus: Arc<EventBus>,
        runner: Arc<dyn AgentRunner>,
        github: Arc<GitHubClient>,
    ) -> Self {
        let max_concurrent = config.max_concurrent_jobs;
        Self {
            db,
            config,
            bus,
            runner,
            github,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            poll_handle: Mutex::new(None),
        }
    }

    /// Crash recovery plus the poll loop. Called once at startup.
    pub async fn start(self: &Arc<Self>) -> Result<(), FalconError> {
        let reclaimed = self.db.reset_running_jobs()?;
        if reclaimed > 0 {
            info!("crash recovery: reset {reclaimed} running jobs back to queued");
        }

        self.running.store(true, Ordering::Release);
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move { orchestrator.poll_loop().await });
        *self.poll_handle.lock().await = Some(handle);

        info!(
            max_concurrent = self.config.max_concurrent_jobs,
            "job orchestrator started"
        );
        Ok(())
    }

    /// Stop polling, cancel every in-flight job task and await termination.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        let handles: Vec<(String, JoinHandle<()>)> =
            self.active.lock().await.drain().collect();
        for (job_id, handle) in handles {
            handle.abort();
            let _ = handle.await;
            info!(job_id, "cancelled in-flight job");
        }
        info!("job orchestrator stopped");
    }

    pub async fn active_jobs(&self) -> usize {
        self.active.lock().await.len()
    }

    async fn poll_loop(self: Arc<Self>) {
        let poll_interval = Duration::from_secs_f64(self.config.job_poll_interval_seconds);

        while self.running.load(Ordering::Acquire) {
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                break;
            };

            let claimed = match self.db.claim_next_job(&self.worker_id) {
                Ok(job) => job,
                Err(e) => {
                    error!("job claim failed: {e}");
                    None
                }
            };

            match claimed {
                Some(job) => {
                    let orchestrator = Arc::clone(&self);
                    let job_id = job.id.clone();
                    let handle = tokio::spawn(async move {
                        orchestrator.run_job(job, permit).await;
                    });
                    self.active.lock().await.insert(job_id, handle);
                }
                None => {
                    drop(permit);
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    async fn run_job(self: &Arc<Self>, job: Job, _permit: tokio::sync::OwnedSemaphorePermit) {
        info!(job_id = %job.id, wiki_id = %job.wiki_id, attempt = job.attempts, "starting job");

        let pipeline = WikiPipeline::new(
            Arc::clone(&self.db),
            Arc::clone(&self.config),
            Arc::clone(&self.bus),
            Arc::clone(&self.runner),
            Arc::clone(&self.github),
        );

        match pipeline.execute(&job.wiki_id).await {
            Ok(()) => {
                if let Err(e) = self.db.complete_job(&job.id) {
                    error!(job_id = %job.id, "complete_job: {e}");
                }
                info!(job_id = %job.id, "job completed");
            }
            Err(e) => self.handle_failure(&job, &e),
        }

        self.active.lock().await.remove(&job.id);
    }

    /// Retry silently while attempts remain; on exhaustion fail the job and
    /// its wiki, and emit a terminal error event for any subscribers.
    fn handle_failure(&self, job: &Job, err: &FalconError) {
        let message = err.to_string();
        warn!(job_id = %job.id, attempt = job.attempts, "job failed: {message}");

        if job.attempts < job.max_attempts {
            if let Err(e) = self.db.retry_job(&job.id, &message) {
                error!(job_id = %job.id, "retry_job: {e}");
            }
            return;
        }

        if let Err(e) = self.db.fail_job(&job.id, &message) {
            error!(job_id = %job.id, "fail_job: {e}");
        }
        if let Err(e) = self.db.mark_wiki_failed(&job.wiki_id, &message) {
            error!(wiki_id = %job.wiki_id, "mark_wiki_failed: {e}");
        }
        self.bus
            .publish(&job.wiki_id, WikiEvent::Error { message });
    }
}
