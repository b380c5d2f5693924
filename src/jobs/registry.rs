//! In-process registry of executing jobs.
//!
//! Keyed by job id, each entry holds the job's cancellation token. An entry
//! exists exactly while a runner task for that job is alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::jobs::runner::MSG_RESTART_INTERRUPTED;
use crate::jobs::{JobError, JobRunner};

/// Cloneable handle over the registry state.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    runner: JobRunner,
    running: Mutex<HashMap<i64, CancellationToken>>,
    runners: TaskTracker,
    recovered: OnceCell<usize>,
}

impl RegistryInner {
    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<i64, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the registry entry when the runner task ends, however it ends.
struct RunningGuard {
    inner: Arc<RegistryInner>,
    job_id: i64,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.running().remove(&self.job_id);
    }
}

impl JobRegistry {
    pub fn new(runner: JobRunner) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                runner,
                running: Mutex::new(HashMap::new()),
                runners: TaskTracker::new(),
                recovered: OnceCell::new(),
            }),
        }
    }

    pub fn runner(&self) -> &JobRunner {
        &self.inner.runner
    }

    /// Run the startup recovery sweep once: every job still RUNNING in the
    /// database was orphaned by a previous process and is force-failed.
    /// Later calls return the first sweep's count.
    ///
    /// Only the process that owns the database (the daemon) may call this;
    /// a sweep from a second process would fail jobs the owner is executing.
    pub async fn initialize(&self) -> Result<usize, JobError> {
        let swept = self
            .inner
            .recovered
            .get_or_try_init(|| async {
                let swept = self
                    .inner
                    .runner
                    .jobs()
                    .recover_orphaned_jobs(MSG_RESTART_INTERRUPTED)?;
                if swept > 0 {
                    warn!(swept, "Failed test jobs orphaned by a previous run");
                } else {
                    info!("Job registry initialized");
                }
                Ok::<_, JobError>(swept)
            })
            .await?;
        Ok(*swept)
    }

    /// Launch the runner for `job_id` in the background.
    pub fn submit(&self, job_id: i64) -> Result<JoinHandle<()>, JobError> {
        let cancel = CancellationToken::new();
        {
            let mut running = self.inner.running();
            if running.contains_key(&job_id) {
                return Err(JobError::AlreadyRunning(job_id));
            }
            running.insert(job_id, cancel.clone());
        }

        let guard = RunningGuard {
            inner: Arc::clone(&self.inner),
            job_id,
        };
        let runner = self.inner.runner.clone();
        info!(job_id, "Test job submitted");
        Ok(self.inner.runners.spawn(async move {
            let _guard = guard;
            runner.run(job_id, cancel).await;
        }))
    }

    /// Signal cancellation. The runner observes it at its next blocking point.
    pub fn cancel(&self, job_id: i64) -> Result<(), JobError> {
        let running = self.inner.running();
        let token = running.get(&job_id).ok_or(JobError::NotRunning(job_id))?;
        token.cancel();
        info!(job_id, "Test job cancellation requested");
        Ok(())
    }

    /// Cancel every executing job. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let running = self.inner.running();
        for token in running.values() {
            token.cancel();
        }
        running.len()
    }

    /// Cancel every executing job and wait until each runner has written its
    /// terminal status.
    pub async fn shutdown(&self) -> usize {
        let canceled = self.cancel_all();
        self.inner.runners.close();
        self.inner.runners.wait().await;
        // Reopen so a registry that outlives shutdown can still be waited on.
        self.inner.runners.reopen();
        canceled
    }

    pub fn is_running(&self, job_id: i64) -> bool {
        self.inner.running().contains_key(&job_id)
    }

    pub fn running_jobs(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.running().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
