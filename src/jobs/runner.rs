//! Concurrent execution of one test job.
//!
//! One dispatcher feeds tasks to `concurrency` workers through a one-slot
//! channel, releasing at most one task per dispatch interval. Workers run the
//! synchronous retry loop; rate-limited (429) tasks are handed to a tracked
//! background retry so the pool keeps moving. Every planned task ends up
//! either processed (a result row) or skipped (counted as canceled).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelTester, ProbeError};
use crate::config::JobsConfig;
use crate::jobs::planner::plan_job;
use crate::jobs::{JobSettings, JobStatus, JobUpdate, NewTestResult, TestJobOptions, TestTask};
use crate::storage::{ChannelStore, JobStore};

pub const MSG_CANCELED: &str = "task was canceled by user";
pub const MSG_NOTHING_EXECUTED: &str = "no model test executed successfully";
pub const MSG_INCOMPLETE: &str = "some tasks did not complete, please retry";
pub const MSG_RESTART_INTERRUPTED: &str = "service restart interrupted the task";

/// Backoff policy for rate-limited probes.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub rate_limit_backoff: Duration,
    pub rate_limit_max_retries: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            rate_limit_backoff: Duration::from_secs(60),
            rate_limit_max_retries: 3,
        }
    }
}

impl RunnerSettings {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            rate_limit_backoff: Duration::from_secs(config.rate_limit_backoff_sec),
            rate_limit_max_retries: config.rate_limit_max_retries,
        }
    }
}

/// Loads, plans, executes and finalizes test jobs.
#[derive(Clone)]
pub struct JobRunner {
    jobs: JobStore,
    channels: ChannelStore,
    tester: Arc<dyn ChannelTester>,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        jobs: JobStore,
        channels: ChannelStore,
        tester: Arc<dyn ChannelTester>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            jobs,
            channels,
            tester,
            settings,
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn channels(&self) -> &ChannelStore {
        &self.channels
    }

    /// Execute job `job_id` to a terminal state. Never returns an error: the
    /// outcome is the job row's final status.
    pub async fn run(&self, job_id: i64, cancel: CancellationToken) {
        let job = match self.jobs.get_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id, "Test job not found, nothing to run");
                return;
            }
            Err(e) => {
                error!(job_id, "Failed to load test job: {:#}", e);
                return;
            }
        };

        if job.status.is_terminal() {
            warn!(job_id, status = %job.status, "Test job already finished, nothing to run");
            return;
        }
        if job.status != JobStatus::Pending {
            warn!(job_id, status = %job.status, "Test job is not pending, refusing to run");
            self.finalize(
                job_id,
                JobStatus::Failed,
                &format!("abnormal job state: expected PENDING, found {}", job.status),
            );
            return;
        }

        let options = match job.options() {
            Ok(options) => options,
            Err(e) => {
                self.finalize(job_id, JobStatus::Failed, &e.to_string());
                return;
            }
        };

        let (channels, tasks) = match plan_job(&self.channels, &options) {
            Ok(planned) => planned,
            Err(e) => {
                warn!(job_id, "Test job planning failed: {}", e);
                self.finalize(job_id, JobStatus::Failed, &e.to_string());
                self.refresh_parent(&options);
                return;
            }
        };

        let settings = JobSettings::for_job(&job);
        let total = tasks.len() as u64;
        let started = JobUpdate {
            status: Some(JobStatus::Running),
            total_channels: Some(channels.len() as i64),
            total_models: Some(total as i64),
            concurrency: Some(settings.concurrency as i64),
            interval_ms: Some(settings.interval.as_millis() as i64),
            retry_limit: Some(settings.retry_limit as i64),
            error_message: Some(String::new()),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        match self.jobs.claim_job(job_id, &started) {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id, "Test job was claimed by another runner");
                return;
            }
            Err(e) => {
                error!(job_id, "Failed to mark test job running: {:#}", e);
                self.finalize(job_id, JobStatus::Failed, &format!("failed to start: {}", e));
                return;
            }
        }

        info!(
            job_id,
            channels = channels.len(),
            tasks = total,
            concurrency = settings.concurrency,
            interval_ms = settings.interval.as_millis() as u64,
            retry_limit = settings.retry_limit,
            "Test job started"
        );

        let execution = Arc::new(JobExecution {
            job_id,
            settings,
            backoff: self.settings.clone(),
            jobs: self.jobs.clone(),
            tester: Arc::clone(&self.tester),
            cancel,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            retries: TaskTracker::new(),
        });
        execution.execute(tasks).await;

        let canceled = execution.cancel.is_cancelled();
        let processed = execution.processed.load(Ordering::SeqCst);
        let failed = execution.failed.load(Ordering::SeqCst);
        let skipped = execution.skipped.load(Ordering::SeqCst);
        let (status, message) = final_status(canceled, processed, failed, skipped, total);

        info!(
            job_id,
            status = %status,
            processed,
            failed,
            skipped,
            total,
            "Test job finished"
        );
        self.finalize(job_id, status, &message);
        self.refresh_parent(&options);
    }

    fn finalize(&self, job_id: i64, status: JobStatus, message: &str) {
        match self.jobs.finalize_job(job_id, status, message) {
            Ok(true) => {}
            Ok(false) => warn!(job_id, status = %status, "Test job was already terminal"),
            Err(e) => error!(job_id, "Failed to finalize test job: {:#}", e),
        }
    }

    fn refresh_parent(&self, options: &TestJobOptions) {
        if !options.is_retry_of_parent() {
            return;
        }
        if let Err(e) = self.jobs.refresh_job_stats(options.parent_job_id) {
            error!(parent_job_id = options.parent_job_id, "Failed to refresh parent job stats: {:#}", e);
        }
    }
}

/// Terminal status and message from the execution tallies.
pub fn final_status(
    canceled: bool,
    processed: u64,
    failed: u64,
    skipped: u64,
    total: u64,
) -> (JobStatus, String) {
    if canceled {
        return (JobStatus::Canceled, MSG_CANCELED.to_string());
    }
    if processed == 0 {
        return (JobStatus::Failed, MSG_NOTHING_EXECUTED.to_string());
    }
    // Every task ends processed or skipped; falling short means a worker
    // died mid-task.
    if processed + skipped < total {
        return (JobStatus::Failed, MSG_INCOMPLETE.to_string());
    }
    let message = if failed > 0 {
        format!("{} of {} model tests failed", failed, total)
    } else {
        String::new()
    };
    (JobStatus::Success, message)
}

/// What a worker's attempt loop produced for one task.
#[derive(Debug)]
enum TaskOutcome {
    Finished(NewTestResult),
    /// Rate limited; the background retry owns the task now.
    Deferred,
    Canceled,
}

/// Runtime state of one executing job, shared by dispatcher, workers and
/// background retries.
struct JobExecution {
    job_id: i64,
    settings: JobSettings,
    backoff: RunnerSettings,
    jobs: JobStore,
    tester: Arc<dyn ChannelTester>,
    cancel: CancellationToken,
    processed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    retries: TaskTracker,
}

impl JobExecution {
    /// Returns once workers, dispatcher and every background retry are done.
    async fn execute(self: &Arc<Self>, tasks: Vec<TestTask>) {
        let (tx, rx) = mpsc::channel::<TestTask>(1);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.settings.concurrency {
            let execution = Arc::clone(self);
            let rx = Arc::clone(&rx);
            workers.spawn(async move { execution.work(worker_id, rx).await });
        }
        drop(rx);

        let dispatcher = {
            let execution = Arc::clone(self);
            tokio::spawn(async move { execution.dispatch(tasks, tx).await })
        };

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(job_id = self.job_id, "Test worker crashed: {}", e);
            }
        }
        if let Err(e) = dispatcher.await {
            error!(job_id = self.job_id, "Test dispatcher crashed: {}", e);
        }

        self.retries.close();
        self.retries.wait().await;
    }

    async fn dispatch(&self, tasks: Vec<TestTask>, tx: mpsc::Sender<TestTask>) {
        let total = tasks.len();
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut dispatched = 0usize;
        for task in tasks {
            if dispatched == 0 {
                if self.cancel.is_cancelled() {
                    break;
                }
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                sent = tx.send(task) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
            dispatched += 1;
        }

        let undispatched = (total - dispatched) as u64;
        if undispatched > 0 {
            info!(job_id = self.job_id, undispatched, "Dispatch stopped early");
            self.record_skipped(undispatched);
        }
    }

    async fn work(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<Mutex<mpsc::Receiver<TestTask>>>,
    ) {
        loop {
            let next = { rx.lock().await.recv().await };
            let Some(task) = next else { break };

            if self.cancel.is_cancelled() {
                self.record_skipped(1);
                continue;
            }

            debug!(
                job_id = self.job_id,
                worker_id,
                channel_id = task.channel.id,
                model = %task.model,
                "Testing"
            );
            self.update_progress(&task);

            match self.attempt(&task).await {
                TaskOutcome::Finished(result) => self.record_result(&result),
                TaskOutcome::Deferred => {}
                TaskOutcome::Canceled => self.record_skipped(1),
            }
        }
    }

    /// Synchronous retry loop: up to `retry_limit + 1` probes, the dispatch
    /// interval apart.
    async fn attempt(self: &Arc<Self>, task: &TestTask) -> TaskOutcome {
        let retry_limit = self.settings.retry_limit;
        let mut last_elapsed = Duration::ZERO;
        let mut last_message = String::from("unknown error");

        for attempt in 0..=retry_limit {
            if self.cancel.is_cancelled() {
                return TaskOutcome::Canceled;
            }

            let report = self.tester.test(&task.channel, &task.model).await;
            let err = match report.outcome {
                Ok(()) => {
                    return TaskOutcome::Finished(NewTestResult::success(
                        self.job_id,
                        task,
                        report.elapsed,
                        attempt,
                    ))
                }
                Err(err) => err,
            };

            if err.is_rate_limited() {
                info!(
                    job_id = self.job_id,
                    channel_id = task.channel.id,
                    model = %task.model,
                    "Rate limited, deferring to background retry"
                );
                self.spawn_rate_limit_retry(task.clone(), attempt, report.elapsed, err);
                return TaskOutcome::Deferred;
            }

            warn!(
                job_id = self.job_id,
                channel_id = task.channel.id,
                model = %task.model,
                attempt,
                "Probe failed: {}",
                err
            );
            last_elapsed = report.elapsed;
            last_message = err.display_message();

            if attempt < retry_limit && !self.pause(self.settings.interval).await {
                return TaskOutcome::Canceled;
            }
        }

        TaskOutcome::Finished(NewTestResult::failed(
            self.job_id,
            task,
            last_elapsed,
            retry_limit,
            last_message,
        ))
    }

    fn spawn_rate_limit_retry(
        self: &Arc<Self>,
        task: TestTask,
        attempt: u32,
        elapsed: Duration,
        err: ProbeError,
    ) {
        let execution = Arc::clone(self);
        self.retries.spawn(async move {
            execution
                .retry_rate_limited(task, attempt, elapsed, err)
                .await
        });
    }

    /// Background retry of a 429'd task: fixed backoff before each probe,
    /// stop at the first non-429 outcome. Produces exactly one result unless
    /// the job is canceled while waiting.
    async fn retry_rate_limited(
        self: Arc<Self>,
        task: TestTask,
        attempt: u32,
        elapsed: Duration,
        err: ProbeError,
    ) {
        let mut last_elapsed = elapsed;
        let mut last_message = err.display_message();

        for retry in 1..=self.backoff.rate_limit_max_retries {
            if !self.pause(self.backoff.rate_limit_backoff).await {
                debug!(
                    job_id = self.job_id,
                    channel_id = task.channel.id,
                    model = %task.model,
                    "Rate limit retry abandoned"
                );
                self.record_skipped(1);
                return;
            }

            let report = self.tester.test(&task.channel, &task.model).await;
            match report.outcome {
                Ok(()) => {
                    self.record_result(&NewTestResult::success(
                        self.job_id,
                        &task,
                        report.elapsed,
                        attempt + retry,
                    ));
                    return;
                }
                Err(err) => {
                    last_elapsed = report.elapsed;
                    last_message = err.display_message();
                    if !err.is_rate_limited() {
                        break;
                    }
                }
            }
        }

        self.record_result(&NewTestResult::failed(
            self.job_id,
            &task,
            last_elapsed,
            self.settings.retry_limit,
            last_message,
        ));
    }

    /// Sleep unless canceled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn update_progress(&self, task: &TestTask) {
        let update = JobUpdate {
            current_channel: Some(task.channel.name.clone()),
            current_model: Some(task.model.clone()),
            ..Default::default()
        };
        if let Err(e) = self.jobs.update_job(self.job_id, &update) {
            warn!(job_id = self.job_id, "Failed to update progress: {:#}", e);
        }
    }

    fn record_result(&self, result: &NewTestResult) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        if !result.success {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        if let Err(e) = self.jobs.add_result(result) {
            error!(job_id = self.job_id, "Failed to save test result: {:#}", e);
        }
        if let Err(e) = self.jobs.increment_job_counters(
            self.job_id,
            &result.channel_name,
            &result.model_name,
            result.success,
        ) {
            error!(job_id = self.job_id, "Failed to update job counters: {:#}", e);
        }
    }

    fn record_skipped(&self, n: u64) {
        self.skipped.fetch_add(n, Ordering::SeqCst);
        if let Err(e) = self.jobs.increase_job_cancel_count(self.job_id, n) {
            error!(job_id = self.job_id, "Failed to update cancel count: {:#}", e);
        }
    }
}
