//! Batch channel testing: job model, task planning, concurrent execution.
//!
//! A test job expands into (channel, model) tasks ([`planner`]), which the
//! [`runner`] fans out through a bounded worker pool at a fixed dispatch rate.
//! The [`registry`] tracks which jobs are executing in this process.

pub mod planner;
pub mod registry;
pub mod retry;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::channel::Channel;
use crate::config::JobsConfig;

pub use self::registry::JobRegistry;
pub use self::retry::create_retry_job;
pub use self::runner::{JobRunner, RunnerSettings};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum JobError {
    #[error("test job {0} is already running")]
    AlreadyRunning(i64),

    #[error("test job {0} is not running")]
    NotRunning(i64),

    #[error("test job {0} not found")]
    NotFound(i64),

    #[error("no channels selected")]
    NoChannelsSelected,

    #[error("no channels found matching the job filters")]
    NoChannelsFound,

    #[error("no models to test for the selected channels")]
    NoTasksPlanned,

    #[error("invalid job options: {0}")]
    InvalidOptions(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

/// `PENDING -> RUNNING -> {SUCCESS, FAILED, CANCELED}`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "SUCCESS" => Some(JobStatus::Success),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELED" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Which of a channel's models to test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelScope {
    #[default]
    All,
    /// Only the channel's default test model.
    Default,
}

impl<'de> Deserialize<'de> for ModelScope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(match raw.as_deref().map(str::trim) {
            Some("default") => ModelScope::Default,
            _ => ModelScope::All,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    #[default]
    All,
    /// Only models listed in `target_models`.
    Selected,
}

impl<'de> Deserialize<'de> for TestMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(match raw.as_deref().map(str::trim) {
            Some("selected") => TestMode::Selected,
            _ => TestMode::All,
        })
    }
}

/// Filter configuration stored as the job's options blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestJobOptions {
    pub channel_ids: Vec<i64>,
    pub include_all: bool,
    pub include_disabled: bool,
    pub model_scope: ModelScope,
    pub model_whitelist: Vec<String>,
    pub model_blacklist: Vec<String>,
    pub use_channel_default: bool,
    pub test_mode: TestMode,
    pub target_models: Vec<String>,
    pub parent_job_id: i64,
    pub is_retry_job: bool,
}

impl TestJobOptions {
    pub fn is_retry_of_parent(&self) -> bool {
        self.is_retry_job && self.parent_job_id > 0
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// One persisted batch-test request.
#[derive(Debug, Clone, Serialize)]
pub struct TestJob {
    pub id: i64,
    pub status: JobStatus,
    pub requester_id: i64,
    pub total_channels: i64,
    pub total_models: i64,
    pub completed_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub cancel_count: i64,
    pub concurrency: i64,
    pub interval_ms: i64,
    pub retry_limit: i64,
    pub options_json: String,
    pub error_message: String,
    pub current_channel: String,
    pub current_model: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TestJob {
    pub fn options(&self) -> Result<TestJobOptions, JobError> {
        if self.options_json.trim().is_empty() {
            return Ok(TestJobOptions::default());
        }
        Ok(serde_json::from_str(&self.options_json)?)
    }
}

/// Fields for creating a PENDING job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewTestJob {
    pub requester_id: i64,
    pub concurrency: i64,
    pub interval_ms: i64,
    pub retry_limit: i64,
    pub options: TestJobOptions,
}

impl NewTestJob {
    /// A job request whose unset knobs fall back to the configured defaults.
    pub fn with_defaults(
        defaults: &JobsConfig,
        requester_id: i64,
        concurrency: Option<i64>,
        interval_ms: Option<i64>,
        retry_limit: Option<i64>,
        options: TestJobOptions,
    ) -> Self {
        Self {
            requester_id,
            concurrency: concurrency.unwrap_or(defaults.default_concurrency),
            interval_ms: interval_ms.unwrap_or(defaults.default_interval_ms),
            retry_limit: retry_limit.unwrap_or(defaults.default_retry_limit),
            options,
        }
    }
}

/// Partial update of a job row. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub total_channels: Option<i64>,
    pub total_models: Option<i64>,
    pub concurrency: Option<i64>,
    pub interval_ms: Option<i64>,
    pub retry_limit: Option<i64>,
    pub error_message: Option<String>,
    pub current_channel: Option<String>,
    pub current_model: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Effective execution knobs after clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSettings {
    pub concurrency: usize,
    pub interval: Duration,
    pub retry_limit: u32,
}

impl JobSettings {
    pub const MIN_CONCURRENCY: i64 = 2;
    pub const MAX_CONCURRENCY: i64 = 16;
    pub const MIN_INTERVAL_MS: i64 = 100;
    pub const MAX_INTERVAL_MS: i64 = 5000;
    pub const DEFAULT_INTERVAL_MS: i64 = 200;
    pub const MAX_RETRY_LIMIT: i64 = 5;

    /// Non-positive concurrency/interval fall back to defaults; everything is
    /// then clamped to its allowed range.
    pub fn resolve(concurrency: i64, interval_ms: i64, retry_limit: i64) -> Self {
        let concurrency = if concurrency <= 0 {
            Self::MIN_CONCURRENCY
        } else {
            concurrency.clamp(Self::MIN_CONCURRENCY, Self::MAX_CONCURRENCY)
        };
        let interval_ms = if interval_ms <= 0 {
            Self::DEFAULT_INTERVAL_MS
        } else {
            interval_ms.clamp(Self::MIN_INTERVAL_MS, Self::MAX_INTERVAL_MS)
        };
        let retry_limit = retry_limit.clamp(0, Self::MAX_RETRY_LIMIT);

        Self {
            concurrency: concurrency as usize,
            interval: Duration::from_millis(interval_ms as u64),
            retry_limit: retry_limit as u32,
        }
    }

    pub fn for_job(job: &TestJob) -> Self {
        Self::resolve(job.concurrency, job.interval_ms, job.retry_limit)
    }
}

// ---------------------------------------------------------------------------
// Tasks and results
// ---------------------------------------------------------------------------

/// One (channel, model) pair to probe.
#[derive(Debug, Clone)]
pub struct TestTask {
    pub channel: Arc<Channel>,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failed,
    /// Soft-deleted; excluded from job statistics.
    Deleted,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "SUCCESS",
            ResultStatus::Failed => "FAILED",
            ResultStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SUCCESS" => ResultStatus::Success,
            "DELETED" => ResultStatus::Deleted,
            _ => ResultStatus::Failed,
        }
    }
}

/// A persisted task outcome.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub id: i64,
    pub job_id: i64,
    pub channel_id: i64,
    pub channel_name: String,
    pub model_name: String,
    pub success: bool,
    pub status: ResultStatus,
    pub duration_ms: i64,
    pub retry_count: i64,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

/// A task outcome about to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTestResult {
    pub job_id: i64,
    pub channel_id: i64,
    pub channel_name: String,
    pub model_name: String,
    pub success: bool,
    pub duration_ms: i64,
    pub retry_count: i64,
    pub error_message: String,
}

impl NewTestResult {
    pub fn success(job_id: i64, task: &TestTask, elapsed: Duration, retry_count: u32) -> Self {
        Self {
            job_id,
            channel_id: task.channel.id,
            channel_name: task.channel.name.clone(),
            model_name: task.model.clone(),
            success: true,
            duration_ms: elapsed.as_millis() as i64,
            retry_count: retry_count as i64,
            error_message: String::new(),
        }
    }

    pub fn failed(
        job_id: i64,
        task: &TestTask,
        elapsed: Duration,
        retry_count: u32,
        error_message: String,
    ) -> Self {
        Self {
            success: false,
            error_message,
            ..Self::success(job_id, task, elapsed, retry_count)
        }
    }

    pub fn status(&self) -> ResultStatus {
        if self.success {
            ResultStatus::Success
        } else {
            ResultStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_and_clamps() {
        let s = JobSettings::resolve(0, 0, 0);
        assert_eq!(s.concurrency, 2);
        assert_eq!(s.interval, Duration::from_millis(200));
        assert_eq!(s.retry_limit, 0);

        let s = JobSettings::resolve(64, 10, 9);
        assert_eq!(s.concurrency, 16);
        assert_eq!(s.interval, Duration::from_millis(100));
        assert_eq!(s.retry_limit, 5);

        let s = JobSettings::resolve(1, 60_000, -3);
        assert_eq!(s.concurrency, 2);
        assert_eq!(s.interval, Duration::from_millis(5000));
        assert_eq!(s.retry_limit, 0);
    }

    #[test]
    fn test_options_parse_with_unknown_scope() {
        let opts: TestJobOptions = serde_json::from_str(
            r#"{"channel_ids":[3,1],"model_scope":"everything","test_mode":"selected","target_models":["a"]}"#,
        )
        .unwrap();
        assert_eq!(opts.channel_ids, vec![3, 1]);
        assert_eq!(opts.model_scope, ModelScope::All);
        assert_eq!(opts.test_mode, TestMode::Selected);
        assert!(!opts.include_all);

        let opts: TestJobOptions = serde_json::from_str(r#"{"model_scope":"default","test_mode":null}"#).unwrap();
        assert_eq!(opts.model_scope, ModelScope::Default);
        assert_eq!(opts.test_mode, TestMode::All);
    }

    #[test]
    fn test_options_serialize_lowercase() {
        let opts = TestJobOptions {
            model_scope: ModelScope::Default,
            test_mode: TestMode::Selected,
            ..Default::default()
        };
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json["model_scope"], "default");
        assert_eq!(json["test_mode"], "selected");
    }

    #[test]
    fn test_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert_eq!(JobStatus::parse("FAILED"), Some(JobStatus::Failed));
        assert_eq!(JobStatus::parse("nope"), None);
    }
}
