use crate::jobs::{JobStatus, JobUpdate, NewTestJob, TestJob};
use crate::storage::{now_rfc3339, parse_timestamp, Pool};
use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Row};

pub(crate) const JOB_COLUMNS: &str = "id, status, requester_id, total_channels, total_models,
    completed_count, success_count, failure_count, cancel_count,
    concurrency, interval_ms, retry_limit, options_json, error_message,
    current_channel, current_model, created_at, started_at, finished_at, updated_at";

/// Durable test jobs and their results.
///
/// Counter updates are single `col = col + n` statements so concurrent
/// workers never lose increments.
#[derive(Clone)]
pub struct JobStore {
    pub(crate) pool: Pool,
}

impl JobStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert a PENDING job and return its id.
    pub fn create_job(&self, job: &NewTestJob) -> Result<i64> {
        let options_json = serde_json::to_string(&job.options)?;
        let now = now_rfc3339();
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO test_jobs (status, requester_id, concurrency, interval_ms, retry_limit,
                                    options_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                JobStatus::Pending.as_str(),
                job.requester_id,
                job.concurrency,
                job.interval_ms,
                job.retry_limit,
                options_json,
                now,
            ],
        )
        .context("Failed to insert test job")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<TestJob>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM test_jobs WHERE id = ?1"))?;
        let mut rows = stmt.query_map([id], map_job)?;
        Ok(rows.next().transpose()?)
    }

    /// Newest first.
    pub fn list_jobs(&self, limit: usize, offset: usize) -> Result<Vec<TestJob>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM test_jobs ORDER BY id DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], map_job)?;
        let mut jobs = Vec::new();
        for r in rows {
            jobs.push(r?);
        }
        Ok(jobs)
    }

    /// Apply the set fields of `update`. Always bumps `updated_at`.
    pub fn update_job(&self, id: i64, update: &JobUpdate) -> Result<()> {
        if self.apply_update(id, update, None)? == 0 {
            anyhow::bail!("Test job {} not found", id);
        }
        Ok(())
    }

    /// Apply `update` only while the job is still PENDING. Returns false when
    /// another runner (possibly in another process) got there first.
    pub fn claim_job(&self, id: i64, update: &JobUpdate) -> Result<bool> {
        Ok(self.apply_update(id, update, Some(JobStatus::Pending))? > 0)
    }

    fn apply_update(
        &self,
        id: i64,
        update: &JobUpdate,
        expected: Option<JobStatus>,
    ) -> Result<usize> {
        let mut sets: Vec<(&str, Value)> = Vec::new();
        if let Some(status) = update.status {
            sets.push(("status", Value::Text(status.as_str().to_string())));
        }
        if let Some(v) = update.total_channels {
            sets.push(("total_channels", Value::Integer(v)));
        }
        if let Some(v) = update.total_models {
            sets.push(("total_models", Value::Integer(v)));
        }
        if let Some(v) = update.concurrency {
            sets.push(("concurrency", Value::Integer(v)));
        }
        if let Some(v) = update.interval_ms {
            sets.push(("interval_ms", Value::Integer(v)));
        }
        if let Some(v) = update.retry_limit {
            sets.push(("retry_limit", Value::Integer(v)));
        }
        if let Some(v) = &update.error_message {
            sets.push(("error_message", Value::Text(v.clone())));
        }
        if let Some(v) = &update.current_channel {
            sets.push(("current_channel", Value::Text(v.clone())));
        }
        if let Some(v) = &update.current_model {
            sets.push(("current_model", Value::Text(v.clone())));
        }
        if let Some(v) = update.started_at {
            sets.push(("started_at", Value::Text(v.to_rfc3339())));
        }
        if let Some(v) = update.finished_at {
            sets.push(("finished_at", Value::Text(v.to_rfc3339())));
        }
        sets.push(("updated_at", Value::Text(now_rfc3339())));

        let assignments = sets
            .iter()
            .enumerate()
            .map(|(i, (col, _))| format!("{} = ?{}", col, i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("UPDATE test_jobs SET {} WHERE id = ?1", assignments);

        let mut args = vec![Value::Integer(id)];
        let guard = sets.len() + 2;
        args.extend(sets.into_iter().map(|(_, v)| v));
        if let Some(status) = expected {
            sql.push_str(&format!(" AND status = ?{}", guard));
            args.push(Value::Text(status.as_str().to_string()));
        }

        let conn = self.pool.get()?;
        Ok(conn.execute(&sql, params_from_iter(args.iter()))?)
    }

    /// Move a non-terminal job to a terminal `status`.
    ///
    /// An empty `message` leaves `error_message` untouched. Returns false when
    /// the job was already terminal (or missing).
    pub fn finalize_job(&self, id: i64, status: JobStatus, message: &str) -> Result<bool> {
        let now = now_rfc3339();
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE test_jobs
             SET status = ?2,
                 error_message = CASE WHEN ?3 = '' THEN error_message ELSE ?3 END,
                 finished_at = ?4,
                 updated_at = ?4
             WHERE id = ?1 AND status IN ('PENDING', 'RUNNING')",
            params![id, status.as_str(), message, now],
        )?;
        Ok(changed > 0)
    }

    /// One task finished: bump completed and success or failure, move the
    /// progress pointers to the pair that just finished.
    ///
    /// Takes the channel name rather than its id: the name is what the
    /// `current_channel` progress pointer shows, and results already carry
    /// the id.
    pub fn increment_job_counters(
        &self,
        job_id: i64,
        channel_name: &str,
        model_name: &str,
        success: bool,
    ) -> Result<()> {
        let (ok, failed) = if success { (1, 0) } else { (0, 1) };
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE test_jobs
             SET completed_count = completed_count + 1,
                 success_count = success_count + ?2,
                 failure_count = failure_count + ?3,
                 current_channel = ?4,
                 current_model = ?5,
                 updated_at = ?6
             WHERE id = ?1",
            params![job_id, ok, failed, channel_name, model_name, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn increase_job_cancel_count(&self, job_id: i64, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE test_jobs SET cancel_count = cancel_count + ?2, updated_at = ?3 WHERE id = ?1",
            params![job_id, n as i64, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Force every RUNNING job to FAILED with `message`. Returns how many were swept.
    pub fn recover_orphaned_jobs(&self, message: &str) -> Result<usize> {
        let now = now_rfc3339();
        let conn = self.pool.get()?;
        let changed = conn
            .execute(
                "UPDATE test_jobs
                 SET status = 'FAILED', error_message = ?1, finished_at = ?2, updated_at = ?2
                 WHERE status = 'RUNNING'",
                params![message, now],
            )
            .context("Failed to sweep orphaned test jobs")?;
        Ok(changed)
    }
}

fn map_job(row: &Row<'_>) -> rusqlite::Result<TestJob> {
    let status_str: String = row.get(1)?;
    let status = JobStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown job status '{}'", status_str).into(),
        )
    })?;

    Ok(TestJob {
        id: row.get(0)?,
        status,
        requester_id: row.get(2)?,
        total_channels: row.get(3)?,
        total_models: row.get(4)?,
        completed_count: row.get(5)?,
        success_count: row.get(6)?,
        failure_count: row.get(7)?,
        cancel_count: row.get(8)?,
        concurrency: row.get(9)?,
        interval_ms: row.get(10)?,
        retry_limit: row.get(11)?,
        options_json: row.get(12)?,
        error_message: row.get(13)?,
        current_channel: row.get(14)?,
        current_model: row.get(15)?,
        created_at: parse_timestamp(&row.get::<_, String>(16)?),
        started_at: row.get::<_, Option<String>>(17)?.as_deref().map(parse_timestamp),
        finished_at: row.get::<_, Option<String>>(18)?.as_deref().map(parse_timestamp),
        updated_at: parse_timestamp(&row.get::<_, String>(19)?),
    })
}
