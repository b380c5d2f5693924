//! Per-task results and the statistics derived from them.

use crate::jobs::{NewTestResult, ResultStatus, TestResult};
use crate::storage::{now_rfc3339, parse_timestamp, JobStore};
use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Row};

const RESULT_COLUMNS: &str = "id, job_id, channel_id, channel_name, model_name, success, status,
    duration_ms, retry_count, error_message, created_at";

impl JobStore {
    pub fn add_result(&self, result: &NewTestResult) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO test_results (job_id, channel_id, channel_name, model_name, success, status,
                                       duration_ms, retry_count, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                result.job_id,
                result.channel_id,
                result.channel_name,
                result.model_name,
                result.success,
                result.status().as_str(),
                result.duration_ms,
                result.retry_count,
                result.error_message,
                now_rfc3339(),
            ],
        )
        .context("Failed to insert test result")?;
        Ok(conn.last_insert_rowid())
    }

    /// Results of a job in insertion order.
    pub fn list_results(&self, job_id: i64, include_deleted: bool) -> Result<Vec<TestResult>> {
        let sql = if include_deleted {
            format!("SELECT {RESULT_COLUMNS} FROM test_results WHERE job_id = ?1 ORDER BY id ASC")
        } else {
            format!(
                "SELECT {RESULT_COLUMNS} FROM test_results
                 WHERE job_id = ?1 AND status != 'DELETED' ORDER BY id ASC"
            )
        };
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([job_id], map_result)?;
        let mut results = Vec::new();
        for r in rows {
            results.push(r?);
        }
        Ok(results)
    }

    /// Soft-delete results of `job_id` and recompute the job's statistics.
    /// Ids belonging to other jobs are ignored.
    pub fn mark_results_deleted(&self, job_id: i64, result_ids: &[i64]) -> Result<usize> {
        if result_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = (0..result_ids.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE test_results SET status = 'DELETED'
             WHERE job_id = ?1 AND status != 'DELETED' AND id IN ({})",
            placeholders
        );
        let mut args = vec![job_id];
        args.extend_from_slice(result_ids);

        let changed = {
            let conn = self.pool.get()?;
            conn.execute(&sql, params_from_iter(args.iter()))?
        };
        if changed > 0 {
            self.refresh_job_stats(job_id)?;
        }
        Ok(changed)
    }

    /// Recompute completed/success/failure counts of a job from its
    /// non-deleted results.
    pub fn refresh_job_stats(&self, job_id: i64) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let (success, failure) = {
            let mut stmt = tx.prepare(
                "SELECT success, COUNT(*) FROM test_results
                 WHERE job_id = ?1 AND status != 'DELETED'
                 GROUP BY success",
            )?;
            let rows = stmt.query_map([job_id], |row| {
                Ok((row.get::<_, bool>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut success = 0;
            let mut failure = 0;
            for r in rows {
                match r? {
                    (true, n) => success += n,
                    (false, n) => failure += n,
                }
            }
            (success, failure)
        };

        tx.execute(
            "UPDATE test_jobs
             SET success_count = ?2, failure_count = ?3, completed_count = ?2 + ?3, updated_at = ?4
             WHERE id = ?1",
            params![job_id, success, failure, now_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn map_result(row: &Row<'_>) -> rusqlite::Result<TestResult> {
    Ok(TestResult {
        id: row.get(0)?,
        job_id: row.get(1)?,
        channel_id: row.get(2)?,
        channel_name: row.get(3)?,
        model_name: row.get(4)?,
        success: row.get(5)?,
        status: ResultStatus::parse(&row.get::<_, String>(6)?),
        duration_ms: row.get(7)?,
        retry_count: row.get(8)?,
        error_message: row.get(9)?,
        created_at: parse_timestamp(&row.get::<_, String>(10)?),
    })
}
