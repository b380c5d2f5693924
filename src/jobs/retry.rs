//! Follow-up jobs that re-test only what failed in an earlier job.

use std::collections::HashSet;

use tracing::info;

use crate::jobs::{JobError, NewTestJob, ResultStatus, TestJobOptions, TestMode};
use crate::storage::JobStore;

/// Create a PENDING job covering the distinct channels and models that failed
/// in `parent_id`. When the new job finishes, the parent's statistics are
/// recomputed from its result set.
pub fn create_retry_job(
    store: &JobStore,
    parent_id: i64,
    requester_id: i64,
) -> Result<i64, JobError> {
    let parent = store
        .get_job(parent_id)?
        .ok_or(JobError::NotFound(parent_id))?;

    let mut channel_ids = Vec::new();
    let mut models = Vec::new();
    let mut seen_channels = HashSet::new();
    let mut seen_models = HashSet::new();
    for result in store.list_results(parent_id, false)? {
        if result.status != ResultStatus::Failed {
            continue;
        }
        if seen_channels.insert(result.channel_id) {
            channel_ids.push(result.channel_id);
        }
        if seen_models.insert(result.model_name.clone()) {
            models.push(result.model_name);
        }
    }
    if channel_ids.is_empty() {
        return Err(JobError::NoTasksPlanned);
    }

    let parent_options = parent.options()?;
    let options = TestJobOptions {
        channel_ids,
        include_disabled: parent_options.include_disabled,
        test_mode: TestMode::Selected,
        target_models: models,
        is_retry_job: true,
        parent_job_id: parent_id,
        ..Default::default()
    };
    let job_id = store.create_job(&NewTestJob {
        requester_id,
        concurrency: parent.concurrency,
        interval_ms: parent.interval_ms,
        retry_limit: parent.retry_limit,
        options,
    })?;

    info!(job_id, parent_job_id = parent_id, "Created retry job");
    Ok(job_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NewTestResult;
    use crate::storage::testing::scratch_pool;

    fn failed(job_id: i64, channel_id: i64, model: &str) -> NewTestResult {
        NewTestResult {
            job_id,
            channel_id,
            channel_name: format!("ch-{}", channel_id),
            model_name: model.to_string(),
            success: false,
            duration_ms: 5,
            retry_count: 0,
            error_message: "boom".to_string(),
        }
    }

    #[test]
    fn test_retry_job_targets_failures() {
        let (_dir, pool) = scratch_pool();
        let store = JobStore::new(pool);
        let parent = store
            .create_job(&NewTestJob {
                requester_id: 3,
                concurrency: 4,
                interval_ms: 500,
                retry_limit: 2,
                options: TestJobOptions::default(),
            })
            .unwrap();

        store.add_result(&failed(parent, 2, "b")).unwrap();
        store
            .add_result(&NewTestResult { success: true, ..failed(parent, 1, "ok") })
            .unwrap();
        store.add_result(&failed(parent, 1, "a")).unwrap();
        store.add_result(&failed(parent, 2, "a")).unwrap();
        let deleted = store.add_result(&failed(parent, 9, "gone")).unwrap();
        store.mark_results_deleted(parent, &[deleted]).unwrap();

        let child_id = create_retry_job(&store, parent, 8).unwrap();
        let child = store.get_job(child_id).unwrap().unwrap();
        assert_eq!(child.status, crate::jobs::JobStatus::Pending);
        assert_eq!(child.requester_id, 8);
        assert_eq!((child.concurrency, child.interval_ms, child.retry_limit), (4, 500, 2));

        let opts = child.options().unwrap();
        assert_eq!(opts.channel_ids, vec![2, 1]);
        assert_eq!(opts.target_models, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(opts.test_mode, TestMode::Selected);
        assert!(opts.is_retry_of_parent());
        assert_eq!(opts.parent_job_id, parent);
    }

    #[test]
    fn test_retry_job_needs_failures() {
        let (_dir, pool) = scratch_pool();
        let store = JobStore::new(pool);
        assert!(matches!(
            create_retry_job(&store, 99, 1),
            Err(JobError::NotFound(99))
        ));

        let clean = store.create_job(&NewTestJob::default()).unwrap();
        store
            .add_result(&NewTestResult { success: true, ..failed(clean, 1, "a") })
            .unwrap();
        assert!(matches!(
            create_retry_job(&store, clean, 1),
            Err(JobError::NoTasksPlanned)
        ));
    }
}
