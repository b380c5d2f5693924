//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::jobs::planner::plan_job;
use crate::jobs::{create_retry_job, JobError, NewTestJob, TestJob, TestJobOptions};

type ApiResult<T> = Result<T, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/channels", get(list_channels))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/results", get(list_results))
        .route("/jobs/{id}/results/delete", post(delete_results))
        .route("/jobs/{id}/retry", post(retry_job))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "running_jobs": state.registry.running_jobs().len()
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn list_channels(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let channels = state.channels.list()?;
    Ok(Json(json!({ "data": channels, "meta": { "total": channels.len() } })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateJobRequest {
    requester_id: i64,
    concurrency: Option<i64>,
    interval_ms: Option<i64>,
    retry_limit: Option<i64>,
    options: TestJobOptions,
}

/// Plan first so a request that would test nothing never creates a job.
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let (_, tasks) = plan_job(&state.channels, &req.options)?;
    let new_job = NewTestJob::with_defaults(
        &state.job_defaults,
        req.requester_id,
        req.concurrency,
        req.interval_ms,
        req.retry_limit,
        req.options,
    );
    let job_id = state.jobs.create_job(&new_job)?;
    state.registry.submit(job_id)?;

    let job = load_job(&state, job_id)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": job, "meta": { "planned_tasks": tasks.len() } })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Page {
    limit: usize,
    offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 20,
            offset: 0,
        }
    }
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Value>> {
    let jobs = state.jobs.list_jobs(page.limit.min(100), page.offset)?;
    Ok(Json(json!({
        "data": jobs,
        "meta": {
            "limit": page.limit.min(100),
            "offset": page.offset,
            "running": state.registry.running_jobs()
        }
    })))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let job = load_job(&state, id)?;
    Ok(Json(json!({
        "data": job,
        "meta": { "running": state.registry.is_running(id) }
    })))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    load_job(&state, id)?;
    state.registry.cancel(id)?;
    Ok(Json(json!({ "data": { "id": id, "cancel_requested": true } })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResultsQuery {
    include_deleted: bool,
}

async fn list_results(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<ResultsQuery>,
) -> ApiResult<Json<Value>> {
    load_job(&state, id)?;
    let results = state.jobs.list_results(id, q.include_deleted)?;
    Ok(Json(json!({ "data": results, "meta": { "total": results.len() } })))
}

#[derive(Debug, Deserialize)]
struct DeleteResultsRequest {
    ids: Vec<i64>,
}

async fn delete_results(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<DeleteResultsRequest>,
) -> ApiResult<Json<Value>> {
    load_job(&state, id)?;
    let deleted = state.jobs.mark_results_deleted(id, &req.ids)?;
    let job = load_job(&state, id)?;
    Ok(Json(json!({ "data": job, "meta": { "deleted": deleted } })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetryQuery {
    requester_id: i64,
}

async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<RetryQuery>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let job_id = create_retry_job(&state.jobs, id, q.requester_id)?;
    state.registry.submit(job_id)?;
    let job = load_job(&state, job_id)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": job, "meta": { "parent_job_id": id } })),
    ))
}

fn load_job(state: &AppState, id: i64) -> Result<TestJob, ApiError> {
    Ok(state.jobs.get_job(id)?.ok_or(JobError::NotFound(id))?)
}

#[cfg(test)]
mod tests {
    use crate::api::{router, state::AppState};
    use crate::channel::{ChannelStatus, ChannelType, NewChannel};
    use crate::config::JobsConfig;
    use crate::jobs::testing::{add_channel, ScriptedTester};
    use crate::jobs::{JobRegistry, JobRunner, RunnerSettings};
    use crate::storage::testing::scratch_pool;
    use crate::storage::{ChannelStore, JobStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_state(tester: ScriptedTester) -> (tempfile::TempDir, AppState) {
        let (dir, pool) = scratch_pool();
        let runner = JobRunner::new(
            JobStore::new(pool.clone()),
            ChannelStore::new(pool),
            Arc::new(tester),
            RunnerSettings::default(),
        );
        let defaults = JobsConfig {
            default_interval_ms: 100,
            ..Default::default()
        };
        (dir, AppState::new(JobRegistry::new(runner), defaults))
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = router(state.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn wait_idle(state: &AppState) {
        for _ in 0..100 {
            if state.registry.running_jobs().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("jobs still running: {:?}", state.registry.running_jobs());
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, state) = app_state(ScriptedTester::default());
        let (status, body) = call(&state, "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["running_jobs"], 0);
    }

    #[tokio::test]
    async fn test_channels_hide_keys() {
        let (_dir, state) = app_state(ScriptedTester::default());
        state
            .channels
            .insert(&NewChannel {
                name: "secretive".to_string(),
                channel_type: ChannelType::Anthropic,
                status: ChannelStatus::Enabled,
                base_url: "https://api.example.com".to_string(),
                key: "sk-very-secret".to_string(),
                models: "claude-x".to_string(),
                test_model: None,
            })
            .unwrap();

        let (status, body) = call(&state, "GET", "/api/v1/channels", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 1);
        assert_eq!(body["data"][0]["name"], "secretive");
        assert!(!body.to_string().contains("sk-very-secret"));
    }

    #[tokio::test]
    async fn test_job_lifecycle_over_http() {
        let (_dir, state) = app_state(ScriptedTester::default());
        let ch = add_channel(&state.channels, "primary", "m1,m2");

        let (status, body) = call(
            &state,
            "POST",
            "/api/v1/jobs",
            Some(json!({ "requester_id": 5, "options": { "channel_ids": [ch.id] } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["meta"]["planned_tasks"], 2);
        let job_id = body["data"]["id"].as_i64().unwrap();

        wait_idle(&state).await;

        let (status, body) = call(&state, "GET", &format!("/api/v1/jobs/{}", job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "SUCCESS");
        assert_eq!(body["data"]["completed_count"], 2);
        assert_eq!(body["data"]["interval_ms"], 100);
        assert_eq!(body["meta"]["running"], false);

        let (_, body) = call(&state, "GET", &format!("/api/v1/jobs/{}/results", job_id), None).await;
        assert_eq!(body["meta"]["total"], 2);
        let first = body["data"][0]["id"].as_i64().unwrap();

        let (status, body) = call(
            &state,
            "POST",
            &format!("/api/v1/jobs/{}/results/delete", job_id),
            Some(json!({ "ids": [first] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["deleted"], 1);
        assert_eq!(body["data"]["completed_count"], 1);

        let (_, body) = call(&state, "GET", "/api/v1/jobs", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        // Finished jobs cannot be canceled; nothing failed, so nothing to retry.
        let (status, _) = call(&state, "POST", &format!("/api/v1/jobs/{}/cancel", job_id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = call(&state, "POST", &format!("/api/v1/jobs/{}/retry", job_id), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admission_errors() {
        let (_dir, state) = app_state(ScriptedTester::default());

        let (status, body) = call(
            &state,
            "POST",
            "/api/v1/jobs",
            Some(json!({ "options": { "channel_ids": [] } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "no channels selected");
        assert!(state.jobs.list_jobs(10, 0).unwrap().is_empty());

        let (status, _) = call(&state, "GET", "/api/v1/jobs/404", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, "POST", "/api/v1/jobs/404/retry", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
