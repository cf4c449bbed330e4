//! REST endpoints + WebSocket feed for scrape jobs.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::jobs::{JobEvent, JobManager};
use crate::pipeline::{DataKind, PipelineContext, PipelineExecutor, Source, StageOutcome};
use crate::rpc::RpcTransport;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: JobManager,
    /// Worker connection, reported by `/health` (None when running detached).
    pub transport: Option<Arc<RpcTransport>>,
    pub executor: Arc<PipelineExecutor>,
}

/// Build the Axum router with job REST and WebSocket routes.
pub fn job_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/jobs", get(ws_handler))
        .route("/api/jobs", get(list_jobs).post(start_job))
        .route("/api/jobs/{device_id}", get(get_job).delete(cancel_job))
        .route("/api/jobs/{device_id}/confirm", post(confirm_slug))
        .route("/api/jobs/{device_id}/retry", post(retry_job))
        .route("/api/pipelines/run", post(run_pipeline))
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

fn job_error_response(e: JobError) -> Response {
    let status = match &e {
        JobError::NotFound { .. } => StatusCode::NOT_FOUND,
        JobError::NotOwner { .. } => StatusCode::FORBIDDEN,
        JobError::InvalidState { .. } => StatusCode::CONFLICT,
        JobError::MissingPrecondition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        JobError::Database(db) => {
            error!(error = %db, "Job storage error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_body(status, e.to_string())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (worker, reconnect_attempts) = match &state.transport {
        Some(transport) => (
            transport.state().as_str(),
            transport.reconnect_attempts(),
        ),
        None => ("detached", 0),
    };
    Json(json!({
        "status": "ok",
        "service": "scrape-orchestrator",
        "worker": worker,
        "reconnect_attempts": reconnect_attempts,
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct UserQuery {
    user_id: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    info!(user_id = ?query.user_id, "Job feed client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.jobs, query.user_id))
}

async fn send_sync(socket: &mut WebSocket, jobs: &JobManager, user_id: Option<&str>) -> bool {
    let Some(user_id) = user_id else {
        return true;
    };
    let list = match jobs.list_jobs(user_id).await {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "Failed to load jobs for sync");
            return true;
        }
    };
    match serde_json::to_string(&json!({"type": "jobs_sync", "jobs": list})) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => true,
    }
}

/// Feeds opened with a `user_id` only see that user's jobs.
fn visible_to(event: &JobEvent, user_id: Option<&str>) -> bool {
    user_id.is_none_or(|user| event.user_id() == user)
}

async fn handle_socket(mut socket: WebSocket, jobs: JobManager, user_id: Option<String>) {
    let mut rx = jobs.subscribe();
    if !send_sync(&mut socket, &jobs, user_id.as_deref()).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !visible_to(&event, user_id.as_deref()) {
                            continue;
                        }
                        if let Ok(text) = serde_json::to_string(&event)
                            && socket.send(Message::Text(text.into())).await.is_err()
                        {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Job feed client lagged behind broadcast");
                        if !send_sync(&mut socket, &jobs, user_id.as_deref()).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Job feed WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Job feed connection closed");
}

// ── REST Endpoints ──────────────────────────────────────────────────────

async fn list_jobs(State(state): State<AppState>, Query(query): Query<UserQuery>) -> Response {
    let Some(user_id) = query.user_id else {
        return error_body(StatusCode::BAD_REQUEST, "user_id is required");
    };
    match state.jobs.list_jobs(&user_id).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => job_error_response(e),
    }
}

async fn get_job(State(state): State<AppState>, Path(device_id): Path<String>) -> Response {
    match state.jobs.get_job(&device_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => job_error_response(JobError::NotFound { device_id }),
        Err(e) => job_error_response(e),
    }
}

#[derive(Deserialize)]
struct StartRequest {
    user_id: String,
    device_id: String,
    device_name: String,
}

async fn start_job(State(state): State<AppState>, Json(body): Json<StartRequest>) -> Response {
    if body.device_name.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "device_name must not be empty");
    }
    match state
        .jobs
        .start_scrape_job(&body.user_id, &body.device_id, body.device_name.trim())
        .await
    {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => job_error_response(e),
    }
}

#[derive(Deserialize)]
struct ConfirmRequest {
    user_id: String,
    slug: String,
}

async fn confirm_slug(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<ConfirmRequest>,
) -> Response {
    match state
        .jobs
        .confirm_slug(&body.user_id, &device_id, &body.slug)
        .await
    {
        Ok(job) => Json(job).into_response(),
        Err(e) => job_error_response(e),
    }
}

#[derive(Deserialize)]
struct RetryRequest {
    user_id: String,
}

async fn retry_job(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<RetryRequest>,
) -> Response {
    match state.jobs.retry_job(&device_id, &body.user_id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => job_error_response(e),
    }
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Response {
    let Some(user_id) = query.user_id else {
        return error_body(StatusCode::BAD_REQUEST, "user_id is required");
    };
    match state.jobs.cancel_job(&device_id, &user_id).await {
        Ok(true) => Json(json!({"status": "cancelled"})).into_response(),
        Ok(false) => error_body(StatusCode::NOT_FOUND, "Job not found or not owned by user"),
        Err(e) => job_error_response(e),
    }
}

#[derive(Deserialize)]
struct RunPipelineRequest {
    device_id: String,
    source: String,
    data_kind: String,
    external_id: String,
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    scrape_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

async fn run_pipeline(
    State(state): State<AppState>,
    Json(body): Json<RunPipelineRequest>,
) -> Response {
    let source: Source = match body.source.parse() {
        Ok(source) => source,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e),
    };
    let data_kind: DataKind = match body.data_kind.parse() {
        Ok(kind) => kind,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e),
    };

    let ctx = PipelineContext {
        job_id: body
            .job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        device_id: body.device_id,
        source,
        data_kind,
        external_id: body.external_id,
        scrape_id: body.scrape_id,
        metadata: body.metadata,
    };

    match state.executor.run_all(ctx).await {
        Ok(outcomes) => {
            let stages: Vec<_> = outcomes
                .into_iter()
                .map(|(stage, outcome)| match outcome {
                    StageOutcome::Completed(output) => {
                        json!({"stage": stage.as_str(), "status": "completed", "output": output})
                    }
                    StageOutcome::Skipped => json!({"stage": stage.as_str(), "status": "skipped"}),
                })
                .collect();
            Json(json!({"stages": stages})).into_response()
        }
        Err(e) => error_body(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobStep, ScrapeJob};
    use crate::pipeline::PipelineRegistry;
    use crate::store::LibSqlJobStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> (Router, JobManager) {
        let store = LibSqlJobStore::new_memory().await.unwrap();
        let jobs = JobManager::new(Arc::new(store));
        let state = AppState {
            jobs: jobs.clone(),
            transport: None,
            executor: Arc::new(PipelineExecutor::new(Arc::new(PipelineRegistry::new()))),
        };
        (job_routes(state), jobs)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_detached_worker() {
        let (app, _) = app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["worker"], "detached");
    }

    #[tokio::test]
    async fn start_get_list_cancel() {
        let (app, _) = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/jobs",
            Some(json!({"user_id": "u1", "device_id": "D1", "device_name": "Pixel 9"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let job: ScrapeJob = serde_json::from_value(body).unwrap();
        assert_eq!(job.step, JobStep::Searching);

        let (status, body) = send(&app, "GET", "/api/jobs/D1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device_id"], "D1");

        let (status, body) = send(&app, "GET", "/api/jobs?user_id=u1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, "DELETE", "/api/jobs/D1?user_id=u2", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "DELETE", "/api/jobs/D1?user_id=u1", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, "GET", "/api/jobs/D1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn job_errors_map_to_status_codes() {
        let (app, jobs) = app().await;
        jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();

        let (status, body) = send(
            &app,
            "POST",
            "/api/jobs",
            Some(json!({"user_id": "u1", "device_id": "D1", "device_name": "Pixel 9"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("searching"));

        let (status, _) = send(
            &app,
            "POST",
            "/api/jobs/D1/confirm",
            Some(json!({"user_id": "u2", "slug": "pixel-9"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(&app, "POST", "/api/jobs/D9/retry", Some(json!({"user_id": "u1"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/api/jobs", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn retry_without_anything_to_resume_is_unprocessable() {
        let (app, jobs) = app().await;
        jobs.store()
            .upsert(
                "D1",
                crate::jobs::JobUpdate {
                    user_id: Some("u1".into()),
                    ..crate::jobs::JobUpdate::failed("boom")
                },
            )
            .await
            .unwrap();
        let (status, _) = send(&app, "POST", "/api/jobs/D1/retry", Some(json!({"user_id": "u1"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn pipeline_run_skips_unregistered_stages() {
        let (app, _) = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/pipelines/run",
            Some(json!({
                "device_id": "D1",
                "source": "price_ru",
                "data_kind": "specs",
                "external_id": "pixel-9"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let stages = body["stages"].as_array().unwrap();
        assert_eq!(stages.len(), 3);
        assert!(stages.iter().all(|s| s["status"] == "skipped"));

        let (status, _) = send(
            &app,
            "POST",
            "/api/pipelines/run",
            Some(json!({
                "device_id": "D1",
                "source": "ebay",
                "data_kind": "specs",
                "external_id": "pixel-9"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn feed_filters_updates_and_removals_by_owner() {
        let (_, jobs) = app().await;
        let job = jobs.start_scrape_job("u1", "D1", "Pixel 9").await.unwrap();

        let updated = JobEvent::JobUpdated { job };
        let removed = JobEvent::JobRemoved {
            device_id: "D1".into(),
            user_id: "u1".into(),
        };
        for event in [&updated, &removed] {
            assert!(visible_to(event, Some("u1")));
            assert!(!visible_to(event, Some("u2")));
            assert!(visible_to(event, None));
        }
    }
}
