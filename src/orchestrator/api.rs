//! Control-plane HTTP API.
//!
//! Every route except `/health` sits behind [`caller_identity_middleware`],
//! so handlers can rely on a [`Caller`] extension being present.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::{JobError, SessionError};
use crate::jobs::{Job, JobStatus};
use crate::orchestrator::Orchestrator;
use crate::orchestrator::auth::{Caller, caller_identity_middleware};
use crate::sandbox::SandboxError;
use crate::session::{Session, SessionReport};

/// Build the axum router for the control-plane API.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/session", post(create_session))
        .route("/session/{session_id}/validate", get(validate_session))
        .route("/session/{session_id}/status", get(session_status))
        .route("/session/{session_id}/jobs", get(session_jobs))
        .route("/session/{session_id}/restart", post(restart_session))
        .route("/session/{session_id}/cleanup", post(cleanup_session))
        .route("/job", post(submit_job))
        .route("/jobs", get(list_jobs))
        .route("/job/{job_id}/status", get(job_status))
        .route("/job/{job_id}/report", get(job_report))
        .route("/job/{job_id}/events", get(job_events))
        .route_layer(axum::middleware::from_fn(caller_identity_middleware))
        // Unauthenticated routes (added after the layer).
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

// -- Wire types --

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub container_id: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateSessionResponse {
    pub session_id: String,
    pub valid: bool,
    pub has_input_data: bool,
    pub healthy: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub session_id: String,
    pub query: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub session_id: String,
    pub status: JobStatus,
    pub query: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.job_id,
            session_id: job.session_id,
            status: job.status,
            query: job.query,
            model: job.model,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub session_id: String,
    pub status: String,
}

impl ActionResponse {
    fn success(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: "success".to_string(),
        }
    }
}

// -- Errors --

/// Error body returned by every handler: `{"status": "error", "error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn session_status_code(e: &SessionError) -> StatusCode {
    match e {
        SessionError::NotFound { .. } => StatusCode::NOT_FOUND,
        SessionError::Inactive { .. } => StatusCode::CONFLICT,
        SessionError::Sandbox(SandboxError::PortExhausted { .. })
        | SessionError::Sandbox(SandboxError::DockerNotAvailable { .. }) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        Self::new(session_status_code(&e), e.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        let status = match &e {
            JobError::Session(inner) => session_status_code(inner),
            JobError::NotFound { .. } => StatusCode::NOT_FOUND,
            JobError::Forbidden { .. } => StatusCode::FORBIDDEN,
            JobError::InvalidTransition { .. } => StatusCode::CONFLICT,
            JobError::QueueFull { .. } | JobError::DispatcherStopped { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            JobError::Filesystem { .. } | JobError::Snapshot(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, "Request failed: {}", self.message);
        }
        let body = serde_json::json!({
            "status": "error",
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

/// The session row, if the caller owns it.
async fn owned_session(
    orchestrator: &Orchestrator,
    session_id: &str,
    caller: &Caller,
) -> Result<Session, ApiError> {
    let session = orchestrator
        .sessions()
        .get(session_id)
        .await
        .ok_or_else(|| SessionError::NotFound {
            session_id: session_id.to_string(),
        })?;
    if !session.owner.matches(&caller.email) {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            format!("Caller does not own session {}", session_id),
        ));
    }
    Ok(session)
}

// -- Handlers --

async fn health_check() -> &'static str {
    "ok"
}

async fn create_session(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(caller): Extension<Caller>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let (session_id, container_id) = orchestrator.create_session(caller.owner()).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id,
            container_id,
            status: "success".to_string(),
        }),
    ))
}

async fn validate_session(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<String>,
) -> Result<Json<ValidateSessionResponse>, ApiError> {
    let has_input_data = orchestrator.sessions().has_input_data(&session_id);

    let (valid, healthy) = match orchestrator.sessions().get(&session_id).await {
        None => (false, false),
        Some(row) if !row.owner.matches(&caller.email) => {
            return Err(ApiError::new(
                StatusCode::FORBIDDEN,
                format!("Caller does not own session {}", session_id),
            ));
        }
        Some(_) => match orchestrator.sessions().get_session_container(&session_id).await {
            Some(live) => (true, orchestrator.probe_health(&live).await),
            None => (false, false),
        },
    };

    Ok(Json(ValidateSessionResponse {
        session_id,
        valid,
        has_input_data,
        healthy,
    }))
}

async fn session_status(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionReport>, ApiError> {
    owned_session(&orchestrator, &session_id, &caller).await?;
    // Resolve through the runtime so the reported status is current.
    orchestrator
        .sessions()
        .get_session_container(&session_id)
        .await;
    let report = orchestrator
        .sessions()
        .session_status(&session_id)
        .await
        .ok_or_else(|| SessionError::NotFound {
            session_id: session_id.clone(),
        })?;
    Ok(Json(report))
}

async fn session_jobs(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<JobStatusResponse>>, ApiError> {
    owned_session(&orchestrator, &session_id, &caller).await?;
    let jobs = orchestrator.jobs().jobs_for_session(&session_id).await;
    Ok(Json(jobs.into_iter().map(JobStatusResponse::from).collect()))
}

async fn restart_session(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    owned_session(&orchestrator, &session_id, &caller).await?;
    if !orchestrator.sessions().restart_session(&session_id).await? {
        return Err(SessionError::Inactive { session_id }.into());
    }
    Ok(Json(ActionResponse::success(&session_id)))
}

async fn cleanup_session(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    owned_session(&orchestrator, &session_id, &caller).await?;
    if !orchestrator.sessions().cleanup_session(&session_id).await? {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("Session {} is already cleaned up", session_id),
        ));
    }
    Ok(Json(ActionResponse::success(&session_id)))
}

async fn submit_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    if req.query.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "query must not be empty"));
    }
    owned_session(&orchestrator, &req.session_id, &caller).await?;

    let job = orchestrator
        .submit_job(&req.session_id, &req.query, req.model.as_deref(), caller.owner())
        .await?;
    Ok(Json(SubmitJobResponse {
        job_id: job.job_id,
        status: job.status,
    }))
}

async fn list_jobs(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(caller): Extension<Caller>,
) -> Json<Vec<JobStatusResponse>> {
    let jobs = orchestrator.jobs().jobs_for_owner(&caller.email).await;
    Json(jobs.into_iter().map(JobStatusResponse::from).collect())
}

async fn job_status(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(caller): Extension<Caller>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = orchestrator.job_for_caller(&job_id, &caller.email).await?;
    Ok(Json(job.into()))
}

async fn job_report(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(caller): Extension<Caller>,
    Path(job_id): Path<String>,
) -> Result<Html<String>, ApiError> {
    let (job, path) = orchestrator.report_for_caller(&job_id, &caller.email).await?;
    if job.status != JobStatus::Completed {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Job {} is {}, not completed", job_id, job.status),
        ));
    }
    let path = path.ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            format!("No report found for job {}", job_id),
        )
    })?;

    let html = tokio::fs::read_to_string(&path).await.map_err(|e| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to read report {}: {}", path.display(), e),
        )
    })?;
    Ok(Html(html))
}

async fn job_events(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(caller): Extension<Caller>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = orchestrator
        .subscribe_job_events(&job_id, &caller.email)
        .await?
        .map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Ok(Event::default().event(event.event_type()).data(data))
        });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
