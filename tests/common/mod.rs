//! Shared fixtures: an in-memory container runtime, a fake analysis service
//! and an isolated data directory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use analysis_orchestrator::collab::{
    Collaborators, LocalBlobStore, LocalDocumentStore, LocalTokenLedger,
};
use analysis_orchestrator::config::Config;
use analysis_orchestrator::jobs::{Job, JobRegistry, JobStatus};
use analysis_orchestrator::sandbox::{ContainerRuntime, ContainerStatus, LaunchSpec, SandboxError};
use analysis_orchestrator::session::SessionRegistry;
use analysis_orchestrator::snapshot::JsonSnapshot;
use analysis_orchestrator::Orchestrator;

// -- Fake container runtime --

struct FakeContainer {
    spec: LaunchSpec,
    status: ContainerStatus,
    ip: String,
    logs: String,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    launched: Vec<LaunchSpec>,
    next_id: u32,
    fail_next_launch: bool,
    refuse_start: HashSet<String>,
}

/// Container runtime that keeps containers in a map.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.state.lock().unwrap().launched.clone()
    }

    pub fn fail_next_launch(&self) {
        self.state.lock().unwrap().fail_next_launch = true;
    }

    /// The container exits as if it crashed.
    pub fn stop_externally(&self, container_id: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container_id) {
            c.status = ContainerStatus::Exited;
        }
    }

    /// The container is removed behind the orchestrator's back.
    pub fn remove_externally(&self, container_id: &str) {
        self.state.lock().unwrap().containers.remove(container_id);
    }

    /// Starting this container leaves it exited.
    pub fn refuse_start(&self, container_id: &str) {
        self.state
            .lock()
            .unwrap()
            .refuse_start
            .insert(container_id.to_string());
    }

    pub fn status_of(&self, container_id: &str) -> Option<ContainerStatus> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.status)
    }

    pub fn exists(&self, container_id: &str) -> bool {
        self.state.lock().unwrap().containers.contains_key(container_id)
    }

    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.status.is_running())
            .count()
    }

    pub fn set_logs(&self, container_id: &str, logs: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container_id) {
            c.logs = logs.to_string();
        }
    }

    fn with_container<T>(
        &self,
        container_id: &str,
        f: impl FnOnce(&mut FakeContainer, &HashSet<String>) -> T,
    ) -> Result<T, SandboxError> {
        let mut state = self.state.lock().unwrap();
        let FakeState {
            containers,
            refuse_start,
            ..
        } = &mut *state;
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| SandboxError::ContainerNotFound {
                container_id: container_id.to_string(),
            })?;
        Ok(f(container, refuse_start))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String, SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.launched.push(spec.clone());
        if std::mem::take(&mut state.fail_next_launch) {
            return Err(SandboxError::ContainerLaunchFailed {
                reason: "image not found".to_string(),
            });
        }

        state.next_id += 1;
        let id = format!("fake-container-{}", state.next_id);
        let ip = format!("172.17.0.{}", state.next_id + 1);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                status: ContainerStatus::Running,
                ip,
                logs: format!("2026-01-01T00:00:00Z {} ready\n", spec.name),
            },
        );
        Ok(id)
    }

    async fn status(&self, container_id: &str) -> Result<ContainerStatus, SandboxError> {
        self.with_container(container_id, |c, _| c.status)
    }

    async fn start(&self, container_id: &str) -> Result<(), SandboxError> {
        let id = container_id.to_string();
        self.with_container(container_id, |c, refuse| {
            if !refuse.contains(&id) {
                c.status = ContainerStatus::Running;
            }
        })
    }

    async fn restart(&self, container_id: &str, _timeout: Duration) -> Result<(), SandboxError> {
        self.with_container(container_id, |c, _| c.status = ContainerStatus::Running)
    }

    async fn stop(&self, container_id: &str, _timeout: Duration) -> Result<(), SandboxError> {
        self.with_container(container_id, |c, _| c.status = ContainerStatus::Exited)
    }

    async fn remove(&self, container_id: &str) -> Result<(), SandboxError> {
        self.state
            .lock()
            .unwrap()
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| SandboxError::ContainerNotFound {
                container_id: container_id.to_string(),
            })
    }

    async fn ip_address(&self, container_id: &str) -> Result<Option<String>, SandboxError> {
        self.with_container(container_id, |c, _| Some(c.ip.clone()))
    }

    async fn logs(&self, container_id: &str) -> Result<String, SandboxError> {
        self.with_container(container_id, |c, _| c.logs.clone())
    }
}

// -- Fake analysis service --

/// How the fake `/analyze_job` endpoint answers.
#[derive(Debug, Clone)]
pub enum Reply {
    /// 200, writes the report into the job's output dir.
    Success { tokens: u64 },
    /// 200 with `completion_reason: TOKEN_LIMIT_REACHED`.
    StoppedEarly { tokens: u64 },
    /// 402 token-limit payload.
    TokenLimit { tokens: u64 },
    /// 500 with an error payload.
    ServerError,
    /// Never answers.
    Hang,
}

pub struct FakeAnalysisService {
    pub requests: Arc<Mutex<Vec<Value>>>,
    handle: JoinHandle<()>,
}

impl FakeAnalysisService {
    /// Serve on `127.0.0.1:{port}`.
    pub async fn start(port: u16, reply: Reply) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/analyze_job",
                post(move |Json(body): Json<Value>| {
                    let recorded = Arc::clone(&recorded);
                    let reply = reply.clone();
                    async move {
                        recorded.lock().unwrap().push(body.clone());
                        answer(reply, body).await
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind fake analysis service");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { requests, handle }
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeAnalysisService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn metrics(tokens: u64) -> Value {
    json!({
        "prompt_tokens": tokens / 2,
        "completion_tokens": tokens - tokens / 2,
        "total_tokens": tokens,
    })
}

async fn answer(reply: Reply, body: Value) -> axum::response::Response {
    match reply {
        Reply::Success { tokens } => {
            if let Some(output_dir) = body["output_dir"].as_str() {
                let _ = tokio::fs::create_dir_all(output_dir).await;
                let _ = tokio::fs::write(
                    std::path::Path::new(output_dir).join("analysis_report.html"),
                    "<html><body>report</body></html>",
                )
                .await;
            }
            Json(json!({
                "status": "success",
                "metrics": metrics(tokens),
                "costs": {
                    "prompt_cost": 0.01,
                    "completion_cost": 0.02,
                    "total_cost": 0.03,
                    "model": body["model"],
                },
            }))
            .into_response()
        }
        Reply::StoppedEarly { tokens } => Json(json!({
            "status": "success",
            "metrics": metrics(tokens),
            "costs": { "total_cost": 0.01 },
            "analysis_completed_early": true,
            "completion_reason": "TOKEN_LIMIT_REACHED",
        }))
        .into_response(),
        Reply::TokenLimit { tokens } => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "error": "Token limit exceeded",
                "error_type": "TOKEN_LIMIT_EXCEEDED",
                "metrics": metrics(tokens),
            })),
        )
            .into_response(),
        Reply::ServerError => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "boom" })),
        )
            .into_response(),
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(300)).await;
            StatusCode::OK.into_response()
        }
    }
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

// -- Environment --

/// Isolated data directory, fake runtime and local collaborators.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
    pub runtime: Arc<FakeRuntime>,
    pub documents: Arc<LocalDocumentStore>,
    pub blobs: Arc<LocalBlobStore>,
    pub ledger: Arc<LocalTokenLedger>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::with_data_dir(dir.path());
        let blobs = Arc::new(LocalBlobStore::new(
            config.storage.blobs_dir(),
            "https://blobs.test",
        ));
        Self {
            dir,
            config,
            runtime: FakeRuntime::new(),
            documents: Arc::new(LocalDocumentStore::in_memory()),
            blobs,
            ledger: Arc::new(LocalTokenLedger::in_memory()),
        }
    }

    /// Sessions get exactly `port`, so a fake service can listen there.
    pub fn with_single_port(port: u16) -> Self {
        let mut env = Self::new();
        env.config.sandbox.port_range_start = port;
        env.config.sandbox.port_range_end = port;
        env
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.documents.clone(),
            self.blobs.clone(),
            self.ledger.clone(),
        )
    }

    pub async fn orchestrator(&self) -> Arc<Orchestrator> {
        Orchestrator::start(&self.config, self.runtime.clone(), self.collaborators())
            .await
            .expect("start orchestrator")
    }

    pub async fn session_registry(&self) -> SessionRegistry {
        SessionRegistry::open(
            self.config.sandbox.to_sandbox_config().expect("sandbox config"),
            self.config.storage.session_paths(),
            JsonSnapshot::new(self.config.storage.sessions_file()),
            self.runtime.clone(),
        )
        .await
        .expect("open session registry")
    }
}

/// Poll until the job reaches `completed`, `failed` or `cancelled`.
pub async fn wait_for_terminal(jobs: &JobRegistry, job_id: &str) -> Job {
    for _ in 0..500 {
        if let Some(job) = jobs.get_job(job_id).await
            && job.status.is_terminal()
        {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

/// Poll until the job is in `status`.
pub async fn wait_for_status(jobs: &JobRegistry, job_id: &str, status: JobStatus) -> Job {
    for _ in 0..500 {
        if let Some(job) = jobs.get_job(job_id).await
            && job.status == status
        {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached {status}");
}
