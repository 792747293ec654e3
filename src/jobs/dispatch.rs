//! Background execution of jobs against session containers.
//!
//! ```text
//!  start_job_execution ──try_send──▶ [bounded queue] ──▶ worker 1..N
//!                                                          │
//!        resolve session ─▶ running ─▶ POST /analyze_job ──┤
//!                                                          ▼
//!        ledger ◀── reconcile ──▶ container logs, report blob, job document
//!                       │
//!                       ▼
//!              completed | failed
//! ```
//!
//! The container call is made once, with a long deadline and no retry. When
//! the deadline passes the job fails while the container keeps computing.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, mpsc};

use crate::collab::{Collaborators, JobDocument, JobOutcome};
use crate::error::{DispatchError, JobError};
use crate::events::EventPublisher;
use crate::jobs::model::{Job, JobStatus, REPORT_FILE};
use crate::jobs::protocol::{
    AnalyzeJobRequest, AnalyzeJobResponse, ErrorPayload, TokenLedgerSnapshot, UsageMetrics,
};
use crate::jobs::registry::JobRegistry;
use crate::sandbox::ContainerRuntime;
use crate::session::{Owner, Session, SessionRegistry};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Host the published container ports are reachable on.
    pub host: String,
    /// Deadline for one `/analyze_job` call.
    pub timeout: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            timeout: Duration::from_secs(3600),
            workers: 4,
            queue_capacity: 64,
        }
    }
}

/// Everything a dispatch worker reads from or writes to.
#[derive(Clone)]
pub struct DispatchContext {
    pub jobs: Arc<JobRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub collaborators: Collaborators,
    pub events: EventPublisher,
}

/// Bounded queue in front of a fixed pool of workers.
pub struct Dispatcher {
    queue: mpsc::Sender<String>,
    jobs: Arc<JobRegistry>,
    events: EventPublisher,
}

impl Dispatcher {
    /// Spawn the worker pool.
    pub fn start(config: DispatcherConfig, context: DispatchContext) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DispatchError::Network {
                reason: e.to_string(),
            })?;

        let (queue, rx) = mpsc::channel::<String>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let worker = Arc::new(DispatchWorker {
            host: config.host.clone(),
            client,
            context: context.clone(),
        });

        let workers = config.workers.max(1);
        for index in 0..workers {
            let rx = Arc::clone(&rx);
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(job_id) = next else {
                        break;
                    };
                    worker.run(&job_id).await;
                }
                tracing::debug!(worker = index, "Dispatch worker stopped");
            });
        }

        tracing::info!(
            workers,
            queue_capacity = config.queue_capacity,
            timeout_secs = config.timeout.as_secs(),
            "Started job dispatcher"
        );

        Ok(Self {
            queue,
            jobs: context.jobs,
            events: context.events,
        })
    }

    /// Queue a pending job and return immediately.
    ///
    /// `Ok(false)` when the job is unknown or no longer pending. When the
    /// queue is full the job is failed on the spot.
    pub async fn start_job_execution(&self, job_id: &str) -> Result<bool, JobError> {
        let Some(job) = self.jobs.get_job(job_id).await else {
            tracing::warn!(job_id = %job_id, "Cannot start unknown job");
            return Ok(false);
        };
        if job.status != JobStatus::Pending {
            tracing::warn!(job_id = %job_id, status = %job.status, "Job is not pending, not starting");
            return Ok(false);
        }

        let rejection = match self.queue.try_send(job_id.to_string()) {
            Ok(()) => {
                tracing::info!(job_id = %job_id, "Queued job for execution");
                self.events.log(job_id, "Job queued for execution");
                return Ok(true);
            }
            Err(mpsc::error::TrySendError::Full(_)) => JobError::QueueFull {
                job_id: job_id.to_string(),
            },
            Err(mpsc::error::TrySendError::Closed(_)) => JobError::DispatcherStopped {
                job_id: job_id.to_string(),
            },
        };

        tracing::error!(job_id = %job_id, "{}", rejection);
        match self
            .jobs
            .update_status(job_id, JobStatus::Failed, Some(rejection.to_string()))
            .await
        {
            Ok(failed) => self.events.status(&failed),
            Err(e) => tracing::warn!(job_id = %job_id, "Failed to record rejected job: {}", e),
        }
        Err(rejection)
    }
}

struct DispatchWorker {
    host: String,
    client: reqwest::Client,
    context: DispatchContext,
}

impl DispatchWorker {
    async fn run(&self, job_id: &str) {
        let Some(job) = self.context.jobs.get_job(job_id).await else {
            tracing::warn!(job_id = %job_id, "Queued job disappeared before dispatch");
            return;
        };

        let session = match self.resolve_session(&job).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(job_id = %job_id, session_id = %job.session_id, "{}", e);
                self.finish(&job, JobStatus::Failed, Some(e.to_string())).await;
                return;
            }
        };

        let Some(job) = self.finish(&job, JobStatus::Running, None).await else {
            return;
        };
        self.context.events.log(
            &job.job_id,
            format!("Dispatching analysis to container on port {}", session.container_port),
        );

        let outcome = self.execute(&job, &session).await;
        self.reconcile(&job, &session, outcome).await;
    }

    async fn resolve_session(&self, job: &Job) -> Result<Session, DispatchError> {
        let session = self
            .context
            .sessions
            .get_session_container(&job.session_id)
            .await
            .ok_or_else(|| DispatchError::SessionUnavailable {
                session_id: job.session_id.clone(),
            })?;
        if session.container_port == 0 {
            return Err(DispatchError::NoPort {
                session_id: job.session_id.clone(),
            });
        }
        Ok(session)
    }

    /// One `/analyze_job` call, classified by status code.
    async fn execute(&self, job: &Job, session: &Session) -> Result<AnalyzeJobResponse, DispatchError> {
        let request = AnalyzeJobRequest {
            job_id: job.job_id.clone(),
            query: job.query.clone(),
            model: job.model.clone(),
            session_id: job.session_id.clone(),
            input_dir: job.input_dir.display().to_string(),
            output_dir: job.output_dir.display().to_string(),
            user_identity: job.owner.identity().unwrap_or_default().to_string(),
            token_ledger: self.ledger_snapshot(&job.owner).await,
        };

        let url = format!(
            "http://{}:{}/analyze_job",
            self.host, session.container_port
        );
        tracing::debug!(job_id = %job.job_id, url = %url, "Calling container API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| DispatchError::Network {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<AnalyzeJobResponse>()
                .await
                .map_err(|e| DispatchError::Network {
                    reason: format!("invalid response body: {}", e),
                });
        }

        let text = response.text().await.unwrap_or_default();
        let payload = serde_json::from_str::<ErrorPayload>(&text).ok();

        if status == StatusCode::PAYMENT_REQUIRED {
            return Err(match payload {
                Some(payload) => DispatchError::TokenLimitExceeded {
                    message: payload
                        .error
                        .unwrap_or_else(|| "Token limit exceeded".to_string()),
                    metrics: payload.metrics,
                },
                None => DispatchError::TokenLimitExceeded {
                    message: format!("Token limit exceeded (HTTP 402): {}", text),
                    metrics: UsageMetrics::default(),
                },
            });
        }

        Err(match payload {
            Some(ErrorPayload {
                error: Some(error),
                metrics,
                ..
            }) => DispatchError::UpstreamNon2xx {
                status: status.as_u16(),
                message: format!("Analysis failed: {}", error),
                metrics,
            },
            _ => DispatchError::UpstreamNon2xx {
                status: status.as_u16(),
                message: format!("Container API returned error: {} - {}", status.as_u16(), text),
                metrics: UsageMetrics::default(),
            },
        })
    }

    async fn reconcile(
        &self,
        job: &Job,
        session: &Session,
        outcome: Result<AnalyzeJobResponse, DispatchError>,
    ) {
        self.capture_container_logs(job, &session.container_id).await;

        match outcome {
            Ok(response) => {
                let tokens = response.metrics.total_tokens;
                self.charge_tokens(job, tokens).await;

                let outcome = if response.is_success() {
                    JobOutcome::Success
                } else {
                    JobOutcome::Failed
                };
                if response.token_limit_reached() {
                    self.context
                        .events
                        .log(&job.job_id, "Analysis stopped early: token limit reached");
                }

                let report_url = match outcome {
                    JobOutcome::Success => self.upload_report(job).await,
                    JobOutcome::Failed => None,
                };
                let document = JobDocument::for_job(
                    job,
                    outcome,
                    report_url,
                    tokens,
                    response.costs.total_cost,
                );
                self.record_document(job, &document).await;

                tracing::info!(job_id = %job.job_id, tokens, ?outcome, "Job completed");
                self.finish(job, JobStatus::Completed, None).await;
            }
            Err(err) => {
                let tokens = match &err {
                    DispatchError::TokenLimitExceeded { metrics, .. } => {
                        self.charge_tokens(job, metrics.total_tokens).await;
                        metrics.total_tokens
                    }
                    DispatchError::UpstreamNon2xx { metrics, .. } => metrics.total_tokens,
                    _ => 0,
                };

                let document =
                    JobDocument::for_job(job, JobOutcome::Failed, None, tokens, Decimal::ZERO);
                self.record_document(job, &document).await;

                tracing::error!(job_id = %job.job_id, "Job failed: {}", err);
                self.finish(job, JobStatus::Failed, Some(err.to_string())).await;
            }
        }
    }

    /// Apply a status transition and announce it.
    async fn finish(&self, job: &Job, status: JobStatus, error: Option<String>) -> Option<Job> {
        match self
            .context
            .jobs
            .update_status(&job.job_id, status, error)
            .await
        {
            Ok(updated) => {
                self.context.events.status(&updated);
                Some(updated)
            }
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, "Failed to update job status: {}", e);
                None
            }
        }
    }

    async fn ledger_snapshot(&self, owner: &Owner) -> Option<TokenLedgerSnapshot> {
        let identity = owner.identity()?;
        match self.context.collaborators.ledger.get(identity).await {
            Ok(account) => account.map(|a| TokenLedgerSnapshot::new(a.used, a.issued)),
            Err(e) => {
                tracing::warn!(owner = %identity, "Failed to read token ledger: {}", e);
                None
            }
        }
    }

    async fn charge_tokens(&self, job: &Job, tokens: u64) {
        let Some(identity) = job.owner.identity() else {
            return;
        };
        if tokens == 0 {
            return;
        }

        match self.context.collaborators.ledger.increment(identity, tokens).await {
            Ok(Some(account)) => {
                tracing::info!(
                    job_id = %job.job_id,
                    tokens,
                    used = account.used,
                    issued = account.issued,
                    "Charged tokens"
                );
                if account.remaining() < 0 {
                    tracing::warn!(owner = %identity, "Token usage exceeds issued tokens");
                }
            }
            Ok(None) => {
                tracing::warn!(job_id = %job.job_id, owner = %identity, "No token ledger account, usage not recorded");
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, "Failed to record token usage: {}", e);
            }
        }
    }

    async fn upload_report(&self, job: &Job) -> Option<String> {
        let path = job.report_path();
        if !matches!(tokio::fs::try_exists(&path).await, Ok(true)) {
            tracing::warn!(job_id = %job.job_id, path = %path.display(), "No report artifact to upload");
            return None;
        }

        let object_path = format!("{}/{}/{}", job.session_id, job.job_id, REPORT_FILE);
        match self.context.collaborators.blobs.upload(&path, &object_path).await {
            Ok(url) => {
                self.context.events.log(&job.job_id, "Report uploaded");
                Some(url)
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, "Failed to upload report: {}", e);
                None
            }
        }
    }

    async fn record_document(&self, job: &Job, document: &JobDocument) {
        let Some(identity) = job.owner.identity() else {
            tracing::warn!(job_id = %job.job_id, "Job has no owner, skipping job document");
            return;
        };
        if let Err(e) = self
            .context
            .collaborators
            .documents
            .create(identity, &job.session_id, &job.job_id, document)
            .await
        {
            tracing::error!(job_id = %job.job_id, "Failed to store job document: {}", e);
        }
    }

    async fn capture_container_logs(&self, job: &Job, container_id: &str) {
        let logs = match self.context.runtime.logs(container_id).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, "Failed to read container logs: {}", e);
                return;
            }
        };

        let path = job.container_log_path();
        let write = async {
            tokio::fs::create_dir_all(&job.output_dir).await?;
            tokio::fs::write(&path, logs.as_bytes()).await
        };
        match write.await {
            Ok(()) => tracing::debug!(job_id = %job.job_id, bytes = logs.len(), "Captured container logs"),
            Err(e) => tracing::warn!(job_id = %job.job_id, "Failed to write container logs: {}", e),
        }
    }
}
