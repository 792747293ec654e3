//! The orchestrator service and its control-plane HTTP API.
//!
//! [`Orchestrator`] is built once at startup and shared as handler state.
//! It owns the session and job registries, the dispatcher and the event
//! gateway.

pub mod api;
pub mod auth;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::collab::Collaborators;
use crate::config::Config;
use crate::error::{JobError, OrchestratorError, SessionError};
use crate::events::{EventGateway, JobEventStream};
use crate::jobs::{DispatchContext, Dispatcher, Job, JobRegistry};
use crate::retention::RetentionPolicy;
use crate::sandbox::ContainerRuntime;
use crate::session::{Owner, Session, SessionRegistry};
use crate::snapshot::JsonSnapshot;

/// Timeout for the container `/health` probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pending events between the dispatcher and the gateway.
const EVENT_QUEUE_CAPACITY: usize = 1024;

pub use api::router;
pub use auth::Caller;

pub struct Orchestrator {
    sessions: Arc<SessionRegistry>,
    jobs: Arc<JobRegistry>,
    dispatcher: Dispatcher,
    events: Arc<EventGateway>,
    default_model: String,
    container_host: String,
    health_client: reqwest::Client,
}

impl Orchestrator {
    /// Load both registries, reconcile them with the runtime and start the
    /// dispatcher.
    pub async fn start(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>, OrchestratorError> {
        let sessions = Arc::new(
            SessionRegistry::open(
                config.sandbox.to_sandbox_config()?,
                config.storage.session_paths(),
                JsonSnapshot::new(config.storage.sessions_file()),
                Arc::clone(&runtime),
            )
            .await?,
        );
        let jobs = Arc::new(JobRegistry::open(JsonSnapshot::new(config.storage.jobs_file())).await?);

        let (events, publisher) = EventGateway::start(EVENT_QUEUE_CAPACITY);
        let dispatcher = Dispatcher::start(
            config.dispatch.to_dispatcher_config(),
            DispatchContext {
                jobs: Arc::clone(&jobs),
                sessions: Arc::clone(&sessions),
                runtime,
                collaborators,
                events: publisher,
            },
        )?;

        let health_client = reqwest::Client::builder()
            .timeout(HEALTH_PROBE_TIMEOUT)
            .build()
            .map_err(|e| crate::error::DispatchError::Network {
                reason: e.to_string(),
            })?;

        Ok(Arc::new(Self {
            sessions,
            jobs,
            dispatcher,
            events,
            default_model: config.dispatch.default_model.clone(),
            container_host: config.dispatch.host.clone(),
            health_client,
        }))
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn events(&self) -> &EventGateway {
        &self.events
    }

    pub async fn create_session(&self, owner: Owner) -> Result<(String, String), SessionError> {
        self.sessions.create_session(owner).await
    }

    /// The live session, or why it is not available.
    pub async fn live_session(&self, session_id: &str) -> Result<Session, SessionError> {
        if let Some(session) = self.sessions.get_session_container(session_id).await {
            return Ok(session);
        }
        if self.sessions.get(session_id).await.is_some() {
            Err(SessionError::Inactive {
                session_id: session_id.to_string(),
            })
        } else {
            Err(SessionError::NotFound {
                session_id: session_id.to_string(),
            })
        }
    }

    /// Register a job against a live session and queue it.
    ///
    /// Nothing is registered when the session is unknown or inactive.
    pub async fn submit_job(
        &self,
        session_id: &str,
        query: &str,
        model: Option<&str>,
        owner: Owner,
    ) -> Result<Job, JobError> {
        let session = self.live_session(session_id).await?;
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model);

        let job = self.jobs.create_job(&session, query, model, owner).await?;
        self.dispatcher.start_job_execution(&job.job_id).await?;
        Ok(job)
    }

    pub async fn job_for_caller(&self, job_id: &str, identity: &str) -> Result<Job, JobError> {
        self.jobs.check_ownership(job_id, identity).await
    }

    /// Report artifact of a job owned by `identity`, if it is completed and written.
    pub async fn report_for_caller(
        &self,
        job_id: &str,
        identity: &str,
    ) -> Result<(Job, Option<PathBuf>), JobError> {
        let job = self.jobs.check_ownership(job_id, identity).await?;
        let path = self.jobs.report_path(job_id).await;
        Ok((job, path))
    }

    pub async fn subscribe_job_events(
        &self,
        job_id: &str,
        identity: &str,
    ) -> Result<JobEventStream, JobError> {
        self.jobs.check_ownership(job_id, identity).await?;
        Ok(self.events.subscribe(job_id).await)
    }

    /// Whether the session container answers `GET /health`.
    pub async fn probe_health(&self, session: &Session) -> bool {
        let url = format!(
            "http://{}:{}/health",
            self.container_host, session.container_port
        );
        match self.health_client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(session_id = %session.session_id, "Health probe failed: {}", e);
                false
            }
        }
    }

    /// One retention pass over sessions and jobs.
    pub async fn sweep(&self, policy: &RetentionPolicy) {
        let sessions = self.sessions.cleanup_inactive(policy.session_max_age).await;
        let removed_jobs = self.jobs.cleanup_old_jobs(policy.job_max_age).await;
        self.events.forget(&removed_jobs).await;

        if sessions > 0 || !removed_jobs.is_empty() {
            tracing::info!(
                sessions_cleaned = sessions,
                jobs_removed = removed_jobs.len(),
                "Retention sweep complete"
            );
        }
    }
}
