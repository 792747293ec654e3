//! The job table and its snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::JobError;
use crate::jobs::model::{Job, JobStatus};
use crate::retention;
use crate::session::{Owner, Session};
use crate::snapshot::JsonSnapshot;

/// Error recorded on jobs that were in flight when the orchestrator stopped.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by orchestrator restart";

/// Owns the job table. Status changes are linearized under one lock.
pub struct JobRegistry {
    snapshot: JsonSnapshot,
    jobs: Mutex<BTreeMap<String, Job>>,
}

impl JobRegistry {
    /// Load the snapshot. Jobs left pending or running have no worker
    /// anymore and are failed.
    pub async fn open(snapshot: JsonSnapshot) -> Result<Self, JobError> {
        let mut jobs: BTreeMap<String, Job> = snapshot.load_or_default().await?;

        let now = Utc::now();
        let mut interrupted = 0;
        for job in jobs.values_mut().filter(|job| !job.status.is_terminal()) {
            job.status = JobStatus::Failed;
            job.error = Some(INTERRUPTED_BY_RESTART.to_string());
            job.completed_at.get_or_insert(now);
            interrupted += 1;
        }

        let registry = Self {
            snapshot,
            jobs: Mutex::new(jobs),
        };
        {
            let jobs = registry.jobs.lock().await;
            tracing::info!(jobs = jobs.len(), interrupted, "Loaded job table");
            registry.persist(&jobs).await;
        }
        Ok(registry)
    }

    /// Register a pending job against a live session. Does not contact the container.
    pub async fn create_job(
        &self,
        session: &Session,
        query: &str,
        model: &str,
        owner: Owner,
    ) -> Result<Job, JobError> {
        let job_id = Job::new_id();
        let input_dir = session.input_dir.clone();
        let output_dir = session.output_dir.join(&job_id);
        create_dir(&input_dir).await?;
        create_dir(&output_dir).await?;

        let job = Job {
            job_id: job_id.clone(),
            session_id: session.session_id.clone(),
            status: JobStatus::Pending,
            query: query.to_string(),
            model: model.to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            input_dir,
            output_dir,
            owner,
        };

        let mut jobs = self.jobs.lock().await;
        jobs.insert(job_id.clone(), job.clone());
        self.persist(&jobs).await;

        tracing::info!(job_id = %job_id, session_id = %session.session_id, "Created job");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    /// Move a job to `next`, stamping `started_at` / `completed_at` the first time.
    pub async fn update_status(
        &self,
        job_id: &str,
        next: JobStatus,
        error: Option<String>,
    ) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(job_id).ok_or_else(|| JobError::NotFound {
            job_id: job_id.to_string(),
        })?;

        if !job.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == JobStatus::Running {
            job.started_at.get_or_insert(now);
        }
        if next.is_terminal() {
            job.completed_at.get_or_insert(now);
        }
        if error.is_some() {
            job.error = error;
        }
        job.status = next;

        let updated = job.clone();
        self.persist(&jobs).await;
        Ok(updated)
    }

    /// The job, if `identity` owns it.
    pub async fn check_ownership(&self, job_id: &str, identity: &str) -> Result<Job, JobError> {
        let job = self.get_job(job_id).await.ok_or_else(|| JobError::NotFound {
            job_id: job_id.to_string(),
        })?;
        if !job.owner.matches(identity) {
            return Err(JobError::Forbidden {
                job_id: job_id.to_string(),
            });
        }
        Ok(job)
    }

    /// Report artifact of a completed job, if it was written.
    pub async fn report_path(&self, job_id: &str) -> Option<PathBuf> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Completed {
            return None;
        }
        let path = job.report_path();
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    pub async fn jobs_for_session(&self, session_id: &str) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| job.session_id == session_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub async fn jobs_for_owner(&self, identity: &str) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| job.owner.matches(identity))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Drop jobs older than `max_age` together with their output directories.
    ///
    /// Only the job's own output directory is removed; the session input
    /// directory it points at is shared. Returns the removed job ids.
    pub async fn cleanup_old_jobs(&self, max_age: Duration) -> Vec<String> {
        let Some(cutoff) = retention::cutoff(max_age) else {
            return Vec::new();
        };

        let removed: Vec<Job> = {
            let mut jobs = self.jobs.lock().await;
            let stale: Vec<String> = jobs
                .values()
                .filter(|job| job.created_at < cutoff)
                .map(|job| job.job_id.clone())
                .collect();
            if stale.is_empty() {
                return Vec::new();
            }
            let removed: Vec<Job> = stale.iter().filter_map(|id| jobs.remove(id)).collect();
            self.persist(&jobs).await;
            removed
        };

        for job in &removed {
            match tokio::fs::remove_dir_all(&job.output_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    job_id = %job.job_id,
                    "Failed to remove job output directory: {}",
                    e
                ),
            }
        }

        tracing::info!(removed = removed.len(), "Cleaned up old jobs");
        removed.into_iter().map(|job| job.job_id).collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    async fn persist(&self, jobs: &BTreeMap<String, Job>) {
        if let Err(e) = self.snapshot.save(jobs).await {
            tracing::error!("Failed to persist job table: {}", e);
        }
    }
}

async fn create_dir(path: &Path) -> Result<(), JobError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| JobError::Filesystem {
            path: path.to_path_buf(),
            source,
        })
}
