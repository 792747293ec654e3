//! Job rows and the job status machine.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::Owner;

/// File name of the HTML report an analysis writes into its output directory.
pub const REPORT_FILE: &str = "analysis_report.html";

/// File name container logs are captured to after a dispatch.
pub const CONTAINER_LOG_FILE: &str = "container_logs.txt";

/// Status of a job.
///
/// ```text
/// pending ─▶ running ─▶ completed | failed | cancelled
///    │
///    └─────▶ failed   (dispatch failed before the container was reached)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub session_id: String,
    pub status: JobStatus,
    pub query: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    /// The owning session's shared input directory.
    pub input_dir: PathBuf,
    /// `{session output dir}/{job_id}`.
    pub output_dir: PathBuf,
    #[serde(default)]
    pub owner: Owner,
}

impl Job {
    pub fn new_id() -> String {
        format!("JOB_{}", Uuid::new_v4())
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_dir.join(REPORT_FILE)
    }

    pub fn container_log_path(&self) -> PathBuf {
        self.output_dir.join(CONTAINER_LOG_FILE)
    }
}
