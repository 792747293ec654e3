//! Durable per-user job documents.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::collab::JobDocumentStore;
use crate::error::CollaboratorError;
use crate::jobs::Job;
use crate::snapshot::JsonSnapshot;

/// Outcome recorded on the document, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub logs_url: String,
    pub report_url: Option<String>,
    pub total_token_used: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_cost: Decimal,
    pub question: String,
    pub job_status: JobOutcome,
}

impl JobDocument {
    pub fn for_job(
        job: &Job,
        outcome: JobOutcome,
        report_url: Option<String>,
        total_token_used: u64,
        total_cost: Decimal,
    ) -> Self {
        Self {
            job_id: job.job_id.clone(),
            created_at: Utc::now(),
            logs_url: format!("/logs/{}/{}/", job.session_id, job.job_id),
            report_url,
            total_token_used,
            total_cost,
            question: job.query.clone(),
            job_status: outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub owner: String,
    pub session_id: String,
    pub document: JobDocument,
}

/// Document store kept in memory and, when given a root, mirrored to
/// `{root}/{owner}/{session_id}/{job_id}.json`.
#[derive(Debug, Default)]
pub struct LocalDocumentStore {
    root: Option<PathBuf>,
    documents: RwLock<Vec<StoredDocument>>,
}

impl LocalDocumentStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            documents: RwLock::new(Vec::new()),
        }
    }

    pub async fn documents(&self) -> Vec<StoredDocument> {
        self.documents.read().await.clone()
    }

    pub async fn find(&self, job_id: &str) -> Option<StoredDocument> {
        self.documents
            .read()
            .await
            .iter()
            .find(|stored| stored.document.job_id == job_id)
            .cloned()
    }
}

#[async_trait]
impl JobDocumentStore for LocalDocumentStore {
    async fn create(
        &self,
        owner: &str,
        session_id: &str,
        job_id: &str,
        document: &JobDocument,
    ) -> Result<(), CollaboratorError> {
        if let Some(root) = &self.root {
            let path = root
                .join(path_segment(&owner.to_lowercase()))
                .join(path_segment(session_id))
                .join(format!("{}.json", path_segment(job_id)));
            JsonSnapshot::new(path).save(document).await?;
        }

        let mut documents = self.documents.write().await;
        documents.retain(|stored| stored.document.job_id != job_id);
        documents.push(StoredDocument {
            owner: owner.to_string(),
            session_id: session_id.to_string(),
            document: document.clone(),
        });
        Ok(())
    }
}

fn path_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::jobs::JobStatus;
    use crate::session::Owner;

    fn job() -> Job {
        Job {
            job_id: "JOB_1".into(),
            session_id: "s1".into(),
            status: JobStatus::Completed,
            query: "why?".into(),
            model: "m".into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            input_dir: "/in".into(),
            output_dir: "/out".into(),
            owner: Owner::new("a@x.com"),
        }
    }

    #[test]
    fn test_document_for_job() {
        let doc = JobDocument::for_job(&job(), JobOutcome::Failed, None, 42, dec!(0.5));
        assert_eq!(doc.logs_url, "/logs/s1/JOB_1/");
        assert_eq!(doc.question, "why?");
        assert_eq!(doc.job_status, JobOutcome::Failed);

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["job_status"], "failed");
        assert_eq!(value["total_cost"], 0.5);
    }

    #[tokio::test]
    async fn test_create_writes_file_under_owner_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDocumentStore::with_root(dir.path());
        let doc = JobDocument::for_job(&job(), JobOutcome::Success, None, 1, Decimal::ZERO);

        store.create("A@x.com", "s1", "JOB_1", &doc).await.unwrap();

        let path = dir.path().join("a@x.com/s1/JOB_1.json");
        let written: JobDocument =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(written, doc);
        assert_eq!(store.find("JOB_1").await.unwrap().owner, "A@x.com");
    }

    #[test]
    fn test_path_segment_strips_separators() {
        assert_eq!(path_segment("../etc/passwd"), "_etc_passwd");
        assert_eq!(path_segment("a@x.com"), "a@x.com");
    }
}
