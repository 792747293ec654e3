//! Durable stores a finished job is reconciled into.
//!
//! The orchestrator only consumes these. Local implementations backed by the
//! data directory ship here; deployments can swap in hosted services behind
//! the same traits.

pub mod blob;
pub mod documents;
pub mod ledger;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CollaboratorError;

pub use blob::LocalBlobStore;
pub use documents::{JobDocument, JobOutcome, LocalDocumentStore, StoredDocument};
pub use ledger::{LedgerAccount, LocalTokenLedger};

/// Per-user job records.
#[async_trait]
pub trait JobDocumentStore: Send + Sync {
    async fn create(
        &self,
        owner: &str,
        session_id: &str,
        job_id: &str,
        document: &JobDocument,
    ) -> Result<(), CollaboratorError>;
}

/// Artifact storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the file at `object_path` and return its public URL.
    async fn upload(&self, local_path: &Path, object_path: &str) -> Result<String, CollaboratorError>;
}

/// Per-user token accounting.
#[async_trait]
pub trait TokenLedger: Send + Sync {
    /// `None` when the owner has no account.
    async fn get(&self, owner: &str) -> Result<Option<LedgerAccount>, CollaboratorError>;

    /// Add to the owner's used tokens. `None` when the owner has no account.
    async fn increment(
        &self,
        owner: &str,
        amount: u64,
    ) -> Result<Option<LedgerAccount>, CollaboratorError>;
}

/// The three stores the dispatcher writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub documents: Arc<dyn JobDocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub ledger: Arc<dyn TokenLedger>,
}

impl Collaborators {
    pub fn new(
        documents: Arc<dyn JobDocumentStore>,
        blobs: Arc<dyn BlobStore>,
        ledger: Arc<dyn TokenLedger>,
    ) -> Self {
        Self {
            documents,
            blobs,
            ledger,
        }
    }
}
