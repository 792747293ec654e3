//! Session and job orchestration for per-session analysis containers.
//!
//! A session is one Docker container with a host input directory mounted
//! read-only and an output directory mounted read-write. Jobs are dispatched
//! asynchronously to the session container's `/analyze_job` endpoint and
//! reconciled into the token ledger, blob store and document store when they
//! finish.

pub mod collab;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod orchestrator;
pub mod retention;
pub mod sandbox;
pub mod session;
pub mod snapshot;

pub use config::Config;
pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
