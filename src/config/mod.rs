//! Orchestrator configuration, resolved from the environment.
//!
//! `.env` is loaded first when present. Every setting has a default, so an
//! empty environment yields a working local configuration.

mod dispatch;
pub(crate) mod helpers;
mod sandbox;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::session::SessionPaths;

use self::helpers::{optional_env, parse_bool_env, parse_optional_env, parse_string_env};

pub use self::dispatch::{DispatchConfig, RetentionConfig};
pub use self::sandbox::SandboxModeConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sandbox: SandboxModeConfig,
    pub dispatch: DispatchConfig,
    pub retention: RetentionConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            server: ServerConfig::resolve()?,
            storage: StorageConfig::resolve()?,
            sandbox: SandboxModeConfig::resolve()?,
            dispatch: DispatchConfig::resolve()?,
            retention: RetentionConfig::resolve()?,
        })
    }

    /// Defaults with all state kept under `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig::new(data_dir),
            ..Self::default()
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Emit logs as JSON lines instead of human-readable text.
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            log_json: false,
        }
    }
}

impl ServerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let log_json = match optional_env("LOG_FORMAT")? {
            Some(format) => format.eq_ignore_ascii_case("json"),
            None => parse_bool_env("LOG_JSON", false)?,
        };

        Ok(Self {
            host: parse_string_env("ORCHESTRATOR_HOST", "0.0.0.0")?,
            port: parse_optional_env("ORCHESTRATOR_PORT", 5000)?,
            log_json,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        helpers::parse_value("ORCHESTRATOR_HOST", &format!("{}:{}", self.host, self.port))
    }
}

/// Layout of the data directory.
///
/// ```text
/// {data_dir}/
///   input_data/{session_id}/            session input, mounted read-only
///   output_data/{session_id}/{job_id}/  job output, mounted read-write
///   sessions.json  jobs.json            registry snapshots
///   ledger.json                         token ledger
///   documents/  blobs/                  job documents and uploaded reports
///   orchestrator.lock
/// ```
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Public URL prefix for uploaded blobs. Defaults to `file://` URLs.
    pub blob_base_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new(default_data_dir())
    }
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: anchor(data_dir.into()),
            blob_base_url: None,
        }
    }

    /// Move all state under `data_dir`, resolved against the current directory
    /// when relative. Bind mounts need absolute host paths.
    pub fn set_data_dir(&mut self, data_dir: impl Into<PathBuf>) {
        self.data_dir = anchor(data_dir.into());
    }

    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let data_dir = optional_env("ORCHESTRATOR_DATA_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            data_dir: anchor(data_dir),
            blob_base_url: optional_env("BLOB_BASE_URL")?,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn session_paths(&self) -> SessionPaths {
        SessionPaths::new(
            self.data_dir.join("input_data"),
            self.data_dir.join("output_data"),
        )
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.data_dir.join("ledger.json")
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.data_dir.join("documents")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

fn anchor(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("analysis-orchestrator"))
        .unwrap_or_else(|| PathBuf::from("data"))
}
