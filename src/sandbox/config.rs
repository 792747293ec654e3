//! Configuration for per-session analysis containers.

use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

/// Where the session input directory appears inside the container.
pub const CONTAINER_INPUT_DIR: &str = "/app/execution_layer/input_data";
/// Where the session output directory appears inside the container.
pub const CONTAINER_OUTPUT_DIR: &str = "/app/execution_layer/output_data";
/// Working directory of the analysis service inside the image.
pub const CONTAINER_WORKDIR: &str = "/app";

/// Configuration for session containers.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image every session container is launched from.
    pub image: String,
    /// Resource caps applied to each container.
    pub limits: ResourceLimits,
    /// Port the analysis service listens on inside the container.
    pub container_port: u16,
    /// Host ports handed out to sessions.
    pub port_range: RangeInclusive<u16>,
    /// Grace period given to a container on stop or restart.
    pub stop_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "code-execution-env".to_string(),
            limits: ResourceLimits::default(),
            container_port: 5001,
            port_range: 5100..=5999,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Resource limits for a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Maximum memory in bytes.
    pub memory_bytes: u64,
    /// CPU quota expressed in whole or fractional cores.
    pub cpus: f64,
}

impl ResourceLimits {
    pub fn from_megabytes(memory_mb: u64, cpus: f64) -> Self {
        Self {
            memory_bytes: memory_mb * 1024 * 1024,
            cpus,
        }
    }

    /// CPU quota in the billionths-of-a-core unit Docker expects.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0).round() as i64
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from_megabytes(1024, 1.0)
    }
}

/// A host directory bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host_path: &Path, container_path: &str) -> Self {
        Self {
            host_path: host_path.display().to_string(),
            container_path: container_path.to_string(),
            read_only: true,
        }
    }

    pub fn read_write(host_path: &Path, container_path: &str) -> Self {
        Self {
            host_path: host_path.display().to_string(),
            container_path: container_path.to_string(),
            read_only: false,
        }
    }

    /// Render in Docker's `host:container:mode` bind syntax.
    pub fn to_bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.host_path, self.container_path, mode)
    }
}

/// Everything the runtime needs to create one session container.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub host_port: u16,
    pub container_port: u16,
    pub limits: ResourceLimits,
    pub working_dir: String,
}

impl LaunchSpec {
    /// Build the launch spec for a session: input read-only, output read-write,
    /// the service port published on `host_port`.
    pub fn for_session(
        config: &SandboxConfig,
        session_id: &str,
        input_dir: &Path,
        output_dir: &Path,
        host_port: u16,
    ) -> Self {
        let short_id: String = session_id.chars().take(8).collect();
        Self {
            name: format!("session-{}", short_id),
            image: config.image.clone(),
            mounts: vec![
                Mount::read_only(input_dir, CONTAINER_INPUT_DIR),
                Mount::read_write(output_dir, CONTAINER_OUTPUT_DIR),
            ],
            host_port,
            container_port: config.container_port,
            limits: config.limits.clone(),
            working_dir: CONTAINER_WORKDIR.to_string(),
        }
    }

    pub fn binds(&self) -> Vec<String> {
        self.mounts.iter().map(Mount::to_bind).collect()
    }
}
