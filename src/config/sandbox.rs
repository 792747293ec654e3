use std::time::Duration;

use crate::config::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;
use crate::sandbox::{ResourceLimits, SandboxConfig};

/// Session container settings.
#[derive(Debug, Clone)]
pub struct SandboxModeConfig {
    /// Image every session container runs.
    pub image: String,
    /// Memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// CPU quota in cores.
    pub cpus: f64,
    /// Port the analysis service listens on inside the container.
    pub container_port: u16,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Grace period for stop and restart, in seconds.
    pub stop_timeout_secs: u64,
}

impl Default for SandboxModeConfig {
    fn default() -> Self {
        Self {
            image: "code-execution-env".to_string(),
            memory_limit_mb: 1024,
            cpus: 1.0,
            container_port: 5001,
            port_range_start: 5100,
            port_range_end: 5999,
            stop_timeout_secs: 10,
        }
    }
}

impl SandboxModeConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            image: parse_string_env("SANDBOX_IMAGE", "code-execution-env")?,
            memory_limit_mb: parse_optional_env("SANDBOX_MEMORY_LIMIT_MB", 1024)?,
            cpus: parse_optional_env("SANDBOX_CPUS", 1.0)?,
            container_port: parse_optional_env("SANDBOX_CONTAINER_PORT", 5001)?,
            port_range_start: parse_optional_env("SANDBOX_PORT_RANGE_START", 5100)?,
            port_range_end: parse_optional_env("SANDBOX_PORT_RANGE_END", 5999)?,
            stop_timeout_secs: parse_optional_env("SANDBOX_STOP_TIMEOUT_SECS", 10)?,
        })
    }

    /// Convert to SandboxConfig for the sandbox module.
    pub fn to_sandbox_config(&self) -> Result<SandboxConfig, ConfigError> {
        if self.port_range_start > self.port_range_end {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_PORT_RANGE_START".to_string(),
                message: format!(
                    "range start {} is above range end {}",
                    self.port_range_start, self.port_range_end
                ),
            });
        }
        if self.cpus <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_CPUS".to_string(),
                message: "must be positive".to_string(),
            });
        }

        Ok(SandboxConfig {
            image: self.image.clone(),
            limits: ResourceLimits::from_megabytes(self.memory_limit_mb, self.cpus),
            container_port: self.container_port,
            port_range: self.port_range_start..=self.port_range_end,
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        })
    }
}
