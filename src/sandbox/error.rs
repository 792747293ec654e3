//! Error types for the container sandbox layer.

/// Errors raised by the port allocator and the container driver.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not available or not running.
    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    /// Every port in the session range is either tracked or bound on the host.
    #[error("No free ports available in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    /// The runtime refused to create or run the container.
    #[error("Container launch failed: {reason}")]
    ContainerLaunchFailed { reason: String },

    /// The container exists but could not be brought to the running state.
    #[error("Failed to start container {container_id}: {reason}")]
    ContainerStartFailed {
        container_id: String,
        reason: String,
    },

    /// The runtime has no container with this id.
    #[error("Container {container_id} not found")]
    ContainerNotFound { container_id: String },

    /// Docker API error.
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SandboxError::ContainerNotFound { .. })
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
