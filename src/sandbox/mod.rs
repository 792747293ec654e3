//! Per-session analysis containers.
//!
//! Every session gets one container running the analysis service, with the
//! session's input directory mounted read-only and its output directory
//! mounted read-write. The service port is published on a host port taken
//! from a fixed range by [`PortAllocator`].

pub mod config;
pub mod container;
pub mod error;
pub mod port;

pub use config::{LaunchSpec, Mount, ResourceLimits, SandboxConfig};
pub use container::{ContainerRuntime, ContainerStatus, DockerRuntime, connect_docker};
pub use error::SandboxError;
pub use port::PortAllocator;
