//! Docker container lifecycle for analysis sessions.
//!
//! Each session owns one long-running container:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Session Container                             │
//! │                                                                   │
//! │  Mounts:                                                          │
//! │    /app/execution_layer/input_data  ─▶ session input dir (ro)     │
//! │    /app/execution_layer/output_data ─▶ session output dir (rw)    │
//! │                                                                   │
//! │  Network:                                                         │
//! │    bridge, service port published on a host port from the range   │
//! │    host.docker.internal ─▶ host gateway                           │
//! │                                                                   │
//! │  Limits:                                                          │
//! │    Memory: 1GB (default)                                          │
//! │    CPU: 1 core                                                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`ContainerRuntime`] is the seam the session registry and the dispatcher
//! talk to. [`DockerRuntime`] is the bollard-backed implementation.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, EndpointSettings, HostConfig, PortBinding};
use futures::StreamExt;

use crate::sandbox::config::LaunchSpec;
use crate::sandbox::error::{Result, SandboxError};

/// Lifecycle state reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    pub fn is_running(self) -> bool {
        self == ContainerStatus::Running
    }

    fn from_docker(status: Option<ContainerStateStatusEnum>) -> Self {
        match status {
            Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
            Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
            Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
            Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Operations the orchestrator needs from a container runtime.
///
/// Lookups on an id the runtime does not know return
/// [`SandboxError::ContainerNotFound`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, returning its id.
    async fn launch(&self, spec: &LaunchSpec) -> Result<String>;

    async fn status(&self, container_id: &str) -> Result<ContainerStatus>;

    async fn start(&self, container_id: &str) -> Result<()>;

    async fn restart(&self, container_id: &str, timeout: Duration) -> Result<()>;

    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<()>;

    /// Force-remove the container.
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Address of the container on its bridge network, if it has one.
    async fn ip_address(&self, container_id: &str) -> Result<Option<String>>;

    /// Full timestamped stdout and stderr of the container.
    async fn logs(&self, container_id: &str) -> Result<String>;
}

/// Container runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect to the local daemon, see [`connect_docker`].
    pub async fn connect() -> Result<Self> {
        Ok(Self::new(connect_docker().await?))
    }

    /// Check if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    async fn inspect(
        &self,
        container_id: &str,
    ) -> Result<bollard::models::ContainerInspectResponse> {
        self.docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_error(container_id, e))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        let port_key = format!("{}/tcp", spec.container_port);

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key.clone(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            binds: Some(spec.binds()),
            port_bindings: Some(port_bindings),
            memory: Some(spec.limits.memory_bytes as i64),
            nano_cpus: Some(spec.limits.nano_cpus()),
            network_mode: Some("bridge".to_string()),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            exposed_ports: Some(exposed_ports),
            working_dir: Some(spec.working_dir.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::ContainerLaunchFailed {
                reason: e.to_string(),
            })?;

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.remove(&response.id).await;
            return Err(SandboxError::ContainerLaunchFailed {
                reason: e.to_string(),
            });
        }

        tracing::debug!(container_id = %response.id, host_port = spec.host_port, "Launched container");
        Ok(response.id)
    }

    async fn status(&self, container_id: &str) -> Result<ContainerStatus> {
        let inspect = self.inspect(container_id).await?;
        Ok(ContainerStatus::from_docker(
            inspect.state.and_then(|state| state.status),
        ))
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error(container_id, e)),
        }
    }

    async fn restart(&self, container_id: &str, timeout: Duration) -> Result<()> {
        self.docker
            .restart_container(
                container_id,
                Some(RestartContainerOptions {
                    t: timeout.as_secs() as isize,
                }),
            )
            .await
            .map_err(|e| map_docker_error(container_id, e))
    }

    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<()> {
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error(container_id, e)),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_error(container_id, e))
    }

    async fn ip_address(&self, container_id: &str) -> Result<Option<String>> {
        let inspect = self.inspect(container_id).await?;
        let networks = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();
        Ok(pick_ip_address(&networks))
    }

    async fn logs(&self, container_id: &str) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            follow: false,
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_id, Some(options));
        let mut output = String::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::StdIn { message })
                | Ok(LogOutput::Console { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Err(e) => return Err(map_docker_error(container_id, e)),
            }
        }

        Ok(output)
    }
}

/// Prefer the default bridge network, else the first network (by name) with an address.
fn pick_ip_address(networks: &HashMap<String, EndpointSettings>) -> Option<String> {
    let usable = |settings: &EndpointSettings| {
        settings
            .ip_address
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
    };

    if let Some(ip) = networks.get("bridge").and_then(usable) {
        return Some(ip);
    }

    let mut names: Vec<&String> = networks.keys().collect();
    names.sort();
    names
        .into_iter()
        .find_map(|name| networks.get(name).and_then(usable))
}

fn map_docker_error(container_id: &str, err: bollard::errors::Error) -> SandboxError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => SandboxError::ContainerNotFound {
            container_id: container_id.to_string(),
        },
        other => SandboxError::Docker(other),
    }
}

/// Connect to the Docker daemon.
///
/// Tries these locations in order:
/// 1. `DOCKER_HOST` env var (bollard default)
/// 2. `/var/run/docker.sock` (Linux default)
/// 3. `~/.docker/run/docker.sock` (Docker Desktop on macOS)
pub async fn connect_docker() -> Result<Docker> {
    if let Ok(docker) = Docker::connect_with_local_defaults()
        && docker.ping().await.is_ok()
    {
        return Ok(docker);
    }

    if let Some(home) = dirs::home_dir() {
        let desktop_sock = home.join(".docker/run/docker.sock");
        if desktop_sock.exists() {
            let sock_str = desktop_sock.to_string_lossy();
            if let Ok(docker) =
                Docker::connect_with_socket(&sock_str, 120, bollard::API_DEFAULT_VERSION)
                && docker.ping().await.is_ok()
            {
                return Ok(docker);
            }
        }
    }

    Err(SandboxError::DockerNotAvailable {
        reason: "Socket not found: /var/run/docker.sock".to_string(),
    })
}
