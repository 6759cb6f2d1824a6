//! Docker runtime adapter over the bollard API client.
//!
//! Containers carry a label namespace so Warren's containers are
//! distinguishable from anything else on the daemon. Idempotence leans
//! on the daemon's own semantics: name conflicts on create resolve to
//! the existing container, 304/404 answers on start/stop/delete count as
//! success.

use std::collections::HashMap;
use std::time::Duration;

use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use tracing::debug;
use warren_types::Timestamp;

use super::{ContainerRuntime, ContainerSpec, Inspection, RuntimeError, RuntimeResult, RuntimeState};

/// Label marking a container as Warren-managed.
const MANAGED_LABEL: &str = "dev.warren.managed";

/// Label carrying the owning namespace.
const NAMESPACE_LABEL: &str = "dev.warren.namespace";

/// In-container path secrets appear under.
pub const SECRETS_MOUNT_PATH: &str = "/run/secrets";

/// Docker-backed [`ContainerRuntime`].
pub struct DockerRuntime {
    docker: Docker,
    namespace: String,
}

impl DockerRuntime {
    /// Connects to the local daemon (socket or platform default).
    pub fn connect(namespace: impl Into<String>) -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self {
            docker,
            namespace: namespace.into(),
        })
    }

    fn map_err(error: bollard::errors::Error) -> RuntimeError {
        match &error {
            bollard::errors::Error::HyperResponseError { .. }
            | bollard::errors::Error::IOError { .. } => {
                RuntimeError::Unavailable(error.to_string())
            }
            _ => RuntimeError::Other(error.to_string()),
        }
    }

    /// Status codes the daemon uses for "already in that state".
    fn is_benign(error: &bollard::errors::Error, benign: &[u16]) -> bool {
        match error {
            bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
                benign.contains(status_code)
            }
            _ => false,
        }
    }
}

impl ContainerRuntime for DockerRuntime {
    fn pull_image<'a>(&'a self, image: &'a str) -> BoxFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            let options = CreateImageOptionsBuilder::default()
                .from_image(image)
                .build();
            let mut stream = self.docker.create_image(Some(options), None, None);
            while let Some(progress) = stream.next().await {
                progress.map_err(|e| RuntimeError::ImagePull(e.to_string()))?;
            }
            debug!(image, "image pulled");
            Ok(())
        })
    }

    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> BoxFuture<'a, RuntimeResult<String>> {
        Box::pin(async move {
            let env: Vec<String> = spec
                .env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();

            let mut binds: Vec<String> = spec
                .volume_binds
                .iter()
                .map(|(volume, path, read_only)| {
                    if *read_only {
                        format!("{volume}:{path}:ro")
                    } else {
                        format!("{volume}:{path}")
                    }
                })
                .collect();
            if let Some(secrets_dir) = &spec.secrets_dir {
                binds.push(format!("{}:{SECRETS_MOUNT_PATH}:ro", secrets_dir.display()));
            }

            let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
            for port in &spec.ports {
                let proto = match port.protocol {
                    warren_types::PortProtocol::Tcp => "tcp",
                    warren_types::PortProtocol::Udp => "udp",
                };
                port_bindings.insert(
                    format!("{}/{proto}", port.target),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(port.published.to_string()),
                    }]),
                );
            }

            let host_config = HostConfig {
                binds: if binds.is_empty() { None } else { Some(binds) },
                port_bindings: if port_bindings.is_empty() {
                    None
                } else {
                    Some(port_bindings)
                },
                memory: (spec.resources.memory_bytes > 0)
                    .then_some(spec.resources.memory_bytes as i64),
                nano_cpus: (spec.resources.cpu_millis > 0)
                    .then_some(spec.resources.cpu_millis as i64 * 1_000_000),
                ..Default::default()
            };

            let labels = HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (NAMESPACE_LABEL.to_string(), self.namespace.clone()),
            ]);

            let body = ContainerCreateBody {
                image: Some(spec.image.clone()),
                env: Some(env),
                labels: Some(labels),
                host_config: Some(host_config),
                ..Default::default()
            };
            let options = CreateContainerOptionsBuilder::default()
                .name(&spec.name)
                .build();

            match self.docker.create_container(Some(options), body).await {
                Ok(response) => Ok(response.id),
                // 409: a container with this name already exists, which is
                // exactly what a retried create wants.
                Err(error) if Self::is_benign(&error, &[409]) => Ok(spec.name.clone()),
                Err(error) => Err(RuntimeError::Create(error.to_string())),
            }
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            match self
                .docker
                .start_container(id, None::<StartContainerOptions>)
                .await
            {
                Ok(()) => Ok(()),
                // 304: already started.
                Err(error) if Self::is_benign(&error, &[304]) => Ok(()),
                Err(error) => Err(Self::map_err(error)),
            }
        })
    }

    fn stop<'a>(&'a self, id: &'a str, grace: Duration) -> BoxFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            let options = StopContainerOptionsBuilder::default()
                .t(grace.as_secs() as i32)
                .build();
            match self.docker.stop_container(id, Some(options)).await {
                Ok(()) => Ok(()),
                // 304: already stopped; 404: already gone.
                Err(error) if Self::is_benign(&error, &[304, 404]) => Ok(()),
                Err(error) => Err(Self::map_err(error)),
            }
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            let options = RemoveContainerOptionsBuilder::default()
                .force(true)
                .v(true)
                .build();
            match self.docker.remove_container(id, Some(options)).await {
                Ok(()) => Ok(()),
                Err(error) if Self::is_benign(&error, &[404]) => Ok(()),
                Err(error) => Err(Self::map_err(error)),
            }
        })
    }

    fn inspect<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<Inspection>> {
        Box::pin(async move {
            let response = match self
                .docker
                .inspect_container(id, None::<InspectContainerOptions>)
                .await
            {
                Ok(response) => response,
                Err(error) if Self::is_benign(&error, &[404]) => {
                    return Ok(Inspection {
                        state: RuntimeState::Missing,
                        exit_code: None,
                        started_at: None,
                        finished_at: None,
                        ip_address: None,
                    });
                }
                Err(error) => return Err(Self::map_err(error)),
            };

            let state = response.state.as_ref();
            let status = state.and_then(|s| s.status);
            let runtime_state = match status {
                Some(bollard::models::ContainerStateStatusEnum::RUNNING) => RuntimeState::Running,
                Some(bollard::models::ContainerStateStatusEnum::CREATED) => RuntimeState::Created,
                Some(_) => RuntimeState::Exited,
                None => RuntimeState::Missing,
            };

            let ip_address = response
                .network_settings
                .as_ref()
                .and_then(|n| n.networks.as_ref())
                .and_then(|networks| networks.values().next())
                .and_then(|endpoint| endpoint.ip_address.clone())
                .filter(|ip| !ip.is_empty());

            Ok(Inspection {
                state: runtime_state,
                exit_code: state.and_then(|s| s.exit_code),
                started_at: state
                    .and_then(|s| s.started_at.as_deref())
                    .and_then(parse_docker_time),
                finished_at: state
                    .and_then(|s| s.finished_at.as_deref())
                    .and_then(parse_docker_time),
                ip_address,
            })
        })
    }

    fn exec<'a>(&'a self, id: &'a str, command: &'a [String]) -> BoxFuture<'a, RuntimeResult<i64>> {
        Box::pin(async move {
            let exec = self
                .docker
                .create_exec(
                    id,
                    bollard::exec::CreateExecOptions {
                        cmd: Some(command.to_vec()),
                        attach_stdout: Some(false),
                        attach_stderr: Some(false),
                        ..Default::default()
                    },
                )
                .await
                .map_err(Self::map_err)?;
            self.docker
                .start_exec(&exec.id, None)
                .await
                .map_err(Self::map_err)?;

            // Exec completion is observed through inspect.
            loop {
                let inspect = self
                    .docker
                    .inspect_exec(&exec.id)
                    .await
                    .map_err(Self::map_err)?;
                if inspect.running != Some(true) {
                    return Ok(inspect.exit_code.unwrap_or(-1));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    }

    fn stream_logs<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<Vec<String>>> {
        Box::pin(async move {
            let options = LogsOptionsBuilder::default()
                .stdout(true)
                .stderr(true)
                .tail("100")
                .build();
            let mut stream = self.docker.logs(id, Some(options));
            let mut lines = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(Self::map_err)?;
                lines.push(chunk.to_string());
            }
            Ok(lines)
        })
    }
}

/// Docker reports RFC 3339 timestamps; the zero time means "never".
fn parse_docker_time(raw: &str) -> Option<Timestamp> {
    if raw.is_empty() || raw.starts_with("0001-") {
        return None;
    }
    // Seconds-level precision is plenty for lifecycle bookkeeping.
    let epoch = std::time::SystemTime::UNIX_EPOCH;
    humantime_parse(raw).map(|t| {
        Timestamp::from_millis(
            t.duration_since(epoch)
                .map_or(0, |d| d.as_millis() as u64),
        )
    })
}

/// Minimal RFC 3339 parse (date + time + fractional seconds + Z).
fn humantime_parse(raw: &str) -> Option<std::time::SystemTime> {
    let bytes = raw.as_bytes();
    if bytes.len() < 20 {
        return None;
    }
    let year: u64 = raw.get(0..4)?.parse().ok()?;
    let month: u64 = raw.get(5..7)?.parse().ok()?;
    let day: u64 = raw.get(8..10)?.parse().ok()?;
    let hour: u64 = raw.get(11..13)?.parse().ok()?;
    let minute: u64 = raw.get(14..16)?.parse().ok()?;
    let second: u64 = raw.get(17..19)?.parse().ok()?;

    // Days since the epoch, civil-calendar arithmetic.
    let y = if month <= 2 { year - 1 } else { year };
    let era = y / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;

    let secs = days * 86_400 + hour * 3_600 + minute * 60 + second;
    Some(std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
}
