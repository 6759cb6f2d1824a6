//! Request handler: routes RPCs into store reads and log submissions.
//!
//! Every write follows the same path: validate syntactically, build the
//! command (minting ids and reading the clock here, never in apply),
//! submit to the log, answer only after apply completes. Writes that land
//! on a follower are transparently forwarded to the hinted leader; when
//! no leader is known the caller gets a structured `NotLeader`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use warren_crypto::ClusterKey;
use warren_fsm::{ApplyOutcome, Command, ContainerStateUpdate, Fsm, NodeStatusUpdate};
use warren_log::{LogError, LogHandle};
use warren_types::{
    Container, ContainerId, JoinToken, Node, NodeId, NodeRole, NodeStatus, RequestId, Resources,
    Secret, SecretId, Service, ServiceId, ServiceMode, ServiceSpec, Timestamp, Version, Volume,
    VolumeId, JOIN_TOKEN_TTL_MS,
};
use warren_wire::{
    ClusterInfo, ContainerFilter, Request, RequestEnvelope, Response, SecretInfo, StateReport,
};

use crate::error::{ManagerError, ManagerResult};
use crate::forward;
use crate::view;

/// Which endpoint a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The mTLS network listener: full read/write surface.
    Network,
    /// The local IPC socket: reads only, no secret material.
    LocalReadOnly,
}

/// Shared context for all connections.
pub struct ManagerContext {
    pub log: LogHandle,
    pub cluster_key: ClusterKey,
    /// PEM of the cluster CA, handed to joining nodes.
    pub ca_cert_pem: Option<String>,
    /// TLS material for forwarding writes to the leader.
    pub forward_tls: Option<tokio_rustls::TlsConnector>,
    pub write_deadline: Duration,
}

/// Handles decoded request envelopes.
#[derive(Clone)]
pub struct RequestHandler {
    ctx: Arc<ManagerContext>,
}

impl RequestHandler {
    pub fn new(ctx: Arc<ManagerContext>) -> Self {
        Self { ctx }
    }

    /// Handles one envelope, forwarding writes to the leader if needed.
    #[instrument(skip_all, fields(request_id = %envelope.request_id))]
    pub async fn handle(&self, envelope: RequestEnvelope, endpoint: Endpoint) -> Response {
        let is_write = envelope.body.is_write();
        match self.handle_inner(&envelope, endpoint).await {
            Ok(response) => response,
            Err(ManagerError::Log(LogError::NotLeader { hint: Some(hint) }))
                if is_write && endpoint == Endpoint::Network =>
            {
                debug!(leader = %hint, "forwarding write to leader");
                match forward::to_leader(&hint, &envelope, self.ctx.forward_tls.as_ref()).await {
                    Ok(response) => response,
                    Err(error) => {
                        warn!(%error, "leader forward failed");
                        Response::Error(error.to_wire())
                    }
                }
            }
            Err(error) => Response::Error(error.to_wire()),
        }
    }

    async fn handle_inner(
        &self,
        envelope: &RequestEnvelope,
        endpoint: Endpoint,
    ) -> ManagerResult<Response> {
        if endpoint == Endpoint::LocalReadOnly
            && (envelope.body.is_write()
                || matches!(envelope.body, Request::GetSecretForContainer { .. }))
        {
            return Err(ManagerError::PermissionDenied);
        }

        match envelope.body.clone() {
            // ----------------------------------------------------------
            // Cluster
            // ----------------------------------------------------------
            Request::GetClusterInfo => self.cluster_info(),
            Request::IssueJoinToken { role } => self.issue_join_token(role).await,
            Request::JoinCluster {
                token,
                role,
                advertised_addr,
                resources,
                labels,
            } => {
                self.join_cluster(token, role, advertised_addr, resources, labels)
                    .await
            }
            Request::AddVoter { member } => {
                if member.address.is_empty() || member.rpc_address.is_empty() {
                    return Err(ManagerError::Validation(
                        "voter addresses must not be empty".to_string(),
                    ));
                }
                self.submit(Command::AddVoter {
                    request_id: envelope.request_id.clone(),
                    member,
                })
                .await?;
                Ok(Response::Ack)
            }
            Request::RemoveVoter { member_id } => {
                self.submit(Command::RemoveVoter {
                    request_id: envelope.request_id.clone(),
                    member_id,
                })
                .await?;
                Ok(Response::Ack)
            }

            // ----------------------------------------------------------
            // Services
            // ----------------------------------------------------------
            Request::CreateService { spec } => {
                validate_spec(&spec)?;
                let now = Timestamp::now();
                let service = Service {
                    id: ServiceId::generate(),
                    spec,
                    created_at: now,
                    updated_at: now,
                    version: Version::ZERO,
                };
                let id = service.id.clone();
                self.submit(Command::CreateService {
                    request_id: envelope.request_id.clone(),
                    service,
                })
                .await?;
                Ok(Response::Service(self.read_service(&id)?))
            }
            Request::GetService { id } => Ok(Response::Service(self.read_service(&id)?)),
            Request::GetServiceByName { name } => {
                let service = self
                    .with_store(|fsm| view::service_by_name(fsm.store(), &name))??
                    .ok_or_else(|| ManagerError::NotFound(format!("service '{name}'")))?;
                Ok(Response::Service(service))
            }
            Request::ListServices => {
                let services = self.with_store(|fsm| view::services(fsm.store()))??;
                Ok(Response::Services(services))
            }
            Request::UpdateService { id, spec } => {
                validate_spec(&spec)?;
                self.read_service(&id)?;
                self.submit(Command::UpdateService {
                    request_id: envelope.request_id.clone(),
                    service_id: id.clone(),
                    spec,
                    updated_at: Timestamp::now(),
                })
                .await?;
                Ok(Response::Service(self.read_service(&id)?))
            }
            Request::DeleteService { id } => {
                self.submit(Command::DeleteService {
                    request_id: envelope.request_id.clone(),
                    service_id: id,
                })
                .await?;
                Ok(Response::Ack)
            }
            Request::ScaleService { id, replicas } => {
                let service = self.read_service(&id)?;
                let ServiceMode::Replicated { .. } = service.spec.mode else {
                    return Err(ManagerError::Validation(format!(
                        "service '{}' is global and cannot be scaled",
                        service.spec.name
                    )));
                };
                let mut spec = service.spec;
                spec.mode = ServiceMode::Replicated { replicas };
                self.submit(Command::UpdateService {
                    request_id: envelope.request_id.clone(),
                    service_id: id.clone(),
                    spec,
                    updated_at: Timestamp::now(),
                })
                .await?;
                Ok(Response::Service(self.read_service(&id)?))
            }

            // ----------------------------------------------------------
            // Containers
            // ----------------------------------------------------------
            Request::ListContainers { filter } => {
                let containers = self.with_store(|fsm| {
                    let store = fsm.store();
                    match &filter {
                        ContainerFilter::All => view::containers(store),
                        ContainerFilter::ByService(id) => view::containers_for_service(store, id),
                        ContainerFilter::ByNode(id) => view::containers_for_node(store, id),
                    }
                })??;
                Ok(Response::Containers(containers))
            }
            Request::GetContainer { id } => {
                let container = self.read_container(&id)?;
                Ok(Response::Container(container))
            }
            Request::ReportContainerState { report } => self.report_state(report).await,
            Request::StreamAssignments {
                node_id,
                since_version,
            } => {
                let (containers, version) = self.with_store(|fsm| {
                    let containers =
                        view::assignments_since(fsm.store(), &node_id, since_version)?;
                    Ok::<_, ManagerError>((containers, fsm.applied_index()))
                })??;
                Ok(Response::Assignments {
                    containers,
                    version,
                })
            }

            // ----------------------------------------------------------
            // Nodes
            // ----------------------------------------------------------
            Request::ListNodes => {
                let nodes = self.with_store(|fsm| view::nodes(fsm.store()))??;
                Ok(Response::Nodes(nodes))
            }
            Request::GetNode { id } => {
                let node: Node = self
                    .with_store(|fsm| {
                        fsm.store()
                            .get_record(warren_store::Collection::Nodes, id.as_str())
                    })?
                    .map_err(|_| ManagerError::NotFound(format!("node {id}")))?;
                Ok(Response::Node(node))
            }
            Request::Heartbeat {
                node_id,
                resources,
                status,
            } => {
                let mut update = NodeStatusUpdate::heartbeat(Timestamp::now(), resources);
                if status == NodeStatus::Down {
                    update.status = Some(NodeStatus::Down);
                }
                self.submit(Command::UpdateNodeStatus {
                    request_id: envelope.request_id.clone(),
                    node_id,
                    update,
                })
                .await?;
                Ok(Response::Ack)
            }
            Request::DrainNode { id } => {
                self.submit(Command::UpdateNodeStatus {
                    request_id: envelope.request_id.clone(),
                    node_id: id,
                    update: NodeStatusUpdate::drain(),
                })
                .await?;
                Ok(Response::Ack)
            }

            // ----------------------------------------------------------
            // Secrets
            // ----------------------------------------------------------
            Request::CreateSecret { name, value } => {
                if name.is_empty() {
                    return Err(ManagerError::Validation(
                        "secret name must not be empty".to_string(),
                    ));
                }
                // Seal before anything durable sees the plaintext.
                let (ciphertext, nonce) = self.ctx.cluster_key.seal(&value)?;
                let secret = Secret {
                    id: SecretId::generate(),
                    name,
                    ciphertext,
                    nonce,
                    created_at: Timestamp::now(),
                    version: Version::ZERO,
                };
                let info = SecretInfo::from(&secret);
                self.submit(Command::CreateSecret {
                    request_id: envelope.request_id.clone(),
                    secret,
                })
                .await?;
                Ok(Response::SecretInfo(info))
            }
            Request::GetSecret { id } => {
                let secret = self.read_secret(&id)?;
                Ok(Response::SecretInfo(SecretInfo::from(&secret)))
            }
            Request::GetSecretForContainer { container_id, name } => {
                let container = self.read_container(&container_id)?;
                if !container.secrets.iter().any(|r| r.name == name) {
                    return Err(ManagerError::NotFound(format!(
                        "container {container_id} does not reference secret '{name}'"
                    )));
                }
                let secret = self
                    .with_store(|fsm| view::secret_by_name(fsm.store(), &name))??
                    .ok_or_else(|| ManagerError::NotFound(format!("secret '{name}'")))?;
                Ok(Response::SecretMaterial {
                    ciphertext: secret.ciphertext,
                    nonce: secret.nonce,
                })
            }
            Request::ListSecrets => {
                let secrets = self.with_store(|fsm| view::secrets(fsm.store()))??;
                Ok(Response::SecretInfos(
                    secrets.iter().map(SecretInfo::from).collect(),
                ))
            }
            Request::DeleteSecret { id } => {
                self.submit(Command::DeleteSecret {
                    request_id: envelope.request_id.clone(),
                    secret_id: id,
                })
                .await?;
                Ok(Response::Ack)
            }

            // ----------------------------------------------------------
            // Volumes
            // ----------------------------------------------------------
            Request::CreateVolume {
                name,
                driver,
                node_affinity,
                options,
                labels,
            } => {
                if name.is_empty() {
                    return Err(ManagerError::Validation(
                        "volume name must not be empty".to_string(),
                    ));
                }
                let volume = Volume {
                    id: VolumeId::generate(),
                    name: name.clone(),
                    driver,
                    node_affinity,
                    options,
                    labels,
                    created_at: Timestamp::now(),
                    version: Version::ZERO,
                };
                self.submit(Command::CreateVolume {
                    request_id: envelope.request_id.clone(),
                    volume,
                })
                .await?;
                let stored = self
                    .with_store(|fsm| view::volume_by_name(fsm.store(), &name))??
                    .ok_or_else(|| ManagerError::NotFound(format!("volume '{name}'")))?;
                Ok(Response::Volume(stored))
            }
            Request::ListVolumes => {
                let volumes = self.with_store(|fsm| view::volumes(fsm.store()))??;
                Ok(Response::Volumes(volumes))
            }
            Request::GetVolume { id } => {
                let volume: Volume = self
                    .with_store(|fsm| {
                        fsm.store()
                            .get_record(warren_store::Collection::Volumes, id.as_str())
                    })?
                    .map_err(|_| ManagerError::NotFound(format!("volume {id}")))?;
                Ok(Response::Volume(volume))
            }
            Request::DeleteVolume { id } => {
                self.submit(Command::DeleteVolume {
                    request_id: envelope.request_id.clone(),
                    volume_id: id,
                })
                .await?;
                Ok(Response::Ack)
            }
        }
    }

    // ------------------------------------------------------------------
    // Cluster operations
    // ------------------------------------------------------------------

    fn cluster_info(&self) -> ManagerResult<Response> {
        let status = self.ctx.log.leader_status();
        let (members, node_count, service_count, container_count) = self.with_store(|fsm| {
            let store = fsm.store();
            (
                fsm.membership().members,
                store.len(warren_store::Collection::Nodes),
                store.len(warren_store::Collection::Services),
                store.len(warren_store::Collection::Containers),
            )
        })?;
        Ok(Response::ClusterInfo(ClusterInfo {
            leader_address: status.leader_address,
            view: status.view,
            members,
            node_count,
            service_count,
            container_count,
        }))
    }

    async fn issue_join_token(&self, role: NodeRole) -> ManagerResult<Response> {
        let token = JoinToken {
            secret: warren_crypto::generate_token_secret(),
            role,
            expires_at: Timestamp::now().plus_millis(JOIN_TOKEN_TTL_MS),
            consumed: false,
        };
        let secret = token.secret.clone();
        let expires_at = token.expires_at;
        self.submit(Command::IssueJoinToken {
            request_id: RequestId::generate(),
            token,
        })
        .await?;
        Ok(Response::JoinToken {
            token: secret,
            expires_at,
        })
    }

    async fn join_cluster(
        &self,
        token: String,
        role: NodeRole,
        advertised_addr: String,
        resources: Resources,
        labels: std::collections::BTreeMap<String, String>,
    ) -> ManagerResult<Response> {
        let now = Timestamp::now();

        // Cheap precheck for a friendly error; the consume command
        // re-validates atomically at apply.
        let stored: JoinToken = self
            .with_store(|fsm| {
                fsm.store()
                    .get_record(warren_store::Collection::JoinTokens, &token)
            })?
            .map_err(|_| ManagerError::Validation("join token not recognized".to_string()))?;
        if !stored.admits(role, now) {
            return Err(ManagerError::Validation(
                "join token is expired, consumed, or for a different role".to_string(),
            ));
        }

        let node = Node {
            id: NodeId::generate(),
            role,
            address: advertised_addr,
            resources,
            labels,
            last_heartbeat: now,
            status: NodeStatus::Ready,
            drained: false,
            version: Version::ZERO,
        };
        let node_id = node.id.clone();

        // Consume + register atomically: a lost race on the token admits
        // no node.
        self.submit(Command::Batch {
            request_id: RequestId::generate(),
            commands: vec![
                Command::ConsumeJoinToken {
                    request_id: RequestId::generate(),
                    secret: token,
                    now,
                },
                Command::RegisterNode {
                    request_id: RequestId::generate(),
                    node,
                },
            ],
        })
        .await?;

        let peers = self.with_store(|fsm| fsm.membership().members)?;
        Ok(Response::Joined {
            node_id,
            peers,
            ca_cert: self.ctx.ca_cert_pem.clone(),
            cluster_key: self.ctx.cluster_key_bytes(),
        })
    }

    async fn report_state(&self, report: StateReport) -> ManagerResult<Response> {
        let update = ContainerStateUpdate {
            actual_state: Some(report.actual_state),
            health_status: Some(report.health_status),
            exit_code: report.exit_code,
            started_at: report.started_at,
            finished_at: report.finished_at,
            observed_version: Some(report.observed_version),
            ..ContainerStateUpdate::default()
        };
        let outcome = self
            .submit(Command::UpdateContainerState {
                request_id: RequestId::generate(),
                container_id: report.container_id,
                update,
            })
            .await?;
        if outcome == ApplyOutcome::Stale {
            debug!("stale state report dropped");
        }
        Ok(Response::Ack)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn submit(&self, command: Command) -> ManagerResult<ApplyOutcome> {
        Ok(self
            .ctx
            .log
            .submit(command, self.ctx.write_deadline)
            .await?)
    }

    fn with_store<T>(&self, f: impl FnOnce(&Fsm) -> T) -> ManagerResult<T> {
        let fsm = self.ctx.log.fsm();
        let guard = fsm.read()?;
        Ok(f(&guard))
    }

    fn read_service(&self, id: &ServiceId) -> ManagerResult<Service> {
        self.with_store(|fsm| {
            fsm.store()
                .get_record(warren_store::Collection::Services, id.as_str())
        })?
        .map_err(|_| ManagerError::NotFound(format!("service {id}")))
    }

    fn read_container(&self, id: &ContainerId) -> ManagerResult<Container> {
        self.with_store(|fsm| {
            fsm.store()
                .get_record(warren_store::Collection::Containers, id.as_str())
        })?
        .map_err(|_| ManagerError::NotFound(format!("container {id}")))
    }

    fn read_secret(&self, id: &SecretId) -> ManagerResult<Secret> {
        self.with_store(|fsm| {
            fsm.store()
                .get_record(warren_store::Collection::Secrets, id.as_str())
        })?
        .map_err(|_| ManagerError::NotFound(format!("secret {id}")))
    }
}

impl ManagerContext {
    fn cluster_key_bytes(&self) -> Vec<u8> {
        // Only reachable over the mTLS join path.
        self.cluster_key.to_bytes().to_vec()
    }
}

/// Syntactic validation, before anything reaches the log.
fn validate_spec(spec: &ServiceSpec) -> ManagerResult<()> {
    if spec.name.is_empty() {
        return Err(ManagerError::Validation(
            "service name must not be empty".to_string(),
        ));
    }
    if !spec
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ManagerError::Validation(format!(
            "service name '{}' contains invalid characters",
            spec.name
        )));
    }
    if spec.image.is_empty() {
        return Err(ManagerError::Validation(
            "image must not be empty".to_string(),
        ));
    }
    for mount in &spec.mounts {
        if !mount.path.starts_with('/') {
            return Err(ManagerError::Validation(format!(
                "mount path '{}' must be absolute",
                mount.path
            )));
        }
    }
    for port in &spec.ports {
        if port.target == 0 {
            return Err(ManagerError::Validation(
                "target port must not be zero".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: "nginx:latest".to_string(),
            mode: ServiceMode::Replicated { replicas: 1 },
            env: std::collections::BTreeMap::new(),
            secrets: vec![],
            mounts: vec![],
            ports: vec![],
            health_check: None,
            restart_policy: warren_types::RestartPolicy::default(),
            strategy: warren_types::DeployStrategy::default(),
            resources: Resources::default(),
            constraints: std::collections::BTreeMap::new(),
            stop_timeout_ms: 10_000,
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(validate_spec(&minimal_spec("web-1")).is_ok());
    }

    #[test]
    fn bad_names_rejected() {
        assert!(validate_spec(&minimal_spec("")).is_err());
        assert!(validate_spec(&minimal_spec("web service")).is_err());
        assert!(validate_spec(&minimal_spec("web/1")).is_err());
    }

    #[test]
    fn relative_mount_path_rejected() {
        let mut spec = minimal_spec("db");
        spec.mounts.push(warren_types::MountSpec {
            volume: "data".to_string(),
            path: "var/lib/db".to_string(),
            read_only: false,
        });
        assert!(validate_spec(&spec).is_err());
    }
}
