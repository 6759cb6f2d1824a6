//! The client: sequential request/response over one connection.

use std::collections::BTreeMap;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use warren_types::{
    Container, ContainerId, Member, Node, NodeId, NodeRole, NodeStatus, Resources, SecretId,
    Service, ServiceId, ServiceSpec, Timestamp, Volume, VolumeId,
};
use warren_wire::{
    ClusterInfo, ContainerFilter, ErrorKind, Request, RequestEnvelope, Response, SecretInfo,
    StateReport, read_frame, write_frame,
};

use crate::error::{ClientError, ClientResult};
use crate::tls::ClientTls;

/// Client configuration: deadlines and optional mTLS material.
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Deadline for reads (default 5 s).
    pub read_timeout: Option<Duration>,
    /// Deadline for writes (default 10 s).
    pub write_timeout: Option<Duration>,
    /// Deadline for establishing connections (default 5 s).
    pub connect_timeout: Option<Duration>,
    /// mTLS material; plain TCP when absent (development mode).
    pub tls: Option<ClientTls>,
    /// Expected server name for TLS verification; defaults to the host
    /// part of the address.
    pub server_name: Option<String>,
}

impl ClientConfig {
    fn read_deadline(&self) -> Duration {
        self.read_timeout.unwrap_or(Duration::from_secs(5))
    }

    fn write_deadline(&self) -> Duration {
        self.write_timeout.unwrap_or(Duration::from_secs(10))
    }

    fn connect_deadline(&self) -> Duration {
        self.connect_timeout.unwrap_or(Duration::from_secs(5))
    }
}

enum Transport {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

async fn roundtrip<S>(stream: &mut S, envelope: &RequestEnvelope) -> ClientResult<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, envelope).await?;
    Ok(read_frame(stream).await?)
}

/// An RPC client bound to one manager endpoint.
pub struct Client {
    transport: Transport,
    addr: String,
    config: ClientConfig,
}

impl Client {
    /// Connects to a manager's RPC endpoint.
    pub async fn connect(addr: impl Into<String>, config: ClientConfig) -> ClientResult<Self> {
        let addr = addr.into();
        let transport = Self::open(&addr, &config).await?;
        Ok(Self {
            transport,
            addr,
            config,
        })
    }

    /// Connects to the local read-only IPC socket. Writes on this endpoint
    /// are rejected by the manager with `PermissionDenied`.
    #[cfg(unix)]
    pub async fn connect_ipc(path: impl Into<PathBuf>, config: ClientConfig) -> ClientResult<Self> {
        let path = path.into();
        let stream = tokio::net::UnixStream::connect(&path).await.map_err(|e| {
            ClientError::Connect {
                addr: path.display().to_string(),
                source: e,
            }
        })?;
        Ok(Self {
            transport: Transport::Unix(stream),
            addr: path.display().to_string(),
            config,
        })
    }

    async fn open(addr: &str, config: &ClientConfig) -> ClientResult<Transport> {
        let tcp = tokio::time::timeout(config.connect_deadline(), TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::DeadlineExceeded)?
            .map_err(|e| ClientError::Connect {
                addr: addr.to_string(),
                source: e,
            })?;

        match &config.tls {
            Some(tls) => {
                let server_name = config
                    .server_name
                    .clone()
                    .unwrap_or_else(|| addr.split(':').next().unwrap_or(addr).to_string());
                let stream = tls.connect(&server_name, tcp).await?;
                Ok(Transport::Tls(Box::new(stream)))
            }
            None => Ok(Transport::Tcp(tcp)),
        }
    }

    /// The address this client is currently talking to.
    pub fn address(&self) -> &str {
        &self.addr
    }

    async fn roundtrip_current(&mut self, envelope: &RequestEnvelope) -> ClientResult<Response> {
        match &mut self.transport {
            Transport::Tcp(stream) => roundtrip(stream, envelope).await,
            Transport::Tls(stream) => roundtrip(stream.as_mut(), envelope).await,
            #[cfg(unix)]
            Transport::Unix(stream) => roundtrip(stream, envelope).await,
        }
    }

    /// Sends one request. Writes that land on a follower are retried once
    /// against the hinted leader, reusing the same request id so the
    /// command applies at most once.
    pub async fn call(&mut self, body: Request) -> ClientResult<Response> {
        let is_write = body.is_write();
        let deadline = if is_write {
            self.config.write_deadline()
        } else {
            self.config.read_deadline()
        };
        let envelope = RequestEnvelope::new(body);

        let response = tokio::time::timeout(deadline, self.roundtrip_current(&envelope))
            .await
            .map_err(|_| ClientError::DeadlineExceeded)??;

        if let Response::Error(error) = &response {
            if error.kind == ErrorKind::NotLeader && is_write {
                if let Some(hint) = error.leader_hint.clone() {
                    debug!(leader = %hint, "redirecting write to leader");
                    self.transport = Self::open(&hint, &self.config).await?;
                    self.addr = hint;
                    let response =
                        tokio::time::timeout(deadline, self.roundtrip_current(&envelope))
                            .await
                            .map_err(|_| ClientError::DeadlineExceeded)??;
                    return Self::finish(response);
                }
            }
        }
        Self::finish(response)
    }

    fn finish(response: Response) -> ClientResult<Response> {
        match response {
            Response::Error(error) => Err(ClientError::Remote(error)),
            other => Ok(other),
        }
    }

    // ------------------------------------------------------------------
    // Cluster
    // ------------------------------------------------------------------

    pub async fn cluster_info(&mut self) -> ClientResult<ClusterInfo> {
        match self.call(Request::GetClusterInfo).await? {
            Response::ClusterInfo(info) => Ok(info),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn issue_join_token(&mut self, role: NodeRole) -> ClientResult<(String, Timestamp)> {
        match self.call(Request::IssueJoinToken { role }).await? {
            Response::JoinToken { token, expires_at } => Ok((token, expires_at)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    #[allow(clippy::type_complexity)]
    pub async fn join_cluster(
        &mut self,
        token: String,
        role: NodeRole,
        advertised_addr: String,
        resources: Resources,
        labels: BTreeMap<String, String>,
    ) -> ClientResult<(NodeId, Vec<Member>, Option<String>, Vec<u8>)> {
        let response = self
            .call(Request::JoinCluster {
                token,
                role,
                advertised_addr,
                resources,
                labels,
            })
            .await?;
        match response {
            Response::Joined {
                node_id,
                peers,
                ca_cert,
                cluster_key,
            } => Ok((node_id, peers, ca_cert, cluster_key)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn add_voter(&mut self, member: Member) -> ClientResult<()> {
        self.expect_ack(Request::AddVoter { member }).await
    }

    pub async fn remove_voter(&mut self, member_id: u8) -> ClientResult<()> {
        self.expect_ack(Request::RemoveVoter { member_id }).await
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    pub async fn create_service(&mut self, spec: ServiceSpec) -> ClientResult<Service> {
        self.expect_service(Request::CreateService { spec }).await
    }

    pub async fn get_service(&mut self, id: ServiceId) -> ClientResult<Service> {
        self.expect_service(Request::GetService { id }).await
    }

    pub async fn get_service_by_name(&mut self, name: impl Into<String>) -> ClientResult<Service> {
        self.expect_service(Request::GetServiceByName { name: name.into() })
            .await
    }

    pub async fn list_services(&mut self) -> ClientResult<Vec<Service>> {
        match self.call(Request::ListServices).await? {
            Response::Services(services) => Ok(services),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn update_service(
        &mut self,
        id: ServiceId,
        spec: ServiceSpec,
    ) -> ClientResult<Service> {
        self.expect_service(Request::UpdateService { id, spec }).await
    }

    pub async fn delete_service(&mut self, id: ServiceId) -> ClientResult<()> {
        self.expect_ack(Request::DeleteService { id }).await
    }

    pub async fn scale_service(&mut self, id: ServiceId, replicas: u64) -> ClientResult<Service> {
        self.expect_service(Request::ScaleService { id, replicas })
            .await
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    pub async fn list_containers(
        &mut self,
        filter: ContainerFilter,
    ) -> ClientResult<Vec<Container>> {
        match self.call(Request::ListContainers { filter }).await? {
            Response::Containers(containers) => Ok(containers),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn get_container(&mut self, id: ContainerId) -> ClientResult<Container> {
        match self.call(Request::GetContainer { id }).await? {
            Response::Container(container) => Ok(container),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn report_container_state(&mut self, report: StateReport) -> ClientResult<()> {
        self.expect_ack(Request::ReportContainerState { report })
            .await
    }

    /// Assignments for `node_id` that changed since `since_version`.
    pub async fn assignments(
        &mut self,
        node_id: NodeId,
        since_version: u64,
    ) -> ClientResult<(Vec<Container>, u64)> {
        let response = self
            .call(Request::StreamAssignments {
                node_id,
                since_version,
            })
            .await?;
        match response {
            Response::Assignments {
                containers,
                version,
            } => Ok((containers, version)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    pub async fn list_nodes(&mut self) -> ClientResult<Vec<Node>> {
        match self.call(Request::ListNodes).await? {
            Response::Nodes(nodes) => Ok(nodes),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn get_node(&mut self, id: NodeId) -> ClientResult<Node> {
        match self.call(Request::GetNode { id }).await? {
            Response::Node(node) => Ok(node),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn heartbeat(
        &mut self,
        node_id: NodeId,
        resources: Resources,
        status: NodeStatus,
    ) -> ClientResult<()> {
        self.expect_ack(Request::Heartbeat {
            node_id,
            resources,
            status,
        })
        .await
    }

    pub async fn drain_node(&mut self, id: NodeId) -> ClientResult<()> {
        self.expect_ack(Request::DrainNode { id }).await
    }

    // ------------------------------------------------------------------
    // Secrets
    // ------------------------------------------------------------------

    pub async fn create_secret(
        &mut self,
        name: impl Into<String>,
        value: Vec<u8>,
    ) -> ClientResult<SecretInfo> {
        let response = self
            .call(Request::CreateSecret {
                name: name.into(),
                value,
            })
            .await?;
        match response {
            Response::SecretInfo(info) => Ok(info),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn get_secret(&mut self, id: SecretId) -> ClientResult<SecretInfo> {
        match self.call(Request::GetSecret { id }).await? {
            Response::SecretInfo(info) => Ok(info),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sealed secret material for a container this node runs.
    pub async fn secret_for_container(
        &mut self,
        container_id: ContainerId,
        name: impl Into<String>,
    ) -> ClientResult<(Vec<u8>, Vec<u8>)> {
        let response = self
            .call(Request::GetSecretForContainer {
                container_id,
                name: name.into(),
            })
            .await?;
        match response {
            Response::SecretMaterial { ciphertext, nonce } => Ok((ciphertext, nonce)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn list_secrets(&mut self) -> ClientResult<Vec<SecretInfo>> {
        match self.call(Request::ListSecrets).await? {
            Response::SecretInfos(infos) => Ok(infos),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn delete_secret(&mut self, id: SecretId) -> ClientResult<()> {
        self.expect_ack(Request::DeleteSecret { id }).await
    }

    // ------------------------------------------------------------------
    // Volumes
    // ------------------------------------------------------------------

    pub async fn create_volume(
        &mut self,
        name: impl Into<String>,
        driver: impl Into<String>,
        node_affinity: Option<NodeId>,
        options: BTreeMap<String, String>,
        labels: BTreeMap<String, String>,
    ) -> ClientResult<Volume> {
        let response = self
            .call(Request::CreateVolume {
                name: name.into(),
                driver: driver.into(),
                node_affinity,
                options,
                labels,
            })
            .await?;
        match response {
            Response::Volume(volume) => Ok(volume),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn list_volumes(&mut self) -> ClientResult<Vec<Volume>> {
        match self.call(Request::ListVolumes).await? {
            Response::Volumes(volumes) => Ok(volumes),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn get_volume(&mut self, id: VolumeId) -> ClientResult<Volume> {
        match self.call(Request::GetVolume { id }).await? {
            Response::Volume(volume) => Ok(volume),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn delete_volume(&mut self, id: VolumeId) -> ClientResult<()> {
        self.expect_ack(Request::DeleteVolume { id }).await
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn expect_ack(&mut self, request: Request) -> ClientResult<()> {
        match self.call(request).await? {
            Response::Ack => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    async fn expect_service(&mut self, request: Request) -> ClientResult<Service> {
        match self.call(request).await? {
            Response::Service(service) => Ok(service),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}
