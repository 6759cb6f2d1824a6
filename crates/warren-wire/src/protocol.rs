//! The RPC namespace: request and response shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use warren_types::{
    ActualState, Container, ContainerId, HealthStatus, Member, Node, NodeId, NodeRole,
    NodeStatus, RequestId, Resources, Secret, SecretId, Service, ServiceId, ServiceSpec,
    Timestamp, Version, Volume, VolumeId,
};

/// Every RPC travels in an envelope carrying its idempotency key.
///
/// Reads ignore the request id; writes dedup on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub body: Request,
}

impl RequestEnvelope {
    pub fn new(body: Request) -> Self {
        Self {
            request_id: RequestId::generate(),
            body,
        }
    }
}

/// Container list filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerFilter {
    All,
    ByService(ServiceId),
    ByNode(NodeId),
}

/// A worker's report of a container's observed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReport {
    pub container_id: ContainerId,
    pub actual_state: ActualState,
    pub health_status: HealthStatus,
    pub exit_code: Option<i64>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    /// Version of the assignment this report was produced against.
    pub observed_version: Version,
}

/// The request side of the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    // ------------------------------------------------------------------
    // Cluster
    // ------------------------------------------------------------------
    GetClusterInfo,
    IssueJoinToken {
        role: NodeRole,
    },
    JoinCluster {
        token: String,
        role: NodeRole,
        advertised_addr: String,
        resources: Resources,
        labels: BTreeMap<String, String>,
    },
    AddVoter {
        member: Member,
    },
    RemoveVoter {
        member_id: u8,
    },

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------
    CreateService {
        spec: ServiceSpec,
    },
    GetService {
        id: ServiceId,
    },
    GetServiceByName {
        name: String,
    },
    ListServices,
    UpdateService {
        id: ServiceId,
        spec: ServiceSpec,
    },
    DeleteService {
        id: ServiceId,
    },
    ScaleService {
        id: ServiceId,
        replicas: u64,
    },

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------
    ListContainers {
        filter: ContainerFilter,
    },
    GetContainer {
        id: ContainerId,
    },
    /// Worker → manager.
    ReportContainerState {
        report: StateReport,
    },
    /// Worker → manager: assignments for a node changed since `since`.
    StreamAssignments {
        node_id: NodeId,
        since_version: u64,
    },

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------
    ListNodes,
    GetNode {
        id: NodeId,
    },
    Heartbeat {
        node_id: NodeId,
        resources: Resources,
        status: NodeStatus,
    },
    DrainNode {
        id: NodeId,
    },

    // ------------------------------------------------------------------
    // Secrets
    // ------------------------------------------------------------------
    /// Plaintext travels only on the mTLS channel; the manager seals it
    /// before anything is stored.
    CreateSecret {
        name: String,
        value: Vec<u8>,
    },
    GetSecret {
        id: SecretId,
    },
    /// Worker → manager: sealed material for a container's secret.
    GetSecretForContainer {
        container_id: ContainerId,
        name: String,
    },
    ListSecrets,
    DeleteSecret {
        id: SecretId,
    },

    // ------------------------------------------------------------------
    // Volumes
    // ------------------------------------------------------------------
    CreateVolume {
        name: String,
        driver: String,
        /// For the local driver: pin the volume (and everything mounting
        /// it) to this node. The scheduler pins it at first placement
        /// when absent.
        node_affinity: Option<NodeId>,
        options: BTreeMap<String, String>,
        labels: BTreeMap<String, String>,
    },
    ListVolumes,
    GetVolume {
        id: VolumeId,
    },
    DeleteVolume {
        id: VolumeId,
    },
}

impl Request {
    /// True for requests that mutate cluster state. The local IPC endpoint
    /// rejects these.
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Request::GetClusterInfo
                | Request::GetService { .. }
                | Request::GetServiceByName { .. }
                | Request::ListServices
                | Request::ListContainers { .. }
                | Request::GetContainer { .. }
                | Request::StreamAssignments { .. }
                | Request::ListNodes
                | Request::GetNode { .. }
                | Request::GetSecret { .. }
                | Request::GetSecretForContainer { .. }
                | Request::ListSecrets
                | Request::ListVolumes
                | Request::GetVolume { .. }
        )
    }
}

/// Error taxonomy carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad input; do not retry.
    Validation,
    /// Retry against the hinted leader.
    NotLeader,
    /// Cluster is read-only until quorum returns.
    QuorumLost,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    DeadlineExceeded,
    /// Bug on the server side; logged there, surfaced here.
    Internal,
}

/// A structured RPC error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    /// For `NotLeader`: where to retry.
    pub leader_hint: Option<String>,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            leader_hint: None,
        }
    }

    pub fn not_leader(hint: Option<String>) -> Self {
        Self {
            kind: ErrorKind::NotLeader,
            message: "not the leader".to_string(),
            leader_hint: hint,
        }
    }
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Secret metadata, the only shape most callers may see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretInfo {
    pub id: SecretId,
    pub name: String,
    pub created_at: Timestamp,
}

impl From<&Secret> for SecretInfo {
    fn from(secret: &Secret) -> Self {
        Self {
            id: secret.id.clone(),
            name: secret.name.clone(),
            created_at: secret.created_at,
        }
    }
}

/// Cluster-wide summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub leader_address: Option<String>,
    pub view: u64,
    pub members: Vec<Member>,
    pub node_count: usize,
    pub service_count: usize,
    pub container_count: usize,
}

/// The response side of the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Error(ErrorBody),
    /// Writes with no payload: delete, drain, report, voter changes.
    Ack,

    ClusterInfo(ClusterInfo),
    JoinToken {
        token: String,
        expires_at: Timestamp,
    },
    Joined {
        node_id: NodeId,
        peers: Vec<Member>,
        /// CA certificate for the cluster, PEM. Identity issuance itself
        /// is an external collaborator.
        ca_cert: Option<String>,
        /// The cluster key, for worker-side secret materialization.
        cluster_key: Vec<u8>,
    },

    Service(Service),
    Services(Vec<Service>),

    Container(Container),
    Containers(Vec<Container>),
    Assignments {
        containers: Vec<Container>,
        /// High-water version; pass back as `since_version`.
        version: u64,
    },

    Node(Node),
    Nodes(Vec<Node>),

    SecretInfo(SecretInfo),
    SecretInfos(Vec<SecretInfo>),
    SecretMaterial {
        ciphertext: Vec<u8>,
        nonce: Vec<u8>,
    },

    Volume(Volume),
    Volumes(Vec<Volume>),
}
