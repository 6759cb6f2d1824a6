//! # warren-types: Core types for Warren
//!
//! This crate contains the shared types used across the Warren system:
//! - Entity IDs ([`NodeId`], [`ServiceId`], [`ContainerId`], [`SecretId`], [`VolumeId`])
//! - Temporal types ([`Timestamp`])
//! - Record versioning ([`Version`])
//! - Cluster entities ([`Node`], [`Service`], [`Container`], [`Secret`], [`Volume`], [`JoinToken`])
//! - Idempotency ([`RequestId`])
//! - Declarative manifests ([`manifest::Manifest`])
//!
//! Everything here is plain data: serializable, comparable, and free of any
//! I/O. Identifier ordering is lexicographic, which the scheduler relies on
//! for deterministic drain order.

pub mod manifest;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs
// ============================================================================

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Mints a fresh random identifier.
            ///
            /// Never called during log apply; identifiers are minted by the
            /// leader and carried inside commands.
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, uuid::Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

string_id!(
    /// Unique identifier for a node in the cluster.
    NodeId,
    "node"
);

string_id!(
    /// Unique identifier for a service.
    ServiceId,
    "svc"
);

string_id!(
    /// Unique identifier for a container (one running instance of a service).
    ContainerId,
    "ctr"
);

string_id!(
    /// Unique identifier for a secret.
    SecretId,
    "sec"
);

string_id!(
    /// Unique identifier for a volume.
    VolumeId,
    "vol"
);

/// Client-generated idempotency key attached to every write command.
///
/// Submitting the same command (same request id) any number of times has the
/// same effect as submitting it once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Temporal types
// ============================================================================

/// Milliseconds since the Unix epoch.
///
/// Commands carry the timestamps they need; the FSM never reads the wall
/// clock during apply.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Reads the wall clock.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self(millis)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed from `earlier` to `self`, saturating at zero.
    pub fn millis_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn plus_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone record version, stamped from the log apply index.
///
/// Stale state reports carry an older version and are dropped at apply.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Version(u64);

impl Version {
    pub const ZERO: Version = Version(0);

    pub fn new(v: u64) -> Self {
        Self(v)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Node
// ============================================================================

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Hosts the replicated state and makes scheduling decisions.
    Manager,
    /// Runs containers.
    Worker,
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Manager => write!(f, "manager"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// Liveness status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Ready,
    Down,
    #[default]
    Unknown,
}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Ready => write!(f, "ready"),
            NodeStatus::Down => write!(f, "down"),
            NodeStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Advertised or requested compute resources.
///
/// CPU is measured in millicores so fractional requests stay integral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Resources {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl Resources {
    pub fn new(cpu_millis: u64, memory_bytes: u64, disk_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            disk_bytes,
        }
    }

    /// Component-wise sum.
    pub fn plus(self, other: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_add(other.disk_bytes),
        }
    }

    /// True if every component of `request` fits within `self`.
    pub fn can_fit(self, request: Resources) -> bool {
        request.cpu_millis <= self.cpu_millis
            && request.memory_bytes <= self.memory_bytes
            && request.disk_bytes <= self.disk_bytes
    }
}

/// A machine participating in the cluster.
///
/// Created at join; mutated only by heartbeat apply or admin drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub role: NodeRole,
    /// Advertised RPC address (`host:port`).
    pub address: String,
    pub resources: Resources,
    pub labels: BTreeMap<String, String>,
    pub last_heartbeat: Timestamp,
    pub status: NodeStatus,
    /// Set by admin drain; excluded from scheduling until cleared.
    pub drained: bool,
    pub version: Version,
}

// ============================================================================
// Service
// ============================================================================

/// How many copies of a service run, and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// N copies total, placed by the scheduler.
    Replicated { replicas: u64 },
    /// One copy per eligible node.
    Global,
}

impl Default for ServiceMode {
    fn default() -> Self {
        ServiceMode::Replicated { replicas: 1 }
    }
}

/// What the worker does when a container exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartKind {
    Never,
    #[default]
    OnFailure,
    Always,
}

/// Restart policy enforced by the worker, not the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub kind: RestartKind,
    /// Initial restart delay; backoff doubles from here.
    pub delay_ms: u64,
    /// On repeated failure, let the scheduler pick a new node.
    pub reschedule: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            kind: RestartKind::OnFailure,
            delay_ms: 1_000,
            reschedule: false,
        }
    }
}

/// How an update replaces a service's containers.
///
/// Stored declarative intent. The scheduler currently reconciles updates
/// slot by slot regardless of strategy; this field feeds the rollout
/// surface once staged updates land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeployStrategy {
    #[default]
    Rolling,
    Recreate,
}

/// A single health probe definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Probe {
    Http { path: String, port: u16 },
    Tcp { port: u16 },
    Exec { command: Vec<String> },
}

/// Health check configuration for a service's containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub probe: Probe,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive failures before a container is declared unhealthy.
    pub retries: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            probe: Probe::Tcp { port: 80 },
            interval_ms: 10_000,
            timeout_ms: 3_000,
            retries: 3,
        }
    }
}

/// A published port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub published: u16,
    pub target: u16,
    #[serde(default)]
    pub protocol: PortProtocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
}

/// A volume mount, referenced by volume name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub volume: String,
    /// Absolute path inside the container.
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// A secret reference, mounted read-only under the secrets prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
}

/// User-supplied declarative description of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique across the cluster.
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub mode: ServiceMode,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<SecretRef>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub strategy: DeployStrategy,
    /// Per-container resource request.
    #[serde(default)]
    pub resources: Resources,
    /// Node label constraints; every pair must match the node's labels.
    #[serde(default)]
    pub constraints: BTreeMap<String, String>,
    /// Grace period between SIGTERM and SIGKILL on shutdown.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

/// A stored service: the spec plus identity and bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub spec: ServiceSpec,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub version: Version,
}

impl Service {
    /// Desired replica count: N for replicated mode, irrelevant for global.
    pub fn replicas(&self) -> Option<u64> {
        match self.spec.mode {
            ServiceMode::Replicated { replicas } => Some(replicas),
            ServiceMode::Global => None,
        }
    }
}

// ============================================================================
// Container
// ============================================================================

/// Where a container wants to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Shutdown,
}

/// Where a container actually is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActualState {
    /// Created, not yet assigned to a node.
    Pending,
    /// Assigned; the worker has acknowledged receipt.
    Assigned,
    /// The worker is pulling the image.
    Pulling,
    Running,
    Failed,
    /// Exited cleanly after a requested shutdown.
    Complete,
}

impl Display for ActualState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActualState::Pending => "pending",
            ActualState::Assigned => "assigned",
            ActualState::Pulling => "pulling",
            ActualState::Running => "running",
            ActualState::Failed => "failed",
            ActualState::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// Probe verdict for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// The running work unit: one instance of a service on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub service_id: ServiceId,
    /// None until scheduled; owned by exactly one node afterwards.
    pub node_id: Option<NodeId>,
    /// Replica slot within the service, for stable identity across restarts.
    pub slot: u64,
    pub desired_state: DesiredState,
    pub actual_state: ActualState,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub secrets: Vec<SecretRef>,
    pub ports: Vec<PortSpec>,
    pub restart_policy: RestartPolicy,
    pub health_check: Option<HealthCheckSpec>,
    pub health_status: HealthStatus,
    pub resources: Resources,
    pub stop_timeout_ms: u64,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub exit_code: Option<i64>,
    /// Bumped on every apply that touches this record.
    pub version: Version,
    /// Bumped only when the assignment itself changes (desired state or
    /// node). A worker report carrying an older observation than this was
    /// produced against a superseded assignment and is dropped.
    pub assignment_version: Version,
}

impl Container {
    /// True for states that require a live node assignment.
    pub fn is_placed(&self) -> bool {
        matches!(
            self.actual_state,
            ActualState::Assigned | ActualState::Pulling | ActualState::Running
        )
    }
}

// ============================================================================
// Secret
// ============================================================================

/// An encrypted secret. Plaintext is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub id: SecretId,
    /// Unique across the cluster.
    pub name: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub created_at: Timestamp,
    pub version: Version,
}

// ============================================================================
// Volume
// ============================================================================

/// A named volume. Local-driver volumes pin their containers to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    /// Unique across the cluster.
    pub name: String,
    pub driver: String,
    /// For the local driver: the node this volume lives on.
    pub node_affinity: Option<NodeId>,
    pub options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub created_at: Timestamp,
    pub version: Version,
}

// ============================================================================
// Join token
// ============================================================================

/// Join token lifetime: 24 hours.
pub const JOIN_TOKEN_TTL_MS: u64 = 24 * 60 * 60 * 1_000;

/// One-shot, time-bounded credential admitting a new node.
///
/// Stored in the log so every manager accepts and invalidates it
/// consistently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    /// The opaque credential presented at join.
    pub secret: String,
    pub role: NodeRole,
    pub expires_at: Timestamp,
    pub consumed: bool,
}

impl JoinToken {
    /// True if the token can still admit a node of `role` at `now`.
    pub fn admits(&self, role: NodeRole, now: Timestamp) -> bool {
        !self.consumed && self.role == role && now < self.expires_at
    }
}

// ============================================================================
// Cluster membership
// ============================================================================

/// A voting member of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Replica index, dense from zero.
    pub id: u8,
    /// Peer replication address (`host:port`).
    pub address: String,
    /// RPC address, for leader forwarding and join responses.
    pub rpc_address: String,
}

/// Replicated cluster membership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Membership {
    pub members: Vec<Member>,
}

impl Membership {
    /// Quorum size: majority of voters.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}
