//! The replicated command set.
//!
//! Every mutation of the store travels through the log as one of these
//! commands. Commands carry everything apply needs: identifiers minted by
//! the leader, timestamps read before submission, sealed secret material.
//! Apply itself never reads a clock and never generates randomness, so the
//! same sequence of commands produces the same store on every replica.

use serde::{Deserialize, Serialize};
use warren_types::{
    ActualState, Container, ContainerId, DesiredState, HealthStatus, JoinToken, Member, Node,
    NodeId, NodeStatus, RequestId, Resources, Secret, SecretId, Service, ServiceId, ServiceSpec,
    Timestamp, Version, Volume, VolumeId,
};

/// Partial update to a container record.
///
/// Fields left `None` are untouched. Reports from workers carry
/// `observed_version`; a report older than the stored record is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerStateUpdate {
    pub actual_state: Option<ActualState>,
    pub desired_state: Option<DesiredState>,
    pub health_status: Option<HealthStatus>,
    pub exit_code: Option<i64>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    /// Scheduler assignment; set once when the container is placed.
    pub node_id: Option<NodeId>,
    /// Version of the record the reporter last saw.
    pub observed_version: Option<Version>,
}

impl ContainerStateUpdate {
    /// A worker state report.
    pub fn report(
        actual_state: ActualState,
        health_status: HealthStatus,
        exit_code: Option<i64>,
        observed_version: Version,
    ) -> Self {
        Self {
            actual_state: Some(actual_state),
            health_status: Some(health_status),
            exit_code,
            observed_version: Some(observed_version),
            ..Self::default()
        }
    }

    /// A desired-state transition (scheduler drain, service delete).
    pub fn desire(desired_state: DesiredState) -> Self {
        Self {
            desired_state: Some(desired_state),
            ..Self::default()
        }
    }
}

/// Partial update to a node record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeStatusUpdate {
    pub status: Option<NodeStatus>,
    pub resources: Option<Resources>,
    /// Heartbeat receipt time, stamped by the manager that received it.
    pub heartbeat: Option<Timestamp>,
    pub drained: Option<bool>,
}

impl NodeStatusUpdate {
    pub fn heartbeat(at: Timestamp, resources: Resources) -> Self {
        Self {
            status: Some(NodeStatus::Ready),
            resources: Some(resources),
            heartbeat: Some(at),
            drained: None,
        }
    }

    pub fn mark_down() -> Self {
        Self {
            status: Some(NodeStatus::Down),
            ..Self::default()
        }
    }

    pub fn drain() -> Self {
        Self {
            drained: Some(true),
            ..Self::default()
        }
    }
}

/// A command in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    CreateService {
        request_id: RequestId,
        service: Service,
    },
    UpdateService {
        request_id: RequestId,
        service_id: ServiceId,
        spec: ServiceSpec,
        updated_at: Timestamp,
    },
    DeleteService {
        request_id: RequestId,
        service_id: ServiceId,
    },
    CreateContainer {
        request_id: RequestId,
        container: Container,
    },
    UpdateContainerState {
        request_id: RequestId,
        container_id: ContainerId,
        update: ContainerStateUpdate,
    },
    DeleteContainer {
        request_id: RequestId,
        container_id: ContainerId,
    },
    RegisterNode {
        request_id: RequestId,
        node: Node,
    },
    UpdateNodeStatus {
        request_id: RequestId,
        node_id: NodeId,
        update: NodeStatusUpdate,
    },
    CreateSecret {
        request_id: RequestId,
        secret: Secret,
    },
    DeleteSecret {
        request_id: RequestId,
        secret_id: SecretId,
    },
    CreateVolume {
        request_id: RequestId,
        volume: Volume,
    },
    DeleteVolume {
        request_id: RequestId,
        volume_id: VolumeId,
    },
    IssueJoinToken {
        request_id: RequestId,
        token: JoinToken,
    },
    ConsumeJoinToken {
        request_id: RequestId,
        /// Token secret presented at join.
        secret: String,
        /// Verification time, read by the leader before submission.
        now: Timestamp,
    },
    AddVoter {
        request_id: RequestId,
        member: Member,
    },
    RemoveVoter {
        request_id: RequestId,
        member_id: u8,
    },
    /// Several commands applied as one log entry (single scheduler pass).
    ///
    /// Sub-commands keep their own request ids; nesting batches is invalid.
    Batch {
        request_id: RequestId,
        commands: Vec<Command>,
    },
}

impl Command {
    /// The idempotency key for this command.
    pub fn request_id(&self) -> &RequestId {
        match self {
            Command::CreateService { request_id, .. }
            | Command::UpdateService { request_id, .. }
            | Command::DeleteService { request_id, .. }
            | Command::CreateContainer { request_id, .. }
            | Command::UpdateContainerState { request_id, .. }
            | Command::DeleteContainer { request_id, .. }
            | Command::RegisterNode { request_id, .. }
            | Command::UpdateNodeStatus { request_id, .. }
            | Command::CreateSecret { request_id, .. }
            | Command::DeleteSecret { request_id, .. }
            | Command::CreateVolume { request_id, .. }
            | Command::DeleteVolume { request_id, .. }
            | Command::IssueJoinToken { request_id, .. }
            | Command::ConsumeJoinToken { request_id, .. }
            | Command::AddVoter { request_id, .. }
            | Command::RemoveVoter { request_id, .. }
            | Command::Batch { request_id, .. } => request_id,
        }
    }

    /// Canonical bytes for the log record.
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("command serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
