//! Deterministic command apply.
//!
//! [`Fsm::apply`] is the only writer of the store. It validates each
//! command against the current state, then mutates through a guarded
//! transaction. Preconditions are checked before any mutation, so a
//! rejected command leaves the store untouched.
//!
//! Determinism rules:
//! - no wall-clock reads; commands carry the timestamps they need
//! - no randomness; identifiers and token secrets are minted by the leader
//!   and travel inside the command
//! - all iteration is over `BTreeMap`s, so replicas agree on order

use serde::{Deserialize, Serialize};
use warren_store::{Collection, Store, StoreError, Transaction};
use warren_types::{
    Container, ContainerId, DesiredState, JoinToken, Member, Membership, Node, NodeId,
    NodeStatus, Secret, SecretId, Service, ServiceId, ServiceSpec, Timestamp, Version, Volume,
    VolumeId,
};

use crate::command::{Command, ContainerStateUpdate, NodeStatusUpdate};
use crate::dedup::DedupRing;

/// Key of the membership record in the `ClusterConfig` collection.
pub const MEMBERSHIP_KEY: &str = "membership";

/// Result of applying one log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The command mutated the store.
    Applied,
    /// The request id was already applied; no-op.
    Duplicate,
    /// A state report carried an older version than the stored record.
    Stale,
}

/// Errors from command validation at apply time.
///
/// These are returned to the submitter but never corrupt state: a failed
/// command applies nothing.
#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    #[error("service name '{0}' already exists")]
    ServiceNameExists(String),

    #[error("service {0} not found")]
    ServiceNotFound(ServiceId),

    #[error("container {0} not found")]
    ContainerNotFound(ContainerId),

    #[error("slot {slot} of service {service_id} already has a running container")]
    SlotOccupied { service_id: ServiceId, slot: u64 },

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("node id '{0}' already registered")]
    NodeExists(NodeId),

    #[error("node {0} is down")]
    NodeDown(NodeId),

    #[error("secret name '{0}' already exists")]
    SecretNameExists(String),

    #[error("secret {0} not found")]
    SecretNotFound(SecretId),

    #[error("secret '{0}' not found")]
    MissingSecret(String),

    #[error("secret '{0}' is referenced by a service")]
    SecretInUse(String),

    #[error("volume name '{0}' already exists")]
    VolumeNameExists(String),

    #[error("volume {0} not found")]
    VolumeNotFound(VolumeId),

    #[error("volume '{0}' not found")]
    MissingVolume(String),

    #[error("volume '{0}' is referenced by a service")]
    VolumeInUse(String),

    #[error("volume '{volume}' lives on node {affinity}, container assigned to {assigned}")]
    VolumeAffinity {
        volume: String,
        affinity: NodeId,
        assigned: NodeId,
    },

    #[error("join token not recognized")]
    TokenUnknown,

    #[error("join token already consumed")]
    TokenConsumed,

    #[error("join token expired")]
    TokenExpired,

    #[error("voter {0} already in membership")]
    MemberExists(u8),

    #[error("voter {0} not in membership")]
    MemberUnknown(u8),

    #[error("batches cannot nest")]
    NestedBatch,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The replicated state machine: store plus idempotency memory.
///
/// Snapshots serialize the whole struct, so a restored replica remembers
/// exactly the same request ids as the one that took the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Fsm {
    store: Store,
    recent: DedupRing,
    applied_index: u64,
}

impl Fsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only view of the store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Index of the last applied log entry.
    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    /// Canonical snapshot bytes (store + dedup ring + apply index).
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("fsm serialization is infallible")
    }

    /// Restores a snapshot, atomically replacing all state.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FsmError> {
        postcard::from_bytes(bytes).map_err(|e| FsmError::Store(StoreError::Decode(e.to_string())))
    }

    /// Applies one committed log entry.
    ///
    /// The apply index advances even when the command is rejected, so
    /// version stamps stay aligned across replicas (every replica sees the
    /// same entries and the same errors).
    pub fn apply(&mut self, command: &Command) -> Result<ApplyOutcome, FsmError> {
        self.applied_index += 1;
        let version = Version::new(self.applied_index);

        if self.recent.contains(command.request_id()) {
            return Ok(ApplyOutcome::Duplicate);
        }

        let outcome = match command {
            Command::Batch {
                request_id,
                commands,
            } => {
                if commands
                    .iter()
                    .any(|c| matches!(c, Command::Batch { .. }))
                {
                    return Err(FsmError::NestedBatch);
                }
                let saved_store = self.store.clone();
                let saved_ring = self.recent.clone();
                for sub in commands {
                    if self.recent.contains(sub.request_id()) {
                        continue;
                    }
                    match self.dispatch(sub, version) {
                        Ok(_) => self.recent.record(sub.request_id().clone()),
                        Err(e) => {
                            self.store = saved_store;
                            self.recent = saved_ring;
                            return Err(e);
                        }
                    }
                }
                self.recent.record(request_id.clone());
                ApplyOutcome::Applied
            }
            _ => {
                let outcome = self.dispatch(command, version)?;
                if outcome == ApplyOutcome::Applied {
                    self.recent.record(command.request_id().clone());
                }
                outcome
            }
        };
        Ok(outcome)
    }

    fn dispatch(&mut self, command: &Command, version: Version) -> Result<ApplyOutcome, FsmError> {
        match command {
            Command::CreateService { service, .. } => self.create_service(service, version),
            Command::UpdateService {
                service_id,
                spec,
                updated_at,
                ..
            } => self.update_service(service_id, spec, *updated_at, version),
            Command::DeleteService { service_id, .. } => self.delete_service(service_id, version),
            Command::CreateContainer { container, .. } => self.create_container(container, version),
            Command::UpdateContainerState {
                container_id,
                update,
                ..
            } => self.update_container_state(container_id, update, version),
            Command::DeleteContainer { container_id, .. } => {
                self.store
                    .get(Collection::Containers, container_id.as_str())
                    .map_err(|_| FsmError::ContainerNotFound(container_id.clone()))?;
                self.store
                    .delete(Collection::Containers, container_id.as_str())?;
                Ok(ApplyOutcome::Applied)
            }
            Command::RegisterNode { node, .. } => self.register_node(node, version),
            Command::UpdateNodeStatus {
                node_id, update, ..
            } => self.update_node_status(node_id, update, version),
            Command::CreateSecret { secret, .. } => self.create_secret(secret, version),
            Command::DeleteSecret { secret_id, .. } => self.delete_secret(secret_id),
            Command::CreateVolume { volume, .. } => self.create_volume(volume, version),
            Command::DeleteVolume { volume_id, .. } => self.delete_volume(volume_id),
            Command::IssueJoinToken { token, .. } => {
                let txn = Transaction::new()
                    .guard_absent(Collection::JoinTokens, token.secret.clone())
                    .put_record(Collection::JoinTokens, token.secret.clone(), token);
                self.store.commit(txn)?;
                Ok(ApplyOutcome::Applied)
            }
            Command::ConsumeJoinToken { secret, now, .. } => self.consume_join_token(secret, *now),
            Command::AddVoter { member, .. } => self.add_voter(member),
            Command::RemoveVoter { member_id, .. } => self.remove_voter(*member_id),
            Command::Batch { .. } => Err(FsmError::NestedBatch),
        }
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Looks a service up by its unique name.
    pub fn service_by_name(&self, name: &str) -> Option<Service> {
        self.store
            .scan_records::<Service>(Collection::Services)
            .ok()?
            .into_iter()
            .find(|s| s.spec.name == name)
    }

    fn check_secret_refs(&self, spec: &ServiceSpec) -> Result<(), FsmError> {
        let secrets: Vec<Secret> = self.store.scan_records(Collection::Secrets)?;
        for sref in &spec.secrets {
            if !secrets.iter().any(|s| s.name == sref.name) {
                return Err(FsmError::MissingSecret(sref.name.clone()));
            }
        }
        Ok(())
    }

    fn create_service(&mut self, service: &Service, version: Version) -> Result<ApplyOutcome, FsmError> {
        if self.service_by_name(&service.spec.name).is_some() {
            return Err(FsmError::ServiceNameExists(service.spec.name.clone()));
        }
        self.check_secret_refs(&service.spec)?;

        let mut stored = service.clone();
        stored.version = version;
        let txn = Transaction::new()
            .guard_absent(Collection::Services, stored.id.as_str())
            .put_record(Collection::Services, stored.id.as_str(), &stored);
        self.store.commit(txn)?;
        Ok(ApplyOutcome::Applied)
    }

    fn update_service(
        &mut self,
        service_id: &ServiceId,
        spec: &ServiceSpec,
        updated_at: Timestamp,
        version: Version,
    ) -> Result<ApplyOutcome, FsmError> {
        let mut service: Service = self
            .store
            .get_record(Collection::Services, service_id.as_str())
            .map_err(|_| FsmError::ServiceNotFound(service_id.clone()))?;

        if spec.name != service.spec.name {
            if let Some(other) = self.service_by_name(&spec.name) {
                if other.id != *service_id {
                    return Err(FsmError::ServiceNameExists(spec.name.clone()));
                }
            }
        }
        self.check_secret_refs(spec)?;

        service.spec = spec.clone();
        service.updated_at = updated_at;
        service.version = version;
        self.store
            .put_record(Collection::Services, service_id.as_str(), &service);
        Ok(ApplyOutcome::Applied)
    }

    /// Deleting a service transitions all of its containers to shutdown;
    /// the reconciler tombstones them once the owning worker confirms
    /// removal.
    fn delete_service(
        &mut self,
        service_id: &ServiceId,
        version: Version,
    ) -> Result<ApplyOutcome, FsmError> {
        self.store
            .get(Collection::Services, service_id.as_str())
            .map_err(|_| FsmError::ServiceNotFound(service_id.clone()))?;

        let mut txn = Transaction::new().delete(Collection::Services, service_id.as_str());
        let containers: Vec<Container> = self.store.scan_records(Collection::Containers)?;
        for mut container in containers {
            if container.service_id == *service_id
                && container.desired_state != DesiredState::Shutdown
            {
                container.desired_state = DesiredState::Shutdown;
                container.version = version;
                container.assignment_version = version;
                txn = txn.put_record(Collection::Containers, container.id.as_str(), &container);
            }
        }
        self.store.commit(txn)?;
        Ok(ApplyOutcome::Applied)
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    fn create_container(
        &mut self,
        container: &Container,
        version: Version,
    ) -> Result<ApplyOutcome, FsmError> {
        self.store
            .get(Collection::Services, container.service_id.as_str())
            .map_err(|_| FsmError::ServiceNotFound(container.service_id.clone()))?;

        // One live container per (service, slot).
        let existing: Vec<Container> = self.store.scan_records(Collection::Containers)?;
        if existing.iter().any(|c| {
            c.service_id == container.service_id
                && c.slot == container.slot
                && c.desired_state == DesiredState::Running
        }) {
            return Err(FsmError::SlotOccupied {
                service_id: container.service_id.clone(),
                slot: container.slot,
            });
        }

        if let Some(node_id) = &container.node_id {
            let node: Node = self
                .store
                .get_record(Collection::Nodes, node_id.as_str())
                .map_err(|_| FsmError::NodeNotFound(node_id.clone()))?;
            if node.status == NodeStatus::Down {
                return Err(FsmError::NodeDown(node_id.clone()));
            }
        }

        // Volume mounts must resolve, and pin the container to the
        // volume's node.
        let volumes: Vec<Volume> = self.store.scan_records(Collection::Volumes)?;
        for mount in &container.mounts {
            let volume = volumes
                .iter()
                .find(|v| v.name == mount.volume)
                .ok_or_else(|| FsmError::MissingVolume(mount.volume.clone()))?;
            if let (Some(affinity), Some(assigned)) = (&volume.node_affinity, &container.node_id) {
                if affinity != assigned {
                    return Err(FsmError::VolumeAffinity {
                        volume: volume.name.clone(),
                        affinity: affinity.clone(),
                        assigned: assigned.clone(),
                    });
                }
            }
        }

        let mut stored = container.clone();
        stored.version = version;
        stored.assignment_version = version;
        let txn = Transaction::new()
            .guard_absent(Collection::Containers, stored.id.as_str())
            .put_record(Collection::Containers, stored.id.as_str(), &stored);
        self.store.commit(txn)?;
        Ok(ApplyOutcome::Applied)
    }

    fn update_container_state(
        &mut self,
        container_id: &ContainerId,
        update: &ContainerStateUpdate,
        version: Version,
    ) -> Result<ApplyOutcome, FsmError> {
        let mut container: Container = self
            .store
            .get_record(Collection::Containers, container_id.as_str())
            .map_err(|_| FsmError::ContainerNotFound(container_id.clone()))?;

        // Monotone reports: a report produced against a superseded
        // assignment (the desired state or placement changed after the
        // reporter last saw the record) is dropped.
        if let Some(observed) = update.observed_version {
            if observed < container.assignment_version {
                return Ok(ApplyOutcome::Stale);
            }
        }

        if let Some(state) = update.actual_state {
            container.actual_state = state;
        }
        if let Some(desired) = update.desired_state {
            container.desired_state = desired;
        }
        if let Some(health) = update.health_status {
            container.health_status = health;
        }
        if let Some(exit_code) = update.exit_code {
            container.exit_code = Some(exit_code);
        }
        if let Some(started_at) = update.started_at {
            container.started_at = Some(started_at);
        }
        if let Some(finished_at) = update.finished_at {
            container.finished_at = Some(finished_at);
        }
        if let Some(node_id) = &update.node_id {
            // Placement gets the same checks as creation: the node must
            // be alive and every mounted volume must live there.
            let node: Node = self
                .store
                .get_record(Collection::Nodes, node_id.as_str())
                .map_err(|_| FsmError::NodeNotFound(node_id.clone()))?;
            if node.status == NodeStatus::Down {
                return Err(FsmError::NodeDown(node_id.clone()));
            }
            let volumes: Vec<Volume> = self.store.scan_records(Collection::Volumes)?;
            for mount in &container.mounts {
                let volume = volumes
                    .iter()
                    .find(|v| v.name == mount.volume)
                    .ok_or_else(|| FsmError::MissingVolume(mount.volume.clone()))?;
                if let Some(affinity) = &volume.node_affinity {
                    if affinity != node_id {
                        return Err(FsmError::VolumeAffinity {
                            volume: volume.name.clone(),
                            affinity: affinity.clone(),
                            assigned: node_id.clone(),
                        });
                    }
                }
            }
            container.node_id = Some(node_id.clone());
        }
        container.version = version;
        if update.desired_state.is_some() || update.node_id.is_some() {
            container.assignment_version = version;
        }
        self.store
            .put_record(Collection::Containers, container_id.as_str(), &container);
        Ok(ApplyOutcome::Applied)
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    fn register_node(&mut self, node: &Node, version: Version) -> Result<ApplyOutcome, FsmError> {
        if self.store.contains(Collection::Nodes, node.id.as_str()) {
            return Err(FsmError::NodeExists(node.id.clone()));
        }
        let mut stored = node.clone();
        stored.version = version;
        self.store
            .put_record(Collection::Nodes, stored.id.as_str(), &stored);
        Ok(ApplyOutcome::Applied)
    }

    fn update_node_status(
        &mut self,
        node_id: &NodeId,
        update: &NodeStatusUpdate,
        version: Version,
    ) -> Result<ApplyOutcome, FsmError> {
        let mut node: Node = self
            .store
            .get_record(Collection::Nodes, node_id.as_str())
            .map_err(|_| FsmError::NodeNotFound(node_id.clone()))?;

        if let Some(status) = update.status {
            node.status = status;
        }
        if let Some(resources) = update.resources {
            node.resources = resources;
        }
        if let Some(heartbeat) = update.heartbeat {
            node.last_heartbeat = heartbeat;
        }
        if let Some(drained) = update.drained {
            node.drained = drained;
        }
        node.version = version;
        self.store
            .put_record(Collection::Nodes, node_id.as_str(), &node);
        Ok(ApplyOutcome::Applied)
    }

    // ------------------------------------------------------------------
    // Secrets & volumes
    // ------------------------------------------------------------------

    fn create_secret(&mut self, secret: &Secret, version: Version) -> Result<ApplyOutcome, FsmError> {
        let existing: Vec<Secret> = self.store.scan_records(Collection::Secrets)?;
        if existing.iter().any(|s| s.name == secret.name) {
            return Err(FsmError::SecretNameExists(secret.name.clone()));
        }
        let mut stored = secret.clone();
        stored.version = version;
        self.store
            .put_record(Collection::Secrets, stored.id.as_str(), &stored);
        Ok(ApplyOutcome::Applied)
    }

    fn delete_secret(&mut self, secret_id: &SecretId) -> Result<ApplyOutcome, FsmError> {
        let secret: Secret = self
            .store
            .get_record(Collection::Secrets, secret_id.as_str())
            .map_err(|_| FsmError::SecretNotFound(secret_id.clone()))?;

        let services: Vec<Service> = self.store.scan_records(Collection::Services)?;
        if services
            .iter()
            .any(|s| s.spec.secrets.iter().any(|r| r.name == secret.name))
        {
            return Err(FsmError::SecretInUse(secret.name));
        }
        self.store.delete(Collection::Secrets, secret_id.as_str())?;
        Ok(ApplyOutcome::Applied)
    }

    fn create_volume(&mut self, volume: &Volume, version: Version) -> Result<ApplyOutcome, FsmError> {
        let existing: Vec<Volume> = self.store.scan_records(Collection::Volumes)?;
        if existing.iter().any(|v| v.name == volume.name) {
            return Err(FsmError::VolumeNameExists(volume.name.clone()));
        }
        let mut stored = volume.clone();
        stored.version = version;
        self.store
            .put_record(Collection::Volumes, stored.id.as_str(), &stored);
        Ok(ApplyOutcome::Applied)
    }

    fn delete_volume(&mut self, volume_id: &VolumeId) -> Result<ApplyOutcome, FsmError> {
        let volume: Volume = self
            .store
            .get_record(Collection::Volumes, volume_id.as_str())
            .map_err(|_| FsmError::VolumeNotFound(volume_id.clone()))?;

        let services: Vec<Service> = self.store.scan_records(Collection::Services)?;
        if services
            .iter()
            .any(|s| s.spec.mounts.iter().any(|m| m.volume == volume.name))
        {
            return Err(FsmError::VolumeInUse(volume.name));
        }
        self.store.delete(Collection::Volumes, volume_id.as_str())?;
        Ok(ApplyOutcome::Applied)
    }

    // ------------------------------------------------------------------
    // Join tokens & membership
    // ------------------------------------------------------------------

    fn consume_join_token(
        &mut self,
        secret: &str,
        now: Timestamp,
    ) -> Result<ApplyOutcome, FsmError> {
        let mut token: JoinToken = self
            .store
            .get_record(Collection::JoinTokens, secret)
            .map_err(|_| FsmError::TokenUnknown)?;

        if token.consumed {
            return Err(FsmError::TokenConsumed);
        }
        if now >= token.expires_at {
            return Err(FsmError::TokenExpired);
        }
        token.consumed = true;
        self.store
            .put_record(Collection::JoinTokens, secret, &token);
        Ok(ApplyOutcome::Applied)
    }

    /// Current log membership.
    pub fn membership(&self) -> Membership {
        self.store
            .get_record(Collection::ClusterConfig, MEMBERSHIP_KEY)
            .unwrap_or_default()
    }

    fn add_voter(&mut self, member: &Member) -> Result<ApplyOutcome, FsmError> {
        let mut membership = self.membership();
        if membership.members.iter().any(|m| m.id == member.id) {
            return Err(FsmError::MemberExists(member.id));
        }
        membership.members.push(member.clone());
        membership.members.sort_by_key(|m| m.id);
        self.store
            .put_record(Collection::ClusterConfig, MEMBERSHIP_KEY, &membership);
        Ok(ApplyOutcome::Applied)
    }

    fn remove_voter(&mut self, member_id: u8) -> Result<ApplyOutcome, FsmError> {
        let mut membership = self.membership();
        if !membership.members.iter().any(|m| m.id == member_id) {
            return Err(FsmError::MemberUnknown(member_id));
        }
        membership.members.retain(|m| m.id != member_id);
        self.store
            .put_record(Collection::ClusterConfig, MEMBERSHIP_KEY, &membership);
        Ok(ApplyOutcome::Applied)
    }
}
