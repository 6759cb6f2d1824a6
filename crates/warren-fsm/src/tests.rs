//! FSM apply tests: validation, idempotence, determinism.

use std::collections::BTreeMap;

use proptest::prelude::*;
use test_case::test_case;
use warren_types::{
    ActualState, Container, ContainerId, DesiredState, HealthStatus, JoinToken, Member,
    MountSpec, Node, NodeId, NodeRole, NodeStatus, RequestId, Resources, RestartPolicy, Secret,
    SecretId, SecretRef, Service, ServiceId, ServiceMode, ServiceSpec, Timestamp, Version,
    Volume, VolumeId,
};

use crate::{ApplyOutcome, Command, ContainerStateUpdate, Fsm, FsmError, NodeStatusUpdate};

fn rid(tag: &str) -> RequestId {
    RequestId::new(format!("req-{tag}"))
}

fn spec(name: &str, replicas: u64) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        image: "nginx:latest".to_string(),
        mode: ServiceMode::Replicated { replicas },
        env: BTreeMap::new(),
        secrets: vec![],
        mounts: vec![],
        ports: vec![],
        health_check: None,
        restart_policy: RestartPolicy::default(),
        strategy: warren_types::DeployStrategy::default(),
        resources: Resources::default(),
        constraints: BTreeMap::new(),
        stop_timeout_ms: 10_000,
    }
}

fn service(name: &str, replicas: u64) -> Service {
    Service {
        id: ServiceId::new(format!("svc-{name}")),
        spec: spec(name, replicas),
        created_at: Timestamp::from_millis(1_000),
        updated_at: Timestamp::from_millis(1_000),
        version: Version::ZERO,
    }
}

fn node(id: &str) -> Node {
    Node {
        id: NodeId::new(id),
        role: NodeRole::Worker,
        address: "10.0.0.1:7421".to_string(),
        resources: Resources::new(4_000, 8 << 30, 100 << 30),
        labels: BTreeMap::new(),
        last_heartbeat: Timestamp::from_millis(1_000),
        status: NodeStatus::Ready,
        drained: false,
        version: Version::ZERO,
    }
}

fn container(id: &str, service: &str, slot: u64, node: Option<&str>) -> Container {
    Container {
        id: ContainerId::new(id),
        service_id: ServiceId::new(format!("svc-{service}")),
        node_id: node.map(NodeId::new),
        slot,
        desired_state: DesiredState::Running,
        actual_state: ActualState::Pending,
        image: "nginx:latest".to_string(),
        env: BTreeMap::new(),
        mounts: vec![],
        secrets: vec![],
        ports: vec![],
        restart_policy: RestartPolicy::default(),
        health_check: None,
        health_status: HealthStatus::Unknown,
        resources: Resources::default(),
        stop_timeout_ms: 10_000,
        created_at: Timestamp::from_millis(2_000),
        started_at: None,
        finished_at: None,
        exit_code: None,
        version: Version::ZERO,
        assignment_version: Version::ZERO,
    }
}

fn secret(name: &str) -> Secret {
    Secret {
        id: SecretId::new(format!("sec-{name}")),
        name: name.to_string(),
        ciphertext: vec![1, 2, 3],
        nonce: vec![0; 12],
        created_at: Timestamp::from_millis(500),
        version: Version::ZERO,
    }
}

fn volume(name: &str, affinity: Option<&str>) -> Volume {
    Volume {
        id: VolumeId::new(format!("vol-{name}")),
        name: name.to_string(),
        driver: "local".to_string(),
        node_affinity: affinity.map(NodeId::new),
        options: BTreeMap::new(),
        labels: BTreeMap::new(),
        created_at: Timestamp::from_millis(500),
        version: Version::ZERO,
    }
}

fn create_service_cmd(tag: &str, svc: Service) -> Command {
    Command::CreateService {
        request_id: rid(tag),
        service: svc,
    }
}

// ----------------------------------------------------------------------
// Services
// ----------------------------------------------------------------------

#[test]
fn create_service_then_duplicate_name_rejected() {
    let mut fsm = Fsm::new();
    fsm.apply(&create_service_cmd("a", service("web", 3))).unwrap();

    let mut dup = service("web", 1);
    dup.id = ServiceId::new("svc-web-2");
    let err = fsm.apply(&create_service_cmd("b", dup)).unwrap_err();
    assert!(matches!(err, FsmError::ServiceNameExists(name) if name == "web"));
}

#[test]
fn create_service_with_unknown_secret_rejected() {
    let mut fsm = Fsm::new();
    let mut svc = service("app", 1);
    svc.spec.secrets.push(SecretRef {
        name: "token".to_string(),
    });
    let err = fsm.apply(&create_service_cmd("a", svc)).unwrap_err();
    assert!(matches!(err, FsmError::MissingSecret(name) if name == "token"));
}

#[test]
fn update_service_stamps_new_version() {
    let mut fsm = Fsm::new();
    fsm.apply(&create_service_cmd("a", service("web", 3))).unwrap();

    fsm.apply(&Command::UpdateService {
        request_id: rid("b"),
        service_id: ServiceId::new("svc-web"),
        spec: spec("web", 5),
        updated_at: Timestamp::from_millis(9_000),
    })
    .unwrap();

    let stored = fsm.service_by_name("web").unwrap();
    assert_eq!(stored.replicas(), Some(5));
    assert_eq!(stored.updated_at, Timestamp::from_millis(9_000));
    assert_eq!(stored.version, Version::new(2));
}

#[test]
fn delete_service_shuts_down_its_containers() {
    let mut fsm = Fsm::new();
    fsm.apply(&create_service_cmd("a", service("web", 2))).unwrap();
    fsm.apply(&Command::RegisterNode {
        request_id: rid("n"),
        node: node("node-1"),
    })
    .unwrap();
    fsm.apply(&Command::CreateContainer {
        request_id: rid("c0"),
        container: container("ctr-0", "web", 0, Some("node-1")),
    })
    .unwrap();
    fsm.apply(&Command::CreateContainer {
        request_id: rid("c1"),
        container: container("ctr-1", "web", 1, Some("node-1")),
    })
    .unwrap();

    fsm.apply(&Command::DeleteService {
        request_id: rid("d"),
        service_id: ServiceId::new("svc-web"),
    })
    .unwrap();

    assert!(fsm.service_by_name("web").is_none());
    let containers: Vec<Container> = fsm
        .store()
        .scan_records(warren_store::Collection::Containers)
        .unwrap();
    assert_eq!(containers.len(), 2);
    assert!(containers
        .iter()
        .all(|c| c.desired_state == DesiredState::Shutdown));
}

// ----------------------------------------------------------------------
// Containers
// ----------------------------------------------------------------------

#[test]
fn container_requires_existing_service() {
    let mut fsm = Fsm::new();
    let err = fsm
        .apply(&Command::CreateContainer {
            request_id: rid("c"),
            container: container("ctr-0", "ghost", 0, None),
        })
        .unwrap_err();
    assert!(matches!(err, FsmError::ServiceNotFound(_)));
}

#[test]
fn second_running_container_in_slot_rejected() {
    let mut fsm = Fsm::new();
    fsm.apply(&create_service_cmd("a", service("web", 1))).unwrap();
    fsm.apply(&Command::CreateContainer {
        request_id: rid("c0"),
        container: container("ctr-0", "web", 0, None),
    })
    .unwrap();

    let err = fsm
        .apply(&Command::CreateContainer {
            request_id: rid("c1"),
            container: container("ctr-0b", "web", 0, None),
        })
        .unwrap_err();
    assert!(matches!(err, FsmError::SlotOccupied { slot: 0, .. }));
}

#[test]
fn container_on_wrong_volume_node_rejected() {
    let mut fsm = Fsm::new();
    fsm.apply(&create_service_cmd("a", service("pg", 1))).unwrap();
    fsm.apply(&Command::RegisterNode {
        request_id: rid("n1"),
        node: node("node-1"),
    })
    .unwrap();
    fsm.apply(&Command::RegisterNode {
        request_id: rid("n2"),
        node: node("node-2"),
    })
    .unwrap();
    fsm.apply(&Command::CreateVolume {
        request_id: rid("v"),
        volume: volume("db", Some("node-2")),
    })
    .unwrap();

    let mut ctr = container("ctr-0", "pg", 0, Some("node-1"));
    ctr.mounts.push(MountSpec {
        volume: "db".to_string(),
        path: "/var/lib/pg".to_string(),
        read_only: false,
    });
    let err = fsm
        .apply(&Command::CreateContainer {
            request_id: rid("c"),
            container: ctr,
        })
        .unwrap_err();
    assert!(matches!(err, FsmError::VolumeAffinity { .. }));
}

#[test]
fn report_against_superseded_assignment_is_dropped() {
    let mut fsm = Fsm::new();
    fsm.apply(&create_service_cmd("a", service("web", 1))).unwrap();
    fsm.apply(&Command::CreateContainer {
        request_id: rid("c"),
        container: container("ctr-0", "web", 0, None),
    })
    .unwrap();

    let assigned_version = Version::new(fsm.applied_index());

    // A report against the current assignment applies, and a second one
    // carrying the same observation still applies: only assignment
    // changes move the staleness bar.
    for (tag, state) in [("r1", ActualState::Assigned), ("r2", ActualState::Running)] {
        let outcome = fsm
            .apply(&Command::UpdateContainerState {
                request_id: rid(tag),
                container_id: ContainerId::new("ctr-0"),
                update: ContainerStateUpdate::report(
                    state,
                    HealthStatus::Unknown,
                    None,
                    assigned_version,
                ),
            })
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    // The scheduler drains the container: the assignment changes.
    fsm.apply(&Command::UpdateContainerState {
        request_id: rid("drain"),
        container_id: ContainerId::new("ctr-0"),
        update: ContainerStateUpdate::desire(DesiredState::Shutdown),
    })
    .unwrap();

    // A report produced against the old assignment is dropped.
    let outcome = fsm
        .apply(&Command::UpdateContainerState {
            request_id: rid("r3"),
            container_id: ContainerId::new("ctr-0"),
            update: ContainerStateUpdate::report(
                ActualState::Failed,
                HealthStatus::Unhealthy,
                Some(137),
                assigned_version,
            ),
        })
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Stale);

    let containers: Vec<Container> = fsm
        .store()
        .scan_records(warren_store::Collection::Containers)
        .unwrap();
    assert_eq!(containers[0].actual_state, ActualState::Running);
    assert_eq!(containers[0].desired_state, DesiredState::Shutdown);
}

// ----------------------------------------------------------------------
// Nodes
// ----------------------------------------------------------------------

#[test]
fn duplicate_node_registration_rejected() {
    let mut fsm = Fsm::new();
    fsm.apply(&Command::RegisterNode {
        request_id: rid("n1"),
        node: node("node-1"),
    })
    .unwrap();
    let err = fsm
        .apply(&Command::RegisterNode {
            request_id: rid("n2"),
            node: node("node-1"),
        })
        .unwrap_err();
    assert!(matches!(err, FsmError::NodeExists(_)));
}

#[test]
fn heartbeat_refreshes_status_and_timestamp() {
    let mut fsm = Fsm::new();
    let mut n = node("node-1");
    n.status = NodeStatus::Down;
    fsm.apply(&Command::RegisterNode {
        request_id: rid("n"),
        node: n,
    })
    .unwrap();

    fsm.apply(&Command::UpdateNodeStatus {
        request_id: rid("hb"),
        node_id: NodeId::new("node-1"),
        update: NodeStatusUpdate::heartbeat(
            Timestamp::from_millis(60_000),
            Resources::new(4_000, 8 << 30, 100 << 30),
        ),
    })
    .unwrap();

    let stored: Node = fsm
        .store()
        .get_record(warren_store::Collection::Nodes, "node-1")
        .unwrap();
    assert_eq!(stored.status, NodeStatus::Ready);
    assert_eq!(stored.last_heartbeat, Timestamp::from_millis(60_000));
}

#[test]
fn drain_survives_heartbeat() {
    let mut fsm = Fsm::new();
    fsm.apply(&Command::RegisterNode {
        request_id: rid("n"),
        node: node("node-1"),
    })
    .unwrap();
    fsm.apply(&Command::UpdateNodeStatus {
        request_id: rid("d"),
        node_id: NodeId::new("node-1"),
        update: NodeStatusUpdate::drain(),
    })
    .unwrap();
    fsm.apply(&Command::UpdateNodeStatus {
        request_id: rid("hb"),
        node_id: NodeId::new("node-1"),
        update: NodeStatusUpdate::heartbeat(Timestamp::from_millis(99_000), Resources::default()),
    })
    .unwrap();

    let stored: Node = fsm
        .store()
        .get_record(warren_store::Collection::Nodes, "node-1")
        .unwrap();
    assert!(stored.drained);
    assert_eq!(stored.status, NodeStatus::Ready);
}

// ----------------------------------------------------------------------
// Secrets & volumes
// ----------------------------------------------------------------------

#[test]
fn secret_in_use_cannot_be_deleted() {
    let mut fsm = Fsm::new();
    fsm.apply(&Command::CreateSecret {
        request_id: rid("s"),
        secret: secret("token"),
    })
    .unwrap();

    let mut svc = service("app", 1);
    svc.spec.secrets.push(SecretRef {
        name: "token".to_string(),
    });
    fsm.apply(&create_service_cmd("a", svc)).unwrap();

    let err = fsm
        .apply(&Command::DeleteSecret {
            request_id: rid("del"),
            secret_id: SecretId::new("sec-token"),
        })
        .unwrap_err();
    assert!(matches!(err, FsmError::SecretInUse(name) if name == "token"));
}

#[test]
fn volume_in_use_cannot_be_deleted() {
    let mut fsm = Fsm::new();
    fsm.apply(&Command::CreateVolume {
        request_id: rid("v"),
        volume: volume("db", None),
    })
    .unwrap();

    let mut svc = service("pg", 1);
    svc.spec.mounts.push(MountSpec {
        volume: "db".to_string(),
        path: "/var/lib/pg".to_string(),
        read_only: false,
    });
    fsm.apply(&create_service_cmd("a", svc)).unwrap();

    let err = fsm
        .apply(&Command::DeleteVolume {
            request_id: rid("del"),
            volume_id: VolumeId::new("vol-db"),
        })
        .unwrap_err();
    assert!(matches!(err, FsmError::VolumeInUse(name) if name == "db"));
}

// ----------------------------------------------------------------------
// Join tokens
// ----------------------------------------------------------------------

fn token(secret: &str, expires_at: u64) -> JoinToken {
    JoinToken {
        secret: secret.to_string(),
        role: NodeRole::Worker,
        expires_at: Timestamp::from_millis(expires_at),
        consumed: false,
    }
}

#[test]
fn join_token_single_use() {
    let mut fsm = Fsm::new();
    fsm.apply(&Command::IssueJoinToken {
        request_id: rid("i"),
        token: token("tkn", 100_000),
    })
    .unwrap();

    fsm.apply(&Command::ConsumeJoinToken {
        request_id: rid("c1"),
        secret: "tkn".to_string(),
        now: Timestamp::from_millis(50_000),
    })
    .unwrap();

    let err = fsm
        .apply(&Command::ConsumeJoinToken {
            request_id: rid("c2"),
            secret: "tkn".to_string(),
            now: Timestamp::from_millis(51_000),
        })
        .unwrap_err();
    assert!(matches!(err, FsmError::TokenConsumed));
}

#[test_case(9_999 => true; "just before expiry")]
#[test_case(10_000 => false; "at expiry")]
#[test_case(86_400_000 => false; "long after expiry")]
fn join_token_expiry_boundary(now_ms: u64) -> bool {
    let mut fsm = Fsm::new();
    fsm.apply(&Command::IssueJoinToken {
        request_id: rid("i"),
        token: token("tkn", 10_000),
    })
    .unwrap();

    fsm.apply(&Command::ConsumeJoinToken {
        request_id: rid("c"),
        secret: "tkn".to_string(),
        now: Timestamp::from_millis(now_ms),
    })
    .is_ok()
}

// ----------------------------------------------------------------------
// Membership
// ----------------------------------------------------------------------

#[test]
fn add_remove_voter() {
    let mut fsm = Fsm::new();
    fsm.apply(&Command::AddVoter {
        request_id: rid("a0"),
        member: Member {
            id: 0,
            address: "10.0.0.1:7700".to_string(),
            rpc_address: "10.0.0.1:7421".to_string(),
        },
    })
    .unwrap();
    fsm.apply(&Command::AddVoter {
        request_id: rid("a1"),
        member: Member {
            id: 1,
            address: "10.0.0.2:7700".to_string(),
            rpc_address: "10.0.0.2:7421".to_string(),
        },
    })
    .unwrap();

    assert_eq!(fsm.membership().members.len(), 2);
    assert!(matches!(
        fsm.apply(&Command::AddVoter {
            request_id: rid("a2"),
            member: Member {
                id: 1,
                address: "10.0.0.3:7700".to_string(),
                rpc_address: "10.0.0.3:7421".to_string(),
            },
        })
        .unwrap_err(),
        FsmError::MemberExists(1)
    ));

    fsm.apply(&Command::RemoveVoter {
        request_id: rid("r"),
        member_id: 0,
    })
    .unwrap();
    assert_eq!(fsm.membership().members.len(), 1);
}

// ----------------------------------------------------------------------
// Idempotence, batches, determinism
// ----------------------------------------------------------------------

#[test]
fn repeated_request_id_is_a_no_op() {
    let mut fsm = Fsm::new();
    let cmd = create_service_cmd("same", service("web", 3));
    assert_eq!(fsm.apply(&cmd).unwrap(), ApplyOutcome::Applied);
    assert_eq!(fsm.apply(&cmd).unwrap(), ApplyOutcome::Duplicate);

    let services: Vec<Service> = fsm
        .store()
        .scan_records(warren_store::Collection::Services)
        .unwrap();
    assert_eq!(services.len(), 1);
}

#[test]
fn batch_applies_all_or_nothing() {
    let mut fsm = Fsm::new();
    fsm.apply(&create_service_cmd("a", service("web", 2))).unwrap();

    // Second sub-command is invalid (unknown service), so the first must
    // not land either.
    let err = fsm
        .apply(&Command::Batch {
            request_id: rid("batch"),
            commands: vec![
                Command::CreateContainer {
                    request_id: rid("c0"),
                    container: container("ctr-0", "web", 0, None),
                },
                Command::CreateContainer {
                    request_id: rid("c1"),
                    container: container("ctr-1", "ghost", 0, None),
                },
            ],
        })
        .unwrap_err();
    assert!(matches!(err, FsmError::ServiceNotFound(_)));
    assert!(fsm
        .store()
        .is_empty(warren_store::Collection::Containers));
}

#[test]
fn nested_batch_rejected() {
    let mut fsm = Fsm::new();
    let err = fsm
        .apply(&Command::Batch {
            request_id: rid("outer"),
            commands: vec![Command::Batch {
                request_id: rid("inner"),
                commands: vec![],
            }],
        })
        .unwrap_err();
    assert!(matches!(err, FsmError::NestedBatch));
}

#[test]
fn snapshot_round_trip_preserves_everything() {
    let mut fsm = Fsm::new();
    fsm.apply(&create_service_cmd("a", service("web", 3))).unwrap();
    fsm.apply(&Command::RegisterNode {
        request_id: rid("n"),
        node: node("node-1"),
    })
    .unwrap();

    let bytes = fsm.to_bytes();
    let restored = Fsm::from_bytes(&bytes).unwrap();
    assert_eq!(restored, fsm);
    assert_eq!(restored.to_bytes(), bytes);
    assert_eq!(restored.applied_index(), fsm.applied_index());
}

#[test]
fn replicas_applying_same_sequence_agree_byte_for_byte() {
    let commands = vec![
        create_service_cmd("s1", service("web", 3)),
        Command::RegisterNode {
            request_id: rid("n1"),
            node: node("node-1"),
        },
        Command::CreateContainer {
            request_id: rid("c1"),
            container: container("ctr-0", "web", 0, Some("node-1")),
        },
        Command::UpdateContainerState {
            request_id: rid("u1"),
            container_id: ContainerId::new("ctr-0"),
            update: ContainerStateUpdate::desire(DesiredState::Shutdown),
        },
    ];

    let mut left = Fsm::new();
    let mut right = Fsm::new();
    for cmd in &commands {
        let a = left.apply(cmd);
        let b = right.apply(cmd);
        assert_eq!(a.is_ok(), b.is_ok());
    }
    assert_eq!(left.to_bytes(), right.to_bytes());
}

proptest! {
    /// Any interleaving of service creates and deletes applies identically
    /// on two replicas, including rejected commands.
    #[test]
    fn prop_apply_is_deterministic(ops in prop::collection::vec((0u8..3, 0u8..4), 1..40)) {
        let mut left = Fsm::new();
        let mut right = Fsm::new();

        for (i, (op, target)) in ops.iter().enumerate() {
            let name = format!("svc{target}");
            let cmd = match op {
                0 => create_service_cmd(&format!("c{i}"), service(&name, u64::from(*target) + 1)),
                1 => Command::DeleteService {
                    request_id: rid(&format!("d{i}")),
                    service_id: ServiceId::new(format!("svc-{name}")),
                },
                _ => Command::UpdateService {
                    request_id: rid(&format!("u{i}")),
                    service_id: ServiceId::new(format!("svc-{name}")),
                    spec: spec(&name, 7),
                    updated_at: Timestamp::from_millis(i as u64),
                },
            };
            let a = left.apply(&cmd);
            let b = right.apply(&cmd);
            prop_assert_eq!(a.is_ok(), b.is_ok());
        }
        prop_assert_eq!(left.to_bytes(), right.to_bytes());
    }
}
