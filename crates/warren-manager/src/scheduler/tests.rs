//! Scheduler planning tests: placement, affinity, drain order.

use std::collections::BTreeMap;

use warren_fsm::{Command, ContainerStateUpdate, Fsm};
use warren_types::{
    ActualState, Container, ContainerId, DesiredState, HealthStatus, MountSpec, Node, NodeId,
    NodeRole, NodeStatus, RequestId, Resources, RestartPolicy, Service, ServiceId, ServiceMode,
    ServiceSpec, Timestamp, Version, Volume, VolumeId,
};

use super::plan;

fn rid() -> RequestId {
    RequestId::generate()
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
        resources: Resources::new(100, 64 << 20, 0),
        constraints: BTreeMap::new(),
        stop_timeout_ms: 10_000,
    }
}

fn add_service(fsm: &mut Fsm, name: &str, replicas: u64) -> ServiceId {
    let id = ServiceId::new(format!("svc-{name}"));
    fsm.apply(&Command::CreateService {
        request_id: rid(),
        service: Service {
            id: id.clone(),
            spec: spec(name, replicas),
            created_at: Timestamp::from_millis(1_000),
            updated_at: Timestamp::from_millis(1_000),
            version: Version::ZERO,
        },
    })
    .unwrap();
    id
}

fn add_service_with(fsm: &mut Fsm, service_spec: ServiceSpec) -> ServiceId {
    let id = ServiceId::new(format!("svc-{}", service_spec.name));
    fsm.apply(&Command::CreateService {
        request_id: rid(),
        service: Service {
            id: id.clone(),
            spec: service_spec,
            created_at: Timestamp::from_millis(1_000),
            updated_at: Timestamp::from_millis(1_000),
            version: Version::ZERO,
        },
    })
    .unwrap();
    id
}

fn add_node(fsm: &mut Fsm, id: &str, cpu: u64) {
    fsm.apply(&Command::RegisterNode {
        request_id: rid(),
        node: Node {
            id: NodeId::new(id),
            role: NodeRole::Worker,
            address: format!("{id}:7431"),
            resources: Resources::new(cpu, 8 << 30, 100 << 30),
            labels: BTreeMap::new(),
            last_heartbeat: Timestamp::from_millis(1_000),
            status: NodeStatus::Ready,
            drained: false,
            version: Version::ZERO,
        },
    })
    .unwrap();
}

fn add_volume(fsm: &mut Fsm, name: &str, affinity: &str) {
    fsm.apply(&Command::CreateVolume {
        request_id: rid(),
        volume: Volume {
            id: VolumeId::new(format!("vol-{name}")),
            name: name.to_string(),
            driver: "local".to_string(),
            node_affinity: Some(NodeId::new(affinity)),
            options: BTreeMap::new(),
            labels: BTreeMap::new(),
            created_at: Timestamp::from_millis(1_000),
            version: Version::ZERO,
        },
    })
    .unwrap();
}

/// Runs one pass and applies its commands, like the leader loop does.
fn run_pass(fsm: &mut Fsm, now: Timestamp) -> Vec<Command> {
    let commands = plan(fsm.store(), now);
    if !commands.is_empty() {
        let batch = super::batch(commands.clone());
        fsm.apply(&batch).unwrap();
    }
    commands
}

fn containers(fsm: &Fsm) -> Vec<Container> {
    fsm.store()
        .scan_records(warren_store::Collection::Containers)
        .unwrap()
}

#[test]
fn fills_every_missing_slot() {
    let mut fsm = Fsm::new();
    add_node(&mut fsm, "node-1", 4_000);
    add_service(&mut fsm, "web", 3);

    let commands = run_pass(&mut fsm, Timestamp::from_millis(10_000));
    assert_eq!(commands.len(), 3);

    let all = containers(&fsm);
    assert_eq!(all.len(), 3);
    let slots: Vec<u64> = all.iter().map(|c| c.slot).collect();
    assert_eq!(slots, vec![0, 1, 2]);
    assert!(all.iter().all(|c| c.node_id == Some(NodeId::new("node-1"))));
    assert!(all.iter().all(|c| c.actual_state == ActualState::Pending));
}

#[test]
fn pass_is_stable_once_converged() {
    let mut fsm = Fsm::new();
    add_node(&mut fsm, "node-1", 4_000);
    add_service(&mut fsm, "web", 2);

    run_pass(&mut fsm, Timestamp::from_millis(10_000));
    let second = plan(fsm.store(), Timestamp::from_millis(15_000));
    assert!(second.is_empty(), "converged state must plan nothing");
}

#[test]
fn slot_without_capacity_stays_unscheduled() {
    let mut fsm = Fsm::new();
    add_node(&mut fsm, "node-1", 150);
    add_service(&mut fsm, "web", 2);

    run_pass(&mut fsm, Timestamp::from_millis(10_000));
    let all = containers(&fsm);
    assert_eq!(all.len(), 2);
    let placed: Vec<_> = all.iter().filter(|c| c.node_id.is_some()).collect();
    let pending: Vec<_> = all.iter().filter(|c| c.node_id.is_none()).collect();
    assert_eq!(placed.len(), 1);
    assert_eq!(pending.len(), 1);
}

#[test]
fn unscheduled_container_is_placed_when_capacity_appears() {
    let mut fsm = Fsm::new();
    add_node(&mut fsm, "node-1", 150);
    add_service(&mut fsm, "web", 2);
    run_pass(&mut fsm, Timestamp::from_millis(10_000));

    add_node(&mut fsm, "node-2", 4_000);
    run_pass(&mut fsm, Timestamp::from_millis(20_000));

    let all = containers(&fsm);
    assert!(all.iter().all(|c| c.node_id.is_some()));
}

#[test]
fn placement_spreads_by_utilization() {
    let mut fsm = Fsm::new();
    add_node(&mut fsm, "node-1", 4_000);
    add_node(&mut fsm, "node-2", 4_000);
    add_service(&mut fsm, "web", 2);

    run_pass(&mut fsm, Timestamp::from_millis(10_000));
    let all = containers(&fsm);
    let nodes: std::collections::BTreeSet<_> =
        all.iter().filter_map(|c| c.node_id.clone()).collect();
    assert_eq!(nodes.len(), 2, "replicas spread over both nodes");
}

#[test]
fn volume_affinity_overrides_utilization() {
    let mut fsm = Fsm::new();
    // node-1 is much bigger, but the volume lives on node-2.
    add_node(&mut fsm, "node-1", 64_000);
    add_node(&mut fsm, "node-2", 4_000);
    add_volume(&mut fsm, "db", "node-2");

    let mut pg = spec("pg", 1);
    pg.mounts.push(MountSpec {
        volume: "db".to_string(),
        path: "/var/lib/pg".to_string(),
        read_only: false,
    });
    add_service_with(&mut fsm, pg);

    run_pass(&mut fsm, Timestamp::from_millis(10_000));
    let all = containers(&fsm);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].node_id, Some(NodeId::new("node-2")));
}

#[test]
fn missing_volume_is_created_with_first_placement() {
    let mut fsm = Fsm::new();
    add_node(&mut fsm, "node-1", 4_000);

    let mut pg = spec("pg", 1);
    pg.mounts.push(MountSpec {
        volume: "data".to_string(),
        path: "/data".to_string(),
        read_only: false,
    });
    add_service_with(&mut fsm, pg);

    let commands = run_pass(&mut fsm, Timestamp::from_millis(10_000));
    assert!(commands
        .iter()
        .any(|c| matches!(c, Command::CreateVolume { .. })));

    let volumes: Vec<Volume> = fsm
        .store()
        .scan_records(warren_store::Collection::Volumes)
        .unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].node_affinity, Some(NodeId::new("node-1")));

    let all = containers(&fsm);
    assert_eq!(all[0].node_id, Some(NodeId::new("node-1")));
}

#[test]
fn scale_down_drains_lexicographically_latest() {
    let mut fsm = Fsm::new();
    add_node(&mut fsm, "node-1", 4_000);
    let id = add_service(&mut fsm, "web", 3);
    run_pass(&mut fsm, Timestamp::from_millis(10_000));

    // Scale to one.
    fsm.apply(&Command::UpdateService {
        request_id: rid(),
        service_id: id,
        spec: spec("web", 1),
        updated_at: Timestamp::from_millis(20_000),
    })
    .unwrap();
    run_pass(&mut fsm, Timestamp::from_millis(21_000));

    let mut survivors: Vec<Container> = containers(&fsm)
        .into_iter()
        .filter(|c| c.desired_state == DesiredState::Running)
        .collect();
    survivors.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(survivors.len(), 1);

    // The survivor is the lexicographically earliest id.
    let all_ids: Vec<ContainerId> = {
        let mut ids: Vec<_> = containers(&fsm).into_iter().map(|c| c.id).collect();
        ids.sort();
        ids
    };
    assert_eq!(survivors[0].id, all_ids[0]);
}

#[test]
fn failed_container_recycles_after_backoff() {
    let mut fsm = Fsm::new();
    add_node(&mut fsm, "node-1", 4_000);
    add_service(&mut fsm, "web", 1);
    run_pass(&mut fsm, Timestamp::from_millis(10_000));

    let failed_id = containers(&fsm)[0].id.clone();
    fsm.apply(&Command::UpdateContainerState {
        request_id: rid(),
        container_id: failed_id.clone(),
        update: ContainerStateUpdate {
            actual_state: Some(ActualState::Failed),
            finished_at: Some(Timestamp::from_millis(20_000)),
            exit_code: Some(137),
            ..ContainerStateUpdate::default()
        },
    })
    .unwrap();

    // Inside the backoff window nothing happens.
    let early = plan(fsm.store(), Timestamp::from_millis(20_500));
    assert!(early.is_empty());

    // After the delay the slot cycles: old retired, new created.
    run_pass(&mut fsm, Timestamp::from_millis(21_100));
    let all = containers(&fsm);
    let old = all.iter().find(|c| c.id == failed_id).unwrap();
    assert_eq!(old.desired_state, DesiredState::Shutdown);
    let replacement: Vec<_> = all
        .iter()
        .filter(|c| c.desired_state == DesiredState::Running && c.slot == 0)
        .collect();
    assert_eq!(replacement.len(), 1);
    assert_eq!(replacement[0].health_status, HealthStatus::Unknown);
}

#[test]
fn reschedule_on_failure_avoids_the_failed_node() {
    let mut fsm = Fsm::new();
    // node-1 is far bigger, so plain scoring would put the replacement
    // right back where the container died.
    add_node(&mut fsm, "node-1", 64_000);
    add_node(&mut fsm, "node-2", 4_000);

    let mut web = spec("web", 1);
    web.restart_policy = RestartPolicy {
        reschedule: true,
        ..RestartPolicy::default()
    };
    add_service_with(&mut fsm, web);
    run_pass(&mut fsm, Timestamp::from_millis(10_000));

    let first = containers(&fsm)[0].clone();
    assert_eq!(first.node_id, Some(NodeId::new("node-1")));

    fsm.apply(&Command::UpdateContainerState {
        request_id: rid(),
        container_id: first.id.clone(),
        update: ContainerStateUpdate {
            actual_state: Some(ActualState::Failed),
            finished_at: Some(Timestamp::from_millis(20_000)),
            exit_code: Some(1),
            ..ContainerStateUpdate::default()
        },
    })
    .unwrap();

    run_pass(&mut fsm, Timestamp::from_millis(21_100));
    let replacement: Vec<Container> = containers(&fsm)
        .into_iter()
        .filter(|c| c.desired_state == DesiredState::Running)
        .collect();
    assert_eq!(replacement.len(), 1);
    assert_eq!(replacement[0].node_id, Some(NodeId::new("node-2")));
}

#[test]
fn without_reschedule_the_failed_node_stays_eligible() {
    let mut fsm = Fsm::new();
    add_node(&mut fsm, "node-1", 64_000);
    add_node(&mut fsm, "node-2", 4_000);
    add_service(&mut fsm, "web", 1);
    run_pass(&mut fsm, Timestamp::from_millis(10_000));

    let first = containers(&fsm)[0].clone();
    assert_eq!(first.node_id, Some(NodeId::new("node-1")));

    fsm.apply(&Command::UpdateContainerState {
        request_id: rid(),
        container_id: first.id.clone(),
        update: ContainerStateUpdate {
            actual_state: Some(ActualState::Failed),
            finished_at: Some(Timestamp::from_millis(20_000)),
            exit_code: Some(1),
            ..ContainerStateUpdate::default()
        },
    })
    .unwrap();

    run_pass(&mut fsm, Timestamp::from_millis(21_100));
    let replacement: Vec<Container> = containers(&fsm)
        .into_iter()
        .filter(|c| c.desired_state == DesiredState::Running)
        .collect();
    assert_eq!(replacement.len(), 1);
    // Default policy: best-scoring node wins, which is the big one the
    // container was on before.
    assert_eq!(replacement[0].node_id, Some(NodeId::new("node-1")));
}

#[test]
fn global_service_covers_every_eligible_node() {
    let mut fsm = Fsm::new();
    add_node(&mut fsm, "node-1", 4_000);
    add_node(&mut fsm, "node-2", 4_000);

    let mut agent = spec("agent", 0);
    agent.mode = ServiceMode::Global;
    add_service_with(&mut fsm, agent);

    run_pass(&mut fsm, Timestamp::from_millis(10_000));
    let all = containers(&fsm);
    assert_eq!(all.len(), 2);
    let nodes: std::collections::BTreeSet<_> =
        all.iter().filter_map(|c| c.node_id.clone()).collect();
    assert_eq!(nodes.len(), 2);

    // A node joining later gets covered on the next pass.
    add_node(&mut fsm, "node-3", 4_000);
    run_pass(&mut fsm, Timestamp::from_millis(20_000));
    assert_eq!(containers(&fsm).len(), 3);
}

#[test]
fn constraints_filter_nodes() {
    let mut fsm = Fsm::new();
    add_node(&mut fsm, "node-1", 4_000);
    fsm.apply(&Command::RegisterNode {
        request_id: rid(),
        node: Node {
            id: NodeId::new("node-gpu"),
            role: NodeRole::Worker,
            address: "node-gpu:7431".to_string(),
            resources: Resources::new(4_000, 8 << 30, 100 << 30),
            labels: BTreeMap::from([("gpu".to_string(), "true".to_string())]),
            last_heartbeat: Timestamp::from_millis(1_000),
            status: NodeStatus::Ready,
            drained: false,
            version: Version::ZERO,
        },
    })
    .unwrap();

    let mut train = spec("train", 1);
    train.constraints = BTreeMap::from([("gpu".to_string(), "true".to_string())]);
    add_service_with(&mut fsm, train);

    run_pass(&mut fsm, Timestamp::from_millis(10_000));
    let all = containers(&fsm);
    assert_eq!(all[0].node_id, Some(NodeId::new("node-gpu")));
}
