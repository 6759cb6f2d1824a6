//! The scheduler: drives desired replica counts into container
//! assignments.
//!
//! Runs on every manager but acts only while local == leader. Each pass
//! observes a store snapshot, computes the full diff for every service,
//! and submits the resulting commands as one log entry. The pass itself is
//! a pure function ([`plan`]) so placement policy is testable without a
//! cluster.
//!
//! Placement filters: resources against already-reserved allocations,
//! volume node-affinity, label constraints, node readiness. Scoring:
//! lowest post-placement utilization (max of cpu and memory), ties broken
//! by fewest containers of the same service (spread), then node id.
//! Scale-down drains the lexicographically-latest container ids, so the
//! survivor set is deterministic. A failed slot whose policy asks for
//! reschedule-on-failure is re-placed anywhere but the node it died on.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use warren_fsm::{Command, ContainerStateUpdate};
use warren_log::LogHandle;
use warren_store::Store;
use warren_types::{
    ActualState, Container, ContainerId, DesiredState, HealthStatus, Node, NodeId, RequestId,
    Resources, Service, ServiceMode, Timestamp, Version, Volume, VolumeId,
};

use crate::view;

/// Ceiling on the delay before a failed slot is re-created.
const REPLACE_BACKOFF_CAP_MS: u64 = 30_000;

/// One planned placement target.
struct Candidate<'a> {
    node: &'a Node,
    utilization: f64,
    same_service: usize,
}

/// Mutable bookkeeping threaded through one pass.
struct Pass {
    nodes: Vec<Node>,
    volumes: Vec<Volume>,
    /// Resources already reserved per node, updated as we place.
    reserved: BTreeMap<NodeId, Resources>,
    /// Containers of (node, service), for spread scoring.
    spread: BTreeMap<(NodeId, String), usize>,
    /// Volumes created earlier in this same pass, name -> affinity.
    pending_volumes: BTreeMap<String, NodeId>,
    commands: Vec<Command>,
    now: Timestamp,
}

/// Computes the scheduler commands for one pass over `store`.
pub fn plan(store: &Store, now: Timestamp) -> Vec<Command> {
    let Ok(services) = view::services(store) else {
        return Vec::new();
    };
    let Ok(nodes) = view::schedulable_nodes(store) else {
        return Vec::new();
    };
    let Ok(all_containers) = view::containers(store) else {
        return Vec::new();
    };
    let Ok(volumes) = view::volumes(store) else {
        return Vec::new();
    };

    let mut reserved: BTreeMap<NodeId, Resources> = BTreeMap::new();
    let mut spread: BTreeMap<(NodeId, String), usize> = BTreeMap::new();
    for container in &all_containers {
        if container.desired_state != DesiredState::Running {
            continue;
        }
        if let Some(node_id) = &container.node_id {
            let entry = reserved.entry(node_id.clone()).or_default();
            *entry = entry.plus(container.resources);
            *spread
                .entry((node_id.clone(), container.service_id.to_string()))
                .or_default() += 1;
        }
    }

    let mut pass = Pass {
        nodes,
        volumes,
        reserved,
        spread,
        pending_volumes: BTreeMap::new(),
        commands: Vec::new(),
        now,
    };

    for service in &services {
        let mine: Vec<&Container> = all_containers
            .iter()
            .filter(|c| c.service_id == service.id)
            .collect();
        match service.spec.mode {
            ServiceMode::Replicated { replicas } => {
                plan_replicated(&mut pass, service, &mine, replicas);
            }
            ServiceMode::Global => plan_global(&mut pass, service, &mine),
        }
    }

    pass.commands
}

fn plan_replicated(pass: &mut Pass, service: &Service, mine: &[&Container], replicas: u64) {
    // Live containers hold their slot; dead ones free it once their
    // restart backoff elapses. A reschedule-on-failure policy pins the
    // replacement away from the node the container died on.
    let mut live: Vec<&Container> = Vec::new();
    let mut occupied: BTreeSet<u64> = BTreeSet::new();
    let mut avoid: BTreeMap<u64, NodeId> = BTreeMap::new();

    for container in mine {
        if container.desired_state != DesiredState::Running {
            continue;
        }
        match container.actual_state {
            ActualState::Failed | ActualState::Complete => {
                if cycle_ready(pass.now, container) {
                    // Retire the dead container; its slot is re-created
                    // below in the same batch (the retire applies first,
                    // so the slot-uniqueness check passes).
                    pass.commands.push(desire_shutdown(&container.id));
                    if container.restart_policy.reschedule {
                        if let Some(node_id) = &container.node_id {
                            avoid.insert(container.slot, node_id.clone());
                        }
                    }
                } else {
                    occupied.insert(container.slot);
                }
            }
            _ => {
                live.push(container);
                occupied.insert(container.slot);
            }
        }
    }

    // Scale down: drain the lexicographically-latest ids.
    let excess = live.len() as i64 - replicas as i64;
    if excess > 0 {
        let mut by_id: Vec<&&Container> = live.iter().collect();
        by_id.sort_by(|a, b| b.id.cmp(&a.id));
        for container in by_id.into_iter().take(excess as usize) {
            pass.commands.push(desire_shutdown(&container.id));
        }
    }

    // Scale up: fill every missing slot.
    for slot in 0..replicas {
        if !occupied.contains(&slot) {
            create_container(pass, service, slot, avoid.get(&slot));
        }
    }

    // Place containers that were created without a node.
    for container in &live {
        if container.node_id.is_none() && container.actual_state == ActualState::Pending {
            assign_container(pass, service, container);
        }
    }
}

fn plan_global(pass: &mut Pass, service: &Service, mine: &[&Container]) {
    let live: Vec<&&Container> = mine
        .iter()
        .filter(|c| {
            c.desired_state == DesiredState::Running
                && !matches!(c.actual_state, ActualState::Failed | ActualState::Complete)
        })
        .collect();

    let eligible: Vec<NodeId> = pass
        .nodes
        .iter()
        .filter(|n| constraints_match(service, n))
        .map(|n| n.id.clone())
        .collect();

    // One container per eligible node.
    let mut next_slot = mine.iter().map(|c| c.slot + 1).max().unwrap_or(0);
    for node_id in &eligible {
        let covered = live
            .iter()
            .any(|c| c.node_id.as_ref() == Some(node_id));
        if !covered {
            create_global_container(pass, service, next_slot, node_id.clone());
            next_slot += 1;
        }
    }

    // Containers on nodes that are no longer eligible collapse.
    for container in &live {
        match &container.node_id {
            Some(node_id) if !eligible.contains(node_id) => {
                pass.commands.push(desire_shutdown(&container.id));
            }
            Some(_) => {}
            None => {
                // Global containers are always created with a node.
                pass.commands.push(desire_shutdown(&container.id));
            }
        }
    }

    // Retire dead global containers; replacements come from the coverage
    // loop above once the node is covered again.
    for container in mine {
        if container.desired_state == DesiredState::Running
            && matches!(
                container.actual_state,
                ActualState::Failed | ActualState::Complete
            )
            && cycle_ready(pass.now, container)
        {
            pass.commands.push(desire_shutdown(&container.id));
        }
    }
}

/// True once a dead container's restart backoff has elapsed.
fn cycle_ready(now: Timestamp, container: &Container) -> bool {
    let finished = container.finished_at.unwrap_or(container.created_at);
    let delay = container
        .restart_policy
        .delay_ms
        .min(REPLACE_BACKOFF_CAP_MS);
    now.millis_since(finished) >= delay
}

fn desire_shutdown(id: &ContainerId) -> Command {
    Command::UpdateContainerState {
        request_id: RequestId::generate(),
        container_id: id.clone(),
        update: ContainerStateUpdate::desire(DesiredState::Shutdown),
    }
}

fn constraints_match(service: &Service, node: &Node) -> bool {
    service
        .spec
        .constraints
        .iter()
        .all(|(key, value)| node.labels.get(key) == Some(value))
}

/// Volume names a service mounts whose volume does not exist yet.
fn missing_volumes(pass: &Pass, service: &Service) -> Vec<String> {
    service
        .spec
        .mounts
        .iter()
        .filter(|m| {
            !pass.volumes.iter().any(|v| v.name == m.volume)
                && !pass.pending_volumes.contains_key(&m.volume)
        })
        .map(|m| m.volume.clone())
        .collect()
}

/// The node every existing volume mount pins this service to, if any.
fn volume_pin(pass: &Pass, service: &Service) -> Option<NodeId> {
    for mount in &service.spec.mounts {
        if let Some(volume) = pass.volumes.iter().find(|v| v.name == mount.volume) {
            if let Some(affinity) = &volume.node_affinity {
                return Some(affinity.clone());
            }
        }
        if let Some(affinity) = pass.pending_volumes.get(&mount.volume) {
            return Some(affinity.clone());
        }
    }
    None
}

/// Picks a placement target. `avoid` excludes the node a rescheduled
/// container just failed on.
fn pick_node(pass: &Pass, service: &Service, avoid: Option<&NodeId>) -> Option<NodeId> {
    let pin = volume_pin(pass, service);
    let mut best: Option<Candidate<'_>> = None;

    for node in &pass.nodes {
        if avoid == Some(&node.id) {
            continue;
        }
        if let Some(pinned) = &pin {
            if &node.id != pinned {
                continue;
            }
        }
        if !constraints_match(service, node) {
            continue;
        }
        let used = pass
            .reserved
            .get(&node.id)
            .copied()
            .unwrap_or_default();
        if !node.resources.can_fit(used.plus(service.spec.resources)) {
            continue;
        }

        let after = used.plus(service.spec.resources);
        let cpu = ratio(after.cpu_millis, node.resources.cpu_millis);
        let memory = ratio(after.memory_bytes, node.resources.memory_bytes);
        let candidate = Candidate {
            node,
            utilization: cpu.max(memory),
            same_service: pass
                .spread
                .get(&(node.id.clone(), service.id.to_string()))
                .copied()
                .unwrap_or(0),
        };

        let better = match &best {
            None => true,
            Some(current) => {
                (
                    candidate.utilization,
                    candidate.same_service,
                    &candidate.node.id,
                )
                    .partial_cmp(&(current.utilization, current.same_service, &current.node.id))
                    == Some(std::cmp::Ordering::Less)
            }
        };
        if better {
            best = Some(candidate);
        }
    }
    best.map(|c| c.node.id.clone())
}

fn ratio(used: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        0.0
    } else {
        used as f64 / capacity as f64
    }
}

/// Reserve resources and bump spread counters after a placement.
fn commit_placement(pass: &mut Pass, service: &Service, node_id: &NodeId) {
    let entry = pass.reserved.entry(node_id.clone()).or_default();
    *entry = entry.plus(service.spec.resources);
    *pass
        .spread
        .entry((node_id.clone(), service.id.to_string()))
        .or_default() += 1;
}

/// Create any volumes the service needs, pinned to the chosen node.
fn create_missing_volumes(pass: &mut Pass, service: &Service, node_id: &NodeId) {
    for name in missing_volumes(pass, service) {
        pass.pending_volumes.insert(name.clone(), node_id.clone());
        pass.commands.push(Command::CreateVolume {
            request_id: RequestId::generate(),
            volume: Volume {
                id: VolumeId::generate(),
                name,
                driver: "local".to_string(),
                node_affinity: Some(node_id.clone()),
                options: BTreeMap::new(),
                labels: BTreeMap::new(),
                created_at: pass.now,
                version: Version::ZERO,
            },
        });
    }
}

fn new_container(pass: &Pass, service: &Service, slot: u64, node_id: Option<NodeId>) -> Container {
    Container {
        id: mint_container_id(service, slot),
        service_id: service.id.clone(),
        node_id,
        slot,
        desired_state: DesiredState::Running,
        actual_state: ActualState::Pending,
        image: service.spec.image.clone(),
        env: service.spec.env.clone(),
        mounts: service.spec.mounts.clone(),
        secrets: service.spec.secrets.clone(),
        ports: service.spec.ports.clone(),
        restart_policy: service.spec.restart_policy,
        health_check: service.spec.health_check.clone(),
        health_status: HealthStatus::Unknown,
        resources: service.spec.resources,
        stop_timeout_ms: service.spec.stop_timeout_ms,
        created_at: pass.now,
        started_at: None,
        finished_at: None,
        exit_code: None,
        version: Version::ZERO,
        assignment_version: Version::ZERO,
    }
}

/// Container ids sort by (service name, slot, creation), which is what
/// makes lexicographic drain keep the oldest slots.
fn mint_container_id(service: &Service, slot: u64) -> ContainerId {
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    ContainerId::new(format!("{}.{:04}.{}", service.spec.name, slot, suffix))
}

fn create_container(pass: &mut Pass, service: &Service, slot: u64, avoid: Option<&NodeId>) {
    let chosen = pick_node(pass, service, avoid);
    match chosen {
        Some(node_id) => {
            create_missing_volumes(pass, service, &node_id);
            commit_placement(pass, service, &node_id);
            let container = new_container(pass, service, slot, Some(node_id));
            pass.commands.push(Command::CreateContainer {
                request_id: RequestId::generate(),
                container,
            });
        }
        None => {
            // No candidate satisfies the filters: the slot stays
            // unscheduled and shows up as pending.
            debug!(service = %service.spec.name, slot, "no eligible node, slot unscheduled");
            let container = new_container(pass, service, slot, None);
            pass.commands.push(Command::CreateContainer {
                request_id: RequestId::generate(),
                container,
            });
        }
    }
}

fn create_global_container(pass: &mut Pass, service: &Service, slot: u64, node_id: NodeId) {
    // Global placement is by node identity; resources still gate it.
    let used = pass
        .reserved
        .get(&node_id)
        .copied()
        .unwrap_or_default();
    let fits = pass
        .nodes
        .iter()
        .find(|n| n.id == node_id)
        .is_some_and(|n| n.resources.can_fit(used.plus(service.spec.resources)));
    if !fits {
        debug!(service = %service.spec.name, node = %node_id, "global slot does not fit");
        return;
    }
    create_missing_volumes(pass, service, &node_id);
    commit_placement(pass, service, &node_id);
    let container = new_container(pass, service, slot, Some(node_id));
    pass.commands.push(Command::CreateContainer {
        request_id: RequestId::generate(),
        container,
    });
}

/// Give an unplaced container a node, if one qualifies now.
fn assign_container(pass: &mut Pass, service: &Service, container: &Container) {
    if let Some(node_id) = pick_node(pass, service, None) {
        create_missing_volumes(pass, service, &node_id);
        commit_placement(pass, service, &node_id);
        pass.commands.push(Command::UpdateContainerState {
            request_id: RequestId::generate(),
            container_id: container.id.clone(),
            update: ContainerStateUpdate {
                node_id: Some(node_id),
                ..ContainerStateUpdate::default()
            },
        });
    }
}

/// Runs scheduler passes on a 5 s cadence plus event-driven wakeups,
/// acting only while this manager is the leader.
pub fn spawn(log: LogHandle, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut applied = log.subscribe_applied();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = applied.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
            if !log.leader_status().is_leader {
                continue;
            }

            let commands = {
                let fsm = log.fsm();
                let guard = match fsm.read() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                plan(guard.store(), Timestamp::now())
            };
            if commands.is_empty() {
                continue;
            }

            debug!(count = commands.len(), "submitting scheduler pass");
            let command = batch(commands);
            if let Err(error) = log.submit(command, Duration::from_secs(10)).await {
                // Conflicts resolve at apply; losing leadership mid-pass
                // is normal during failover.
                warn!(%error, "scheduler pass rejected");
            }
        }
    });
}

/// Wraps a pass in a single log entry when it has more than one command.
pub fn batch(mut commands: Vec<Command>) -> Command {
    if commands.len() == 1 {
        commands.remove(0)
    } else {
        Command::Batch {
            request_id: RequestId::generate(),
            commands,
        }
    }
}

#[cfg(test)]
mod tests;
