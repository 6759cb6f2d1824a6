//! The reconciler: turns drift into corrective log commands.
//!
//! Runs on the leader every 10 s. Each pass observes a store snapshot and
//! proposes commands for: dead nodes (heartbeat silence), unhealthy
//! containers, orphaned containers of deleted services, and tombstones
//! for containers whose removal the owning worker has confirmed. The pass
//! is a pure function ([`plan`]); the loop around it is identical in
//! shape to the scheduler's.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use warren_fsm::{Command, ContainerStateUpdate, NodeStatusUpdate};
use warren_log::LogHandle;
use warren_store::Store;
use warren_types::{
    ActualState, DesiredState, HealthStatus, NodeStatus, RequestId, RestartKind, Timestamp,
};

use crate::view;

/// Heartbeat silence after which a node is considered dead.
pub const NODE_DOWN_AFTER_MS: u64 = 30_000;

/// Computes the corrective commands for one pass over `store`.
pub fn plan(store: &Store, now: Timestamp, node_down_after_ms: u64) -> Vec<Command> {
    let mut commands = Vec::new();

    let Ok(nodes) = view::nodes(store) else {
        return commands;
    };
    let Ok(containers) = view::containers(store) else {
        return commands;
    };
    let Ok(services) = view::services(store) else {
        return commands;
    };

    // ------------------------------------------------------------------
    // Node liveness: silent nodes go down, their work is failed over.
    // ------------------------------------------------------------------
    for node in &nodes {
        let silent_for = now.millis_since(node.last_heartbeat);
        if node.status == NodeStatus::Ready && silent_for > node_down_after_ms {
            debug!(node = %node.id, silent_ms = silent_for, "marking node down");
            commands.push(Command::UpdateNodeStatus {
                request_id: RequestId::generate(),
                node_id: node.id.clone(),
                update: NodeStatusUpdate::mark_down(),
            });
            for container in &containers {
                if container.node_id.as_ref() == Some(&node.id)
                    && container.desired_state == DesiredState::Running
                    && !matches!(
                        container.actual_state,
                        ActualState::Failed | ActualState::Complete
                    )
                {
                    // Failed containers are the scheduler's signal to
                    // re-create the slot elsewhere.
                    commands.push(Command::UpdateContainerState {
                        request_id: RequestId::generate(),
                        container_id: container.id.clone(),
                        update: ContainerStateUpdate {
                            actual_state: Some(ActualState::Failed),
                            finished_at: Some(now),
                            ..ContainerStateUpdate::default()
                        },
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Container health: probes exhausted their retry budget. Only
    // restartable policies get the failed-and-replaced treatment; a
    // never-restart container stays up, unhealthy, for someone to look
    // at.
    // ------------------------------------------------------------------
    for container in &containers {
        if container.desired_state == DesiredState::Running
            && container.actual_state == ActualState::Running
            && container.health_status == HealthStatus::Unhealthy
            && matches!(
                container.restart_policy.kind,
                RestartKind::OnFailure | RestartKind::Always
            )
        {
            commands.push(Command::UpdateContainerState {
                request_id: RequestId::generate(),
                container_id: container.id.clone(),
                update: ContainerStateUpdate {
                    actual_state: Some(ActualState::Failed),
                    finished_at: Some(now),
                    ..ContainerStateUpdate::default()
                },
            });
        }
    }

    // ------------------------------------------------------------------
    // Drained nodes shed their running work gracefully.
    // ------------------------------------------------------------------
    for node in nodes.iter().filter(|n| n.drained) {
        for container in &containers {
            if container.node_id.as_ref() == Some(&node.id)
                && container.desired_state == DesiredState::Running
            {
                commands.push(Command::UpdateContainerState {
                    request_id: RequestId::generate(),
                    container_id: container.id.clone(),
                    update: ContainerStateUpdate::desire(DesiredState::Shutdown),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Orphan sweep and tombstones.
    // ------------------------------------------------------------------
    for container in &containers {
        let service_exists = services.iter().any(|s| s.id == container.service_id);
        if !service_exists && container.desired_state != DesiredState::Shutdown {
            commands.push(Command::UpdateContainerState {
                request_id: RequestId::generate(),
                container_id: container.id.clone(),
                update: ContainerStateUpdate::desire(DesiredState::Shutdown),
            });
            continue;
        }

        // A shutdown container is tombstoned once the owning worker has
        // confirmed removal (terminal actual state), or immediately when
        // it never reached a node.
        if container.desired_state == DesiredState::Shutdown {
            let removable = matches!(
                container.actual_state,
                ActualState::Complete | ActualState::Failed
            ) || container.node_id.is_none()
                || container.actual_state == ActualState::Pending;
            if removable {
                commands.push(Command::DeleteContainer {
                    request_id: RequestId::generate(),
                    container_id: container.id.clone(),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Reference integrity: warn when a restore left dangling references.
    // ------------------------------------------------------------------
    if let (Ok(secrets), Ok(volumes)) = (view::secrets(store), view::volumes(store)) {
        for service in &services {
            for secret_ref in &service.spec.secrets {
                if !secrets.iter().any(|s| s.name == secret_ref.name) {
                    warn!(
                        service = %service.spec.name,
                        secret = %secret_ref.name,
                        "service references a missing secret"
                    );
                }
            }
            for mount in &service.spec.mounts {
                if !volumes.iter().any(|v| v.name == mount.volume) {
                    // Expected until the scheduler creates the volume at
                    // first placement; only noisy after a restore.
                    debug!(
                        service = %service.spec.name,
                        volume = %mount.volume,
                        "service references a volume that does not exist yet"
                    );
                }
            }
        }
    }

    commands
}

/// Runs reconciler passes on a 10 s cadence, acting only on the leader.
pub fn spawn(
    log: LogHandle,
    interval: Duration,
    node_down_after_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
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
                plan(guard.store(), Timestamp::now(), node_down_after_ms)
            };
            if commands.is_empty() {
                continue;
            }

            debug!(count = commands.len(), "submitting reconciler pass");
            let command = crate::scheduler::batch(commands);
            if let Err(error) = log.submit(command, Duration::from_secs(10)).await {
                warn!(%error, "reconciler pass rejected");
            }
        }
    });
}
