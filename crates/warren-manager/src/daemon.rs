//! Manager daemon assembly: recovery, listeners, control loops.
//!
//! # Persisted layout
//!
//! ```text
//! {data_dir}/
//! ├── cluster.json   <- replica id + voting membership (bootstrap)
//! ├── cluster.key    <- AES-256 cluster key (0600)
//! ├── node-id        <- this node's id in the Nodes collection
//! ├── warren.sock    <- read-only IPC socket (while running)
//! ├── log/           <- replicated log (wal + meta)
//! └── snapshots/     <- FSM snapshots
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use warren_config::WarrenConfig;
use warren_crypto::ClusterKey;
use warren_fsm::Command;
use warren_log::{LogConfig, LogHandle};
use warren_types::{
    Member, Node, NodeId, NodeRole, NodeStatus, RequestId, Resources, Timestamp, Version,
};

use crate::error::{ManagerError, ManagerResult};
use crate::handler::{ManagerContext, RequestHandler};
use crate::{reconciler, scheduler, server, tls};

const BOOTSTRAP_FILE: &str = "cluster.json";
const KEY_FILE: &str = "cluster.key";
const NODE_ID_FILE: &str = "node-id";

/// Durable bootstrap: which replica this manager is, and who votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub replica_id: u8,
    pub members: Vec<Member>,
}

impl Bootstrap {
    pub fn save(&self, data_dir: &Path) -> ManagerResult<()> {
        std::fs::create_dir_all(data_dir)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ManagerError::Internal(e.to_string()))?;
        std::fs::write(data_dir.join(BOOTSTRAP_FILE), json)?;
        Ok(())
    }

    pub fn load(data_dir: &Path) -> ManagerResult<Self> {
        let json = std::fs::read_to_string(data_dir.join(BOOTSTRAP_FILE))?;
        serde_json::from_str(&json).map_err(|e| ManagerError::Internal(e.to_string()))
    }
}

/// Initializes a fresh single-manager cluster in `data_dir`.
///
/// Generates the cluster key and writes the bootstrap file naming this
/// manager as the sole voter. Idempotent over an already-initialized
/// directory only by refusing to clobber it.
pub fn init_cluster(config: &WarrenConfig) -> ManagerResult<Bootstrap> {
    let data_dir = &config.node.data_dir;
    if data_dir.join(BOOTSTRAP_FILE).exists() {
        return Err(ManagerError::Validation(format!(
            "{} already contains a cluster",
            data_dir.display()
        )));
    }
    std::fs::create_dir_all(data_dir)?;

    let key = ClusterKey::generate();
    key.save(&data_dir.join(KEY_FILE))?;

    let bootstrap = Bootstrap {
        replica_id: 0,
        members: vec![Member {
            id: 0,
            address: config.manager.peer_addr.clone(),
            rpc_address: config.manager.listen_addr.clone(),
        }],
    };
    bootstrap.save(data_dir)?;
    info!(data_dir = %data_dir.display(), "cluster initialized");
    Ok(bootstrap)
}

/// Persists join results for a manager that is entering an existing
/// cluster: the shared key plus the bootstrap naming every voter.
pub fn save_join_material(
    data_dir: &Path,
    key_bytes: &[u8],
    bootstrap: &Bootstrap,
    node_id: &NodeId,
) -> ManagerResult<()> {
    std::fs::create_dir_all(data_dir)?;
    let key = ClusterKey::from_bytes(key_bytes)?;
    key.save(&data_dir.join(KEY_FILE))?;
    bootstrap.save(data_dir)?;
    save_node_id(data_dir, node_id)?;
    Ok(())
}

pub fn save_node_id(data_dir: &Path, node_id: &NodeId) -> ManagerResult<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(data_dir.join(NODE_ID_FILE), node_id.as_str())?;
    Ok(())
}

pub fn load_node_id(data_dir: &Path) -> Option<NodeId> {
    std::fs::read_to_string(data_dir.join(NODE_ID_FILE))
        .ok()
        .map(|s| NodeId::new(s.trim()))
}

/// A running manager.
pub struct ManagerHandle {
    pub log: LogHandle,
    pub node_id: NodeId,
    /// The bound RPC address (useful when configured with port 0).
    pub rpc_addr: std::net::SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl ManagerHandle {
    /// Signals every task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Starts the full manager: log replica, RPC listeners, scheduler,
/// reconciler, and self-registration.
pub async fn run_manager(config: WarrenConfig) -> ManagerResult<ManagerHandle> {
    let data_dir = config.node.data_dir.clone();
    let bootstrap = Bootstrap::load(&data_dir).map_err(|_| {
        ManagerError::Validation(format!(
            "{} is not initialized; run `warren cluster init` or join first",
            data_dir.display()
        ))
    })?;
    let cluster_key = ClusterKey::load(&data_dir.join(KEY_FILE))?;

    let log_config = LogConfig::new(bootstrap.replica_id, bootstrap.members.clone(), data_dir.clone());
    let log = warren_log::start(log_config)
        .await
        .map_err(ManagerError::Log)?;

    let tls_context = tls::build(&config.tls)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = Arc::new(ManagerContext {
        log: log.clone(),
        cluster_key,
        ca_cert_pem: tls_context.as_ref().map(|t| t.ca_pem.clone()),
        forward_tls: tls_context.as_ref().map(|t| t.connector.clone()),
        write_deadline: Duration::from_secs(10),
    });
    let handler = RequestHandler::new(ctx);

    // Network RPC listener.
    let listener = tokio::net::TcpListener::bind(&config.manager.listen_addr).await?;
    let rpc_addr = listener.local_addr()?;
    tokio::spawn(server::serve_network(
        listener,
        handler.clone(),
        tls_context,
        shutdown_rx.clone(),
    ));

    // Local read-only IPC.
    #[cfg(unix)]
    {
        let socket_path = server::ipc_socket_path(&data_dir);
        let ipc_handler = handler.clone();
        let ipc_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(error) = server::serve_ipc(socket_path, ipc_handler, ipc_shutdown).await {
                warn!(%error, "ipc listener failed");
            }
        });
    }

    // Control loops, leader-gated internally.
    scheduler::spawn(
        log.clone(),
        Duration::from_millis(config.manager.scheduler_interval_ms),
        shutdown_rx.clone(),
    );
    reconciler::spawn(
        log.clone(),
        Duration::from_millis(config.manager.reconciler_interval_ms),
        config.manager.node_down_after_ms,
        shutdown_rx.clone(),
    );

    // Keep the bootstrap file in step with replicated membership; changes
    // take effect at the next process start.
    spawn_membership_sync(log.clone(), data_dir.clone(), bootstrap, shutdown_rx.clone());

    // Make sure this manager appears in the Nodes collection.
    let node_id = ensure_node_id(&data_dir)?;
    spawn_self_registration(log.clone(), node_id.clone(), config, shutdown_rx);

    Ok(ManagerHandle {
        log,
        node_id,
        rpc_addr,
        shutdown_tx,
    })
}

fn ensure_node_id(data_dir: &Path) -> ManagerResult<NodeId> {
    if let Some(node_id) = load_node_id(data_dir) {
        return Ok(node_id);
    }
    let node_id = NodeId::generate();
    save_node_id(data_dir, &node_id)?;
    Ok(node_id)
}

fn spawn_membership_sync(
    log: LogHandle,
    data_dir: std::path::PathBuf,
    bootstrap: Bootstrap,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut applied = log.subscribe_applied();
        let mut current = bootstrap;
        loop {
            tokio::select! {
                changed = applied.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
            let members = {
                let fsm = log.fsm();
                let Ok(guard) = fsm.read() else { return };
                guard.membership().members
            };
            if !members.is_empty() && members != current.members {
                current.members = members;
                if let Err(error) = current.save(&data_dir) {
                    warn!(%error, "failed to persist membership change");
                } else {
                    info!(
                        voters = current.members.len(),
                        "membership changed; takes effect at next restart"
                    );
                }
            }
        }
    });
}

/// Registers this manager's node record once the cluster has a leader.
fn spawn_self_registration(
    log: LogHandle,
    node_id: NodeId,
    config: WarrenConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let registered = {
                let fsm = log.fsm();
                let Ok(guard) = fsm.read() else { return };
                guard
                    .store()
                    .contains(warren_store::Collection::Nodes, node_id.as_str())
            };
            if registered {
                return;
            }
            if !log.leader_status().is_leader {
                continue;
            }

            let node = Node {
                id: node_id.clone(),
                role: NodeRole::Manager,
                address: config.manager.listen_addr.clone(),
                resources: Resources::default(),
                labels: config.node.labels.clone(),
                last_heartbeat: Timestamp::now(),
                status: NodeStatus::Ready,
                drained: false,
                version: Version::ZERO,
            };
            match log
                .submit(
                    Command::RegisterNode {
                        request_id: RequestId::generate(),
                        node,
                    },
                    Duration::from_secs(10),
                )
                .await
            {
                Ok(_) => {
                    info!(node = %node_id, "manager registered");
                    return;
                }
                Err(error) => warn!(%error, "manager self-registration failed, retrying"),
            }
        }
    });
}
