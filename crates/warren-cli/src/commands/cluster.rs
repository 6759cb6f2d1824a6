//! `warren cluster {init|join|join-token|info}`.

use std::sync::Arc;

use anyhow::{Context as _, bail};
use clap::Subcommand;
use owo_colors::OwoColorize;
use tracing::info;

use warren_client::ClientConfig;
use warren_crypto::ClusterKey;
use warren_manager::Bootstrap;
use warren_types::{Member, NodeId, NodeRole, Resources};
use warren_worker::{ContainerRuntime, DockerRuntime, FakeRuntime, WorkerConfig};

use crate::commands::Context;
use crate::output;

#[derive(Subcommand)]
pub enum ClusterCommands {
    /// Initialize a new cluster and run the first manager (foreground).
    Init,

    /// Join this machine to an existing cluster and run it (foreground).
    Join {
        /// One-shot join token minted by `cluster join-token`.
        #[arg(long)]
        token: String,

        /// Role to join as.
        #[arg(long, default_value = "worker")]
        role: RoleArg,

        /// Address this node advertises to the cluster.
        #[arg(long)]
        advertise: Option<String>,

        /// Use the in-memory runtime instead of Docker (development).
        #[arg(long)]
        dev_runtime: bool,
    },

    /// Mint a one-shot join token (24 h lifetime).
    JoinToken {
        #[arg(long, default_value = "worker")]
        role: RoleArg,
    },

    /// Show cluster status.
    Info,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum RoleArg {
    Manager,
    Worker,
}

impl From<RoleArg> for NodeRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Manager => NodeRole::Manager,
            RoleArg::Worker => NodeRole::Worker,
        }
    }
}

pub async fn run(ctx: Context, command: ClusterCommands) -> anyhow::Result<()> {
    match command {
        ClusterCommands::Init => init(ctx).await,
        ClusterCommands::Join {
            token,
            role,
            advertise,
            dev_runtime,
        } => join(ctx, token, role.into(), advertise, dev_runtime).await,
        ClusterCommands::JoinToken { role } => join_token(ctx, role.into()).await,
        ClusterCommands::Info => info_cmd(ctx).await,
    }
}

async fn init(ctx: Context) -> anyhow::Result<()> {
    let config = ctx.config.clone();
    if !config
        .node
        .data_dir
        .join("cluster.json")
        .exists()
    {
        warren_manager::init_cluster(&config)?;
        output::success(format!(
            "cluster initialized in {}",
            config.node.data_dir.display()
        ));
    }

    let handle = warren_manager::run_manager(config).await?;
    println!(
        "manager listening on {} (Ctrl-C to stop)",
        handle.rpc_addr.to_string().bold()
    );
    tokio::signal::ctrl_c().await.context("signal handler")?;
    handle.shutdown();
    Ok(())
}

async fn join(
    ctx: Context,
    token: String,
    role: NodeRole,
    advertise: Option<String>,
    dev_runtime: bool,
) -> anyhow::Result<()> {
    let config = ctx.config.clone();
    let advertised = advertise.unwrap_or_else(|| match role {
        NodeRole::Manager => config.manager.listen_addr.clone(),
        NodeRole::Worker => config.worker.manager_addr.clone(),
    });

    let mut client = ctx.client().await?;
    let (node_id, peers, _ca_cert, key_bytes) = client
        .join_cluster(
            token,
            role,
            advertised.clone(),
            detect_resources(),
            config.node.labels.clone(),
        )
        .await?;
    output::success(format!("joined as {} ({role})", node_id.to_string().bold()));

    match role {
        NodeRole::Manager => join_as_manager(ctx, config, node_id, peers, &key_bytes).await,
        NodeRole::Worker => join_as_worker(config, node_id, key_bytes, dev_runtime).await,
    }
}

/// A joining manager becomes a voter: pick the next replica id, persist
/// the bootstrap, register with the quorum, and run.
async fn join_as_manager(
    ctx: Context,
    config: warren_config::WarrenConfig,
    node_id: NodeId,
    mut peers: Vec<Member>,
    key_bytes: &[u8],
) -> anyhow::Result<()> {
    if peers.is_empty() {
        bail!("join response carried no voting members");
    }
    let replica_id = peers.iter().map(|m| m.id + 1).max().unwrap_or(0);
    let member = Member {
        id: replica_id,
        address: config.manager.peer_addr.clone(),
        rpc_address: config.manager.listen_addr.clone(),
    };

    let mut client = ctx.client().await?;
    client.add_voter(member.clone()).await?;
    peers.push(member);
    peers.sort_by_key(|m| m.id);

    warren_manager::save_join_material(
        &config.node.data_dir,
        key_bytes,
        &Bootstrap {
            replica_id,
            members: peers,
        },
        &node_id,
    )?;
    info!(replica = replica_id, "voter registered");

    let handle = warren_manager::run_manager(config).await?;
    println!(
        "manager listening on {} (Ctrl-C to stop)",
        handle.rpc_addr.to_string().bold()
    );
    tokio::signal::ctrl_c().await.context("signal handler")?;
    handle.shutdown();
    Ok(())
}

async fn join_as_worker(
    config: warren_config::WarrenConfig,
    node_id: NodeId,
    key_bytes: Vec<u8>,
    dev_runtime: bool,
) -> anyhow::Result<()> {
    let key = ClusterKey::from_bytes(&key_bytes)?;
    // Persist identity so a restarted worker keeps its node id.
    warren_manager::save_node_id(&config.node.data_dir, &node_id)?;
    key.save(&config.node.data_dir.join("cluster.key"))?;

    let runtime: Arc<dyn ContainerRuntime> = if dev_runtime {
        Arc::new(FakeRuntime::new())
    } else {
        Arc::new(DockerRuntime::connect(config.runtime.namespace.clone())?)
    };

    let worker = warren_worker::run_worker(
        WorkerConfig {
            node_id,
            manager_addr: config.worker.manager_addr.clone(),
            secrets_base: warren_worker::SecretStore::default_base(),
            resources: detect_resources(),
            poll_interval: std::time::Duration::from_millis(config.worker.poll_interval_ms),
            heartbeat_interval: std::time::Duration::from_millis(
                config.worker.heartbeat_interval_ms,
            ),
            autonomous_after: std::time::Duration::from_millis(config.worker.autonomous_after_ms),
            client_config: ClientConfig::default(),
        },
        key,
        runtime,
    );
    println!("worker running (Ctrl-C to stop)");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    worker.shutdown();
    Ok(())
}

async fn join_token(ctx: Context, role: NodeRole) -> anyhow::Result<()> {
    let mut client = ctx.client().await?;
    let (token, expires_at) = client.issue_join_token(role).await?;
    println!("{token}");
    let hours = expires_at.millis_since(warren_types::Timestamp::now()) / 3_600_000;
    println!("{}", format!("expires in {hours}h").dimmed());
    Ok(())
}

async fn info_cmd(ctx: Context) -> anyhow::Result<()> {
    let mut client = ctx.read_client().await?;
    let info = client.cluster_info().await?;

    println!("{}", "Cluster".bold());
    println!(
        "  leader:     {}",
        info.leader_address.as_deref().unwrap_or("(none)")
    );
    println!("  view:       {}", info.view);
    println!("  managers:   {}", info.members.len());
    println!("  nodes:      {}", info.node_count);
    println!("  services:   {}", info.service_count);
    println!("  containers: {}", info.container_count);

    if !info.members.is_empty() {
        let mut table = output::table(&["ID", "PEER ADDRESS", "RPC ADDRESS"]);
        for member in &info.members {
            table.add_row(vec![
                member.id.to_string(),
                member.address.clone(),
                member.rpc_address.clone(),
            ]);
        }
        println!("{table}");
    }
    Ok(())
}

/// Advertised capacity. Detection is deliberately coarse; operators can
/// override labels and constraints for anything finer.
fn detect_resources() -> Resources {
    let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZero::get) as u64;
    Resources::new(cpus * 1_000, 8 << 30, 100 << 30)
}
