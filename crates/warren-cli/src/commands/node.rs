//! `warren node {list|inspect|drain}`.

use clap::Subcommand;

use warren_client::ContainerFilter;
use warren_types::NodeId;

use crate::commands::Context;
use crate::output;

#[derive(Subcommand)]
pub enum NodeCommands {
    /// List nodes.
    #[command(alias = "ls")]
    List,

    /// Show one node and its containers.
    Inspect { id: String },

    /// Drain a node: no new work, existing work moves off.
    Drain { id: String },
}

pub async fn run(ctx: Context, command: NodeCommands) -> anyhow::Result<()> {
    match command {
        NodeCommands::List => {
            let mut client = ctx.read_client().await?;
            let nodes = client.list_nodes().await?;
            let mut table = output::table(&["ID", "ROLE", "STATUS", "ADDRESS", "HEARTBEAT"]);
            for node in nodes {
                table.add_row(vec![
                    node.id.to_string(),
                    node.role.to_string(),
                    output::node_status(node.status, node.drained),
                    node.address,
                    output::ago(node.last_heartbeat),
                ]);
            }
            println!("{table}");
        }
        NodeCommands::Inspect { id } => {
            let mut client = ctx.read_client().await?;
            let node = client.get_node(NodeId::new(id)).await?;
            println!("{}", serde_json::to_string_pretty(&node)?);

            let containers = client
                .list_containers(ContainerFilter::ByNode(node.id))
                .await?;
            let mut table = output::table(&["CONTAINER", "STATE", "HEALTH"]);
            for container in containers {
                table.add_row(vec![
                    container.id.to_string(),
                    output::state(container.actual_state),
                    output::health(container.health_status),
                ]);
            }
            println!("{table}");
        }
        NodeCommands::Drain { id } => {
            let mut client = ctx.client().await?;
            client.drain_node(NodeId::new(id.clone())).await?;
            output::success(format!("node {id} draining"));
        }
    }
    Ok(())
}
