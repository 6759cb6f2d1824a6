//! `warren volume {create|list|inspect|delete}`.

use std::collections::BTreeMap;

use clap::Subcommand;

use warren_types::NodeId;

use crate::commands::Context;
use crate::output;

#[derive(Subcommand)]
pub enum VolumeCommands {
    /// Create a volume.
    Create {
        name: String,

        #[arg(long, default_value = "local")]
        driver: String,

        /// Pin the volume (and everything mounting it) to a node.
        #[arg(long)]
        node: Option<String>,
    },

    /// List volumes.
    #[command(alias = "ls")]
    List,

    /// Show one volume.
    Inspect { name: String },

    /// Delete a volume. Fails while any service mounts it.
    #[command(alias = "rm")]
    Delete { name: String },
}

pub async fn run(ctx: Context, command: VolumeCommands) -> anyhow::Result<()> {
    match command {
        VolumeCommands::Create { name, driver, node } => {
            let mut client = ctx.client().await?;
            let volume = client
                .create_volume(
                    &name,
                    driver,
                    node.map(NodeId::new),
                    BTreeMap::new(),
                    BTreeMap::new(),
                )
                .await?;
            output::success(format!("volume {} created ({})", volume.name, volume.id));
        }
        VolumeCommands::List => {
            let mut client = ctx.read_client().await?;
            let volumes = client.list_volumes().await?;
            let mut table = output::table(&["NAME", "ID", "DRIVER", "NODE", "CREATED"]);
            for volume in volumes {
                table.add_row(vec![
                    volume.name,
                    volume.id.to_string(),
                    volume.driver,
                    volume
                        .node_affinity
                        .map_or("(any)".to_string(), |n| n.to_string()),
                    output::ago(volume.created_at),
                ]);
            }
            println!("{table}");
        }
        VolumeCommands::Inspect { name } => {
            let mut client = ctx.read_client().await?;
            let volume = find_by_name(&mut client, &name).await?;
            println!("{}", serde_json::to_string_pretty(&volume)?);
        }
        VolumeCommands::Delete { name } => {
            let mut client = ctx.client().await?;
            let volume = find_by_name(&mut client, &name).await?;
            client.delete_volume(volume.id).await?;
            output::success(format!("volume {name} deleted"));
        }
    }
    Ok(())
}

async fn find_by_name(
    client: &mut warren_client::Client,
    name: &str,
) -> anyhow::Result<warren_types::Volume> {
    client
        .list_volumes()
        .await?
        .into_iter()
        .find(|v| v.name == name)
        .ok_or_else(|| anyhow::anyhow!("volume '{name}' not found"))
}
