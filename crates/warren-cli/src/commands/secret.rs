//! `warren secret {create|list|inspect|delete}`.

use anyhow::Context as _;
use clap::Subcommand;

use crate::commands::{Context, UsageError};
use crate::output;

#[derive(Subcommand)]
pub enum SecretCommands {
    /// Create a secret from a literal value or a file.
    Create {
        name: String,

        /// Literal value.
        value: Option<String>,

        /// Read the value from a file instead.
        #[arg(long, conflicts_with = "value")]
        from_file: Option<std::path::PathBuf>,
    },

    /// List secrets (metadata only).
    #[command(alias = "ls")]
    List,

    /// Show one secret's metadata. Values are never shown.
    Inspect { name: String },

    /// Delete a secret. Fails while any service references it.
    #[command(alias = "rm")]
    Delete { name: String },
}

pub async fn run(ctx: Context, command: SecretCommands) -> anyhow::Result<()> {
    match command {
        SecretCommands::Create {
            name,
            value,
            from_file,
        } => {
            let bytes = match (value, from_file) {
                (Some(value), None) => value.into_bytes(),
                (None, Some(path)) => std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => {
                    return Err(
                        UsageError("a value or --from-file is required".to_string()).into()
                    );
                }
                (Some(_), Some(_)) => unreachable!("clap conflicts_with"),
            };
            let mut client = ctx.client().await?;
            let info = client.create_secret(&name, bytes).await?;
            output::success(format!("secret {} created ({})", info.name, info.id));
        }
        SecretCommands::List => {
            let mut client = ctx.read_client().await?;
            let secrets = client.list_secrets().await?;
            let mut table = output::table(&["NAME", "ID", "CREATED"]);
            for secret in secrets {
                table.add_row(vec![
                    secret.name,
                    secret.id.to_string(),
                    output::ago(secret.created_at),
                ]);
            }
            println!("{table}");
        }
        SecretCommands::Inspect { name } => {
            let mut client = ctx.read_client().await?;
            let info = find_by_name(&mut client, &name).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        SecretCommands::Delete { name } => {
            let mut client = ctx.client().await?;
            let info = find_by_name(&mut client, &name).await?;
            client.delete_secret(info.id).await?;
            output::success(format!("secret {name} deleted"));
        }
    }
    Ok(())
}

async fn find_by_name(
    client: &mut warren_client::Client,
    name: &str,
) -> anyhow::Result<warren_client::SecretInfo> {
    client
        .list_secrets()
        .await?
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| anyhow::anyhow!("secret '{name}' not found"))
}
