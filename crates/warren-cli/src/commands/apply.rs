//! `warren apply -f manifest.toml`: declarative upsert.

use std::path::Path;

use anyhow::Context as _;
use warren_types::manifest::Manifest;

use crate::commands::{Context, UsageError};
use crate::output;

pub async fn run(ctx: Context, file: std::path::PathBuf) -> anyhow::Result<()> {
    let manifest = parse(&file)?;
    if manifest.is_empty() {
        return Err(UsageError(format!("{} declares nothing", file.display())).into());
    }

    let mut client = ctx.client().await?;

    // Secrets and volumes first: services may reference them.
    for secret in &manifest.secrets {
        let exists = client
            .list_secrets()
            .await?
            .iter()
            .any(|s| s.name == secret.name);
        if exists {
            // Secret values are immutable; re-applying the same name is a
            // no-op rather than a rotation.
            println!("secret {} unchanged", secret.name);
        } else {
            client
                .create_secret(&secret.name, secret.value.clone().into_bytes())
                .await?;
            output::success(format!("secret {} created", secret.name));
        }
    }

    for volume in &manifest.volumes {
        let exists = client
            .list_volumes()
            .await?
            .iter()
            .any(|v| v.name == volume.name);
        if exists {
            println!("volume {} unchanged", volume.name);
        } else {
            client
                .create_volume(
                    &volume.name,
                    volume.driver.clone(),
                    None,
                    volume.options.clone(),
                    volume.labels.clone(),
                )
                .await?;
            output::success(format!("volume {} created", volume.name));
        }
    }

    for spec in manifest.services {
        match client.get_service_by_name(&spec.name).await {
            Ok(existing) => {
                let name = spec.name.clone();
                client.update_service(existing.id, spec).await?;
                output::success(format!("service {name} updated"));
            }
            Err(error) if error.kind() == Some(warren_client::ErrorKind::NotFound) => {
                let name = spec.name.clone();
                client.create_service(spec).await?;
                output::success(format!("service {name} created"));
            }
            Err(error) => return Err(error.into()),
        }
    }

    Ok(())
}

/// Parses a manifest by extension; unknown fields are rejected.
fn parse(path: &Path) -> anyhow::Result<Manifest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
        }
        Some("toml") => {
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
        }
        other => Err(UsageError(format!(
            "unsupported manifest extension {other:?} (want .toml or .json)"
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn toml_manifest_parses() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[[services]]
name = "web"
image = "nginx:latest"

[[secrets]]
name = "token"
value = "abc"
"#
        )
        .unwrap();

        let manifest = parse(file.path()).unwrap();
        assert_eq!(manifest.services.len(), 1);
        assert_eq!(manifest.secrets[0].value, "abc");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .unwrap();
        write!(file, r#"{{"services": [], "bogus": 1}}"#).unwrap();
        assert!(parse(file.path()).is_err());
    }

    #[test]
    fn unsupported_extension_is_usage_error() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        write!(file, "services: []").unwrap();
        let error = parse(file.path()).unwrap_err();
        assert!(error.downcast_ref::<UsageError>().is_some());
    }
}
