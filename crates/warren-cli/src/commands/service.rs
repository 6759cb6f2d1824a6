//! `warren service {create|list|inspect|delete|scale|update}`.

use std::collections::BTreeMap;

use anyhow::bail;
use clap::Subcommand;

use warren_client::ContainerFilter;
use warren_types::{
    HealthCheckSpec, MountSpec, PortSpec, Probe, RestartKind, RestartPolicy, SecretRef,
    ServiceMode, ServiceSpec,
};

use crate::commands::{Context, UsageError};
use crate::output;

#[derive(Subcommand)]
pub enum ServiceCommands {
    /// Create a service.
    Create {
        #[arg(long)]
        name: String,

        #[arg(long)]
        image: String,

        /// Replica count (ignored with --global).
        #[arg(long, default_value_t = 1)]
        replicas: u64,

        /// One container per eligible node instead of a replica count.
        #[arg(long)]
        global: bool,

        /// Environment variables, KEY=VALUE.
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Volume mounts, VOLUME:/path[:ro].
        #[arg(long = "mount", value_name = "VOLUME:PATH")]
        mounts: Vec<String>,

        /// Secrets to mount under /run/secrets/<name>.
        #[arg(long = "secret", value_name = "NAME")]
        secrets: Vec<String>,

        /// Published ports, PUBLISHED:TARGET.
        #[arg(long = "publish", value_name = "PUB:TARGET")]
        publish: Vec<String>,

        /// Placement constraints, LABEL=VALUE.
        #[arg(long = "constraint", value_name = "LABEL=VALUE")]
        constraints: Vec<String>,

        /// TCP health check port.
        #[arg(long)]
        health_tcp: Option<u16>,

        /// HTTP health check, PORT/PATH (e.g. 8080/healthz).
        #[arg(long)]
        health_http: Option<String>,

        /// Restart policy: never, on-failure, always.
        #[arg(long, default_value = "on-failure")]
        restart: String,

        /// On failure, place the replacement on a different node.
        #[arg(long)]
        reschedule: bool,
    },

    /// List services.
    #[command(alias = "ls")]
    List,

    /// Show one service and its containers.
    Inspect { name: String },

    /// Delete a service (containers drain asynchronously).
    #[command(alias = "rm")]
    Delete { name: String },

    /// Change a replicated service's replica count.
    Scale { name: String, replicas: u64 },

    /// Update a service's image.
    Update {
        name: String,

        #[arg(long)]
        image: String,
    },
}

pub async fn run(ctx: Context, command: ServiceCommands) -> anyhow::Result<()> {
    match command {
        ServiceCommands::Create {
            name,
            image,
            replicas,
            global,
            env,
            mounts,
            secrets,
            publish,
            constraints,
            health_tcp,
            health_http,
            restart,
            reschedule,
        } => {
            let spec = build_spec(
                name, image, replicas, global, env, mounts, secrets, publish, constraints,
                health_tcp, health_http, &restart, reschedule,
            )?;
            let mut client = ctx.client().await?;
            let service = client.create_service(spec).await?;
            output::success(format!("service {} created ({})", service.spec.name, service.id));
        }
        ServiceCommands::List => {
            let mut client = ctx.read_client().await?;
            let services = client.list_services().await?;
            let mut table = output::table(&["NAME", "ID", "MODE", "IMAGE"]);
            for service in services {
                let mode = match service.spec.mode {
                    ServiceMode::Replicated { replicas } => format!("replicated ({replicas})"),
                    ServiceMode::Global => "global".to_string(),
                };
                table.add_row(vec![
                    service.spec.name,
                    service.id.to_string(),
                    mode,
                    service.spec.image,
                ]);
            }
            println!("{table}");
        }
        ServiceCommands::Inspect { name } => {
            let mut client = ctx.read_client().await?;
            let service = client.get_service_by_name(&name).await?;
            println!("{}", serde_json::to_string_pretty(&service)?);

            let containers = client
                .list_containers(ContainerFilter::ByService(service.id))
                .await?;
            let mut table = output::table(&["CONTAINER", "NODE", "STATE", "HEALTH", "CREATED"]);
            for container in containers {
                table.add_row(vec![
                    container.id.to_string(),
                    container
                        .node_id
                        .map_or("(unscheduled)".to_string(), |n| n.to_string()),
                    output::state(container.actual_state),
                    output::health(container.health_status),
                    output::ago(container.created_at),
                ]);
            }
            println!("{table}");
        }
        ServiceCommands::Delete { name } => {
            let mut client = ctx.client().await?;
            let service = client.get_service_by_name(&name).await?;
            client.delete_service(service.id).await?;
            output::success(format!("service {name} deleted"));
        }
        ServiceCommands::Scale { name, replicas } => {
            let mut client = ctx.client().await?;
            let service = client.get_service_by_name(&name).await?;
            let service = client.scale_service(service.id, replicas).await?;
            output::success(format!("service {name} scaled to {:?}", service.replicas()));
        }
        ServiceCommands::Update { name, image } => {
            let mut client = ctx.client().await?;
            let service = client.get_service_by_name(&name).await?;
            let mut spec = service.spec;
            spec.image = image;
            client.update_service(service.id, spec).await?;
            output::success(format!("service {name} updated"));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_spec(
    name: String,
    image: String,
    replicas: u64,
    global: bool,
    env: Vec<String>,
    mounts: Vec<String>,
    secrets: Vec<String>,
    publish: Vec<String>,
    constraints: Vec<String>,
    health_tcp: Option<u16>,
    health_http: Option<String>,
    restart: &str,
    reschedule: bool,
) -> anyhow::Result<ServiceSpec> {
    let mode = if global {
        ServiceMode::Global
    } else {
        ServiceMode::Replicated { replicas }
    };

    let health_check = match (health_tcp, health_http) {
        (Some(_), Some(_)) => {
            bail!(UsageError(
                "--health-tcp and --health-http are mutually exclusive".to_string()
            ))
        }
        (Some(port), None) => Some(HealthCheckSpec {
            probe: Probe::Tcp { port },
            ..HealthCheckSpec::default()
        }),
        (None, Some(spec)) => {
            let (port, path) = spec.split_once('/').ok_or_else(|| {
                UsageError(format!("--health-http wants PORT/PATH, got '{spec}'"))
            })?;
            Some(HealthCheckSpec {
                probe: Probe::Http {
                    port: port
                        .parse()
                        .map_err(|_| UsageError(format!("bad health port '{port}'")))?,
                    path: format!("/{path}"),
                },
                ..HealthCheckSpec::default()
            })
        }
        (None, None) => None,
    };

    let restart_policy = RestartPolicy {
        kind: match restart {
            "never" => RestartKind::Never,
            "on-failure" => RestartKind::OnFailure,
            "always" => RestartKind::Always,
            other => bail!(UsageError(format!("unknown restart policy '{other}'"))),
        },
        reschedule,
        ..RestartPolicy::default()
    };

    Ok(ServiceSpec {
        name,
        image,
        mode,
        env: parse_pairs(&env, "--env")?,
        secrets: secrets.into_iter().map(|name| SecretRef { name }).collect(),
        mounts: mounts
            .iter()
            .map(|raw| parse_mount(raw))
            .collect::<Result<_, _>>()?,
        ports: publish
            .iter()
            .map(|raw| parse_publish(raw))
            .collect::<Result<_, _>>()?,
        health_check,
        restart_policy,
        strategy: warren_types::DeployStrategy::default(),
        resources: warren_types::Resources::default(),
        constraints: parse_pairs(&constraints, "--constraint")?,
        stop_timeout_ms: 10_000,
    })
}

fn parse_pairs(raw: &[String], flag: &str) -> Result<BTreeMap<String, String>, UsageError> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| UsageError(format!("{flag} wants KEY=VALUE, got '{pair}'")))
        })
        .collect()
}

fn parse_mount(raw: &str) -> Result<MountSpec, UsageError> {
    let mut parts = raw.splitn(3, ':');
    let volume = parts.next().unwrap_or_default();
    let path = parts
        .next()
        .ok_or_else(|| UsageError(format!("--mount wants VOLUME:PATH, got '{raw}'")))?;
    let read_only = parts.next() == Some("ro");
    Ok(MountSpec {
        volume: volume.to_string(),
        path: path.to_string(),
        read_only,
    })
}

fn parse_publish(raw: &str) -> Result<PortSpec, UsageError> {
    let (published, target) = raw
        .split_once(':')
        .ok_or_else(|| UsageError(format!("--publish wants PUB:TARGET, got '{raw}'")))?;
    Ok(PortSpec {
        published: published
            .parse()
            .map_err(|_| UsageError(format!("bad published port '{published}'")))?,
        target: target
            .parse()
            .map_err(|_| UsageError(format!("bad target port '{target}'")))?,
        protocol: warren_types::PortProtocol::Tcp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_parsing() {
        let mount = parse_mount("db:/var/lib/pg").unwrap();
        assert_eq!(mount.volume, "db");
        assert_eq!(mount.path, "/var/lib/pg");
        assert!(!mount.read_only);

        let ro = parse_mount("cfg:/etc/app:ro").unwrap();
        assert!(ro.read_only);

        assert!(parse_mount("nopath").is_err());
    }

    #[test]
    fn publish_parsing() {
        let port = parse_publish("80:8080").unwrap();
        assert_eq!(port.published, 80);
        assert_eq!(port.target, 8080);
        assert!(parse_publish("80").is_err());
        assert!(parse_publish("x:y").is_err());
    }

    #[test]
    fn env_pairs_parsing() {
        let pairs = parse_pairs(
            &["A=1".to_string(), "B=two=three".to_string()],
            "--env",
        )
        .unwrap();
        assert_eq!(pairs["A"], "1");
        assert_eq!(pairs["B"], "two=three");
        assert!(parse_pairs(&["broken".to_string()], "--env").is_err());
    }
}
