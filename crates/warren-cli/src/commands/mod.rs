//! Command implementations and the shared invocation context.

pub mod apply;
pub mod cluster;
pub mod node;
pub mod secret;
pub mod service;
pub mod volume;

pub use cluster::ClusterCommands;
pub use node::NodeCommands;
pub use secret::SecretCommands;
pub use service::ServiceCommands;
pub use volume::VolumeCommands;

use anyhow::Context as _;
use warren_client::{Client, ClientConfig, ClientTls, ErrorKind};
use warren_config::{ConfigLoader, WarrenConfig};

/// A user-input problem detected after argument parsing.
#[derive(Debug)]
pub struct UsageError(pub String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UsageError {}

/// Shared state for one CLI invocation.
pub struct Context {
    pub manager_addr: String,
    pub config: WarrenConfig,
    client_config: ClientConfig,
}

impl Context {
    pub fn new(
        manager_addr: String,
        project_dir: Option<std::path::PathBuf>,
    ) -> anyhow::Result<Self> {
        let mut loader = ConfigLoader::new();
        if let Some(dir) = project_dir {
            loader = loader.with_project_dir(dir);
        }
        let config = loader.load_or_default();

        let mut client_config = ClientConfig::default();
        if config.tls.is_enabled() {
            let (Some(ca), Some(cert), Some(key)) = (
                config.tls.ca_file.as_ref(),
                config.tls.cert_file.as_ref(),
                config.tls.key_file.as_ref(),
            ) else {
                unreachable!("partial tls rejected at load");
            };
            client_config.tls = Some(
                ClientTls::from_pem_files(ca, cert, key)
                    .context("loading client TLS material")?,
            );
        }

        Ok(Self {
            manager_addr,
            config,
            client_config,
        })
    }

    /// Connects for a write (always the network endpoint).
    pub async fn client(&self) -> anyhow::Result<Client> {
        Ok(Client::connect(self.manager_addr.clone(), self.client_config.clone()).await?)
    }

    /// Connects for a read: prefer the local IPC socket when this host
    /// runs a manager, certificates not required there.
    pub async fn read_client(&self) -> anyhow::Result<Client> {
        #[cfg(unix)]
        {
            let socket = warren_manager::ipc_socket_path(&self.config.node.data_dir);
            if socket.exists() {
                if let Ok(client) = Client::connect_ipc(&socket, ClientConfig::default()).await {
                    return Ok(client);
                }
            }
        }
        self.client().await
    }
}

/// Maps an error chain to the documented exit codes.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<UsageError>().is_some() {
        return 1;
    }
    if let Some(client_error) = error.downcast_ref::<warren_client::ClientError>() {
        return match client_error {
            warren_client::ClientError::Remote(body) => match body.kind {
                // A structured NotLeader with no hint means no leader is
                // available right now.
                ErrorKind::NotLeader => 4,
                ErrorKind::PermissionDenied => 2,
                _ => 3,
            },
            warren_client::ClientError::Connect { .. }
            | warren_client::ClientError::Tls(_)
            | warren_client::ClientError::Wire(_)
            | warren_client::ClientError::DeadlineExceeded => 2,
            warren_client::ClientError::UnexpectedResponse => 3,
        };
    }
    1
}
