//! # warren-config: layered configuration for Warren
//!
//! Configuration merges, lowest precedence first:
//! 1. built-in defaults
//! 2. user config (`~/.config/warren/config.toml`)
//! 3. project config (`warren.toml`)
//! 4. local overrides (`warren.local.toml`, gitignored)
//! 5. environment variables (`WARREN_*`)

mod error;
mod loader;
mod paths;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use paths::Paths;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WarrenConfig {
    pub node: NodeSection,
    pub manager: ManagerSection,
    pub worker: WorkerSection,
    pub runtime: RuntimeSection,
    pub tls: TlsSection,
}

/// Identity and storage for this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Data directory for the log store, snapshots, and identity.
    pub data_dir: PathBuf,
    /// Labels advertised to the scheduler.
    pub labels: BTreeMap<String, String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./warren-data"),
            labels: BTreeMap::new(),
        }
    }
}

/// Manager-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSection {
    /// RPC listen address.
    pub listen_addr: String,
    /// Replication listen address for the manager quorum.
    pub peer_addr: String,
    /// Scheduler pass cadence.
    pub scheduler_interval_ms: u64,
    /// Reconciler pass cadence.
    pub reconciler_interval_ms: u64,
    /// Heartbeat silence after which a node is marked down.
    pub node_down_after_ms: u64,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7421".to_string(),
            peer_addr: "0.0.0.0:7422".to_string(),
            scheduler_interval_ms: 5_000,
            reconciler_interval_ms: 10_000,
            node_down_after_ms: 30_000,
        }
    }
}

/// Worker-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Manager RPC address this worker polls.
    pub manager_addr: String,
    /// Assignment poll cadence.
    pub poll_interval_ms: u64,
    /// Heartbeat cadence.
    pub heartbeat_interval_ms: u64,
    /// Manager silence after which the worker goes autonomous.
    pub autonomous_after_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            manager_addr: "127.0.0.1:7421".to_string(),
            poll_interval_ms: 5_000,
            heartbeat_interval_ms: 5_000,
            autonomous_after_ms: 30_000,
        }
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Label namespace isolating Warren's containers on a shared daemon.
    pub namespace: String,
    /// Docker socket override; the platform default when absent.
    pub docker_socket: Option<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            namespace: "warren".to_string(),
            docker_socket: None,
        }
    }
}

/// mTLS material. All three paths set enables TLS; none disables it
/// (development mode). Anything in between is a configuration error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsSection {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl TlsSection {
    pub fn is_enabled(&self) -> bool {
        self.ca_file.is_some() && self.cert_file.is_some() && self.key_file.is_some()
    }

    pub fn is_partial(&self) -> bool {
        !self.is_enabled()
            && (self.ca_file.is_some() || self.cert_file.is_some() || self.key_file.is_some())
    }
}

impl WarrenConfig {
    /// Resolves relative paths against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.node.data_dir.is_relative() {
            self.node.data_dir = base.join(&self.node.data_dir);
        }
        for path in [
            &mut self.tls.ca_file,
            &mut self.tls.cert_file,
            &mut self.tls.key_file,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = WarrenConfig::default();
        assert_eq!(config.manager.scheduler_interval_ms, 5_000);
        assert_eq!(config.manager.reconciler_interval_ms, 10_000);
        assert_eq!(config.manager.node_down_after_ms, 30_000);
        assert_eq!(config.worker.poll_interval_ms, 5_000);
        assert!(!config.tls.is_enabled());
        assert!(!config.tls.is_partial());
    }

    #[test]
    fn partial_tls_is_detected() {
        let tls = TlsSection {
            ca_file: Some(PathBuf::from("ca.pem")),
            cert_file: None,
            key_file: None,
        };
        assert!(tls.is_partial());
        assert!(!tls.is_enabled());
    }

    #[test]
    fn resolve_paths_leaves_absolute_alone() {
        let mut config = WarrenConfig::default();
        config.node.data_dir = PathBuf::from("/var/lib/warren");
        config.resolve_paths(Path::new("/etc/warren"));
        assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/warren"));
    }

    #[test]
    fn resolve_paths_anchors_relative() {
        let mut config = WarrenConfig::default();
        config.tls.ca_file = Some(PathBuf::from("certs/ca.pem"));
        config.resolve_paths(Path::new("/srv/app"));
        assert_eq!(
            config.tls.ca_file,
            Some(PathBuf::from("/srv/app/certs/ca.pem"))
        );
    }
}
