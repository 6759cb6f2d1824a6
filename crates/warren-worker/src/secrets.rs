//! Worker-side secret materialization.
//!
//! Sealed secrets are fetched from the manager, opened with the cluster
//! key, and written into a per-container directory on tmpfs that the
//! runtime bind-mounts read-only at `/run/secrets`. Plaintext never
//! touches durable storage; removing the container removes the
//! directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use warren_crypto::{ClusterKey, CryptoError};
use warren_types::ContainerId;

/// Errors from secret materialization.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("unseal failed for secret '{name}': {source}")]
    Unseal {
        name: String,
        source: CryptoError,
    },

    #[error("secret i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-container plaintext directories under a tmpfs base.
pub struct SecretStore {
    base: PathBuf,
    key: ClusterKey,
}

impl SecretStore {
    pub fn new(base: PathBuf, key: ClusterKey) -> Self {
        Self { base, key }
    }

    /// The best tmpfs-backed location available on this host.
    pub fn default_base() -> PathBuf {
        let shm = PathBuf::from("/dev/shm");
        if shm.is_dir() {
            shm.join("warren-secrets")
        } else {
            warn!("no /dev/shm on this host; secret plaintext falls back to the temp dir");
            std::env::temp_dir().join("warren-secrets")
        }
    }

    /// The directory holding one container's secrets.
    pub fn container_dir(&self, container_id: &ContainerId) -> PathBuf {
        self.base.join(container_id.as_str())
    }

    /// Opens sealed material and writes it under the container's
    /// directory with mode 0400. Returns the directory for the runtime
    /// bind.
    pub fn materialize(
        &self,
        container_id: &ContainerId,
        name: &str,
        ciphertext: &[u8],
        nonce: &[u8],
    ) -> Result<PathBuf, SecretError> {
        let plaintext = self
            .key
            .open(ciphertext, nonce)
            .map_err(|source| SecretError::Unseal {
                name: name.to_string(),
                source,
            })?;

        let dir = self.container_dir(container_id);
        fs::create_dir_all(&dir)?;
        set_mode(&dir, 0o700)?;

        let path = dir.join(name);
        // Rewrite on re-materialization: drop the old read-only file.
        let _ = fs::remove_file(&path);
        let mut file = fs::File::create(&path)?;
        file.write_all(&plaintext)?;
        file.sync_all()?;
        drop(file);
        set_mode(&path, 0o400)?;

        debug!(container = %container_id, secret = name, "secret materialized");
        Ok(dir)
    }

    /// Removes everything materialized for a container.
    pub fn remove_container(&self, container_id: &ContainerId) -> Result<(), SecretError> {
        let dir = self.container_dir(container_id);
        if dir.exists() {
            // Read-only files need their mode relaxed before unlink on
            // some filesystems.
            if let Ok(entries) = fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    let _ = set_mode(&entry.path(), 0o600);
                }
            }
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
