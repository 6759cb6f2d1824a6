//! The container runtime boundary.
//!
//! [`ContainerRuntime`] translates Warren's intents into runtime
//! operations. Every operation is idempotent by container id: starting a
//! running container succeeds, stopping or deleting a missing one
//! succeeds. Implementations namespace their containers so Warren can
//! share a daemon with other tenants.

mod docker;
mod fake;

pub use docker::DockerRuntime;
pub use fake::{FakeRuntime, FakeScript};

use std::collections::BTreeMap;

use futures_util::future::BoxFuture;
use thiserror::Error;
use warren_types::{PortSpec, Resources, Timestamp};

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Pull failed; retriable.
    #[error("image pull failed: {0}")]
    ImagePull(String),

    /// Create failed; terminal when the spec itself is invalid.
    #[error("container create failed: {0}")]
    Create(String),

    /// The runtime daemon is unreachable; retriable.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// Anything else.
    #[error("runtime error: {0}")]
    Other(String),
}

impl RuntimeError {
    /// True for errors worth retrying with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, RuntimeError::ImagePull(_) | RuntimeError::Unavailable(_))
    }
}

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Warren's container id; doubles as the runtime-side name.
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Volume-name to container-path binds.
    pub volume_binds: Vec<(String, String, bool)>,
    /// Host directory mounted read-only at the in-container secrets path.
    pub secrets_dir: Option<std::path::PathBuf>,
    pub ports: Vec<PortSpec>,
    pub resources: Resources,
}

/// Observed container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Running,
    Exited,
    /// The runtime has no such container.
    Missing,
}

/// Result of an inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub state: RuntimeState,
    pub exit_code: Option<i64>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    /// Address probes can reach the container on.
    pub ip_address: Option<String>,
}

/// The runtime adapter: pull, create, start, stop, delete, inspect,
/// exec, logs.
///
/// Futures are boxed so the executor can hold the runtime behind `dyn`.
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Pulls `image`; succeeds if it is already present.
    fn pull_image<'a>(&'a self, image: &'a str) -> BoxFuture<'a, RuntimeResult<()>>;

    /// Creates the container, returning the runtime-side id. Re-creating
    /// an existing container returns the existing id.
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> BoxFuture<'a, RuntimeResult<String>>;

    /// Starts the container; a no-op when already running.
    fn start<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<()>>;

    /// Stops the container: SIGTERM, wait `grace`, then SIGKILL. A no-op
    /// when already stopped or missing.
    fn stop<'a>(
        &'a self,
        id: &'a str,
        grace: std::time::Duration,
    ) -> BoxFuture<'a, RuntimeResult<()>>;

    /// Removes the container; a no-op when missing.
    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<()>>;

    /// Observes the container's state.
    fn inspect<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<Inspection>>;

    /// Runs a command inside the container, returning its exit code.
    fn exec<'a>(&'a self, id: &'a str, command: &'a [String]) -> BoxFuture<'a, RuntimeResult<i64>>;

    /// Tails the container's log output.
    fn stream_logs<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<Vec<String>>>;
}
