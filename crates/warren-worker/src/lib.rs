//! # warren-worker: the worker-side executor
//!
//! A worker polls its assignment view from a manager, drives the
//! container runtime to realize it, probes container health, and reports
//! everything it observes back through the log. It never makes desired-
//! state decisions, not even when it cannot reach a manager and is
//! running autonomously on its cached assignments.
//!
//! ```ignore
//! let runtime = Arc::new(DockerRuntime::connect("warren")?);
//! let handle = warren_worker::run_worker(config, cluster_key, runtime);
//! ```

mod executor;
pub mod prober;
pub mod runtime;
pub mod secrets;

pub use executor::{WorkerConfig, WorkerHandle, run_worker};
pub use runtime::{
    ContainerRuntime, ContainerSpec, DockerRuntime, FakeRuntime, FakeScript, Inspection,
    RuntimeError, RuntimeResult, RuntimeState,
};
pub use secrets::{SecretError, SecretStore};
