//! In-memory runtime for tests and development mode.
//!
//! Containers "run" as records; a [`FakeScript`] can make pulls fail,
//! starts fail, or running containers exit with a chosen code, which is
//! how executor tests exercise the failure paths without a daemon.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use warren_types::Timestamp;

use super::{ContainerRuntime, ContainerSpec, Inspection, RuntimeError, RuntimeResult, RuntimeState};

/// Scripted behavior for the fake runtime.
#[derive(Debug, Default)]
pub struct FakeScript {
    /// Images whose pull fails (retriably).
    pub failing_pulls: BTreeSet<String>,
    /// Container names whose start fails terminally.
    pub failing_starts: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    state: RuntimeState,
    exit_code: Option<i64>,
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct Inner {
    containers: BTreeMap<String, FakeContainer>,
    pulled: BTreeSet<String>,
    script: FakeScript,
    exec_results: BTreeMap<String, i64>,
}

/// An in-memory [`ContainerRuntime`].
#[derive(Debug, Default)]
pub struct FakeRuntime {
    inner: Mutex<Inner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: FakeScript) -> Self {
        Self {
            inner: Mutex::new(Inner {
                script,
                ..Inner::default()
            }),
        }
    }

    /// Makes a "running" container exit with `code`, as if the process
    /// died or finished.
    pub fn terminate(&self, name: &str, code: i64) {
        let mut inner = self.inner.lock().expect("fake runtime lock");
        if let Some(container) = inner.containers.get_mut(name) {
            container.state = RuntimeState::Exited;
            container.exit_code = Some(code);
            container.finished_at = Some(Timestamp::now());
        }
    }

    /// Sets the exit code future execs in `name` report.
    pub fn set_exec_result(&self, name: &str, code: i64) {
        let mut inner = self.inner.lock().expect("fake runtime lock");
        inner.exec_results.insert(name.to_string(), code);
    }

    /// Names of containers currently running.
    pub fn running(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("fake runtime lock");
        inner
            .containers
            .iter()
            .filter(|(_, c)| c.state == RuntimeState::Running)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Names of containers present at all.
    pub fn existing(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("fake runtime lock");
        inner.containers.keys().cloned().collect()
    }

    /// Images pulled so far.
    pub fn pulled_images(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("fake runtime lock");
        inner.pulled.iter().cloned().collect()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn pull_image<'a>(&'a self, image: &'a str) -> BoxFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("fake runtime lock");
            if inner.script.failing_pulls.contains(image) {
                return Err(RuntimeError::ImagePull(format!("no such image: {image}")));
            }
            inner.pulled.insert(image.to_string());
            Ok(())
        })
    }

    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> BoxFuture<'a, RuntimeResult<String>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("fake runtime lock");
            inner
                .containers
                .entry(spec.name.clone())
                .or_insert(FakeContainer {
                    spec: spec.clone(),
                    state: RuntimeState::Created,
                    exit_code: None,
                    started_at: None,
                    finished_at: None,
                });
            Ok(spec.name.clone())
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("fake runtime lock");
            if inner.script.failing_starts.contains(id) {
                return Err(RuntimeError::Create(format!("start of {id} scripted to fail")));
            }
            match inner.containers.get_mut(id) {
                Some(container) => {
                    if container.state != RuntimeState::Running {
                        container.state = RuntimeState::Running;
                        container.started_at = Some(Timestamp::now());
                        container.exit_code = None;
                    }
                    Ok(())
                }
                None => Err(RuntimeError::Other(format!("no such container: {id}"))),
            }
        })
    }

    fn stop<'a>(&'a self, id: &'a str, _grace: Duration) -> BoxFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("fake runtime lock");
            if let Some(container) = inner.containers.get_mut(id) {
                if container.state == RuntimeState::Running {
                    container.state = RuntimeState::Exited;
                    container.exit_code = Some(0);
                    container.finished_at = Some(Timestamp::now());
                }
            }
            // Stopping a missing container is a success.
            Ok(())
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().expect("fake runtime lock");
            inner.containers.remove(id);
            Ok(())
        })
    }

    fn inspect<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<Inspection>> {
        Box::pin(async move {
            let inner = self.inner.lock().expect("fake runtime lock");
            match inner.containers.get(id) {
                Some(container) => Ok(Inspection {
                    state: container.state,
                    exit_code: container.exit_code,
                    started_at: container.started_at,
                    finished_at: container.finished_at,
                    ip_address: Some("127.0.0.1".to_string()),
                }),
                None => Ok(Inspection {
                    state: RuntimeState::Missing,
                    exit_code: None,
                    started_at: None,
                    finished_at: None,
                    ip_address: None,
                }),
            }
        })
    }

    fn exec<'a>(&'a self, id: &'a str, _command: &'a [String]) -> BoxFuture<'a, RuntimeResult<i64>> {
        Box::pin(async move {
            let inner = self.inner.lock().expect("fake runtime lock");
            match inner.containers.get(id) {
                Some(container) if container.state == RuntimeState::Running => {
                    Ok(inner.exec_results.get(id).copied().unwrap_or(0))
                }
                Some(_) => Err(RuntimeError::Other(format!("{id} is not running"))),
                None => Err(RuntimeError::Other(format!("no such container: {id}"))),
            }
        })
    }

    fn stream_logs<'a>(&'a self, id: &'a str) -> BoxFuture<'a, RuntimeResult<Vec<String>>> {
        Box::pin(async move {
            let inner = self.inner.lock().expect("fake runtime lock");
            match inner.containers.get(id) {
                Some(container) => Ok(vec![format!(
                    "{} {:?}",
                    container.spec.image, container.state
                )]),
                None => Err(RuntimeError::Other(format!("no such container: {id}"))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "nginx:latest".to_string(),
            env: BTreeMap::new(),
            volume_binds: vec![],
            secrets_dir: None,
            ports: vec![],
            resources: warren_types::Resources::default(),
        }
    }

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let runtime = FakeRuntime::new();
        runtime.pull_image("nginx:latest").await.unwrap();
        let id = runtime.create(&spec("web.0000.ab")).await.unwrap();
        runtime.start(&id).await.unwrap();
        assert_eq!(runtime.running(), vec!["web.0000.ab".to_string()]);

        // Idempotent start.
        runtime.start(&id).await.unwrap();

        runtime.stop(&id, Duration::from_secs(5)).await.unwrap();
        let inspection = runtime.inspect(&id).await.unwrap();
        assert_eq!(inspection.state, RuntimeState::Exited);
        assert_eq!(inspection.exit_code, Some(0));

        runtime.delete(&id).await.unwrap();
        assert_eq!(
            runtime.inspect(&id).await.unwrap().state,
            RuntimeState::Missing
        );
        // Idempotent delete and stop on a missing container.
        runtime.delete(&id).await.unwrap();
        runtime.stop(&id, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn scripted_failures() {
        let mut script = FakeScript::default();
        script.failing_pulls.insert("ghost:latest".to_string());
        let runtime = FakeRuntime::with_script(script);

        let err = runtime.pull_image("ghost:latest").await.unwrap_err();
        assert!(err.is_retriable());
    }
}
