//! The worker executor: converges local containers toward the manager's
//! assignment view for this node.
//!
//! One polling loop per node, one short-lived lifecycle handler per
//! container (serialized by a per-container mutex), one long-lived
//! prober per container with a health check. The worker never decides
//! desired state: it realizes assignments and reports what it observes.
//!
//! When no manager is reachable past the autonomous threshold, the
//! worker keeps its containers running, honors restart policies from
//! the cached assignments, and flushes the latest state for every
//! container on reconnect.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use warren_client::{Client, ClientConfig, StateReport};
use warren_crypto::ClusterKey;
use warren_types::{
    ActualState, Container, ContainerId, DesiredState, HealthStatus, NodeId, NodeStatus,
    Resources, RestartKind, Timestamp,
};

use crate::prober::{self, HealthEvent};
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeState};
use crate::secrets::SecretStore;

/// Ceiling on transport retry backoff.
const REPORT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Ceiling on autonomous restart backoff.
const RESTART_BACKOFF_CAP_MS: u64 = 30_000;

/// Attempts at a retriable runtime operation before giving up on a
/// container.
const PULL_ATTEMPTS: u32 = 5;

/// Worker configuration.
#[derive(Clone)]
pub struct WorkerConfig {
    pub node_id: NodeId,
    pub manager_addr: String,
    /// tmpfs base for secret plaintext.
    pub secrets_base: std::path::PathBuf,
    /// Advertised capacity.
    pub resources: Resources,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub autonomous_after: Duration,
    pub client_config: ClientConfig,
}

/// Worker-local view of one assigned container.
#[derive(Debug, Clone)]
struct Cached {
    /// Latest assignment record from the manager.
    record: Container,
    runtime_id: Option<String>,
    actual: ActualState,
    health: HealthStatus,
    exit_code: Option<i64>,
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
    restart_attempts: u32,
    prober: Option<tokio::task::AbortHandle>,
}

impl Cached {
    fn new(record: Container) -> Self {
        Self {
            record,
            runtime_id: None,
            actual: ActualState::Pending,
            health: HealthStatus::Unknown,
            exit_code: None,
            started_at: None,
            finished_at: None,
            restart_attempts: 0,
            prober: None,
        }
    }

    fn report(&self) -> StateReport {
        StateReport {
            container_id: self.record.id.clone(),
            actual_state: self.actual,
            health_status: self.health,
            exit_code: self.exit_code,
            started_at: self.started_at,
            finished_at: self.finished_at,
            observed_version: self.record.version,
        }
    }
}

/// Reconnecting RPC access to the manager.
struct Rpc {
    addr: String,
    config: ClientConfig,
    client: Mutex<Option<Client>>,
}

impl Rpc {
    fn new(addr: String, config: ClientConfig) -> Self {
        Self {
            addr,
            config,
            client: Mutex::new(None),
        }
    }

    async fn connected(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, Option<Client>>, warren_client::ClientError> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(Client::connect(self.addr.clone(), self.config.clone()).await?);
        }
        Ok(guard)
    }

    async fn assignments(
        &self,
        node_id: NodeId,
        since: u64,
    ) -> Result<(Vec<Container>, u64), warren_client::ClientError> {
        let mut guard = self.connected().await?;
        let client = guard.as_mut().expect("client just connected");
        match client.assignments(node_id, since).await {
            Ok(result) => Ok(result),
            Err(error) => {
                *guard = None;
                Err(error)
            }
        }
    }

    async fn heartbeat(
        &self,
        node_id: NodeId,
        resources: Resources,
    ) -> Result<(), warren_client::ClientError> {
        let mut guard = self.connected().await?;
        let client = guard.as_mut().expect("client just connected");
        match client
            .heartbeat(node_id, resources, NodeStatus::Ready)
            .await
        {
            Ok(()) => Ok(()),
            Err(error) => {
                *guard = None;
                Err(error)
            }
        }
    }

    async fn report(&self, report: StateReport) -> Result<(), warren_client::ClientError> {
        let mut guard = self.connected().await?;
        let client = guard.as_mut().expect("client just connected");
        match client.report_container_state(report).await {
            Ok(()) => Ok(()),
            Err(error) => {
                *guard = None;
                Err(error)
            }
        }
    }

    async fn secret_material(
        &self,
        container_id: ContainerId,
        name: String,
    ) -> Result<(Vec<u8>, Vec<u8>), warren_client::ClientError> {
        let mut guard = self.connected().await?;
        let client = guard.as_mut().expect("client just connected");
        match client.secret_for_container(container_id, name).await {
            Ok(material) => Ok(material),
            Err(error) => {
                *guard = None;
                Err(error)
            }
        }
    }
}

/// Shared executor state.
struct Shared {
    config: WorkerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    secrets: SecretStore,
    rpc: Rpc,
    cache: Mutex<BTreeMap<ContainerId, Cached>>,
    /// Per-container lifecycle serialization.
    locks: Mutex<BTreeMap<ContainerId, Arc<Mutex<()>>>>,
    /// Latest unreported state per container; coalesces across retries.
    reports: Mutex<BTreeMap<ContainerId, StateReport>>,
    report_notify: Notify,
    /// Last successful manager contact.
    last_contact: Mutex<Instant>,
    health_tx: mpsc::Sender<HealthEvent>,
}

impl Shared {
    async fn lock_for(&self, id: &ContainerId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    async fn enqueue_report(&self, report: StateReport) {
        self.reports
            .lock()
            .await
            .insert(report.container_id.clone(), report);
        self.report_notify.notify_one();
    }

    async fn is_autonomous(&self) -> bool {
        self.last_contact.lock().await.elapsed() > self.config.autonomous_after
    }

    async fn touch_contact(&self) {
        *self.last_contact.lock().await = Instant::now();
    }
}

/// A running worker.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Starts the worker loops against `runtime`.
pub fn run_worker(
    config: WorkerConfig,
    key: ClusterKey,
    runtime: Arc<dyn ContainerRuntime>,
) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (health_tx, health_rx) = mpsc::channel(64);

    let shared = Arc::new(Shared {
        secrets: SecretStore::new(config.secrets_base.clone(), key),
        rpc: Rpc::new(config.manager_addr.clone(), config.client_config.clone()),
        cache: Mutex::new(BTreeMap::new()),
        locks: Mutex::new(BTreeMap::new()),
        reports: Mutex::new(BTreeMap::new()),
        report_notify: Notify::new(),
        last_contact: Mutex::new(Instant::now()),
        health_tx,
        runtime,
        config,
    });

    tokio::spawn(poll_loop(Arc::clone(&shared), shutdown_rx.clone()));
    tokio::spawn(heartbeat_loop(Arc::clone(&shared), shutdown_rx.clone()));
    tokio::spawn(report_loop(Arc::clone(&shared), shutdown_rx.clone()));
    tokio::spawn(health_loop(shared, health_rx, shutdown_rx));

    WorkerHandle { shutdown_tx }
}

// ----------------------------------------------------------------------
// Loops
// ----------------------------------------------------------------------

async fn poll_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut since_version: u64 = 0;
    let mut ticker = tokio::time::interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut was_autonomous = false;
    let mut iteration: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        iteration += 1;

        // Every tenth poll is a full resync, which also reveals records
        // that were tombstoned while we only fetched deltas.
        let full_sync = iteration % 10 == 1;
        let since = if full_sync { 0 } else { since_version };

        match shared
            .rpc
            .assignments(shared.config.node_id.clone(), since)
            .await
        {
            Ok((changed, version)) => {
                shared.touch_contact().await;
                if was_autonomous {
                    info!("manager reachable again, re-sending container states");
                    was_autonomous = false;
                    resend_all_states(&shared).await;
                }
                since_version = version;
                if full_sync {
                    prune_unassigned(&shared, &changed).await;
                }
                merge_assignments(&shared, changed).await;
            }
            Err(error) => {
                debug!(%error, "assignment poll failed");
                if shared.is_autonomous().await && !was_autonomous {
                    was_autonomous = true;
                    warn!(
                        "no manager contact for {:?}; continuing autonomously",
                        shared.config.autonomous_after
                    );
                }
            }
        }

        // Observe exits for everything we believe is running.
        observe_running(&shared).await;
    }
}

/// Releases containers whose records no longer exist manager-side. Only
/// called with a full assignment listing, never while autonomous.
async fn prune_unassigned(shared: &Arc<Shared>, full: &[Container]) {
    let gone: Vec<ContainerId> = {
        let cache = shared.cache.lock().await;
        let keys: Vec<ContainerId> = cache.keys().cloned().collect();
        keys.into_iter()
            .filter(|id| !full.iter().any(|c| &c.id == id))
            .collect()
    };
    for id in gone {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let lock = shared.lock_for(&id).await;
            let _guard = lock.lock().await;
            debug!(container = %id, "record tombstoned, releasing local resources");

            let entry = {
                let mut cache = shared.cache.lock().await;
                cache.remove(&id)
            };
            let Some(entry) = entry else { return };
            if let Some(prober) = &entry.prober {
                prober.abort();
            }
            if let Some(runtime_id) = &entry.runtime_id {
                let grace = Duration::from_millis(entry.record.stop_timeout_ms);
                let _ = shared.runtime.stop(runtime_id, grace).await;
                let _ = shared.runtime.delete(runtime_id).await;
            }
            let _ = shared.secrets.remove_container(&id);
            shared.locks.lock().await.remove(&id);
        });
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        match shared
            .rpc
            .heartbeat(shared.config.node_id.clone(), shared.config.resources)
            .await
        {
            Ok(()) => shared.touch_contact().await,
            Err(error) => debug!(%error, "heartbeat failed"),
        }
    }
}

/// Drains pending state reports with exponential backoff on transport
/// failure. Reports coalesce per container, so after an outage only the
/// latest state of each container is sent.
async fn report_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Duration::from_secs(1);
    loop {
        tokio::select! {
            () = shared.report_notify.notified() => {}
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
            _ = shutdown.changed() => return,
        }

        loop {
            let next = {
                let reports = shared.reports.lock().await;
                reports.values().next().cloned()
            };
            let Some(report) = next else { break };

            match shared.rpc.report(report.clone()).await {
                Ok(()) => {
                    shared.touch_contact().await;
                    backoff = Duration::from_secs(1);
                    let mut reports = shared.reports.lock().await;
                    // Only clear if nothing newer was enqueued meanwhile.
                    if reports.get(&report.container_id) == Some(&report) {
                        reports.remove(&report.container_id);
                    }
                }
                Err(warren_client::ClientError::Remote(body)) => {
                    // The manager made a decision (gone record, stale
                    // version); retrying would not change it.
                    debug!(error = %body, "state report rejected, dropping");
                    shared.touch_contact().await;
                    let mut reports = shared.reports.lock().await;
                    if reports.get(&report.container_id) == Some(&report) {
                        reports.remove(&report.container_id);
                    }
                }
                Err(error) => {
                    debug!(%error, "state report failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(REPORT_BACKOFF_CAP);
                    break;
                }
            }
        }
    }
}

async fn health_loop(
    shared: Arc<Shared>,
    mut health_rx: mpsc::Receiver<HealthEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = health_rx.recv() => event,
            _ = shutdown.changed() => return,
        };
        let Some(event) = event else { return };

        let report = {
            let mut cache = shared.cache.lock().await;
            let Some(entry) = cache.get_mut(&event.container_id) else {
                continue;
            };
            entry.health = event.status;
            entry.report()
        };
        shared.enqueue_report(report).await;
    }
}

// ----------------------------------------------------------------------
// Convergence
// ----------------------------------------------------------------------

/// Folds an assignment batch into the cache and spawns lifecycle
/// handlers for anything whose desired state needs work.
async fn merge_assignments(shared: &Arc<Shared>, changed: Vec<Container>) {
    for record in changed {
        let id = record.id.clone();
        {
            let mut cache = shared.cache.lock().await;
            match cache.get_mut(&id) {
                Some(entry) => {
                    entry.record = record;
                }
                None => {
                    cache.insert(id.clone(), Cached::new(record));
                }
            }
        }
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            converge(&shared, &id).await;
        });
    }
}

/// Drives one container toward its desired state. Serialized per
/// container so a shutdown request cannot race a restart.
async fn converge(shared: &Arc<Shared>, id: &ContainerId) {
    let lock = shared.lock_for(id).await;
    let _guard = lock.lock().await;

    let Some(entry) = shared.cache.lock().await.get(id).cloned() else {
        return;
    };
    match entry.record.desired_state {
        DesiredState::Running => ensure_running(shared, id).await,
        DesiredState::Shutdown => ensure_stopped(shared, id).await,
    }
}

async fn ensure_running(shared: &Arc<Shared>, id: &ContainerId) {
    let entry = {
        let cache = shared.cache.lock().await;
        let Some(entry) = cache.get(id) else { return };
        entry.clone()
    };

    if let Some(runtime_id) = &entry.runtime_id {
        // Already realized once; make sure it is actually running.
        match shared.runtime.inspect(runtime_id).await {
            Ok(inspection) if inspection.state == RuntimeState::Running => {}
            Ok(inspection) if inspection.state == RuntimeState::Missing => {
                // The runtime lost it (pruned externally); rebuild.
                set_cache(shared, id, |c| {
                    c.runtime_id = None;
                    c.actual = ActualState::Pending;
                })
                .await;
                Box::pin(start_fresh(shared, id)).await;
            }
            Ok(_) => {
                // Created or exited; try to (re)start in place.
                if let Err(error) = shared.runtime.start(runtime_id).await {
                    warn!(container = %id, %error, "restart failed");
                    fail(shared, id, None).await;
                } else {
                    mark_running(shared, id).await;
                }
            }
            Err(_) => {}
        }
        return;
    }

    start_fresh(shared, id).await;
}

/// The pending → assigned → pulling → running path.
async fn start_fresh(shared: &Arc<Shared>, id: &ContainerId) {
    let record = {
        let cache = shared.cache.lock().await;
        let Some(entry) = cache.get(id) else { return };
        entry.record.clone()
    };

    // Acknowledge receipt of the assignment.
    transition(shared, id, ActualState::Assigned).await;

    // Pull, with retries for transient failures.
    transition(shared, id, ActualState::Pulling).await;
    let mut attempt = 0;
    loop {
        match shared.runtime.pull_image(&record.image).await {
            Ok(()) => break,
            Err(error) if error.is_retriable() && attempt < PULL_ATTEMPTS => {
                attempt += 1;
                let delay = Duration::from_secs(1 << attempt.min(6));
                debug!(container = %id, %error, ?delay, "image pull retry");
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                warn!(container = %id, %error, "image pull failed");
                fail(shared, id, None).await;
                return;
            }
        }
    }

    // Secrets go to tmpfs before the container exists.
    let secrets_dir = match materialize_secrets(shared, &record).await {
        Ok(dir) => dir,
        Err(error) => {
            warn!(container = %id, %error, "secret materialization failed");
            fail(shared, id, None).await;
            return;
        }
    };

    let spec = ContainerSpec {
        name: record.id.to_string(),
        image: record.image.clone(),
        env: record.env.clone(),
        volume_binds: record
            .mounts
            .iter()
            .map(|m| (m.volume.clone(), m.path.clone(), m.read_only))
            .collect(),
        secrets_dir,
        ports: record.ports.clone(),
        resources: record.resources,
    };

    let runtime_id = match shared.runtime.create(&spec).await {
        Ok(runtime_id) => runtime_id,
        Err(error) => {
            warn!(container = %id, %error, "container create failed");
            fail(shared, id, None).await;
            return;
        }
    };
    set_cache(shared, id, |c| c.runtime_id = Some(runtime_id.clone())).await;

    if let Err(error) = shared.runtime.start(&runtime_id).await {
        warn!(container = %id, %error, "container start failed");
        fail(shared, id, None).await;
        return;
    }
    mark_running(shared, id).await;

    // One long-lived prober per container with a health check.
    if let Some(check) = record.health_check.clone() {
        let handle = tokio::spawn(prober::probe_loop(
            record.id.clone(),
            runtime_id,
            check,
            Arc::clone(&shared.runtime),
            shared.health_tx.clone(),
        ));
        set_cache(shared, id, |c| c.prober = Some(handle.abort_handle())).await;
    }
}

async fn ensure_stopped(shared: &Arc<Shared>, id: &ContainerId) {
    let entry = {
        let cache = shared.cache.lock().await;
        let Some(entry) = cache.get(id) else { return };
        entry.clone()
    };

    if let Some(prober) = &entry.prober {
        prober.abort();
    }

    if let Some(runtime_id) = &entry.runtime_id {
        let grace = Duration::from_millis(entry.record.stop_timeout_ms);
        if let Err(error) = shared.runtime.stop(runtime_id, grace).await {
            debug!(container = %id, %error, "graceful stop failed, deleting anyway");
        }
        if let Err(error) = shared.runtime.delete(runtime_id).await {
            warn!(container = %id, %error, "container delete failed");
            return;
        }
    }
    if let Err(error) = shared.secrets.remove_container(id) {
        warn!(container = %id, %error, "secret cleanup failed");
    }

    let report = {
        let mut cache = shared.cache.lock().await;
        let Some(entry) = cache.get_mut(id) else { return };
        entry.actual = ActualState::Complete;
        entry.runtime_id = None;
        if entry.finished_at.is_none() {
            entry.finished_at = Some(Timestamp::now());
        }
        if entry.exit_code.is_none() {
            entry.exit_code = Some(0);
        }
        entry.report()
    };
    shared.enqueue_report(report).await;

    // Nothing left to manage locally.
    shared.cache.lock().await.remove(id);
    shared.locks.lock().await.remove(id);
    debug!(container = %id, "container shut down and released");
}

// ----------------------------------------------------------------------
// Exit observation and autonomous restarts
// ----------------------------------------------------------------------

/// Inspects every container we believe is running and reacts to exits.
async fn observe_running(shared: &Arc<Shared>) {
    let running: Vec<(ContainerId, String)> = {
        let cache = shared.cache.lock().await;
        cache
            .iter()
            .filter(|(_, c)| c.actual == ActualState::Running)
            .filter_map(|(id, c)| c.runtime_id.clone().map(|r| (id.clone(), r)))
            .collect()
    };

    for (id, runtime_id) in running {
        let Ok(inspection) = shared.runtime.inspect(&runtime_id).await else {
            continue;
        };
        if matches!(inspection.state, RuntimeState::Exited | RuntimeState::Missing) {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                let lock = shared.lock_for(&id).await;
                let _guard = lock.lock().await;
                handle_exit(&shared, &id, inspection.exit_code).await;
            });
        }
    }
}

async fn handle_exit(shared: &Arc<Shared>, id: &ContainerId, exit_code: Option<i64>) {
    let entry = {
        let cache = shared.cache.lock().await;
        let Some(entry) = cache.get(id) else { return };
        entry.clone()
    };
    if entry.actual != ActualState::Running {
        return;
    }

    let code = exit_code.unwrap_or(-1);
    let next = if code == 0 {
        ActualState::Complete
    } else {
        ActualState::Failed
    };
    let report = {
        let mut cache = shared.cache.lock().await;
        let Some(entry) = cache.get_mut(id) else { return };
        entry.actual = next;
        entry.exit_code = Some(code);
        entry.finished_at = Some(Timestamp::now());
        entry.report()
    };
    info!(container = %id, code, state = %next, "container exited");
    shared.enqueue_report(report).await;

    // With a reachable manager the scheduler owns the restart decision.
    // Cut off from it, we honor the cached restart policy ourselves.
    if !shared.is_autonomous().await {
        return;
    }
    let policy = entry.record.restart_policy;
    let wants_restart = matches!(
        (next, policy.kind),
        (ActualState::Failed, RestartKind::OnFailure | RestartKind::Always)
            | (ActualState::Complete, RestartKind::Always)
    );
    if !wants_restart {
        return;
    }

    let attempts = entry.restart_attempts;
    let delay = policy
        .delay_ms
        .saturating_mul(1 << attempts.min(5))
        .min(RESTART_BACKOFF_CAP_MS);
    debug!(container = %id, attempts, delay_ms = delay, "autonomous restart");
    tokio::time::sleep(Duration::from_millis(delay)).await;

    // Desired state may have changed while we slept.
    let still_wanted = {
        let cache = shared.cache.lock().await;
        cache
            .get(id)
            .is_some_and(|c| c.record.desired_state == DesiredState::Running)
    };
    if !still_wanted {
        return;
    }

    if let Some(runtime_id) = entry.runtime_id {
        if shared.runtime.start(&runtime_id).await.is_ok() {
            set_cache(shared, id, |c| {
                c.restart_attempts = attempts + 1;
            })
            .await;
            mark_running(shared, id).await;
        }
    }
}

// ----------------------------------------------------------------------
// Small helpers
// ----------------------------------------------------------------------

async fn set_cache(shared: &Arc<Shared>, id: &ContainerId, f: impl FnOnce(&mut Cached)) {
    let mut cache = shared.cache.lock().await;
    if let Some(entry) = cache.get_mut(id) {
        f(entry);
    }
}

async fn transition(shared: &Arc<Shared>, id: &ContainerId, state: ActualState) {
    let report = {
        let mut cache = shared.cache.lock().await;
        let Some(entry) = cache.get_mut(id) else { return };
        entry.actual = state;
        entry.report()
    };
    shared.enqueue_report(report).await;
}

async fn mark_running(shared: &Arc<Shared>, id: &ContainerId) {
    let report = {
        let mut cache = shared.cache.lock().await;
        let Some(entry) = cache.get_mut(id) else { return };
        entry.actual = ActualState::Running;
        entry.exit_code = None;
        entry.finished_at = None;
        if entry.started_at.is_none() {
            entry.started_at = Some(Timestamp::now());
        }
        entry.report()
    };
    shared.enqueue_report(report).await;
}

async fn fail(shared: &Arc<Shared>, id: &ContainerId, exit_code: Option<i64>) {
    let report = {
        let mut cache = shared.cache.lock().await;
        let Some(entry) = cache.get_mut(id) else { return };
        entry.actual = ActualState::Failed;
        entry.exit_code = exit_code.or(entry.exit_code);
        entry.finished_at = Some(Timestamp::now());
        entry.report()
    };
    shared.enqueue_report(report).await;
}

/// Fetches and materializes every secret the container references.
async fn materialize_secrets(
    shared: &Arc<Shared>,
    record: &Container,
) -> Result<Option<std::path::PathBuf>, Box<dyn std::error::Error + Send + Sync>> {
    if record.secrets.is_empty() {
        return Ok(None);
    }
    let mut dir = None;
    for secret_ref in &record.secrets {
        let (ciphertext, nonce) = shared
            .rpc
            .secret_material(record.id.clone(), secret_ref.name.clone())
            .await?;
        let path =
            shared
                .secrets
                .materialize(&record.id, &secret_ref.name, &ciphertext, &nonce)?;
        dir = Some(path);
    }
    Ok(dir)
}

/// Queues the latest known state of every cached container, for the
/// reconnect path.
async fn resend_all_states(shared: &Arc<Shared>) {
    let reports: Vec<StateReport> = {
        let cache = shared.cache.lock().await;
        cache.values().map(Cached::report).collect()
    };
    for report in reports {
        shared.enqueue_report(report).await;
    }
}
