//! End-to-end scenarios: a real manager, a real worker loop, and the
//! in-memory runtime standing in for Docker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use warren_client::{Client, ClientConfig, ContainerFilter};
use warren_crypto::ClusterKey;
use warren_manager::{ManagerHandle, init_cluster, run_manager};
use warren_types::{
    ActualState, DesiredState, NodeId, NodeRole, Resources, SecretRef, ServiceMode, ServiceSpec,
};
use warren_worker::{ContainerRuntime, FakeRuntime, WorkerConfig, WorkerHandle, run_worker};

struct Cluster {
    manager: ManagerHandle,
    worker: WorkerHandle,
    node_id: NodeId,
    runtime: Arc<FakeRuntime>,
    secrets_base: std::path::PathBuf,
}

async fn start_cluster(dir: &std::path::Path) -> (Cluster, Client) {
    let mut config = warren_config::WarrenConfig::default();
    config.node.data_dir = dir.join("manager");
    config.manager.listen_addr = "127.0.0.1:0".to_string();
    config.manager.peer_addr = "127.0.0.1:0".to_string();
    config.manager.scheduler_interval_ms = 100;
    config.manager.reconciler_interval_ms = 150;
    init_cluster(&config).unwrap();
    let manager = run_manager(config).await.unwrap();

    let mut client = Client::connect(manager.rpc_addr.to_string(), ClientConfig::default())
        .await
        .unwrap();
    let (token, _) = client.issue_join_token(NodeRole::Worker).await.unwrap();
    let (node_id, _peers, _ca, key_bytes) = client
        .join_cluster(
            token,
            NodeRole::Worker,
            "127.0.0.1:7431".to_string(),
            Resources::new(16_000, 32 << 30, 1 << 40),
            BTreeMap::new(),
        )
        .await
        .unwrap();

    let runtime = Arc::new(FakeRuntime::new());
    let secrets_base = dir.join("secrets");
    let worker = run_worker(
        WorkerConfig {
            node_id: node_id.clone(),
            manager_addr: manager.rpc_addr.to_string(),
            secrets_base: secrets_base.clone(),
            resources: Resources::new(16_000, 32 << 30, 1 << 40),
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(200),
            autonomous_after: Duration::from_secs(30),
            client_config: ClientConfig::default(),
        },
        ClusterKey::from_bytes(&key_bytes).unwrap(),
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
    );

    (
        Cluster {
            manager,
            worker,
            node_id,
            runtime,
            secrets_base,
        },
        client,
    )
}

fn spec(name: &str, replicas: u64) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        image: "nginx:latest".to_string(),
        mode: ServiceMode::Replicated { replicas },
        env: BTreeMap::new(),
        secrets: vec![],
        mounts: vec![],
        ports: vec![],
        health_check: None,
        restart_policy: warren_types::RestartPolicy::default(),
        strategy: warren_types::DeployStrategy::default(),
        resources: Resources::new(100, 64 << 20, 0),
        constraints: BTreeMap::new(),
        stop_timeout_ms: 1_000,
    }
}

async fn wait_for<F>(mut predicate: F, what: &str)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if predicate().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Single-node service: three replicas all reach running on the worker.
#[tokio::test(flavor = "multi_thread")]
async fn replicated_service_reaches_running() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, mut client) = start_cluster(dir.path()).await;

    let service = client.create_service(spec("web", 3)).await.unwrap();

    let filter = ContainerFilter::ByService(service.id.clone());
    wait_for(
        async || {
            let containers = client.list_containers(filter.clone()).await.unwrap();
            containers.len() == 3
                && containers
                    .iter()
                    .all(|c| c.actual_state == ActualState::Running)
        },
        "3 running containers",
    )
    .await;

    assert_eq!(cluster.runtime.running().len(), 3);
    assert_eq!(cluster.runtime.pulled_images(), vec!["nginx:latest"]);
    let listed = client.list_services().await.unwrap();
    assert_eq!(listed[0].replicas(), Some(3));

    // Every container is owned by the one worker node.
    let containers = client.list_containers(filter).await.unwrap();
    assert!(containers
        .iter()
        .all(|c| c.node_id.as_ref() == Some(&cluster.node_id)));

    cluster.worker.shutdown();
    cluster.manager.shutdown();
}

/// Scale down: the excess containers stop and disappear; the survivor is
/// the lexicographically earliest id.
#[tokio::test(flavor = "multi_thread")]
async fn scale_down_keeps_earliest_container() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, mut client) = start_cluster(dir.path()).await;

    let service = client.create_service(spec("web", 3)).await.unwrap();
    let filter = ContainerFilter::ByService(service.id.clone());
    wait_for(
        async || cluster.runtime.running().len() == 3,
        "3 running containers",
    )
    .await;

    let mut all_ids: Vec<String> = cluster.runtime.running();
    all_ids.sort();
    let earliest = all_ids[0].clone();

    client.scale_service(service.id.clone(), 1).await.unwrap();

    // The two drained containers stop, get tombstoned, and vanish.
    wait_for(
        async || {
            cluster.runtime.running().len() == 1
                && client.list_containers(filter.clone()).await.unwrap().len() == 1
        },
        "scale down to 1",
    )
    .await;

    assert_eq!(cluster.runtime.running(), vec![earliest]);

    cluster.worker.shutdown();
    cluster.manager.shutdown();
}

/// Secret materialization: plaintext lands in the per-container secrets
/// directory with owner-only read, and is removed with the container.
#[tokio::test(flavor = "multi_thread")]
async fn secret_reaches_container_and_is_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, mut client) = start_cluster(dir.path()).await;

    client
        .create_secret("token", b"abc".to_vec())
        .await
        .unwrap();

    let mut app = spec("app", 1);
    app.secrets.push(SecretRef {
        name: "token".to_string(),
    });
    let service = client.create_service(app).await.unwrap();

    let filter = ContainerFilter::ByService(service.id.clone());
    wait_for(
        async || {
            client
                .list_containers(filter.clone())
                .await
                .unwrap()
                .iter()
                .any(|c| c.actual_state == ActualState::Running)
        },
        "secret-bearing container running",
    )
    .await;

    let containers = client.list_containers(filter.clone()).await.unwrap();
    let container_id = containers[0].id.clone();
    let secret_path = cluster
        .secrets_base
        .join(container_id.as_str())
        .join("token");
    assert_eq!(std::fs::read(&secret_path).unwrap(), b"abc");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&secret_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o400);
    }

    // Deleting the service removes the container and its plaintext.
    client.delete_service(service.id).await.unwrap();
    wait_for(
        async || cluster.runtime.existing().is_empty() && !secret_path.exists(),
        "container and secret cleanup",
    )
    .await;

    cluster.worker.shutdown();
    cluster.manager.shutdown();
}

/// A crashed container is reported failed and the scheduler replaces it.
#[tokio::test(flavor = "multi_thread")]
async fn crashed_container_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, mut client) = start_cluster(dir.path()).await;

    let service = client.create_service(spec("web", 1)).await.unwrap();
    let filter = ContainerFilter::ByService(service.id.clone());
    wait_for(
        async || cluster.runtime.running().len() == 1,
        "container running",
    )
    .await;
    let first = cluster.runtime.running()[0].clone();

    // The process dies with a non-zero code.
    cluster.runtime.terminate(&first, 137);

    wait_for(
        async || {
            let running = cluster.runtime.running();
            running.len() == 1 && running[0] != first
        },
        "replacement container",
    )
    .await;

    // The dead container is eventually tombstoned from the store.
    wait_for(
        async || {
            client
                .list_containers(filter.clone())
                .await
                .unwrap()
                .iter()
                .all(|c| c.desired_state == DesiredState::Running)
        },
        "tombstone of the failed container",
    )
    .await;

    cluster.worker.shutdown();
    cluster.manager.shutdown();
}
