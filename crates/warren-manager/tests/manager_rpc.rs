//! End-to-end manager tests over the real RPC surface: a single-node
//! cluster, a joining worker, scheduling, scale-down, secrets, and the
//! read-only IPC endpoint.

use std::collections::BTreeMap;
use std::time::Duration;

use warren_client::{Client, ClientConfig, ContainerFilter, ErrorKind};
use warren_manager::{ManagerHandle, init_cluster, run_manager};
use warren_types::{
    ActualState, DesiredState, NodeRole, Resources, ServiceMode, ServiceSpec,
};

fn test_config(dir: &std::path::Path) -> warren_config::WarrenConfig {
    let mut config = warren_config::WarrenConfig::default();
    config.node.data_dir = dir.to_path_buf();
    config.manager.listen_addr = "127.0.0.1:0".to_string();
    config.manager.peer_addr = "127.0.0.1:0".to_string();
    // Fast cadences so convergence assertions stay quick.
    config.manager.scheduler_interval_ms = 200;
    config.manager.reconciler_interval_ms = 300;
    config
}

async fn start_manager(dir: &std::path::Path) -> ManagerHandle {
    let config = test_config(dir);
    init_cluster(&config).unwrap();
    run_manager(config).await.unwrap()
}

async fn connect(handle: &ManagerHandle) -> Client {
    Client::connect(handle.rpc_addr.to_string(), ClientConfig::default())
        .await
        .unwrap()
}

fn web_spec(replicas: u64) -> ServiceSpec {
    ServiceSpec {
        name: "web".to_string(),
        image: "nginx:latest".to_string(),
        mode: ServiceMode::Replicated { replicas },
        env: BTreeMap::new(),
        secrets: vec![],
        mounts: vec![],
        ports: vec![],
        health_check: None,
        restart_policy: warren_types::RestartPolicy::default(),
        strategy: warren_types::DeployStrategy::default(),
        resources: Resources::default(),
        constraints: BTreeMap::new(),
        stop_timeout_ms: 10_000,
    }
}

/// Polls until `predicate` holds or the deadline passes.
async fn wait_for<F>(mut predicate: F, what: &str)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
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

#[tokio::test]
async fn service_crud_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_manager(dir.path()).await;
    let mut client = connect(&handle).await;

    let service = client.create_service(web_spec(2)).await.unwrap();
    assert_eq!(service.spec.name, "web");
    assert_eq!(service.replicas(), Some(2));

    let fetched = client.get_service_by_name("web").await.unwrap();
    assert_eq!(fetched.id, service.id);

    assert_eq!(client.list_services().await.unwrap().len(), 1);

    // Duplicate names are rejected.
    let err = client.create_service(web_spec(1)).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::AlreadyExists));

    client.delete_service(service.id.clone()).await.unwrap();
    let err = client.get_service(service.id).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));

    handle.shutdown();
}

#[tokio::test]
async fn join_schedule_and_scale_down() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_manager(dir.path()).await;
    let mut client = connect(&handle).await;

    // A worker joins with a one-shot token.
    let (token, _expires) = client.issue_join_token(NodeRole::Worker).await.unwrap();
    let (node_id, _peers, _ca, cluster_key) = client
        .join_cluster(
            token.clone(),
            NodeRole::Worker,
            "127.0.0.1:7431".to_string(),
            Resources::new(8_000, 16 << 30, 500 << 30),
            BTreeMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(cluster_key.len(), 32);

    // The token is single-use.
    let err = client
        .join_cluster(
            token,
            NodeRole::Worker,
            "127.0.0.1:7432".to_string(),
            Resources::default(),
            BTreeMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Validation));

    let service = client.create_service(web_spec(3)).await.unwrap();

    // The scheduler fills all three slots on the joined node.
    let mut list_client = connect(&handle).await;
    let filter = ContainerFilter::ByService(service.id.clone());
    wait_for(
        async || {
            let containers = list_client.list_containers(filter.clone()).await.unwrap();
            containers.len() == 3
                && containers
                    .iter()
                    .all(|c| c.node_id.as_ref() == Some(&node_id))
        },
        "3 containers scheduled",
    )
    .await;

    // Scale down to one; the survivor is the lexicographically earliest.
    client.scale_service(service.id.clone(), 1).await.unwrap();
    wait_for(
        async || {
            let containers = list_client.list_containers(filter.clone()).await.unwrap();
            let running: Vec<_> = containers
                .iter()
                .filter(|c| c.desired_state == DesiredState::Running)
                .collect();
            running.len() == 1
        },
        "scale down to 1",
    )
    .await;

    let containers = list_client.list_containers(filter).await.unwrap();
    let mut ids: Vec<_> = containers.iter().map(|c| c.id.clone()).collect();
    ids.sort();
    let survivor = containers
        .iter()
        .find(|c| c.desired_state == DesiredState::Running)
        .unwrap();
    assert_eq!(survivor.id, ids[0]);

    handle.shutdown();
}

#[tokio::test]
async fn dead_node_fails_over_its_containers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    // A node is dead after one second of silence.
    config.manager.node_down_after_ms = 1_000;
    init_cluster(&config).unwrap();
    let handle = run_manager(config).await.unwrap();
    let mut client = connect(&handle).await;

    let (token, _) = client.issue_join_token(NodeRole::Worker).await.unwrap();
    let (node_id, ..) = client
        .join_cluster(
            token,
            NodeRole::Worker,
            "127.0.0.1:7431".to_string(),
            Resources::new(8_000, 16 << 30, 500 << 30),
            BTreeMap::new(),
        )
        .await
        .unwrap();

    client.create_service(web_spec(1)).await.unwrap();
    wait_for(
        async || {
            !client
                .list_containers(ContainerFilter::ByNode(node_id.clone()))
                .await
                .unwrap()
                .is_empty()
        },
        "container scheduled",
    )
    .await;

    // No heartbeats arrive; the reconciler marks the node down and fails
    // its container so the scheduler can replace it.
    wait_for(
        async || {
            let node = client.get_node(node_id.clone()).await.unwrap();
            node.status == warren_types::NodeStatus::Down
        },
        "node marked down",
    )
    .await;
    wait_for(
        async || {
            client
                .list_containers(ContainerFilter::All)
                .await
                .unwrap()
                .iter()
                .any(|c| c.actual_state == ActualState::Failed)
        },
        "containers failed over",
    )
    .await;

    handle.shutdown();
}

#[tokio::test]
async fn secrets_are_sealed_and_metadata_only() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_manager(dir.path()).await;
    let mut client = connect(&handle).await;

    let info = client
        .create_secret("token", b"abc".to_vec())
        .await
        .unwrap();
    assert_eq!(info.name, "token");

    let listed = client.list_secrets().await.unwrap();
    assert_eq!(listed.len(), 1);

    // The stored record carries ciphertext, never the plaintext.
    let fsm = handle.log.fsm();
    let stored: warren_types::Secret = fsm
        .read()
        .unwrap()
        .store()
        .get_record(warren_store::Collection::Secrets, info.id.as_str())
        .unwrap();
    assert_ne!(stored.ciphertext, b"abc".to_vec());
    assert_eq!(stored.nonce.len(), 12);

    client.delete_secret(info.id).await.unwrap();
    assert!(client.list_secrets().await.unwrap().is_empty());

    handle.shutdown();
}

#[cfg(unix)]
#[tokio::test]
async fn ipc_endpoint_is_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_manager(dir.path()).await;
    let mut rpc = connect(&handle).await;
    rpc.create_service(web_spec(1)).await.unwrap();

    let socket = warren_manager::ipc_socket_path(dir.path());
    wait_for(async || socket.exists(), "ipc socket").await;

    let mut ipc = Client::connect_ipc(&socket, ClientConfig::default())
        .await
        .unwrap();
    assert_eq!(ipc.list_services().await.unwrap().len(), 1);

    let err = ipc.create_service(web_spec(2)).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::PermissionDenied));

    handle.shutdown();
}
