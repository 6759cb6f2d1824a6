//! Read-only projections over the applied store.
//!
//! Everything here takes a `&Store` snapshot and computes answers without
//! mutating anything. The scheduler and reconciler observe through these
//! functions and propose commands; conflicts resolve at apply time.

use warren_store::{Collection, Store, StoreResult};
use warren_types::{
    Container, Node, NodeId, NodeStatus, Secret, Service, ServiceId, Volume,
};

/// All services, in id order.
pub fn services(store: &Store) -> StoreResult<Vec<Service>> {
    store.scan_records(Collection::Services)
}

/// All nodes, in id order.
pub fn nodes(store: &Store) -> StoreResult<Vec<Node>> {
    store.scan_records(Collection::Nodes)
}

/// All containers, in id order.
pub fn containers(store: &Store) -> StoreResult<Vec<Container>> {
    store.scan_records(Collection::Containers)
}

/// All volumes, in id order.
pub fn volumes(store: &Store) -> StoreResult<Vec<Volume>> {
    store.scan_records(Collection::Volumes)
}

/// All secrets, in id order.
pub fn secrets(store: &Store) -> StoreResult<Vec<Secret>> {
    store.scan_records(Collection::Secrets)
}

/// Containers owned by one service.
pub fn containers_for_service(
    store: &Store,
    service_id: &ServiceId,
) -> StoreResult<Vec<Container>> {
    Ok(containers(store)?
        .into_iter()
        .filter(|c| &c.service_id == service_id)
        .collect())
}

/// Containers assigned to one node.
pub fn containers_for_node(store: &Store, node_id: &NodeId) -> StoreResult<Vec<Container>> {
    Ok(containers(store)?
        .into_iter()
        .filter(|c| c.node_id.as_ref() == Some(node_id))
        .collect())
}

/// Containers assigned to `node_id` whose record changed after `since`.
pub fn assignments_since(
    store: &Store,
    node_id: &NodeId,
    since_version: u64,
) -> StoreResult<Vec<Container>> {
    Ok(containers(store)?
        .into_iter()
        .filter(|c| c.node_id.as_ref() == Some(node_id) && c.version.as_u64() > since_version)
        .collect())
}

/// Nodes a workload may be placed on: ready workers that are not drained.
pub fn schedulable_nodes(store: &Store) -> StoreResult<Vec<Node>> {
    Ok(nodes(store)?
        .into_iter()
        .filter(|n| {
            n.role == warren_types::NodeRole::Worker
                && n.status == NodeStatus::Ready
                && !n.drained
        })
        .collect())
}

/// A service by its unique name.
pub fn service_by_name(store: &Store, name: &str) -> StoreResult<Option<Service>> {
    Ok(services(store)?.into_iter().find(|s| s.spec.name == name))
}

/// A secret by its unique name.
pub fn secret_by_name(store: &Store, name: &str) -> StoreResult<Option<Secret>> {
    Ok(secrets(store)?.into_iter().find(|s| s.name == name))
}

/// A volume by its unique name.
pub fn volume_by_name(store: &Store, name: &str) -> StoreResult<Option<Volume>> {
    Ok(volumes(store)?.into_iter().find(|v| v.name == name))
}
