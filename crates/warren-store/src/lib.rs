//! # warren-store: keyed record store behind the replicated log
//!
//! The store holds every durable record in the cluster, partitioned into a
//! fixed set of named collections. The replicated log's FSM is the sole
//! writer; everything else holds read-only views rebuilt from snapshots.
//!
//! # Determinism
//!
//! Collections are `BTreeMap`s, so iteration order and the serialized
//! snapshot are deterministic: applying the same command sequence on every
//! replica yields byte-identical snapshot bytes. No hash-map ordering ever
//! crosses the snapshot boundary.
//!
//! # Durability
//!
//! Durability of individual writes comes from the log (entries are fsynced
//! before apply is acknowledged). The store itself persists as a snapshot
//! file written via temp-file + atomic rename, so a crash mid-write leaves
//! the previous snapshot intact.

mod transaction;

pub use transaction::{Guard, Transaction, TxnOp};

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from store operations.
///
/// `Io` is fatal: the manager aborts and rejoins with a clean restart rather
/// than continuing on a store it can no longer trust.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {collection}/{key}")]
    NotFound { collection: Collection, key: String },

    #[error("conflict: guard failed for {collection}/{key}")]
    Conflict { collection: Collection, key: String },

    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot decode error: {0}")]
    Decode(String),

    #[error("record decode error for {collection}/{key}: {reason}")]
    Corrupt {
        collection: Collection,
        key: String,
        reason: String,
    },
}

/// The fixed set of collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    Nodes,
    Services,
    Containers,
    Secrets,
    Volumes,
    JoinTokens,
    ClusterConfig,
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Collection::Nodes => "nodes",
            Collection::Services => "services",
            Collection::Containers => "containers",
            Collection::Secrets => "secrets",
            Collection::Volumes => "volumes",
            Collection::JoinTokens => "join_tokens",
            Collection::ClusterConfig => "cluster_config",
        };
        write!(f, "{name}")
    }
}

/// The in-memory store: one ordered map per collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Store {
    nodes: BTreeMap<String, Vec<u8>>,
    services: BTreeMap<String, Vec<u8>>,
    containers: BTreeMap<String, Vec<u8>>,
    secrets: BTreeMap<String, Vec<u8>>,
    volumes: BTreeMap<String, Vec<u8>>,
    join_tokens: BTreeMap<String, Vec<u8>>,
    cluster_config: BTreeMap<String, Vec<u8>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, collection: Collection) -> &BTreeMap<String, Vec<u8>> {
        match collection {
            Collection::Nodes => &self.nodes,
            Collection::Services => &self.services,
            Collection::Containers => &self.containers,
            Collection::Secrets => &self.secrets,
            Collection::Volumes => &self.volumes,
            Collection::JoinTokens => &self.join_tokens,
            Collection::ClusterConfig => &self.cluster_config,
        }
    }

    fn map_mut(&mut self, collection: Collection) -> &mut BTreeMap<String, Vec<u8>> {
        match collection {
            Collection::Nodes => &mut self.nodes,
            Collection::Services => &mut self.services,
            Collection::Containers => &mut self.containers,
            Collection::Secrets => &mut self.secrets,
            Collection::Volumes => &mut self.volumes,
            Collection::JoinTokens => &mut self.join_tokens,
            Collection::ClusterConfig => &mut self.cluster_config,
        }
    }

    /// Returns the raw bytes stored under `key`.
    pub fn get(&self, collection: Collection, key: &str) -> StoreResult<&[u8]> {
        self.map(collection)
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| StoreError::NotFound {
                collection,
                key: key.to_string(),
            })
    }

    /// Stores `value` under `key`, replacing any existing record.
    pub fn put(&mut self, collection: Collection, key: impl Into<String>, value: Vec<u8>) {
        self.map_mut(collection).insert(key.into(), value);
    }

    /// Removes the record under `key`.
    pub fn delete(&mut self, collection: Collection, key: &str) -> StoreResult<()> {
        self.map_mut(collection)
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                collection,
                key: key.to_string(),
            })
    }

    /// True if a record exists under `key`.
    pub fn contains(&self, collection: Collection, key: &str) -> bool {
        self.map(collection).contains_key(key)
    }

    /// Iterates every record in a collection in key order.
    pub fn scan(&self, collection: Collection) -> impl Iterator<Item = (&str, &[u8])> {
        self.map(collection)
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of records in a collection.
    pub fn len(&self, collection: Collection) -> usize {
        self.map(collection).len()
    }

    pub fn is_empty(&self, collection: Collection) -> bool {
        self.map(collection).is_empty()
    }

    // ------------------------------------------------------------------
    // Typed access
    // ------------------------------------------------------------------

    /// Decodes the record under `key` as `T`.
    pub fn get_record<T: DeserializeOwned>(
        &self,
        collection: Collection,
        key: &str,
    ) -> StoreResult<T> {
        let bytes = self.get(collection, key)?;
        postcard::from_bytes(bytes).map_err(|e| StoreError::Corrupt {
            collection,
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Encodes `record` and stores it under `key`.
    pub fn put_record<T: Serialize>(
        &mut self,
        collection: Collection,
        key: impl Into<String>,
        record: &T,
    ) {
        let bytes = postcard::to_allocvec(record)
            .expect("record serialization is infallible for in-memory types");
        self.put(collection, key, bytes);
    }

    /// Decodes every record in a collection, in key order.
    pub fn scan_records<T: DeserializeOwned>(
        &self,
        collection: Collection,
    ) -> StoreResult<Vec<T>> {
        self.scan(collection)
            .map(|(key, bytes)| {
                postcard::from_bytes(bytes).map_err(|e| StoreError::Corrupt {
                    collection,
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Applies a transaction all-or-nothing.
    ///
    /// All guards are checked against the current state first; if any fails,
    /// nothing is applied and `Conflict` (or `NotFound` for a delete of a
    /// missing key) is returned.
    pub fn commit(&mut self, txn: Transaction) -> StoreResult<()> {
        for guard in &txn.guards {
            self.check_guard(guard)?;
        }

        // Validate every delete before mutating anything. A delete may
        // target a key inserted earlier in the same transaction.
        let mut pending: std::collections::HashSet<(Collection, &str)> =
            std::collections::HashSet::new();
        for op in &txn.ops {
            match op {
                TxnOp::Put { collection, key, .. } => {
                    pending.insert((*collection, key.as_str()));
                }
                TxnOp::Delete { collection, key } => {
                    if !self.contains(*collection, key)
                        && !pending.contains(&(*collection, key.as_str()))
                    {
                        return Err(StoreError::NotFound {
                            collection: *collection,
                            key: key.clone(),
                        });
                    }
                    pending.remove(&(*collection, key.as_str()));
                }
            }
        }

        for op in txn.ops {
            match op {
                TxnOp::Put {
                    collection,
                    key,
                    value,
                } => self.put(collection, key, value),
                TxnOp::Delete { collection, key } => {
                    let _ = self.map_mut(collection).remove(&key);
                }
            }
        }
        Ok(())
    }

    fn check_guard(&self, guard: &Guard) -> StoreResult<()> {
        let conflict = |collection: Collection, key: &str| StoreError::Conflict {
            collection,
            key: key.to_string(),
        };
        match guard {
            Guard::Absent { collection, key } => {
                if self.contains(*collection, key) {
                    return Err(conflict(*collection, key));
                }
            }
            Guard::Exists { collection, key } => {
                if !self.contains(*collection, key) {
                    return Err(conflict(*collection, key));
                }
            }
            Guard::Matches {
                collection,
                key,
                expected,
            } => {
                if self.get(*collection, key).ok() != Some(expected.as_slice()) {
                    return Err(conflict(*collection, key));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Serializes the full store to canonical bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("store serialization is infallible")
    }

    /// Restores a store from snapshot bytes, replacing all contents.
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }

    /// Writes the store to `path` atomically (temp file + rename + fsync).
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let bytes = self.to_bytes();
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            // Persist the rename itself.
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    /// Loads a store previously written by [`Store::save`].
    pub fn load(path: &Path) -> StoreResult<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}
