//! # warren-log: the replicated command log
//!
//! An odd-sized set of managers totally orders [`warren_fsm::Command`]s
//! through a viewstamped-replication protocol and applies them to the FSM.
//! The protocol core is a pure state machine ([`ReplicaState`]); the tokio
//! runtime around it owns peer links, timers, the durable log, and
//! snapshots.
//!
//! ```ignore
//! let handle = warren_log::start(LogConfig::single_node(data_dir, addr)).await?;
//! let outcome = handle.submit(command, Duration::from_secs(10)).await?;
//! let services = handle.fsm().read().unwrap().store().scan(Collection::Services);
//! ```

pub mod message;
mod replica;
mod storage;

mod error;
mod runtime;
#[cfg(test)]
mod tests;
mod types;

pub use error::{LogError, LogResult};
pub use replica::{
    Accepted, Effect, ReplicaEvent, ReplicaOutput, ReplicaState, Status, SubmitRejected,
    TimeoutKind,
};
pub use runtime::{
    ELECTION_TIMEOUT, HEARTBEAT_INTERVAL, LeaderStatus, LogConfig, LogHandle, SNAPSHOT_INTERVAL,
    start,
};
pub use storage::{LogMeta, LogStore, SnapshotFile};
pub use types::{CommitNumber, LogEntry, OpNumber, ReplicaId, ViewNumber};
