//! Replication protocol messages.
//!
//! ## Normal operation
//! - [`Prepare`] - leader → backup: replicate this entry
//! - [`PrepareOk`] - backup → leader: entry is durable here
//! - [`Commit`] - leader → all: entries up to this point are committed
//!   (doubles as the leader heartbeat)
//!
//! ## View change
//! - [`StartViewChange`] - backup → all: I think the leader is dead
//! - [`DoViewChange`] - backup → new leader: my log, for the new view
//! - [`StartView`] - new leader → all: the new view begins with this log
//!
//! ## Catch-up
//! - [`StateRequest`] - lagging replica → leader: I am missing entries
//! - [`StateResponse`] - leader → replica: snapshot plus log tail

use serde::{Deserialize, Serialize};

use crate::types::{CommitNumber, LogEntry, OpNumber, ReplicaId, ViewNumber};

/// A protocol message with routing information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: ReplicaId,
    /// `None` for broadcast.
    pub to: Option<ReplicaId>,
    pub payload: MessagePayload,
}

impl Message {
    pub fn targeted(from: ReplicaId, to: ReplicaId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: Some(to),
            payload,
        }
    }

    pub fn broadcast(from: ReplicaId, payload: MessagePayload) -> Self {
        Self {
            from,
            to: None,
            payload,
        }
    }

    /// Canonical bytes for the peer link.
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("message serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// The payload variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    Prepare(Prepare),
    PrepareOk(PrepareOk),
    Commit(Commit),
    StartViewChange(StartViewChange),
    DoViewChange(DoViewChange),
    StartView(StartView),
    StateRequest(StateRequest),
    StateResponse(StateResponse),
}

/// Leader → backup: append this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub entry: LogEntry,
    /// Piggybacked commit point.
    pub commit: CommitNumber,
}

/// Backup → leader: the entry is durable on this replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareOk {
    pub view: ViewNumber,
    pub op: OpNumber,
}

/// Leader → all: commit point advanced (also the heartbeat).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: ViewNumber,
    pub commit: CommitNumber,
}

/// Backup → all: start a view change for `view`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartViewChange {
    pub view: ViewNumber,
}

/// Backup → new leader: state carried into the view change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoViewChange {
    pub view: ViewNumber,
    /// Last view in which this replica's status was normal.
    pub last_normal_view: ViewNumber,
    /// Log tail after the snapshot base.
    pub log: Vec<LogEntry>,
    /// Op number covered by this replica's last snapshot.
    pub snapshot_base: OpNumber,
    /// Snapshot bytes, sent so a leader with an older base can adopt them.
    pub snapshot: Option<Vec<u8>>,
    pub commit: CommitNumber,
}

/// New leader → all: the new view starts with this log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartView {
    pub view: ViewNumber,
    pub log: Vec<LogEntry>,
    pub snapshot_base: OpNumber,
    pub snapshot: Option<Vec<u8>>,
    pub commit: CommitNumber,
}

/// Lagging replica → leader: send me everything after `have`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequest {
    pub view: ViewNumber,
    /// Highest op this replica holds.
    pub have: OpNumber,
}

/// Leader → lagging replica: snapshot (if the tail alone is not enough)
/// plus log entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResponse {
    pub view: ViewNumber,
    pub snapshot_base: OpNumber,
    pub snapshot: Option<Vec<u8>>,
    pub entries: Vec<LogEntry>,
    pub commit: CommitNumber,
}
