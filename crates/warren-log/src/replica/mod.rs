//! The replica state machine.
//!
//! A pure, deterministic state machine: it consumes events (messages,
//! timeouts, client submissions) and produces outgoing messages plus
//! effects for the runtime to execute. No I/O, no clocks, no randomness
//! live here, which is what makes the log testable without a network.
//!
//! # Runtime contract
//!
//! For every [`ReplicaOutput`], the runtime MUST:
//! 1. execute the effects in order (durable log append first), then
//! 2. send the outgoing messages.
//!
//! `PrepareOk` only leaves this node after the corresponding append effect
//! has been fsynced; the ordering above is what provides that.
//!
//! # Protocol
//!
//! Normal operation:
//!
//! ```text
//! Submit ──► Leader ──Prepare──► Backups
//!                 ◄──PrepareOk──┘   (quorum)
//!            Leader ──Commit───► Backups
//! ```
//!
//! View change, triggered by leader silence:
//!
//! ```text
//! Backup ──StartViewChange──► All        (quorum joins)
//! Backup ──DoViewChange────► New leader  (quorum of logs)
//! New leader ──StartView───► All
//! ```

mod normal;
mod state;
mod view_change;

pub use state::{ReplicaState, Status, SubmitRejected};

use warren_fsm::Command;

use crate::message::Message;
use crate::types::{CommitNumber, LogEntry, OpNumber, ReplicaId};

/// Events that drive the state machine.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// A message arrived from a peer.
    Message(Message),
    /// A timeout fired.
    Timeout(TimeoutKind),
}

/// Timeouts scheduled by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The leader has been silent past the election timeout.
    LeaderSilent,
    /// Time for the leader to emit its periodic Commit heartbeat.
    HeartbeatSend,
    /// A view change has stalled; bump the view and retry.
    ViewChangeStalled,
}

/// Effects the runtime must execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Durably append entries to the local log before sending messages.
    Append(Vec<LogEntry>),
    /// Replace the local log wholesale (view change or state transfer).
    ReplaceLog {
        snapshot_base: OpNumber,
        snapshot: Option<Vec<u8>>,
        entries: Vec<LogEntry>,
    },
    /// Apply committed entries up to this point to the FSM.
    ApplyUpTo(CommitNumber),
}

/// Output of processing one event.
#[derive(Debug, Default)]
pub struct ReplicaOutput {
    pub messages: Vec<Message>,
    pub effects: Vec<Effect>,
}

impl ReplicaOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.effects.is_empty()
    }

    pub(crate) fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub(crate) fn push_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }
}

/// A client submission accepted by the leader.
#[derive(Debug)]
pub struct Accepted {
    /// The op number assigned to the command; commit notification is keyed
    /// by this.
    pub op: OpNumber,
    pub output: ReplicaOutput,
}

/// Creates a targeted message from this replica.
pub(crate) fn msg_to(
    from: ReplicaId,
    to: ReplicaId,
    payload: crate::message::MessagePayload,
) -> Message {
    Message::targeted(from, to, payload)
}

/// Creates a broadcast message from this replica.
pub(crate) fn msg_broadcast(from: ReplicaId, payload: crate::message::MessagePayload) -> Message {
    Message::broadcast(from, payload)
}

/// Marker alias so signatures read like the domain.
pub type ClientCommand = Command;
