//! Replica state and event dispatch.

use std::collections::{BTreeMap, BTreeSet};

use crate::message::{DoViewChange, MessagePayload};
use crate::replica::{Accepted, ClientCommand, ReplicaEvent, ReplicaOutput, TimeoutKind};
use crate::types::{CommitNumber, LogEntry, OpNumber, ReplicaId, ViewNumber};

/// Replica operating status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Processing client requests (leader) or prepares (backup).
    Normal,
    /// Participating in a view change; client requests are rejected.
    ViewChange,
}

/// Why a client submission was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitRejected {
    /// This replica is not the leader; the hint names the replica that is.
    NotLeader { leader: ReplicaId },
    /// A view change is in progress; no replica can accept writes.
    ViewChangeInProgress,
}

/// The pure replica state machine.
#[derive(Debug)]
pub struct ReplicaState {
    pub(crate) id: ReplicaId,
    pub(crate) member_count: usize,
    pub(crate) status: Status,
    pub(crate) view: ViewNumber,
    /// Last view in which this replica had normal status.
    pub(crate) last_normal_view: ViewNumber,
    /// Log tail; ops `<= snapshot_base` live in the snapshot.
    pub(crate) log: Vec<LogEntry>,
    pub(crate) snapshot_base: OpNumber,
    /// Latest snapshot bytes, carried into view changes and state transfer.
    pub(crate) snapshot: Option<Vec<u8>>,
    pub(crate) commit: CommitNumber,
    /// Leader bookkeeping: acks per uncommitted op (self included).
    pub(crate) acks: BTreeMap<u64, BTreeSet<ReplicaId>>,
    /// View-change bookkeeping.
    pub(crate) svc_votes: BTreeSet<ReplicaId>,
    pub(crate) dvc_sent_for: Option<ViewNumber>,
    pub(crate) dvc: BTreeMap<ReplicaId, DoViewChange>,
}

impl ReplicaState {
    /// A fresh replica with an empty log.
    pub fn new(id: ReplicaId, member_count: usize) -> Self {
        assert!(member_count > 0, "member_count must be positive");
        assert!(
            (id.as_u8() as usize) < member_count,
            "replica id {id} out of range for {member_count} members"
        );
        Self {
            id,
            member_count,
            status: Status::Normal,
            view: ViewNumber::ZERO,
            last_normal_view: ViewNumber::ZERO,
            log: Vec::new(),
            snapshot_base: OpNumber::ZERO,
            snapshot: None,
            commit: OpNumber::ZERO,
            acks: BTreeMap::new(),
            svc_votes: BTreeSet::new(),
            dvc_sent_for: None,
            dvc: BTreeMap::new(),
        }
    }

    /// Restores a replica from durable state.
    pub fn restore(
        id: ReplicaId,
        member_count: usize,
        view: ViewNumber,
        snapshot_base: OpNumber,
        snapshot: Option<Vec<u8>>,
        log: Vec<LogEntry>,
        commit: CommitNumber,
    ) -> Self {
        let mut state = Self::new(id, member_count);
        state.view = view;
        state.last_normal_view = view;
        state.snapshot_base = snapshot_base;
        state.snapshot = snapshot;
        state.log = log;
        state.commit = commit;
        state
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn commit(&self) -> CommitNumber {
        self.commit
    }

    /// The leader of view `v` is `members[v % n]`.
    pub fn leader_of(&self, view: ViewNumber) -> ReplicaId {
        ReplicaId::new((view.as_u64() % self.member_count as u64) as u8)
    }

    pub fn is_leader(&self) -> bool {
        self.status == Status::Normal && self.leader_of(self.view) == self.id
    }

    /// The replica currently believed to hold leadership, if any.
    pub fn leader_hint(&self) -> Option<ReplicaId> {
        match self.status {
            Status::Normal => Some(self.leader_of(self.view)),
            Status::ViewChange => None,
        }
    }

    /// Highest op number present locally (snapshot plus log tail).
    pub fn last_op(&self) -> OpNumber {
        OpNumber::new(self.snapshot_base.as_u64() + self.log.len() as u64)
    }

    /// Op number covered by the latest snapshot.
    pub fn snapshot_base(&self) -> OpNumber {
        self.snapshot_base
    }

    /// The log tail beyond the snapshot.
    pub fn tail(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn quorum(&self) -> usize {
        self.member_count / 2 + 1
    }

    /// The log entry at `op`, if it is in the tail.
    pub(crate) fn entry_at(&self, op: OpNumber) -> Option<&LogEntry> {
        if op <= self.snapshot_base {
            return None;
        }
        let idx = (op.as_u64() - self.snapshot_base.as_u64() - 1) as usize;
        self.log.get(idx)
    }

    /// Entries with op strictly greater than `after`.
    pub(crate) fn entries_after(&self, after: OpNumber) -> Vec<LogEntry> {
        self.log
            .iter()
            .filter(|e| e.op > after)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    /// Processes one event, returning messages to send and effects to run.
    pub fn on_event(&mut self, event: ReplicaEvent) -> ReplicaOutput {
        match event {
            ReplicaEvent::Message(message) => {
                let from = message.from;
                match message.payload {
                    MessagePayload::Prepare(m) => self.on_prepare(from, m),
                    MessagePayload::PrepareOk(m) => self.on_prepare_ok(from, m),
                    MessagePayload::Commit(m) => self.on_commit(from, m),
                    MessagePayload::StartViewChange(m) => self.on_start_view_change(from, m),
                    MessagePayload::DoViewChange(m) => self.on_do_view_change(from, m),
                    MessagePayload::StartView(m) => self.on_start_view(from, m),
                    MessagePayload::StateRequest(m) => self.on_state_request(from, m),
                    MessagePayload::StateResponse(m) => self.on_state_response(from, m),
                }
            }
            ReplicaEvent::Timeout(TimeoutKind::LeaderSilent) => self.on_leader_silent(),
            ReplicaEvent::Timeout(TimeoutKind::HeartbeatSend) => self.on_heartbeat_send(),
            ReplicaEvent::Timeout(TimeoutKind::ViewChangeStalled) => self.on_view_change_stalled(),
        }
    }

    /// Accepts a client command on the leader.
    ///
    /// Returns the assigned op number; the runtime resolves the caller's
    /// future once that op commits and applies.
    pub fn submit(&mut self, command: ClientCommand) -> Result<Accepted, SubmitRejected> {
        match self.status {
            Status::ViewChange => Err(SubmitRejected::ViewChangeInProgress),
            Status::Normal if !self.is_leader() => Err(SubmitRejected::NotLeader {
                leader: self.leader_of(self.view),
            }),
            Status::Normal => Ok(self.accept_request(command)),
        }
    }

    /// Discards log state covered by a new snapshot.
    ///
    /// Called by the runtime after serializing the FSM at `up_to`. Only
    /// committed prefixes may be compacted.
    pub fn compact(&mut self, snapshot: Vec<u8>, up_to: OpNumber) {
        assert!(up_to <= self.commit, "cannot compact past the commit point");
        if up_to <= self.snapshot_base {
            return;
        }
        self.log.retain(|e| e.op > up_to);
        self.snapshot_base = up_to;
        self.snapshot = Some(snapshot);
    }
}
