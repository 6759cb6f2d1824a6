//! Normal operation: prepare, ack, commit.

use crate::message::{Commit, MessagePayload, Prepare, PrepareOk, StateRequest, StateResponse};
use crate::replica::state::{ReplicaState, Status};
use crate::replica::{Accepted, ClientCommand, Effect, ReplicaOutput, msg_broadcast, msg_to};
use crate::types::{LogEntry, OpNumber, ReplicaId};

impl ReplicaState {
    /// Leader: assign the next op, append locally, broadcast Prepare.
    pub(crate) fn accept_request(&mut self, command: ClientCommand) -> Accepted {
        debug_assert!(self.is_leader());

        let op = self.last_op().next();
        let entry = LogEntry {
            op,
            view: self.view,
            command,
        };
        self.log.push(entry.clone());
        self.acks
            .entry(op.as_u64())
            .or_default()
            .insert(self.id);

        let mut output = ReplicaOutput::empty();
        output.push_effect(Effect::Append(vec![entry.clone()]));
        output.push_message(msg_broadcast(
            self.id,
            MessagePayload::Prepare(Prepare {
                view: self.view,
                entry,
                commit: self.commit,
            }),
        ));

        // A single-member cluster commits on its own durable append.
        self.advance_commit(&mut output);

        Accepted { op, output }
    }

    /// Backup: append the prepared entry and ack it.
    pub(crate) fn on_prepare(&mut self, from: ReplicaId, prepare: Prepare) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();

        if prepare.view < self.view {
            return output;
        }
        if prepare.view > self.view || self.status == Status::ViewChange {
            // We missed a view change; catch up from the sender.
            return self.request_state(prepare.view.max(self.view), from);
        }
        if self.is_leader() {
            // A prepare in our own view from someone else is stale noise.
            return output;
        }

        let expected = self.last_op().next();
        if prepare.entry.op > expected {
            // Gap: ask the leader for the missing entries.
            return self.request_state(self.view, from);
        }
        if prepare.entry.op == expected {
            self.log.push(prepare.entry.clone());
            output.push_effect(Effect::Append(vec![prepare.entry.clone()]));
        }
        // Duplicate prepares are re-acked so a retransmitting leader can
        // make progress.
        output.push_message(msg_to(
            self.id,
            from,
            MessagePayload::PrepareOk(PrepareOk {
                view: self.view,
                op: prepare.entry.op,
            }),
        ));

        self.observe_commit(prepare.commit, &mut output);
        output
    }

    /// Leader: count acks, advance the commit point on quorum.
    pub(crate) fn on_prepare_ok(&mut self, from: ReplicaId, ok: PrepareOk) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        if ok.view != self.view || !self.is_leader() {
            return output;
        }
        if ok.op <= self.commit {
            return output;
        }
        self.acks.entry(ok.op.as_u64()).or_default().insert(from);
        self.advance_commit(&mut output);
        output
    }

    /// Backup: the leader's commit point advanced (or is heartbeating).
    pub(crate) fn on_commit(&mut self, from: ReplicaId, commit: Commit) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        if commit.view < self.view {
            return output;
        }
        if commit.view > self.view || self.status == Status::ViewChange {
            return self.request_state(commit.view.max(self.view), from);
        }
        self.observe_commit(commit.commit, &mut output);
        output
    }

    /// Leader heartbeat tick: re-broadcast the commit point.
    pub(crate) fn on_heartbeat_send(&mut self) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        if self.is_leader() {
            output.push_message(msg_broadcast(
                self.id,
                MessagePayload::Commit(Commit {
                    view: self.view,
                    commit: self.commit,
                }),
            ));
        }
        output
    }

    /// Any replica: answer a catch-up request from our log.
    pub(crate) fn on_state_request(
        &mut self,
        from: ReplicaId,
        request: StateRequest,
    ) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        if self.status != Status::Normal || request.view > self.view {
            return output;
        }

        let needs_snapshot = request.have < self.snapshot_base;
        let entries = if needs_snapshot {
            self.log.clone()
        } else {
            self.entries_after(request.have)
        };
        output.push_message(msg_to(
            self.id,
            from,
            MessagePayload::StateResponse(StateResponse {
                view: self.view,
                snapshot_base: self.snapshot_base,
                snapshot: if needs_snapshot {
                    self.snapshot.clone()
                } else {
                    None
                },
                entries,
                commit: self.commit,
            }),
        ));
        output
    }

    /// Lagging replica: install the catch-up payload.
    pub(crate) fn on_state_response(
        &mut self,
        _from: ReplicaId,
        response: StateResponse,
    ) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        if response.view < self.view {
            return output;
        }

        if let Some(snapshot) = response.snapshot {
            // Full install: snapshot plus tail.
            self.snapshot_base = response.snapshot_base;
            self.snapshot = Some(snapshot.clone());
            self.log = response.entries.clone();
            output.push_effect(Effect::ReplaceLog {
                snapshot_base: response.snapshot_base,
                snapshot: Some(snapshot),
                entries: response.entries,
            });
        } else {
            // Tail install: extend our contiguous log.
            let mut appended = Vec::new();
            for entry in response.entries {
                if entry.op == self.last_op().next() {
                    self.log.push(entry.clone());
                    appended.push(entry);
                }
            }
            if !appended.is_empty() {
                output.push_effect(Effect::Append(appended));
            }
        }

        self.view = response.view;
        self.last_normal_view = response.view;
        self.status = Status::Normal;
        self.svc_votes.clear();
        self.dvc.clear();
        self.dvc_sent_for = None;
        self.observe_commit(response.commit, &mut output);
        output
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    /// Leader: advance commit through every op with a quorum of acks.
    pub(crate) fn advance_commit(&mut self, output: &mut ReplicaOutput) {
        let quorum = self.quorum();
        let mut advanced = false;
        let mut next = self.commit.next();
        while next <= self.last_op() {
            let acked = self
                .acks
                .get(&next.as_u64())
                .is_some_and(|set| set.len() >= quorum);
            if !acked {
                break;
            }
            self.commit = next;
            advanced = true;
            next = next.next();
        }
        if advanced {
            self.acks.retain(|&op, _| op > self.commit.as_u64());
            output.push_effect(Effect::ApplyUpTo(self.commit));
            output.push_message(msg_broadcast(
                self.id,
                MessagePayload::Commit(Commit {
                    view: self.view,
                    commit: self.commit,
                }),
            ));
        }
    }

    /// Backup: adopt a commit point we can cover locally.
    pub(crate) fn observe_commit(&mut self, commit: OpNumber, output: &mut ReplicaOutput) {
        if commit <= self.commit {
            return;
        }
        if commit > self.last_op() {
            // We are missing committed entries; catch up from the leader.
            let leader = self.leader_of(self.view);
            if leader != self.id {
                let request = self.request_state(self.view, leader);
                output.messages.extend(request.messages);
                output.effects.extend(request.effects);
            }
            return;
        }
        self.commit = commit;
        output.push_effect(Effect::ApplyUpTo(self.commit));
    }

    /// Ask `target` for entries after what we hold.
    pub(crate) fn request_state(
        &mut self,
        view: crate::types::ViewNumber,
        target: ReplicaId,
    ) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        output.push_message(msg_to(
            self.id,
            target,
            MessagePayload::StateRequest(StateRequest {
                view,
                have: self.last_op(),
            }),
        ));
        output
    }
}
