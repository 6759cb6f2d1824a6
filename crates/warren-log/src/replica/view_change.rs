//! View changes: electing a new leader after the old one goes silent.
//!
//! The protocol is leader-rotation by view number: the leader of view `v`
//! is `members[v % n]`, so elections need no randomized voting. A backup
//! that stops hearing Commits starts a view change; once a quorum agrees,
//! the designated new leader adopts the most advanced log among a quorum
//! and announces the new view.

use crate::message::{DoViewChange, MessagePayload, PrepareOk, StartView, StartViewChange};
use crate::replica::state::{ReplicaState, Status};
use crate::replica::{Effect, ReplicaOutput, msg_broadcast, msg_to};
use crate::types::{ReplicaId, ViewNumber};

impl ReplicaState {
    /// Backup: the leader went silent; propose the next view.
    pub(crate) fn on_leader_silent(&mut self) -> ReplicaOutput {
        if self.member_count == 1 {
            // A singleton cluster has no one to elect.
            return ReplicaOutput::empty();
        }
        let next = self.view.next();
        self.begin_view_change(next)
    }

    /// A view change is not converging; bump the view and retry.
    pub(crate) fn on_view_change_stalled(&mut self) -> ReplicaOutput {
        if self.status != Status::ViewChange || self.member_count == 1 {
            return ReplicaOutput::empty();
        }
        let next = self.view.next();
        self.begin_view_change(next)
    }

    pub(crate) fn begin_view_change(&mut self, view: ViewNumber) -> ReplicaOutput {
        self.view = view;
        self.status = Status::ViewChange;
        self.svc_votes.clear();
        self.svc_votes.insert(self.id);
        self.dvc.clear();
        self.dvc_sent_for = None;
        self.acks.clear();

        let mut output = ReplicaOutput::empty();
        output.push_message(msg_broadcast(
            self.id,
            MessagePayload::StartViewChange(StartViewChange { view }),
        ));
        // With a two-member quorum our own vote plus one more suffices;
        // with n=2 the quorum is 2, so we wait for the peer either way.
        self.maybe_send_do_view_change(&mut output);
        output
    }

    pub(crate) fn on_start_view_change(
        &mut self,
        from: ReplicaId,
        svc: StartViewChange,
    ) -> ReplicaOutput {
        if svc.view < self.view {
            return ReplicaOutput::empty();
        }

        let mut output = if svc.view > self.view {
            // Join the newer view change.
            let mut out = self.begin_view_change(svc.view);
            self.svc_votes.insert(from);
            self.maybe_send_do_view_change(&mut out);
            return out;
        } else if self.status == Status::ViewChange {
            self.svc_votes.insert(from);
            ReplicaOutput::empty()
        } else {
            // Same view but we are normal: the sender is behind a view
            // change that already completed; it will catch up on the next
            // Commit.
            return ReplicaOutput::empty();
        };

        self.maybe_send_do_view_change(&mut output);
        output
    }

    /// Once a quorum agrees on the view change, send our log to the new
    /// leader (or record it locally if that is us).
    fn maybe_send_do_view_change(&mut self, output: &mut ReplicaOutput) {
        if self.status != Status::ViewChange
            || self.svc_votes.len() < self.quorum()
            || self.dvc_sent_for == Some(self.view)
        {
            return;
        }
        self.dvc_sent_for = Some(self.view);

        let dvc = DoViewChange {
            view: self.view,
            last_normal_view: self.last_normal_view,
            log: self.log.clone(),
            snapshot_base: self.snapshot_base,
            snapshot: self.snapshot.clone(),
            commit: self.commit,
        };

        let new_leader = self.leader_of(self.view);
        if new_leader == self.id {
            self.dvc.insert(self.id, dvc);
            self.maybe_start_view(output);
        } else {
            output.push_message(msg_to(
                self.id,
                new_leader,
                MessagePayload::DoViewChange(dvc),
            ));
        }
    }

    pub(crate) fn on_do_view_change(&mut self, from: ReplicaId, dvc: DoViewChange) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        if dvc.view < self.view || self.leader_of(dvc.view) != self.id {
            return output;
        }
        if dvc.view > self.view {
            output = self.begin_view_change(dvc.view);
        }
        if self.status != Status::ViewChange || dvc.view != self.view {
            return output;
        }
        self.dvc.insert(from, dvc);
        // Our own contribution counts toward the quorum.
        if !self.dvc.contains_key(&self.id) {
            self.dvc.insert(
                self.id,
                DoViewChange {
                    view: self.view,
                    last_normal_view: self.last_normal_view,
                    log: self.log.clone(),
                    snapshot_base: self.snapshot_base,
                    snapshot: self.snapshot.clone(),
                    commit: self.commit,
                },
            );
        }
        self.maybe_start_view(&mut output);
        output
    }

    /// New leader: with a quorum of logs, adopt the most advanced one and
    /// announce the view.
    fn maybe_start_view(&mut self, output: &mut ReplicaOutput) {
        if self.dvc.len() < self.quorum() {
            return;
        }

        // Most advanced log: highest last-normal-view, then longest log.
        let best = self
            .dvc
            .values()
            .max_by_key(|d| {
                (
                    d.last_normal_view,
                    d.snapshot_base.as_u64() + d.log.len() as u64,
                )
            })
            .cloned()
            .expect("dvc quorum is non-empty");
        let commit = self.dvc.values().map(|d| d.commit).max().unwrap_or_default();

        self.snapshot_base = best.snapshot_base;
        self.snapshot = best.snapshot.clone();
        self.log = best.log.clone();
        self.commit = commit.max(self.commit);
        self.status = Status::Normal;
        self.last_normal_view = self.view;
        self.svc_votes.clear();
        self.dvc.clear();
        self.dvc_sent_for = None;
        self.acks.clear();
        // Uncommitted tail entries need re-acking in the new view.
        for entry in self.log.iter().filter(|e| e.op > self.commit) {
            self.acks
                .entry(entry.op.as_u64())
                .or_default()
                .insert(self.id);
        }

        output.push_effect(Effect::ReplaceLog {
            snapshot_base: self.snapshot_base,
            snapshot: self.snapshot.clone(),
            entries: self.log.clone(),
        });
        output.push_effect(Effect::ApplyUpTo(self.commit));
        output.push_message(msg_broadcast(
            self.id,
            MessagePayload::StartView(StartView {
                view: self.view,
                log: self.log.clone(),
                snapshot_base: self.snapshot_base,
                snapshot: self.snapshot.clone(),
                commit: self.commit,
            }),
        ));
    }

    /// Backup: install the new view's log and resume normal operation.
    pub(crate) fn on_start_view(&mut self, from: ReplicaId, sv: StartView) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        if sv.view < self.view || (sv.view == self.view && self.status == Status::Normal) {
            return output;
        }

        self.view = sv.view;
        self.last_normal_view = sv.view;
        self.status = Status::Normal;
        self.snapshot_base = sv.snapshot_base;
        self.snapshot = sv.snapshot.clone();
        self.log = sv.log.clone();
        self.svc_votes.clear();
        self.dvc.clear();
        self.dvc_sent_for = None;
        self.acks.clear();

        output.push_effect(Effect::ReplaceLog {
            snapshot_base: sv.snapshot_base,
            snapshot: sv.snapshot,
            entries: sv.log,
        });
        self.observe_commit(sv.commit, &mut output);

        // Ack every uncommitted entry so the new leader can commit them.
        for entry in self.log.iter().filter(|e| e.op > self.commit) {
            output.push_message(msg_to(
                self.id,
                from,
                MessagePayload::PrepareOk(PrepareOk {
                    view: self.view,
                    op: entry.op,
                }),
            ));
        }
        output
    }
}
