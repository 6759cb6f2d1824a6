//! The tokio runtime around the replica state machine.
//!
//! One task owns the [`ReplicaState`] and the FSM; it is the only writer.
//! Peer links, tick timers, and client submissions all funnel into that
//! task over channels, and its outputs fan back out: effects run first
//! (durable append, apply, snapshot), messages go to peers second. RPC
//! handlers elsewhere read the FSM behind a shared lock and submit
//! commands through [`LogHandle`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use warren_fsm::{ApplyOutcome, Command, Fsm};
use warren_types::Member;

use crate::error::{LogError, LogResult};
use crate::message::Message;
use crate::replica::{
    Effect, ReplicaEvent, ReplicaOutput, ReplicaState, Status, SubmitRejected, TimeoutKind,
};
use crate::storage::{LogMeta, LogStore, SnapshotFile};
use crate::types::{OpNumber, ReplicaId};

/// Heartbeat cadence for the leader's Commit broadcasts.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Base election timeout; staggered per replica to avoid split votes.
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(500);

/// Applied entries between snapshots.
pub const SNAPSHOT_INTERVAL: u64 = 4096;

/// How long a view change may stall before the cluster reports lost quorum.
const QUORUM_LOST_AFTER: Duration = Duration::from_secs(5);

/// Configuration for one log replica.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub replica_id: u8,
    /// All voting members, including this replica. Dense ids from zero.
    pub members: Vec<Member>,
    pub data_dir: std::path::PathBuf,
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
    pub snapshot_interval: u64,
}

impl LogConfig {
    pub fn new(replica_id: u8, members: Vec<Member>, data_dir: std::path::PathBuf) -> Self {
        Self {
            replica_id,
            members,
            data_dir,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout: ELECTION_TIMEOUT,
            snapshot_interval: SNAPSHOT_INTERVAL,
        }
    }

    /// A development cluster of one.
    pub fn single_node(data_dir: std::path::PathBuf, address: String) -> Self {
        let rpc_address = address.clone();
        Self::new(
            0,
            vec![Member {
                id: 0,
                address,
                rpc_address,
            }],
            data_dir,
        )
    }

    fn self_address(&self) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.id == self.replica_id)
            .map(|m| m.address.as_str())
    }
}

/// Current leadership as seen by this replica.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaderStatus {
    pub is_leader: bool,
    /// RPC-forwardable address of the leader, when one is known.
    pub leader_address: Option<String>,
    pub view: u64,
}

struct Submit {
    command: Command,
    reply: oneshot::Sender<LogResult<ApplyOutcome>>,
}

/// Cloneable handle to a running log replica.
#[derive(Clone)]
pub struct LogHandle {
    submit_tx: mpsc::Sender<Submit>,
    fsm: Arc<RwLock<Fsm>>,
    status_rx: watch::Receiver<LeaderStatus>,
    applied_rx: watch::Receiver<u64>,
}

impl LogHandle {
    /// Submits a command and waits for commit + apply.
    pub async fn submit(&self, command: Command, timeout: Duration) -> LogResult<ApplyOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit_tx
            .send(Submit {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LogError::Closed)?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LogError::Closed),
            Err(_) => Err(LogError::ApplyTimeout),
        }
    }

    /// Shared read access to the applied state.
    pub fn fsm(&self) -> Arc<RwLock<Fsm>> {
        Arc::clone(&self.fsm)
    }

    /// Leadership as of the last runtime tick.
    pub fn leader_status(&self) -> LeaderStatus {
        self.status_rx.borrow().clone()
    }

    /// Watches the applied index; useful for event-driven wakeups.
    pub fn subscribe_applied(&self) -> watch::Receiver<u64> {
        self.applied_rx.clone()
    }
}

/// Starts a log replica: recovers durable state, binds the peer listener,
/// and spawns the runtime task.
pub async fn start(config: LogConfig) -> LogResult<LogHandle> {
    let mut log_store = LogStore::open(&config.data_dir)?;
    let meta = log_store.load_meta()?;
    let snapshot = log_store.load_snapshot()?;
    let entries = log_store.load_entries()?;

    // Rebuild the FSM: snapshot first, then replay the committed tail.
    let (mut fsm, base, snapshot_bytes) = match snapshot {
        Some(s) => {
            let fsm = Fsm::from_bytes(&s.bytes)
                .map_err(|e| LogError::Io(std::io::Error::other(e.to_string())))?;
            (fsm, s.base, Some(s.bytes))
        }
        None => (Fsm::new(), OpNumber::ZERO, None),
    };
    for entry in &entries {
        if entry.op > base && entry.op <= meta.commit {
            // Rejections were deterministic the first time around too.
            let _ = fsm.apply(&entry.command);
        }
    }

    let member_count = config.members.len();
    let state = ReplicaState::restore(
        ReplicaId::new(config.replica_id),
        member_count,
        meta.view,
        base,
        snapshot_bytes,
        entries,
        meta.commit,
    );
    info!(
        replica = config.replica_id,
        members = member_count,
        view = %meta.view,
        commit = %meta.commit,
        "log replica recovered"
    );

    let fsm = Arc::new(RwLock::new(fsm));
    let (submit_tx, submit_rx) = mpsc::channel(256);
    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let (status_tx, status_rx) = watch::channel(LeaderStatus::default());
    let (applied_tx, applied_rx) = watch::channel(meta.commit.as_u64());

    // Peer listener.
    if member_count > 1 {
        let addr = config
            .self_address()
            .ok_or_else(|| {
                LogError::Io(std::io::Error::other("replica id missing from members"))
            })?
            .to_string();
        let listener = TcpListener::bind(&addr).await?;
        tokio::spawn(accept_loop(listener, inbound_tx.clone()));
    }

    // Peer outboxes.
    let mut peers: HashMap<ReplicaId, mpsc::Sender<Message>> = HashMap::new();
    for member in &config.members {
        if member.id == config.replica_id {
            continue;
        }
        let (tx, rx) = mpsc::channel(1024);
        peers.insert(ReplicaId::new(member.id), tx);
        tokio::spawn(peer_loop(member.address.clone(), rx));
    }

    let runtime = Runtime {
        config,
        state,
        fsm: Arc::clone(&fsm),
        log_store,
        peers,
        waiters: HashMap::new(),
        status_tx,
        applied_tx,
        view_change_since: None,
    };
    tokio::spawn(runtime.run(submit_rx, inbound_rx));

    Ok(LogHandle {
        submit_tx,
        fsm,
        status_rx,
        applied_rx,
    })
}

struct Runtime {
    config: LogConfig,
    state: ReplicaState,
    fsm: Arc<RwLock<Fsm>>,
    log_store: LogStore,
    peers: HashMap<ReplicaId, mpsc::Sender<Message>>,
    /// Submitters awaiting commit, keyed by op number.
    waiters: HashMap<u64, oneshot::Sender<LogResult<ApplyOutcome>>>,
    status_tx: watch::Sender<LeaderStatus>,
    applied_tx: watch::Sender<u64>,
    view_change_since: Option<Instant>,
}

impl Runtime {
    async fn run(
        mut self,
        mut submit_rx: mpsc::Receiver<Submit>,
        mut inbound_rx: mpsc::Receiver<Message>,
    ) {
        // Stagger election timeouts so replicas do not race into
        // competing view changes after a leader failure.
        let election_timeout = self.config.election_timeout
            + Duration::from_millis(u64::from(self.config.replica_id) * 150)
            + Duration::from_millis(u64::from(rand::random::<u8>()) / 4);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_leader_contact = Instant::now();
        self.publish_status();

        loop {
            tokio::select! {
                submit = submit_rx.recv() => {
                    let Some(submit) = submit else { break };
                    self.handle_submit(submit);
                }
                message = inbound_rx.recv() => {
                    let Some(message) = message else { break };
                    if message.from == self.state.leader_of(self.state.view()) {
                        last_leader_contact = Instant::now();
                    }
                    let output = self.state.on_event(ReplicaEvent::Message(message));
                    self.execute(output);
                }
                _ = heartbeat.tick() => {
                    if self.state.is_leader() {
                        let output = self.state.on_event(
                            ReplicaEvent::Timeout(TimeoutKind::HeartbeatSend));
                        self.execute(output);
                    }
                }
                _ = tick.tick() => {
                    match self.state.status() {
                        Status::Normal => {
                            self.view_change_since = None;
                            if !self.state.is_leader()
                                && last_leader_contact.elapsed() > election_timeout
                            {
                                debug!(view = %self.state.view(), "leader silent, starting view change");
                                last_leader_contact = Instant::now();
                                let output = self.state.on_event(
                                    ReplicaEvent::Timeout(TimeoutKind::LeaderSilent));
                                self.execute(output);
                            }
                        }
                        Status::ViewChange => {
                            let since = *self
                                .view_change_since
                                .get_or_insert_with(Instant::now);
                            if since.elapsed() > 2 * election_timeout {
                                self.view_change_since = Some(Instant::now());
                                last_leader_contact = Instant::now();
                                let output = self.state.on_event(
                                    ReplicaEvent::Timeout(TimeoutKind::ViewChangeStalled));
                                self.execute(output);
                            }
                        }
                    }
                }
            }
        }
        debug!("log runtime stopped");
    }

    fn handle_submit(&mut self, submit: Submit) {
        match self.state.submit(submit.command) {
            Ok(accepted) => {
                self.waiters.insert(accepted.op.as_u64(), submit.reply);
                self.execute(accepted.output);
            }
            Err(SubmitRejected::NotLeader { leader }) => {
                let hint = self.address_of(leader);
                let _ = submit.reply.send(Err(LogError::NotLeader { hint }));
            }
            Err(SubmitRejected::ViewChangeInProgress) => {
                let error = if self
                    .view_change_since
                    .is_some_and(|since| since.elapsed() > QUORUM_LOST_AFTER)
                {
                    LogError::QuorumLost
                } else {
                    LogError::NotLeader { hint: None }
                };
                let _ = submit.reply.send(Err(error));
            }
        }
    }

    /// Runs effects in order, then sends messages, then refreshes the
    /// published status. Append-before-send is what makes PrepareOk a
    /// durability receipt.
    fn execute(&mut self, output: ReplicaOutput) {
        for effect in output.effects {
            if let Err(error) = self.run_effect(effect) {
                // Log I/O failures are fatal by policy: crash, restart,
                // rejoin with a clean recovery.
                tracing::error!(%error, "fatal log storage failure, aborting");
                std::process::abort();
            }
        }
        for message in output.messages {
            self.send(message);
        }
        self.fail_waiters_if_not_leader();
        self.publish_status();
    }

    fn run_effect(&mut self, effect: Effect) -> std::io::Result<()> {
        match effect {
            Effect::Append(entries) => self.log_store.append(&entries),
            Effect::ReplaceLog {
                snapshot_base,
                snapshot,
                entries,
            } => {
                if let Some(bytes) = snapshot {
                    let needs_install = {
                        let fsm = self.fsm.read().expect("fsm lock poisoned");
                        snapshot_base.as_u64() > fsm.applied_index()
                    };
                    if needs_install {
                        let restored = Fsm::from_bytes(&bytes)
                            .map_err(|e| std::io::Error::other(e.to_string()))?;
                        *self.fsm.write().expect("fsm lock poisoned") = restored;
                        let _ = self.applied_tx.send(snapshot_base.as_u64());
                    }
                    self.log_store.save_snapshot(&SnapshotFile {
                        base: snapshot_base,
                        bytes,
                    })?;
                }
                self.log_store.rewrite(&entries)
            }
            Effect::ApplyUpTo(commit) => {
                self.apply_up_to(commit)?;
                self.log_store.save_meta(&LogMeta {
                    view: self.state.view(),
                    commit: self.state.commit(),
                })?;
                self.maybe_snapshot()
            }
        }
    }

    fn apply_up_to(&mut self, commit: OpNumber) -> std::io::Result<()> {
        let from = {
            let fsm = self.fsm.read().expect("fsm lock poisoned");
            fsm.applied_index()
        };
        if commit.as_u64() <= from {
            return Ok(());
        }

        let pending: Vec<(u64, Command)> = (from + 1..=commit.as_u64())
            .filter_map(|op| {
                self.state
                    .entry_at(OpNumber::new(op))
                    .map(|e| (op, e.command.clone()))
            })
            .collect();

        for (op, command) in pending {
            let result = {
                let mut fsm = self.fsm.write().expect("fsm lock poisoned");
                fsm.apply(&command)
            };
            if let Some(reply) = self.waiters.remove(&op) {
                let _ = reply.send(result.map_err(LogError::InvalidCommand));
            }
        }
        let _ = self.applied_tx.send(commit.as_u64());
        Ok(())
    }

    /// Takes a snapshot and truncates the durable log once enough entries
    /// have applied since the last one.
    fn maybe_snapshot(&mut self) -> std::io::Result<()> {
        let applied = self.state.commit();
        if applied.as_u64() - self.state.snapshot_base().as_u64() < self.config.snapshot_interval {
            return Ok(());
        }
        let bytes = {
            let fsm = self.fsm.read().expect("fsm lock poisoned");
            fsm.to_bytes()
        };
        self.log_store.save_snapshot(&SnapshotFile {
            base: applied,
            bytes: bytes.clone(),
        })?;
        self.state.compact(bytes, applied);
        self.log_store.rewrite(self.state.tail())?;
        info!(base = %applied, "log compacted behind snapshot");
        Ok(())
    }

    fn send(&self, message: Message) {
        match message.to {
            Some(target) => {
                if let Some(tx) = self.peers.get(&target) {
                    if tx.try_send(message).is_err() {
                        debug!(peer = %target, "peer outbox full, dropping message");
                    }
                }
            }
            None => {
                for (peer, tx) in &self.peers {
                    if tx.try_send(message.clone()).is_err() {
                        debug!(peer = %peer, "peer outbox full, dropping message");
                    }
                }
            }
        }
    }

    /// Submissions accepted under a lost leadership can no longer resolve
    /// here; tell the callers to retry against the new leader.
    fn fail_waiters_if_not_leader(&mut self) {
        if self.state.is_leader() || self.waiters.is_empty() {
            return;
        }
        let hint = self
            .state
            .leader_hint()
            .and_then(|leader| self.address_of(leader));
        for (_, reply) in self.waiters.drain() {
            let _ = reply.send(Err(LogError::NotLeader { hint: hint.clone() }));
        }
    }

    /// The RPC address of `replica`, used for leader hints and forwarding.
    fn address_of(&self, replica: ReplicaId) -> Option<String> {
        self.config
            .members
            .iter()
            .find(|m| m.id == replica.as_u8())
            .map(|m| m.rpc_address.clone())
    }

    fn publish_status(&self) {
        let status = LeaderStatus {
            is_leader: self.state.is_leader(),
            leader_address: self
                .state
                .leader_hint()
                .and_then(|leader| self.address_of(leader)),
            view: self.state.view().as_u64(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

// ----------------------------------------------------------------------
// Peer transport: length-prefixed postcard frames over TCP
// ----------------------------------------------------------------------

async fn accept_loop(listener: TcpListener, inbound_tx: mpsc::Sender<Message>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "peer connected");
                tokio::spawn(read_loop(stream, inbound_tx.clone()));
            }
            Err(error) => {
                warn!(%error, "peer accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Snapshots travel on this link, so the ceiling is generous.
const MAX_PEER_FRAME: usize = 256 * 1024 * 1024;

async fn read_loop(mut stream: TcpStream, inbound_tx: mpsc::Sender<Message>) {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_PEER_FRAME {
            warn!(len, "oversized peer frame, closing link");
            return;
        }
        let mut buf = vec![0u8; len];
        if stream.read_exact(&mut buf).await.is_err() {
            return;
        }
        match Message::from_bytes(&buf) {
            Ok(message) => {
                if inbound_tx.send(message).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                warn!(%error, "undecodable peer frame, closing link");
                return;
            }
        }
    }
}

/// Maintains one outgoing link, reconnecting with backoff. Messages that
/// race a broken link are dropped; the protocol retransmits.
async fn peer_loop(address: String, mut outbox: mpsc::Receiver<Message>) {
    let mut backoff = Duration::from_millis(250);
    loop {
        let mut stream = match TcpStream::connect(&address).await {
            Ok(stream) => {
                backoff = Duration::from_millis(250);
                stream
            }
            Err(_) => {
                // Drain anything queued while unreachable so the outbox
                // never wedges the runtime.
                while outbox.try_recv().is_ok() {}
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
                continue;
            }
        };

        loop {
            let Some(message) = outbox.recv().await else {
                // Runtime gone; this link is done.
                return;
            };
            let bytes = message.to_bytes();
            let len = (bytes.len() as u32).to_le_bytes();
            if stream.write_all(&len).await.is_err() || stream.write_all(&bytes).await.is_err() {
                // Message lost with the link; reconnect and move on.
                break;
            }
        }
    }
}
