//! Raft consensus group
//!
//! A single worker task owns the `RawNode`. Client calls, peer messages and
//! the logical clock all funnel into it through channels, so the Ready
//! loop, the apply path and snapshotting never run concurrently.
//!
//! Ready handling follows the raft-rs order: send messages, install any
//! snapshot, apply committed entries, append new entries, persist hard
//! state, send persisted messages, advance, then repeat for the light
//! ready.

use crate::common::config::RaftConfig;
use crate::common::hash::raft_id;
use crate::common::metrics::METRICS;
use crate::common::{Error, Result};
use crate::consensus::log_store::LogStore;
use crate::consensus::snapshot::{SnapshotStore, StoredSnapshot};
use crate::consensus::transport::{Envelope, Transport};
use crate::consensus::wal::Wal;
use crate::consensus::{ClusterNode, CommitInfo, ConsensusGroup, Role, StateMachine};
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfChangeV2, ConfState, Config, Entry, EntryType, Message,
    RawNode, Snapshot,
};
use raft::{StateRole, Storage};
use serde::{Deserialize, Serialize};
use slog::{o, Logger};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STARTUP_RESTORE_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF_START: Duration = Duration::from_millis(100);
const PERSIST_BACKOFF_MAX: Duration = Duration::from_secs(10);
const REQUEST_QUEUE: usize = 1024;
const BOOTSTRAP_INDEX: u64 = 1;
const BOOTSTRAP_TERM: u64 = 1;

pub struct RaftGroupConfig {
    pub node: ClusterNode,
    /// Snapshots go to `<data_dir>/snapshots`, the raft log to `<data_dir>/raft`
    pub data_dir: PathBuf,
    /// Form a new single-voter cluster if `data_dir` holds no raft state.
    /// Otherwise restore it, or wait to be added by an existing leader.
    pub bootstrap: bool,
    pub raft: RaftConfig,
}

/// Point-in-time view of the group, refreshed after every worker step.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub role: Role,
    pub term: u64,
    pub leader: Option<ClusterNode>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub snapshot_index: u64,
    pub halted: Option<String>,
}

/// Snapshot payload: the member address book plus state machine bytes.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    members: Vec<ClusterNode>,
    state: Vec<u8>,
}

enum MembershipChange {
    Add(ClusterNode),
    Remove(String),
}

enum Request {
    Propose {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<CommitInfo>>,
    },
    ChangeMembership {
        change: MembershipChange,
        reply: oneshot::Sender<Result<CommitInfo>>,
    },
    Configuration {
        reply: oneshot::Sender<Result<Vec<ClusterNode>>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<u64>>,
    },
    Shutdown,
}

pub struct RaftGroup {
    local: ClusterNode,
    requests: mpsc::Sender<Request>,
    inbox: mpsc::UnboundedSender<Envelope>,
    status: Arc<RwLock<GroupStatus>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RaftGroup {
    /// Restore from the newest snapshot and the raft log under `data_dir`
    /// (or bootstrap) and start the worker.
    pub async fn open(
        config: RaftGroupConfig,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let id = raft_id(&config.node.id);
        let snapshots = SnapshotStore::open(
            config.data_dir.join("snapshots"),
            config.raft.snapshot_retain,
        )?;

        let (wal, records) = Wal::open(config.data_dir.join("raft"))?;

        let mut members = BTreeMap::new();
        let (base, fresh) = match load_latest(&snapshots).await? {
            Some(stored) => {
                let payload = decode_payload(&stored.data)?;
                state_machine.restore(stored.index, &payload.state)?;
                for member in payload.members {
                    members.insert(raft_id(&member.id), member);
                }
                METRICS.snapshots_restored.inc();
                info!(
                    node = %config.node.id,
                    index = stored.index,
                    term = stored.term,
                    voters = stored.voters.len(),
                    "Restored from snapshot"
                );
                (Some(stored), false)
            }
            None if config.bootstrap && records.is_empty() => {
                let stored = bootstrap_snapshot(&config.node, state_machine.as_ref())?;
                let state = decode_payload(&stored.data)?.state;
                state_machine.restore(stored.index, &state)?;
                snapshots.save(&stored)?;
                info!(node = %config.node.id, "Bootstrapped new cluster");
                (Some(stored), true)
            }
            None => {
                if config.bootstrap {
                    warn!(
                        node = %config.node.id,
                        dir = %config.data_dir.display(),
                        "Raft log present without a snapshot, waiting for a leader instead of bootstrapping"
                    );
                }
                (None, false)
            }
        };
        let snapshot_index = base.as_ref().map(|s| s.index).unwrap_or(0);
        let storage = LogStore::recover(wal, records, base.as_ref().map(to_raft_snapshot))?;
        // Our own address may have changed since the snapshot was cut.
        members.insert(id, config.node.clone());

        let raft_config = Config {
            id,
            election_tick: config.raft.election_tick,
            heartbeat_tick: config.raft.heartbeat_tick,
            max_inflight_msgs: 256,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        raft_config.validate()?;

        let logger = Logger::root(slog::Discard, o!());
        let mut raw = RawNode::new(&raft_config, storage.clone(), &logger)?;
        if fresh {
            raw.campaign()?;
        }

        let status = Arc::new(RwLock::new(GroupStatus {
            role: Role::Follower,
            term: raw.raft.term,
            leader: None,
            commit_index: snapshot_index,
            applied_index: snapshot_index,
            snapshot_index,
            halted: None,
        }));
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            id,
            local: config.node.clone(),
            raw,
            storage,
            state_machine,
            transport,
            snapshots,
            members,
            requests: requests_rx,
            inbox: inbox_rx,
            pending: HashMap::new(),
            pending_conf_change: None,
            status: status.clone(),
            role: StateRole::Follower,
            applied: snapshot_index,
            snapshot_index,
            snapshot_threshold: config.raft.snapshot_threshold,
            unpersisted: None,
            conf_changed: false,
            tick_interval: config.raft.tick_interval(),
        };
        info!(
            node = %config.node.id,
            raft_id = format_args!("{:016x}", id),
            address = %config.node.address,
            bootstrap = config.bootstrap,
            "Consensus group started"
        );
        let handle = tokio::spawn(worker.run());

        Ok(Self {
            local: config.node,
            requests: requests_tx,
            inbox: inbox_tx,
            status,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn status(&self) -> GroupStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sender that feeds peer messages into this group.
    pub fn inbox(&self) -> mpsc::UnboundedSender<Envelope> {
        self.inbox.clone()
    }

    pub fn deliver(&self, envelope: Envelope) {
        let _ = self.inbox.send(envelope);
    }

    /// Cut a snapshot at the current applied index. Returns that index.
    pub async fn snapshot_now(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.call(Request::Snapshot { reply: tx }, rx, Duration::from_secs(30))
            .await
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn call<T>(
        &self,
        request: Request,
        rx: oneshot::Receiver<Result<T>>,
        timeout: Duration,
    ) -> Result<T> {
        if let Some(reason) = self.status().halted {
            return Err(Error::Halted(reason));
        }
        if self.requests.send(request).await.is_err() {
            return Err(self.stopped());
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.stopped()),
            Err(_) => Err(Error::ApplyTimeout(timeout)),
        }
    }

    fn stopped(&self) -> Error {
        Error::Halted(
            self.status()
                .halted
                .unwrap_or_else(|| "consensus worker stopped".to_string()),
        )
    }
}

impl ConsensusGroup for RaftGroup {
    fn local_node(&self) -> &ClusterNode {
        &self.local
    }

    fn role(&self) -> Role {
        self.status().role
    }

    fn leader(&self) -> Option<ClusterNode> {
        self.status().leader
    }

    async fn apply(&self, command: Vec<u8>, timeout: Duration) -> Result<CommitInfo> {
        let (tx, rx) = oneshot::channel();
        self.call(
            Request::Propose {
                data: command,
                reply: tx,
            },
            rx,
            timeout,
        )
        .await
    }

    async fn configuration(&self) -> Result<Vec<ClusterNode>> {
        let (tx, rx) = oneshot::channel();
        self.call(Request::Configuration { reply: tx }, rx, Duration::from_secs(5))
            .await
    }

    async fn add_voter(&self, node: ClusterNode, timeout: Duration) -> Result<CommitInfo> {
        let (tx, rx) = oneshot::channel();
        self.call(
            Request::ChangeMembership {
                change: MembershipChange::Add(node),
                reply: tx,
            },
            rx,
            timeout,
        )
        .await
    }

    async fn remove_server(&self, node_id: String, timeout: Duration) -> Result<CommitInfo> {
        let (tx, rx) = oneshot::channel();
        self.call(
            Request::ChangeMembership {
                change: MembershipChange::Remove(node_id),
                reply: tx,
            },
            rx,
            timeout,
        )
        .await
    }
}

/// A snapshot that is in memory but not yet on disk.
struct Unpersisted {
    snapshot: StoredSnapshot,
    retry_at: Instant,
    backoff: Duration,
}

struct Worker {
    id: u64,
    local: ClusterNode,
    raw: RawNode<LogStore>,
    storage: LogStore,
    state_machine: Arc<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    snapshots: SnapshotStore,
    /// Raft id to address. Learned from conf changes, snapshots and inbound
    /// envelopes.
    members: BTreeMap<u64, ClusterNode>,
    requests: mpsc::Receiver<Request>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    pending: HashMap<Uuid, oneshot::Sender<Result<CommitInfo>>>,
    pending_conf_change: Option<Uuid>,
    status: Arc<RwLock<GroupStatus>>,
    role: StateRole,
    applied: u64,
    snapshot_index: u64,
    snapshot_threshold: u64,
    unpersisted: Option<Unpersisted>,
    /// A conf change was applied since the last snapshot.
    conf_changed: bool,
    tick_interval: Duration,
}

impl Worker {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
                Some(envelope) = self.inbox.recv() => self.handle_message(envelope),
                _ = ticker.tick() => {
                    self.raw.tick();
                }
            }

            if let Err(e) = self.drive() {
                self.halt(e);
                return;
            }
        }

        self.fail_pending(|| Error::Halted("consensus group shut down".to_string()));
        info!(node = %self.local.id, applied = self.applied, "Consensus worker stopped");
    }

    fn drive(&mut self) -> Result<()> {
        while self.raw.has_ready() {
            self.on_ready()?;
        }
        // Joining voters restore from the served snapshot, which must list them.
        if std::mem::take(&mut self.conf_changed) {
            if let Err(e) = self.take_snapshot() {
                METRICS.snapshot_failures.inc();
                warn!(node = %self.local.id, error = %e, "Snapshot after membership change failed");
            }
        }
        self.track_role();
        self.maybe_snapshot();
        self.publish_status();
        Ok(())
    }

    fn on_ready(&mut self) -> Result<()> {
        let mut ready = self.raw.ready();

        self.send(ready.take_messages());

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.install_snapshot(snapshot)?;
        }

        let committed = ready.take_committed_entries();
        self.apply_entries(committed)?;

        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            self.storage.set_hardstate(hs.clone())?;
        }
        self.storage.sync()?;
        self.send(ready.take_persisted_messages());

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.storage.set_commit(commit)?;
        }
        self.send(light.take_messages());
        let committed = light.take_committed_entries();
        self.apply_entries(committed)?;
        self.raw.advance_apply();
        Ok(())
    }

    fn handle_message(&mut self, envelope: Envelope) {
        let from = envelope.message.from;
        if from != 0 && from != self.id {
            self.members.insert(from, envelope.from);
        }
        if let Err(e) = self.raw.step(envelope.message) {
            debug!(node = %self.local.id, error = %e, "Ignoring raft message");
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Propose { data, reply } => {
                if let Err(e) = self.ensure_leader() {
                    let _ = reply.send(Err(e));
                    return;
                }
                let id = Uuid::new_v4();
                match self.raw.propose(id.as_bytes().to_vec(), data) {
                    Ok(()) => {
                        self.pending.insert(id, reply);
                    }
                    Err(raft::Error::ProposalDropped) => {
                        let _ = reply.send(Err(self.not_leader()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            Request::ChangeMembership { change, reply } => self.propose_membership(change, reply),
            Request::Configuration { reply } => {
                let _ = reply.send(self.configuration());
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(self.take_snapshot());
            }
            Request::Shutdown => {}
        }
    }

    fn propose_membership(
        &mut self,
        change: MembershipChange,
        reply: oneshot::Sender<Result<CommitInfo>>,
    ) {
        if let Err(e) = self.ensure_leader() {
            let _ = reply.send(Err(e));
            return;
        }
        // raft-rs silently turns a second in-flight conf change into a no-op.
        if self.pending_conf_change.is_some() {
            let _ = reply.send(Err(Error::Membership(
                "another membership change is in progress".to_string(),
            )));
            return;
        }

        let mut cc = ConfChange::default();
        let node = match change {
            MembershipChange::Add(node) => {
                cc.set_change_type(ConfChangeType::AddNode);
                node
            }
            MembershipChange::Remove(node_id) => {
                cc.set_change_type(ConfChangeType::RemoveNode);
                let id = raft_id(&node_id);
                self.members
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| ClusterNode::new(node_id, ""))
            }
        };
        cc.node_id = raft_id(&node.id);
        match bincode::serialize(&node) {
            Ok(context) => cc.context = context.into(),
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        }

        let id = Uuid::new_v4();
        match self.raw.propose_conf_change(id.as_bytes().to_vec(), cc) {
            Ok(()) => {
                debug!(node = %self.local.id, target = %node, "Proposed membership change");
                self.pending.insert(id, reply);
                self.pending_conf_change = Some(id);
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            match entry.entry_type() {
                EntryType::EntryNormal => self.apply_normal(&entry)?,
                EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                EntryType::EntryConfChangeV2 => {
                    let cc = ConfChangeV2::decode(&entry.data[..]).map_err(|e| {
                        Error::MalformedCommand(format!("conf change at {}: {}", entry.index, e))
                    })?;
                    let cs = self.raw.apply_conf_change(&cc)?;
                    self.storage.set_conf_state(cs);
                    self.conf_changed = true;
                }
            }
            self.applied = entry.index;
        }
        Ok(())
    }

    fn apply_normal(&mut self, entry: &Entry) -> Result<()> {
        // New leaders append an empty entry.
        if entry.data.is_empty() {
            return Ok(());
        }
        let outcome = self.state_machine.apply(entry.index, &entry.data)?;
        METRICS.entries_applied.inc();
        tracing::trace!(index = outcome.index, op = outcome.op, "Applied");
        self.resolve(
            &entry.context,
            Ok(CommitInfo {
                index: entry.index,
                term: entry.term,
            }),
        );
        Ok(())
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<()> {
        let cc = ConfChange::decode(&entry.data[..]).map_err(|e| {
            Error::MalformedCommand(format!("conf change at {}: {}", entry.index, e))
        })?;
        let node = member_context(&self.local.id, entry.index, &cc.context);

        match self.raw.apply_conf_change(&cc) {
            Ok(cs) => {
                self.storage.set_conf_state(cs);
                self.conf_changed = true;
                match cc.change_type() {
                    ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                        if let Some(node) = node {
                            info!(node = %self.local.id, member = %node, index = entry.index, "Member added");
                            self.members.insert(cc.node_id, node);
                        }
                    }
                    ConfChangeType::RemoveNode => {
                        if cc.node_id != self.id {
                            self.members.remove(&cc.node_id);
                        }
                        info!(
                            node = %self.local.id,
                            member = node.as_ref().map(|n| n.id.as_str()).unwrap_or("?"),
                            index = entry.index,
                            "Member removed"
                        );
                    }
                }
                METRICS.conf_changes_applied.inc();
                self.resolve(
                    &entry.context,
                    Ok(CommitInfo {
                        index: entry.index,
                        term: entry.term,
                    }),
                );
            }
            Err(e) => {
                warn!(node = %self.local.id, error = %e, index = entry.index, "Rejected membership change");
                self.resolve(&entry.context, Err(e.into()));
            }
        }
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let stored = to_stored(&snapshot);
        let payload = decode_payload(&stored.data)?;
        self.state_machine.restore(stored.index, &payload.state)?;
        for member in payload.members {
            self.members.insert(raft_id(&member.id), member);
        }
        self.members.insert(self.id, self.local.clone());
        self.storage.apply_snapshot(snapshot)?;

        self.applied = stored.index;
        self.snapshot_index = stored.index;
        METRICS.snapshots_restored.inc();
        info!(node = %self.local.id, index = stored.index, term = stored.term, "Installed snapshot from leader");

        self.persist(stored, PERSIST_BACKOFF_START);
        Ok(())
    }

    fn maybe_snapshot(&mut self) {
        self.retry_persist();

        if self.snapshot_threshold == 0
            || self.applied.saturating_sub(self.snapshot_index) < self.snapshot_threshold
        {
            return;
        }
        if let Err(e) = self.take_snapshot() {
            METRICS.snapshot_failures.inc();
            warn!(node = %self.local.id, error = %e, "Snapshot failed");
        }
    }

    fn take_snapshot(&mut self) -> Result<u64> {
        if self.applied == 0 || self.applied == self.snapshot_index {
            return Ok(self.snapshot_index);
        }

        let index = self.applied;
        let term = self.storage.term(index)?;
        let state = self.state_machine.snapshot()?;
        let cs = self.storage.conf_state()?;
        let payload = SnapshotPayload {
            members: self.members.values().cloned().collect(),
            state: state.data,
        };
        let stored = StoredSnapshot {
            index,
            term,
            voters: cs.voters.clone(),
            learners: cs.learners.clone(),
            data: bincode::serialize(&payload)?,
        };

        self.storage.compact_to(to_raft_snapshot(&stored))?;
        self.snapshot_index = index;
        METRICS.snapshots_created.inc();
        info!(node = %self.local.id, index, term, "Snapshot taken, log compacted");

        self.persist(stored, PERSIST_BACKOFF_START);
        Ok(index)
    }

    fn persist(&mut self, snapshot: StoredSnapshot, backoff: Duration) {
        match self.snapshots.save(&snapshot) {
            Ok(_) => {
                self.unpersisted = None;
                if let Err(e) = self.storage.rewrite_log() {
                    warn!(node = %self.local.id, index = snapshot.index, error = %e, "Raft log rewrite failed");
                }
            }
            Err(e) => {
                METRICS.snapshot_failures.inc();
                warn!(
                    node = %self.local.id,
                    index = snapshot.index,
                    error = %e,
                    retry_in = ?backoff,
                    "Snapshot persist failed"
                );
                self.unpersisted = Some(Unpersisted {
                    snapshot,
                    retry_at: Instant::now() + backoff,
                    backoff,
                });
            }
        }
    }

    fn retry_persist(&mut self) {
        let Some(pending) = self.unpersisted.take() else {
            return;
        };
        if Instant::now() < pending.retry_at {
            self.unpersisted = Some(pending);
            return;
        }
        let next = (pending.backoff * 2).min(PERSIST_BACKOFF_MAX);
        self.persist(pending.snapshot, next);
    }

    fn configuration(&self) -> Result<Vec<ClusterNode>> {
        let cs = self.storage.conf_state()?;
        let mut voters: Vec<ClusterNode> = cs.voters.iter().map(|id| self.member(*id)).collect();
        voters.sort();
        Ok(voters)
    }

    fn member(&self, id: u64) -> ClusterNode {
        self.members
            .get(&id)
            .cloned()
            .unwrap_or_else(|| ClusterNode::new(format!("{:016x}", id), ""))
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.raw.raft.state == StateRole::Leader {
            Ok(())
        } else {
            Err(self.not_leader())
        }
    }

    fn not_leader(&self) -> Error {
        let leader_id = self.raw.raft.leader_id;
        let hint = match self.members.get(&leader_id) {
            Some(leader) if leader_id != 0 && !leader.address.is_empty() => leader.address.clone(),
            _ => "unknown".to_string(),
        };
        Error::NotLeader(hint)
    }

    fn resolve(&mut self, context: &[u8], result: Result<CommitInfo>) {
        let Ok(id) = Uuid::from_slice(context) else {
            return;
        };
        if self.pending_conf_change == Some(id) {
            self.pending_conf_change = None;
        }
        if let Some(reply) = self.pending.remove(&id) {
            let _ = reply.send(result);
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> Error) {
        self.pending_conf_change = None;
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err()));
        }
    }

    fn track_role(&mut self) {
        let role = self.raw.raft.state;
        if role == self.role {
            return;
        }
        info!(
            node = %self.local.id,
            from = ?self.role,
            to = ?role,
            term = self.raw.raft.term,
            "Role changed"
        );
        if self.role == StateRole::Leader {
            self.fail_pending(|| Error::LeadershipLost);
        }
        self.role = role;
    }

    fn publish_status(&self) {
        let raft = &self.raw.raft;
        let leader = match raft.leader_id {
            0 => None,
            id => Some(self.member(id)),
        };
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        status.role = to_role(raft.state);
        status.term = raft.term;
        status.leader = leader;
        status.commit_index = raft.raft_log.committed;
        status.applied_index = self.applied;
        status.snapshot_index = self.snapshot_index;
    }

    fn halt(&mut self, e: Error) {
        error!(node = %self.local.id, error = %e, applied = self.applied, "Apply loop halted");
        METRICS.apply_halted.set(1);
        let reason = e.to_string();
        self.status
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .halted = Some(reason.clone());
        self.fail_pending(|| Error::Halted(reason.clone()));
    }

    fn send(&self, messages: Vec<Message>) {
        for message in messages {
            match self.members.get(&message.to) {
                Some(peer) if !peer.address.is_empty() => {
                    self.transport.send(
                        peer,
                        Envelope {
                            from: self.local.clone(),
                            message,
                        },
                    );
                }
                _ => debug!(node = %self.local.id, to = message.to, "No address for raft peer"),
            }
        }
    }
}

fn to_role(state: StateRole) -> Role {
    match state {
        StateRole::Leader => Role::Leader,
        StateRole::Candidate | StateRole::PreCandidate => Role::Candidate,
        StateRole::Follower => Role::Follower,
    }
}

async fn load_latest(store: &SnapshotStore) -> Result<Option<StoredSnapshot>> {
    let mut delay = PERSIST_BACKOFF_START;
    let mut attempt = 1;
    loop {
        match store.latest() {
            Ok(snapshot) => return Ok(snapshot),
            Err(e) if attempt < STARTUP_RESTORE_ATTEMPTS => {
                warn!(dir = %store.dir().display(), attempt, error = %e, "Snapshot restore failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => {
                METRICS.snapshot_failures.inc();
                return Err(e);
            }
        }
    }
}

/// Initial state of a new cluster: `node` as the only voter at index 1.
///
/// Starting the log above zero means joiners always receive a snapshot
/// first, so every member agrees on the initial configuration.
fn bootstrap_snapshot(node: &ClusterNode, state_machine: &dyn StateMachine) -> Result<StoredSnapshot> {
    let payload = SnapshotPayload {
        members: vec![node.clone()],
        state: state_machine.snapshot()?.data,
    };
    Ok(StoredSnapshot {
        index: BOOTSTRAP_INDEX,
        term: BOOTSTRAP_TERM,
        voters: vec![raft_id(&node.id)],
        learners: Vec::new(),
        data: bincode::serialize(&payload)?,
    })
}

/// The member carried in a conf change context, if it decodes.
fn member_context(local: &str, index: u64, context: &[u8]) -> Option<ClusterNode> {
    match bincode::deserialize::<ClusterNode>(context) {
        Ok(node) => Some(node),
        Err(e) => {
            warn!(node = %local, index, error = %e, "Undecodable membership change context");
            None
        }
    }
}

fn decode_payload(data: &[u8]) -> Result<SnapshotPayload> {
    bincode::deserialize(data)
        .map_err(|e| Error::SnapshotIo(format!("decode snapshot payload: {}", e)))
}

fn to_raft_snapshot(stored: &StoredSnapshot) -> Snapshot {
    let mut snapshot = Snapshot::default();
    snapshot.data = stored.data.clone().into();
    let meta = snapshot.mut_metadata();
    meta.index = stored.index;
    meta.term = stored.term;
    meta.set_conf_state(ConfState::from((
        stored.voters.clone(),
        stored.learners.clone(),
    )));
    snapshot
}

fn to_stored(snapshot: &Snapshot) -> StoredSnapshot {
    let meta = snapshot.get_metadata();
    let cs = meta.get_conf_state();
    StoredSnapshot {
        index: meta.index,
        term: meta.term,
        voters: cs.voters.clone(),
        learners: cs.learners.clone(),
        data: snapshot.data.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::transport::LocalRouter;
    use crate::consensus::{ApplyOutcome, StateSnapshot};
    use std::sync::Mutex as StdMutex;

    /// Appends every command to a list.
    #[derive(Default)]
    struct RecordingMachine {
        inner: StdMutex<(u64, Vec<String>)>,
    }

    impl RecordingMachine {
        fn entries(&self) -> Vec<String> {
            self.inner.lock().unwrap().1.clone()
        }
    }

    impl StateMachine for RecordingMachine {
        fn apply(&self, index: u64, data: &[u8]) -> Result<ApplyOutcome> {
            let mut inner = self.inner.lock().unwrap();
            if data == b"poison" {
                return Err(Error::MalformedCommand("poison".into()));
            }
            inner.0 = index;
            inner.1.push(String::from_utf8_lossy(data).into_owned());
            Ok(ApplyOutcome { index, op: "append" })
        }

        fn snapshot(&self) -> Result<StateSnapshot> {
            let inner = self.inner.lock().unwrap();
            Ok(StateSnapshot {
                index: inner.0,
                data: serde_json::to_vec(&inner.1).unwrap(),
            })
        }

        fn restore(&self, index: u64, data: &[u8]) -> Result<()> {
            let entries: Vec<String> = serde_json::from_slice(data).unwrap();
            *self.inner.lock().unwrap() = (index, entries);
            Ok(())
        }

        fn applied_index(&self) -> u64 {
            self.inner.lock().unwrap().0
        }
    }

    fn fast_config(node: ClusterNode, dir: &std::path::Path, bootstrap: bool) -> RaftGroupConfig {
        RaftGroupConfig {
            node,
            data_dir: dir.to_path_buf(),
            bootstrap,
            raft: RaftConfig {
                tick_interval_ms: 10,
                snapshot_threshold: 0,
                ..RaftConfig::default()
            },
        }
    }

    async fn wait_for_leader(group: &RaftGroup) {
        for _ in 0..200 {
            if group.is_leader() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }

    #[tokio::test]
    async fn test_single_node_apply_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(LocalRouter::new());
        let node = ClusterNode::new("solo", "solo:1");

        let machine = Arc::new(RecordingMachine::default());
        let group = RaftGroup::open(
            fast_config(node.clone(), dir.path(), true),
            machine.clone(),
            router.clone(),
        )
        .await
        .unwrap();
        wait_for_leader(&group).await;

        let first = group.apply(b"a".to_vec(), Duration::from_secs(2)).await.unwrap();
        let second = group.apply(b"b".to_vec(), Duration::from_secs(2)).await.unwrap();
        assert!(second.index > first.index);
        assert_eq!(machine.entries(), vec!["a", "b"]);

        let snap_index = group.snapshot_now().await.unwrap();
        assert_eq!(snap_index, second.index);
        group.shutdown().await;

        let restored = Arc::new(RecordingMachine::default());
        let group = RaftGroup::open(
            fast_config(node.clone(), dir.path(), true),
            restored.clone(),
            router,
        )
        .await
        .unwrap();
        assert_eq!(restored.entries(), vec!["a", "b"]);
        assert_eq!(restored.applied_index(), second.index);
        assert_eq!(group.status().snapshot_index, second.index);

        wait_for_leader(&group).await;
        let third = group.apply(b"c".to_vec(), Duration::from_secs(2)).await.unwrap();
        assert!(third.index > second.index);
        assert_eq!(group.configuration().await.unwrap(), vec![node]);
        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_follower_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(LocalRouter::new());
        let group = RaftGroup::open(
            fast_config(ClusterNode::new("joiner", "joiner:1"), dir.path(), false),
            Arc::new(RecordingMachine::default()),
            router,
        )
        .await
        .unwrap();

        let err = group
            .apply(b"x".to_vec(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotLeader(ref hint) if hint == "unknown"));
        assert_eq!(group.role(), Role::Follower);
        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_fatal_apply_error_halts_group() {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(LocalRouter::new());
        let group = RaftGroup::open(
            fast_config(ClusterNode::new("solo", "solo:1"), dir.path(), true),
            Arc::new(RecordingMachine::default()),
            router,
        )
        .await
        .unwrap();
        wait_for_leader(&group).await;

        let err = group
            .apply(b"poison".to_vec(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Halted(_)));
        assert!(group.status().halted.is_some());

        let err = group
            .apply(b"ok".to_vec(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Halted(_)));
    }

    #[tokio::test]
    async fn test_restart_before_first_snapshot_replays_log() {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(LocalRouter::new());
        let node = ClusterNode::new("solo", "solo:1");

        let group = RaftGroup::open(
            fast_config(node.clone(), dir.path(), true),
            Arc::new(RecordingMachine::default()),
            router.clone(),
        )
        .await
        .unwrap();
        wait_for_leader(&group).await;
        let first = group.apply(b"a".to_vec(), Duration::from_secs(2)).await.unwrap();
        let second = group.apply(b"b".to_vec(), Duration::from_secs(2)).await.unwrap();
        assert_eq!(group.status().snapshot_index, BOOTSTRAP_INDEX);
        group.shutdown().await;

        let restored = Arc::new(RecordingMachine::default());
        let group = RaftGroup::open(
            fast_config(node.clone(), dir.path(), true),
            restored.clone(),
            router,
        )
        .await
        .unwrap();
        for _ in 0..200 {
            if restored.applied_index() >= second.index {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(restored.entries(), vec!["a", "b"]);
        assert!(second.index > first.index);
        assert_eq!(group.status().snapshot_index, BOOTSTRAP_INDEX);

        wait_for_leader(&group).await;
        let third = group.apply(b"c".to_vec(), Duration::from_secs(2)).await.unwrap();
        assert!(third.index > second.index);
        assert_eq!(restored.entries(), vec!["a", "b", "c"]);
        assert_eq!(group.configuration().await.unwrap(), vec![node]);
        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_log_without_snapshot_does_not_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(LocalRouter::new());
        let node = ClusterNode::new("solo", "solo:1");

        let group = RaftGroup::open(
            fast_config(node.clone(), dir.path(), true),
            Arc::new(RecordingMachine::default()),
            router.clone(),
        )
        .await
        .unwrap();
        wait_for_leader(&group).await;
        group.apply(b"a".to_vec(), Duration::from_secs(2)).await.unwrap();
        group.shutdown().await;

        std::fs::remove_dir_all(dir.path().join("snapshots")).unwrap();
        let group = RaftGroup::open(
            fast_config(node, dir.path(), true),
            Arc::new(RecordingMachine::default()),
            router,
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(group.role(), Role::Follower);
        assert_eq!(group.status().snapshot_index, 0);
        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_membership_change_cuts_snapshot_listing_new_voter() {
        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(LocalRouter::new());
        let group = RaftGroup::open(
            fast_config(ClusterNode::new("solo", "solo:1"), dir.path(), true),
            Arc::new(RecordingMachine::default()),
            router,
        )
        .await
        .unwrap();
        wait_for_leader(&group).await;

        let added = group
            .add_voter(ClusterNode::new("peer", "peer:1"), Duration::from_secs(2))
            .await
            .unwrap();
        for _ in 0..200 {
            if group.status().snapshot_index >= added.index {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(group.status().snapshot_index, added.index);

        let stored = SnapshotStore::open(dir.path().join("snapshots"), 3)
            .unwrap()
            .latest()
            .unwrap()
            .unwrap();
        assert_eq!(stored.index, added.index);
        assert!(stored.voters.contains(&raft_id("peer")));
        let payload = decode_payload(&stored.data).unwrap();
        assert!(payload.members.contains(&ClusterNode::new("peer", "peer:1")));
        group.shutdown().await;
    }

    #[test]
    fn test_member_context_tolerates_garbage() {
        let node = ClusterNode::new("peer", "peer:1");
        let context = bincode::serialize(&node).unwrap();
        assert_eq!(member_context("solo", 4, &context), Some(node));
        assert_eq!(member_context("solo", 5, b"\xff"), None);
        assert_eq!(member_context("solo", 6, &[]), None);
    }
}
