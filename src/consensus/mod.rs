//! Consensus group integration
//!
//! The rest of the crate talks to consensus through [`ConsensusGroup`] and
//! hands it a [`StateMachine`]. [`RaftGroup`] is the shipped implementation:
//! one worker task owns a tikv/raft `RawNode`, applies committed entries in
//! order and cuts snapshots for log truncation.

pub mod log_store;
pub mod raft_node;
pub mod snapshot;
pub mod transport;
pub mod wal;

pub use raft_node::{GroupStatus, RaftGroup, RaftGroupConfig};
pub use snapshot::{SnapshotStore, StoredSnapshot};
pub use transport::{Envelope, HttpTransport, LocalRouter, Transport};

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// A cluster member as consensus and gossip see it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub address: String,
}

impl ClusterNode {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl std::fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Position of a committed and applied entry in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub index: u64,
    pub term: u64,
}

/// Result of applying one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub index: u64,
    pub op: &'static str,
}

/// State machine contents as of one log index.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub index: u64,
    pub data: Vec<u8>,
}

/// Deterministic consumer of the committed log.
///
/// `apply` is called once per normal entry, strictly in commit order, from a
/// single task. An error from `apply` stops the apply loop for good.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, index: u64, data: &[u8]) -> Result<ApplyOutcome>;

    /// Capture the state at the last applied index. Must not interleave
    /// with `apply`.
    fn snapshot(&self) -> Result<StateSnapshot>;

    /// Replace the whole state with `data`, taken at `index`.
    fn restore(&self, index: u64, data: &[u8]) -> Result<()>;

    fn applied_index(&self) -> u64;
}

/// Leader election, log replication and membership, as the coordinator
/// needs them.
pub trait ConsensusGroup: Send + Sync + 'static {
    fn local_node(&self) -> &ClusterNode;

    fn role(&self) -> Role;

    /// Current leader, if known.
    fn leader(&self) -> Option<ClusterNode>;

    fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Propose `command` and wait until it is committed and applied locally.
    fn apply(
        &self,
        command: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<CommitInfo>> + Send;

    /// Current voting members.
    fn configuration(&self) -> impl Future<Output = Result<Vec<ClusterNode>>> + Send;

    fn add_voter(
        &self,
        node: ClusterNode,
        timeout: Duration,
    ) -> impl Future<Output = Result<CommitInfo>> + Send;

    fn remove_server(
        &self,
        node_id: String,
        timeout: Duration,
    ) -> impl Future<Output = Result<CommitInfo>> + Send;
}
