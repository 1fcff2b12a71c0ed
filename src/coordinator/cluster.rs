//! Cluster coordinator
//!
//! Front door for a node: writes go through consensus and only succeed on
//! the leader, reads are served from the local store, and membership
//! requests become consensus configuration changes.

use crate::common::command::Command;
use crate::common::config::{RaftConfig, RingConfig};
use crate::common::metrics::METRICS;
use crate::common::{Error, Result};
use crate::consensus::{ClusterNode, CommitInfo, ConsensusGroup, Role, StateMachine};
use crate::coordinator::membership::{sync_ring, Membership};
use crate::coordinator::placement::{BoundedLoadRing, HashRing, SharedRing};
use crate::coordinator::state_machine::ReplicatedStateMachine;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where a key lives on the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub key: String,
    pub partition: u64,
    /// Partition owner first
    pub owners: Vec<ClusterNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub node_id: String,
    pub address: String,
    pub role: Role,
    pub leader: Option<ClusterNode>,
    pub applied_index: u64,
    pub keys: usize,
    pub members: Vec<ClusterNode>,
    pub ring_members: Vec<ClusterNode>,
}

pub struct ClusterCoordinator<C> {
    consensus: Arc<C>,
    state_machine: Arc<ReplicatedStateMachine>,
    ring: Arc<SharedRing<BoundedLoadRing>>,
    apply_timeout: Duration,
    membership_timeout: Duration,
}

impl<C: ConsensusGroup> ClusterCoordinator<C> {
    pub fn new(
        consensus: Arc<C>,
        state_machine: Arc<ReplicatedStateMachine>,
        ring: RingConfig,
        raft: &RaftConfig,
    ) -> Self {
        Self {
            consensus,
            state_machine,
            ring: Arc::new(SharedRing::new(BoundedLoadRing::new(ring))),
            apply_timeout: raft.apply_timeout(),
            membership_timeout: raft.membership_timeout(),
        }
    }

    pub fn consensus(&self) -> &Arc<C> {
        &self.consensus
    }

    pub fn ring(&self) -> &Arc<SharedRing<BoundedLoadRing>> {
        &self.ring
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<CommitInfo> {
        self.write(Command::set(key, value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<CommitInfo> {
        self.write(Command::delete(key)).await
    }

    /// Local read. May lag the leader; not linearizable.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.state_machine.store().get(key)
    }

    async fn write(&self, command: Command) -> Result<CommitInfo> {
        self.ensure_leader()?;

        let data = command.encode()?;
        let start = Instant::now();
        let result = self.consensus.apply(data, self.apply_timeout).await;
        match &result {
            Ok(commit) => {
                METRICS.writes_total.inc();
                METRICS.write_latency.observe(start.elapsed());
                debug!(op = command.op(), key = command.key(), index = commit.index, "Write committed");
            }
            Err(Error::ApplyTimeout(timeout)) => {
                METRICS.apply_timeouts.inc();
                warn!(op = command.op(), key = command.key(), ?timeout, "Write not applied in time");
            }
            Err(Error::NotLeader(_)) => METRICS.writes_not_leader.inc(),
            Err(e) => warn!(op = command.op(), key = command.key(), error = %e, "Write failed"),
        }
        result
    }

    /// Add `node_id` at `address` as a voter.
    ///
    /// Rejoining with the same id and address is a no-op. An existing
    /// member that shares only the id or only the address is removed first.
    pub async fn join(&self, node_id: &str, address: &str) -> Result<()> {
        self.ensure_leader()?;
        let wanted = ClusterNode::new(node_id, address);

        for member in self.consensus.configuration().await? {
            if member == wanted {
                info!(member = %wanted, "Node already a member");
                return Ok(());
            }
            if member.id == wanted.id || member.address == wanted.address {
                let conflict = Error::MembershipConflict {
                    id: member.id.clone(),
                    address: member.address.clone(),
                };
                warn!(joining = %wanted, error = %conflict, "Removing stale member before join");
                self.consensus
                    .remove_server(member.id.clone(), self.membership_timeout)
                    .await?;
            }
        }

        let commit = self
            .consensus
            .add_voter(wanted.clone(), self.membership_timeout)
            .await?;
        info!(member = %wanted, index = commit.index, "Node joined");
        Ok(())
    }

    /// Remove `node_id` from the voting configuration. Unknown ids are a
    /// no-op.
    pub async fn leave(&self, node_id: &str) -> Result<()> {
        self.ensure_leader()?;

        let configuration = self.consensus.configuration().await?;
        if !configuration.iter().any(|m| m.id == node_id) {
            info!(node_id, "Node not a member, nothing to remove");
            return Ok(());
        }
        let commit = self
            .consensus
            .remove_server(node_id.to_string(), self.membership_timeout)
            .await?;
        info!(node_id, index = commit.index, "Node left");
        Ok(())
    }

    pub async fn status(&self) -> Result<ClusterStatus> {
        let local = self.consensus.local_node();
        Ok(ClusterStatus {
            node_id: local.id.clone(),
            address: local.address.clone(),
            role: self.consensus.role(),
            leader: self.consensus.leader(),
            applied_index: self.state_machine.applied_index(),
            keys: self.state_machine.store().len()?,
            members: self.consensus.configuration().await?,
            ring_members: self.ring.members(),
        })
    }

    /// Partition and owners for `key`, up to the replication factor.
    pub fn route(&self, key: &str) -> Result<Route> {
        let ring = self.ring.load();
        let members = ring.members().len();
        if members == 0 {
            return Err(Error::EmptyRing);
        }
        let partition = ring.resolve_partition_id(key);
        let owners =
            ring.resolve_nodes_for_partition(partition, ring.replication_factor().min(members))?;
        Ok(Route {
            key: key.to_string(),
            partition,
            owners,
        })
    }

    /// Keep the ring in step with `membership`.
    pub fn spawn_membership_sync<M: Membership>(&self, membership: Arc<M>) -> JoinHandle<()> {
        sync_ring(membership, self.ring.clone())
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.consensus.is_leader() {
            return Ok(());
        }
        METRICS.writes_not_leader.inc();
        let hint = self
            .consensus
            .leader()
            .map(|leader| leader.address)
            .filter(|address| !address.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        Err(Error::NotLeader(hint))
    }
}
