//! Cluster membership events and the ring sync path
//!
//! A [`Membership`] backend reports who is alive. Changes reach the hash
//! ring through a broadcast channel consumed by a single task, so ring
//! mutations never block the membership engine itself.

use crate::common::metrics::METRICS;
use crate::common::Result;
use crate::consensus::ClusterNode;
use crate::coordinator::placement::{HashRing, SharedRing};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeJoin(ClusterNode),
    NodeLeave(ClusterNode),
    /// Same id, new address
    NodeUpdate(ClusterNode),
}

impl MembershipEvent {
    pub fn node(&self) -> &ClusterNode {
        match self {
            MembershipEvent::NodeJoin(n)
            | MembershipEvent::NodeLeave(n)
            | MembershipEvent::NodeUpdate(n) => n,
        }
    }
}

pub trait Membership: Send + Sync + 'static {
    /// Start participating, contacting `seeds` to find the cluster.
    fn join(&self, seeds: Vec<String>) -> impl Future<Output = Result<()>> + Send;

    /// Events observed after this call, in local observation order.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;

    /// Current live members, this node included.
    fn members(&self) -> Vec<ClusterNode>;
}

/// Events that turn `old` into `new`, ordered by node id.
pub fn diff(
    old: &BTreeMap<String, ClusterNode>,
    new: &BTreeMap<String, ClusterNode>,
) -> Vec<MembershipEvent> {
    let mut events = Vec::new();
    for (id, node) in new {
        match old.get(id) {
            None => events.push(MembershipEvent::NodeJoin(node.clone())),
            Some(prev) if prev.address != node.address => {
                events.push(MembershipEvent::NodeUpdate(node.clone()))
            }
            Some(_) => {}
        }
    }
    for (id, node) in old {
        if !new.contains_key(id) {
            events.push(MembershipEvent::NodeLeave(node.clone()));
        }
    }
    events
}

/// Membership view that changes only when told to.
pub struct StaticMembership {
    members: RwLock<BTreeMap<String, ClusterNode>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl StaticMembership {
    pub fn new(members: impl IntoIterator<Item = ClusterNode>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            members: RwLock::new(members.into_iter().map(|n| (n.id.clone(), n)).collect()),
            events,
        }
    }

    /// Apply `event` to the view and publish it.
    pub fn observe(&self, event: MembershipEvent) {
        {
            let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
            match &event {
                MembershipEvent::NodeJoin(node) | MembershipEvent::NodeUpdate(node) => {
                    members.insert(node.id.clone(), node.clone());
                }
                MembershipEvent::NodeLeave(node) => {
                    members.remove(&node.id);
                }
            }
        }
        let _ = self.events.send(event);
    }
}

impl Membership for StaticMembership {
    async fn join(&self, seeds: Vec<String>) -> Result<()> {
        debug!(seeds = seeds.len(), "Static membership ignores seeds");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn members(&self) -> Vec<ClusterNode> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// Keep `ring` in step with `membership` until the event channel closes.
///
/// The ring is seeded from the current member list after subscribing, so no
/// event between the two is lost. A lagging receiver rebuilds the ring from
/// scratch instead of replaying.
pub fn sync_ring<M, R>(membership: Arc<M>, ring: Arc<SharedRing<R>>) -> JoinHandle<()>
where
    M: Membership,
    R: HashRing + Clone + 'static,
{
    let mut events = membership.subscribe();
    ring.reset(membership.members());

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    METRICS.membership_events.inc();
                    apply_event(&ring, &event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Membership events lagged, rebuilding ring");
                    ring.reset(membership.members());
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Membership channel closed, ring sync stopped");
    })
}

fn apply_event<R: HashRing + Clone>(ring: &SharedRing<R>, event: &MembershipEvent) {
    match event {
        MembershipEvent::NodeJoin(node) => {
            info!(member = %node, "Node joined ring");
            ring.add_node(node.clone());
        }
        MembershipEvent::NodeLeave(node) => {
            info!(member = %node, "Node left ring");
            ring.remove_node(&node.id);
        }
        MembershipEvent::NodeUpdate(node) => {
            info!(member = %node, "Node changed address");
            ring.update(|r| {
                r.remove_node(&node.id);
                r.add_node(node.clone());
            });
        }
    }
}
