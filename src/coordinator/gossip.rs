//! Gossip membership using chitchat
//!
//! Every node publishes its advertised address under one chitchat key.
//! A watcher polls the live node set once per gossip interval and turns
//! differences into [`MembershipEvent`]s.

use crate::common::config::GossipConfig;
use crate::common::{Error, Result};
use crate::consensus::ClusterNode;
use crate::coordinator::membership::{diff, Membership, MembershipEvent, EVENT_BUFFER};
use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Chitchat key holding the node's client-facing address.
pub const ADDRESS_KEY: &str = "kvmesh:address";

const DEAD_NODE_GRACE_PERIOD: Duration = Duration::from_secs(60);

struct Running {
    // Dropping the handle stops the gossip server.
    _chitchat: ChitchatHandle,
    watcher: JoinHandle<()>,
}

pub struct GossipMembership {
    config: GossipConfig,
    local: ClusterNode,
    members: Arc<RwLock<BTreeMap<String, ClusterNode>>>,
    events: broadcast::Sender<MembershipEvent>,
    running: Mutex<Option<Running>>,
}

impl GossipMembership {
    pub fn new(config: GossipConfig, local: ClusterNode) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let mut members = BTreeMap::new();
        members.insert(local.id.clone(), local.clone());
        Self {
            config,
            local,
            members: Arc::new(RwLock::new(members)),
            events,
            running: Mutex::new(None),
        }
    }

    /// Stop gossiping. Peers will see this node as dead after the failure
    /// detector times out.
    pub async fn shutdown(&self) {
        if let Some(running) = self.running.lock().await.take() {
            running.watcher.abort();
            info!(node = %self.local.id, "Gossip stopped");
        }
    }
}

impl Membership for GossipMembership {
    async fn join(&self, seeds: Vec<String>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let listen_addr: SocketAddr = self.config.listen_addr.parse().map_err(|e| {
            Error::InvalidConfig(format!(
                "gossip.listen_addr {}: {}",
                self.config.listen_addr, e
            ))
        })?;
        // A fresh generation per process start lets peers tell a restart
        // from a stale state.
        let generation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let config = ChitchatConfig {
            chitchat_id: ChitchatId::new(self.local.id.clone(), generation, listen_addr),
            cluster_id: self.config.cluster_id.clone(),
            gossip_interval: self.config.gossip_interval(),
            listen_addr,
            seed_nodes: seeds.clone(),
            failure_detector_config: FailureDetectorConfig {
                phi_threshold: self.config.phi_threshold,
                initial_interval: self.config.gossip_interval(),
                ..Default::default()
            },
            marked_for_deletion_grace_period: DEAD_NODE_GRACE_PERIOD,
            extra_liveness_predicate: None,
            catchup_callback: None,
        };
        let initial_kvs = vec![(ADDRESS_KEY.to_string(), self.local.address.clone())];

        let handle = spawn_chitchat(config, initial_kvs, &UdpTransport)
            .await
            .map_err(|e| Error::Membership(format!("start gossip on {}: {}", listen_addr, e)))?;

        let chitchat = handle.chitchat();
        let members = self.members.clone();
        let events = self.events.clone();
        let local = self.local.clone();
        let interval = self.config.gossip_interval();

        let watcher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                let mut live = BTreeMap::new();
                live.insert(local.id.clone(), local.clone());
                {
                    let guard = chitchat.lock().await;
                    for id in guard.live_nodes() {
                        let address = guard
                            .node_state(id)
                            .and_then(|state| state.get(ADDRESS_KEY))
                            .map(str::to_string);
                        if let Some(address) = address {
                            live.insert(id.node_id.clone(), ClusterNode::new(id.node_id.clone(), address));
                        }
                    }
                }

                let changes = {
                    let mut current = members.write().unwrap_or_else(|e| e.into_inner());
                    let changes = diff(&current, &live);
                    *current = live;
                    changes
                };
                for event in changes {
                    debug!(?event, "Gossip membership change");
                    let _ = events.send(event);
                }
            }
        });

        info!(
            node = %self.local.id,
            listen = %listen_addr,
            seeds = ?seeds,
            cluster = %self.config.cluster_id,
            "Gossip started"
        );
        *running = Some(Running {
            _chitchat: handle,
            watcher,
        });
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
