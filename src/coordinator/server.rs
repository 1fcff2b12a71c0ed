//! Node server
//!
//! Wires one process together: store, state machine, consensus group,
//! coordinator, membership and the HTTP gateway.

use crate::common::config::NodeConfig;
use crate::common::storage::MemStore;
use crate::common::{Error, Result};
use crate::consensus::{ClusterNode, ConsensusGroup, HttpTransport, RaftGroup, RaftGroupConfig};
use crate::coordinator::cluster::ClusterCoordinator;
use crate::coordinator::gossip::GossipMembership;
use crate::coordinator::http::{create_router, GatewayState, LEADER_HEADER};
use crate::coordinator::membership::{diff, Membership, StaticMembership};
use crate::coordinator::state_machine::ReplicatedStateMachine;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RAFT_SEND_TIMEOUT: Duration = Duration::from_secs(2);
const CONFIGURATION_POLL: Duration = Duration::from_secs(1);
const JOIN_ATTEMPTS: u32 = 10;
const JOIN_BACKOFF_START: Duration = Duration::from_millis(500);
const JOIN_BACKOFF_MAX: Duration = Duration::from_secs(5);

pub struct Node {
    config: NodeConfig,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Run until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let config = self.config;
        config.validate()?;
        let local = ClusterNode::new(config.node_id.clone(), config.advertised());

        info!("Starting kvmesh node: {}", local.id);
        info!("  HTTP API: {}", config.bind_addr);
        info!("  Advertised: {}", local.address);
        info!("  Data dir: {}", config.data_dir.display());
        info!(
            "  Ring: {} partitions, rf={}, load factor {}",
            config.ring.partition_count, config.ring.replication_factor, config.ring.load_factor
        );

        let store = Arc::new(MemStore::new());
        let state_machine = Arc::new(ReplicatedStateMachine::new(store));
        let transport = Arc::new(HttpTransport::new(RAFT_SEND_TIMEOUT)?);

        let group = Arc::new(
            RaftGroup::open(
                RaftGroupConfig {
                    node: local.clone(),
                    data_dir: config.data_dir.clone(),
                    bootstrap: config.join.is_none(),
                    raft: config.raft.clone(),
                },
                state_machine.clone(),
                transport,
            )
            .await?,
        );

        let coordinator = Arc::new(ClusterCoordinator::new(
            group.clone(),
            state_machine,
            config.ring.clone(),
            &config.raft,
        ));

        let mut background = Vec::new();
        let gossip = match config.gossip.clone() {
            Some(gossip_config) => {
                let seeds = gossip_config.seeds.clone();
                let membership = Arc::new(GossipMembership::new(gossip_config, local.clone()));
                membership.join(seeds).await?;
                background.push(coordinator.spawn_membership_sync(membership.clone()));
                Some(membership)
            }
            None => {
                let membership = Arc::new(StaticMembership::new([local.clone()]));
                background.push(coordinator.spawn_membership_sync(membership.clone()));
                background.push(follow_configuration(group.clone(), membership));
                None
            }
        };

        let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
        let router = create_router(GatewayState {
            coordinator: coordinator.clone(),
        });

        if let Some(seed) = config.join.clone() {
            background.push(tokio::spawn(join_cluster(seed, local.clone())));
        }

        info!("✓ Node ready ({})", group.role());

        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        for task in background {
            task.abort();
        }
        if let Some(gossip) = gossip {
            gossip.shutdown().await;
        }
        group.shutdown().await;
        info!(node = %local.id, "Node stopped");

        result.map_err(Error::Io)
    }
}

/// Mirror the consensus configuration into `membership` when no gossip
/// layer is configured.
fn follow_configuration(group: Arc<RaftGroup>, membership: Arc<StaticMembership>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CONFIGURATION_POLL);
        loop {
            ticker.tick().await;
            let configuration = match group.configuration().await {
                Ok(configuration) => configuration,
                Err(e) => {
                    debug!(error = %e, "Configuration unavailable");
                    continue;
                }
            };
            let current: BTreeMap<_, _> = membership
                .members()
                .into_iter()
                .map(|m| (m.id.clone(), m))
                .collect();
            let wanted: BTreeMap<_, _> = configuration
                .into_iter()
                .map(|m| (m.id.clone(), m))
                .collect();
            for event in diff(&current, &wanted) {
                membership.observe(event);
            }
        }
    })
}

/// Ask `seed` to add this node, following leader redirects.
pub async fn join_cluster(seed: String, local: ClusterNode) {
    let client = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Cannot build HTTP client for join");
            return;
        }
    };

    let mut target = seed;
    let mut backoff = JOIN_BACKOFF_START;
    for attempt in 1..=JOIN_ATTEMPTS {
        let url = format!("http://{}/join", target);
        let body = json!({ "id": local.id, "addr": local.address });
        match client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(via = %target, "Joined cluster");
                return;
            }
            Ok(resp) if resp.status() == reqwest::StatusCode::TEMPORARY_REDIRECT => {
                let leader = resp
                    .headers()
                    .get(LEADER_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| *v != "unknown")
                    .map(str::to_string);
                if let Some(leader) = leader {
                    debug!(from = %target, to = %leader, "Join redirected to leader");
                    target = leader;
                    continue;
                }
                warn!(attempt, via = %target, "No leader yet, retrying join");
            }
            Ok(resp) => {
                warn!(attempt, via = %target, status = %resp.status(), "Join rejected");
            }
            Err(e) => {
                warn!(attempt, via = %target, error = %e, "Join request failed");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(JOIN_BACKOFF_MAX);
    }
    warn!(node = %local.id, "Giving up on joining the cluster");
}
