//! Configuration for kvmesh nodes
//!
//! Layering: built-in defaults, then an optional TOML file, then
//! `KVMESH__SECTION__FIELD` environment variables. The node binary applies
//! command-line overrides on top.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID (unique, stable across restarts)
    pub node_id: String,

    /// Address the HTTP API and raft transport listen on
    pub bind_addr: String,

    /// Address advertised to peers (defaults to bind_addr)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,

    /// Directory for snapshots
    pub data_dir: PathBuf,

    /// Address of an existing member to join; bootstrap a new cluster if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,

    #[serde(default)]
    pub raft: RaftConfig,

    #[serde(default)]
    pub ring: RingConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gossip: Option<GossipConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Consensus tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Logical clock period
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Ticks without a heartbeat before a follower campaigns
    #[serde(default = "default_election_tick")]
    pub election_tick: usize,

    /// Ticks between leader heartbeats
    #[serde(default = "default_heartbeat_tick")]
    pub heartbeat_tick: usize,

    /// Applied entries between automatic snapshots
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Snapshot files kept on disk
    #[serde(default = "default_snapshot_retain")]
    pub snapshot_retain: usize,

    /// Bound on a client write waiting for commit
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_ms: u64,

    /// Bound on a single membership configuration change
    #[serde(default = "default_membership_timeout")]
    pub membership_timeout_ms: u64,
}

fn default_tick_interval() -> u64 {
    100
}
fn default_election_tick() -> usize {
    10
}
fn default_heartbeat_tick() -> usize {
    3
}
fn default_snapshot_threshold() -> u64 {
    8192
}
fn default_snapshot_retain() -> usize {
    2
}
fn default_apply_timeout() -> u64 {
    10_000
}
fn default_membership_timeout() -> u64 {
    10_000
}

impl RaftConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn membership_timeout(&self) -> Duration {
        Duration::from_millis(self.membership_timeout_ms)
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            election_tick: default_election_tick(),
            heartbeat_tick: default_heartbeat_tick(),
            snapshot_threshold: default_snapshot_threshold(),
            snapshot_retain: default_snapshot_retain(),
            apply_timeout_ms: default_apply_timeout(),
            membership_timeout_ms: default_membership_timeout(),
        }
    }
}

/// Hash ring parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Number of partitions on the ring
    #[serde(default = "default_partition_count")]
    pub partition_count: u64,

    /// Points per member on the ring
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Owners per key (primary + replicas)
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Maximum load relative to the average
    #[serde(default = "default_load_factor")]
    pub load_factor: f64,
}

fn default_partition_count() -> u64 {
    271
}
fn default_virtual_nodes() -> usize {
    20
}
fn default_replication_factor() -> usize {
    3
}
fn default_load_factor() -> f64 {
    1.25
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            partition_count: default_partition_count(),
            virtual_nodes: default_virtual_nodes(),
            replication_factor: default_replication_factor(),
            load_factor: default_load_factor(),
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(Error::InvalidConfig("ring.partition_count must be > 0".into()));
        }
        if self.virtual_nodes == 0 {
            return Err(Error::InvalidConfig("ring.virtual_nodes must be > 0".into()));
        }
        if self.load_factor < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "ring.load_factor must be >= 1.0, got {}",
                self.load_factor
            )));
        }
        Ok(())
    }
}

/// Gossip membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// UDP address for gossip
    pub listen_addr: String,

    /// Gossip addresses of seed nodes
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Cluster name; nodes with a different name ignore each other
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_phi_threshold")]
    pub phi_threshold: f64,
}

fn default_cluster_id() -> String {
    "kvmesh".to_string()
}
fn default_gossip_interval() -> u64 {
    500
}
fn default_phi_threshold() -> f64 {
    8.0
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7946".to_string(),
            seeds: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
            phi_threshold: default_phi_threshold(),
        }
    }
}

impl GossipConfig {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            bind_addr: "127.0.0.1:7000".to_string(),
            advertise_addr: None,
            data_dir: PathBuf::from("./kvmesh-data"),
            join: None,
            raft: RaftConfig::default(),
            ring: RingConfig::default(),
            gossip: None,
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&NodeConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("KVMESH")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::InvalidConfig("node_id must not be empty".into()));
        }
        if self.raft.heartbeat_tick == 0 || self.raft.election_tick <= self.raft.heartbeat_tick {
            return Err(Error::InvalidConfig(
                "raft.election_tick must be greater than raft.heartbeat_tick".into(),
            ));
        }
        self.ring.validate()
    }

    /// Address other nodes use to reach this one
    pub fn advertised(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.bind_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ring.load_factor, 1.25);
        assert_eq!(config.advertised(), "127.0.0.1:7000");
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
node_id = "n2"
bind_addr = "127.0.0.1:7102"
data_dir = "/tmp/n2"

[raft]
snapshot_threshold = 16

[ring]
partition_count = 64
"#
        )
        .unwrap();

        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.node_id, "n2");
        assert_eq!(config.raft.snapshot_threshold, 16);
        assert_eq!(config.raft.election_tick, 10);
        assert_eq!(config.ring.partition_count, 64);
        assert_eq!(config.ring.replication_factor, 3);
    }

    #[test]
    fn test_rejects_bad_load_factor() {
        let mut config = NodeConfig::default();
        config.ring.load_factor = 0.5;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
