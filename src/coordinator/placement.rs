//! Key placement with consistent hashing and bounded loads
//!
//! Keys hash to one of `partition_count` partitions. Each member owns
//! `virtual_nodes` points on a 64-bit ring; a partition goes to the first
//! member clockwise from its hash whose load is still under
//! `ceil(partitions / members * load_factor)`. The assignment is recomputed
//! from the member set on every change, so two rings with the same members
//! and config always agree.

use crate::common::config::RingConfig;
use crate::common::hash::{Blake3Hasher, RingHasher};
use crate::common::metrics::METRICS;
use crate::common::{Error, Result};
use crate::consensus::ClusterNode;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

/// Placement of keys and partitions onto cluster members.
pub trait HashRing: Send + Sync {
    /// Add or re-address a member. Adding an identical member is a no-op.
    fn add_node(&mut self, node: ClusterNode);

    fn remove_node(&mut self, node_id: &str);

    /// Replace the whole member set.
    fn reset(&mut self, nodes: Vec<ClusterNode>) {
        for member in self.members() {
            self.remove_node(&member.id);
        }
        for node in nodes {
            self.add_node(node);
        }
    }

    /// Owner of the partition `key` falls in.
    fn resolve_node(&self, key: &str) -> Result<ClusterNode> {
        self.resolve_partition_owner_node(self.resolve_partition_id(key))
    }

    /// `count` distinct members for `key`, partition owner first.
    fn resolve_nodes(&self, key: &str, count: usize) -> Result<Vec<ClusterNode>> {
        self.resolve_nodes_for_partition(self.resolve_partition_id(key), count)
    }

    fn resolve_partition_id(&self, key: &str) -> u64;

    fn resolve_partition_owner_node(&self, partition_id: u64) -> Result<ClusterNode>;

    fn resolve_nodes_for_partition(&self, partition_id: u64, count: usize)
        -> Result<Vec<ClusterNode>>;

    fn replication_factor(&self) -> usize;

    fn members(&self) -> Vec<ClusterNode>;
}

#[derive(Clone)]
pub struct BoundedLoadRing<H = Blake3Hasher> {
    config: RingConfig,
    hasher: H,
    members: BTreeMap<String, ClusterNode>,
    /// Virtual points sorted by hash
    points: Vec<(u64, String)>,
    /// Owner id per partition
    owners: Vec<String>,
    loads: HashMap<String, u64>,
}

impl BoundedLoadRing<Blake3Hasher> {
    pub fn new(config: RingConfig) -> Self {
        Self::with_hasher(config, Blake3Hasher)
    }
}

impl<H: RingHasher + Clone> BoundedLoadRing<H> {
    pub fn with_hasher(mut config: RingConfig, hasher: H) -> Self {
        config.partition_count = config.partition_count.max(1);
        config.virtual_nodes = config.virtual_nodes.max(1);
        config.load_factor = config.load_factor.max(1.0);
        Self {
            config,
            hasher,
            members: BTreeMap::new(),
            points: Vec::new(),
            owners: Vec::new(),
            loads: HashMap::new(),
        }
    }

    pub fn partition_count(&self) -> u64 {
        self.config.partition_count
    }

    /// Most partitions any single member may own.
    pub fn average_load(&self) -> f64 {
        if self.members.is_empty() {
            return 0.0;
        }
        let per_member = self.config.partition_count as f64 / self.members.len() as f64;
        (per_member * self.config.load_factor).ceil()
    }

    /// Partitions owned per member id.
    pub fn load_distribution(&self) -> BTreeMap<String, u64> {
        self.members
            .keys()
            .map(|id| (id.clone(), self.loads.get(id).copied().unwrap_or(0)))
            .collect()
    }

    fn rebuild(&mut self) {
        let mut ring = BTreeMap::new();
        for id in self.members.keys() {
            for i in 0..self.config.virtual_nodes {
                let point = self.hasher.sum64(format!("{}{}", id, i).as_bytes());
                ring.insert(point, id.clone());
            }
        }
        self.points = ring.into_iter().collect();
        self.owners.clear();
        self.loads.clear();
        if self.points.is_empty() {
            return;
        }

        let max_load = self.average_load();
        for partition in 0..self.config.partition_count {
            let hash = self.hasher.sum64(&partition.to_le_bytes());
            let start = match self.points.partition_point(|(point, _)| *point < hash) {
                idx if idx == self.points.len() => 0,
                idx => idx,
            };

            let mut owner = None;
            for step in 0..self.points.len() {
                let candidate = &self.points[(start + step) % self.points.len()].1;
                let load = self.loads.get(candidate).copied().unwrap_or(0);
                if (load + 1) as f64 <= max_load {
                    owner = Some(candidate.clone());
                    break;
                }
            }
            // load_factor >= 1 leaves room for every partition.
            let owner = owner.unwrap_or_else(|| self.points[start].1.clone());
            *self.loads.entry(owner.clone()).or_insert(0) += 1;
            self.owners.push(owner);
        }
    }

    fn member(&self, id: &str) -> Result<ClusterNode> {
        self.members
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("ring owner {} is not a member", id)))
    }
}

impl<H: RingHasher + Clone> HashRing for BoundedLoadRing<H> {
    fn add_node(&mut self, node: ClusterNode) {
        if self.members.get(&node.id) == Some(&node) {
            return;
        }
        self.members.insert(node.id.clone(), node);
        self.rebuild();
    }

    fn remove_node(&mut self, node_id: &str) {
        if self.members.remove(node_id).is_some() {
            self.rebuild();
        }
    }

    fn reset(&mut self, nodes: Vec<ClusterNode>) {
        self.members = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        self.rebuild();
    }

    fn resolve_partition_id(&self, key: &str) -> u64 {
        self.hasher.sum64(key.as_bytes()) % self.config.partition_count
    }

    fn resolve_partition_owner_node(&self, partition_id: u64) -> Result<ClusterNode> {
        if self.members.is_empty() {
            return Err(Error::EmptyRing);
        }
        let owner = self.owners.get(partition_id as usize).ok_or_else(|| {
            Error::Internal(format!(
                "partition {} out of range 0..{}",
                partition_id, self.config.partition_count
            ))
        })?;
        self.member(owner)
    }

    fn resolve_nodes_for_partition(
        &self,
        partition_id: u64,
        count: usize,
    ) -> Result<Vec<ClusterNode>> {
        if count > self.members.len() {
            return Err(Error::InsufficientReplicas {
                needed: count,
                available: self.members.len(),
            });
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let owner = self.resolve_partition_owner_node(partition_id)?;

        // Replicas follow the owner in order of each member's own hash.
        let mut by_hash: Vec<(u64, &String)> = self
            .members
            .keys()
            .map(|id| (self.hasher.sum64(id.as_bytes()), id))
            .collect();
        by_hash.sort();
        let start = by_hash
            .iter()
            .position(|(_, id)| **id == owner.id)
            .unwrap_or(0);

        let mut nodes = Vec::with_capacity(count);
        nodes.push(owner);
        for step in 1..by_hash.len() {
            if nodes.len() == count {
                break;
            }
            let (_, id) = by_hash[(start + step) % by_hash.len()];
            nodes.push(self.member(id)?);
        }
        Ok(nodes)
    }

    fn replication_factor(&self) -> usize {
        self.config.replication_factor
    }

    fn members(&self) -> Vec<ClusterNode> {
        self.members.values().cloned().collect()
    }
}

/// A ring shared between the membership task and request handlers.
///
/// Readers grab the current layout and resolve without holding a lock.
/// Writers build the next layout on a private copy and swap it in.
pub struct SharedRing<R> {
    current: RwLock<Arc<R>>,
    writer: Mutex<()>,
}

impl<R: HashRing + Clone> SharedRing<R> {
    pub fn new(ring: R) -> Self {
        Self {
            current: RwLock::new(Arc::new(ring)),
            writer: Mutex::new(()),
        }
    }

    /// Current layout.
    pub fn load(&self) -> Arc<R> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn update(&self, change: impl FnOnce(&mut R)) {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = R::clone(&self.load());
        change(&mut next);
        METRICS.ring_members.set(next.members().len() as u64);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
    }

    pub fn add_node(&self, node: ClusterNode) {
        self.update(|ring| ring.add_node(node));
    }

    pub fn remove_node(&self, node_id: &str) {
        self.update(|ring| ring.remove_node(node_id));
    }

    pub fn reset(&self, nodes: Vec<ClusterNode>) {
        self.update(|ring| ring.reset(nodes));
    }

    pub fn resolve_node(&self, key: &str) -> Result<ClusterNode> {
        self.load().resolve_node(key)
    }

    pub fn resolve_nodes(&self, key: &str, count: usize) -> Result<Vec<ClusterNode>> {
        self.load().resolve_nodes(key, count)
    }

    pub fn resolve_partition_id(&self, key: &str) -> u64 {
        self.load().resolve_partition_id(key)
    }

    pub fn replication_factor(&self) -> usize {
        self.load().replication_factor()
    }

    pub fn members(&self) -> Vec<ClusterNode> {
        self.load().members()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> ClusterNode {
        ClusterNode::new(id, format!("{}:7000", id))
    }

    fn ring_with(ids: &[&str]) -> BoundedLoadRing {
        let mut ring = BoundedLoadRing::new(RingConfig::default());
        for id in ids {
            ring.add_node(node(id));
        }
        ring
    }

    fn owners(ring: &BoundedLoadRing, keys: &[String]) -> Vec<String> {
        keys.iter()
            .map(|k| ring.resolve_node(k).unwrap().id)
            .collect()
    }

    fn sample_keys() -> Vec<String> {
        (0..500).map(|i| format!("key-{}", i)).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = BoundedLoadRing::new(RingConfig::default());
        assert!(matches!(ring.resolve_node("k"), Err(Error::EmptyRing)));
        assert!(ring.resolve_nodes("k", 0).unwrap().is_empty());
    }

    #[test]
    fn test_resolution_is_stable() {
        let ring = ring_with(&["a", "b", "c"]);
        let keys = sample_keys();
        assert_eq!(owners(&ring, &keys), owners(&ring, &keys));

        // Insertion order does not matter.
        let other = ring_with(&["c", "a", "b"]);
        assert_eq!(owners(&ring, &keys), owners(&other, &keys));
    }

    #[test]
    fn test_add_then_remove_restores_placement() {
        let mut ring = ring_with(&["a", "b", "c"]);
        let keys = sample_keys();
        let before = owners(&ring, &keys);

        ring.add_node(node("d"));
        assert_ne!(owners(&ring, &keys), before);
        ring.remove_node("d");
        assert_eq!(owners(&ring, &keys), before);
    }

    #[test]
    fn test_bounded_load() {
        let ring = ring_with(&["a", "b", "c", "d", "e"]);
        let max = ring.average_load();
        assert_eq!(max, (271.0f64 / 5.0 * 1.25).ceil());

        let loads = ring.load_distribution();
        assert_eq!(loads.values().sum::<u64>(), 271);
        for (id, load) in loads {
            assert!(load as f64 <= max, "{} owns {} > {}", id, load, max);
        }
    }

    #[test]
    fn test_partition_ids_in_range() {
        let ring = ring_with(&["a"]);
        for key in sample_keys() {
            assert!(ring.resolve_partition_id(&key) < ring.partition_count());
        }
    }

    #[test]
    fn test_closest_nodes() {
        let ring = ring_with(&["a", "b", "c", "d"]);
        for key in sample_keys().iter().take(50) {
            let nodes = ring.resolve_nodes(key, 3).unwrap();
            assert_eq!(nodes.len(), 3);
            assert_eq!(nodes[0], ring.resolve_node(key).unwrap());
            let mut ids: Vec<_> = nodes.iter().map(|n| n.id.clone()).collect();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), 3);
        }

        let err = ring.resolve_nodes("k", 5).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientReplicas {
                needed: 5,
                available: 4
            }
        ));
    }

    #[test]
    fn test_readdress_keeps_placement() {
        let mut ring = ring_with(&["a", "b"]);
        let keys = sample_keys();
        let before = owners(&ring, &keys);

        ring.add_node(ClusterNode::new("a", "10.0.0.9:7000"));
        assert_eq!(owners(&ring, &keys), before);
        assert!(ring.members().iter().any(|m| m.address == "10.0.0.9:7000"));
    }

    #[test]
    fn test_shared_ring_swaps_layouts() {
        let shared = Arc::new(SharedRing::new(ring_with(&["a", "b"])));
        let held = shared.load();

        shared.add_node(node("c"));
        assert_eq!(held.members().len(), 2);
        assert_eq!(shared.members().len(), 3);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for key in sample_keys() {
                        shared.resolve_node(&key).unwrap();
                    }
                })
            })
            .collect();
        for id in ["d", "e", "f"] {
            shared.add_node(node(id));
        }
        for reader in readers {
            reader.join().unwrap();
        }

        shared.reset(vec![node("x")]);
        assert_eq!(shared.resolve_node("any").unwrap().id, "x");
    }
}
