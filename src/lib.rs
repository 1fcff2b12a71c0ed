//! # kvmesh
//!
//! A replicated key-value store:
//! - Raft consensus (tikv `raft`) orders every write
//! - Deterministic state machine with checksummed snapshots
//! - Safe, idempotent membership changes
//! - Bounded-load consistent hashing over a gossip-discovered node set
//! - HTTP API for clients and for raft traffic
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!   client ──HTTP──▶ gateway ──▶ ClusterCoordinator ──▶ ConsensusGroup (raft)
//!                                   │      ▲                  │ committed entries
//!                                   │      │ reads            ▼
//!                                   │      └──────── ReplicatedStateMachine ──▶ KvStore
//!                                   ▼
//!                        SharedRing ◀── membership events ◀── gossip (chitchat)
//! ```
//!
//! ## Usage
//!
//! ### Start a cluster
//! ```bash
//! kvmesh-node --id n1 --bind 127.0.0.1:7001 --data ./n1
//! kvmesh-node --id n2 --bind 127.0.0.1:7002 --data ./n2 --join 127.0.0.1:7001
//! kvmesh-node --id n3 --bind 127.0.0.1:7003 --data ./n3 --join 127.0.0.1:7001
//! ```
//!
//! ### Use the CLI
//! ```bash
//! kvmesh --node 127.0.0.1:7001 set x 1
//! kvmesh --node 127.0.0.1:7002 get x
//! kvmesh --node 127.0.0.1:7001 route x
//! kvmesh --node 127.0.0.1:7001 status
//! ```

pub mod common;
pub mod consensus;
pub mod coordinator;

// Re-export commonly used types
pub use common::{Error, NodeConfig, Result};
pub use consensus::{ClusterNode, ConsensusGroup, RaftGroup};
pub use coordinator::{ClusterCoordinator, Node};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
