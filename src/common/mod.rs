//! Common utilities and types shared across kvmesh

pub mod command;
pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod storage;
pub mod tracing_middleware;

pub use command::Command;
pub use config::{GossipConfig, NodeConfig, RaftConfig, RingConfig};
pub use error::{Error, Result};
pub use hash::{hash64, raft_id, Blake3Hasher, RingHasher};
pub use storage::{KvStore, MemStore};
