//! Cluster coordination
//!
//! The coordinator is responsible for:
//! - Leader-gated writes and local reads
//! - Consensus membership changes (join / leave)
//! - Key placement on the bounded-load ring
//! - Keeping the ring in step with gossip membership

pub mod cluster;
pub mod gossip;
pub mod http;
pub mod membership;
pub mod placement;
pub mod server;
pub mod state_machine;

pub use cluster::{ClusterCoordinator, ClusterStatus, Route};
pub use membership::{Membership, MembershipEvent, StaticMembership};
pub use placement::{BoundedLoadRing, HashRing, SharedRing};
pub use server::Node;
pub use state_machine::ReplicatedStateMachine;
