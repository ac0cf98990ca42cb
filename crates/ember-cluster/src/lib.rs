//! # Ember Cluster
//!
//! Cluster side of the Ember grid providing:
//! - Cluster views, merge events and topology waits
//! - Replicated and consistent-hash key placement
//! - Deadlock probe wire format and an in-memory RPC transport
//! - Distributed deadlock detection (edge chasing with a recency tie-break)
//! - Grid node assembly

pub mod deadlock;
pub mod listeners;
pub mod membership;
pub mod node;
pub mod probe;
pub mod topology;
pub mod transport;

// Re-exports from deadlock
pub use deadlock::{DeadlockStats, DistributedDeadlockDetection, RollbackExecutor};

// Re-exports from listeners
pub use listeners::{spawn_view_listener, DeadlockLockListener};

// Re-exports from membership
pub use membership::{ClusterView, Membership, MembershipEvent};

// Re-exports from node
pub use node::GridNode;

// Re-exports from probe
pub use probe::{DispatchStats, ProbeDispatcher};

// Re-exports from topology
pub use topology::{ClusterTopology, HashRing};

// Re-exports from transport
pub use transport::{
    ClusterMessage, DeadlockProbe, InMemoryNetwork, InMemoryTransport, ProbeHandler,
    ProbeResponse, RpcTransport,
};
