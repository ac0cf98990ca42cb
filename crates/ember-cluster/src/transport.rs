//! Probe Transport
//!
//! Wire messages for deadlock probes and the RPC transport that carries them.
//! The in-memory network connects nodes of one process and can be split into
//! partitions to simulate lost connectivity.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use ember_common::prelude::*;

use crate::membership::ClusterView;

/// Deadlock probe: `initiator` is (transitively) waiting for `holder`.
///
/// A probe whose initiator equals its holder closes a cycle; it is also the
/// message used to tell other nodes that the initiator was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockProbe {
    pub initiator: TxnId,
    pub holder: TxnId,
    /// Topology of the sender when the probe was created
    pub topology_id: u64,
    /// Member digest of the sender's view
    pub members_digest: u64,
}

impl DeadlockProbe {
    pub fn new(initiator: TxnId, holder: TxnId, view: &ClusterView) -> Self {
        Self {
            initiator,
            holder,
            topology_id: view.topology_id,
            members_digest: view.members_digest(),
        }
    }

    /// True when `view` places keys differently and is newer than the sender's.
    pub fn is_outdated_for(&self, view: &ClusterView) -> bool {
        self.topology_id < view.topology_id && self.members_digest != view.members_digest()
    }
}

/// Messages exchanged between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMessage {
    DeadlockProbe(DeadlockProbe),
}

impl ClusterMessage {
    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::InvalidMessage(e.to_string()).into())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| ProtocolError::InvalidMessage(e.to_string()).into())
    }
}

/// Reply to a probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeResponse {
    Success,
    /// The receiver installed a newer topology with other members than the
    /// probe was sent with
    Unsure { topology_id: u64 },
    /// The receiver failed handling the probe
    Exception(String),
}

impl ProbeResponse {
    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::InvalidMessage(e.to_string()).into())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| ProtocolError::InvalidMessage(e.to_string()).into())
    }
}

/// Receiving side of the probe protocol.
#[async_trait]
pub trait ProbeHandler: Send + Sync {
    async fn handle_probe(&self, from: NodeId, probe: DeadlockProbe) -> ProbeResponse;
}

/// Point-to-point command transport.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    fn local_node(&self) -> NodeId;

    /// Deliver `message` to `target` and wait for its response.
    async fn invoke(&self, target: NodeId, message: ClusterMessage) -> Result<ProbeResponse>;
}

/// Process-local network connecting the nodes of a test cluster.
#[derive(Default)]
pub struct InMemoryNetwork {
    /// Registered nodes and their probe handlers
    endpoints: DashMap<NodeId, Weak<dyn ProbeHandler>>,
    /// Severed links, stored in both directions
    severed: RwLock<HashSet<(NodeId, NodeId)>>,
    /// Remote invocations attempted per sending node
    outbound: DashMap<NodeId, AtomicU64>,
    /// Artificial delivery delay
    latency: RwLock<Option<Duration>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: NodeId, handler: Weak<dyn ProbeHandler>) {
        self.endpoints.insert(node, handler);
    }

    pub fn unregister(&self, node: NodeId) {
        self.endpoints.remove(&node);
    }

    /// Cut every link between nodes of different groups.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut severed = self.severed.write();
        for (i, left) in groups.iter().enumerate() {
            for right in groups.iter().skip(i + 1) {
                for a in left.iter() {
                    for b in right.iter() {
                        severed.insert((*a, *b));
                        severed.insert((*b, *a));
                    }
                }
            }
        }
        info!(groups = groups.len(), "network partitioned");
    }

    /// Restore every link.
    pub fn heal(&self) {
        self.severed.write().clear();
        info!("network healed");
    }

    pub fn is_reachable(&self, from: NodeId, to: NodeId) -> bool {
        !self.severed.read().contains(&(from, to))
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Remote invocations attempted by `node`.
    pub fn sent_from(&self, node: NodeId) -> u64 {
        self.outbound
            .get(&node)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn total_sent(&self) -> u64 {
        self.outbound.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    fn record_send(&self, node: NodeId) {
        self.outbound
            .entry(node)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst);
    }

    fn endpoint(&self, node: NodeId) -> Option<Arc<dyn ProbeHandler>> {
        self.endpoints.get(&node).and_then(|h| h.upgrade())
    }
}

/// Transport endpoint of one node on an [`InMemoryNetwork`].
pub struct InMemoryTransport {
    node_id: NodeId,
    network: Arc<InMemoryNetwork>,
    rpc_timeout: Duration,
}

impl InMemoryTransport {
    pub fn new(node_id: NodeId, network: Arc<InMemoryNetwork>, rpc_timeout: Duration) -> Self {
        Self {
            node_id,
            network,
            rpc_timeout,
        }
    }
}

#[async_trait]
impl RpcTransport for InMemoryTransport {
    fn local_node(&self) -> NodeId {
        self.node_id
    }

    async fn invoke(&self, target: NodeId, message: ClusterMessage) -> Result<ProbeResponse> {
        self.network.record_send(self.node_id);
        let payload = message.encode()?;

        let latency = *self.network.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.network.is_reachable(self.node_id, target) {
            return Err(ClusterError::Unreachable(target).into());
        }
        let handler = self
            .network
            .endpoint(target)
            .ok_or(ClusterError::NodeNotFound(target))?;

        let from = self.node_id;
        let delivery = tokio::spawn(async move {
            let ClusterMessage::DeadlockProbe(probe) = ClusterMessage::decode(&payload)?;
            handler.handle_probe(from, probe).await.encode()
        });

        let reply = tokio::time::timeout(self.rpc_timeout, delivery)
            .await
            .map_err(|_| Error::Timeout(format!("probe to node {}", target)))?
            .map_err(|e| Error::internal(format!("probe delivery to node {} failed: {}", target, e)))??;

        ProbeResponse::decode(&reply)
    }
}
