//! Cluster Membership
//!
//! Tracks the installed cluster view of one node. Every view change bumps the
//! topology id; a view installed after a partition heals is announced as a
//! merge so that listeners can re-check state hidden by the partition.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use ember_common::prelude::*;

use crate::topology::HashRing;

/// Membership as seen by one node at one topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    pub topology_id: u64,
    pub members: BTreeSet<NodeId>,
}

impl ClusterView {
    pub fn new(topology_id: u64, members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            topology_id,
            members: members.into_iter().collect(),
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Digest of the member set.
    ///
    /// Topology ids are counted per node, so two nodes may install the same
    /// members under different ids; equal digests mean equal key placement.
    pub fn members_digest(&self) -> u64 {
        let bytes: Vec<u8> = self.members.iter().flat_map(|n| n.0.to_le_bytes()).collect();
        HashRing::hash_bytes(&bytes)
    }
}

/// Membership change event
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// Node joined the cluster
    NodeJoined(NodeId),
    /// Node left the cluster
    NodeLeft(NodeId),
    /// A new view was installed
    ViewInstalled(ClusterView),
    /// Partitions merged back into a single view
    Merged {
        view: ClusterView,
        partitions: Vec<BTreeSet<NodeId>>,
    },
}

/// Cluster membership manager
pub struct Membership {
    /// This node's ID
    node_id: NodeId,
    /// Installed view; receivers wait on topology changes
    view_tx: watch::Sender<ClusterView>,
    /// Serializes view installation
    install_lock: Mutex<()>,
    /// Event sender
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl Membership {
    /// Create a membership manager with an initial view at topology 1.
    pub fn new(node_id: NodeId, members: impl IntoIterator<Item = NodeId>) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        let mut initial = ClusterView::new(1, members);
        initial.members.insert(node_id);
        let (view_tx, _) = watch::channel(initial);

        Self {
            node_id,
            view_tx,
            install_lock: Mutex::new(()),
            event_tx,
        }
    }

    /// Get this node's ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Currently installed view
    pub fn view(&self) -> ClusterView {
        self.view_tx.borrow().clone()
    }

    pub fn topology_id(&self) -> u64 {
        self.view_tx.borrow().topology_id
    }

    pub fn is_member(&self, node: NodeId) -> bool {
        self.view_tx.borrow().contains(node)
    }

    pub fn members(&self) -> BTreeSet<NodeId> {
        self.view_tx.borrow().members.clone()
    }

    /// Subscribe to membership events
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    /// Install a new view with the given members.
    pub fn install_view(&self, members: impl IntoIterator<Item = NodeId>) -> ClusterView {
        let view = self.replace_view(members);
        let _ = self.event_tx.send(MembershipEvent::ViewInstalled(view.clone()));
        view
    }

    /// Install the view that results from merging `partitions`.
    pub fn merge_views(&self, partitions: Vec<BTreeSet<NodeId>>) -> ClusterView {
        let members: BTreeSet<NodeId> = partitions.iter().flatten().copied().collect();
        let view = self.replace_view(members);
        info!(
            node = %self.node_id,
            topology_id = view.topology_id,
            partitions = partitions.len(),
            "installed merged view"
        );
        let _ = self.event_tx.send(MembershipEvent::ViewInstalled(view.clone()));
        let _ = self.event_tx.send(MembershipEvent::Merged {
            view: view.clone(),
            partitions,
        });
        view
    }

    /// Wait until a view with at least `topology_id` is installed.
    pub async fn wait_for_topology(&self, topology_id: u64, timeout: Duration) -> Result<ClusterView> {
        let mut rx = self.view_tx.subscribe();
        let wait = async {
            loop {
                {
                    let view = rx.borrow_and_update();
                    if view.topology_id >= topology_id {
                        return Ok(view.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Cancelled("membership closed".to_string()));
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            Error::Timeout(format!(
                "topology {} not installed on node {} within {:?}",
                topology_id, self.node_id, timeout
            ))
        })?
    }

    fn replace_view(&self, members: impl IntoIterator<Item = NodeId>) -> ClusterView {
        let _guard = self.install_lock.lock();
        let old = self.view();
        let mut view = ClusterView::new(old.topology_id + 1, members);
        view.members.insert(self.node_id);

        for joined in view.members.difference(&old.members) {
            let _ = self.event_tx.send(MembershipEvent::NodeJoined(*joined));
        }
        for left in old.members.difference(&view.members) {
            let _ = self.event_tx.send(MembershipEvent::NodeLeft(*left));
        }

        self.view_tx.send_replace(view.clone());
        debug!(node = %self.node_id, topology_id = view.topology_id, members = ?view.members, "view installed");
        view
    }
}
