//! Key placement
//!
//! Consistent hash ring placement of keys onto the members of a cluster view,
//! and the write-owner lookups built on it.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use ember_common::prelude::*;

use crate::membership::ClusterView;

/// Consistent hash ring for mapping keys to nodes.
/// Uses virtual nodes (default 128 per physical node) for even distribution.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Ring positions: hash position -> node ID
    ring: BTreeMap<u64, NodeId>,
    /// Number of virtual nodes per physical node
    virtual_nodes: usize,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: BTreeMap::new(),
            virtual_nodes,
        }
    }

    /// Add a node to the ring with `virtual_nodes` positions.
    pub fn add_node(&mut self, node_id: NodeId) {
        for i in 0..self.virtual_nodes {
            let vnode = format!("{}:{}", node_id.0, i);
            self.ring.insert(Self::hash_bytes(vnode.as_bytes()), node_id);
        }
    }

    /// Locate the primary owner node for a given key.
    pub fn locate(&self, key: &[u8]) -> Option<NodeId> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = Self::hash_bytes(key);
        // Walk clockwise from hash to find the first node
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &node_id)| node_id)
    }

    /// Locate up to `n` distinct owners for a key (walking clockwise).
    pub fn locate_n(&self, key: &[u8], n: usize) -> Vec<NodeId> {
        if self.ring.is_empty() {
            return Vec::new();
        }
        let hash = Self::hash_bytes(key);
        let mut result = Vec::with_capacity(n);
        let mut seen = HashSet::new();

        for (_, &node_id) in self.ring.range(hash..).chain(self.ring.iter()) {
            if seen.insert(node_id) {
                result.push(node_id);
                if result.len() >= n {
                    break;
                }
            }
        }

        result
    }

    /// FNV-1a hash for consistent distribution.
    pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in bytes {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }
}

/// Key ownership at one topology.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    view: ClusterView,
    ring: HashRing,
    cache_mode: CacheMode,
    num_owners: usize,
}

impl ClusterTopology {
    pub fn new(view: ClusterView, config: &ClusterConfig) -> Self {
        let mut ring = HashRing::new(config.virtual_nodes.max(1));
        for node in &view.members {
            ring.add_node(*node);
        }
        Self {
            view,
            ring,
            cache_mode: config.cache_mode,
            num_owners: config.num_owners.max(1),
        }
    }

    pub fn topology_id(&self) -> u64 {
        self.view.topology_id
    }

    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    pub fn members(&self) -> BTreeSet<NodeId> {
        self.view.members.clone()
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    /// Nodes holding a writable copy of `key`, primary first.
    pub fn owners(&self, key: &Key) -> Vec<NodeId> {
        match self.cache_mode {
            CacheMode::Replicated => self.view.members.iter().copied().collect(),
            CacheMode::Distributed => self.ring.locate_n(key, self.num_owners),
        }
    }

    pub fn primary_owner(&self, key: &Key) -> Option<NodeId> {
        match self.cache_mode {
            CacheMode::Replicated => self.view.members.iter().next().copied(),
            CacheMode::Distributed => self.ring.locate(key),
        }
    }

    pub fn is_write_owner(&self, node: NodeId, key: &Key) -> bool {
        match self.cache_mode {
            CacheMode::Replicated => self.view.contains(node),
            CacheMode::Distributed => self.owners(key).contains(&node),
        }
    }

    /// Union of the write owners of every key.
    pub fn write_owners<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) -> BTreeSet<NodeId> {
        keys.into_iter().flat_map(|key| self.owners(key)).collect()
    }
}
