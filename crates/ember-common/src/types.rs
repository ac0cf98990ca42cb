//! Core types for Ember

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique transaction identifier.
///
/// Carries the creation sequence of the node that started the transaction
/// together with that node's identity. Every node compares two ids the same
/// way without any coordination: sequences first, node identity as the
/// tie-break. A transaction created later on a node compares greater than
/// the ones that node created before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId {
    sequence: u64,
    node: NodeId,
}

impl TxnId {
    pub const fn new(sequence: u64, node: NodeId) -> Self {
        Self { sequence, node }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The node that created the transaction and coordinates it.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// True when `self` was created after `other` under the cluster-wide order.
    pub fn is_newer_than(&self, other: &TxnId) -> bool {
        self > other
    }
}

impl Ord for TxnId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for TxnId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}@{}", self.sequence, self.node.0)
    }
}

/// Thread-safe transaction id generator, one per node.
pub struct TxnIdGenerator {
    node: NodeId,
    counter: AtomicU64,
}

impl TxnIdGenerator {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            counter: AtomicU64::new(0),
        }
    }

    /// Generate the next id. Sequences start at 1 and never repeat on a node.
    pub fn next_id(&self) -> TxnId {
        let sequence = self.counter.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        TxnId::new(sequence, self.node)
    }

    pub fn node(&self) -> NodeId {
        self.node
    }
}

// ============================================================================
// Lock owners and keys
// ============================================================================

/// Cache key. Keys are opaque bytes.
pub type Key = Bytes;

/// Render a key for logs and error messages.
pub fn display_key(key: &Key) -> String {
    String::from_utf8_lossy(key).into_owned()
}

/// Anything that can own or wait for a key lock.
///
/// Only transactions take part in deadlock detection; non-transactional
/// commands lock keys too but are never probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockOwner {
    Transaction(TxnId),
    Command(u64),
}

impl LockOwner {
    pub fn as_transaction(&self) -> Option<TxnId> {
        match self {
            LockOwner::Transaction(txn) => Some(*txn),
            LockOwner::Command(_) => None,
        }
    }

    pub fn is_transaction(&self, txn: TxnId) -> bool {
        self.as_transaction() == Some(txn)
    }
}

impl From<TxnId> for LockOwner {
    fn from(txn: TxnId) -> Self {
        LockOwner::Transaction(txn)
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::Transaction(txn) => write!(f, "{}", txn),
            LockOwner::Command(id) => write!(f, "cmd:{}", id),
        }
    }
}
