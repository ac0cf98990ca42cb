//! Testing utilities and fixtures

use crate::types::*;
use bytes::Bytes;

/// Test fixtures for common scenarios
pub mod fixtures {
    use super::*;

    /// A key built from a readable name.
    pub fn key(name: &str) -> Key {
        Bytes::copy_from_slice(name.as_bytes())
    }

    /// `count` distinct keys named `{prefix}{i}`.
    pub fn keys(prefix: &str, count: usize) -> Vec<Key> {
        (0..count).map(|i| key(&format!("{}{}", prefix, i))).collect()
    }

    /// A transaction id created on `node` with the given sequence.
    pub fn txn(sequence: u64, node: u64) -> TxnId {
        TxnId::new(sequence, NodeId(node))
    }

    /// Node ids `1..=count`.
    pub fn nodes(count: u64) -> Vec<NodeId> {
        (1..=count).map(NodeId).collect()
    }
}
