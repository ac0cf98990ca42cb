//! Transaction table for Ember.
//!
//! Tracks the transactions a node knows about:
//! - Local transactions, coordinated by this node
//! - Remote transactions, coordinated elsewhere but holding or requesting keys here
//! - Outcomes of finished transactions

use dashmap::DashMap;
use ember_common::prelude::*;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::resource_manager::TransactionHandle;

/// A transaction coordinated by this node.
#[derive(Debug)]
pub struct LocalTransaction {
    id: TxnId,
    /// Keys the transaction attempted to lock
    inspected: RwLock<HashSet<Key>>,
    /// Keys the transaction holds
    locked: RwLock<HashSet<Key>>,
    /// Nodes the transaction sent lock requests to
    touched: RwLock<BTreeSet<NodeId>>,
    handle: Arc<TransactionHandle>,
}

impl LocalTransaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            inspected: RwLock::new(HashSet::new()),
            locked: RwLock::new(HashSet::new()),
            touched: RwLock::new(BTreeSet::new()),
            handle: Arc::new(TransactionHandle::new(id)),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn handle(&self) -> Arc<TransactionHandle> {
        self.handle.clone()
    }

    pub fn add_inspected_key(&self, key: Key) {
        self.inspected.write().insert(key);
    }

    pub fn add_locked_key(&self, key: Key) {
        self.locked.write().insert(key);
    }

    pub fn add_touched_node(&self, node: NodeId) {
        self.touched.write().insert(node);
    }

    pub fn inspected_keys(&self) -> HashSet<Key> {
        self.inspected.read().clone()
    }

    pub fn locked_keys(&self) -> HashSet<Key> {
        self.locked.read().clone()
    }

    /// Inspected keys the transaction does not hold yet.
    pub fn blocked_keys(&self) -> Vec<Key> {
        let locked = self.locked.read();
        self.inspected
            .read()
            .iter()
            .filter(|k| !locked.contains(*k))
            .cloned()
            .collect()
    }

    pub fn is_missing_locks(&self) -> bool {
        let locked = self.locked.read();
        self.inspected.read().iter().any(|k| !locked.contains(k))
    }

    /// True if any inspected key is in `keys`.
    pub fn inspects_any(&self, keys: &[Key]) -> bool {
        let inspected = self.inspected.read();
        keys.iter().any(|k| inspected.contains(k))
    }

    /// True if both transactions inspected a common key.
    pub fn overlaps(&self, other: &LocalTransaction) -> bool {
        if std::ptr::eq(self, other) {
            return !self.inspected.read().is_empty();
        }
        let theirs = other.inspected_keys();
        self.inspected.read().iter().any(|k| theirs.contains(k))
    }

    /// `base` plus every node the transaction already touched.
    pub fn commit_nodes(&self, base: impl IntoIterator<Item = NodeId>) -> BTreeSet<NodeId> {
        let mut nodes: BTreeSet<NodeId> = base.into_iter().collect();
        nodes.extend(self.touched.read().iter().copied());
        nodes
    }

    pub fn is_marked_for_rollback(&self) -> bool {
        self.handle.is_marked_for_rollback()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }
}

/// A transaction coordinated by another node.
#[derive(Debug)]
pub struct RemoteTransaction {
    id: TxnId,
    /// Keys requested on this node
    keys: RwLock<HashSet<Key>>,
    received_deadlock: AtomicBool,
}

impl RemoteTransaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            keys: RwLock::new(HashSet::new()),
            received_deadlock: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn add_key(&self, key: Key) {
        self.keys.write().insert(key);
    }

    pub fn keys(&self) -> Vec<Key> {
        self.keys.read().iter().cloned().collect()
    }

    /// Flag the transaction as a deadlock victim. Returns true the first time.
    pub fn mark_as_deadlock(&self) -> bool {
        !self.received_deadlock.swap(true, Ordering::AcqRel)
    }

    pub fn has_received_deadlock(&self) -> bool {
        self.received_deadlock.load(Ordering::Acquire)
    }
}

/// Kind of a transaction as known on this node.
#[derive(Debug, Clone)]
pub enum TxnRecord {
    Local(Arc<LocalTransaction>),
    Remote(Arc<RemoteTransaction>),
    Unknown,
}

impl TxnRecord {
    pub fn is_local(&self) -> bool {
        matches!(self, TxnRecord::Local(_))
    }
}

/// Transaction table statistics.
#[derive(Debug, Clone, Default)]
pub struct TransactionTableStats {
    pub local: usize,
    pub remote: usize,
    pub committed: u64,
    pub rolled_back: u64,
}

/// Transaction table implementation.
pub struct TransactionTable {
    node: NodeId,
    generator: TxnIdGenerator,
    local: DashMap<TxnId, Arc<LocalTransaction>>,
    remote: DashMap<TxnId, Arc<RemoteTransaction>>,
    /// Finished transactions and whether they committed
    completed: DashMap<TxnId, bool>,
}

impl TransactionTable {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            generator: TxnIdGenerator::new(node),
            local: DashMap::new(),
            remote: DashMap::new(),
            completed: DashMap::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Start a local transaction.
    pub fn begin(&self) -> Arc<LocalTransaction> {
        let id = self.generator.next_id();
        let txn = Arc::new(LocalTransaction::new(id));
        self.local.insert(id, txn.clone());
        debug!(txn = %id, "began transaction");
        txn
    }

    pub fn local_transaction(&self, id: &TxnId) -> Option<Arc<LocalTransaction>> {
        self.local.get(id).map(|t| t.value().clone())
    }

    pub fn remote_transaction(&self, id: &TxnId) -> Option<Arc<RemoteTransaction>> {
        self.remote.get(id).map(|t| t.value().clone())
    }

    pub fn get_or_create_remote_transaction(&self, id: TxnId) -> Arc<RemoteTransaction> {
        self.remote
            .entry(id)
            .or_insert_with(|| Arc::new(RemoteTransaction::new(id)))
            .clone()
    }

    pub fn all_local_transactions(&self) -> Vec<Arc<LocalTransaction>> {
        self.local.iter().map(|t| t.value().clone()).collect()
    }

    /// Resolve the kind of `id` once; local records win over remote ones.
    pub fn lookup(&self, id: &TxnId) -> TxnRecord {
        if let Some(local) = self.local_transaction(id) {
            return TxnRecord::Local(local);
        }
        match self.remote_transaction(id) {
            Some(remote) => TxnRecord::Remote(remote),
            None => TxnRecord::Unknown,
        }
    }

    pub fn is_completed(&self, id: &TxnId) -> bool {
        self.completed.contains_key(id)
    }

    /// Forget `id` and remember its outcome.
    pub fn complete(&self, id: TxnId, committed: bool) {
        if let Some((_, local)) = self.local.remove(&id) {
            local.handle().finish(committed);
        }
        self.remote.remove(&id);
        self.completed.insert(id, committed);
        debug!(txn = %id, committed, "transaction completed");
    }

    pub fn stats(&self) -> TransactionTableStats {
        let (committed, rolled_back) = self.completed.iter().fold((0, 0), |(c, r), e| {
            if *e.value() {
                (c + 1, r)
            } else {
                (c, r + 1)
            }
        });
        TransactionTableStats {
            local: self.local.len(),
            remote: self.remote.len(),
            committed,
            rolled_back,
        }
    }
}
