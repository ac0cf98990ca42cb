//! In-process grid used by the cluster integration tests.
//!
//! Every node shares one [`InMemoryNetwork`]. A transaction locks a key on
//! every owner its origin node computes from its own view, so a node that
//! installed a partitioned view only locks on its side.

#![allow(dead_code)]

use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use ember_cluster::{GridNode, InMemoryNetwork};
use ember_common::logging::init_logging;
use ember_common::prelude::*;
use ember_txn::{LocalTransaction, ResourceManager, ThreadBoundResourceManager};

pub struct TestCluster {
    pub network: Arc<InMemoryNetwork>,
    nodes: Vec<Arc<GridNode>>,
}

impl TestCluster {
    pub async fn start(count: u64, configure: impl Fn(&mut GridConfig)) -> Arc<Self> {
        Self::start_with(count, configure, |_| Arc::new(ThreadBoundResourceManager::new())).await
    }

    pub async fn start_with(
        count: u64,
        configure: impl Fn(&mut GridConfig),
        resource_manager: impl Fn(NodeId) -> Arc<dyn ResourceManager>,
    ) -> Arc<Self> {
        init_logging(&LoggingConfig::default());

        let network = InMemoryNetwork::new();
        let members: Vec<NodeId> = (1..=count).map(NodeId).collect();
        let mut nodes = Vec::new();
        for id in &members {
            let mut config = GridConfig {
                node_id: id.0,
                ..GridConfig::default()
            };
            config.cluster.rpc_timeout = Duration::from_secs(2);
            config.transaction.lock_acquisition_timeout = Duration::from_secs(10);
            configure(&mut config);

            let node = GridNode::start(config, network.clone(), members.clone(), resource_manager(*id))
                .await
                .expect("node starts");
            nodes.push(node);
        }

        Arc::new(Self { network, nodes })
    }

    pub fn node(&self, id: u64) -> &Arc<GridNode> {
        self.try_node(NodeId(id)).expect("node exists")
    }

    fn try_node(&self, id: NodeId) -> Option<&Arc<GridNode>> {
        self.nodes.iter().find(|n| n.node_id() == id)
    }

    pub fn nodes(&self) -> &[Arc<GridNode>] {
        &self.nodes
    }

    pub fn begin(&self, node: u64) -> TxnId {
        self.node(node).begin().id()
    }

    pub fn local(&self, txn: TxnId) -> Arc<LocalTransaction> {
        self.node(txn.node().0)
            .txn_table()
            .local_transaction(&txn)
            .expect("transaction is running")
    }

    /// Lock `key` for `txn` on every owner known to its origin node.
    pub async fn lock(&self, txn: TxnId, key: &Key) -> Result<()> {
        let origin = self.node(txn.node().0);
        let local = origin
            .txn_table()
            .local_transaction(&txn)
            .ok_or(TransactionError::NotFound(txn))?;

        local.add_inspected_key(key.clone());
        let targets = origin.lock_targets(key);
        for target in &targets {
            local.add_touched_node(*target);
        }

        let results = join_all(
            targets
                .iter()
                .filter_map(|target| self.try_node(*target))
                .map(|node| node.acquire_for(txn, key.clone())),
        )
        .await;
        for result in results {
            result?;
        }

        local.add_locked_key(key.clone());
        Ok(())
    }

    pub fn spawn_lock(self: &Arc<Self>, txn: TxnId, key: Key) -> JoinHandle<Result<()>> {
        let cluster = self.clone();
        tokio::spawn(async move { cluster.lock(txn, &key).await })
    }

    /// Wait until `txn` is queued for `key` on every node it locks on.
    pub async fn wait_queued(&self, txn: TxnId, key: &Key) {
        let targets = self.node(txn.node().0).lock_targets(key);
        let owner = LockOwner::Transaction(txn);
        let queued = wait_until(|| {
            targets.iter().all(|target| {
                self.node(target.0)
                    .lock_table()
                    .pending_owners_of(key)
                    .contains(&owner)
            })
        })
        .await;
        assert!(queued, "{} never queued for {}", txn, display_key(key));
    }

    pub fn commit(&self, txn: TxnId) {
        self.finish(txn, true);
    }

    pub fn rollback(&self, txn: TxnId) {
        self.finish(txn, false);
    }

    fn finish(&self, txn: TxnId, committed: bool) {
        for node in &self.nodes {
            node.complete(txn, committed);
        }
    }

    /// A key whose primary owner is `node`.
    pub fn key_owned_by(&self, node: u64, prefix: &str) -> Key {
        let topology = self.node(node).topology();
        (0..10_000)
            .map(|i| Key::from(format!("{}{}", prefix, i)))
            .find(|key| topology.primary_owner(key) == Some(NodeId(node)))
            .expect("some key lands on every node")
    }

    pub fn total_resolved(&self) -> u64 {
        self.nodes.iter().map(|n| n.deadlock_stats().deadlocks_resolved).sum()
    }

    pub fn total_marked(&self) -> u64 {
        self.nodes.iter().map(|n| n.lock_table().stats().deadlocked).sum()
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

/// Poll `condition` for up to five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await a spawned lock, failing the test if it hangs.
pub async fn outcome(handle: JoinHandle<Result<()>>) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("lock settles")
        .expect("lock task completes")
}
