//! Grid node assembly.
//!
//! Wires the lock table, transaction table, membership, transport and the
//! configured deadlock detection of one node together.

use std::collections::BTreeSet;
use std::sync::Arc;
use ember_common::prelude::*;
use ember_txn::{
    DeadlockDetection, LocalTransaction, LockTable, NoopDeadlockDetection, ResourceManager,
    TransactionTable, TxnRecord,
};

use crate::deadlock::{DeadlockStats, DistributedDeadlockDetection};
use crate::membership::Membership;
use crate::topology::ClusterTopology;
use crate::transport::{InMemoryNetwork, InMemoryTransport, ProbeHandler};

/// One node of an in-process grid.
pub struct GridNode {
    config: GridConfig,
    node_id: NodeId,
    membership: Arc<Membership>,
    lock_table: Arc<LockTable>,
    txn_table: Arc<TransactionTable>,
    /// Detection as seen by the lock path
    detection: Arc<dyn DeadlockDetection>,
    /// Set when distributed detection is configured
    engine: Option<Arc<DistributedDeadlockDetection>>,
    network: Arc<InMemoryNetwork>,
}

impl GridNode {
    /// Validate `config`, join `network` and start deadlock detection.
    pub async fn start(
        config: GridConfig,
        network: Arc<InMemoryNetwork>,
        members: impl IntoIterator<Item = NodeId>,
        resource_manager: Arc<dyn ResourceManager>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;

        let node_id = NodeId(config.node_id);
        info!(node = %node_id, cluster = %config.cluster.cluster_name, "starting grid node");

        let membership = Arc::new(Membership::new(node_id, members));
        let lock_table = Arc::new(LockTable::new());
        let txn_table = Arc::new(TransactionTable::new(node_id));
        let transport = Arc::new(InMemoryTransport::new(
            node_id,
            network.clone(),
            config.cluster.rpc_timeout,
        ));

        let (detection, engine): (Arc<dyn DeadlockDetection>, Option<Arc<DistributedDeadlockDetection>>) =
            if config.transaction.deadlock_detection.is_active(&config.transaction) {
                let engine = DistributedDeadlockDetection::new(
                    &config,
                    lock_table.clone(),
                    txn_table.clone(),
                    membership.clone(),
                    transport,
                    resource_manager,
                );
                let handler: Arc<dyn ProbeHandler> = engine.clone();
                network.register(node_id, Arc::downgrade(&handler));
                engine.start()?;
                let detection: Arc<dyn DeadlockDetection> = engine.clone();
                (detection, Some(engine))
            } else {
                info!(node = %node_id, "deadlock detection disabled");
                let detection: Arc<dyn DeadlockDetection> = Arc::new(NoopDeadlockDetection);
                (detection, None)
            };

        Ok(Arc::new(Self {
            config,
            node_id,
            membership,
            lock_table,
            txn_table,
            detection,
            engine,
            network,
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.lock_table
    }

    pub fn txn_table(&self) -> &Arc<TransactionTable> {
        &self.txn_table
    }

    pub fn detection(&self) -> &Arc<dyn DeadlockDetection> {
        &self.detection
    }

    pub fn engine(&self) -> Option<&Arc<DistributedDeadlockDetection>> {
        self.engine.as_ref()
    }

    /// Detection statistics; all zero when detection is disabled.
    pub fn deadlock_stats(&self) -> DeadlockStats {
        self.engine.as_ref().map(|e| e.stats()).unwrap_or_default()
    }

    /// Placement at the installed view.
    pub fn topology(&self) -> ClusterTopology {
        ClusterTopology::new(self.membership.view(), &self.config.cluster)
    }

    /// Nodes a lock on `key` must be acquired on.
    pub fn lock_targets(&self, key: &Key) -> BTreeSet<NodeId> {
        self.topology().owners(key).into_iter().collect()
    }

    pub fn begin(&self) -> Arc<LocalTransaction> {
        self.txn_table.begin()
    }

    /// Acquire `key` on this node on behalf of `txn`.
    ///
    /// A transaction already chosen as deadlock victim fails right away.
    pub async fn acquire_for(&self, txn: TxnId, key: Key) -> Result<()> {
        match self.txn_table.lookup(&txn) {
            TxnRecord::Local(local) => {
                if local.is_marked_for_rollback() {
                    return Err(Error::deadlock(txn));
                }
            }
            _ if txn.node() != self.node_id => {
                let remote = self.txn_table.get_or_create_remote_transaction(txn);
                remote.add_key(key.clone());
                if remote.has_received_deadlock() {
                    return Err(Error::deadlock(txn));
                }
            }
            _ => return Err(TransactionError::NotFound(txn).into()),
        }

        self.lock_table
            .lock(
                LockOwner::Transaction(txn),
                key,
                self.config.transaction.lock_acquisition_timeout,
            )
            .await?;
        Ok(())
    }

    /// Release every lock of `txn` here and record its outcome.
    pub fn complete(&self, txn: TxnId, committed: bool) -> usize {
        let released = self.lock_table.release_all(&LockOwner::Transaction(txn));
        self.txn_table.complete(txn, committed);
        released
    }

    /// Stop detection and leave the network.
    pub fn shutdown(&self) {
        if let Some(engine) = &self.engine {
            engine.stop();
        }
        self.network.unregister(self.node_id);
        info!(node = %self.node_id, "grid node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::testing::fixtures::key;
    use ember_txn::ThreadBoundResourceManager;

    fn config(node_id: u64) -> GridConfig {
        GridConfig {
            node_id,
            ..GridConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_selects_detection() {
        let network = InMemoryNetwork::new();
        let rm: Arc<dyn ResourceManager> = Arc::new(ThreadBoundResourceManager::new());

        let enabled = GridNode::start(config(1), network.clone(), [NodeId(1)], rm.clone())
            .await
            .unwrap();
        assert!(enabled.detection().is_enabled());
        assert!(enabled.engine().unwrap().is_running());

        let mut disabled_config = config(2);
        disabled_config.transaction.deadlock_detection.enabled = false;
        let disabled = GridNode::start(disabled_config, network, [NodeId(2)], rm)
            .await
            .unwrap();
        assert!(!disabled.detection().is_enabled());
        assert!(disabled.engine().is_none());
        assert_eq!(disabled.deadlock_stats().probes_initiated, 0);

        enabled.shutdown();
        assert!(!enabled.engine().unwrap().is_running());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut bad = config(1);
        bad.cluster.num_owners = 0;
        let result = GridNode::start(
            bad,
            InMemoryNetwork::new(),
            [NodeId(1)],
            Arc::new(ThreadBoundResourceManager::new()),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_acquire_for_remote_victim_fails_fast() {
        let node = GridNode::start(
            config(1),
            InMemoryNetwork::new(),
            [NodeId(1), NodeId(2)],
            Arc::new(ThreadBoundResourceManager::new()),
        )
        .await
        .unwrap();
        let remote = TxnId::new(1, NodeId(2));

        node.acquire_for(remote, key("k1")).await.unwrap();
        assert_eq!(node.lock_table().owner_of(&key("k1")), Some(LockOwner::Transaction(remote)));

        node.txn_table().get_or_create_remote_transaction(remote).mark_as_deadlock();
        let err = node.acquire_for(remote, key("k2")).await.unwrap_err();
        assert!(err.is_deadlock());

        assert_eq!(node.complete(remote, false), 1);
        assert!(node.txn_table().is_completed(&remote));

        let unknown = TxnId::new(7, NodeId(1));
        assert!(node.acquire_for(unknown, key("k1")).await.is_err());
    }
}
