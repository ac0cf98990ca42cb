//! Distributed Deadlock Detection
//!
//! Edge-chasing detection over the lock and transaction tables:
//! - A newer transaction waiting for an older one sends a probe to the
//!   holder's node; the older one never probes the newer
//! - Each node relays the probe to the owners of the keys the holder waits
//!   for, and lets local waiters on those keys join the wave
//! - A probe that comes back to its initiator closes a cycle; the initiator
//!   is aborted and every node holding its locks is told to release its waiters
//! - After partitions merge, every local waiter probes again

use dashmap::DashSet;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ember_common::prelude::*;
use ember_txn::{
    DeadlockDetection, ListenerId, LocalTransaction, LockTable, ResourceManager, TransactionTable,
    TxnRecord,
};

use crate::listeners::{spawn_view_listener, DeadlockLockListener};
use crate::membership::Membership;
use crate::probe::{DispatchStats, ProbeDispatcher};
use crate::topology::ClusterTopology;
use crate::transport::{DeadlockProbe, ProbeHandler, ProbeResponse, RpcTransport};

/// Deadlock detection statistics.
#[derive(Debug, Clone, Default)]
pub struct DeadlockStats {
    /// Probes started for a waiting transaction
    pub probes_initiated: u64,
    /// Waits that did not start a probe because the waiter is older
    pub probes_suppressed: u64,
    /// Probes evaluated by this node
    pub probes_handled: u64,
    /// Probes relayed to the owner of a key
    pub relays: u64,
    /// Probes joined by a local waiter
    pub piggybacks: u64,
    /// Cycles closed without leaving this node
    pub local_deadlocks: u64,
    /// Transactions aborted by this node
    pub deadlocks_resolved: u64,
    pub rollback_failures: u64,
    pub rearm_passes: u64,
}

/// Runs the blocking rollback-only marking off the async workers.
///
/// The pool size bounds how many markings run at once; with the default of
/// one, rollbacks caused by detection are applied one after another.
pub struct RollbackExecutor {
    permits: Semaphore,
    resource_manager: Arc<dyn ResourceManager>,
}

impl RollbackExecutor {
    pub fn new(pool_size: usize, resource_manager: Arc<dyn ResourceManager>) -> Self {
        Self {
            permits: Semaphore::new(pool_size.max(1)),
            resource_manager,
        }
    }

    pub async fn mark_rollback_only(&self, txn: Arc<LocalTransaction>) -> Result<()> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled("rollback executor closed".to_string()))?;

        let resource_manager = self.resource_manager.clone();
        tokio::task::spawn_blocking(move || resource_manager.mark_rollback_only(&txn))
            .await
            .map_err(|e| Error::internal(format!("rollback task failed: {}", e)))?
    }
}

/// Marks a probe pair as being evaluated on this node.
struct InFlight<'a> {
    pairs: &'a DashSet<(TxnId, TxnId)>,
    pair: (TxnId, TxnId),
}

impl<'a> InFlight<'a> {
    fn enter(pairs: &'a DashSet<(TxnId, TxnId)>, pair: (TxnId, TxnId)) -> Option<Self> {
        pairs.insert(pair).then(|| Self { pairs, pair })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.pairs.remove(&self.pair);
    }
}

struct Lifecycle {
    listener_id: ListenerId,
    cancel: CancellationToken,
    view_listener: JoinHandle<()>,
}

/// Deadlock detection for one node of the grid.
pub struct DistributedDeadlockDetection {
    node_id: NodeId,
    config: DeadlockDetectionConfig,
    cluster: ClusterConfig,
    lock_table: Arc<LockTable>,
    txn_table: Arc<TransactionTable>,
    membership: Arc<Membership>,
    dispatcher: ProbeDispatcher,
    rollback: RollbackExecutor,
    /// Placement at the last seen topology
    topology: Mutex<Option<Arc<ClusterTopology>>>,
    /// Probe pairs currently evaluated here
    in_flight: DashSet<(TxnId, TxnId)>,
    /// Re-arm requests since the running pass started
    piggyback: AtomicUsize,
    lifecycle: Mutex<Option<Lifecycle>>,
    stats: Mutex<DeadlockStats>,
    self_ref: Weak<Self>,
}

impl DistributedDeadlockDetection {
    pub fn new(
        config: &GridConfig,
        lock_table: Arc<LockTable>,
        txn_table: Arc<TransactionTable>,
        membership: Arc<Membership>,
        transport: Arc<dyn RpcTransport>,
        resource_manager: Arc<dyn ResourceManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref: &Weak<Self>| {
            let handler: Weak<dyn ProbeHandler> = self_ref.clone();
            Self {
                node_id: membership.node_id(),
                config: config.transaction.deadlock_detection.clone(),
                cluster: config.cluster.clone(),
                lock_table,
                txn_table,
                dispatcher: ProbeDispatcher::new(membership.clone(), transport, handler),
                membership,
                rollback: RollbackExecutor::new(
                    config.transaction.deadlock_detection.rollback_pool_size,
                    resource_manager,
                ),
                topology: Mutex::new(None),
                in_flight: DashSet::new(),
                piggyback: AtomicUsize::new(0),
                lifecycle: Mutex::new(None),
                stats: Mutex::new(DeadlockStats::default()),
                self_ref: self_ref.clone(),
            }
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Register the lock listener and start listening for merged views.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::internal(format!("deadlock detection needs a runtime: {}", e)))?;
        let detection: Weak<dyn DeadlockDetection> = self.self_ref.clone();

        let listener_id = self
            .lock_table
            .add_listener(Arc::new(DeadlockLockListener::new(detection.clone())));
        let cancel = CancellationToken::new();
        let view_listener = spawn_view_listener(
            &runtime,
            detection,
            self.membership.subscribe(),
            cancel.clone(),
        );

        *lifecycle = Some(Lifecycle {
            listener_id,
            cancel,
            view_listener,
        });
        info!(node = %self.node_id, "deadlock detection started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(lifecycle) = self.lifecycle.lock().take() {
            lifecycle.cancel.cancel();
            self.lock_table.remove_listener(lifecycle.listener_id);
            drop(lifecycle.view_listener);
            info!(node = %self.node_id, "deadlock detection stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().is_some()
    }

    pub fn stats(&self) -> DeadlockStats {
        self.stats.lock().clone()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    fn topology(&self) -> Arc<ClusterTopology> {
        let view = self.membership.view();
        let mut cached = self.topology.lock();
        match cached.as_ref() {
            Some(topology) if topology.topology_id() == view.topology_id => topology.clone(),
            _ => {
                let topology = Arc::new(ClusterTopology::new(view, &self.cluster));
                *cached = Some(topology.clone());
                topology
            }
        }
    }

    /// Completed, rolled back locally, or already told it is a deadlock victim.
    fn is_terminal(&self, txn: TxnId) -> bool {
        if self.txn_table.is_completed(&txn) {
            return true;
        }
        match self.txn_table.lookup(&txn) {
            TxnRecord::Local(local) => local.is_marked_for_rollback() || !local.is_active(),
            TxnRecord::Remote(remote) => remote.has_received_deadlock(),
            TxnRecord::Unknown => false,
        }
    }

    /// Both are local, share a key, and the holder waits behind the initiator.
    fn is_local_deadlock(&self, initiator: TxnId, holder: TxnId) -> bool {
        let (Some(waiting), Some(holding)) = (
            self.txn_table.local_transaction(&initiator),
            self.txn_table.local_transaction(&holder),
        ) else {
            return false;
        };
        if !waiting.overlaps(&holding) {
            return false;
        }

        let initiator = LockOwner::Transaction(initiator);
        let holder = LockOwner::Transaction(holder);
        holding
            .blocked_keys()
            .iter()
            .any(|key| self.is_queued_behind(key, &holder, &initiator))
    }

    /// `waiter` is queued on `key` and `ahead` owns it or is queued before it.
    fn is_queued_behind(&self, key: &Key, waiter: &LockOwner, ahead: &LockOwner) -> bool {
        let pending = self.lock_table.pending_owners_of(key);
        let Some(waiter_pos) = pending.iter().position(|o| o == waiter) else {
            return false;
        };
        if self.lock_table.owner_of(key).as_ref() == Some(ahead) {
            return true;
        }
        pending[..waiter_pos].contains(ahead)
    }

    async fn send_probe(&self, target: NodeId, initiator: TxnId, holder: TxnId) -> Result<()> {
        let probe = DeadlockProbe::new(initiator, holder, &self.membership.view());
        trace!(%target, %initiator, %holder, "sending deadlock probe");
        self.dispatcher.send(target, probe).await
    }

    async fn verify(&self, initiator: TxnId, holder: TxnId, keys: &[Key]) -> Result<()> {
        if initiator == holder {
            return self.resolve(initiator).await;
        }
        if self.is_local_deadlock(initiator, holder) {
            debug!(%initiator, %holder, "local deadlock detected");
            self.stats.lock().local_deadlocks += 1;
            return self.resolve(initiator).await;
        }

        if self.is_terminal(holder) || self.is_terminal(initiator) {
            trace!(%initiator, %holder, "probe chain is stale");
            return Ok(());
        }

        let Some(_in_flight) = InFlight::enter(&self.in_flight, (initiator, holder)) else {
            trace!(%initiator, %holder, "probe already evaluated on this node");
            return Ok(());
        };

        self.probe_lock_owners(initiator, holder, keys).await;
        Ok(())
    }

    /// Relay `{initiator, _}` to everyone `holder` is waiting for.
    async fn probe_lock_owners(&self, initiator: TxnId, holder: TxnId, keys: &[Key]) {
        let mut probed: HashSet<TxnId> = HashSet::from([holder]);
        let mut branches: Vec<(NodeId, TxnId)> = Vec::new();
        let mut relays = 0;
        let mut piggybacks = 0;

        for key in keys {
            let owner = self.lock_table.owner_of(key).and_then(|o| o.as_transaction());
            if let Some(owner) = owner {
                if probed.insert(owner) {
                    relays += 1;
                    branches.push((owner.node(), owner));
                }
            }
        }

        // Blocked keys locked on other nodes are chased by their primary owner
        let topology = self.topology();
        if topology.cache_mode() == CacheMode::Distributed && self.txn_table.lookup(&holder).is_local() {
            let mut forwarded = BTreeSet::new();
            for key in keys {
                if topology.is_write_owner(self.node_id, key) {
                    continue;
                }
                if let Some(primary) = topology.primary_owner(key) {
                    if primary != self.node_id && forwarded.insert(primary) {
                        relays += 1;
                        branches.push((primary, holder));
                    }
                }
            }
        }

        let initiator_owner = LockOwner::Transaction(initiator);
        let holder_owner = LockOwner::Transaction(holder);
        for local in self.txn_table.all_local_transactions() {
            let waiter = local.id();
            if !local.is_missing_locks() || !local.inspects_any(keys) {
                continue;
            }
            if waiter == holder {
                let blocked_by_initiator = keys
                    .iter()
                    .any(|key| self.is_queued_behind(key, &holder_owner, &initiator_owner));
                if blocked_by_initiator && probed.insert(initiator) {
                    piggybacks += 1;
                    branches.push((initiator.node(), initiator));
                }
            } else {
                let waiter_owner = LockOwner::Transaction(waiter);
                let holder_waits = keys
                    .iter()
                    .any(|key| self.is_queued_behind(key, &holder_owner, &waiter_owner));
                if holder_waits && probed.insert(waiter) {
                    piggybacks += 1;
                    branches.push((waiter.node(), waiter));
                }
            }
        }

        if branches.is_empty() {
            trace!(%initiator, %holder, "probe chain ends here");
            return;
        }

        {
            let mut stats = self.stats.lock();
            stats.relays += relays;
            stats.piggybacks += piggybacks;
        }
        debug!(%initiator, %holder, branches = branches.len(), "relaying deadlock probe");

        let results = join_all(
            branches
                .iter()
                .map(|(target, next)| self.send_probe(*target, initiator, *next)),
        )
        .await;

        for ((target, next), result) in branches.iter().zip(results) {
            if let Err(e) = result {
                warn!(%target, %initiator, holder = %next, error = %e, "deadlock probe branch failed");
            }
        }
    }

    /// Abort `initiator` and release everything waiting on its behalf.
    async fn resolve(&self, initiator: TxnId) -> Result<()> {
        let Some(_resolving) = InFlight::enter(&self.in_flight, (initiator, initiator)) else {
            trace!(txn = %initiator, "deadlock resolution already running");
            return Ok(());
        };
        let was_terminal = self.is_terminal(initiator);
        let record = self.txn_table.lookup(&initiator);

        match &record {
            TxnRecord::Local(local) if local.is_active() => {
                if let Err(e) = self.rollback.mark_rollback_only(local.clone()).await {
                    error!(txn = %initiator, error = %e, "failed to mark deadlocked transaction rollback-only");
                    self.stats.lock().rollback_failures += 1;
                }
            }
            TxnRecord::Local(_) => {}
            TxnRecord::Remote(remote) => {
                remote.mark_as_deadlock();
            }
            TxnRecord::Unknown => {
                // Notify overtook the first lock command of the transaction
                if !self.txn_table.is_completed(&initiator) {
                    self.txn_table
                        .get_or_create_remote_transaction(initiator)
                        .mark_as_deadlock();
                }
            }
        }

        let marked = self
            .lock_table
            .mark_deadlocked(|pending, _| pending.is_transaction(initiator));

        if !was_terminal {
            self.stats.lock().deadlocks_resolved += 1;
            info!(node = %self.node_id, txn = %initiator, marked, "deadlock resolved, transaction aborted");
        }

        if let TxnRecord::Local(local) = record {
            if was_terminal && marked == 0 {
                trace!(txn = %initiator, "deadlock already resolved");
                return Ok(());
            }
            self.notify_deadlock(&local).await;
        }
        Ok(())
    }

    /// Tell every node holding locks of `local` that it is a deadlock victim.
    async fn notify_deadlock(&self, local: &LocalTransaction) {
        let initiator = local.id();
        loop {
            let topology = self.topology();
            let base = match topology.cache_mode() {
                CacheMode::Replicated => topology.members(),
                CacheMode::Distributed => topology.write_owners(&local.inspected_keys()),
            };
            let mut targets = local.commit_nodes(base);
            targets.remove(&self.node_id);

            debug!(txn = %initiator, ?targets, topology_id = topology.topology_id(), "broadcasting deadlock");
            let probe = DeadlockProbe::new(initiator, initiator, topology.view());
            match self.dispatcher.send_all(targets, probe).await {
                Ok(()) => return,
                Err(e) if e.is_retryable() => {
                    if self.txn_table.is_completed(&initiator) {
                        return;
                    }
                    debug!(txn = %initiator, "deadlock broadcast hit a newer topology, waiting to retry");
                    let next = topology.topology_id() + 1;
                    if let Err(e) = self
                        .membership
                        .wait_for_topology(next, self.config.topology_retry_timeout)
                        .await
                    {
                        warn!(txn = %initiator, error = %e, "giving up deadlock broadcast");
                        return;
                    }
                }
                Err(e) => {
                    warn!(txn = %initiator, error = %e, "deadlock broadcast failed");
                    return;
                }
            }
        }
    }

    /// One pass over the local waiters.
    async fn rearm_pass(&self) {
        self.stats.lock().rearm_passes += 1;

        let mut probes: Vec<(TxnId, TxnId)> = Vec::new();
        let mut suppressed = 0;
        for local in self.txn_table.all_local_transactions() {
            let waiter = local.id();
            if !local.is_missing_locks() || self.is_terminal(waiter) {
                continue;
            }
            let mut owners = HashSet::new();
            for key in local.blocked_keys() {
                let Some(owner) = self.lock_table.owner_of(&key).and_then(|o| o.as_transaction()) else {
                    continue;
                };
                if owner == waiter || !owners.insert(owner) {
                    continue;
                }
                if waiter.is_newer_than(&owner) {
                    probes.push((waiter, owner));
                } else {
                    suppressed += 1;
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.probes_initiated += probes.len() as u64;
            stats.probes_suppressed += suppressed;
        }
        debug!(node = %self.node_id, probes = probes.len(), "re-arming deadlock detection");

        let results = join_all(
            probes
                .iter()
                .map(|(waiter, owner)| self.send_probe(owner.node(), *waiter, *owner)),
        )
        .await;
        for ((waiter, owner), result) in probes.iter().zip(results) {
            if let Err(e) = result {
                warn!(%waiter, %owner, error = %e, "re-armed probe failed");
            }
        }
    }
}

#[async_trait]
impl DeadlockDetection for DistributedDeadlockDetection {
    fn initialize_deadlock_detection(
        &self,
        initiator: &LockOwner,
        holder: &LockOwner,
    ) -> Option<JoinHandle<()>> {
        let (Some(initiator), Some(holder)) = (initiator.as_transaction(), holder.as_transaction()) else {
            return None;
        };
        if !initiator.is_newer_than(&holder) {
            trace!(%initiator, %holder, "older transaction does not probe");
            self.stats.lock().probes_suppressed += 1;
            return None;
        }

        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let engine = self.self_ref.upgrade()?;
        self.stats.lock().probes_initiated += 1;
        debug!(%initiator, %holder, "starting deadlock detection");

        Some(runtime.spawn(async move {
            if let Err(e) = engine.send_probe(holder.node(), initiator, holder).await {
                warn!(%initiator, %holder, error = %e, "deadlock detection round failed");
            }
        }))
    }

    async fn verify_deadlock_cycle(
        &self,
        initiator: &LockOwner,
        holder: &LockOwner,
        keys: &[Key],
    ) -> Result<()> {
        match (initiator.as_transaction(), holder.as_transaction()) {
            (Some(initiator), Some(holder)) => self.verify(initiator, holder, keys).await,
            _ => Ok(()),
        }
    }

    async fn probe_all_local_transactions(&self) -> Result<()> {
        if self.piggyback.fetch_add(1, Ordering::SeqCst) > 0 {
            trace!(node = %self.node_id, "re-arm pass already running");
            return Ok(());
        }

        loop {
            self.rearm_pass().await;
            if self.piggyback.swap(0, Ordering::SeqCst) > 1 {
                // Requested again while running
                if self.piggyback.fetch_add(1, Ordering::SeqCst) > 0 {
                    break;
                }
                continue;
            }
            break;
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

#[async_trait]
impl ProbeHandler for DistributedDeadlockDetection {
    async fn handle_probe(&self, from: NodeId, probe: DeadlockProbe) -> ProbeResponse {
        let view = self.membership.view();
        if probe.is_outdated_for(&view) {
            trace!(%from, probe.topology_id, current = view.topology_id, "probe from an older topology");
            return ProbeResponse::Unsure {
                topology_id: view.topology_id,
            };
        }
        self.stats.lock().probes_handled += 1;

        let keys = match self.txn_table.lookup(&probe.holder) {
            TxnRecord::Local(local) => local.blocked_keys(),
            TxnRecord::Remote(remote) => remote.keys(),
            TxnRecord::Unknown => Vec::new(),
        };
        trace!(%from, initiator = %probe.initiator, holder = %probe.holder, keys = keys.len(), "deadlock probe received");

        match self.verify(probe.initiator, probe.holder, &keys).await {
            Ok(()) => ProbeResponse::Success,
            Err(e) => ProbeResponse::Exception(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemoryNetwork, InMemoryTransport};
    use ember_common::testing::fixtures::key;
    use ember_txn::{LockPromise, ThreadBoundResourceManager};
    use std::time::Duration;

    struct Fixture {
        engine: Arc<DistributedDeadlockDetection>,
        lock_table: Arc<LockTable>,
        txn_table: Arc<TransactionTable>,
        network: Arc<InMemoryNetwork>,
    }

    fn single_node() -> Fixture {
        let config = GridConfig::default();
        let node = NodeId(config.node_id);
        let network = InMemoryNetwork::new();
        let lock_table = Arc::new(LockTable::new());
        let txn_table = Arc::new(TransactionTable::new(node));
        let membership = Arc::new(Membership::new(node, [node]));
        let transport = Arc::new(InMemoryTransport::new(node, network.clone(), Duration::from_secs(1)));
        let engine = DistributedDeadlockDetection::new(
            &config,
            lock_table.clone(),
            txn_table.clone(),
            membership,
            transport,
            Arc::new(ThreadBoundResourceManager::new()),
        );
        Fixture {
            engine,
            lock_table,
            txn_table,
            network,
        }
    }

    fn owner(txn: &LocalTransaction) -> LockOwner {
        LockOwner::Transaction(txn.id())
    }

    #[tokio::test]
    async fn test_local_cycle_aborts_newer() {
        let f = single_node();
        let older = f.txn_table.begin();
        let newer = f.txn_table.begin();
        let (k1, k2) = (key("k1"), key("k2"));

        for (txn, held, wanted) in [(&older, &k1, &k2), (&newer, &k2, &k1)] {
            txn.add_inspected_key(held.clone());
            txn.add_inspected_key(wanted.clone());
            assert!(f.lock_table.acquire(owner(txn), held.clone()).is_granted());
            txn.add_locked_key(held.clone());
        }
        let LockPromise::Pending(older_wait) = f.lock_table.acquire(owner(&older), k2.clone()) else {
            panic!("k2 is held");
        };
        let LockPromise::Pending(newer_wait) = f.lock_table.acquire(owner(&newer), k1.clone()) else {
            panic!("k1 is held");
        };

        f.engine
            .verify_deadlock_cycle(&owner(&newer), &owner(&older), &older.blocked_keys())
            .await
            .unwrap();

        let err = newer_wait.await.unwrap().unwrap_err();
        assert!(matches!(err, TransactionError::Deadlock { txn } if txn == newer.id()));
        assert!(newer.is_marked_for_rollback());
        assert!(older.is_active());
        drop(older_wait);

        let stats = f.engine.stats();
        assert_eq!(stats.local_deadlocks, 1);
        assert_eq!(stats.deadlocks_resolved, 1);
        assert_eq!(f.network.total_sent(), 0);
    }

    #[tokio::test]
    async fn test_wait_without_cycle() {
        let f = single_node();
        let older = f.txn_table.begin();
        let newer = f.txn_table.begin();
        let k1 = key("k1");

        older.add_inspected_key(k1.clone());
        newer.add_inspected_key(k1.clone());
        assert!(f.lock_table.acquire(owner(&older), k1.clone()).is_granted());
        let _wait = f.lock_table.acquire(owner(&newer), k1.clone());

        f.engine
            .verify_deadlock_cycle(&owner(&newer), &owner(&older), &older.blocked_keys())
            .await
            .unwrap();

        assert!(newer.is_active());
        assert_eq!(f.engine.stats().deadlocks_resolved, 0);
        assert_eq!(f.lock_table.pending_owners_of(&k1), vec![owner(&newer)]);
    }

    #[tokio::test]
    async fn test_initialize_respects_recency() {
        let f = single_node();
        let older = f.txn_table.begin();
        let newer = f.txn_table.begin();

        assert!(f
            .engine
            .initialize_deadlock_detection(&owner(&older), &owner(&newer))
            .is_none());
        assert!(f
            .engine
            .initialize_deadlock_detection(&LockOwner::Command(7), &owner(&older))
            .is_none());

        let round = f
            .engine
            .initialize_deadlock_detection(&owner(&newer), &owner(&older))
            .expect("newer transaction probes");
        round.await.unwrap();

        let stats = f.engine.stats();
        assert_eq!(stats.probes_initiated, 1);
        assert_eq!(stats.probes_suppressed, 1);
        assert_eq!(stats.probes_handled, 1);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let f = single_node();
        let holder = f.txn_table.begin();
        let victim = f.txn_table.begin();
        let k1 = key("k1");
        assert!(f.lock_table.acquire(owner(&holder), k1.clone()).is_granted());
        let _wait = f.lock_table.acquire(owner(&victim), k1.clone());

        let victim_owner = owner(&victim);
        f.engine.verify_deadlock_cycle(&victim_owner, &victim_owner, &[]).await.unwrap();
        let first = f.engine.stats();
        let deadlocked = f.lock_table.stats().deadlocked;

        f.engine.verify_deadlock_cycle(&victim_owner, &victim_owner, &[]).await.unwrap();

        assert_eq!(first.deadlocks_resolved, 1);
        assert_eq!(deadlocked, 1);
        assert_eq!(f.engine.stats().deadlocks_resolved, 1);
        assert_eq!(f.lock_table.stats().deadlocked, 1);
    }

    #[tokio::test]
    async fn test_notify_for_unknown_transaction_creates_placeholder() {
        let f = single_node();
        let foreign = TxnId::new(4, NodeId(9));
        let foreign_owner = LockOwner::Transaction(foreign);

        f.engine.verify_deadlock_cycle(&foreign_owner, &foreign_owner, &[]).await.unwrap();

        let placeholder = f.txn_table.remote_transaction(&foreign).unwrap();
        assert!(placeholder.has_received_deadlock());

        // Finished transactions get no placeholder
        let finished = TxnId::new(5, NodeId(9));
        f.txn_table.complete(finished, true);
        let finished_owner = LockOwner::Transaction(finished);
        f.engine.verify_deadlock_cycle(&finished_owner, &finished_owner, &[]).await.unwrap();
        assert!(f.txn_table.remote_transaction(&finished).is_none());
    }

    #[tokio::test]
    async fn test_rearm_passes_coalesce() {
        let f = single_node();
        let (a, b, c) = (
            f.engine.probe_all_local_transactions(),
            f.engine.probe_all_local_transactions(),
            f.engine.probe_all_local_transactions(),
        );
        let (a, b, c) = tokio::join!(a, b, c);
        a.unwrap();
        b.unwrap();
        c.unwrap();

        // Passes over an empty table finish before the next call starts
        assert_eq!(f.engine.stats().rearm_passes, 3);
        assert_eq!(f.engine.piggyback.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_older_stamp_with_same_members_is_evaluated() {
        let f = single_node();
        let sender_view = f.engine.membership.view();
        let (initiator, holder) = (TxnId::new(9, NodeId(2)), TxnId::new(3, NodeId(2)));

        // Same members, but this node counted more view changes
        f.engine.membership.install_view(sender_view.members.clone());
        let probe = DeadlockProbe::new(initiator, holder, &sender_view);
        assert_eq!(f.engine.handle_probe(NodeId(2), probe).await, ProbeResponse::Success);
        assert_eq!(f.engine.stats().probes_handled, 1);

        let mut grown = sender_view.members.clone();
        grown.insert(NodeId(5));
        let current = f.engine.membership.install_view(grown).topology_id;
        assert_eq!(
            f.engine.handle_probe(NodeId(2), probe).await,
            ProbeResponse::Unsure { topology_id: current }
        );
        assert_eq!(f.engine.stats().probes_handled, 1);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let f = single_node();
        f.engine.start().unwrap();
        assert!(f.engine.is_running());
        f.engine.start().unwrap();

        f.engine.stop();
        assert!(!f.engine.is_running());
    }
}
