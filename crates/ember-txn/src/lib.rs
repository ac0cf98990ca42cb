//! # Ember Transaction
//!
//! Transaction-side collaborators for Ember providing:
//! - Per-key lock table with FIFO waiters
//! - Transaction table of local and remote transactions
//! - Resource manager with rollback-only marking
//! - The deadlock detection contract consumed by the lock path

pub mod lock_manager;
pub mod resource_manager;
pub mod transaction_table;

// Re-export key types for convenience
pub use lock_manager::{ListenerId, LockListener, LockPromise, LockTable, LockTableStats};
pub use resource_manager::{
    ResourceManager, ThreadBoundResourceManager, TransactionHandle, TransactionStatus,
};
pub use transaction_table::{
    LocalTransaction, RemoteTransaction, TransactionTable, TransactionTableStats, TxnRecord,
};

use ember_common::prelude::*;
use tokio::task::JoinHandle;

/// Deadlock detection entry points.
///
/// Callers never branch on whether detection is configured; the disabled
/// implementation accepts every call and does nothing.
#[async_trait]
pub trait DeadlockDetection: Send + Sync {
    /// `initiator` waits for a key held by `holder`.
    ///
    /// Starts probing in the background when both are transactions and the
    /// initiator is the newer one. Returns the probe task, if any.
    fn initialize_deadlock_detection(
        &self,
        initiator: &LockOwner,
        holder: &LockOwner,
    ) -> Option<JoinHandle<()>>;

    /// Handle a probe for `holder` on behalf of `initiator`, where `keys` are
    /// the keys `holder` is blocked on.
    async fn verify_deadlock_cycle(
        &self,
        initiator: &LockOwner,
        holder: &LockOwner,
        keys: &[Key],
    ) -> Result<()>;

    /// Probe again for every local transaction still missing a lock.
    async fn probe_all_local_transactions(&self) -> Result<()>;

    fn is_enabled(&self) -> bool;
}

/// Detection that never runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDeadlockDetection;

#[async_trait]
impl DeadlockDetection for NoopDeadlockDetection {
    fn initialize_deadlock_detection(
        &self,
        _initiator: &LockOwner,
        _holder: &LockOwner,
    ) -> Option<JoinHandle<()>> {
        None
    }

    async fn verify_deadlock_cycle(
        &self,
        _initiator: &LockOwner,
        _holder: &LockOwner,
        _keys: &[Key],
    ) -> Result<()> {
        Ok(())
    }

    async fn probe_all_local_transactions(&self) -> Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}
