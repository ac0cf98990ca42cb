//! Resource manager transaction contexts.
//!
//! A [`TransactionHandle`] is the resource-manager side of a local
//! transaction. Handles are associated with threads; marking one
//! rollback-only from another thread means suspending whatever that thread
//! was running, resuming the target, and restoring the previous association.

use ember_common::prelude::*;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::Arc;

use crate::transaction_table::LocalTransaction;

/// Transaction status as seen by the resource manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    MarkedRollback,
    Committed,
    RolledBack,
}

/// Resource-manager transaction context.
#[derive(Debug)]
pub struct TransactionHandle {
    txn: TxnId,
    status: Mutex<TransactionStatus>,
}

impl TransactionHandle {
    pub fn new(txn: TxnId) -> Self {
        Self {
            txn,
            status: Mutex::new(TransactionStatus::Active),
        }
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    pub fn is_marked_for_rollback(&self) -> bool {
        self.status() == TransactionStatus::MarkedRollback
    }

    /// Only an active transaction can be marked; marking twice is a no-op.
    pub fn set_rollback_only(&self) -> Result<()> {
        let mut status = self.status.lock();
        match *status {
            TransactionStatus::Active => {
                *status = TransactionStatus::MarkedRollback;
                Ok(())
            }
            TransactionStatus::MarkedRollback => Ok(()),
            other => Err(TransactionError::InvalidState {
                txn: self.txn,
                reason: format!("cannot mark {:?} transaction rollback-only", other),
            }
            .into()),
        }
    }

    /// Record the final outcome.
    pub fn finish(&self, committed: bool) {
        *self.status.lock() = if committed {
            TransactionStatus::Committed
        } else {
            TransactionStatus::RolledBack
        };
    }
}

/// Marks transactions rollback-only.
///
/// Implementations may block; callers on an async runtime must run them on a
/// blocking thread.
pub trait ResourceManager: Send + Sync {
    fn mark_rollback_only(&self, txn: &LocalTransaction) -> Result<()>;
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<TransactionHandle>>> = const { RefCell::new(None) };
}

/// Resource manager keeping one transaction associated with each thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadBoundResourceManager;

impl ThreadBoundResourceManager {
    pub fn new() -> Self {
        Self
    }

    /// Transaction associated with the calling thread.
    pub fn current() -> Option<Arc<TransactionHandle>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Dissociate and return the calling thread's transaction.
    pub fn suspend() -> Option<Arc<TransactionHandle>> {
        CURRENT.with(|c| c.borrow_mut().take())
    }

    /// Associate `handle` with the calling thread.
    pub fn resume(handle: Arc<TransactionHandle>) -> Result<()> {
        if !handle.is_active() {
            return Err(TransactionError::InvalidState {
                txn: handle.txn(),
                reason: "cannot resume a finished transaction".to_string(),
            }
            .into());
        }
        if let Some(existing) = Self::current() {
            return Err(Error::internal(format!(
                "thread already associated with {}",
                existing.txn()
            )));
        }
        CURRENT.with(|c| *c.borrow_mut() = Some(handle));
        Ok(())
    }

    /// Mark the calling thread's transaction rollback-only.
    pub fn set_rollback_only() -> Result<()> {
        match Self::current() {
            Some(handle) => handle.set_rollback_only(),
            None => Err(Error::internal("no transaction associated with thread")),
        }
    }

    fn restore(previous: Option<Arc<TransactionHandle>>) {
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

impl ResourceManager for ThreadBoundResourceManager {
    fn mark_rollback_only(&self, txn: &LocalTransaction) -> Result<()> {
        let target = txn.handle();
        let already_current = matches!(Self::current(), Some(ref h) if Arc::ptr_eq(h, &target));
        if already_current {
            return Self::set_rollback_only();
        }

        let previous = Self::suspend();
        let result = Self::resume(target).and_then(|_| Self::set_rollback_only());
        Self::restore(previous);
        result
    }
}
