//! Detection triggers: lock table events and merged cluster views.

use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ember_common::prelude::*;
use ember_txn::{DeadlockDetection, LockListener, LockTable};

use crate::membership::MembershipEvent;

/// Starts detection when a lock request has to wait.
pub struct DeadlockLockListener {
    detection: Weak<dyn DeadlockDetection>,
}

impl DeadlockLockListener {
    pub fn new(detection: Weak<dyn DeadlockDetection>) -> Self {
        Self { detection }
    }
}

impl LockListener for DeadlockLockListener {
    fn on_lock_acquired(&self, table: &LockTable, key: &Key, owner: &LockOwner) {
        let Some(detection) = self.detection.upgrade() else {
            return;
        };
        for pending in table.pending_owners_of(key) {
            detection.initialize_deadlock_detection(&pending, owner);
        }
        rearm(detection);
    }

    fn on_lock_waiting(&self, _table: &LockTable, _key: &Key, waiter: &LockOwner, owner: &LockOwner) {
        if let Some(detection) = self.detection.upgrade() {
            detection.initialize_deadlock_detection(waiter, owner);
        }
    }
}

fn rearm(detection: Arc<dyn DeadlockDetection>) {
    let Ok(runtime) = Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        if let Err(e) = detection.probe_all_local_transactions().await {
            warn!(error = %e, "re-arming deadlock detection failed");
        }
    });
}

/// Re-arm detection whenever partitions merge, until `cancel` fires.
pub fn spawn_view_listener(
    runtime: &Handle,
    detection: Weak<dyn DeadlockDetection>,
    mut events: broadcast::Receiver<MembershipEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => {
                    let merged = match event {
                        Ok(MembershipEvent::Merged { view, partitions }) => {
                            info!(
                                topology_id = view.topology_id,
                                partitions = partitions.len(),
                                "partitions merged, re-arming deadlock detection"
                            );
                            true
                        }
                        Ok(_) => false,
                        Err(RecvError::Lagged(skipped)) => {
                            // A merge may be among the dropped events
                            warn!(skipped, "membership events lagged");
                            true
                        }
                        Err(RecvError::Closed) => break,
                    };
                    if !merged {
                        continue;
                    }
                    match detection.upgrade() {
                        Some(detection) => rearm(detection),
                        None => break,
                    }
                }
            }
        }
        debug!("view listener stopped");
    })
}
