//! Probe dispatch
//!
//! Delivers probes to a single node or a set of nodes. Probes addressed to
//! the local node skip the transport. Targets that left the view or cannot be
//! reached count as delivered; only a broadcast answered `Unsure` fails, so
//! that the caller can repeat it on the next topology.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use ember_common::prelude::*;

use crate::membership::Membership;
use crate::transport::{ClusterMessage, DeadlockProbe, ProbeHandler, ProbeResponse, RpcTransport};

/// Dispatcher statistics.
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub local_deliveries: u64,
    pub remote_sends: u64,
    pub ignored_leavers: u64,
    pub unreachable: u64,
    pub unsure: u64,
}

pub struct ProbeDispatcher {
    local: NodeId,
    membership: Arc<Membership>,
    transport: Arc<dyn RpcTransport>,
    /// Handler for probes addressed to this node
    handler: Weak<dyn ProbeHandler>,
    stats: Mutex<DispatchStats>,
}

impl ProbeDispatcher {
    pub fn new(
        membership: Arc<Membership>,
        transport: Arc<dyn RpcTransport>,
        handler: Weak<dyn ProbeHandler>,
    ) -> Self {
        Self {
            local: transport.local_node(),
            membership,
            transport,
            handler,
            stats: Mutex::new(DispatchStats::default()),
        }
    }

    /// Send `probe` to `target`, ignoring leavers.
    pub async fn send(&self, target: NodeId, probe: DeadlockProbe) -> Result<()> {
        match self.dispatch(target, probe).await? {
            ProbeResponse::Unsure { topology_id } => {
                trace!(%target, topology_id, "probe not evaluated, target topology is newer");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Send `probe` to every target.
    ///
    /// Fails with [`ClusterError::OutdatedTopology`] when any target answers
    /// `Unsure`; every other per-target failure is contained.
    pub async fn send_all(&self, targets: impl IntoIterator<Item = NodeId>, probe: DeadlockProbe) -> Result<()> {
        let results = join_all(targets.into_iter().map(|target| async move {
            (target, self.dispatch(target, probe).await)
        }))
        .await;

        let mut unsure = false;
        for (target, result) in results {
            match result {
                Ok(ProbeResponse::Unsure { topology_id }) => {
                    debug!(%target, topology_id, probe.topology_id, "target is on a newer topology");
                    unsure = true;
                }
                Ok(_) => {}
                Err(e) => warn!(%target, error = %e, "deadlock notify failed on target"),
            }
        }

        if unsure {
            return Err(ClusterError::OutdatedTopology {
                topology_id: probe.topology_id,
            }
            .into());
        }
        Ok(())
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().clone()
    }

    async fn dispatch(&self, target: NodeId, probe: DeadlockProbe) -> Result<ProbeResponse> {
        if target == self.local {
            self.stats.lock().local_deliveries += 1;
            let Some(handler) = self.handler.upgrade() else {
                return Ok(ProbeResponse::Success);
            };
            return match handler.handle_probe(self.local, probe).await {
                ProbeResponse::Exception(message) => Err(ProtocolError::RemoteException {
                    node: self.local,
                    message,
                }
                .into()),
                response => Ok(response),
            };
        }

        if !self.membership.is_member(target) {
            trace!(%target, "target left the cluster, probe ignored");
            self.stats.lock().ignored_leavers += 1;
            return Ok(ProbeResponse::Success);
        }

        self.stats.lock().remote_sends += 1;
        match self.transport.invoke(target, ClusterMessage::DeadlockProbe(probe)).await {
            Ok(ProbeResponse::Exception(message)) => Err(ProtocolError::RemoteException {
                node: target,
                message,
            }
            .into()),
            Ok(response) => {
                if matches!(response, ProbeResponse::Unsure { .. }) {
                    self.stats.lock().unsure += 1;
                }
                Ok(response)
            }
            Err(e) => {
                debug!(%target, error = %e, "probe target unreachable, ignored");
                self.stats.lock().unreachable += 1;
                Ok(ProbeResponse::Success)
            }
        }
    }
}
