//! Error types for Ember

use thiserror::Error;

use crate::types::{NodeId, TxnId};

/// Result type alias using Ember's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Ember
#[derive(Error, Debug)]
pub enum Error {
    // Transaction errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    // Cluster errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    // Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    // Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction not found: {0}")]
    NotFound(TxnId),

    #[error("Deadlock detected: {txn} was chosen to abort")]
    Deadlock { txn: TxnId },

    #[error("Lock timeout on key {key}")]
    LockTimeout { key: String },

    #[error("Lock request cancelled for {0}")]
    LockCancelled(String),

    #[error("Transaction {txn} is not active: {reason}")]
    InvalidState { txn: TxnId, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node {0} left the cluster")]
    NodeLeft(NodeId),

    #[error("Node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("Topology {topology_id} is outdated, retry on the next topology")]
    OutdatedTopology { topology_id: u64 },

    #[error("Network error: {0}")]
    NetworkError(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Remote exception from {node}: {message}")]
    RemoteException { node: NodeId, message: String },
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn deadlock(txn: TxnId) -> Self {
        Error::Transaction(TransactionError::Deadlock { txn })
    }

    /// True when the operation failed because its transaction was chosen
    /// to break a deadlock. Callers may retry immediately.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Error::Transaction(TransactionError::Deadlock { .. }))
    }

    /// True when the operation should be re-issued once a newer topology is installed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Cluster(ClusterError::OutdatedTopology { .. }))
    }

    /// Return a PostgreSQL-compatible SQLSTATE code for this error.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            Error::Transaction(te) => match te {
                TransactionError::NotFound(_) => "25P01", // no_active_sql_transaction
                TransactionError::Deadlock { .. } => "40P01", // deadlock_detected
                TransactionError::LockTimeout { .. } => "55P03", // lock_not_available
                TransactionError::LockCancelled(_) => "57014", // query_canceled
                TransactionError::InvalidState { .. } => "25000", // invalid_transaction_state
            },
            Error::Cluster(ce) => match ce {
                ClusterError::NodeNotFound(_) => "08001",
                ClusterError::NodeLeft(_) => "08006",
                ClusterError::Unreachable(_) => "08006", // connection_failure
                ClusterError::OutdatedTopology { .. } => "40001", // serialization_failure (retry)
                ClusterError::NetworkError(_) => "08006",
            },
            Error::Protocol(pe) => match pe {
                ProtocolError::InvalidMessage(_) => "08P01", // protocol_violation
                ProtocolError::RemoteException { .. } => "XX000",
            },
            Error::Config(_) => "F0000",
            Error::Internal(_) => "XX000",
            Error::Timeout(_) => "57014",
            Error::Cancelled(_) => "57014",
        }
    }
}
