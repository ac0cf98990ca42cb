//! # Ember Common
//!
//! Common types, errors, and configuration shared across all Ember crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod testing;
pub mod types;

pub use config::*;
pub use error::{Error, Result};
pub use types::*;

/// Re-export commonly used external types
pub mod prelude {
    pub use super::config::*;
    pub use super::error::{ClusterError, Error, ProtocolError, Result, TransactionError};
    pub use super::types::*;
    pub use async_trait::async_trait;
    pub use bytes::Bytes;
    pub use tracing::{debug, error, info, instrument, trace, warn};
}
