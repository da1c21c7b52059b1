//! Error types for the Keel consensus engine.
//!
//! This module provides a unified error type [`KeelError`] for all Keel
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Role/State**: the partition cannot serve the request right now
//!   (`NotLeader`, `NotReady`, `Stopped`)
//! - **Backpressure**: the submission buffer is full or writes are
//!   administratively blocked
//! - **Consensus**: term, log-matching and quorum failures surfaced by
//!   peers during replication or elections
//! - **Storage**: write-ahead log and snapshot persistence failures
//!
//! # Example
//!
//! ```rust
//! use keel::error::{KeelError, Result};
//!
//! fn submit(leader: bool) -> Result<()> {
//!     if !leader {
//!         return Err(KeelError::NotLeader { leader: None });
//!     }
//!     Ok(())
//! }
//!
//! fn handle(err: &KeelError) {
//!     if err.is_retryable() {
//!         // safe to resubmit an idempotent operation
//!     }
//! }
//! ```

use crate::types::{HostAddr, Term};
use thiserror::Error;

/// Main error type for Keel operations.
#[derive(Error, Debug)]
pub enum KeelError {
    // Role and lifecycle errors
    #[error("not the leader; known leader is {leader:?}")]
    NotLeader { leader: Option<HostAddr> },

    #[error("partition is still starting")]
    NotReady,

    #[error("partition has been stopped")]
    Stopped,

    #[error("partition is receiving a snapshot")]
    WaitingSnapshot,

    // Backpressure errors
    #[error("append buffer is full; slow down the submission rate")]
    BufferOverflow,

    #[error("writes are administratively blocked")]
    WriteBlocking,

    // Consensus errors
    #[error("term {found} is out of date; current term is {current}")]
    TermOutOfDate { found: Term, current: Term },

    #[error("the sent log precedes the local committed log")]
    LogStale,

    #[error("the local log is missing entries before the sent log")]
    LogGap,

    #[error("request from {0} who is not the acknowledged leader")]
    WrongLeader(HostAddr),

    #[error("atomic operation failed to produce a payload")]
    AtomicOpFailure,

    #[error("quorum not reached: got {got}, need {need}")]
    QuorumNotReached { got: usize, need: usize },

    // Peer errors
    #[error("peer {0} is receiving a snapshot")]
    SendingSnapshot(HostAddr),

    #[error("peer {0} has a request in flight")]
    PeerBusy(HostAddr),

    #[error("unknown peer {0}")]
    InvalidPeer(HostAddr),

    // Storage errors
    #[error("write-ahead log failure: {0}")]
    WalFailure(String),

    #[error("snapshot persistence failed: {0}")]
    PersistSnapshotFailed(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Infrastructure errors
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KeelError {
    /// Check whether a client may safely retry an idempotent operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeelError::NotLeader { .. }
                | KeelError::NotReady
                | KeelError::BufferOverflow
                | KeelError::QuorumNotReached { .. }
                | KeelError::Timeout(_)
                | KeelError::PeerBusy(_)
        )
    }
}

impl From<rocksdb::Error> for KeelError {
    fn from(e: rocksdb::Error) -> Self {
        KeelError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for KeelError {
    fn from(e: bincode::Error) -> Self {
        KeelError::Serialization(e.to_string())
    }
}

/// Result type alias for Keel operations.
pub type Result<T> = std::result::Result<T, KeelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(KeelError::NotLeader { leader: None }.is_retryable());
        assert!(KeelError::BufferOverflow.is_retryable());
        assert!(!KeelError::Stopped.is_retryable());
        assert!(!KeelError::AtomicOpFailure.is_retryable());
    }
}
