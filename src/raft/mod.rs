//! Raft consensus core for a Keel partition.
//!
//! This module implements the replicated-log engine: leader election,
//! log replication, commit, membership change and snapshot transfer
//! for a single partition. The host system plugs in through the
//! [`StateMachine`] callback interface and the [`rpc::RaftRpc`]
//! transport; everything else — peers, WAL, batching, per-peer
//! replication — is owned here.

// Panics in this module can break consensus; propagate errors instead.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod batch;
pub mod host;
mod partition;
mod peers;
mod promise;
pub mod rpc;
mod snapshot;
pub mod wal;

pub use batch::{AppendBatch, AtomicOp, Submission};
pub use host::Host;
pub use partition::{PartitionStatus, RaftPartition, Role};
pub use peers::PeerDirectory;
pub use rpc::{
    AppendLogRequest, AppendLogResponse, AskForVoteRequest, AskForVoteResponse, ErrorCode,
    MembershipChange, MembershipChangeType, RaftRpc, SendSnapshotRequest, SendSnapshotResponse,
};
pub use snapshot::SnapshotCoordinator;
pub use wal::Wal;

use crate::error::Result;
use crate::types::{HostAddr, LogEntry, LogId, Term};

/// Callback interface the host system injects at construction.
///
/// `commit_logs` and `commit_snapshot` run on the I/O executor while
/// the partition lock is held; they must not call back into the
/// partition.
pub trait StateMachine: Send + Sync {
    /// The commit point recovered from the state machine's own
    /// durable storage, consulted once at startup.
    fn last_committed_log_id(&self) -> (LogId, Term);

    /// Inspect an entry before it is persisted or committed. Invoked
    /// for every entry during WAL recovery and for every entry a
    /// follower appends. Returning false aborts recovery.
    fn pre_process_log(&self, entry: &LogEntry) -> bool;

    /// Apply a committed range to the state machine, atomically with
    /// respect to crashes. A failure here is unrecoverable for the
    /// local replica.
    fn commit_logs(&self, entries: &[LogEntry]) -> Result<()>;

    /// Ingest one snapshot frame. Returns the number of rows and bytes
    /// accepted so the partition can cross-check the sender's totals.
    fn commit_snapshot(
        &self,
        rows: &[Vec<u8>],
        committed_log_id: LogId,
        committed_log_term: Term,
        done: bool,
    ) -> Result<(u64, u64)>;

    /// The local partition won an election.
    fn on_elected(&self, _term: Term) {}

    /// The local partition stepped down from leadership.
    fn on_lost_leadership(&self, _term: Term) {}

    /// A new leader was discovered.
    fn on_discover_new_leader(&self, _leader: HostAddr) {}

    /// Drop all applied state. Called under the partition lock right
    /// before the WAL is reset.
    fn cleanup(&self) -> Result<()>;
}

/// The host's current state image, read when streaming a snapshot to a
/// lagging peer.
pub struct SnapshotScan {
    /// Commit point the image corresponds to.
    pub committed_log_id: LogId,
    pub committed_log_term: Term,
    /// Opaque state rows, in ingestion order.
    pub rows: Vec<Vec<u8>>,
}

/// Source of snapshot data on the sending side.
pub trait SnapshotStore: Send + Sync {
    fn read_snapshot(&self) -> Result<SnapshotScan>;
}
