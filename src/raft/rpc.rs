//! Wire messages for the Keel consensus protocol.
//!
//! Three request/response pairs cover the whole protocol: ballots
//! ([`AskForVoteRequest`]), log replication and heartbeats
//! ([`AppendLogRequest`]), and bulk state transfer
//! ([`SendSnapshotRequest`]). The [`RaftRpc`] trait abstracts the
//! transport; implementations are expected to enforce their own
//! timeouts, since the core treats any transport error as a missing
//! acknowledgement.

use crate::types::{HostAddr, LogEntry, LogId, PartitionId, SpaceId, Term};
use serde::{Deserialize, Serialize};

/// Protocol-level result code carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Succeeded,
    /// The sent log precedes the receiver's committed log.
    LogStale,
    /// The receiver is missing entries before the sent log.
    LogGap,
    /// The sender's term is not newer than the receiver's.
    TermOutOfDate,
    /// The sender is not the leader the receiver acknowledges.
    WrongLeader,
    /// The receiver is starting up.
    NotReady,
    /// The receiver is stopped or otherwise unable to serve.
    BadState,
    /// The receiver's role cannot serve the request (e.g. a learner
    /// asked to vote).
    BadRole,
    /// The receiver failed to persist to its write-ahead log.
    WalFail,
    /// The receiver just entered snapshot-waiting state.
    WaitingSnapshot,
    /// The receiver failed to ingest a snapshot frame.
    PersistSnapshotFailed,
}

impl ErrorCode {
    #[inline]
    pub fn is_success(self) -> bool {
        self == ErrorCode::Succeeded
    }
}

/// Ballot request sent by a candidate to every voter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskForVoteRequest {
    pub space: SpaceId,
    pub part: PartitionId,
    /// The candidate requesting the vote.
    pub candidate: HostAddr,
    /// The term the candidate proposes.
    pub term: Term,
    /// Id of the candidate's last log entry.
    pub last_log_id: LogId,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// Ballot response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskForVoteResponse {
    pub error_code: ErrorCode,
}

/// Log replication request. Also carries heartbeats (`keep_alive`) and
/// the advance notice that a snapshot stream is about to start
/// (`sending_snapshot`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLogRequest {
    pub space: SpaceId,
    pub part: PartitionId,
    /// The sending leader.
    pub leader: HostAddr,
    /// The leader's current term.
    pub current_term: Term,
    /// Id of the last entry in this request (equals `prev_log_id` for
    /// heartbeats).
    pub last_log_id: LogId,
    /// The leader's committed log id.
    pub committed_log_id: LogId,
    /// Id of the entry immediately preceding `entries`.
    pub prev_log_id: LogId,
    /// Term of the entry at `prev_log_id`.
    pub prev_log_term: Term,
    /// Term of the last entry in this batch.
    pub log_term: Term,
    /// Entries in `(prev_log_id, last_log_id]`.
    pub entries: Vec<LogEntry>,
    /// The leader is about to stream a snapshot to this peer.
    pub sending_snapshot: bool,
    /// Lightweight heartbeat; the receiver only refreshes its election
    /// timer and the leader ignores the response body.
    pub keep_alive: bool,
}

/// Log replication response. The follower reports its own log position
/// so the leader can advance or rewind its cursor without probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLogResponse {
    pub error_code: ErrorCode,
    pub current_term: Term,
    pub leader: Option<HostAddr>,
    pub committed_log_id: LogId,
    pub last_log_id: LogId,
    pub last_log_term: Term,
}

/// One frame of a snapshot stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSnapshotRequest {
    pub space: SpaceId,
    pub part: PartitionId,
    pub leader: HostAddr,
    pub term: Term,
    /// Opaque state-machine rows.
    pub rows: Vec<Vec<u8>>,
    /// Commit point the finished snapshot corresponds to.
    pub committed_log_id: LogId,
    pub committed_log_term: Term,
    /// Cumulative row count including this frame.
    pub total_count: u64,
    /// Cumulative byte size including this frame.
    pub total_size: u64,
    /// Whether this is the final frame.
    pub done: bool,
}

/// Snapshot frame acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSnapshotResponse {
    pub error_code: ErrorCode,
}

/// Type of a membership change carried by a `Command` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChangeType {
    /// Add a voting member (promotes the peer if it is a learner).
    AddPeer,
    /// Remove a member.
    RemovePeer,
    /// Add a non-voting learner.
    AddLearner,
    /// Promote a learner to voting member.
    PromoteLearner,
    /// Hand leadership to the named peer.
    TransferLeader,
}

/// Membership change payload stored in `Command` log entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipChange {
    pub change_type: MembershipChangeType,
    pub peer: HostAddr,
}

impl MembershipChange {
    pub fn new(change_type: MembershipChangeType, peer: HostAddr) -> Self {
        Self { change_type, peer }
    }

    /// Encode for storage in a log entry payload.
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from a log entry payload.
    pub fn decode(payload: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Transport used by a partition to reach its peers.
#[async_trait::async_trait]
pub trait RaftRpc: Send + Sync {
    /// Send a ballot request to a peer.
    async fn ask_for_vote(
        &self,
        target: HostAddr,
        request: AskForVoteRequest,
    ) -> crate::Result<AskForVoteResponse>;

    /// Send a log replication request to a peer.
    async fn append_log(
        &self,
        target: HostAddr,
        request: AppendLogRequest,
    ) -> crate::Result<AppendLogResponse>;

    /// Send a snapshot frame to a peer.
    async fn send_snapshot(
        &self,
        target: HostAddr,
        request: SendSnapshotRequest,
    ) -> crate::Result<SendSnapshotResponse>;
}
