//! Per-peer replication stub.
//!
//! One [`Host`] tracks the replication cursor of one remote replica.
//! The leader's pipeline calls [`append_logs`](Host::append_logs) on
//! every peer each round; the stub chooses the window to send from its
//! own cursor, rewinds on log-gap answers, and hands the peer over to
//! the snapshot coordinator when the WAL no longer holds the entries
//! the peer is missing.
//!
//! At most one AppendLog RPC is in flight per peer. A transport error
//! or a non-success answer is simply "no acknowledgement"; the outer
//! pipeline retries on its next cycle.

use crate::config::RaftConfig;
use crate::error::{KeelError, Result};
use crate::types::{HostAddr, LogId, Term};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::rpc::{AppendLogRequest, AppendLogResponse, AskForVoteRequest, AskForVoteResponse,
                 ErrorCode, RaftRpc};
use super::snapshot::SnapshotCoordinator;
use super::wal::Wal;

#[derive(Debug, Default)]
struct HostState {
    /// A snapshot transfer to this peer is in progress.
    sending_snapshot: bool,
    /// Highest log id the peer has acknowledged.
    follower_last_log_id: LogId,
    /// The peer's reported committed log id.
    follower_committed_log_id: LogId,
    /// An AppendLog RPC is in flight.
    inflight: bool,
    /// Clock reading of the last send, for diagnostics.
    last_sent_ms: u64,
}

/// Replication stub for one peer.
pub struct Host {
    addr: HostAddr,
    learner: AtomicBool,
    stopped: AtomicBool,
    config: Arc<RaftConfig>,
    wal: Arc<Wal>,
    rpc: Arc<dyn RaftRpc>,
    snapshots: Arc<SnapshotCoordinator>,
    state: Mutex<HostState>,
    drained: Notify,
}

impl Host {
    pub fn new(
        addr: HostAddr,
        learner: bool,
        config: Arc<RaftConfig>,
        wal: Arc<Wal>,
        rpc: Arc<dyn RaftRpc>,
        snapshots: Arc<SnapshotCoordinator>,
    ) -> Self {
        Self {
            addr,
            learner: AtomicBool::new(learner),
            stopped: AtomicBool::new(false),
            config,
            wal,
            rpc,
            snapshots,
            state: Mutex::new(HostState::default()),
            drained: Notify::new(),
        }
    }

    pub fn address(&self) -> HostAddr {
        self.addr
    }

    pub fn is_learner(&self) -> bool {
        self.learner.load(Ordering::Acquire)
    }

    pub fn set_learner(&self, learner: bool) {
        self.learner.store(learner, Ordering::Release);
    }

    pub fn is_sending_snapshot(&self) -> bool {
        self.state.lock().sending_snapshot
    }

    pub fn follower_committed_log_id(&self) -> LogId {
        self.state.lock().follower_committed_log_id
    }

    /// Clear replication state when the local partition becomes
    /// leader. The cursor starts at the leader's tail; the first round
    /// probes and rewinds if the peer is behind.
    pub fn reset(&self, leader_last_log_id: LogId) {
        let mut st = self.state.lock();
        st.sending_snapshot = false;
        st.follower_last_log_id = leader_last_log_id;
        st.follower_committed_log_id = 0;
    }

    /// Replicate `(cursor, last_log_id]` to the peer, following the
    /// peer's own gap/stale hints. Any outcome other than `Ok` with
    /// `Succeeded` counts as "no acknowledgement".
    pub async fn append_logs(
        self: &Arc<Self>,
        term: Term,
        last_log_id: LogId,
        committed_log_id: LogId,
        now_ms: u64,
    ) -> Result<AppendLogResponse> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(KeelError::Stopped);
        }
        {
            let mut st = self.state.lock();
            if st.sending_snapshot {
                return Err(KeelError::SendingSnapshot(self.addr));
            }
            if st.inflight {
                return Err(KeelError::PeerBusy(self.addr));
            }
            st.inflight = true;
            st.last_sent_ms = now_ms;
        }
        let result = self
            .append_logs_inner(term, last_log_id, committed_log_id)
            .await;
        self.state.lock().inflight = false;
        self.drained.notify_waiters();
        result
    }

    async fn append_logs_inner(
        self: &Arc<Self>,
        term: Term,
        last_log_id: LogId,
        committed_log_id: LogId,
    ) -> Result<AppendLogResponse> {
        let mut prev_log_id = self.state.lock().follower_last_log_id;
        loop {
            if prev_log_id + 1 < self.wal.first_log_id() {
                // The peer needs entries the WAL no longer holds.
                debug!(
                    peer = %self.addr,
                    prev_log_id,
                    wal_first = self.wal.first_log_id(),
                    "peer is behind the WAL window, starting snapshot"
                );
                self.state.lock().sending_snapshot = true;
                self.snapshots.spawn_send(Arc::clone(self), term);
                return Err(KeelError::SendingSnapshot(self.addr));
            }

            let prev_log_term = self.wal.term_at(prev_log_id).unwrap_or(0);
            let batch_last = last_log_id.min(prev_log_id + self.config.max_batch_size as u64);
            let entries = self.wal.entries_range(prev_log_id + 1, batch_last);
            if entries.is_empty() && batch_last > prev_log_id {
                // The WAL cannot supply the window (reset or compacted
                // away); only a snapshot can catch this peer up.
                debug!(
                    peer = %self.addr,
                    prev_log_id,
                    batch_last,
                    "WAL cannot supply the replication window, starting snapshot"
                );
                self.state.lock().sending_snapshot = true;
                self.snapshots.spawn_send(Arc::clone(self), term);
                return Err(KeelError::SendingSnapshot(self.addr));
            }
            let log_term = entries.last().map(|e| e.term).unwrap_or(term);
            let request = AppendLogRequest {
                space: self.config.space_id,
                part: self.config.part_id,
                leader: self.config.local_addr,
                current_term: term,
                last_log_id: batch_last,
                committed_log_id,
                prev_log_id,
                prev_log_term,
                log_term,
                entries,
                sending_snapshot: false,
                keep_alive: false,
            };

            let response = self.rpc.append_log(self.addr, request).await?;
            match response.error_code {
                ErrorCode::Succeeded => {
                    {
                        let mut st = self.state.lock();
                        st.follower_last_log_id = response.last_log_id;
                        st.follower_committed_log_id = response.committed_log_id;
                    }
                    if response.last_log_id < last_log_id {
                        // More of the window to send.
                        prev_log_id = response.last_log_id;
                        continue;
                    }
                    return Ok(response);
                }
                ErrorCode::LogGap | ErrorCode::LogStale => {
                    // The peer reported its actual tail; rewind to it.
                    let hint = response.last_log_id;
                    {
                        let mut st = self.state.lock();
                        st.follower_last_log_id = hint;
                        st.follower_committed_log_id = response.committed_log_id;
                    }
                    if hint == prev_log_id {
                        // No progress possible this round.
                        return Ok(response);
                    }
                    prev_log_id = hint;
                    continue;
                }
                _ => {
                    debug!(
                        peer = %self.addr,
                        code = ?response.error_code,
                        "append rejected by peer"
                    );
                    return Ok(response);
                }
            }
        }
    }

    /// Fire-and-forget heartbeat. The leader does not consume a reply.
    pub fn keep_alive(self: &Arc<Self>, term: Term, last_log_id: LogId, last_log_term: Term,
                      committed_log_id: LogId) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let host = Arc::clone(self);
        tokio::spawn(async move {
            let request = AppendLogRequest {
                space: host.config.space_id,
                part: host.config.part_id,
                leader: host.config.local_addr,
                current_term: term,
                last_log_id,
                committed_log_id,
                prev_log_id: last_log_id,
                prev_log_term: last_log_term,
                log_term: last_log_term,
                entries: Vec::new(),
                sending_snapshot: host.is_sending_snapshot(),
                keep_alive: true,
            };
            if let Err(e) = host.rpc.append_log(host.addr, request).await {
                debug!(peer = %host.addr, error = %e, "keep-alive not delivered");
            }
        });
    }

    /// Ballot RPC.
    pub async fn ask_for_vote(&self, request: AskForVoteRequest) -> Result<AskForVoteResponse> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(KeelError::Stopped);
        }
        self.rpc.ask_for_vote(self.addr, request).await
    }

    /// Mark the snapshot transfer finished and place the cursor at the
    /// transferred commit point.
    pub(crate) fn finish_snapshot(&self, committed_log_id: LogId) {
        let mut st = self.state.lock();
        st.sending_snapshot = false;
        st.follower_last_log_id = committed_log_id;
        st.follower_committed_log_id = committed_log_id;
    }

    /// Abandon a failed snapshot transfer; the next replication round
    /// will re-evaluate the peer.
    pub(crate) fn abort_snapshot(&self) {
        let mut st = self.state.lock();
        if st.sending_snapshot {
            warn!(peer = %self.addr, "snapshot transfer aborted");
            st.sending_snapshot = false;
        }
    }

    /// Stop accepting new work.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Wait for the in-flight request, if any, to drain.
    pub async fn wait_for_stop(&self) {
        loop {
            let drained = self.drained.notified();
            if !self.state.lock().inflight {
                return;
            }
            drained.await;
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("addr", &self.addr)
            .field("learner", &self.is_learner())
            .finish()
    }
}
