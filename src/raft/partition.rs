//! The Raft partition core.
//!
//! One [`RaftPartition`] coordinates a single partition's replicated
//! log with its peer replicas: role transitions, leader election, the
//! batched replication pipeline, commit, membership changes and the
//! follower side of snapshot transfer.
//!
//! Two locks protect the core, always acquired in this order: the
//! logs lock (submission buffer and promise sets) and the partition
//! lock (all canonical state). Nothing slow runs under either lock;
//! network waits happen strictly between lock scopes.

use crate::clock::{BackgroundWorker, MonoClock};
use crate::config::RaftConfig;
use crate::error::{KeelError, Result};
use crate::types::{ClusterId, HostAddr, LogEntry, LogId, LogType, Term};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::batch::{AppendBatch, AtomicOp, AtomicOpResolver, Submission};
use super::host::Host;
use super::peers::PeerDirectory;
use super::promise::PromiseSet;
use super::rpc::{
    AppendLogRequest, AppendLogResponse, AskForVoteRequest, AskForVoteResponse, ErrorCode,
    MembershipChange, MembershipChangeType, RaftRpc, SendSnapshotRequest, SendSnapshotResponse,
};
use super::snapshot::SnapshotCoordinator;
use super::wal::Wal;
use super::{SnapshotStore, StateMachine};

/// Role of a partition replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive replica, answering the leader.
    Follower,
    /// Actively seeking election.
    Candidate,
    /// Serving writes and driving replication.
    Leader,
    /// Receives entries but never votes or leads.
    Learner,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
            Role::Learner => write!(f, "Learner"),
        }
    }
}

/// Lifecycle status of a partition replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Starting,
    Running,
    WaitingSnapshot,
    Stopped,
}

/// Terminal code a client submission resolves with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppendOutcome {
    Succeeded,
    NotReady,
    Stopped,
    NotLeader,
    WalFailure,
    AtomicOpFailure,
    TermOutOfDate { found: Term, current: Term },
}

/// Canonical state, protected by the partition lock.
struct PartState {
    role: Role,
    status: PartitionStatus,
    term: Term,
    proposed_term: Term,
    voted_for: Option<HostAddr>,
    leader: Option<HostAddr>,
    last_log_id: LogId,
    last_log_term: Term,
    committed_log_id: LogId,
    /// Remote voter acknowledgements needed for a majority.
    quorum: usize,
    /// Election backoff multiplier, doubled on log-stale rejections.
    weight: u64,
    last_msg_sent_ms: u64,
    last_msg_accepted_ms: u64,
    last_msg_accepted_cost_ms: u64,
    start_time_ms: u64,
    snapshot_recv_ms: u64,
    snapshot_rows_received: u64,
    snapshot_bytes_received: u64,
}

/// Submission buffer and the promise set new submitters attach to.
struct LogsBuffer {
    logs: Vec<Submission>,
    caching: PromiseSet<AppendOutcome>,
}

/// Mirror of role/term/leader for lock-free heartbeat checks. The
/// value may briefly lag the canonical state; every decision that
/// matters is re-verified under the partition lock.
#[derive(Debug, Clone, Copy)]
struct LeaderHint {
    role: Role,
    term: Term,
    leader: Option<HostAddr>,
}

/// A single partition replica of the replicated state machine.
pub struct RaftPartition {
    config: Arc<RaftConfig>,
    state_machine: Arc<dyn StateMachine>,
    rpc: Arc<dyn RaftRpc>,
    clock: MonoClock,
    workers: BackgroundWorker,
    wal: Arc<Wal>,
    peers: PeerDirectory,
    snapshots: Arc<SnapshotCoordinator>,
    state: Mutex<PartState>,
    logs: Mutex<LogsBuffer>,
    /// Promise set owned by the in-flight replication.
    sending: Mutex<PromiseSet<AppendOutcome>>,
    /// Single-flight flag for the replication pipeline.
    replicating: AtomicBool,
    /// Sticky until the buffer drains.
    buffer_overflow: AtomicBool,
    /// Administrative write block.
    blocking: AtomicBool,
    retry_num: AtomicU64,
    last_msg_recv_ms: AtomicU64,
    last_heartbeat_ms: AtomicU64,
    leader_hint: RwLock<LeaderHint>,
    self_ref: OnceLock<Weak<RaftPartition>>,
}

impl RaftPartition {
    /// Open the partition's WAL and assemble the replica in `Starting`
    /// state. Must be called within a tokio runtime.
    pub fn new(
        config: RaftConfig,
        wal_dir: &Path,
        state_machine: Arc<dyn StateMachine>,
        snapshot_store: Arc<dyn SnapshotStore>,
        rpc: Arc<dyn RaftRpc>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let recovery_sm = Arc::clone(&state_machine);
        let wal = Arc::new(Wal::open(wal_dir, &config.wal, |entry| {
            recovery_sm.pre_process_log(entry)
        })?);

        let snapshots = Arc::new(SnapshotCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&rpc),
            snapshot_store,
        ));

        let part = Arc::new(Self {
            config,
            state_machine,
            rpc,
            clock: MonoClock::new(),
            workers: BackgroundWorker::spawn(),
            wal,
            peers: PeerDirectory::new(),
            snapshots,
            state: Mutex::new(PartState {
                role: Role::Follower,
                status: PartitionStatus::Starting,
                term: 0,
                proposed_term: 0,
                voted_for: None,
                leader: None,
                last_log_id: 0,
                last_log_term: 0,
                committed_log_id: 0,
                quorum: 0,
                weight: 1,
                last_msg_sent_ms: 0,
                last_msg_accepted_ms: 0,
                last_msg_accepted_cost_ms: 0,
                start_time_ms: 0,
                snapshot_recv_ms: 0,
                snapshot_rows_received: 0,
                snapshot_bytes_received: 0,
            }),
            logs: Mutex::new(LogsBuffer {
                logs: Vec::new(),
                caching: PromiseSet::new(),
            }),
            sending: Mutex::new(PromiseSet::new()),
            replicating: AtomicBool::new(false),
            buffer_overflow: AtomicBool::new(false),
            blocking: AtomicBool::new(false),
            retry_num: AtomicU64::new(0),
            last_msg_recv_ms: AtomicU64::new(0),
            last_heartbeat_ms: AtomicU64::new(0),
            leader_hint: RwLock::new(LeaderHint {
                role: Role::Follower,
                term: 0,
                leader: None,
            }),
            self_ref: OnceLock::new(),
        });
        let _ = part.self_ref.set(Arc::downgrade(&part));
        Ok(part)
    }

    /// Bring the replica to `Running`, seeding its log position from
    /// the WAL and the host's recovered commit point, and schedule the
    /// election and heartbeat drivers.
    pub fn start(self: &Arc<Self>, peer_addrs: Vec<HostAddr>, as_learner: bool) {
        let start_time;
        {
            let mut st = self.state.lock();
            st.last_log_id = self.wal.last_log_id();
            st.last_log_term = self.wal.last_log_term();
            st.term = st.last_log_term;
            st.proposed_term = st.last_log_term;
            st.quorum = (peer_addrs.len() + 1) / 2;

            let (committed, _committed_term) = self.state_machine.last_committed_log_id();
            st.committed_log_id = committed;
            if st.last_log_id < st.committed_log_id {
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    last_log_id = st.last_log_id,
                    committed_log_id = st.committed_log_id,
                    "WAL tail is behind the recovered commit point, resetting WAL"
                );
                st.last_log_id = st.committed_log_id;
                st.last_log_term = st.term;
                if let Err(e) = self.wal.reset() {
                    error!(error = %e, "failed to reset WAL during start");
                }
            }

            for addr in &peer_addrs {
                self.peers.add(Arc::new(self.make_host(*addr, false)));
            }

            st.status = PartitionStatus::Running;
            if as_learner {
                st.role = Role::Learner;
            }
            st.start_time_ms = self.clock.now_ms();
            start_time = st.start_time_ms;
            self.update_hint(&st);

            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                peers = peer_addrs.len(),
                quorum = st.quorum,
                as_learner,
                last_log_id = st.last_log_id,
                last_log_term = st.last_log_term,
                committed_log_id = st.committed_log_id,
                term = st.term,
                "partition started"
            );
        }
        self.last_msg_recv_ms
            .store(self.clock.now_ms(), Ordering::Release);

        let delay = 100 + rand::thread_rng().gen_range(0..900);
        self.schedule_status_polling(delay, start_time);

        let part = Arc::clone(self);
        tokio::spawn(part.heartbeat_loop());
    }

    /// Drive to `Stopped` and drain every peer stub.
    pub async fn stop(&self) {
        {
            let mut st = self.state.lock();
            st.status = PartitionStatus::Stopped;
            st.role = Role::Follower;
            st.leader = None;
            self.update_hint(&st);
        }
        let hosts = self.peers.all();
        for host in &hosts {
            host.stop();
        }
        for host in &hosts {
            host.wait_for_stop().await;
        }
        info!(
            space = self.config.space_id,
            part = self.config.part_id,
            "partition stopped"
        );
    }

    fn make_host(&self, addr: HostAddr, learner: bool) -> Host {
        Host::new(
            addr,
            learner,
            Arc::clone(&self.config),
            Arc::clone(&self.wal),
            Arc::clone(&self.rpc),
            Arc::clone(&self.snapshots),
        )
    }

    fn update_hint(&self, st: &PartState) {
        *self.leader_hint.write() = LeaderHint {
            role: st.role,
            term: st.term,
            leader: st.leader,
        };
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn status(&self) -> PartitionStatus {
        self.state.lock().status
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.state.lock().term
    }

    pub fn leader(&self) -> Option<HostAddr> {
        self.state.lock().leader
    }

    pub fn last_log_id(&self) -> LogId {
        self.state.lock().last_log_id
    }

    pub fn committed_log_id(&self) -> LogId {
        self.state.lock().committed_log_id
    }

    pub fn address(&self) -> HostAddr {
        self.config.local_addr
    }

    /// Block or unblock non-empty writes administratively.
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Release);
    }

    /// Whether the leader lease is still valid for local reads. The
    /// lease covers one heartbeat interval after the last acknowledged
    /// log, minus the time that acknowledgement took on the wire.
    pub fn is_lease_valid(&self) -> bool {
        if !self.config.enable_sync_with_follower {
            return true;
        }
        if self.peers.is_empty() {
            return true;
        }
        let st = self.state.lock();
        self.clock.now_ms().saturating_sub(st.last_msg_accepted_ms)
            < (self.config.heartbeat_interval.as_millis() as u64)
                .saturating_sub(st.last_msg_accepted_cost_ms)
    }

    /// Whether `peer` has caught up enough to serve as a voter: its
    /// reported commit point must fall inside the local WAL window and
    /// no snapshot may be in flight to it.
    pub fn is_caught_up(&self, peer: HostAddr) -> Result<()> {
        let st = self.state.lock();
        if st.role != Role::Leader {
            return Err(KeelError::NotLeader { leader: st.leader });
        }
        drop(st);
        if peer == self.config.local_addr {
            return Ok(());
        }
        let host = self
            .peers
            .find(peer)
            .ok_or(KeelError::InvalidPeer(peer))?;
        let committed = host.follower_committed_log_id();
        if committed == 0 || committed < self.wal.first_log_id() {
            return Err(KeelError::SendingSnapshot(peer));
        }
        if host.is_sending_snapshot() {
            return Err(KeelError::SendingSnapshot(peer));
        }
        Ok(())
    }

    /// Reconcile the peer directory with an externally declared member
    /// set: absent peers are dropped, missing ones added as voters.
    pub fn check_and_reset_peers(&self, peer_addrs: &[HostAddr]) {
        let mut st = self.state.lock();
        for host in self.peers.all() {
            if !peer_addrs.contains(&host.address()) {
                self.remove_peer_locked(&mut st, host.address());
            }
        }
        for addr in peer_addrs {
            self.add_peer_locked(&mut st, *addr);
        }
    }

    // ---------------------------------------------------------------
    // Client submission API
    // ---------------------------------------------------------------

    /// Replicate an opaque command and wait for it to commit.
    pub async fn append(self: &Arc<Self>, payload: Vec<u8>) -> Result<()> {
        self.append_from(self.config.cluster_id, payload).await
    }

    /// Replicate a command on behalf of another cluster.
    pub async fn append_from(self: &Arc<Self>, source: ClusterId, payload: Vec<u8>) -> Result<()> {
        let receiver = self.submit(source, LogType::Normal, payload, None)?;
        self.wait_outcome(receiver).await
    }

    /// Run a leader-local computation whose output becomes the
    /// replicated payload. The future resolves once the emitted entry
    /// commits, or with [`KeelError::AtomicOpFailure`] when the
    /// computation declines.
    pub async fn atomic_op(self: &Arc<Self>, op: AtomicOp) -> Result<()> {
        let receiver = self.submit(self.config.cluster_id, LogType::AtomicOp, Vec::new(), Some(op))?;
        self.wait_outcome(receiver).await
    }

    /// Replicate a raw membership command. It will be the only entry
    /// of its replication batch.
    pub async fn send_command(self: &Arc<Self>, payload: Vec<u8>) -> Result<()> {
        let receiver = self.submit(self.config.cluster_id, LogType::Command, payload, None)?;
        self.wait_outcome(receiver).await
    }

    /// Replicate a membership change.
    pub async fn change_membership(self: &Arc<Self>, change: MembershipChange) -> Result<()> {
        self.send_command(change.encode()?).await
    }

    async fn wait_outcome(&self, receiver: oneshot::Receiver<AppendOutcome>) -> Result<()> {
        match receiver.await {
            Ok(outcome) => self.outcome_to_result(outcome),
            Err(_) => Err(KeelError::Stopped),
        }
    }

    fn outcome_to_result(&self, outcome: AppendOutcome) -> Result<()> {
        match outcome {
            AppendOutcome::Succeeded => Ok(()),
            AppendOutcome::NotReady => Err(KeelError::NotReady),
            AppendOutcome::Stopped => Err(KeelError::Stopped),
            AppendOutcome::NotLeader => Err(KeelError::NotLeader {
                leader: self.leader(),
            }),
            AppendOutcome::WalFailure => {
                Err(KeelError::WalFailure("failed to persist the batch".into()))
            }
            AppendOutcome::AtomicOpFailure => Err(KeelError::AtomicOpFailure),
            AppendOutcome::TermOutOfDate { found, current } => {
                Err(KeelError::TermOutOfDate { found, current })
            }
        }
    }

    /// Queue one submission and kick the pipeline if no flight is
    /// running. Returns the future the caller resolves against.
    fn submit(
        self: &Arc<Self>,
        source: ClusterId,
        log_type: LogType,
        payload: Vec<u8>,
        op: Option<AtomicOp>,
    ) -> Result<oneshot::Receiver<AppendOutcome>> {
        if self.blocking.load(Ordering::Acquire) {
            // Heartbeats and empty entries pass through a write block.
            let blocked = match log_type {
                LogType::Normal => !payload.is_empty(),
                LogType::AtomicOp => true,
                _ => false,
            };
            if blocked {
                return Err(KeelError::WriteBlocking);
            }
        }
        if self.buffer_overflow.load(Ordering::Acquire) {
            return Err(KeelError::BufferOverflow);
        }

        let receiver;
        let swapped;
        {
            let mut buffer = self.logs.lock();
            if buffer.logs.len() >= self.config.max_batch_size {
                warn!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    "append buffer is full, rejecting submissions until it drains"
                );
                self.buffer_overflow.store(true, Ordering::Release);
                return Err(KeelError::BufferOverflow);
            }
            buffer.logs.push(Submission {
                source,
                log_type,
                payload,
                op,
            });
            receiver = match log_type {
                LogType::AtomicOp => buffer.caching.single_future(),
                LogType::Command => buffer.caching.roll_shared_future(),
                _ => buffer.caching.shared_future(),
            };

            if self
                .replicating
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Another flight is running; it will pick this up.
                return Ok(receiver);
            }
            *self.sending.lock() = buffer.caching.take();
            swapped = std::mem::take(&mut buffer.logs);
            self.buffer_overflow.store(false, Ordering::Release);
        }

        let (first_log_id, term) = {
            let st = self.state.lock();
            let verdict = self.can_append_logs(&st);
            if verdict != AppendOutcome::Succeeded {
                drop(st);
                self.check_append_log_result(verdict);
                return Ok(receiver);
            }
            (st.last_log_id + 1, st.term)
        };

        let batch = AppendBatch::new(first_log_id, term, swapped, self.atomic_resolver());
        let part = Arc::clone(self);
        tokio::spawn(async move {
            part.run_flight(batch, term).await;
        });
        Ok(receiver)
    }

    fn can_append_logs(&self, st: &PartState) -> AppendOutcome {
        match st.status {
            PartitionStatus::Starting => return AppendOutcome::NotReady,
            PartitionStatus::Stopped => return AppendOutcome::Stopped,
            PartitionStatus::WaitingSnapshot => return AppendOutcome::NotReady,
            PartitionStatus::Running => {}
        }
        if st.role != Role::Leader {
            return AppendOutcome::NotLeader;
        }
        AppendOutcome::Succeeded
    }

    fn atomic_resolver(self: &Arc<Self>) -> AtomicOpResolver {
        let part = Arc::clone(self);
        Box::new(move |op: AtomicOp| {
            let result = op();
            if result.is_none() {
                part.sending
                    .lock()
                    .set_one_single_value(AppendOutcome::AtomicOpFailure);
            }
            result
        })
    }

    /// Fail the whole flight: drain the buffer and resolve every
    /// attached future with `outcome`.
    fn check_append_log_result(&self, outcome: AppendOutcome) {
        {
            let mut buffer = self.logs.lock();
            buffer.logs.clear();
            buffer.caching.set_value(outcome);
        }
        self.sending.lock().set_value(outcome);
        self.buffer_overflow.store(false, Ordering::Release);
        self.replicating.store(false, Ordering::Release);
    }

    // ---------------------------------------------------------------
    // Replication pipeline
    // ---------------------------------------------------------------

    async fn run_flight(self: Arc<Self>, mut batch: AppendBatch, term: Term) {
        loop {
            if !batch.valid() {
                // Every leading atomic op failed; their futures were
                // already resolved by the resolver.
                self.replicating.store(false, Ordering::Release);
                return;
            }

            // Step 1: write the run to the WAL.
            let mut wal_error = None;
            let outcome = {
                let st = self.state.lock();
                let verdict = self.flight_verdict(&st, term);
                if verdict != AppendOutcome::Succeeded {
                    Err(verdict)
                } else {
                    let committed = st.committed_log_id;
                    match self.wal.append_batch(&mut batch) {
                        Ok(last) => Ok((committed, last)),
                        Err(e) => {
                            wal_error = Some(e);
                            Err(AppendOutcome::WalFailure)
                        }
                    }
                }
            };
            let (committed, last_log_id) = match outcome {
                Ok(ids) => ids,
                Err(verdict) => {
                    if let Some(e) = wal_error {
                        error!(
                            space = self.config.space_id,
                            part = self.config.part_id,
                            error = %e,
                            "failed to write batch to WAL"
                        );
                    }
                    self.check_append_log_result(verdict);
                    return;
                }
            };

            // Step 2: fan out until a quorum of voters acknowledges.
            loop {
                let acks = self.replicate_round(term, last_log_id, committed).await;
                let (verdict, quorum) = {
                    let st = self.state.lock();
                    (self.flight_verdict(&st, term), st.quorum)
                };
                if verdict != AppendOutcome::Succeeded {
                    self.check_append_log_result(verdict);
                    return;
                }
                if acks >= quorum {
                    self.retry_num.store(0, Ordering::Release);
                    break;
                }
                let retry = self.retry_num.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    acks,
                    quorum,
                    retry,
                    "quorum not reached, retrying"
                );
                tokio::time::sleep(Duration::from_millis(retry)).await;
            }

            // Step 3: advance the commit point and apply.
            let next_first_log_id = {
                let mut st = self.state.lock();
                let verdict = self.flight_verdict(&st, term);
                if verdict != AppendOutcome::Succeeded {
                    drop(st);
                    self.check_append_log_result(verdict);
                    return;
                }
                st.last_log_id = last_log_id;
                st.last_log_term = term;

                let to_commit = self.wal.entries_range(st.committed_log_id + 1, last_log_id);
                self.apply_commit_hooks(&mut st, &to_commit);
                if let Err(e) = self.state_machine.commit_logs(&to_commit) {
                    // An inconsistent state machine cannot be recovered
                    // in place.
                    error!(
                        space = self.config.space_id,
                        part = self.config.part_id,
                        error = %e,
                        "commit failed on the leader"
                    );
                    panic!("unrecoverable commit failure: {}", e);
                }
                st.committed_log_id = last_log_id;
                let now = self.clock.now_ms();
                st.last_msg_accepted_cost_ms = now.saturating_sub(st.last_msg_sent_ms);
                st.last_msg_accepted_ms = now;
                st.last_log_id + 1
            };

            // Step 4: fulfil the client futures of this run.
            {
                let mut sending = self.sending.lock();
                if batch.has_non_atomic_logs() {
                    sending.set_one_shared_value(AppendOutcome::Succeeded);
                }
                if batch.lead_by_atomic_op() {
                    sending.set_one_single_value(AppendOutcome::Succeeded);
                }
            }

            // Step 5: continue with the rest of the batch, pick up new
            // submissions, or end the flight.
            {
                let mut buffer = self.logs.lock();
                batch.resume();
                if batch.is_exhausted() {
                    if !buffer.logs.is_empty() {
                        *self.sending.lock() = buffer.caching.take();
                        let swapped = std::mem::take(&mut buffer.logs);
                        self.buffer_overflow.store(false, Ordering::Release);
                        batch = AppendBatch::new(
                            next_first_log_id,
                            term,
                            swapped,
                            self.atomic_resolver(),
                        );
                    }
                    if batch.is_exhausted() {
                        self.replicating.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }

    fn flight_verdict(&self, st: &PartState, term: Term) -> AppendOutcome {
        if st.status != PartitionStatus::Running {
            return AppendOutcome::Stopped;
        }
        if st.role != Role::Leader {
            return AppendOutcome::NotLeader;
        }
        if st.term != term {
            return AppendOutcome::TermOutOfDate {
                found: term,
                current: st.term,
            };
        }
        AppendOutcome::Succeeded
    }

    /// One fan-out round. Resolves as soon as a quorum of voters has
    /// acknowledged; laggards keep receiving in the background.
    async fn replicate_round(&self, term: Term, last_log_id: LogId, committed: LogId) -> usize {
        let quorum = {
            let mut st = self.state.lock();
            st.last_msg_sent_ms = self.clock.now_ms();
            st.quorum
        };
        let now = self.clock.now_ms();
        let mut rounds = FuturesUnordered::new();
        for host in self.peers.all() {
            let host = Arc::clone(&host);
            rounds.push(tokio::spawn(async move {
                let voter = !host.is_learner();
                let acked = matches!(
                    host.append_logs(term, last_log_id, committed, now).await,
                    Ok(resp) if resp.error_code.is_success()
                );
                (voter, acked)
            }));
        }

        let mut acks = 0;
        while let Some(joined) = rounds.next().await {
            if let Ok((voter, acked)) = joined {
                if voter && acked {
                    acks += 1;
                    if acks >= quorum {
                        break;
                    }
                }
            }
        }
        acks
    }

    // ---------------------------------------------------------------
    // Election
    // ---------------------------------------------------------------

    fn schedule_status_polling(self: &Arc<Self>, delay_ms: u64, start_time: u64) {
        let part = Arc::clone(self);
        self.workers
            .add_delay_task(Duration::from_millis(delay_ms), async move {
                part.status_polling(start_time).await;
            });
    }

    /// Periodic background tick: drives elections, the
    /// sync-with-follower refresh and snapshot-timeout cleanup.
    async fn status_polling(self: Arc<Self>, start_time: u64) {
        {
            let st = self.state.lock();
            // A restart changed the start time; this poller is stale.
            if st.start_time_ms != start_time {
                return;
            }
        }
        let mut delay_ms = self.config.heartbeat_interval.as_millis() as u64 / 3;
        if self.need_to_start_election() {
            if !self.leader_election().await {
                let weight = self.state.lock().weight;
                delay_ms = rand::thread_rng().gen_range(500..2000) * weight;
            }
        }
        if self.need_sync_with_follower() {
            debug!(
                space = self.config.space_id,
                part = self.config.part_id,
                "replicating an empty entry to refresh the lease"
            );
            let _ = self.submit(self.config.cluster_id, LogType::Normal, Vec::new(), None);
        }
        if self.need_cleanup_snapshot() {
            self.cleanup_snapshot();
        }
        {
            let st = self.state.lock();
            if st.status == PartitionStatus::Running
                || st.status == PartitionStatus::WaitingSnapshot
            {
                drop(st);
                self.schedule_status_polling(delay_ms, start_time);
            }
        }
    }

    fn need_to_start_election(&self) -> bool {
        let mut st = self.state.lock();
        let elapsed = self
            .clock
            .now_ms()
            .saturating_sub(self.last_msg_recv_ms.load(Ordering::Acquire));
        let timeout = st.weight * self.config.heartbeat_interval.as_millis() as u64;
        if st.status == PartitionStatus::Running
            && st.role == Role::Follower
            && (elapsed >= timeout || st.term == 0)
        {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                term = st.term,
                elapsed_ms = elapsed,
                "election timeout, becoming candidate"
            );
            st.role = Role::Candidate;
            st.leader = None;
            self.update_hint(&st);
        }
        st.role == Role::Candidate
    }

    fn prepare_election_request(&self) -> Option<(AskForVoteRequest, Vec<Arc<Host>>, usize)> {
        let mut st = self.state.lock();
        if st.status != PartitionStatus::Running {
            debug!(
                space = self.config.space_id,
                part = self.config.part_id,
                "not running, skipping the election"
            );
            return None;
        }
        if st.role != Role::Candidate {
            debug!(
                space = self.config.space_id,
                part = self.config.part_id,
                "a leader was elected meanwhile, skipping the election"
            );
            return None;
        }
        st.voted_for = None;
        st.proposed_term += 1;
        let request = AskForVoteRequest {
            space: self.config.space_id,
            part: self.config.part_id,
            candidate: self.config.local_addr,
            term: st.proposed_term,
            last_log_id: st.last_log_id,
            last_log_term: st.last_log_term,
        };
        Some((request, self.peers.voters(), st.quorum))
    }

    /// Run one ballot. Returns true when the election round settled
    /// (either we lead or someone else does); false means no quorum
    /// and the caller should retry after a randomized backoff.
    async fn leader_election(self: &Arc<Self>) -> bool {
        let (request, voters, quorum) = match self.prepare_election_request() {
            Some(prep) => prep,
            None => {
                // A candidate stuck in a non-electable state (for
                // example waiting for a snapshot) must fall back to
                // follower, or it would reject the very snapshot it is
                // waiting for.
                let mut st = self.state.lock();
                if st.role == Role::Candidate {
                    st.role = Role::Follower;
                    self.update_hint(&st);
                }
                return false;
            }
        };
        let proposed_term = request.term;
        info!(
            space = self.config.space_id,
            part = self.config.part_id,
            term = proposed_term,
            last_log_id = request.last_log_id,
            last_log_term = request.last_log_term,
            "sending ballot to peers"
        );

        let mut codes = Vec::new();
        if !voters.is_empty() {
            let mut ballots = FuturesUnordered::new();
            for host in voters {
                let request = request.clone();
                ballots.push(tokio::spawn(async move {
                    (host.address(), host.ask_for_vote(request).await)
                }));
            }
            let mut grants = 0;
            while let Some(joined) = ballots.next().await {
                if let Ok((addr, result)) = joined {
                    match result {
                        Ok(resp) => {
                            if resp.error_code.is_success() {
                                grants += 1;
                            }
                            codes.push((addr, resp.error_code));
                            if grants >= quorum {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(peer = %addr, error = %e, "ballot not delivered");
                        }
                    }
                }
            }
        }

        match self.process_election_responses(&codes, proposed_term) {
            Role::Leader => {
                let last_log_id;
                {
                    let mut st = self.state.lock();
                    if st.status != PartitionStatus::Running {
                        return true;
                    }
                    st.leader = Some(self.config.local_addr);
                    st.weight = 1;
                    st.last_msg_accepted_ms = 0;
                    last_log_id = st.last_log_id;
                    self.update_hint(&st);
                }
                for host in self.peers.all() {
                    host.reset(last_log_id);
                }
                let sm = Arc::clone(&self.state_machine);
                self.workers.add_task(async move {
                    sm.on_elected(proposed_term);
                });
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    term = proposed_term,
                    "won the election"
                );
                // Establish the commit point of the new term.
                let _ = self.submit(self.config.cluster_id, LogType::Normal, Vec::new(), None);
                true
            }
            Role::Follower => {
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    "someone else was elected"
                );
                true
            }
            Role::Candidate => {
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    term = proposed_term,
                    "no quorum of grants, will retry the election"
                );
                false
            }
            Role::Learner => {
                error!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    "a learner must never run an election"
                );
                false
            }
        }
    }

    fn process_election_responses(
        &self,
        codes: &[(HostAddr, ErrorCode)],
        proposed_term: Term,
    ) -> Role {
        let mut st = self.state.lock();
        if st.status != PartitionStatus::Running {
            return st.role;
        }
        if st.role != Role::Candidate {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                role = %st.role,
                "role changed during the election, discarding ballots"
            );
            return st.role;
        }
        let mut grants = 0;
        for (addr, code) in codes {
            match code {
                ErrorCode::Succeeded => grants += 1,
                ErrorCode::LogStale => {
                    info!(
                        space = self.config.space_id,
                        part = self.config.part_id,
                        peer = %addr,
                        "peer has newer logs, doubling the election backoff"
                    );
                    st.weight = st.weight.saturating_mul(2);
                }
                other => {
                    debug!(peer = %addr, code = ?other, "vote rejected");
                }
            }
        }
        if grants >= st.quorum {
            st.term = proposed_term;
            st.role = Role::Leader;
            self.update_hint(&st);
        }
        st.role
    }

    /// Serve an incoming ballot.
    pub fn process_ask_for_vote(&self, request: &AskForVoteRequest) -> AskForVoteResponse {
        let mut st = self.state.lock();
        info!(
            space = self.config.space_id,
            part = self.config.part_id,
            candidate = %request.candidate,
            term = request.term,
            last_log_id = request.last_log_id,
            last_log_term = request.last_log_term,
            "received a ballot"
        );

        match st.status {
            PartitionStatus::Stopped => {
                return AskForVoteResponse {
                    error_code: ErrorCode::BadState,
                }
            }
            PartitionStatus::Starting | PartitionStatus::WaitingSnapshot => {
                return AskForVoteResponse {
                    error_code: ErrorCode::NotReady,
                }
            }
            PartitionStatus::Running => {}
        }
        if st.role == Role::Learner {
            return AskForVoteResponse {
                error_code: ErrorCode::BadRole,
            };
        }

        // Only a known voter may be elected.
        match self.peers.find(request.candidate) {
            Some(host) if !host.is_learner() => {}
            _ => {
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    candidate = %request.candidate,
                    "ballot from an unknown or non-voting peer"
                );
                return AskForVoteResponse {
                    error_code: ErrorCode::WrongLeader,
                };
            }
        }

        if request.term <= st.term {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                term = st.term,
                proposed = request.term,
                "ballot term is not newer"
            );
            return AskForVoteResponse {
                error_code: ErrorCode::TermOutOfDate,
            };
        }

        if request.last_log_term < st.last_log_term {
            return AskForVoteResponse {
                error_code: ErrorCode::TermOutOfDate,
            };
        }
        if request.last_log_term == st.last_log_term && request.last_log_id < st.last_log_id {
            return AskForVoteResponse {
                error_code: ErrorCode::LogStale,
            };
        }

        if let Some(voted) = st.voted_for {
            // A duplicate ballot from the peer we already granted in
            // this term gets the same answer.
            if voted == request.candidate && st.proposed_term == request.term {
                self.last_msg_recv_ms
                    .store(self.clock.now_ms(), Ordering::Release);
                return AskForVoteResponse {
                    error_code: ErrorCode::Succeeded,
                };
            }
            if st.proposed_term >= request.term {
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    voted = %voted,
                    proposed_term = st.proposed_term,
                    "already voted in this or a newer term"
                );
                return AskForVoteResponse {
                    error_code: ErrorCode::TermOutOfDate,
                };
            }
        }

        info!(
            space = self.config.space_id,
            part = self.config.part_id,
            candidate = %request.candidate,
            term = request.term,
            "granting the vote"
        );
        st.role = Role::Follower;
        st.voted_for = Some(request.candidate);
        st.proposed_term = request.term;
        st.leader = None;
        st.weight = 1;
        self.update_hint(&st);
        self.last_msg_recv_ms
            .store(self.clock.now_ms(), Ordering::Release);

        AskForVoteResponse {
            error_code: ErrorCode::Succeeded,
        }
    }

    // ---------------------------------------------------------------
    // Incoming replication
    // ---------------------------------------------------------------

    /// Serve an incoming AppendLog request (replication, heartbeat or
    /// snapshot notice).
    pub fn process_append_log(&self, request: &AppendLogRequest) -> AppendLogResponse {
        // Keep-alive fast path: refresh the election timer without the
        // partition lock when the sender is the accepted leader. The
        // hint may be stale; the next full request re-verifies.
        if request.keep_alive {
            let hint = *self.leader_hint.read();
            if hint.role == Role::Follower
                && hint.term == request.current_term
                && hint.leader == Some(request.leader)
            {
                self.last_msg_recv_ms
                    .store(self.clock.now_ms(), Ordering::Release);
                return AppendLogResponse {
                    error_code: ErrorCode::Succeeded,
                    current_term: hint.term,
                    leader: hint.leader,
                    committed_log_id: 0,
                    last_log_id: 0,
                    last_log_term: 0,
                };
            }
        }

        let mut st = self.state.lock();
        let mut response = AppendLogResponse {
            error_code: ErrorCode::Succeeded,
            current_term: st.term,
            leader: st.leader,
            committed_log_id: st.committed_log_id,
            last_log_id: st.last_log_id.max(st.committed_log_id),
            last_log_term: st.last_log_term,
        };

        match st.status {
            PartitionStatus::Stopped => {
                response.error_code = ErrorCode::BadState;
                return response;
            }
            PartitionStatus::Starting => {
                response.error_code = ErrorCode::NotReady;
                return response;
            }
            _ => {}
        }

        let verdict = self.verify_leader(&mut st, request);
        if !verdict.is_success() {
            response.error_code = verdict;
            response.current_term = st.term;
            response.leader = st.leader;
            return response;
        }
        response.current_term = st.term;
        response.leader = st.leader;

        self.last_msg_recv_ms
            .store(self.clock.now_ms(), Ordering::Release);

        if request.keep_alive {
            response.error_code = ErrorCode::Succeeded;
            return response;
        }

        if request.sending_snapshot && st.status != PartitionStatus::WaitingSnapshot {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                leader_committed = request.committed_log_id,
                "leader is about to stream a snapshot, waiting for it"
            );
            self.reset_locked(&mut st);
            st.status = PartitionStatus::WaitingSnapshot;
            st.snapshot_recv_ms = self.clock.now_ms();
            response.committed_log_id = st.committed_log_id;
            response.last_log_id = st.last_log_id;
            response.last_log_term = st.last_log_term;
            response.error_code = ErrorCode::WaitingSnapshot;
            return response;
        }

        if st.status == PartitionStatus::WaitingSnapshot {
            // Keep accumulating the tail while the snapshot streams,
            // but commit nothing.
            if st.last_log_id > 0 && request.prev_log_id > st.last_log_id {
                response.error_code = ErrorCode::LogGap;
                return response;
            }
            return self.append_to_wal(&mut st, request, response, false);
        }

        if request.prev_log_id < st.committed_log_id {
            if request.prev_log_term <= st.term {
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    prev_log_id = request.prev_log_id,
                    committed_log_id = st.committed_log_id,
                    "the sent log precedes the committed point"
                );
                response.error_code = ErrorCode::LogStale;
                return response;
            }
            // A newer-term leader claims a prefix we believe committed:
            // the local history is wrong, rebuild from scratch.
            warn!(
                space = self.config.space_id,
                part = self.config.part_id,
                prev_log_id = request.prev_log_id,
                prev_log_term = request.prev_log_term,
                committed_log_id = st.committed_log_id,
                "local committed state diverges from the leader, wiping"
            );
            self.reset_locked(&mut st);
            response.committed_log_id = st.committed_log_id;
            response.last_log_id = st.last_log_id;
            response.last_log_term = st.last_log_term;
        }

        if st.last_log_term > 0 && request.prev_log_term != st.last_log_term {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                local_last_log_term = st.last_log_term,
                prev_log_term = request.prev_log_term,
                committed_log_id = st.committed_log_id,
                "tail term mismatch, rolling back to the committed point"
            );
            if self.wal.rollback_to(st.committed_log_id).is_ok() {
                st.last_log_id = self.wal.last_log_id().max(st.committed_log_id);
                st.last_log_term = self.wal.last_log_term();
                response.last_log_id = st.last_log_id;
                response.last_log_term = st.last_log_term;
            }
            response.error_code = ErrorCode::LogGap;
            return response;
        }
        if request.prev_log_id > st.last_log_id {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                prev_log_id = request.prev_log_id,
                last_log_id = st.last_log_id,
                "missing entries before the sent log"
            );
            response.error_code = ErrorCode::LogGap;
            return response;
        }
        if request.prev_log_id < st.last_log_id {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                prev_log_id = request.prev_log_id,
                last_log_id = st.last_log_id,
                "the sent log is stale"
            );
            response.error_code = ErrorCode::LogStale;
            return response;
        }

        self.append_to_wal(&mut st, request, response, true)
    }

    /// Append the request's entries and, when commit is allowed,
    /// advance the commit point to the leader's.
    fn append_to_wal(
        &self,
        st: &mut PartState,
        request: &AppendLogRequest,
        mut response: AppendLogResponse,
        allow_commit: bool,
    ) -> AppendLogResponse {
        if let Err(e) = self.wal.append(&request.entries) {
            error!(
                space = self.config.space_id,
                part = self.config.part_id,
                error = %e,
                "failed to append entries to the WAL"
            );
            response.error_code = ErrorCode::WalFail;
            return response;
        }
        if !request.entries.is_empty() {
            st.last_log_id = self.wal.last_log_id();
            st.last_log_term = self.wal.last_log_term();
            response.last_log_id = st.last_log_id;
            response.last_log_term = st.last_log_term;
            self.pre_process_entries(st, &request.entries);
        }

        if allow_commit && request.committed_log_id > st.committed_log_id {
            // Only commit what the local log actually holds.
            let commit_to = st.last_log_id.min(request.committed_log_id);
            let entries = self.wal.entries_range(st.committed_log_id + 1, commit_to);
            self.apply_commit_hooks(st, &entries);
            if let Err(e) = self.state_machine.commit_logs(&entries) {
                error!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    error = %e,
                    "failed to commit entries"
                );
                response.error_code = ErrorCode::WalFail;
                return response;
            }
            st.committed_log_id = commit_to;
            response.committed_log_id = commit_to;
        }

        response.error_code = ErrorCode::Succeeded;
        response
    }

    /// Decide whether to accept `request.leader` and follow it.
    fn verify_leader(&self, st: &mut PartState, request: &AppendLogRequest) -> ErrorCode {
        if !self.peers.contains(request.leader) {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                claimed = %request.leader,
                "append from a peer outside the directory"
            );
            return ErrorCode::WrongLeader;
        }
        if request.current_term < st.term {
            debug!(
                space = self.config.space_id,
                part = self.config.part_id,
                term = st.term,
                remote_term = request.current_term,
                "remote term is older"
            );
            return ErrorCode::TermOutOfDate;
        }
        if request.current_term > st.term {
            // Leader stickiness: while the incumbent is heartbeating,
            // reject takeovers even at a higher term.
            if self.config.leader_stickiness {
                let recv_elapsed = self
                    .clock
                    .now_ms()
                    .saturating_sub(self.last_msg_recv_ms.load(Ordering::Acquire));
                if st.leader.is_some()
                    && st.leader != Some(request.leader)
                    && recv_elapsed < self.config.heartbeat_interval.as_millis() as u64
                {
                    debug!(
                        space = self.config.space_id,
                        part = self.config.part_id,
                        incumbent = ?st.leader,
                        claimed = %request.leader,
                        "incumbent leader still alive, refusing the takeover"
                    );
                    return ErrorCode::WrongLeader;
                }
            }
        } else {
            // Equal terms: accept only the leader we already know, or
            // anyone if we know none and are not leading ourselves.
            if st.role != Role::Leader && st.leader.is_none() {
                debug!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    term = st.term,
                    candidate = %request.leader,
                    "no known leader for the current term, accepting"
                );
            } else if st.role != Role::Leader && st.leader == Some(request.leader) {
                return ErrorCode::Succeeded;
            } else {
                debug!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    term = st.term,
                    role = %st.role,
                    "same term but a different leadership claim, rejecting"
                );
                return ErrorCode::TermOutOfDate;
            }
        }

        let old_role = st.role;
        let old_term = st.term;
        info!(
            space = self.config.space_id,
            part = self.config.part_id,
            leader = %request.leader,
            term = request.current_term,
            role = %old_role,
            "following the leader"
        );
        if st.role != Role::Learner {
            st.role = Role::Follower;
        }
        st.leader = Some(request.leader);
        st.term = request.current_term;
        st.proposed_term = request.current_term;
        st.voted_for = None;
        st.weight = 1;
        self.update_hint(st);

        // An uncommitted suffix written while we led must not survive
        // a leadership change.
        if self.wal.last_log_id() > st.last_log_id {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                wal_last = self.wal.last_log_id(),
                last_log_id = st.last_log_id,
                "rolling back the unacknowledged WAL suffix"
            );
            if let Err(e) = self.wal.rollback_to(st.last_log_id) {
                error!(error = %e, "failed to roll back the WAL suffix");
            }
        }

        if old_role == Role::Leader {
            let sm = Arc::clone(&self.state_machine);
            self.workers.add_task(async move {
                sm.on_lost_leadership(old_term);
            });
        }
        let sm = Arc::clone(&self.state_machine);
        let leader = request.leader;
        self.workers.add_task(async move {
            sm.on_discover_new_leader(leader);
        });
        ErrorCode::Succeeded
    }

    // ---------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------

    /// Follower-side hooks, run when entries are appended (and during
    /// WAL recovery through the state machine).
    fn pre_process_entries(&self, st: &mut PartState, entries: &[LogEntry]) {
        for entry in entries {
            if entry.is_command() {
                match MembershipChange::decode(entry.payload_bytes()) {
                    Ok(change) => self.pre_apply_membership(st, &change),
                    Err(e) => warn!(
                        log_id = entry.log_id,
                        error = %e,
                        "undecodable membership command"
                    ),
                }
            }
            if !self.state_machine.pre_process_log(entry) {
                warn!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    log_id = entry.log_id,
                    "host rejected an entry in pre-processing"
                );
            }
        }
    }

    fn pre_apply_membership(&self, st: &mut PartState, change: &MembershipChange) {
        match change.change_type {
            MembershipChangeType::AddPeer | MembershipChangeType::PromoteLearner => {
                self.add_peer_locked(st, change.peer);
            }
            MembershipChangeType::RemovePeer => {
                if st.role == Role::Leader {
                    debug!(peer = %change.peer, "leader defers peer removal to commit");
                } else {
                    self.remove_peer_locked(st, change.peer);
                }
            }
            MembershipChangeType::AddLearner => {
                self.add_learner_locked(st, change.peer);
            }
            MembershipChangeType::TransferLeader => {
                self.pre_process_transfer_leader(st, change.peer);
            }
        }
    }

    /// Leader-side hooks, run at commit time.
    fn apply_commit_hooks(&self, st: &mut PartState, entries: &[LogEntry]) {
        for entry in entries {
            if !entry.is_command() {
                continue;
            }
            match MembershipChange::decode(entry.payload_bytes()) {
                Ok(change) => self.commit_apply_membership(st, &change),
                Err(e) => warn!(
                    log_id = entry.log_id,
                    error = %e,
                    "undecodable membership command at commit"
                ),
            }
        }
    }

    fn commit_apply_membership(&self, st: &mut PartState, change: &MembershipChange) {
        match change.change_type {
            MembershipChangeType::AddPeer | MembershipChangeType::PromoteLearner => {
                self.add_peer_locked(st, change.peer);
            }
            MembershipChangeType::RemovePeer => {
                if st.role != Role::Leader {
                    debug!(peer = %change.peer, role = %st.role, "removal already applied in pre-processing");
                } else if change.peer == self.config.local_addr {
                    // Removing the local replica happens in a later
                    // external phase.
                    info!(
                        space = self.config.space_id,
                        part = self.config.part_id,
                        "own removal committed, leaving it to the removal phase"
                    );
                } else {
                    self.remove_peer_locked(st, change.peer);
                }
            }
            MembershipChangeType::AddLearner => {
                self.add_learner_locked(st, change.peer);
            }
            MembershipChangeType::TransferLeader => {
                self.commit_transfer_leader(st, change.peer);
            }
        }
    }

    fn add_peer_locked(&self, st: &mut PartState, peer: HostAddr) {
        if peer == self.config.local_addr {
            if st.role == Role::Learner {
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    "promoted from learner to follower"
                );
                st.role = Role::Follower;
                self.update_hint(st);
                st.quorum = self.peers.required_acks();
            }
            return;
        }
        if let Some(host) = self.peers.find(peer) {
            if host.is_learner() {
                info!(peer = %peer, "promoting learner to voter");
                host.set_learner(false);
                st.quorum = self.peers.required_acks();
            }
            return;
        }
        info!(peer = %peer, "adding voter");
        self.peers.add(Arc::new(self.make_host(peer, false)));
        st.quorum = self.peers.required_acks();
    }

    fn remove_peer_locked(&self, st: &mut PartState, peer: HostAddr) {
        if peer == self.config.local_addr {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                "own removal is handled by the external removal phase"
            );
            return;
        }
        match self.peers.remove(peer) {
            Some(host) => {
                host.stop();
                if !host.is_learner() {
                    st.quorum = self.peers.required_acks();
                }
                info!(peer = %peer, learner = host.is_learner(), "removed peer");
            }
            None => {
                info!(peer = %peer, "peer to remove does not exist");
            }
        }
    }

    fn add_learner_locked(&self, st: &mut PartState, peer: HostAddr) {
        let _ = st;
        if peer == self.config.local_addr {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                "the local replica is the learner"
            );
            return;
        }
        if self.peers.contains(peer) {
            info!(peer = %peer, "peer already present, not adding as learner");
            return;
        }
        info!(peer = %peer, "adding learner");
        self.peers.add(Arc::new(self.make_host(peer, true)));
    }

    fn pre_process_transfer_leader(&self, st: &mut PartState, target: HostAddr) {
        if st.role != Role::Follower {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                role = %st.role,
                "ignoring the transfer-leader pre-processing for this role"
            );
            return;
        }
        if target != self.config.local_addr {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                target = %target,
                "waiting for the designated peer to take over"
            );
            return;
        }
        info!(
            space = self.config.space_id,
            part = self.config.part_id,
            "designated as the next leader, starting an election"
        );
        st.role = Role::Candidate;
        st.leader = None;
        self.update_hint(st);
        if let Some(part) = self.arc_self() {
            self.workers.add_task(async move {
                let _ = part.leader_election().await;
            });
        }
    }

    fn commit_transfer_leader(&self, st: &mut PartState, target: HostAddr) {
        match st.role {
            Role::Leader => {
                if target == self.config.local_addr {
                    info!(
                        space = self.config.space_id,
                        part = self.config.part_id,
                        "already the leader, nothing to transfer"
                    );
                    return;
                }
                if self.peers.voters().is_empty() {
                    return;
                }
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    target = %target,
                    "giving up leadership for the transfer"
                );
                let old_term = st.term;
                self.last_msg_recv_ms
                    .store(self.clock.now_ms(), Ordering::Release);
                st.role = Role::Follower;
                st.leader = None;
                self.update_hint(st);
                let sm = Arc::clone(&self.state_machine);
                self.workers.add_task(async move {
                    sm.on_lost_leadership(old_term);
                });
            }
            Role::Follower | Role::Candidate => {
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    role = %st.role,
                    "waiting for the transferred leadership to settle"
                );
            }
            Role::Learner => {
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    "learner ignores the leadership transfer"
                );
            }
        }
    }

    /// Owned handle to self for scheduled tasks. The weak reference is
    /// installed right after construction, so this only yields `None`
    /// during teardown.
    fn arc_self(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(|weak| weak.upgrade())
    }

    // ---------------------------------------------------------------
    // Heartbeats and lease upkeep
    // ---------------------------------------------------------------

    async fn heartbeat_loop(self: Arc<Self>) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        loop {
            if self.need_to_send_heartbeat() {
                self.send_keep_alive();
            }
            {
                let st = self.state.lock();
                match st.status {
                    PartitionStatus::Running | PartitionStatus::WaitingSnapshot => {}
                    _ => return,
                }
            }
            tokio::time::sleep(self.config.heartbeat_interval / 3).await;
        }
    }

    fn need_to_send_heartbeat(&self) -> bool {
        {
            let st = self.state.lock();
            if st.status != PartitionStatus::Running || st.role != Role::Leader {
                return false;
            }
        }
        let since = self
            .clock
            .now_ms()
            .saturating_sub(self.last_heartbeat_ms.load(Ordering::Acquire));
        since >= self.config.heartbeat_interval.as_millis() as u64 * 2 / 5
    }

    fn send_keep_alive(&self) {
        let (term, last_log_id, last_log_term, committed) = {
            let st = self.state.lock();
            (st.term, st.last_log_id, st.last_log_term, st.committed_log_id)
        };
        self.last_heartbeat_ms
            .store(self.clock.now_ms(), Ordering::Release);
        for host in self.peers.all() {
            host.keep_alive(term, last_log_id, last_log_term, committed);
        }
    }

    fn need_sync_with_follower(&self) -> bool {
        if !self.config.enable_sync_with_follower {
            return false;
        }
        let st = self.state.lock();
        st.status == PartitionStatus::Running
            && st.role == Role::Leader
            && self.clock.now_ms().saturating_sub(st.last_msg_accepted_ms)
                >= self.config.sync_with_follower_interval.as_millis() as u64
    }

    // ---------------------------------------------------------------
    // Snapshot receiving side
    // ---------------------------------------------------------------

    /// Serve one incoming snapshot frame.
    pub fn process_send_snapshot(&self, request: &SendSnapshotRequest) -> SendSnapshotResponse {
        let mut st = self.state.lock();
        debug!(
            space = self.config.space_id,
            part = self.config.part_id,
            rows = request.rows.len(),
            total_count = request.total_count,
            total_size = request.total_size,
            done = request.done,
            "received a snapshot frame"
        );
        match st.status {
            PartitionStatus::Stopped => {
                return SendSnapshotResponse {
                    error_code: ErrorCode::BadState,
                }
            }
            PartitionStatus::Starting => {
                return SendSnapshotResponse {
                    error_code: ErrorCode::NotReady,
                }
            }
            _ => {}
        }
        if st.role != Role::Follower && st.role != Role::Learner {
            error!(
                space = self.config.space_id,
                part = self.config.part_id,
                role = %st.role,
                "only a follower or learner may install a snapshot"
            );
            return SendSnapshotResponse {
                error_code: ErrorCode::BadState,
            };
        }
        if st.leader != Some(request.leader) || st.term != request.term {
            error!(
                space = self.config.space_id,
                part = self.config.part_id,
                term = st.term,
                remote_term = request.term,
                "snapshot from a stale term or leader"
            );
            return SendSnapshotResponse {
                error_code: ErrorCode::TermOutOfDate,
            };
        }
        if st.status != PartitionStatus::WaitingSnapshot {
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                "first snapshot frame, resetting local state"
            );
            self.reset_locked(&mut st);
            st.status = PartitionStatus::WaitingSnapshot;
        }
        st.snapshot_recv_ms = self.clock.now_ms();

        match self.state_machine.commit_snapshot(
            &request.rows,
            request.committed_log_id,
            request.committed_log_term,
            request.done,
        ) {
            Ok((rows, bytes)) => {
                st.snapshot_rows_received += rows;
                st.snapshot_bytes_received += bytes;
            }
            Err(e) => {
                error!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    error = %e,
                    "failed to ingest a snapshot frame"
                );
                return SendSnapshotResponse {
                    error_code: ErrorCode::PersistSnapshotFailed,
                };
            }
        }
        if st.snapshot_rows_received != request.total_count
            || st.snapshot_bytes_received != request.total_size
        {
            error!(
                space = self.config.space_id,
                part = self.config.part_id,
                rows_received = st.snapshot_rows_received,
                rows_sent = request.total_count,
                bytes_received = st.snapshot_bytes_received,
                bytes_sent = request.total_size,
                "snapshot totals diverge from the sender"
            );
            return SendSnapshotResponse {
                error_code: ErrorCode::PersistSnapshotFailed,
            };
        }
        if request.done {
            st.committed_log_id = request.committed_log_id;
            if st.last_log_id < st.committed_log_id {
                st.last_log_id = st.committed_log_id;
                st.last_log_term = request.committed_log_term;
            }
            if self.wal.last_log_id() <= st.committed_log_id {
                info!(
                    space = self.config.space_id,
                    part = self.config.part_id,
                    "dropping the WAL tail superseded by the snapshot"
                );
                if let Err(e) = self.wal.reset() {
                    error!(error = %e, "failed to reset the WAL after the snapshot");
                }
            }
            st.status = PartitionStatus::Running;
            info!(
                space = self.config.space_id,
                part = self.config.part_id,
                committed_log_id = st.committed_log_id,
                last_log_id = st.last_log_id,
                last_log_term = st.last_log_term,
                "snapshot fully installed"
            );
        }
        SendSnapshotResponse {
            error_code: ErrorCode::Succeeded,
        }
    }

    fn need_cleanup_snapshot(&self) -> bool {
        let st = self.state.lock();
        st.status == PartitionStatus::WaitingSnapshot
            && st.role != Role::Leader
            && self.clock.now_ms().saturating_sub(st.snapshot_recv_ms)
                >= self.config.snapshot_timeout.as_millis() as u64
    }

    /// Abort a stalled snapshot transfer; the leader will retry.
    fn cleanup_snapshot(&self) {
        let mut st = self.state.lock();
        warn!(
            space = self.config.space_id,
            part = self.config.part_id,
            "snapshot transfer made no progress, abandoning it"
        );
        self.reset_locked(&mut st);
        st.status = PartitionStatus::Running;
    }

    /// Drop all local state: WAL, applied state machine, counters.
    fn reset_locked(&self, st: &mut PartState) {
        if let Err(e) = self.wal.reset() {
            error!(error = %e, "failed to reset the WAL");
        }
        if let Err(e) = self.state_machine.cleanup() {
            error!(error = %e, "host cleanup failed");
        }
        st.last_log_id = 0;
        st.last_log_term = 0;
        st.committed_log_id = 0;
        st.snapshot_rows_received = 0;
        st.snapshot_bytes_received = 0;
    }
}
