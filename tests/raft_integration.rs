//! Raft consensus integration tests.
//!
//! Multi-node scenarios wired through an in-process transport:
//! elections, replication, leader failover, membership changes,
//! snapshot catch-up and backpressure.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

use keel::config::RaftConfig;
use keel::error::{KeelError, Result};
use keel::raft::{
    AppendLogRequest, AppendLogResponse, AskForVoteRequest, AskForVoteResponse, MembershipChange,
    MembershipChangeType, PartitionStatus, RaftPartition, RaftRpc, Role, SendSnapshotRequest,
    SendSnapshotResponse, SnapshotScan, SnapshotStore, StateMachine,
};
use keel::types::{HostAddr, LogEntry, LogId, LogType, Term};

// =============================================================================
// Test state machine
// =============================================================================

#[derive(Default)]
struct SmInner {
    applied: Vec<LogEntry>,
    commit_batches: Vec<Vec<LogId>>,
    rows: Vec<Vec<u8>>,
    committed_log_id: LogId,
    committed_log_term: Term,
}

/// Append-only state machine that materializes every non-empty payload
/// as one snapshot row.
#[derive(Default)]
struct NodeStateMachine {
    inner: Mutex<SmInner>,
}

impl NodeStateMachine {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn applied_payloads(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .applied
            .iter()
            .filter(|e| !e.payload_bytes().is_empty() && e.log_type == LogType::Normal)
            .map(|e| e.payload_bytes().to_vec())
            .collect()
    }

    fn data_rows(&self) -> Vec<Vec<u8>> {
        self.inner.lock().rows.clone()
    }

    fn commit_batches(&self) -> Vec<Vec<LogId>> {
        self.inner.lock().commit_batches.clone()
    }
}

impl StateMachine for NodeStateMachine {
    fn last_committed_log_id(&self) -> (LogId, Term) {
        let inner = self.inner.lock();
        (inner.committed_log_id, inner.committed_log_term)
    }

    fn pre_process_log(&self, _entry: &LogEntry) -> bool {
        true
    }

    fn commit_logs(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner
            .commit_batches
            .push(entries.iter().map(|e| e.log_id).collect());
        for entry in entries {
            if entry.log_type == LogType::Normal && !entry.payload_bytes().is_empty() {
                inner.rows.push(entry.payload_bytes().to_vec());
            }
            inner.committed_log_id = entry.log_id;
            inner.committed_log_term = entry.term;
            inner.applied.push(entry.clone());
        }
        Ok(())
    }

    fn commit_snapshot(
        &self,
        rows: &[Vec<u8>],
        committed_log_id: LogId,
        committed_log_term: Term,
        done: bool,
    ) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();
        let bytes = rows.iter().map(|r| r.len() as u64).sum();
        inner.rows.extend(rows.iter().cloned());
        if done {
            inner.committed_log_id = committed_log_id;
            inner.committed_log_term = committed_log_term;
        }
        Ok((rows.len() as u64, bytes))
    }

    fn cleanup(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        *inner = SmInner::default();
        Ok(())
    }
}

impl SnapshotStore for NodeStateMachine {
    fn read_snapshot(&self) -> Result<SnapshotScan> {
        let inner = self.inner.lock();
        Ok(SnapshotScan {
            committed_log_id: inner.committed_log_id,
            committed_log_term: inner.committed_log_term,
            rows: inner.rows.clone(),
        })
    }
}

// =============================================================================
// In-process transport
// =============================================================================

/// Routes RPCs between partitions in the same process, with optional
/// per-node isolation and delivery delay.
#[derive(Default)]
struct Router {
    nodes: Mutex<HashMap<HostAddr, Arc<RaftPartition>>>,
    down: Mutex<HashSet<HostAddr>>,
    delays: Mutex<HashMap<HostAddr, Duration>>,
}

impl Router {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, addr: HostAddr, part: Arc<RaftPartition>) {
        self.nodes.lock().insert(addr, part);
    }

    fn set_down(&self, addr: HostAddr, down: bool) {
        if down {
            self.down.lock().insert(addr);
        } else {
            self.down.lock().remove(&addr);
        }
    }

    fn set_delay(&self, addr: HostAddr, delay: Duration) {
        self.delays.lock().insert(addr, delay);
    }

    async fn route(&self, sender: HostAddr, target: HostAddr) -> Result<Arc<RaftPartition>> {
        {
            let down = self.down.lock();
            if down.contains(&sender) || down.contains(&target) {
                return Err(KeelError::Transport(format!(
                    "{} -> {} unreachable",
                    sender, target
                )));
            }
        }
        let delay = self.delays.lock().get(&target).copied();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        self.nodes
            .lock()
            .get(&target)
            .cloned()
            .ok_or(KeelError::InvalidPeer(target))
    }
}

#[async_trait::async_trait]
impl RaftRpc for Router {
    async fn ask_for_vote(
        &self,
        target: HostAddr,
        request: AskForVoteRequest,
    ) -> Result<AskForVoteResponse> {
        let part = self.route(request.candidate, target).await?;
        Ok(part.process_ask_for_vote(&request))
    }

    async fn append_log(
        &self,
        target: HostAddr,
        request: AppendLogRequest,
    ) -> Result<AppendLogResponse> {
        let part = self.route(request.leader, target).await?;
        Ok(part.process_append_log(&request))
    }

    async fn send_snapshot(
        &self,
        target: HostAddr,
        request: SendSnapshotRequest,
    ) -> Result<SendSnapshotResponse> {
        let part = self.route(request.leader, target).await?;
        Ok(part.process_send_snapshot(&request))
    }
}

// =============================================================================
// Cluster harness
// =============================================================================

struct Node {
    addr: HostAddr,
    part: Arc<RaftPartition>,
    sm: Arc<NodeStateMachine>,
    _wal_dir: TempDir,
}

struct Cluster {
    router: Arc<Router>,
    nodes: Vec<Node>,
}

fn test_config(addr: HostAddr) -> RaftConfig {
    let mut config = RaftConfig::development(addr);
    // Keep followers' commit points fresh on an idle cluster.
    config.enable_sync_with_follower = true;
    config
}

fn spawn_node(
    router: &Arc<Router>,
    addr: HostAddr,
    peers: Vec<HostAddr>,
    config: RaftConfig,
    as_learner: bool,
) -> Node {
    let wal_dir = TempDir::new().expect("wal dir");
    let sm = NodeStateMachine::new();
    let part = RaftPartition::new(
        config,
        wal_dir.path(),
        Arc::clone(&sm) as Arc<dyn StateMachine>,
        Arc::clone(&sm) as Arc<dyn SnapshotStore>,
        Arc::clone(router) as Arc<dyn RaftRpc>,
    )
    .expect("partition");
    router.register(addr, Arc::clone(&part));
    part.start(peers, as_learner);
    Node {
        addr,
        part,
        sm,
        _wal_dir: wal_dir,
    }
}

fn spawn_cluster(n: usize, base_port: u16) -> Cluster {
    let router = Router::new();
    let addrs: Vec<HostAddr> = (0..n)
        .map(|i| {
            format!("127.0.0.1:{}", base_port + i as u16)
                .parse()
                .expect("valid address")
        })
        .collect();
    let nodes = addrs
        .iter()
        .map(|addr| {
            let peers = addrs.iter().copied().filter(|a| a != addr).collect();
            spawn_node(&router, *addr, peers, test_config(*addr), false)
        })
        .collect();
    Cluster { router, nodes }
}

impl Cluster {
    async fn wait_for_leader(&self, wait: Duration) -> usize {
        timeout(wait, async {
            loop {
                let leaders: Vec<usize> = self
                    .nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| n.part.is_leader())
                    .map(|(i, _)| i)
                    .collect();
                if leaders.len() == 1 {
                    return leaders[0];
                }
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("no leader elected in time")
    }

    async fn stop_all(self) {
        for node in &self.nodes {
            node.part.stop().await;
        }
    }
}

async fn wait_until<F>(wait: Duration, mut pred: F)
where
    F: FnMut() -> bool,
{
    timeout(wait, async {
        while !pred() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

const ELECTION_WAIT: Duration = Duration::from_secs(10);
const SETTLE_WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_happy_path() {
    let cluster = spawn_cluster(3, 9100);
    let leader_idx = cluster.wait_for_leader(ELECTION_WAIT).await;
    let leader = &cluster.nodes[leader_idx];

    let (r1, r2, r3) = tokio::join!(
        leader.part.append(b"p1".to_vec()),
        leader.part.append(b"p2".to_vec()),
        leader.part.append(b"p3".to_vec()),
    );
    r1.expect("p1");
    r2.expect("p2");
    r3.expect("p3");

    let committed = leader.part.committed_log_id();
    assert!(committed >= 3);
    assert_eq!(
        leader.sm.applied_payloads(),
        vec![b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec()]
    );

    // Followers converge on the same prefix within a heartbeat or two.
    wait_until(SETTLE_WAIT, || {
        cluster
            .nodes
            .iter()
            .all(|n| n.part.committed_log_id() >= committed)
    })
    .await;
    for node in &cluster.nodes {
        assert_eq!(
            node.sm.applied_payloads(),
            vec![b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec()]
        );
    }

    // A fresh acknowledgement means the lease is valid, and every
    // follower's reported commit point sits inside the WAL window.
    assert!(leader.part.is_lease_valid());
    wait_until(SETTLE_WAIT, || {
        cluster
            .nodes
            .iter()
            .filter(|n| n.addr != leader.addr)
            .all(|n| leader.part.is_caught_up(n.addr).is_ok())
    })
    .await;
    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_crash_preserves_committed_prefix() {
    let cluster = spawn_cluster(3, 9110);
    let leader_idx = cluster.wait_for_leader(ELECTION_WAIT).await;
    let leader = &cluster.nodes[leader_idx];

    for payload in [b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec()] {
        leader.part.append(payload).await.expect("append");
    }
    let old_term = leader.part.current_term();

    // Partition the leader away; the survivors elect a successor.
    cluster.router.set_down(leader.addr, true);
    let new_leader_idx = timeout(ELECTION_WAIT, async {
        loop {
            if let Some(idx) = cluster
                .nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != leader_idx)
                .find(|(_, n)| n.part.is_leader())
                .map(|(i, _)| i)
            {
                return idx;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no successor elected");

    let new_leader = &cluster.nodes[new_leader_idx];
    assert!(new_leader.part.current_term() > old_term);

    // Everything that committed survives the failover.
    wait_until(SETTLE_WAIT, || {
        new_leader.sm.applied_payloads()
            == vec![b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec()]
    })
    .await;

    // The successor keeps serving writes.
    new_leader.part.append(b"p4".to_vec()).await.expect("p4");
    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_peer_catches_up_via_snapshot() {
    let router = Router::new();
    let a_addr: HostAddr = "127.0.0.1:9121".parse().expect("addr");
    let b_addr: HostAddr = "127.0.0.1:9122".parse().expect("addr");

    // Phase 1: a singleton leader commits a few entries.
    let first = spawn_node(&router, a_addr, Vec::new(), test_config(a_addr), false);
    wait_until(ELECTION_WAIT, || first.part.is_leader()).await;
    for payload in [b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec()] {
        first.part.append(payload).await.expect("append");
    }
    let preserved = first.sm.data_rows();
    assert_eq!(preserved.len(), 3);
    first.part.stop().await;
    let sm = Arc::clone(&first.sm);
    drop(first);

    // Phase 2: the node restarts with its applied state intact but an
    // empty WAL (the log was compacted away), joined by a fresh peer.
    // Catching that peer up is only possible through a snapshot.
    let wal_dir = TempDir::new().expect("wal dir");
    let restarted = RaftPartition::new(
        test_config(a_addr),
        wal_dir.path(),
        Arc::clone(&sm) as Arc<dyn StateMachine>,
        Arc::clone(&sm) as Arc<dyn SnapshotStore>,
        Arc::clone(&router) as Arc<dyn RaftRpc>,
    )
    .expect("partition");
    router.register(a_addr, Arc::clone(&restarted));
    restarted.start(vec![b_addr], false);

    let fresh = spawn_node(&router, b_addr, vec![a_addr], test_config(b_addr), false);

    wait_until(ELECTION_WAIT, || {
        restarted.is_leader() || fresh.part.is_leader()
    })
    .await;

    // The fresh peer ends up with the full materialized state and the
    // same commit point, regardless of which replica leads.
    wait_until(SETTLE_WAIT, || {
        let mut rows = fresh.sm.data_rows();
        rows.sort();
        let mut expected = preserved.clone();
        expected.sort();
        rows == expected
    })
    .await;
    wait_until(SETTLE_WAIT, || {
        fresh.part.committed_log_id() >= 3 && fresh.part.status() == PartitionStatus::Running
    })
    .await;

    restarted.stop().await;
    fresh.part.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_node_cluster_elects_single_leader() {
    let cluster = spawn_cluster(4, 9130);
    cluster.wait_for_leader(ELECTION_WAIT).await;

    // Election safety: never two leaders for the same term.
    let mut by_term: HashMap<Term, usize> = HashMap::new();
    for node in &cluster.nodes {
        if node.part.is_leader() {
            *by_term.entry(node.part.current_term()).or_default() += 1;
        }
    }
    assert!(by_term.values().all(|&count| count <= 1));
    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_membership_command_replicates_alone() {
    let cluster = spawn_cluster(3, 9140);
    let leader_idx = cluster.wait_for_leader(ELECTION_WAIT).await;
    let leader = &cluster.nodes[leader_idx];

    // A fourth replica that nobody references yet.
    let d_addr: HostAddr = "127.0.0.1:9144".parse().expect("addr");
    let d_peers: Vec<HostAddr> = cluster.nodes.iter().map(|n| n.addr).collect();
    let d = spawn_node(
        &cluster.router,
        d_addr,
        d_peers,
        test_config(d_addr),
        false,
    );

    let change = MembershipChange::new(MembershipChangeType::AddPeer, d_addr);
    let (r1, r2, r3) = tokio::join!(
        leader.part.append(b"n1".to_vec()),
        leader.part.change_membership(change),
        leader.part.append(b"n2".to_vec()),
    );
    r1.expect("n1");
    r2.expect("addPeer");
    r3.expect("n2");

    // A command is always the last entry of its commit batch on the
    // leader; nothing ever rides behind it.
    let command_ids: Vec<LogId> = leader
        .sm
        .inner
        .lock()
        .applied
        .iter()
        .filter(|e| e.log_type == LogType::Command)
        .map(|e| e.log_id)
        .collect();
    assert_eq!(command_ids.len(), 1);
    let mut saw_command_batch = false;
    for batch in leader.sm.commit_batches() {
        if batch.contains(&command_ids[0]) {
            assert_eq!(*batch.last().expect("batch"), command_ids[0]);
            saw_command_batch = true;
        }
    }
    assert!(saw_command_batch);

    // The new member is replicated to and catches the whole prefix up.
    wait_until(SETTLE_WAIT, || {
        let payloads = d.sm.applied_payloads();
        payloads.contains(&b"n1".to_vec()) && payloads.contains(&b"n2".to_vec())
    })
    .await;

    d.part.stop().await;
    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_atomic_op_persists_resolver_output() {
    let cluster = spawn_cluster(3, 9150);
    let leader_idx = cluster.wait_for_leader(ELECTION_WAIT).await;
    let leader = &cluster.nodes[leader_idx];

    leader
        .part
        .atomic_op(Box::new(|| Some(b"X".to_vec())))
        .await
        .expect("atomic op");

    // The committed entry carries the resolver's output, not the
    // submitted bytes.
    wait_until(SETTLE_WAIT, || {
        leader
            .sm
            .inner
            .lock()
            .applied
            .iter()
            .any(|e| e.log_type == LogType::AtomicOp && e.payload_bytes() == b"X")
    })
    .await;

    // A failing op resolves the submitter with a dedicated error and
    // appends nothing.
    let before = leader.part.last_log_id();
    let result = leader.part.atomic_op(Box::new(|| None)).await;
    assert!(matches!(result, Err(KeelError::AtomicOpFailure)));
    assert_eq!(leader.part.last_log_id(), before);
    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_buffer_overflow_recovers_after_drain() {
    let router = Router::new();
    let a_addr: HostAddr = "127.0.0.1:9161".parse().expect("addr");
    let b_addr: HostAddr = "127.0.0.1:9162".parse().expect("addr");

    // No background sync entries here: the test counts buffer slots.
    let mut a_config = RaftConfig::development(a_addr);
    a_config.max_batch_size = 2;
    let mut b_config = RaftConfig::development(b_addr);
    b_config.max_batch_size = 2;
    let a = spawn_node(&router, a_addr, vec![b_addr], a_config, false);
    let b = spawn_node(&router, b_addr, vec![a_addr], b_config, false);

    wait_until(ELECTION_WAIT, || a.part.is_leader() || b.part.is_leader()).await;
    let (leader, _follower, follower_addr) = if a.part.is_leader() {
        (&a, &b, b_addr)
    } else {
        (&b, &a, a_addr)
    };

    // Slow the follower down so a flight stays in the air while the
    // buffer fills behind it.
    router.set_delay(follower_addr, Duration::from_millis(500));

    let inflight = tokio::spawn({
        let part = Arc::clone(&leader.part);
        async move { part.append(b"a".to_vec()).await }
    });
    sleep(Duration::from_millis(100)).await;

    let queued: Vec<_> = (0..2)
        .map(|i| {
            let part = Arc::clone(&leader.part);
            tokio::spawn(async move { part.append(format!("q{}", i).into_bytes()).await })
        })
        .collect();
    sleep(Duration::from_millis(100)).await;

    // The buffer is at capacity; the next submission bounces.
    let result = leader.part.append(b"overflow".to_vec()).await;
    assert!(matches!(result, Err(KeelError::BufferOverflow)));

    // Once the flight drains the buffer, submissions are accepted
    // again.
    inflight.await.expect("join").expect("inflight append");
    for handle in queued {
        handle.await.expect("join").expect("queued append");
    }
    router.set_delay(follower_addr, Duration::from_millis(0));
    leader.part.append(b"after".to_vec()).await.expect("after");

    a.part.stop().await;
    b.part.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_learner_receives_entries_but_never_leads() {
    let cluster = spawn_cluster(2, 9170);
    let leader_idx = cluster.wait_for_leader(ELECTION_WAIT).await;
    let leader = &cluster.nodes[leader_idx];

    // Bring up a learner that knows the cluster but is not a member
    // yet, then introduce it through a membership command.
    let l_addr: HostAddr = "127.0.0.1:9173".parse().expect("addr");
    let l_peers: Vec<HostAddr> = cluster.nodes.iter().map(|n| n.addr).collect();
    let learner = spawn_node(&cluster.router, l_addr, l_peers, test_config(l_addr), true);
    assert_eq!(learner.part.role(), Role::Learner);

    leader
        .part
        .change_membership(MembershipChange::new(
            MembershipChangeType::AddLearner,
            l_addr,
        ))
        .await
        .expect("add learner");

    leader.part.append(b"p1".to_vec()).await.expect("p1");

    // The learner receives replicated entries...
    wait_until(SETTLE_WAIT, || {
        learner.sm.applied_payloads().contains(&b"p1".to_vec())
    })
    .await;
    // ...but stays out of leadership.
    assert_eq!(learner.part.role(), Role::Learner);

    // Promotion turns it into a follower that counts for quorum.
    leader
        .part
        .change_membership(MembershipChange::new(
            MembershipChangeType::PromoteLearner,
            l_addr,
        ))
        .await
        .expect("promote");
    wait_until(SETTLE_WAIT, || learner.part.role() == Role::Follower).await;

    learner.part.stop().await;
    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_singleton_partition_commits_synchronously() {
    let router = Router::new();
    let addr: HostAddr = "127.0.0.1:9181".parse().expect("addr");
    let node = spawn_node(&router, addr, Vec::new(), test_config(addr), false);

    wait_until(ELECTION_WAIT, || node.part.is_leader()).await;
    node.part.append(b"solo".to_vec()).await.expect("append");
    assert_eq!(node.part.committed_log_id(), node.part.last_log_id());
    assert_eq!(node.sm.applied_payloads(), vec![b"solo".to_vec()]);
    node.part.stop().await;
}
