//! Configuration for a Keel partition.
//!
//! All tunables are carried by an immutable [`RaftConfig`] value handed
//! to the partition at construction. Nothing is read from process-wide
//! state after start.

use crate::error::{KeelError, Result};
use crate::types::{ClusterId, HostAddr, PartitionId, SpaceId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for one partition replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Cluster this replica belongs to.
    pub cluster_id: ClusterId,
    /// Keyspace of the partition.
    pub space_id: SpaceId,
    /// Partition number inside the space.
    pub part_id: PartitionId,
    /// Address this replica answers on.
    pub local_addr: HostAddr,
    /// Interval between leader heartbeats. Election timeouts and the
    /// leader lease derive from this value.
    pub heartbeat_interval: Duration,
    /// A snapshot transfer making no progress for this long is aborted
    /// on the receiving side.
    pub snapshot_timeout: Duration,
    /// Maximum number of buffered submissions per replication flight.
    pub max_batch_size: usize,
    /// Maximum number of snapshot rows packed into one transfer frame.
    pub snapshot_rows_per_frame: usize,
    /// Reject a higher-term leader while the current one is still
    /// heartbeating. Diverges from textbook Raft; keeps a cluster from
    /// thrashing when a partitioned node comes back with a bumped term.
    pub leader_stickiness: bool,
    /// Periodically replicate an empty entry so the leader lease stays
    /// fresh even on an idle partition.
    pub enable_sync_with_follower: bool,
    /// Interval for the sync-with-follower tick.
    pub sync_with_follower_interval: Duration,
    /// Durability policy for the write-ahead log.
    pub wal: WalPolicy,
}

/// Durability policy for the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalPolicy {
    /// Entries older than this may be dropped by background compaction.
    pub ttl: Duration,
    /// Target on-disk file size for the log store.
    pub file_size: u64,
    /// Write buffer size before entries are flushed to disk.
    pub buffer_size: usize,
    /// Number of write buffers kept in memory.
    pub buffer_count: usize,
    /// Whether every write is fsync'd before being acknowledged.
    pub fsync: bool,
}

impl Default for WalPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(14_400),
            file_size: 16 * 1024 * 1024,
            buffer_size: 8 * 1024 * 1024,
            buffer_count: 2,
            fsync: false,
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            cluster_id: 0,
            space_id: 0,
            part_id: 0,
            local_addr: "127.0.0.1:9780".parse().expect("valid socket address"),
            heartbeat_interval: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(300),
            max_batch_size: 256,
            snapshot_rows_per_frame: 128,
            leader_stickiness: true,
            enable_sync_with_follower: false,
            sync_with_follower_interval: Duration::from_millis(60_000),
            wal: WalPolicy::default(),
        }
    }
}

impl RaftConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KeelError::Config(format!("failed to read config file: {}", e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| KeelError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(KeelError::Config(
                "heartbeat_interval must be non-zero".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(KeelError::Config(
                "max_batch_size must be non-zero".to_string(),
            ));
        }
        if self.snapshot_rows_per_frame == 0 {
            return Err(KeelError::Config(
                "snapshot_rows_per_frame must be non-zero".to_string(),
            ));
        }
        if self.wal.buffer_count == 0 {
            return Err(KeelError::Config(
                "wal.buffer_count must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Fast timers for local clusters and tests.
    pub fn development(local_addr: HostAddr) -> Self {
        Self {
            local_addr,
            heartbeat_interval: Duration::from_millis(200),
            snapshot_timeout: Duration::from_secs(5),
            sync_with_follower_interval: Duration::from_millis(500),
            ..Default::default()
        }
    }
}
