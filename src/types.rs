//! Core type definitions for the Keel consensus engine.
//!
//! Keel replicates one partition of a distributed storage system. The
//! identifiers here locate a partition inside the wider deployment and
//! describe the entries that flow through its replicated log.
//!
//! # Type Aliases
//!
//! - [`LogId`] = `u64`: position in the replicated log (1-based, 0 = none)
//! - [`Term`] = `u64`: Raft election epoch
//! - [`ClusterId`] = `u64`: originating cluster of an entry
//! - [`SpaceId`] = `u32`: keyspace the partition belongs to
//! - [`PartitionId`] = `u32`: partition number inside the space
//! - [`HostAddr`]: network address of a partition replica

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

/// Position of an entry in the replicated log. 0 means "no entry".
pub type LogId = u64;

/// Raft term number.
pub type Term = u64;

/// Identifier of the cluster an entry originated from.
pub type ClusterId = u64;

/// Identifier of a keyspace.
pub type SpaceId = u32;

/// Identifier of a partition within a space.
pub type PartitionId = u32;

/// Network address of a partition replica.
pub type HostAddr = SocketAddr;

/// The kind of a replicated log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogType {
    /// A normal state-machine command.
    Normal,
    /// A leader-local computation whose emitted payload is what gets
    /// replicated (see `raft::batch`).
    AtomicOp,
    /// A membership-change command. Always replicated alone.
    Command,
    /// A heartbeat marker. Never persisted or buffered.
    KeepAlive,
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogType::Normal => write!(f, "Normal"),
            LogType::AtomicOp => write!(f, "AtomicOp"),
            LogType::Command => write!(f, "Command"),
            LogType::KeepAlive => write!(f, "KeepAlive"),
        }
    }
}

/// A single entry in the replicated log.
///
/// The payload is opaque to the consensus core. It is Arc-wrapped so
/// that fan-out to many peers clones a pointer, not the bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position of this entry in the log.
    pub log_id: LogId,
    /// Term in which the entry was appended by a leader.
    pub term: Term,
    /// Cluster the entry originated from.
    pub source: ClusterId,
    /// Entry kind.
    pub log_type: LogType,
    /// Opaque command bytes (Arc-wrapped for cheap cloning during replication).
    #[serde(with = "arc_bytes")]
    pub payload: Arc<Vec<u8>>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(
        log_id: LogId,
        term: Term,
        source: ClusterId,
        log_type: LogType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            log_id,
            term,
            source,
            log_type,
            payload: Arc::new(payload),
        }
    }

    /// Reference to the payload bytes.
    #[inline]
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Whether this is a membership-change entry.
    #[inline]
    pub fn is_command(&self) -> bool {
        self.log_type == LogType::Command
    }
}

/// Serde helper module for `Arc<Vec<u8>>` payloads.
/// Serializes as raw bytes, deserializes into an Arc-wrapped Vec.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_roundtrip() {
        let entry = LogEntry::new(7, 2, 1, LogType::Normal, b"put k v".to_vec());
        let bytes = bincode::serialize(&entry).unwrap();
        let back: LogEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.log_id, 7);
        assert_eq!(back.term, 2);
        assert_eq!(back.log_type, LogType::Normal);
        assert_eq!(back.payload_bytes(), b"put k v");
    }

    #[test]
    fn test_payload_clone_is_shallow() {
        let entry = LogEntry::new(1, 1, 0, LogType::Normal, vec![0u8; 1024]);
        let copy = entry.clone();
        assert!(Arc::ptr_eq(&entry.payload, &copy.payload));
    }
}
