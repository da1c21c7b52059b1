//! Keel - the replicated-log engine of a partitioned storage system.
//!
//! Keel implements Raft consensus for a single partition: one
//! [`raft::RaftPartition`] per partition replica keeps an identical,
//! linearizable sequence of opaque log entries on a durable
//! write-ahead log, replicated across its peer replicas and exposed to
//! a host-provided state machine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Host System                           │
//! │   state machine │ snapshot store │ transport │ bootstrap     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  RaftPartition: roles | election | replication | commit      │
//! ├───────────────┬──────────────────┬───────────────────────────┤
//! │  Peer Hosts   │  Append Batching │  Snapshot Coordinator     │
//! ├───────────────┴──────────────────┴───────────────────────────┤
//! │  Write-Ahead Log (RocksDB)                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The host plugs in through three seams: the [`raft::StateMachine`]
//! callback interface (apply, snapshot ingestion, leadership events),
//! the [`raft::SnapshotStore`] image reader, and the [`raft::RaftRpc`]
//! transport. Everything else — elections, the batched replication
//! pipeline, membership changes, snapshot transfer and the WAL — lives
//! in this crate.
//!
//! # Quick Start
//!
//! ```no_run
//! use keel::config::RaftConfig;
//! use keel::raft::RaftPartition;
//! # use std::sync::Arc;
//! # fn machine() -> Arc<dyn keel::raft::StateMachine> { unimplemented!() }
//! # fn snapshots() -> Arc<dyn keel::raft::SnapshotStore> { unimplemented!() }
//! # fn transport() -> Arc<dyn keel::raft::RaftRpc> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> keel::Result<()> {
//!     let config = RaftConfig::development("127.0.0.1:9780".parse().unwrap());
//!     let part = RaftPartition::new(
//!         config,
//!         std::path::Path::new("/tmp/keel/wal/1"),
//!         machine(),
//!         snapshots(),
//!         transport(),
//!     )?;
//!     part.start(vec!["127.0.0.1:9781".parse().unwrap()], false);
//!     part.append(b"put k v".to_vec()).await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod raft;
pub mod types;

pub use error::{KeelError, Result};
pub use types::*;
