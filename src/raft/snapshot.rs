//! Leader-side snapshot streaming.
//!
//! When a peer has fallen behind the WAL's retained window, its host
//! stub hands it to the [`SnapshotCoordinator`], which streams the
//! host-provided state image as a sequence of row frames. The receiving
//! side of a transfer lives in the partition's
//! `process_send_snapshot_request`.

use crate::config::RaftConfig;
use crate::error::{KeelError, Result};
use crate::types::Term;
use std::sync::Arc;
use tracing::{info, warn};

use super::host::Host;
use super::rpc::{AppendLogRequest, ErrorCode, RaftRpc, SendSnapshotRequest};
use super::SnapshotStore;

/// Drives bulk state transfer to lagging or new peers.
pub struct SnapshotCoordinator {
    config: Arc<RaftConfig>,
    rpc: Arc<dyn RaftRpc>,
    store: Arc<dyn SnapshotStore>,
}

impl SnapshotCoordinator {
    pub fn new(
        config: Arc<RaftConfig>,
        rpc: Arc<dyn RaftRpc>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self { config, rpc, store }
    }

    /// Start a transfer to `host` on the runtime. The host's
    /// `sending_snapshot` flag must already be set; it is cleared when
    /// the transfer ends either way.
    pub fn spawn_send(self: &Arc<Self>, host: Arc<Host>, term: Term) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = coordinator.send_to(&host, term).await {
                warn!(peer = %host.address(), error = %e, "snapshot transfer failed");
                host.abort_snapshot();
            }
        });
    }

    async fn send_to(&self, host: &Arc<Host>, term: Term) -> Result<()> {
        let peer = host.address();
        info!(
            space = self.config.space_id,
            part = self.config.part_id,
            peer = %peer,
            term,
            "starting snapshot transfer"
        );

        // Tell the peer to reset and wait for the stream before any
        // rows go out.
        let notice = AppendLogRequest {
            space: self.config.space_id,
            part: self.config.part_id,
            leader: self.config.local_addr,
            current_term: term,
            last_log_id: 0,
            committed_log_id: 0,
            prev_log_id: 0,
            prev_log_term: 0,
            log_term: term,
            entries: Vec::new(),
            sending_snapshot: true,
            keep_alive: false,
        };
        let response = self.rpc.append_log(peer, notice).await?;
        match response.error_code {
            ErrorCode::WaitingSnapshot | ErrorCode::Succeeded => {}
            code => {
                return Err(KeelError::PersistSnapshotFailed(format!(
                    "peer rejected snapshot notice: {:?}",
                    code
                )));
            }
        }

        let scan = self.store.read_snapshot()?;
        let mut total_count: u64 = 0;
        let mut total_size: u64 = 0;
        let mut frames = scan
            .rows
            .chunks(self.config.snapshot_rows_per_frame)
            .map(|c| c.to_vec())
            .collect::<Vec<_>>();
        if frames.is_empty() {
            // An empty image still needs a terminating frame.
            frames.push(Vec::new());
        }
        let last = frames.len() - 1;

        for (i, rows) in frames.into_iter().enumerate() {
            total_count += rows.len() as u64;
            total_size += rows.iter().map(|r| r.len() as u64).sum::<u64>();
            let request = SendSnapshotRequest {
                space: self.config.space_id,
                part: self.config.part_id,
                leader: self.config.local_addr,
                term,
                rows,
                committed_log_id: scan.committed_log_id,
                committed_log_term: scan.committed_log_term,
                total_count,
                total_size,
                done: i == last,
            };
            let response = self.rpc.send_snapshot(peer, request).await?;
            if !response.error_code.is_success() {
                return Err(KeelError::PersistSnapshotFailed(format!(
                    "peer answered {:?} at frame {}",
                    response.error_code, i
                )));
            }
        }

        host.finish_snapshot(scan.committed_log_id);
        info!(
            space = self.config.space_id,
            part = self.config.part_id,
            peer = %peer,
            rows = total_count,
            bytes = total_size,
            committed_log_id = scan.committed_log_id,
            "snapshot transfer finished"
        );
        Ok(())
    }
}
