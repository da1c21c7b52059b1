//! Mutable directory of a partition's peers.
//!
//! Holds one [`Host`] stub per remote replica, under a reader-writer
//! lock. Reads take a copy-on-read snapshot so replication fan-out and
//! ballots never hold the directory lock across I/O.

use crate::types::HostAddr;
use parking_lot::RwLock;
use std::sync::Arc;

use super::host::Host;

/// The mutable set of peers, each as voter or learner.
#[derive(Default)]
pub struct PeerDirectory {
    hosts: RwLock<Vec<Arc<Host>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a host if its address is not present. Returns false when
    /// the address already exists (the existing record is kept).
    pub fn add(&self, host: Arc<Host>) -> bool {
        let mut hosts = self.hosts.write();
        if hosts.iter().any(|h| h.address() == host.address()) {
            return false;
        }
        hosts.push(host);
        true
    }

    /// Remove the host with the given address, returning it so the
    /// caller can drain it.
    pub fn remove(&self, addr: HostAddr) -> Option<Arc<Host>> {
        let mut hosts = self.hosts.write();
        let pos = hosts.iter().position(|h| h.address() == addr)?;
        Some(hosts.remove(pos))
    }

    pub fn find(&self, addr: HostAddr) -> Option<Arc<Host>> {
        self.hosts
            .read()
            .iter()
            .find(|h| h.address() == addr)
            .cloned()
    }

    pub fn contains(&self, addr: HostAddr) -> bool {
        self.find(addr).is_some()
    }

    /// Copy-on-read snapshot of every peer, learners included. Log
    /// fan-out and keep-alives go to all of them.
    pub fn all(&self) -> Vec<Arc<Host>> {
        self.hosts.read().clone()
    }

    /// Snapshot of quorum-eligible peers only. Ballots go here.
    pub fn voters(&self) -> Vec<Arc<Host>> {
        self.hosts
            .read()
            .iter()
            .filter(|h| !h.is_learner())
            .cloned()
            .collect()
    }

    /// Number of remote voters.
    pub fn voter_count(&self) -> usize {
        self.hosts.read().iter().filter(|h| !h.is_learner()).count()
    }

    /// Remote acknowledgements needed for a majority of the replica
    /// group (the local replica's implicit vote included).
    pub fn required_acks(&self) -> usize {
        (self.voter_count() + 1) / 2
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }
}
