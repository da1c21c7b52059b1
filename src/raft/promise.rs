//! Future sinks for client submissions.
//!
//! Submitters of normal entries share one future per replication run;
//! atomic ops get an individual future; a membership command caps the
//! current shared batch so everything behind it resolves separately.
//! The partition keeps two [`PromiseSet`]s — one accumulating new
//! submissions, one owned by the in-flight replication — and swaps
//! them when a flight starts.

use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Grouped oneshot senders resolved when a replication run completes.
pub struct PromiseSet<T> {
    /// Shared batches, oldest first. The back batch is open for new
    /// normal submitters; older batches were sealed by a command.
    shared: VecDeque<Vec<oneshot::Sender<T>>>,
    /// Per-op futures for atomic submissions, in submission order.
    singles: VecDeque<oneshot::Sender<T>>,
}

impl<T: Clone> PromiseSet<T> {
    pub fn new() -> Self {
        Self {
            shared: VecDeque::new(),
            singles: VecDeque::new(),
        }
    }

    /// Future resolved together with every other normal submitter of
    /// the same run.
    pub fn shared_future(&mut self) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        if self.shared.is_empty() {
            self.shared.push_back(Vec::new());
        }
        if let Some(batch) = self.shared.back_mut() {
            batch.push(tx);
        }
        rx
    }

    /// Join the current shared batch and seal it, so later submitters
    /// resolve with the next run. Used for command entries.
    pub fn roll_shared_future(&mut self) -> oneshot::Receiver<T> {
        let rx = self.shared_future();
        self.shared.push_back(Vec::new());
        rx
    }

    /// Individual future for an atomic op submission.
    pub fn single_future(&mut self) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.singles.push_back(tx);
        rx
    }

    /// Resolve the oldest shared batch.
    pub fn set_one_shared_value(&mut self, value: T) {
        if let Some(batch) = self.shared.pop_front() {
            for tx in batch {
                let _ = tx.send(value.clone());
            }
        }
    }

    /// Resolve the oldest single future.
    pub fn set_one_single_value(&mut self, value: T) {
        if let Some(tx) = self.singles.pop_front() {
            let _ = tx.send(value);
        }
    }

    /// Resolve everything that is still pending.
    pub fn set_value(&mut self, value: T) {
        for batch in self.shared.drain(..) {
            for tx in batch {
                let _ = tx.send(value.clone());
            }
        }
        for tx in self.singles.drain(..) {
            let _ = tx.send(value.clone());
        }
    }

    /// Move the accumulated futures out, leaving this set empty.
    pub fn take(&mut self) -> PromiseSet<T> {
        PromiseSet {
            shared: std::mem::take(&mut self.shared),
            singles: std::mem::take(&mut self.singles),
        }
    }
}

impl<T: Clone> Default for PromiseSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
