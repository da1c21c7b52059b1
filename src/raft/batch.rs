//! Client submission batching for the leader's replication pipeline.
//!
//! [`AppendBatch`] is a lazy, restartable cursor over one swap of the
//! submission buffer. It resolves atomic operations into the payloads
//! that actually get replicated and enforces the batching rules:
//!
//! - a run led by an atomic op contains only that op's resolved entry
//!   until the next non-atomic entry types take over;
//! - a membership `Command` entry is always the last entry of its run,
//!   so it replicates alone or at the tail of a batch with nothing
//!   after it;
//! - a failed atomic op is dropped without consuming a log id.

use crate::types::{ClusterId, LogEntry, LogId, LogType, Term};

/// A leader-local computation whose output becomes the replicated
/// payload. Returning `None` means the operation failed and nothing is
/// appended for it.
pub type AtomicOp = Box<dyn FnOnce() -> Option<Vec<u8>> + Send + 'static>;

/// Resolves atomic ops as the batch encounters them. The pipeline uses
/// this hook to fail the submitter's future when an op returns `None`.
pub type AtomicOpResolver = Box<dyn FnMut(AtomicOp) -> Option<Vec<u8>> + Send + 'static>;

/// One client submission waiting in the buffer.
pub struct Submission {
    pub source: ClusterId,
    pub log_type: LogType,
    pub payload: Vec<u8>,
    pub op: Option<AtomicOp>,
}

/// A restartable cursor over a swapped-out submission buffer.
///
/// The cursor is `valid` while it points at an entry belonging to the
/// current run. It goes invalid at the next atomic op after normal
/// entries, after yielding a `Command` entry, or at the end of the
/// buffer; [`resume`](Self::resume) starts the next run.
pub struct AppendBatch {
    idx: usize,
    lead_by_atomic_op: bool,
    has_non_atomic_logs: bool,
    valid: bool,
    last_log_type: LogType,
    curr_log_type: LogType,
    op_result: Option<Vec<u8>>,
    first_log_id: LogId,
    term: Term,
    log_id: LogId,
    logs: Vec<Submission>,
    resolver: AtomicOpResolver,
}

impl AppendBatch {
    pub fn new(
        first_log_id: LogId,
        term: Term,
        logs: Vec<Submission>,
        resolver: AtomicOpResolver,
    ) -> Self {
        let mut batch = Self {
            idx: 0,
            lead_by_atomic_op: false,
            has_non_atomic_logs: false,
            valid: false,
            last_log_type: LogType::Normal,
            curr_log_type: LogType::Normal,
            op_result: None,
            first_log_id,
            term,
            log_id: first_log_id,
            logs,
            resolver,
        };
        batch.start_run();
        batch
    }

    fn start_run(&mut self) {
        self.lead_by_atomic_op = self.process_atomic_ops();
        self.valid = self.idx < self.logs.len();
        self.has_non_atomic_logs = !self.lead_by_atomic_op && self.valid;
        if self.valid {
            self.curr_log_type = self.logs[self.idx].log_type;
            self.last_log_type = self.curr_log_type;
        }
    }

    /// Drain leading atomic ops. Returns true when one of them
    /// resolved successfully and now leads the run; failed ops are
    /// skipped without consuming a log id.
    fn process_atomic_ops(&mut self) -> bool {
        while self.idx < self.logs.len() {
            if self.logs[self.idx].log_type != LogType::AtomicOp {
                return false;
            }
            // A submission typed AtomicOp always carries an op; a bare
            // one is treated as failed.
            self.op_result = match self.logs[self.idx].op.take() {
                Some(op) => (self.resolver)(op),
                None => None,
            };
            if self.op_result.is_some() {
                return true;
            }
            self.idx += 1;
        }
        false
    }

    /// Whether the cursor points at an entry of the current run.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Whether the current run is led by a resolved atomic op.
    pub fn lead_by_atomic_op(&self) -> bool {
        self.lead_by_atomic_op
    }

    /// Whether the current run yielded any non-atomic entries.
    pub fn has_non_atomic_logs(&self) -> bool {
        self.has_non_atomic_logs
    }

    /// True when no submissions are left to process.
    pub fn is_exhausted(&self) -> bool {
        self.idx >= self.logs.len()
    }

    pub fn first_log_id(&self) -> LogId {
        self.first_log_id
    }

    /// Log id the cursor currently points at.
    pub fn log_id(&self) -> LogId {
        debug_assert!(self.valid);
        self.log_id
    }

    /// Materialize the entry at the cursor. For an atomic op this
    /// carries the resolver's output, not the submitted bytes.
    pub fn current_entry(&mut self) -> LogEntry {
        debug_assert!(self.valid);
        let payload = if self.curr_log_type == LogType::AtomicOp {
            self.op_result.take().unwrap_or_default()
        } else {
            std::mem::take(&mut self.logs[self.idx].payload)
        };
        LogEntry::new(
            self.log_id,
            self.term,
            self.logs[self.idx].source,
            self.curr_log_type,
            payload,
        )
    }

    /// Step to the next submission, consuming a log id.
    pub fn advance(&mut self) {
        self.idx += 1;
        self.log_id += 1;
        if self.idx < self.logs.len() {
            self.curr_log_type = self.logs[self.idx].log_type;
            self.valid = self.curr_log_type != LogType::AtomicOp;
            if self.valid {
                self.has_non_atomic_logs = true;
            }
            self.valid = self.valid && self.last_log_type != LogType::Command;
            self.last_log_type = self.curr_log_type;
        } else {
            self.valid = false;
        }
    }

    /// Start the next run after the cursor went invalid.
    pub fn resume(&mut self) {
        debug_assert!(!self.valid);
        if !self.is_exhausted() {
            self.start_run();
        }
    }
}
