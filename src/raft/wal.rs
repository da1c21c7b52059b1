//! Write-ahead log adapter for a partition.
//!
//! The WAL is the sole durable state owned by the consensus core. It
//! persists entries through RocksDB (one database per partition) and
//! mirrors the retained tail in memory so that replication and commit
//! can iterate without touching disk.
//!
//! Appends are contiguous: a batch whose first id is not exactly
//! `last_log_id + 1` is rejected. Rollback and reset support the
//! follower-side repair paths.

use crate::config::WalPolicy;
use crate::error::{KeelError, Result};
use crate::types::{LogEntry, LogId, Term};
use parking_lot::Mutex;
use rocksdb::{Options, WriteBatch, WriteOptions, DB};
use std::collections::VecDeque;
use std::path::Path;

use super::batch::AppendBatch;

const LOG_PREFIX: &[u8] = b"wal_log_";

/// In-memory mirror of the retained log tail.
#[derive(Debug)]
struct WalState {
    entries: VecDeque<LogEntry>,
    /// Id of the oldest retained entry; `last_log_id + 1` when empty.
    first_log_id: LogId,
    last_log_id: LogId,
    last_log_term: Term,
}

impl WalState {
    fn empty() -> Self {
        Self {
            entries: VecDeque::new(),
            first_log_id: 1,
            last_log_id: 0,
            last_log_term: 0,
        }
    }
}

/// Durable write-ahead log for one partition.
pub struct Wal {
    db: DB,
    write_opts: WriteOptions,
    state: Mutex<WalState>,
}

impl Wal {
    /// Open or create the WAL at `path`.
    ///
    /// Every recovered entry is passed through `pre_process` before the
    /// partition starts, so the host can react to persisted membership
    /// changes. A rejected entry aborts recovery.
    pub fn open<F>(path: &Path, policy: &WalPolicy, mut pre_process: F) -> Result<Self>
    where
        F: FnMut(&LogEntry) -> bool,
    {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_write_buffer_size(policy.buffer_size);
        opts.set_max_write_buffer_number(policy.buffer_count as i32);
        opts.set_target_file_size_base(policy.file_size);

        let db = DB::open_with_ttl(&opts, path, policy.ttl)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(policy.fsync);

        let mut state = WalState::empty();
        let iter = db.iterator(rocksdb::IteratorMode::From(
            LOG_PREFIX,
            rocksdb::Direction::Forward,
        ));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            let entry: LogEntry = bincode::deserialize(&value)?;
            if !pre_process(&entry) {
                return Err(KeelError::WalFailure(format!(
                    "pre-process rejected recovered entry {}",
                    entry.log_id
                )));
            }
            if state.entries.is_empty() {
                state.first_log_id = entry.log_id;
            }
            state.last_log_id = entry.log_id;
            state.last_log_term = entry.term;
            state.entries.push_back(entry);
        }

        Ok(Self {
            db,
            write_opts,
            state: Mutex::new(state),
        })
    }

    /// Id of the last appended entry (0 when the log is empty).
    pub fn last_log_id(&self) -> LogId {
        self.state.lock().last_log_id
    }

    /// Term of the last appended entry.
    pub fn last_log_term(&self) -> Term {
        self.state.lock().last_log_term
    }

    /// Id of the oldest retained entry; `last_log_id + 1` when empty.
    pub fn first_log_id(&self) -> LogId {
        self.state.lock().first_log_id
    }

    /// Term of the entry at `log_id`. Id 0 answers term 0.
    pub fn term_at(&self, log_id: LogId) -> Option<Term> {
        if log_id == 0 {
            return Some(0);
        }
        let state = self.state.lock();
        if log_id < state.first_log_id || log_id > state.last_log_id {
            return None;
        }
        let offset = (log_id - state.first_log_id) as usize;
        state.entries.get(offset).map(|e| e.term)
    }

    /// Atomically append a contiguous batch of entries.
    pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.append_locked(&mut state, entries)
    }

    /// Drain a client submission batch into the log. Consumes the
    /// batch's current run (up to its next invalid point) and returns
    /// the new last log id.
    pub fn append_batch(&self, batch: &mut AppendBatch) -> Result<LogId> {
        let mut entries = Vec::new();
        while batch.valid() {
            entries.push(batch.current_entry());
            batch.advance();
        }
        let mut state = self.state.lock();
        self.append_locked(&mut state, &entries)?;
        Ok(state.last_log_id)
    }

    fn append_locked(&self, state: &mut WalState, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // An empty log (fresh, or reset after a snapshot) accepts any
        // starting id; otherwise the batch must continue the tail.
        if state.last_log_id != 0 && entries[0].log_id != state.last_log_id + 1 {
            return Err(KeelError::WalFailure(format!(
                "non-contiguous append: expected first id {}, got {}",
                state.last_log_id + 1,
                entries[0].log_id
            )));
        }
        let mut wb = WriteBatch::default();
        for entry in entries {
            wb.put(log_key(entry.log_id), bincode::serialize(entry)?);
        }
        self.db.write_opt(wb, &self.write_opts)?;

        for entry in entries {
            if state.entries.is_empty() {
                state.first_log_id = entry.log_id;
            }
            state.last_log_id = entry.log_id;
            state.last_log_term = entry.term;
            state.entries.push_back(entry.clone());
        }
        Ok(())
    }

    /// Inclusive range `[from, to]`, clamped to the retained window.
    pub fn entries_range(&self, from: LogId, to: LogId) -> Vec<LogEntry> {
        let state = self.state.lock();
        if state.entries.is_empty() || to < state.first_log_id {
            return Vec::new();
        }
        let start = from.max(state.first_log_id);
        let end = to.min(state.last_log_id);
        if start > end {
            return Vec::new();
        }
        let offset = (start - state.first_log_id) as usize;
        let len = (end - start + 1) as usize;
        state.entries.iter().skip(offset).take(len).cloned().collect()
    }

    /// Truncate the log so that `log_id` is the last retained entry.
    pub fn rollback_to(&self, log_id: LogId) -> Result<()> {
        let mut state = self.state.lock();
        if log_id >= state.last_log_id {
            return Ok(());
        }
        let mut wb = WriteBatch::default();
        for id in (log_id + 1)..=state.last_log_id {
            wb.delete(log_key(id));
        }
        self.db.write_opt(wb, &self.write_opts)?;

        if log_id < state.first_log_id {
            state.entries.clear();
            state.first_log_id = log_id + 1;
        } else {
            let keep = (log_id - state.first_log_id + 1) as usize;
            state.entries.truncate(keep);
        }
        state.last_log_id = log_id;
        state.last_log_term = state.entries.back().map(|e| e.term).unwrap_or(0);
        Ok(())
    }

    /// Discard every entry. Used after a snapshot install or when a
    /// diverged follower is rebuilt from scratch.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut wb = WriteBatch::default();
        for id in state.first_log_id..=state.last_log_id {
            wb.delete(log_key(id));
        }
        self.db.write_opt(wb, &self.write_opts)?;
        *state = WalState::empty();
        Ok(())
    }
}

fn log_key(log_id: LogId) -> Vec<u8> {
    let mut key = LOG_PREFIX.to_vec();
    key.extend_from_slice(&log_id.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogType;
    use tempfile::tempdir;

    fn entry(log_id: LogId, term: Term, data: &[u8]) -> LogEntry {
        LogEntry::new(log_id, term, 0, LogType::Normal, data.to_vec())
    }

    fn open(path: &Path) -> Wal {
        Wal::open(path, &WalPolicy::default(), |_| true).unwrap()
    }

    #[test]
    fn test_empty_wal() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path());
        assert_eq!(wal.last_log_id(), 0);
        assert_eq!(wal.last_log_term(), 0);
        assert_eq!(wal.first_log_id(), 1);
    }

    #[test]
    fn test_append_and_range() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path());

        wal.append(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 2, b"c")])
            .unwrap();
        assert_eq!(wal.last_log_id(), 3);
        assert_eq!(wal.last_log_term(), 2);

        let range = wal.entries_range(2, 3);
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].payload_bytes(), b"b");
        assert_eq!(range[1].payload_bytes(), b"c");

        // Clamped at both ends.
        assert_eq!(wal.entries_range(0, 100).len(), 3);
        assert!(wal.entries_range(4, 5).is_empty());
    }

    #[test]
    fn test_rejects_non_contiguous() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path());
        wal.append(&[entry(1, 1, b"a")]).unwrap();
        assert!(wal.append(&[entry(3, 1, b"c")]).is_err());
    }

    #[test]
    fn test_rollback() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path());
        wal.append(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 2, b"c")])
            .unwrap();

        wal.rollback_to(1).unwrap();
        assert_eq!(wal.last_log_id(), 1);
        assert_eq!(wal.last_log_term(), 1);
        assert!(wal.entries_range(2, 3).is_empty());

        // Appending after rollback continues from the new tail.
        wal.append(&[entry(2, 3, b"d")]).unwrap();
        assert_eq!(wal.last_log_term(), 3);
    }

    #[test]
    fn test_reset() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path());
        wal.append(&[entry(1, 1, b"a")]).unwrap();
        wal.reset().unwrap();
        assert_eq!(wal.last_log_id(), 0);
        assert_eq!(wal.first_log_id(), 1);
    }

    #[test]
    fn test_append_after_reset_accepts_any_start() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path());
        wal.append(&[entry(1, 1, b"a"), entry(2, 1, b"b")]).unwrap();
        wal.reset().unwrap();

        // A follower rebuilt from a snapshot continues at the commit
        // point, not at id 1.
        wal.append(&[entry(42, 3, b"later")]).unwrap();
        assert_eq!(wal.first_log_id(), 42);
        assert_eq!(wal.last_log_id(), 42);
        assert_eq!(wal.last_log_term(), 3);
    }

    #[test]
    fn test_recovery_runs_pre_process() {
        let dir = tempdir().unwrap();
        {
            let wal = open(dir.path());
            wal.append(&[entry(1, 1, b"a"), entry(2, 1, b"b")]).unwrap();
        }
        let mut seen = Vec::new();
        let wal = Wal::open(dir.path(), &WalPolicy::default(), |e| {
            seen.push(e.log_id);
            true
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(wal.last_log_id(), 2);
        assert_eq!(wal.entries_range(1, 2).len(), 2);
    }

    #[test]
    fn test_recovery_rejected_entry_fails() {
        let dir = tempdir().unwrap();
        {
            let wal = open(dir.path());
            wal.append(&[entry(1, 1, b"a")]).unwrap();
        }
        let result = Wal::open(dir.path(), &WalPolicy::default(), |_| false);
        assert!(result.is_err());
    }

    #[test]
    fn test_term_at() {
        let dir = tempdir().unwrap();
        let wal = open(dir.path());
        wal.append(&[entry(1, 1, b"a"), entry(2, 2, b"b")]).unwrap();
        assert_eq!(wal.term_at(0), Some(0));
        assert_eq!(wal.term_at(1), Some(1));
        assert_eq!(wal.term_at(2), Some(2));
        assert_eq!(wal.term_at(3), None);
    }
}
