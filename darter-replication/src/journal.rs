//! Append-only change log of effectful commands.
//!
//! Entries arrive from shard hop callbacks, so within one shard they are in
//! commit order; every entry carries its shard id. The journal ends its life
//! through a lame-duck drain before the process exits.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use darter_common::error::{DarterError, DarterResult};
use darter_common::ids::{DbIndex, ShardId, TxId};

/// Default number of journal entries kept in the partial-sync backlog.
pub const DEFAULT_BACKLOG_LEN: usize = 8192;

/// Journal operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    /// Regular command payload.
    Command,
    /// Expiry-driven delete payload.
    Expired,
    /// Keepalive/ping marker.
    Ping,
}

/// One append-only journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Transaction id associated with this record.
    pub txid: TxId,
    /// Shard that committed this record.
    pub shard: ShardId,
    /// Database id associated with this record.
    pub db: DbIndex,
    /// Operation kind.
    pub op: JournalOp,
    /// Raw serialized command payload.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JournalState {
    Active,
    LameDuck,
    Closed,
}

#[derive(Debug)]
struct JournalInner {
    records: VecDeque<(u64, JournalEntry)>,
    next_lsn: u64,
    state: JournalState,
}

/// Bounded in-memory journal with monotonic LSN tracking.
#[derive(Debug)]
pub struct Journal {
    inner: Mutex<JournalInner>,
    backlog_len: usize,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    /// Creates an empty journal with the default backlog size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG_LEN)
    }

    /// Creates an empty journal with a custom backlog size.
    ///
    /// Backlog size of zero is coerced to one entry.
    #[must_use]
    pub fn with_backlog(backlog_len: usize) -> Self {
        Self {
            inner: Mutex::new(JournalInner {
                records: VecDeque::new(),
                next_lsn: 1,
                state: JournalState::Active,
            }),
            backlog_len: backlog_len.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JournalInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends one entry and returns its assigned LSN.
    ///
    /// Appends in lame-duck or after close are dropped and report `None`.
    pub fn append(&self, entry: JournalEntry) -> Option<u64> {
        let mut inner = self.lock();
        if inner.state != JournalState::Active {
            return None;
        }
        let lsn = inner.next_lsn;
        inner.next_lsn = inner.next_lsn.saturating_add(1);
        if inner.records.len() == self.backlog_len {
            let _ = inner.records.pop_front();
        }
        inner.records.push_back((lsn, entry));
        Some(lsn)
    }

    /// LSN the next appended entry will receive.
    #[must_use]
    pub fn current_lsn(&self) -> u64 {
        self.lock().next_lsn
    }

    /// Number of currently buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the backlog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Buffered entries for one shard, in commit order.
    #[must_use]
    pub fn entries_for_shard(&self, shard: ShardId) -> Vec<JournalEntry> {
        self.lock()
            .records
            .iter()
            .filter(|(_, entry)| entry.shard == shard)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Transitions the journal from active to draining.
    ///
    /// Returns `true` exactly once, on the transition; repeated calls and
    /// calls after close return `false`.
    pub fn enter_lame_duck(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == JournalState::Active {
            inner.state = JournalState::LameDuck;
            return true;
        }
        false
    }

    /// Flushes and releases the journal.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` when called before lame-duck.
    pub fn close(&self) -> DarterResult<()> {
        let mut inner = self.lock();
        match inner.state {
            JournalState::LameDuck => {
                inner.records.clear();
                inner.state = JournalState::Closed;
                Ok(())
            }
            JournalState::Closed => Ok(()),
            JournalState::Active => Err(DarterError::InvalidState(
                "journal close requires lame-duck first",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Journal, JournalEntry, JournalOp};
    use googletest::prelude::*;
    use rstest::rstest;

    fn entry(txid: u64, shard: u16, payload: &[u8]) -> JournalEntry {
        JournalEntry {
            txid,
            shard,
            db: 0,
            op: JournalOp::Command,
            payload: payload.to_vec(),
        }
    }

    #[rstest]
    fn append_assigns_monotonic_lsns() {
        let journal = Journal::new();
        assert_that!(journal.append(entry(1, 0, b"SET a 1")), eq(Some(1_u64)));
        assert_that!(journal.append(entry(2, 1, b"SET b 2")), eq(Some(2_u64)));
        assert_that!(journal.current_lsn(), eq(3_u64));
    }

    #[rstest]
    fn backlog_evicts_oldest_entries() {
        let journal = Journal::with_backlog(2);
        let _ = journal.append(entry(1, 0, b"a"));
        let _ = journal.append(entry(2, 0, b"b"));
        let _ = journal.append(entry(3, 0, b"c"));
        assert_that!(journal.len(), eq(2_usize));
    }

    #[rstest]
    fn entries_for_shard_preserve_commit_order() {
        let journal = Journal::new();
        let _ = journal.append(entry(1, 0, b"first"));
        let _ = journal.append(entry(2, 1, b"other-shard"));
        let _ = journal.append(entry(3, 0, b"second"));

        let shard_zero = journal.entries_for_shard(0);
        assert_that!(shard_zero.len(), eq(2_usize));
        assert_that!(&shard_zero[0].payload, eq(&b"first".to_vec()));
        assert_that!(&shard_zero[1].payload, eq(&b"second".to_vec()));
    }

    #[rstest]
    fn lame_duck_transition_is_idempotent_and_gates_appends() {
        let journal = Journal::new();
        let _ = journal.append(entry(1, 0, b"a"));

        assert_that!(journal.enter_lame_duck(), eq(true));
        assert_that!(journal.enter_lame_duck(), eq(false));
        assert_that!(journal.append(entry(2, 0, b"dropped")), eq(None));

        journal.close().expect("close after lame-duck must pass");
        assert_that!(journal.is_empty(), eq(true));
        assert_that!(journal.enter_lame_duck(), eq(false));
    }

    #[rstest]
    fn close_without_lame_duck_is_rejected() {
        let journal = Journal::new();
        assert_that!(journal.close().is_err(), eq(true));
    }
}
