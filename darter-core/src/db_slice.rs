//! Per-shard keyspace: logical databases mapping keys to string entries.
//!
//! A `DbSlice` is owned by exactly one shard and is only ever touched from
//! that shard's reactor thread; it therefore carries no interior locking.

use hashbrown::HashMap;

use darter_common::ids::{DB_ALL, DEFAULT_DB_COUNT, DbIndex};

/// One stored value with optional expiry deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceEntry {
    /// Raw value payload.
    pub value: Vec<u8>,
    /// Absolute expiry deadline in unix milliseconds.
    pub expire_at_ms: Option<u64>,
}

/// Point-in-time statistics for one logical database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbTableStats {
    /// Number of live keys.
    pub key_count: u64,
    /// Number of keys carrying an expiry deadline.
    pub expire_count: u64,
    /// Approximate heap bytes held by keys and values.
    pub obj_memory_usage: u64,
}

impl DbTableStats {
    /// Accumulates another database's statistics into this one.
    pub fn merge(&mut self, other: &Self) {
        self.key_count += other.key_count;
        self.expire_count += other.expire_count;
        self.obj_memory_usage += other.obj_memory_usage;
    }
}

/// Monotonic event counters maintained by the slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceEvents {
    /// Keys removed because their deadline passed.
    pub expired_keys: u64,
}

/// One record captured from or imported into a slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceRecord {
    /// Logical database index.
    pub db: DbIndex,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes.
    pub value: Vec<u8>,
    /// Absolute expiry deadline in unix milliseconds.
    pub expire_at_ms: Option<u64>,
}

/// The key/value store backing one shard.
#[derive(Debug)]
pub struct DbSlice {
    tables: Vec<HashMap<Vec<u8>, SliceEntry>>,
    events: SliceEvents,
}

impl Default for DbSlice {
    fn default() -> Self {
        Self::new(DEFAULT_DB_COUNT)
    }
}

impl DbSlice {
    /// Creates a slice with `db_count` empty logical databases.
    #[must_use]
    pub fn new(db_count: DbIndex) -> Self {
        let db_count = db_count.max(1);
        Self {
            tables: (0..db_count).map(|_| HashMap::new()).collect(),
            events: SliceEvents::default(),
        }
    }

    fn table(&self, db: DbIndex) -> Option<&HashMap<Vec<u8>, SliceEntry>> {
        self.tables.get(usize::from(db))
    }

    fn table_mut(&mut self, db: DbIndex) -> Option<&mut HashMap<Vec<u8>, SliceEntry>> {
        self.tables.get_mut(usize::from(db))
    }

    /// Returns one entry, expiring it lazily when its deadline passed.
    pub fn get(&mut self, db: DbIndex, key: &[u8], now_ms: u64) -> Option<&SliceEntry> {
        if self.expire_if_due(db, key, now_ms) {
            return None;
        }
        self.table(db)?.get(key)
    }

    /// Inserts or replaces one entry.
    pub fn set(&mut self, db: DbIndex, key: Vec<u8>, entry: SliceEntry) {
        if let Some(table) = self.table_mut(db) {
            let _ = table.insert(key, entry);
        }
    }

    /// Removes one entry, returning whether it existed.
    pub fn remove(&mut self, db: DbIndex, key: &[u8], now_ms: u64) -> bool {
        if self.expire_if_due(db, key, now_ms) {
            return false;
        }
        self.table_mut(db)
            .is_some_and(|table| table.remove(key).is_some())
    }

    /// Mutable access to one live entry for in-place updates.
    pub fn get_mut(&mut self, db: DbIndex, key: &[u8], now_ms: u64) -> Option<&mut SliceEntry> {
        if self.expire_if_due(db, key, now_ms) {
            return None;
        }
        self.table_mut(db)?.get_mut(key)
    }

    /// Number of live keys in one logical database.
    #[must_use]
    pub fn db_size(&self, db: DbIndex) -> u64 {
        self.table(db)
            .map_or(0, |table| u64::try_from(table.len()).unwrap_or(u64::MAX))
    }

    /// Clears one logical database, or every database for `DB_ALL`.
    pub fn flush_db(&mut self, db: DbIndex) {
        if db == DB_ALL {
            for table in &mut self.tables {
                table.clear();
            }
            return;
        }
        if let Some(table) = self.table_mut(db) {
            table.clear();
        }
    }

    /// Per-database statistics, indexed by `DbIndex`.
    #[must_use]
    pub fn stats(&self) -> Vec<DbTableStats> {
        self.tables
            .iter()
            .map(|table| {
                let mut stats = DbTableStats {
                    key_count: u64::try_from(table.len()).unwrap_or(u64::MAX),
                    ..DbTableStats::default()
                };
                for (key, entry) in table {
                    if entry.expire_at_ms.is_some() {
                        stats.expire_count += 1;
                    }
                    stats.obj_memory_usage +=
                        u64::try_from(key.len() + entry.value.len()).unwrap_or(0);
                }
                stats
            })
            .collect()
    }

    /// Event counters accumulated since startup.
    #[must_use]
    pub fn events(&self) -> SliceEvents {
        self.events
    }

    /// Approximate heap bytes held by this slice.
    #[must_use]
    pub fn used_memory(&self) -> u64 {
        self.stats()
            .iter()
            .map(|stats| stats.obj_memory_usage)
            .sum()
    }

    /// Captures every live entry across all logical databases.
    ///
    /// Entries already past their deadline at `now_ms` are skipped so a
    /// snapshot never resurrects expired keys.
    #[must_use]
    pub fn capture_records(&self, now_ms: u64) -> Vec<SliceRecord> {
        let mut records = Vec::new();
        for (db_index, table) in self.tables.iter().enumerate() {
            let db = DbIndex::try_from(db_index).unwrap_or(DbIndex::MAX);
            for (key, entry) in table {
                if entry.expire_at_ms.is_some_and(|deadline| deadline <= now_ms) {
                    continue;
                }
                records.push(SliceRecord {
                    db,
                    key: key.clone(),
                    value: entry.value.clone(),
                    expire_at_ms: entry.expire_at_ms,
                });
            }
        }
        records
    }

    /// Imports one record, replacing any existing entry for the key.
    pub fn import_record(&mut self, record: SliceRecord) {
        self.set(
            record.db,
            record.key,
            SliceEntry {
                value: record.value,
                expire_at_ms: record.expire_at_ms,
            },
        );
    }

    /// Scans up to `budget` keys per logical database and drops due entries.
    ///
    /// Returns the number of keys expired by this pass.
    pub fn active_expire_pass(&mut self, now_ms: u64, budget: usize) -> u64 {
        let mut expired = 0_u64;
        for table in &mut self.tables {
            let due_keys = table
                .iter()
                .take(budget)
                .filter(|(_, entry)| entry.expire_at_ms.is_some_and(|deadline| deadline <= now_ms))
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            for key in due_keys {
                let _ = table.remove(&key);
                expired += 1;
            }
        }
        self.events.expired_keys += expired;
        expired
    }

    fn expire_if_due(&mut self, db: DbIndex, key: &[u8], now_ms: u64) -> bool {
        let due = self
            .table(db)
            .and_then(|table| table.get(key))
            .and_then(|entry| entry.expire_at_ms)
            .is_some_and(|deadline| deadline <= now_ms);
        if due {
            if let Some(table) = self.table_mut(db) {
                let _ = table.remove(key);
            }
            self.events.expired_keys += 1;
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::{DbSlice, SliceEntry};
    use darter_common::ids::DB_ALL;
    use googletest::prelude::*;
    use rstest::rstest;

    fn entry(value: &[u8], expire_at_ms: Option<u64>) -> SliceEntry {
        SliceEntry {
            value: value.to_vec(),
            expire_at_ms,
        }
    }

    #[rstest]
    fn get_expires_entries_lazily() {
        let mut slice = DbSlice::default();
        slice.set(0, b"k".to_vec(), entry(b"v", Some(1_000)));

        assert_that!(slice.get(0, b"k", 999).is_some(), eq(true));
        assert_that!(slice.get(0, b"k", 1_000).is_none(), eq(true));
        assert_that!(slice.db_size(0), eq(0_u64));
        assert_that!(slice.events().expired_keys, eq(1_u64));
    }

    #[rstest]
    fn flush_all_clears_every_logical_database() {
        let mut slice = DbSlice::default();
        slice.set(0, b"a".to_vec(), entry(b"1", None));
        slice.set(3, b"b".to_vec(), entry(b"2", None));

        slice.flush_db(DB_ALL);
        assert_that!(slice.db_size(0), eq(0_u64));
        assert_that!(slice.db_size(3), eq(0_u64));
    }

    #[rstest]
    fn capture_skips_entries_past_deadline() {
        let mut slice = DbSlice::default();
        slice.set(0, b"live".to_vec(), entry(b"1", None));
        slice.set(1, b"dead".to_vec(), entry(b"2", Some(10)));

        let records = slice.capture_records(50);
        assert_that!(records.len(), eq(1_usize));
        assert_that!(&records[0].key, eq(&b"live".to_vec()));
    }

    #[rstest]
    fn import_round_trips_capture() {
        let mut source = DbSlice::default();
        source.set(2, b"k".to_vec(), entry(b"v", Some(9_999)));

        let mut target = DbSlice::default();
        for record in source.capture_records(0) {
            target.import_record(record);
        }
        let restored = target.get(2, b"k", 0).expect("entry must be restored");
        assert_that!(&restored.value, eq(&b"v".to_vec()));
        assert_that!(restored.expire_at_ms, eq(Some(9_999_u64)));
    }

    #[rstest]
    fn stats_track_keys_and_expirations() {
        let mut slice = DbSlice::default();
        slice.set(0, b"a".to_vec(), entry(b"1", None));
        slice.set(0, b"b".to_vec(), entry(b"2", Some(100)));

        let stats = slice.stats();
        assert_that!(stats[0].key_count, eq(2_u64));
        assert_that!(stats[0].expire_count, eq(1_u64));
        assert_that!(stats[0].obj_memory_usage > 0, eq(true));
    }
}
