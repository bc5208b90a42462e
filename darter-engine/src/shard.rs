//! One engine shard: a keyspace partition pinned to a reactor thread.

use std::cell::RefCell;

use darter_common::ids::{DEFAULT_DB_COUNT, ShardId};
use darter_core::db_slice::DbSlice;

/// Keys inspected per logical database by one heartbeat expiry pass.
const HEARTBEAT_EXPIRE_BUDGET: usize = 64;

/// Per-shard counters, read by metrics aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    /// Hop callbacks executed on this shard.
    pub hops_executed: u64,
    /// Heartbeat ticks observed.
    pub heartbeats: u64,
    /// Heartbeat ticks skipped because a snapshot was serializing.
    pub heartbeats_skipped_saving: u64,
}

/// One partition of the keyspace plus its bookkeeping.
///
/// Created on its owning reactor thread during startup and destroyed on
/// shutdown; it never migrates across threads, so the slice is mutated only
/// by that thread.
#[derive(Debug)]
pub struct EngineShard {
    shard_id: ShardId,
    db_slice: DbSlice,
    stats: ShardStats,
}

thread_local! {
    static CURRENT_SHARD: RefCell<Option<EngineShard>> = const { RefCell::new(None) };
}

impl EngineShard {
    /// Installs the shard into the current thread's slot.
    ///
    /// Must run on the owning reactor; a second install on the same thread
    /// replaces the previous shard.
    pub fn install(shard_id: ShardId) {
        CURRENT_SHARD.with(|slot| {
            *slot.borrow_mut() = Some(Self {
                shard_id,
                db_slice: DbSlice::new(DEFAULT_DB_COUNT),
                stats: ShardStats::default(),
            });
        });
    }

    /// Removes the shard from the current thread's slot.
    pub fn uninstall() {
        CURRENT_SHARD.with(|slot| {
            *slot.borrow_mut() = None;
        });
    }

    /// Typed accessor for the reactor-local shard.
    ///
    /// Returns `None` when the current thread owns no shard.
    pub fn with_tlocal<R>(f: impl FnOnce(&mut Self) -> R) -> Option<R> {
        CURRENT_SHARD.with(|slot| slot.borrow_mut().as_mut().map(f))
    }

    /// Shard identifier.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// The keyspace partition owned by this shard.
    pub fn db_slice(&mut self) -> &mut DbSlice {
        &mut self.db_slice
    }

    /// Read-only view of the keyspace partition.
    #[must_use]
    pub fn db_slice_ref(&self) -> &DbSlice {
        &self.db_slice
    }

    /// Per-shard counters.
    #[must_use]
    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    /// Records one executed hop callback.
    pub fn note_hop(&mut self) {
        self.stats.hops_executed += 1;
    }

    /// One heartbeat tick: bounded active expiry unless a snapshot is
    /// serializing this shard.
    pub fn heartbeat(&mut self, now_ms: u64, is_saving: bool) {
        self.stats.heartbeats += 1;
        if is_saving {
            self.stats.heartbeats_skipped_saving += 1;
            return;
        }
        let _ = self
            .db_slice
            .active_expire_pass(now_ms, HEARTBEAT_EXPIRE_BUDGET);
    }
}

#[cfg(test)]
mod tests {
    use super::EngineShard;
    use darter_core::db_slice::SliceEntry;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn tlocal_is_empty_until_installed() {
        assert_that!(EngineShard::with_tlocal(|_| ()).is_none(), eq(true));

        EngineShard::install(3);
        let shard_id = EngineShard::with_tlocal(EngineShard::shard_id);
        assert_that!(shard_id, eq(Some(3)));
        EngineShard::uninstall();
        assert_that!(EngineShard::with_tlocal(|_| ()).is_none(), eq(true));
    }

    #[rstest]
    fn heartbeat_skips_expiry_while_saving() {
        EngineShard::install(0);
        let _ = EngineShard::with_tlocal(|shard| {
            shard.db_slice().set(
                0,
                b"k".to_vec(),
                SliceEntry {
                    value: b"v".to_vec(),
                    expire_at_ms: Some(10),
                },
            );

            shard.heartbeat(100, true);
            assert_that!(shard.db_slice().db_size(0), eq(1_u64));
            assert_that!(shard.stats().heartbeats_skipped_saving, eq(1_u64));

            shard.heartbeat(100, false);
            assert_that!(shard.db_slice().db_size(0), eq(0_u64));
            assert_that!(shard.stats().heartbeats, eq(2_u64));
        });
        EngineShard::uninstall();
    }
}
