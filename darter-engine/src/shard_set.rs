//! Fan-out layer over the reactors that own engine shards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use darter_common::error::{DarterError, DarterResult};
use darter_common::ids::{ShardCount, ShardId};
use darter_facade::proactor::{ProactorPool, ReactorCall};

use crate::shard::EngineShard;

/// Owns shard placement: shard `i` lives on reactor `i`; reactors beyond the
/// shard count (if any) are auxiliary and host connection/background fibers.
pub struct EngineShardSet {
    pool: Arc<ProactorPool>,
    shard_count: ShardCount,
    /// Per-shard used-memory estimates, refreshed by shard heartbeats so
    /// aggregation never has to cross into shard threads.
    cached_used_memory: Arc<Vec<AtomicU64>>,
}

impl std::fmt::Debug for EngineShardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShardSet")
            .field("shard_count", &self.shard_count.get())
            .field("reactors", &self.pool.size())
            .finish()
    }
}

impl EngineShardSet {
    /// Installs one shard on each of the first `shard_count` reactors.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidConfig` when the pool has fewer reactors
    /// than shards, or `DarterError::InvalidState` when a reactor is
    /// unavailable.
    pub fn new(pool: Arc<ProactorPool>, shard_count: ShardCount) -> DarterResult<Self> {
        if pool.size() < shard_count.get() {
            return Err(DarterError::InvalidConfig(
                "proactor pool is smaller than the shard count",
            ));
        }
        for shard_id in 0..shard_count.get() {
            pool.await_brief(shard_id, move || EngineShard::install(shard_id))?;
        }
        let cached_used_memory = Arc::new(
            (0..shard_count.get())
                .map(|_| AtomicU64::new(0))
                .collect::<Vec<_>>(),
        );
        Ok(Self {
            pool,
            shard_count,
            cached_used_memory,
        })
    }

    /// Sum of the heartbeat-refreshed per-shard used-memory estimates.
    #[must_use]
    pub fn cached_used_memory_total(&self) -> u64 {
        self.cached_used_memory
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }

    /// Number of shards.
    #[must_use]
    pub fn size(&self) -> ShardCount {
        self.shard_count
    }

    /// The reactor pool backing this shard set.
    #[must_use]
    pub fn pool(&self) -> &Arc<ProactorPool> {
        &self.pool
    }

    /// Removes all shards from their reactors. Called once during shutdown.
    pub fn shutdown(&self) {
        for shard_id in 0..self.shard_count.get() {
            let _ = self.pool.await_brief(shard_id, EngineShard::uninstall);
        }
    }

    /// Submits one callback to a shard's reactor without awaiting it.
    ///
    /// Submission is eager: the callback is queued before this returns, so a
    /// caller fanning out to several shards gets genuine parallelism by
    /// collecting the pending calls first and awaiting them afterwards.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` for unknown shards or a stopped
    /// reactor.
    pub fn dispatch_on_shard<R, F>(&self, shard: ShardId, f: F) -> DarterResult<ReactorCall<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut EngineShard) -> R + Send + 'static,
    {
        if shard >= self.shard_count.get() {
            return Err(DarterError::InvalidState("shard id is out of range"));
        }
        self.pool.run_on(shard, move || {
            EngineShard::with_tlocal(f).expect("owning reactor must carry its shard")
        })
    }

    /// Runs one callback on a shard's reactor and awaits the result.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` for unknown shards or a stopped
    /// reactor.
    pub async fn run_on_shard<R, F>(&self, shard: ShardId, f: F) -> DarterResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut EngineShard) -> R + Send + 'static,
    {
        self.dispatch_on_shard(shard, f)?.value().await
    }

    /// Blocking twin of [`EngineShardSet::run_on_shard`] for non-reactor threads.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` for unknown shards or a stopped
    /// reactor.
    pub fn run_on_shard_blocking<R, F>(&self, shard: ShardId, f: F) -> DarterResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut EngineShard) -> R + Send + 'static,
    {
        self.dispatch_on_shard(shard, f)?.get()
    }

    /// Fans one non-suspending callback out to every shard passing `pred`,
    /// awaiting all results in shard order.
    ///
    /// The callback must not mutate shard state beyond its own bookkeeping;
    /// read-only aggregations (DBSIZE, metrics) are the intended use.
    ///
    /// # Errors
    ///
    /// Returns the first dispatch error encountered.
    pub async fn run_brief_in_parallel<R, F, P>(
        &self,
        f: F,
        pred: P,
    ) -> DarterResult<Vec<(ShardId, R)>>
    where
        R: Send + 'static,
        F: Fn(&mut EngineShard) -> R + Clone + Send + 'static,
        P: Fn(ShardId) -> bool,
    {
        let mut calls = Vec::new();
        for shard in 0..self.shard_count.get() {
            if !pred(shard) {
                continue;
            }
            calls.push((shard, self.dispatch_on_shard(shard, f.clone())?));
        }

        let mut results = Vec::with_capacity(calls.len());
        for (shard, call) in calls {
            results.push((shard, call.value().await?));
        }
        Ok(results)
    }

    /// Like [`EngineShardSet::run_brief_in_parallel`] on all shards, but the
    /// callback may block on I/O (snapshot body serialization does).
    ///
    /// # Errors
    ///
    /// Returns the first dispatch error encountered.
    pub async fn run_blocking_in_parallel<R, F>(&self, f: F) -> DarterResult<Vec<(ShardId, R)>>
    where
        R: Send + 'static,
        F: Fn(&mut EngineShard) -> R + Clone + Send + 'static,
    {
        self.run_brief_in_parallel(f, |_| true).await
    }

    /// Schedules `f(reactor_index)` on every reactor thread (shard owners and
    /// auxiliary reactors alike) and awaits completion everywhere.
    ///
    /// # Errors
    ///
    /// Returns the first dispatch error encountered.
    pub async fn await_fiber_on_all<F>(&self, f: F) -> DarterResult<()>
    where
        F: Fn(u16) + Clone + Send + 'static,
    {
        let mut calls = Vec::new();
        for reactor in 0..self.pool.size() {
            let callback = f.clone();
            calls.push(self.pool.run_on(reactor, move || callback(reactor))?);
        }
        for call in calls {
            call.value().await?;
        }
        Ok(())
    }

    /// Blocking twin of [`EngineShardSet::await_fiber_on_all`] for
    /// non-reactor threads.
    ///
    /// # Errors
    ///
    /// Returns the first dispatch error encountered.
    pub fn await_fiber_on_all_blocking<F>(&self, f: F) -> DarterResult<()>
    where
        F: Fn(u16) + Clone + Send + 'static,
    {
        let mut calls = Vec::new();
        for reactor in 0..self.pool.size() {
            let callback = f.clone();
            calls.push(self.pool.run_on(reactor, move || callback(reactor))?);
        }
        for call in calls {
            call.get()?;
        }
        Ok(())
    }

    /// Starts one heartbeat periodic per shard.
    ///
    /// Heartbeats run bounded active expiry and skip it while `is_saving` is
    /// set so body serialization sees a stable keyspace.
    ///
    /// # Errors
    ///
    /// Returns the first registration error encountered.
    pub fn start_heartbeats(
        &self,
        period: Duration,
        is_saving: Arc<AtomicBool>,
    ) -> DarterResult<Vec<u64>> {
        let mut ids = Vec::with_capacity(self.shard_count.as_usize());
        for shard in 0..self.shard_count.get() {
            let saving = Arc::clone(&is_saving);
            let cached = Arc::clone(&self.cached_used_memory);
            let id = self.pool.add_periodic(shard, period, move || {
                let now_ms = unix_time_ms();
                let _ = EngineShard::with_tlocal(|engine_shard| {
                    engine_shard.heartbeat(now_ms, saving.load(Ordering::Relaxed));
                    if let Some(slot) = cached.get(usize::from(engine_shard.shard_id())) {
                        slot.store(engine_shard.db_slice_ref().used_memory(), Ordering::Relaxed);
                    }
                });
            })?;
            ids.push(id);
        }
        Ok(ids)
    }
}

/// Current wall clock in unix milliseconds.
#[must_use]
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}
