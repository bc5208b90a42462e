//! Cross-shard scheduling: per-shard ordering queues and hop execution.
//!
//! Every transaction reserves one slot in the ordering queue of each shard it
//! participates in. Reservation for all shards happens under one mutex, so
//! for any two transactions the relative queue order is identical on every
//! shard they share; per-shard commit order is simply queue order. Hops run
//! only while the transaction is at the head of all its queues, and the final
//! hop releases the slots.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use darter_common::error::{DarterError, DarterResult};
use darter_common::ids::{DbIndex, ShardId, TxId};
use darter_core::command::CommandFrame;
use darter_core::registry::CommandId;
use darter_core::sharding::ShardResolver;
use darter_engine::shard::EngineShard;
use darter_engine::shard_set::EngineShardSet;
use tokio::sync::Notify;

use crate::transaction::{ScheduleState, Transaction};

/// First-error-wins reduction used when merging per-shard hop failures.
pub fn update_error(src: DarterError, dest: &mut Option<DarterError>) {
    if dest.is_none() {
        *dest = Some(src);
    }
}

#[derive(Debug, Default)]
struct ShardQueue {
    waiting: Mutex<VecDeque<TxId>>,
    head_changed: Notify,
}

impl ShardQueue {
    fn enqueue(&self, txid: TxId) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(txid);
    }

    fn head(&self) -> Option<TxId> {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .copied()
    }

    fn pop(&self, txid: TxId) -> DarterResult<()> {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if waiting.front() != Some(&txid) {
            return Err(DarterError::InvalidState(
                "transaction concluded without owning its shard queue head",
            ));
        }
        let _ = waiting.pop_front();
        drop(waiting);
        self.head_changed.notify_waiters();
        Ok(())
    }

    async fn wait_until_head(&self, txid: TxId) {
        loop {
            let notified = self.head_changed.notified();
            tokio::pin!(notified);
            // Register before re-checking the head so a pop landing in
            // between cannot be missed.
            notified.as_mut().enable();
            if self.head() == Some(txid) {
                return;
            }
            notified.await;
        }
    }
}

/// Builds transactions, reserves shard ordering slots, and runs hops.
pub struct TxCoordinator {
    shard_set: Arc<EngineShardSet>,
    resolver: ShardResolver,
    queues: Vec<ShardQueue>,
    enqueue_mu: Mutex<()>,
    next_txid: AtomicU64,
}

impl std::fmt::Debug for TxCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxCoordinator")
            .field("shards", &self.queues.len())
            .field("next_txid", &self.next_txid.load(Ordering::Relaxed))
            .finish()
    }
}

impl TxCoordinator {
    /// Creates a coordinator over one shard set.
    #[must_use]
    pub fn new(shard_set: Arc<EngineShardSet>) -> Self {
        let shard_count = shard_set.size();
        Self {
            shard_set,
            resolver: ShardResolver::new(shard_count),
            queues: (0..shard_count.get()).map(|_| ShardQueue::default()).collect(),
            enqueue_mu: Mutex::new(()),
            next_txid: AtomicU64::new(1),
        }
    }

    /// The shard set hops execute on.
    #[must_use]
    pub fn shard_set(&self) -> &Arc<EngineShardSet> {
        &self.shard_set
    }

    /// The resolver mapping keys to owning shards.
    #[must_use]
    pub fn resolver(&self) -> &ShardResolver {
        &self.resolver
    }

    /// Allocates one transaction id.
    #[must_use]
    pub fn allocate_txid(&self) -> TxId {
        self.next_txid.fetch_add(1, Ordering::AcqRel)
    }

    /// Builds a reference-counted transaction for one command frame.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` when the frame has no usable key
    /// footprint for a non-global command.
    pub fn create_transaction(
        &self,
        cid: CommandId,
        db: DbIndex,
        frame: CommandFrame,
    ) -> DarterResult<Arc<Transaction>> {
        let tx = Transaction::new(self.allocate_txid(), cid, db, frame, &self.resolver)?;
        tx.validate_footprint(self.shard_set.size())?;
        Ok(Arc::new(tx))
    }

    /// Reserves one ordering-queue slot on every participating shard.
    ///
    /// Reservation across shards is atomic with respect to other `schedule`
    /// calls, which is what makes global transactions agree on one order
    /// everywhere.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` when the transaction was already
    /// scheduled or concluded.
    pub fn schedule(&self, tx: &Transaction) -> DarterResult<()> {
        tx.transition(ScheduleState::Init, ScheduleState::Scheduled)?;
        let guard = self.enqueue_mu.lock().unwrap_or_else(PoisonError::into_inner);
        for shard in tx.touched_shards() {
            self.queues[usize::from(*shard)].enqueue(tx.txid());
        }
        drop(guard);
        Ok(())
    }

    /// Runs one hop callback on every participating shard.
    ///
    /// The hop waits until the transaction owns the head of each of its
    /// queues, then dispatches the callback to all shards in parallel.
    /// `is_final` releases the queue slots afterwards; no further hops are
    /// permitted once released. Per-shard errors are merged first-error-wins
    /// while every shard still observes its callback (partial success stays
    /// visible; the engine guarantees ordering, not cross-shard atomicity).
    ///
    /// # Errors
    ///
    /// Returns dispatch failures, or the first per-shard callback error.
    pub async fn execute<R, F>(
        &self,
        tx: &Arc<Transaction>,
        callback: F,
        is_final: bool,
    ) -> DarterResult<Vec<(ShardId, R)>>
    where
        R: Send + 'static,
        F: Fn(&Arc<Transaction>, &mut EngineShard) -> DarterResult<R> + Clone + Send + 'static,
    {
        if tx.schedule_state() != ScheduleState::Scheduled {
            return Err(DarterError::InvalidState(
                "transaction must be scheduled before executing a hop",
            ));
        }

        for shard in tx.touched_shards() {
            self.queues[usize::from(*shard)].wait_until_head(tx.txid()).await;
        }

        let mut results = Vec::with_capacity(tx.touched_shards().len());
        let mut first_error: Option<DarterError> = None;
        let mut calls = Vec::with_capacity(tx.touched_shards().len());
        for shard in tx.touched_shards() {
            let hop_tx = Arc::clone(tx);
            let hop_callback = callback.clone();
            // Eager dispatch: every shard's callback is queued before any
            // result is awaited, so the hop runs in parallel across shards.
            let call = self.shard_set.dispatch_on_shard(*shard, move |engine_shard| {
                engine_shard.note_hop();
                hop_callback(&hop_tx, engine_shard)
            });
            match call {
                Ok(pending) => calls.push((*shard, pending)),
                Err(error) => update_error(error, &mut first_error),
            }
        }
        for (shard, call) in calls {
            match call.value().await {
                Ok(Ok(value)) => results.push((shard, value)),
                Ok(Err(error)) | Err(error) => update_error(error, &mut first_error),
            }
        }

        if is_final {
            self.conclude(tx)?;
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(results),
        }
    }

    /// Fused schedule + single execute: exactly one hop per participating
    /// shard, no further hops permitted.
    ///
    /// # Errors
    ///
    /// Returns scheduling or hop errors as in [`TxCoordinator::execute`].
    pub async fn schedule_single_hop<R, F>(
        &self,
        tx: &Arc<Transaction>,
        callback: F,
    ) -> DarterResult<Vec<(ShardId, R)>>
    where
        R: Send + 'static,
        F: Fn(&Arc<Transaction>, &mut EngineShard) -> DarterResult<R> + Clone + Send + 'static,
    {
        self.schedule(tx)?;
        self.execute(tx, callback, true).await
    }

    fn conclude(&self, tx: &Arc<Transaction>) -> DarterResult<()> {
        tx.transition(ScheduleState::Scheduled, ScheduleState::Concluded)?;
        for shard in tx.touched_shards() {
            self.queues[usize::from(*shard)].pop(tx.txid())?;
        }
        Ok(())
    }
}
