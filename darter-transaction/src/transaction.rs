//! One command execution across zero or more shards.

use std::sync::Mutex;

use darter_common::error::{DarterError, DarterResult};
use darter_common::ids::{DbIndex, ShardCount, ShardId, TxId};
use darter_core::command::CommandFrame;
use darter_core::registry::CommandId;
use darter_core::sharding::ShardResolver;

/// Scheduling lifecycle of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    /// Built but not yet queued on any shard.
    Init,
    /// Holds a slot in every participating shard's ordering queue.
    Scheduled,
    /// Released all slots; no further hops permitted.
    Concluded,
}

/// Represents one command execution across its owning shards.
///
/// Reference-counted by the coordinator; destroyed when all shards complete.
#[derive(Debug)]
pub struct Transaction {
    txid: TxId,
    cid: CommandId,
    db: DbIndex,
    frame: CommandFrame,
    touched_shards: Vec<ShardId>,
    per_shard_args: Vec<(ShardId, Vec<Vec<u8>>)>,
    state: Mutex<ScheduleState>,
}

impl Transaction {
    /// Builds a transaction from a command frame.
    ///
    /// `GLOBAL_TRANS` commands participate on every shard regardless of key
    /// set; other commands participate on the owners of their keys.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` for a non-global command without
    /// any key argument.
    pub fn new(
        txid: TxId,
        cid: CommandId,
        db: DbIndex,
        frame: CommandFrame,
        resolver: &ShardResolver,
    ) -> DarterResult<Self> {
        let shard_count = resolver.shard_count();
        let (touched_shards, per_shard_args) = if cid.is_global_trans() {
            ((0..shard_count.get()).collect(), Vec::new())
        } else {
            let keyed = split_args_by_shard(&frame, resolver)?;
            let mut shards = keyed.iter().map(|(shard, _)| *shard).collect::<Vec<_>>();
            shards.sort_unstable();
            shards.dedup();
            (shards, keyed)
        };

        Ok(Self {
            txid,
            cid,
            db,
            frame,
            touched_shards,
            per_shard_args,
            state: Mutex::new(ScheduleState::Init),
        })
    }

    /// Monotonic transaction id.
    #[must_use]
    pub fn txid(&self) -> TxId {
        self.txid
    }

    /// Command descriptor driving this transaction.
    #[must_use]
    pub fn cid(&self) -> CommandId {
        self.cid
    }

    /// Logical database selected by the issuing connection.
    #[must_use]
    pub fn db(&self) -> DbIndex {
        self.db
    }

    /// Full command frame.
    #[must_use]
    pub fn frame(&self) -> &CommandFrame {
        &self.frame
    }

    /// Shards participating in this transaction, ascending.
    #[must_use]
    pub fn touched_shards(&self) -> &[ShardId] {
        &self.touched_shards
    }

    /// The argument subset owned by one shard.
    ///
    /// Global transactions carry no per-shard split; they see the full frame.
    #[must_use]
    pub fn args_in_shard(&self, shard: ShardId) -> Vec<Vec<u8>> {
        if self.cid.is_global_trans() {
            return self.frame.args.clone();
        }
        self.per_shard_args
            .iter()
            .find(|(owner, _)| *owner == shard)
            .map(|(_, args)| args.clone())
            .unwrap_or_default()
    }

    /// The command frame restricted to one shard's argument subset.
    #[must_use]
    pub fn frame_in_shard(&self, shard: ShardId) -> CommandFrame {
        CommandFrame::new(self.frame.name.clone(), self.args_in_shard(shard))
    }

    /// Current scheduling state.
    #[must_use]
    pub fn schedule_state(&self) -> ScheduleState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn transition(
        &self,
        from: ScheduleState,
        to: ScheduleState,
    ) -> DarterResult<()> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state != from {
            return Err(DarterError::InvalidState(
                "transaction schedule state transition is invalid",
            ));
        }
        *state = to;
        Ok(())
    }

    /// Whether this transaction blocks all others on every shard.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.cid.is_global_trans()
    }

    /// Validates the touched footprint against the runtime shard count.
    ///
    /// # Errors
    ///
    /// Returns `DarterError::InvalidState` when any shard id is out of range.
    pub fn validate_footprint(&self, shard_count: ShardCount) -> DarterResult<()> {
        if self
            .touched_shards
            .iter()
            .any(|shard| *shard >= shard_count.get())
        {
            return Err(DarterError::InvalidState(
                "transaction touches a shard outside the runtime",
            ));
        }
        Ok(())
    }
}

/// Groups a frame's key arguments by owning shard, preserving argument order
/// inside each group.
fn split_args_by_shard(
    frame: &CommandFrame,
    resolver: &ShardResolver,
) -> DarterResult<Vec<(ShardId, Vec<Vec<u8>>)>> {
    let mut grouped: Vec<(ShardId, Vec<Vec<u8>>)> = Vec::new();
    let mut push = |shard: ShardId, args: &[Vec<u8>]| {
        if let Some((_, existing)) = grouped.iter_mut().find(|(owner, _)| *owner == shard) {
            existing.extend(args.iter().cloned());
        } else {
            grouped.push((shard, args.to_vec()));
        }
    };

    match frame.name.as_str() {
        "MSET" => {
            if frame.args.is_empty() || frame.args.len() % 2 != 0 {
                return Err(DarterError::InvalidState(
                    "MSET requires key/value pairs",
                ));
            }
            for pair in frame.args.chunks_exact(2) {
                push(resolver.shard_for_key(&pair[0]), pair);
            }
        }
        "DEL" | "UNLINK" | "EXISTS" | "MGET" | "TOUCH" => {
            if frame.args.is_empty() {
                return Err(DarterError::InvalidState("command requires key arguments"));
            }
            for key in &frame.args {
                push(resolver.shard_for_key(key), std::slice::from_ref(key));
            }
        }
        _ => {
            let Some(key) = frame.args.first() else {
                return Err(DarterError::InvalidState(
                    "non-global transaction requires a key argument",
                ));
            };
            push(resolver.shard_for_key(key), &frame.args);
        }
    }
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::{ScheduleState, Transaction};
    use darter_common::ids::ShardCount;
    use darter_core::command::CommandFrame;
    use darter_core::registry::{CommandFlags, CommandId};
    use darter_core::sharding::ShardResolver;
    use googletest::prelude::*;
    use rstest::rstest;

    fn resolver() -> ShardResolver {
        ShardResolver::new(ShardCount::new(4).expect("literal is valid"))
    }

    fn keyed_cid() -> CommandId {
        CommandId::new("SET", CommandFlags::WRITE, -3)
    }

    #[rstest]
    fn global_transaction_touches_every_shard() {
        let cid = CommandId::new("FLUSHALL", CommandFlags::WRITE | CommandFlags::GLOBAL_TRANS, -1);
        let tx = Transaction::new(1, cid, 0, CommandFrame::new("FLUSHALL", Vec::new()), &resolver())
            .expect("global transaction must build");
        assert_that!(tx.touched_shards(), eq(&[0, 1, 2, 3][..]));
        assert_that!(tx.is_global(), eq(true));
    }

    #[rstest]
    fn keyed_transaction_touches_owner_shard_only() {
        let frame = CommandFrame::new("SET", vec![b"k".to_vec(), b"v".to_vec()]);
        let owner = resolver().shard_for_key(b"k");
        let tx = Transaction::new(1, keyed_cid(), 0, frame, &resolver())
            .expect("keyed transaction must build");
        assert_that!(tx.touched_shards(), eq(&[owner][..]));
        assert_that!(tx.args_in_shard(owner).len(), eq(2_usize));
    }

    #[rstest]
    fn multi_key_del_splits_keys_by_owner() {
        let keys = (0..32_u32)
            .map(|index| format!("key:{index}").into_bytes())
            .collect::<Vec<_>>();
        let frame = CommandFrame::new("DEL", keys.clone());
        let cid = CommandId::new("DEL", CommandFlags::WRITE, -2);
        let tx =
            Transaction::new(1, cid, 0, frame, &resolver()).expect("transaction must build");

        let total_keys: usize = tx
            .touched_shards()
            .iter()
            .map(|shard| tx.args_in_shard(*shard).len())
            .sum();
        assert_that!(total_keys, eq(keys.len()));
        for shard in tx.touched_shards() {
            for key in tx.args_in_shard(*shard) {
                assert_that!(resolver().shard_for_key(&key), eq(*shard));
            }
        }
    }

    #[rstest]
    fn keyless_non_global_command_is_rejected() {
        let result = Transaction::new(
            1,
            keyed_cid(),
            0,
            CommandFrame::new("SET", Vec::new()),
            &resolver(),
        );
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn schedule_state_transitions_are_checked() {
        let frame = CommandFrame::new("SET", vec![b"k".to_vec(), b"v".to_vec()]);
        let tx = Transaction::new(1, keyed_cid(), 0, frame, &resolver())
            .expect("transaction must build");
        assert_that!(tx.schedule_state(), eq(ScheduleState::Init));

        tx.transition(ScheduleState::Init, ScheduleState::Scheduled)
            .expect("first transition must pass");
        let repeat = tx.transition(ScheduleState::Init, ScheduleState::Scheduled);
        assert_that!(repeat.is_err(), eq(true));
    }
}
