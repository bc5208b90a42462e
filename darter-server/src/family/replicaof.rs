//! Role transitions (`REPLICAOF`) and the replicated-traffic sink.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU16, Ordering};

use darter_common::ids::DB_ALL;
use darter_core::command::{CommandFrame, CommandReply};
use darter_core::registry::CommandFlags;
use darter_facade::protocol::ParsedCommand;
use darter_replication::replica::{LocalApplyFuture, Replica, ReplicationSink};
use tracing::{debug, warn};

use crate::server_state::ServerState;

use super::ServerFamily;

/// Routes replicated traffic into the local command service.
///
/// Holds a weak family reference; the replica object must not keep the
/// family alive.
pub(crate) struct FamilyReplicationSink {
    family: Weak<ServerFamily>,
    /// Database selected by the replication stream's `SELECT` frames.
    db: AtomicU16,
}

impl FamilyReplicationSink {
    pub(crate) fn new(family: &Arc<ServerFamily>) -> Arc<Self> {
        Arc::new(Self {
            family: Arc::downgrade(family),
            db: AtomicU16::new(0),
        })
    }
}

impl ReplicationSink for FamilyReplicationSink {
    fn apply_command(&self, frame: ParsedCommand) -> LocalApplyFuture<'_> {
        Box::pin(async move {
            let Some(family) = self.family.upgrade() else {
                return;
            };
            family.apply_replicated_command(&self.db, frame).await;
        })
    }

    fn apply_snapshot_record(
        &self,
        record: darter_core::db_slice::SliceRecord,
    ) -> LocalApplyFuture<'_> {
        Box::pin(async move {
            let Some(family) = self.family.upgrade() else {
                return;
            };
            if let Err(error) = family.import_records(vec![record]).await {
                warn!(error = %error, "failed to import replicated record");
            }
        })
    }
}

impl ServerFamily {
    /// Applies one streamed command with replication semantics: no reply, and
    /// only effectful verbs reach the shards.
    pub(crate) async fn apply_replicated_command(
        &self,
        db_slot: &AtomicU16,
        parsed: ParsedCommand,
    ) {
        let frame = CommandFrame::new(parsed.name, parsed.args);
        match frame.name.as_str() {
            "SELECT" => {
                if let Some(index) = frame.arg_str(0).and_then(|text| text.parse::<u16>().ok()) {
                    db_slot.store(index, Ordering::Release);
                }
            }
            "PING" => {}
            "FLUSHALL" => {
                let _ = self.do_flush(DB_ALL).await;
            }
            "FLUSHDB" => {
                let _ = self.do_flush(db_slot.load(Ordering::Acquire)).await;
            }
            name => {
                let Some(cid) = self.registry.find(name).copied() else {
                    debug!(command = name, "ignoring unknown replicated command");
                    return;
                };
                if !cid.flags.contains(CommandFlags::WRITE) {
                    debug!(command = name, "ignoring non-write replicated command");
                    return;
                }
                let db = db_slot.load(Ordering::Acquire);
                let reply = self.execute_data_command(db, cid, frame).await;
                if let CommandReply::Error(message) = reply {
                    warn!(error = %message, "replicated command failed");
                }
            }
        }
    }

    /// `REPLICAOF host port` / `REPLICAOF NO ONE` (and the `SLAVEOF` alias).
    pub(crate) async fn execute_replicaof(self: &Arc<Self>, frame: &CommandFrame) -> CommandReply {
        let (Some(host), Some(port_text)) = (frame.arg_str(0), frame.arg_str(1)) else {
            return CommandReply::Error("syntax error".to_owned());
        };
        let shard_set = Arc::clone(self.coordinator.shard_set());

        if host.eq_ignore_ascii_case("no") && port_text.eq_ignore_ascii_case("one") {
            // The replica slot's lock is the critical section preventing
            // concurrent REPLICAOF commands.
            let mut slot = self.replica.lock().await;
            if let Some(replica) = slot.take() {
                let _ = shard_set
                    .await_fiber_on_all(|_| {
                        ServerState::with_tlocal(|state| state.is_master = true);
                    })
                    .await;
                replica.stop().await;
            }
            return CommandReply::ok();
        }

        let Some(port) = port_text.parse::<u16>().ok().filter(|port| *port > 0) else {
            return CommandReply::Error("value is not an integer or out of range".to_owned());
        };

        let sink = FamilyReplicationSink::new(self);
        let new_replica = Replica::new(
            host.to_owned(),
            port,
            sink,
            Arc::clone(shard_set.pool()),
        );

        let mut slot = self.replica.lock().await;
        if let Some(old_replica) = slot.take() {
            old_replica.stop().await;
        } else {
            let _ = shard_set
                .await_fiber_on_all(|_| {
                    ServerState::with_tlocal(|state| state.is_master = false);
                })
                .await;
        }
        *slot = Some(Arc::clone(&new_replica));

        // Flush all data only after this instance was marked as a replica.
        if let Err(error) = self.do_flush(DB_ALL).await {
            warn!(error = %error, "flush before full sync failed");
        }

        match new_replica.run(self.aux_reactor()).await {
            Ok(()) => CommandReply::ok(),
            Err(error) => {
                // The keyspace was already flushed; dropping the replica
                // returns to an empty master rather than rolling back.
                *slot = None;
                let _ = shard_set
                    .await_fiber_on_all(|_| {
                        ServerState::with_tlocal(|state| state.is_master = true);
                    })
                    .await;
                CommandReply::Error(format!("{error}"))
            }
        }
    }

    /// Pauses or resumes an existing replica link.
    pub async fn pause_replication(&self, pause: bool) {
        let replica = self.replica.lock().await.clone();
        if let Some(replica) = replica {
            replica.pause(pause);
        }
    }
}
