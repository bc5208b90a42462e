//! Master-side `DFLY` replication sessions.
//!
//! `REPLCONF capa dragonfly` reserves a session; each replica flow connection
//! authenticates with `DFLY FLOW` and then blocks until `DFLY SYNC` pins the
//! consistent cut and releases the per-shard bodies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use darter_common::ids::ShardId;
use darter_core::command::CommandReply;
use darter_core::db_slice::SliceRecord;
use darter_facade::notify::Done;
use darter_replication::master::{MasterSessions, SyncSessionError};

/// What a flow connection needs after `DFLY FLOW` is accepted.
#[derive(Debug)]
pub struct FlowTicket {
    /// Token echoed in the `FULL` reply and appended after the shard body.
    pub eof_token: String,
    /// Fired when `DFLY SYNC` starts the session.
    pub started: Arc<Done>,
}

/// Translates session-registry errors into client replies.
#[must_use]
pub fn sync_session_error_reply(error: SyncSessionError) -> CommandReply {
    match error {
        SyncSessionError::SyncIdNotFound => CommandReply::Error("syncid not found".to_owned()),
        SyncSessionError::InvalidState | SyncSessionError::IncompleteFlows => {
            CommandReply::Error("invalid state".to_owned())
        }
        SyncSessionError::FlowOutOfRange => {
            CommandReply::Error("value is not an integer or out of range".to_owned())
        }
    }
}

/// Inbound replication session registry.
#[derive(Debug)]
pub struct DflyCmd {
    sessions: Mutex<MasterSessions>,
    started: Mutex<HashMap<String, Arc<Done>>>,
    captures: Mutex<HashMap<String, Vec<Option<Vec<SliceRecord>>>>>,
}

impl Default for DflyCmd {
    fn default() -> Self {
        Self::new()
    }
}

impl DflyCmd {
    /// Creates an empty registry with a fresh master replication id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(MasterSessions::new()),
            started: Mutex::new(HashMap::new()),
            captures: Mutex::new(HashMap::new()),
        }
    }

    fn sessions_guard(&self) -> std::sync::MutexGuard<'_, MasterSessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The 40-character master replication id.
    #[must_use]
    pub fn master_replid(&self) -> String {
        self.sessions_guard().master_replid().to_owned()
    }

    /// Reserves one sync session with `flow_count` flows.
    pub fn allocate_session(&self, flow_count: usize) -> String {
        let sync_id = self.sessions_guard().create_sync_session(flow_count);
        let _ = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sync_id.clone(), Arc::new(Done::new()));
        let _ = self
            .captures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sync_id.clone(), vec![None; flow_count.max(1)]);
        sync_id
    }

    /// Registers one flow connection.
    ///
    /// # Errors
    ///
    /// Returns the client-facing error reply for a wrong master id or any
    /// session-registry rejection.
    pub fn register_flow(
        &self,
        master_replid: &str,
        sync_id: &str,
        flow_id: usize,
    ) -> Result<FlowTicket, CommandReply> {
        let eof_token = {
            let mut sessions = self.sessions_guard();
            if master_replid != sessions.master_replid() {
                return Err(CommandReply::Error("bad master id".to_owned()));
            }
            sessions
                .register_sync_flow(sync_id, flow_id)
                .map_err(sync_session_error_reply)?
        };
        let started = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sync_id)
            .cloned()
            .ok_or_else(|| CommandReply::Error("syncid not found".to_owned()))?;
        Ok(FlowTicket { eof_token, started })
    }

    /// Moves one session into full sync.
    ///
    /// The caller captures the consistent cut and then calls
    /// [`DflyCmd::store_capture`] plus [`DflyCmd::start_session`].
    ///
    /// # Errors
    ///
    /// Returns the client-facing error reply on a bad session or phase.
    pub fn mark_full_sync(&self, sync_id: &str) -> Result<(), CommandReply> {
        self.sessions_guard()
            .mark_full_sync(sync_id)
            .map_err(sync_session_error_reply)
    }

    /// Stores one shard's captured records for its flow.
    pub fn store_capture(&self, sync_id: &str, shard: ShardId, records: Vec<SliceRecord>) {
        let mut captures = self.captures.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slots) = captures.get_mut(sync_id) {
            if let Some(slot) = slots.get_mut(usize::from(shard)) {
                *slot = Some(records);
            }
        }
    }

    /// Releases the flow connections of one session.
    pub fn start_session(&self, sync_id: &str) {
        let started = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sync_id)
            .cloned();
        if let Some(done) = started {
            done.fire();
        }
    }

    /// Takes one flow's captured records.
    #[must_use]
    pub fn take_capture(&self, sync_id: &str, flow_id: usize) -> Option<Vec<SliceRecord>> {
        self.captures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(sync_id)?
            .get_mut(flow_id)?
            .take()
    }

    /// Drops one session and wakes any flow still waiting on it.
    pub fn drop_session(&self, sync_id: &str) {
        self.sessions_guard().remove_session(sync_id);
        let started = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sync_id);
        if let Some(done) = started {
            done.fire();
        }
        let _ = self
            .captures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sync_id);
    }
}

#[cfg(test)]
mod tests {
    use super::DflyCmd;
    use darter_core::command::CommandReply;
    use darter_core::db_slice::SliceRecord;
    use googletest::prelude::*;
    use rstest::rstest;

    fn record(key: &[u8]) -> SliceRecord {
        SliceRecord {
            db: 0,
            key: key.to_vec(),
            value: b"v".to_vec(),
            expire_at_ms: None,
        }
    }

    #[rstest]
    fn flow_registration_validates_master_id() {
        let dfly = DflyCmd::new();
        let sync_id = dfly.allocate_session(2);

        let rejected = dfly.register_flow("not-the-master", &sync_id, 0);
        let Err(CommandReply::Error(message)) = rejected else {
            panic!("expected master id rejection");
        };
        assert_that!(message.as_str(), eq("bad master id"));

        let replid = dfly.master_replid();
        let ticket = dfly
            .register_flow(&replid, &sync_id, 0)
            .expect("flow must register");
        assert_that!(ticket.eof_token.len(), eq(40_usize));
        assert_that!(ticket.started.is_fired(), eq(false));
    }

    #[rstest]
    fn full_sync_requires_all_flows_then_releases_captures() {
        let dfly = DflyCmd::new();
        let sync_id = dfly.allocate_session(2);
        let replid = dfly.master_replid();

        assert_that!(dfly.mark_full_sync(&sync_id).is_err(), eq(true));

        let ticket_0 = dfly
            .register_flow(&replid, &sync_id, 0)
            .expect("flow 0 must register");
        let _ticket_1 = dfly
            .register_flow(&replid, &sync_id, 1)
            .expect("flow 1 must register");
        dfly.mark_full_sync(&sync_id).expect("transition must pass");

        dfly.store_capture(&sync_id, 0, vec![record(b"a")]);
        dfly.store_capture(&sync_id, 1, vec![record(b"b")]);
        dfly.start_session(&sync_id);

        assert_that!(ticket_0.started.is_fired(), eq(true));
        let capture = dfly.take_capture(&sync_id, 0).expect("capture must exist");
        assert_that!(capture.len(), eq(1_usize));
        assert_that!(dfly.take_capture(&sync_id, 0), eq(&None));
    }

    #[rstest]
    fn unknown_session_is_rejected() {
        let dfly = DflyCmd::new();
        let replid = dfly.master_replid();
        assert_that!(dfly.register_flow(&replid, "SYNC99", 0).is_err(), eq(true));
    }
}
