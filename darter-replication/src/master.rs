//! Master-side replication control plane: sync sessions and flow slots.

use rand::Rng;

/// Redis-compatible replication id length.
pub const REPLID_LEN: usize = 40;

/// Generates one 40-character lowercase hex identifier.
#[must_use]
pub fn generate_hex_id() -> String {
    let mut rng = rand::thread_rng();
    (0..REPLID_LEN)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// Session phase driven by the `DFLY` command lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSessionState {
    /// Replica is still registering flow sockets.
    Preparation,
    /// Full sync phase has started.
    FullSync,
    /// Session transitioned into stable incremental sync.
    StableSync,
}

/// Session transition errors produced by the `DFLY` command lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSessionError {
    /// Referenced sync session does not exist.
    SyncIdNotFound,
    /// Command is invalid for the current session phase.
    InvalidState,
    /// Requested flow id is outside the session flow count.
    FlowOutOfRange,
    /// Transition requires all flows to be registered first.
    IncompleteFlows,
}

/// One negotiated flow slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFlow {
    /// EOF token returned by `DFLY FLOW` and appended after the shard body.
    pub eof_token: String,
}

/// One active sync session with per-flow registration slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    /// Session id (`SYNC<n>`).
    pub id: String,
    /// Session phase.
    pub state: SyncSessionState,
    /// Per-flow registration map by flow id.
    pub flows: Vec<Option<SyncFlow>>,
}

/// Registry of inbound replication sessions on the master side.
#[derive(Debug)]
pub struct MasterSessions {
    master_replid: String,
    next_session_id: u64,
    sessions: Vec<SyncSession>,
}

impl Default for MasterSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterSessions {
    /// Creates the registry with a fresh master replication id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            master_replid: generate_hex_id(),
            next_session_id: 1,
            sessions: Vec::new(),
        }
    }

    /// The 40-character master replication id.
    #[must_use]
    pub fn master_replid(&self) -> &str {
        &self.master_replid
    }

    /// Allocates one sync session with `flow_count` flow slots.
    ///
    /// Returns the session id handed to the replica (`SYNC<n>`).
    pub fn create_sync_session(&mut self, flow_count: usize) -> String {
        let flow_count = flow_count.max(1);
        let id = format!("SYNC{}", self.next_session_id);
        self.next_session_id = self.next_session_id.saturating_add(1);
        self.sessions.push(SyncSession {
            id: id.clone(),
            state: SyncSessionState::Preparation,
            flows: vec![None; flow_count],
        });
        id
    }

    /// Whether one session id is currently known.
    #[must_use]
    pub fn is_known_session(&self, sync_id: &str) -> bool {
        self.sessions.iter().any(|session| session.id == sync_id)
    }

    /// Current state of one session when present.
    #[must_use]
    pub fn session_state(&self, sync_id: &str) -> Option<SyncSessionState> {
        self.sessions
            .iter()
            .find(|session| session.id == sync_id)
            .map(|session| session.state)
    }

    /// EOF token registered for one flow, when present.
    #[must_use]
    pub fn flow_eof_token(&self, sync_id: &str, flow_id: usize) -> Option<&str> {
        self.sessions
            .iter()
            .find(|session| session.id == sync_id)?
            .flows
            .get(flow_id)?
            .as_ref()
            .map(|flow| flow.eof_token.as_str())
    }

    /// Registers one flow under one session and returns its EOF token.
    ///
    /// Only valid while the session is in preparation; duplicate flow ids are
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns the corresponding [`SyncSessionError`] on unknown session,
    /// wrong phase, out-of-range flow, or duplicate registration.
    pub fn register_sync_flow(
        &mut self,
        sync_id: &str,
        flow_id: usize,
    ) -> Result<String, SyncSessionError> {
        let session = self
            .sessions
            .iter_mut()
            .find(|session| session.id == sync_id)
            .ok_or(SyncSessionError::SyncIdNotFound)?;
        if session.state != SyncSessionState::Preparation {
            return Err(SyncSessionError::InvalidState);
        }
        if flow_id >= session.flows.len() {
            return Err(SyncSessionError::FlowOutOfRange);
        }
        if session.flows[flow_id].is_some() {
            return Err(SyncSessionError::InvalidState);
        }

        let eof_token = generate_hex_id();
        session.flows[flow_id] = Some(SyncFlow {
            eof_token: eof_token.clone(),
        });
        Ok(eof_token)
    }

    /// Transitions one session into the full-sync phase.
    ///
    /// # Errors
    ///
    /// Returns `SyncIdNotFound`, `InvalidState` for a non-preparation phase,
    /// or `IncompleteFlows` while flow slots are still empty.
    pub fn mark_full_sync(&mut self, sync_id: &str) -> Result<(), SyncSessionError> {
        let session = self
            .sessions
            .iter_mut()
            .find(|session| session.id == sync_id)
            .ok_or(SyncSessionError::SyncIdNotFound)?;
        if session.state != SyncSessionState::Preparation {
            return Err(SyncSessionError::InvalidState);
        }
        if session.flows.iter().any(Option::is_none) {
            return Err(SyncSessionError::IncompleteFlows);
        }
        session.state = SyncSessionState::FullSync;
        Ok(())
    }

    /// Transitions one session into stable incremental sync.
    ///
    /// # Errors
    ///
    /// Returns `SyncIdNotFound`, or `InvalidState` when already stable.
    pub fn mark_stable_sync(&mut self, sync_id: &str) -> Result<(), SyncSessionError> {
        let session = self
            .sessions
            .iter_mut()
            .find(|session| session.id == sync_id)
            .ok_or(SyncSessionError::SyncIdNotFound)?;
        if session.state == SyncSessionState::StableSync {
            return Err(SyncSessionError::InvalidState);
        }
        session.state = SyncSessionState::StableSync;
        Ok(())
    }

    /// Drops one session, releasing its flow slots.
    pub fn remove_session(&mut self, sync_id: &str) {
        self.sessions.retain(|session| session.id != sync_id);
    }
}

#[cfg(test)]
mod tests {
    use super::{MasterSessions, SyncSessionError, SyncSessionState, generate_hex_id};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn hex_ids_have_replid_shape() {
        let id = generate_hex_id();
        assert_that!(id.len(), eq(40_usize));
        assert_that!(id.chars().all(|c| c.is_ascii_hexdigit()), eq(true));
    }

    #[rstest]
    fn session_ids_are_monotonic() {
        let mut sessions = MasterSessions::new();
        assert_that!(sessions.create_sync_session(2).as_str(), eq("SYNC1"));
        assert_that!(sessions.create_sync_session(2).as_str(), eq("SYNC2"));
        assert_that!(sessions.is_known_session("SYNC1"), eq(true));
        assert_that!(sessions.is_known_session("SYNC9"), eq(false));
    }

    #[rstest]
    fn full_sync_requires_every_flow_registered() {
        let mut sessions = MasterSessions::new();
        let sync = sessions.create_sync_session(2);

        assert_that!(
            sessions.mark_full_sync(&sync),
            eq(Err(SyncSessionError::IncompleteFlows))
        );

        let token_0 = sessions
            .register_sync_flow(&sync, 0)
            .expect("flow 0 must register");
        let token_1 = sessions
            .register_sync_flow(&sync, 1)
            .expect("flow 1 must register");
        assert_that!(token_0 == token_1, eq(false));

        sessions.mark_full_sync(&sync).expect("transition must pass");
        assert_that!(
            sessions.session_state(&sync),
            eq(Some(SyncSessionState::FullSync))
        );

        assert_that!(
            sessions.register_sync_flow(&sync, 0),
            eq(Err(SyncSessionError::InvalidState))
        );
    }

    #[rstest]
    fn flow_registration_rejects_bad_ids() {
        let mut sessions = MasterSessions::new();
        let sync = sessions.create_sync_session(1);

        assert_that!(
            sessions.register_sync_flow("SYNC99", 0),
            eq(Err(SyncSessionError::SyncIdNotFound))
        );
        assert_that!(
            sessions.register_sync_flow(&sync, 5),
            eq(Err(SyncSessionError::FlowOutOfRange))
        );
        let _ = sessions
            .register_sync_flow(&sync, 0)
            .expect("flow must register");
        assert_that!(
            sessions.register_sync_flow(&sync, 0),
            eq(Err(SyncSessionError::InvalidState))
        );
    }

    #[rstest]
    fn stable_sync_accepts_preparation_and_full_sync_sources() {
        let mut sessions = MasterSessions::new();
        let sync = sessions.create_sync_session(1);
        sessions.mark_stable_sync(&sync).expect("transition must pass");
        assert_that!(
            sessions.mark_stable_sync(&sync),
            eq(Err(SyncSessionError::InvalidState))
        );
    }
}
