//! Global lifecycle state and per-reactor server state.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, Ordering};

/// Mutually exclusive lifecycle states gating which commands may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalState {
    /// Normal operation.
    Active,
    /// A snapshot or replication bootstrap is populating the keyspace.
    Loading,
    /// A snapshot is being written.
    Saving,
    /// Orderly shutdown in progress.
    ShuttingDown,
}

/// Uppercase state name used in user-visible errors.
#[must_use]
pub fn global_state_name(state: GlobalState) -> &'static str {
    match state {
        GlobalState::Active => "ACTIVE",
        GlobalState::Loading => "LOADING",
        GlobalState::Saving => "SAVING",
        GlobalState::ShuttingDown => "SHUTTING DOWN",
    }
}

fn state_to_u8(state: GlobalState) -> u8 {
    match state {
        GlobalState::Active => 0,
        GlobalState::Loading => 1,
        GlobalState::Saving => 2,
        GlobalState::ShuttingDown => 3,
    }
}

fn state_from_u8(raw: u8) -> GlobalState {
    match raw {
        1 => GlobalState::Loading,
        2 => GlobalState::Saving,
        3 => GlobalState::ShuttingDown,
        _ => GlobalState::Active,
    }
}

/// Process-wide lifecycle state with compare-and-swap transitions.
#[derive(Debug)]
pub struct GlobalStateOwner {
    state: AtomicU8,
}

impl Default for GlobalStateOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalStateOwner {
    /// Starts in `Active`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(state_to_u8(GlobalState::Active)),
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> GlobalState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically transitions `from → to`.
    ///
    /// Returns the state actually observed afterwards: `to` on success, the
    /// conflicting state otherwise.
    pub fn switch_state(&self, from: GlobalState, to: GlobalState) -> GlobalState {
        match self.state.compare_exchange(
            state_to_u8(from),
            state_to_u8(to),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => to,
            Err(observed) => state_from_u8(observed),
        }
    }
}

/// Six-sample moving window used for instantaneous QPS.
#[derive(Debug, Clone, Copy, Default)]
pub struct MovingSum6 {
    samples: [u64; 6],
    position: usize,
    current: u64,
}

impl MovingSum6 {
    /// Counts one event into the active sample.
    pub fn add(&mut self, count: u64) {
        self.current += count;
    }

    /// Closes the active sample and opens the next one.
    pub fn roll(&mut self) {
        self.samples[self.position] = self.current;
        self.position = (self.position + 1) % self.samples.len();
        self.current = 0;
    }

    /// Sum over the closed samples.
    #[must_use]
    pub fn sum(&self) -> u64 {
        self.samples.iter().sum()
    }
}

/// Connection counters aggregated by `INFO` and `/metrics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Currently open client connections on this reactor.
    pub num_conns: u64,
    /// Commands executed.
    pub command_count: u64,
    /// Bytes read from client sockets.
    pub io_read_bytes: u64,
    /// Bytes written to client sockets.
    pub io_write_bytes: u64,
    /// Protocol parse failures observed.
    pub parser_err_count: u64,
}

impl ConnectionStats {
    /// Accumulates another reactor's counters.
    pub fn merge(&mut self, other: &Self) {
        self.num_conns += other.num_conns;
        self.command_count += other.command_count;
        self.io_read_bytes += other.io_read_bytes;
        self.io_write_bytes += other.io_write_bytes;
        self.parser_err_count += other.parser_err_count;
    }
}

/// Per-reactor server state, reached only from that reactor's thread.
#[derive(Debug, Default)]
pub struct ServerState {
    /// Whether this instance currently acts as a master.
    pub is_master: bool,
    /// Connection counters owned by this reactor.
    pub connection_stats: ConnectionStats,
    /// QPS moving window, rolled once per second.
    pub qps_window: MovingSum6,
}

thread_local! {
    static CURRENT_STATE: RefCell<ServerState> = RefCell::new(ServerState {
        is_master: true,
        ..ServerState::default()
    });
}

impl ServerState {
    /// Typed accessor for the reactor-local server state.
    pub fn with_tlocal<R>(f: impl FnOnce(&mut Self) -> R) -> R {
        CURRENT_STATE.with(|slot| f(&mut slot.borrow_mut()))
    }
}

#[cfg(test)]
mod tests {
    use super::{GlobalState, GlobalStateOwner, MovingSum6, ServerState};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn switch_state_succeeds_from_expected_state() {
        let owner = GlobalStateOwner::new();
        let observed = owner.switch_state(GlobalState::Active, GlobalState::Saving);
        assert_that!(observed, eq(GlobalState::Saving));
        assert_that!(owner.current(), eq(GlobalState::Saving));
    }

    #[rstest]
    fn switch_state_reports_conflicting_state() {
        let owner = GlobalStateOwner::new();
        let _ = owner.switch_state(GlobalState::Active, GlobalState::Loading);
        let observed = owner.switch_state(GlobalState::Active, GlobalState::Saving);
        assert_that!(observed, eq(GlobalState::Loading));
        assert_that!(owner.current(), eq(GlobalState::Loading));
    }

    #[rstest]
    fn moving_sum_counts_only_closed_samples() {
        let mut window = MovingSum6::default();
        window.add(10);
        assert_that!(window.sum(), eq(0_u64));

        window.roll();
        assert_that!(window.sum(), eq(10_u64));

        for _ in 0..6 {
            window.roll();
        }
        assert_that!(window.sum(), eq(0_u64));
    }

    #[rstest]
    fn tlocal_state_defaults_to_master() {
        let is_master = ServerState::with_tlocal(|state| state.is_master);
        assert_that!(is_master, eq(true));
    }
}
