//! `ServerFamily`: process lifecycle and the server-level command surface.

mod info;
mod replicaof;
mod save;
pub mod schedule;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use darter_common::config::RuntimeConfig;
use darter_common::error::DarterResult;
use darter_common::ids::{DB_ALL, DEFAULT_DB_COUNT, DbIndex};
use darter_core::command::{CommandFrame, CommandReply};
use darter_core::dispatch::execute_on_slice;
use darter_core::registry::{CommandFlags, CommandId, CommandRegistry, register_data_commands};
use darter_facade::connection::ConnectionContext;
use darter_facade::notify::Done;
use darter_facade::proactor::FiberHandle;
use darter_replication::journal::{Journal, JournalEntry, JournalOp};
use darter_replication::replica::Replica;
use darter_transaction::coordinator::TxCoordinator;
use tracing::{info, warn};

use crate::dflycmd::{DflyCmd, FlowTicket};
use crate::script::ScriptMgr;
use crate::server_state::{GlobalState, GlobalStateOwner, ServerState, global_state_name};

pub use save::LastSaveInfo;

/// One registered client connection, for `CLIENT LIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Monotonic connection id.
    pub id: u64,
    /// Peer address.
    pub addr: String,
    /// Name set through `CLIENT SETNAME`.
    pub name: String,
}

/// Result of dispatching one parsed command.
pub enum CommandExecution {
    /// Encoded reply bytes; `None` means the command is consumed silently.
    Reply(Option<Vec<u8>>),
    /// The connection becomes a replication flow socket.
    StartDflyFlow {
        /// Session id the flow belongs to.
        sync_id: String,
        /// Flow (and therefore shard) index.
        flow_id: usize,
        /// Streaming ticket from the session registry.
        ticket: FlowTicket,
    },
}

/// Server lifecycle owner and command family.
pub struct ServerFamily {
    config: RuntimeConfig,
    registry: CommandRegistry,
    coordinator: Arc<TxCoordinator>,
    global_state: GlobalStateOwner,
    start_time_secs: u64,
    last_save_info: Mutex<Arc<LastSaveInfo>>,
    is_saving: Arc<AtomicBool>,
    script_mgr: ScriptMgr,
    journal: Arc<Journal>,
    dfly_cmd: DflyCmd,
    replica: tokio::sync::Mutex<Option<Arc<Replica>>>,
    snapshot_done: Arc<Done>,
    snapshot_fiber: Mutex<Option<FiberHandle>>,
    load_fiber: Mutex<Option<FiberHandle>>,
    stats_task: Mutex<Option<u64>>,
    heartbeat_tasks: Mutex<Vec<u64>>,
    used_mem_current: AtomicU64,
    used_mem_peak: AtomicU64,
    shutdown_signal: Arc<Done>,
    connections: Mutex<HashMap<u64, ClientInfo>>,
    data_dir: Mutex<PathBuf>,
}

impl std::fmt::Debug for ServerFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerFamily")
            .field("shards", &self.coordinator.shard_set().size().get())
            .field("state", &self.global_state.current())
            .finish_non_exhaustive()
    }
}

/// Current wall clock in unix seconds.
#[must_use]
pub fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
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

fn resolve_data_dir(config: &RuntimeConfig) -> PathBuf {
    if config.dir.is_empty() {
        return std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    }
    let configured = PathBuf::from(&config.dir);
    std::fs::canonicalize(&configured).unwrap_or(configured)
}

/// Encodes one frame back into RESP array form for journal payloads.
#[must_use]
pub fn frame_to_resp(frame: &CommandFrame) -> Vec<u8> {
    let mut output = format!("*{}\r\n", frame.args.len() + 1).into_bytes();
    output.extend_from_slice(format!("${}\r\n", frame.name.len()).as_bytes());
    output.extend_from_slice(frame.name.as_bytes());
    output.extend_from_slice(b"\r\n");
    for arg in &frame.args {
        output.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        output.extend_from_slice(arg);
        output.extend_from_slice(b"\r\n");
    }
    output
}

fn register_server_commands(registry: &mut CommandRegistry) {
    let replica_opts = CommandFlags::ADMIN | CommandFlags::GLOBAL_TRANS;
    let mem_opts = CommandFlags::LOADING
        | CommandFlags::READONLY
        | CommandFlags::FAST
        | CommandFlags::NOSCRIPT;

    for id in [
        CommandId::new(
            "AUTH",
            CommandFlags::NOSCRIPT | CommandFlags::FAST | CommandFlags::LOADING,
            -2,
        ),
        CommandId::new("BGSAVE", CommandFlags::ADMIN | CommandFlags::GLOBAL_TRANS, 1),
        CommandId::new("CLIENT", CommandFlags::NOSCRIPT | CommandFlags::LOADING, -2),
        CommandId::new("CONFIG", CommandFlags::ADMIN, -2),
        CommandId::new(
            "DBSIZE",
            CommandFlags::READONLY | CommandFlags::FAST | CommandFlags::LOADING,
            1,
        ),
        CommandId::new("DEBUG", CommandFlags::ADMIN | CommandFlags::LOADING, -2),
        CommandId::new("FLUSHDB", CommandFlags::WRITE | CommandFlags::GLOBAL_TRANS, 1),
        CommandId::new(
            "FLUSHALL",
            CommandFlags::WRITE | CommandFlags::GLOBAL_TRANS,
            -1,
        ),
        CommandId::new("INFO", CommandFlags::LOADING, -1),
        CommandId::new("HELLO", CommandFlags::LOADING, -1),
        CommandId::new("LASTSAVE", CommandFlags::LOADING | CommandFlags::FAST, 1),
        CommandId::new(
            "LATENCY",
            CommandFlags::NOSCRIPT | CommandFlags::LOADING | CommandFlags::FAST,
            -2,
        ),
        CommandId::new("MEMORY", mem_opts, -2),
        CommandId::new("SAVE", CommandFlags::ADMIN | CommandFlags::GLOBAL_TRANS, -1),
        CommandId::new(
            "SHUTDOWN",
            CommandFlags::ADMIN | CommandFlags::NOSCRIPT | CommandFlags::LOADING,
            1,
        ),
        CommandId::new("SLAVEOF", replica_opts, 3),
        CommandId::new("REPLICAOF", replica_opts, 3),
        CommandId::new("REPLCONF", CommandFlags::ADMIN | CommandFlags::LOADING, -1),
        CommandId::new(
            "ROLE",
            CommandFlags::LOADING | CommandFlags::FAST | CommandFlags::NOSCRIPT,
            1,
        ),
        CommandId::new("SCRIPT", CommandFlags::NOSCRIPT, -2),
        CommandId::new("DFLY", CommandFlags::ADMIN | CommandFlags::GLOBAL_TRANS, -2),
        CommandId::new(
            "QUIT",
            CommandFlags::FAST | CommandFlags::LOADING | CommandFlags::NOSCRIPT,
            1,
        ),
    ] {
        registry.register(id);
    }
}

impl ServerFamily {
    /// Builds the family over one coordinator.
    #[must_use]
    pub fn new(config: RuntimeConfig, coordinator: Arc<TxCoordinator>) -> Arc<Self> {
        let mut registry = CommandRegistry::new();
        register_data_commands(&mut registry);
        register_server_commands(&mut registry);

        let start_time_secs = unix_time_secs();
        let data_dir = resolve_data_dir(&config);
        Arc::new(Self {
            config,
            registry,
            coordinator,
            global_state: GlobalStateOwner::new(),
            start_time_secs,
            last_save_info: Mutex::new(Arc::new(LastSaveInfo {
                save_time: start_time_secs,
                file_name: String::new(),
                freq_map: Vec::new(),
            })),
            is_saving: Arc::new(AtomicBool::new(false)),
            script_mgr: ScriptMgr::new(),
            journal: Arc::new(Journal::new()),
            dfly_cmd: DflyCmd::new(),
            replica: tokio::sync::Mutex::new(None),
            snapshot_done: Arc::new(Done::new()),
            snapshot_fiber: Mutex::new(None),
            load_fiber: Mutex::new(None),
            stats_task: Mutex::new(None),
            heartbeat_tasks: Mutex::new(Vec::new()),
            used_mem_current: AtomicU64::new(0),
            used_mem_peak: AtomicU64::new(0),
            shutdown_signal: Arc::new(Done::new()),
            connections: Mutex::new(HashMap::new()),
            data_dir: Mutex::new(data_dir),
        })
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The transaction coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<TxCoordinator> {
        &self.coordinator
    }

    /// The change-log journal.
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// The inbound replication session registry.
    #[must_use]
    pub fn dfly_cmd(&self) -> &DflyCmd {
        &self.dfly_cmd
    }

    /// The script corpus store.
    #[must_use]
    pub fn script_mgr(&self) -> &ScriptMgr {
        &self.script_mgr
    }

    /// Fired when `SHUTDOWN` was requested.
    #[must_use]
    pub fn shutdown_signal(&self) -> &Arc<Done> {
        &self.shutdown_signal
    }

    /// The auxiliary reactor (last in the pool) hosting background fibers.
    #[must_use]
    pub fn aux_reactor(&self) -> u16 {
        self.coordinator.shard_set().pool().size().saturating_sub(1)
    }

    /// Current global lifecycle state.
    #[must_use]
    pub fn global_state(&self) -> GlobalState {
        self.global_state.current()
    }

    /// Brings the instance up: boot load, background tasks, heartbeats.
    ///
    /// # Errors
    ///
    /// Returns reactor dispatch failures from background task registration.
    pub fn init(self: &Arc<Self>) -> DarterResult<()> {
        let shard_set = self.coordinator.shard_set();

        let data_dir = self.data_dir();
        info!(dir = %data_dir.display(), "data directory");

        if let Some(source) =
            darter_storage::files::infer_load_file(&data_dir, &self.config.dbfilename)
        {
            self.spawn_boot_load(source)?;
        }

        // Single-thread aggregation of per-shard cached memory, unlike the
        // per-shard heartbeats.
        let stats_family = Arc::clone(self);
        let stats_shard_set = Arc::clone(shard_set);
        let period = Duration::from_millis(self.config.stats_period_ms());
        let stats_id = shard_set.pool().add_periodic(self.aux_reactor(), period, move || {
            let sum = stats_shard_set.cached_used_memory_total();
            stats_family.used_mem_current.store(sum, Ordering::Relaxed);
            // Single writer, so no races.
            if sum > stats_family.used_mem_peak.load(Ordering::Relaxed) {
                stats_family.used_mem_peak.store(sum, Ordering::Relaxed);
            }
        })?;
        *self
            .stats_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(stats_id);

        // One QPS window roll per second on every reactor.
        for reactor in 0..shard_set.pool().size() {
            let id = shard_set.pool().add_periodic(
                reactor,
                Duration::from_secs(1),
                || {
                    ServerState::with_tlocal(|state| state.qps_window.roll());
                },
            )?;
            self.heartbeat_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(id);
        }

        let heartbeat_period = Duration::from_millis((1000 / self.config.hz.max(1)).max(1).into());
        let heartbeat_ids =
            shard_set.start_heartbeats(heartbeat_period, Arc::clone(&self.is_saving))?;
        self.heartbeat_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(heartbeat_ids);

        if !self.config.save_schedule.is_empty() {
            match schedule::parse_save_schedule(&self.config.save_schedule) {
                Some(spec) => self.spawn_snapshot_schedule(spec)?,
                None => warn!(
                    schedule = %self.config.save_schedule,
                    "invalid snapshot time specifier"
                ),
            }
        }
        Ok(())
    }

    /// Resolved snapshot directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tears the instance down in dependency order. Runs on the main thread.
    pub fn shutdown(self: &Arc<Self>) {
        let load_fiber = self
            .load_fiber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = load_fiber {
            handle.join_blocking();
        }

        self.snapshot_done.fire();
        let snapshot_fiber = self
            .snapshot_fiber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = snapshot_fiber {
            handle.join_blocking();
        }

        let pool = Arc::clone(self.coordinator.shard_set().pool());
        if let Some(id) = self
            .stats_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pool.cancel_periodic(id);
        }
        for id in self
            .heartbeat_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            pool.cancel_periodic(id);
        }

        if self.journal.enter_lame_duck() {
            if let Err(error) = self.journal.close() {
                warn!(error = %error, "error closing journal");
            }
        }

        let replica = self.replica.blocking_lock().take();
        if let Some(replica) = replica {
            replica.stop_blocking();
        }

        self.coordinator.shard_set().shutdown();
    }

    /// Registers one accepted connection for `CLIENT LIST`.
    pub fn register_connection(&self, info: ClientInfo) {
        let _ = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.id, info);
    }

    /// Renames one registered connection.
    pub fn set_connection_name(&self, id: u64, name: String) {
        if let Some(info) = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            info.name = name;
        }
    }

    /// Removes one closed connection.
    pub fn unregister_connection(&self, id: u64) {
        let _ = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn connection_rows(&self) -> Vec<ClientInfo> {
        let mut rows = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|info| info.id);
        rows
    }

    /// Dispatches one parsed command from a client connection.
    pub async fn execute_command(
        self: &Arc<Self>,
        cntx: &mut ConnectionContext,
        frame: CommandFrame,
    ) -> CommandExecution {
        let reply = |command_reply: CommandReply| {
            CommandExecution::Reply(Some(command_reply.to_resp_bytes()))
        };

        let Some(cid) = self.registry.find(&frame.name).copied() else {
            return reply(CommandReply::Error(format!(
                "unknown command '{}'",
                frame.name
            )));
        };
        if !cid.accepts_argc(frame.args.len() + 1) {
            return reply(CommandReply::wrong_arity(&frame.name));
        }

        if !cntx.authenticated && frame.name != "AUTH" {
            return reply(CommandReply::Error(
                "NOAUTH Authentication required.".to_owned(),
            ));
        }

        if self.global_state.current() == GlobalState::Loading && !cid.allowed_during_loading() {
            return reply(CommandReply::Error(format!(
                "{} Dragonfly is loading the dataset in memory",
                global_state_name(GlobalState::Loading)
            )));
        }

        ServerState::with_tlocal(|state| {
            state.connection_stats.command_count += 1;
            state.qps_window.add(1);
        });

        match frame.name.as_str() {
            "AUTH" => reply(self.execute_auth(cntx, &frame)),
            "BGSAVE" => reply(self.execute_save(&frame).await),
            "CLIENT" => reply(self.execute_client(cntx, &frame)),
            "CONFIG" => reply(self.execute_config(&frame).await),
            "DBSIZE" => reply(self.execute_dbsize(cntx.db_index).await),
            "DEBUG" => reply(self.execute_debug(&frame).await),
            "FLUSHDB" => reply(self.execute_flushdb(cntx.db_index, &frame).await),
            "FLUSHALL" => reply(self.execute_flushall(&frame).await),
            "INFO" => reply(self.execute_info(&frame).await),
            "HELLO" => reply(self.execute_hello(cntx, &frame).await),
            "LASTSAVE" => reply(self.execute_lastsave()),
            "LATENCY" => reply(Self::execute_latency(&frame)),
            "MEMORY" => reply(self.execute_memory(cntx.db_index, &frame).await),
            "SAVE" => reply(self.execute_save(&frame).await),
            "SHUTDOWN" => {
                self.shutdown_signal.fire();
                reply(CommandReply::ok())
            }
            "QUIT" => reply(CommandReply::ok()),
            "REPLICAOF" | "SLAVEOF" => reply(self.execute_replicaof(&frame).await),
            "REPLCONF" => match self.execute_replconf(cntx, &frame) {
                Some(command_reply) => reply(command_reply),
                None => CommandExecution::Reply(None),
            },
            "ROLE" => reply(self.execute_role().await),
            "SCRIPT" => reply(self.execute_script(&frame)),
            "SELECT" => reply(Self::execute_select(cntx, &frame)),
            "DFLY" => self.execute_dfly(&frame).await,
            "PING" => reply(Self::execute_ping(&frame)),
            "ECHO" => reply(Self::execute_echo(&frame)),
            _ => reply(self.execute_data_command(cntx.db_index, cid, frame).await),
        }
    }

    fn execute_ping(frame: &CommandFrame) -> CommandReply {
        match frame.args.first() {
            None => CommandReply::SimpleString("PONG".to_owned()),
            Some(payload) => CommandReply::BulkString(payload.clone()),
        }
    }

    fn execute_echo(frame: &CommandFrame) -> CommandReply {
        frame.args.first().map_or_else(
            || CommandReply::wrong_arity("ECHO"),
            |payload| CommandReply::BulkString(payload.clone()),
        )
    }

    fn execute_select(cntx: &mut ConnectionContext, frame: &CommandFrame) -> CommandReply {
        let Some(index) = frame
            .arg_str(0)
            .and_then(|text| text.parse::<DbIndex>().ok())
        else {
            return CommandReply::Error("value is not an integer or out of range".to_owned());
        };
        if index >= DEFAULT_DB_COUNT {
            return CommandReply::Error("DB index is out of range".to_owned());
        }
        cntx.db_index = index;
        CommandReply::ok()
    }

    /// Runs one data command through a single-hop transaction and merges the
    /// per-shard reply fragments.
    pub(crate) async fn execute_data_command(
        &self,
        db: DbIndex,
        cid: CommandId,
        frame: CommandFrame,
    ) -> CommandReply {
        if frame.name == "MSET" && frame.args.len() % 2 != 0 {
            return CommandReply::wrong_arity("MSET");
        }
        let original_keys = frame.args.clone();
        let tx = match self.coordinator.create_transaction(cid, db, frame) {
            Ok(tx) => tx,
            Err(error) => return CommandReply::Error(format!("{error}")),
        };

        let journal = Arc::clone(&self.journal);
        let results = self
            .coordinator
            .schedule_single_hop(&tx, move |hop_tx, shard| {
                let shard_frame = hop_tx.frame_in_shard(shard.shard_id());
                let now_ms = unix_time_ms();
                let execution =
                    execute_on_slice(shard.db_slice(), hop_tx.db(), &shard_frame, now_ms);
                if execution.mutated {
                    let _ = journal.append(JournalEntry {
                        txid: hop_tx.txid(),
                        shard: shard.shard_id(),
                        db: hop_tx.db(),
                        op: JournalOp::Command,
                        payload: frame_to_resp(&shard_frame),
                    });
                }
                Ok(execution)
            })
            .await;

        match results {
            Err(error) => CommandReply::Error(format!("{error}")),
            Ok(results) => self.merge_shard_replies(&tx.frame().name, &original_keys, results),
        }
    }

    fn merge_shard_replies(
        &self,
        name: &str,
        original_keys: &[Vec<u8>],
        mut results: Vec<(u16, darter_core::dispatch::ShardExecution)>,
    ) -> CommandReply {
        if results.len() == 1 {
            return results.remove(0).1.reply;
        }

        match name {
            "DEL" | "EXISTS" | "UNLINK" | "TOUCH" => {
                let mut total = 0_i64;
                for (_, execution) in results {
                    match execution.reply {
                        CommandReply::Integer(count) => total = total.saturating_add(count),
                        other @ CommandReply::Error(_) => return other,
                        _ => {
                            return CommandReply::Error(format!(
                                "internal error: {name} shard fragment was not an integer"
                            ));
                        }
                    }
                }
                CommandReply::Integer(total)
            }
            "MSET" => {
                for (_, execution) in results {
                    if let CommandReply::Error(message) = execution.reply {
                        return CommandReply::Error(message);
                    }
                }
                CommandReply::ok()
            }
            "MGET" => {
                // Per-shard fragments preserve key order within the shard;
                // walk the original keys pulling from each shard's cursor.
                let resolver = *self.coordinator.resolver();
                let mut fragments: HashMap<u16, std::collections::VecDeque<CommandReply>> =
                    HashMap::new();
                for (shard, execution) in results {
                    let CommandReply::Array(members) = execution.reply else {
                        return CommandReply::Error(
                            "internal error: MGET shard fragment was not an array".to_owned(),
                        );
                    };
                    let _ = fragments.insert(shard, members.into());
                }
                let mut merged = Vec::with_capacity(original_keys.len());
                for key in original_keys {
                    let owner = resolver.shard_for_key(key);
                    let member = fragments
                        .get_mut(&owner)
                        .and_then(std::collections::VecDeque::pop_front)
                        .unwrap_or(CommandReply::Null);
                    merged.push(member);
                }
                CommandReply::Array(merged)
            }
            _ => CommandReply::Error(format!(
                "internal error: no fragment merge rule for '{name}'"
            )),
        }
    }

    /// Flushes one database (or all of them) under a global transaction.
    pub(crate) async fn do_flush(&self, db: DbIndex) -> DarterResult<()> {
        let cid = CommandId::new("FLUSHALL", CommandFlags::WRITE | CommandFlags::GLOBAL_TRANS, -1);
        let tx = self
            .coordinator
            .create_transaction(cid, 0, CommandFrame::new("FLUSHALL", Vec::new()))?;
        self.coordinator.schedule(&tx)?;
        let _ = self
            .coordinator
            .execute(
                &tx,
                move |_, shard| {
                    shard.db_slice().flush_db(db);
                    Ok(())
                },
                true,
            )
            .await?;
        Ok(())
    }

    async fn execute_flushdb(&self, db: DbIndex, frame: &CommandFrame) -> CommandReply {
        if !frame.args.is_empty() {
            return CommandReply::wrong_arity("FLUSHDB");
        }
        match self.do_flush(db).await {
            Ok(()) => CommandReply::ok(),
            Err(error) => CommandReply::Error(format!("{error}")),
        }
    }

    async fn execute_flushall(&self, frame: &CommandFrame) -> CommandReply {
        if !frame.args.is_empty() {
            return CommandReply::Error("syntax error".to_owned());
        }
        match self.do_flush(DB_ALL).await {
            Ok(()) => CommandReply::ok(),
            Err(error) => CommandReply::Error(format!("{error}")),
        }
    }

    async fn execute_dfly(self: &Arc<Self>, frame: &CommandFrame) -> CommandExecution {
        let reply = |command_reply: CommandReply| {
            CommandExecution::Reply(Some(command_reply.to_resp_bytes()))
        };
        let Some(subcommand) = frame.arg_str(0).map(str::to_ascii_uppercase) else {
            return reply(CommandReply::Error(
                "DFLY subcommand must be valid UTF-8".to_owned(),
            ));
        };

        match subcommand.as_str() {
            "FLOW" => self.execute_dfly_flow(frame),
            "SYNC" => reply(self.execute_dfly_sync(frame).await),
            other => reply(CommandReply::Error(format!(
                "unknown DFLY subcommand '{other}'"
            ))),
        }
    }

    /// `DFLY FLOW <master_repl_id> <session_id> <flow_id>`.
    fn execute_dfly_flow(&self, frame: &CommandFrame) -> CommandExecution {
        let reply = |command_reply: CommandReply| {
            CommandExecution::Reply(Some(command_reply.to_resp_bytes()))
        };
        if frame.args.len() != 4 {
            return reply(CommandReply::wrong_arity("DFLY FLOW"));
        }
        let (Some(master_id), Some(sync_id), Some(flow_text)) =
            (frame.arg_str(1), frame.arg_str(2), frame.arg_str(3))
        else {
            return reply(CommandReply::Error(
                "DFLY FLOW arguments must be valid UTF-8".to_owned(),
            ));
        };
        let Ok(flow_id) = flow_text.parse::<usize>() else {
            return reply(CommandReply::Error(
                "value is not an integer or out of range".to_owned(),
            ));
        };
        if flow_id >= self.coordinator.shard_set().size().as_usize() {
            return reply(CommandReply::Error(
                "value is not an integer or out of range".to_owned(),
            ));
        }

        match self.dfly_cmd.register_flow(master_id, sync_id, flow_id) {
            Ok(ticket) => CommandExecution::StartDflyFlow {
                sync_id: sync_id.to_owned(),
                flow_id,
                ticket,
            },
            Err(error_reply) => reply(error_reply),
        }
    }

    /// `DFLY SYNC <session_id>`: pins the consistent cut on every shard and
    /// releases the registered flows.
    async fn execute_dfly_sync(self: &Arc<Self>, frame: &CommandFrame) -> CommandReply {
        if frame.args.len() != 2 {
            return CommandReply::wrong_arity("DFLY SYNC");
        }
        let Some(sync_id) = frame.arg_str(1).map(str::to_owned) else {
            return CommandReply::Error("DFLY SYNC sync id must be valid UTF-8".to_owned());
        };
        if let Err(error_reply) = self.dfly_cmd.mark_full_sync(&sync_id) {
            return error_reply;
        }

        let cid = CommandId::new("DFLY", CommandFlags::ADMIN | CommandFlags::GLOBAL_TRANS, -2);
        let tx = match self.coordinator.create_transaction(
            cid,
            0,
            CommandFrame::new("DFLY", vec![b"SYNC".to_vec()]),
        ) {
            Ok(tx) => tx,
            Err(error) => return CommandReply::Error(format!("{error}")),
        };

        let family = Arc::clone(self);
        let capture_sync_id = sync_id.clone();
        let capture = self
            .coordinator
            .schedule_single_hop(&tx, move |_, shard| {
                let records = shard.db_slice_ref().capture_records(unix_time_ms());
                family
                    .dfly_cmd
                    .store_capture(&capture_sync_id, shard.shard_id(), records);
                Ok(())
            })
            .await;
        if let Err(error) = capture {
            return CommandReply::Error(format!("{error}"));
        }

        self.dfly_cmd.start_session(&sync_id);
        CommandReply::ok()
    }
}
