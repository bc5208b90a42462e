//! `INFO`, metrics aggregation, and the smaller server-family handlers.

use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use darter_core::command::{CommandFrame, CommandReply};
use darter_core::db_slice::DbTableStats;
use darter_facade::connection::ConnectionContext;
use tracing::debug;

use crate::metrics::Metrics;
use crate::server_state::ServerState;

use super::{ServerFamily, unix_time_secs};

fn unknown_sub_cmd(sub_cmd: &str, cmd: &str) -> CommandReply {
    CommandReply::Error(format!(
        "Unknown subcommand or wrong number of arguments for '{sub_cmd}'. Try {cmd} HELP."
    ))
}

impl ServerFamily {
    /// Aggregates metrics across every reactor and shard.
    pub async fn get_metrics(&self) -> Metrics {
        let shard_set = self.coordinator.shard_set();

        let collected: Arc<Mutex<Metrics>> = Arc::new(Mutex::new(Metrics::default()));
        let sink = Arc::clone(&collected);
        let _ = shard_set
            .await_fiber_on_all(move |_| {
                ServerState::with_tlocal(|state| {
                    let mut metrics = sink.lock().unwrap_or_else(PoisonError::into_inner);
                    metrics.conn_stats.merge(&state.connection_stats);
                    metrics.qps += state.qps_window.sum();
                });
            })
            .await;

        let shard_stats = shard_set
            .run_brief_in_parallel(
                |shard| {
                    let slice = shard.db_slice_ref();
                    (slice.stats(), slice.events(), slice.used_memory())
                },
                |_| true,
            )
            .await
            .unwrap_or_default();

        let mut metrics = collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (_, (db_stats, events, used_memory)) in shard_stats {
            if db_stats.len() > metrics.db.len() {
                metrics.db.resize(db_stats.len(), DbTableStats::default());
            }
            for (index, stats) in db_stats.iter().enumerate() {
                metrics.db[index].merge(stats);
            }
            metrics.expired_keys += events.expired_keys;
            metrics.heap_used_bytes += used_memory;
        }
        metrics.uptime_secs = unix_time_secs().saturating_sub(self.start_time_secs);
        // Normalize the moving-window sum into a per-second rate.
        metrics.qps /= 6;
        metrics
    }

    /// Peak of the cached used-memory aggregate.
    #[must_use]
    pub fn used_mem_peak(&self) -> u64 {
        self.used_mem_peak.load(Ordering::Relaxed)
    }

    pub(crate) fn execute_auth(
        &self,
        cntx: &mut ConnectionContext,
        frame: &CommandFrame,
    ) -> CommandReply {
        if frame.args.len() > 2 {
            return CommandReply::Error("syntax error".to_owned());
        }
        if frame.args.len() == 2 {
            return CommandReply::Error("ACL is not supported yet".to_owned());
        }
        if self.config.requirepass.is_empty() {
            return CommandReply::Error(
                "AUTH <password> called without any password configured for the default user. \
                 Are you sure your configuration is correct?"
                    .to_owned(),
            );
        }

        let supplied = frame.arg_str(0).unwrap_or_default();
        if supplied == self.config.requirepass {
            cntx.authenticated = true;
            CommandReply::ok()
        } else {
            CommandReply::Error("WRONGPASS invalid username-password pair".to_owned())
        }
    }

    pub(crate) fn execute_client(
        &self,
        cntx: &mut ConnectionContext,
        frame: &CommandFrame,
    ) -> CommandReply {
        let Some(sub_cmd) = frame.arg_str(0).map(str::to_ascii_uppercase) else {
            return CommandReply::Error("CLIENT subcommand must be valid UTF-8".to_owned());
        };

        if sub_cmd == "SETNAME" && frame.args.len() == 2 {
            let Some(name) = frame.arg_str(1).map(str::to_owned) else {
                return CommandReply::Error("CLIENT SETNAME name must be valid UTF-8".to_owned());
            };
            cntx.name = name.clone();
            self.set_connection_name(cntx.client_id, name);
            return CommandReply::ok();
        }

        if sub_cmd == "LIST" {
            let mut listing = String::new();
            for info in self.connection_rows() {
                let _ = writeln!(listing, "id={} addr={} name={}", info.id, info.addr, info.name);
            }
            return CommandReply::BulkString(listing.into_bytes());
        }

        unknown_sub_cmd(&sub_cmd, "CLIENT")
    }

    pub(crate) async fn execute_config(&self, frame: &CommandFrame) -> CommandReply {
        let Some(sub_cmd) = frame.arg_str(0).map(str::to_ascii_uppercase) else {
            return CommandReply::Error("CONFIG subcommand must be valid UTF-8".to_owned());
        };

        match sub_cmd.as_str() {
            "SET" => CommandReply::ok(),
            "GET" if frame.args.len() == 2 => {
                let Some(param) = frame.arg_str(1).map(str::to_ascii_lowercase) else {
                    return CommandReply::Error("CONFIG GET param must be valid UTF-8".to_owned());
                };
                let value = match param.as_str() {
                    "dir" => self.config.dir.clone(),
                    "dbfilename" => self.config.dbfilename.clone(),
                    "requirepass" => self.config.requirepass.clone(),
                    "save_schedule" => self.config.save_schedule.clone(),
                    "port" => self.config.port.to_string(),
                    "hz" => self.config.hz.to_string(),
                    _ => "tbd".to_owned(),
                };
                CommandReply::Array(vec![
                    CommandReply::BulkString(param.into_bytes()),
                    CommandReply::BulkString(value.into_bytes()),
                ])
            }
            "RESETSTAT" => {
                let _ = self
                    .coordinator
                    .shard_set()
                    .await_fiber_on_all(|_| {
                        ServerState::with_tlocal(|state| {
                            state.connection_stats.command_count = 0;
                            state.connection_stats.io_read_bytes = 0;
                            state.connection_stats.io_write_bytes = 0;
                            state.connection_stats.parser_err_count = 0;
                        });
                    })
                    .await;
                CommandReply::ok()
            }
            _ => unknown_sub_cmd(&sub_cmd, "CONFIG"),
        }
    }

    pub(crate) async fn execute_dbsize(&self, db: u16) -> CommandReply {
        let sizes = self
            .coordinator
            .shard_set()
            .run_brief_in_parallel(move |shard| shard.db_slice_ref().db_size(db), |_| true)
            .await;
        match sizes {
            Ok(sizes) => {
                let total: u64 = sizes.iter().map(|(_, size)| size).sum();
                CommandReply::Integer(i64::try_from(total).unwrap_or(i64::MAX))
            }
            Err(error) => CommandReply::Error(format!("{error}")),
        }
    }

    pub(crate) async fn execute_debug(self: &Arc<Self>, frame: &CommandFrame) -> CommandReply {
        let Some(sub_cmd) = frame.arg_str(0).map(str::to_ascii_uppercase) else {
            return CommandReply::Error("DEBUG subcommand must be valid UTF-8".to_owned());
        };

        match sub_cmd.as_str() {
            "RELOAD" => {
                if let Err(save_error) = self.do_save(false).await {
                    return CommandReply::Error(save_error.message());
                }
                let file_name = self.last_save_info().file_name.clone();
                let source = darter_storage::files::LoadSource::Single(file_name.into());
                match self.load_rdb(source).await {
                    Ok(_) => CommandReply::ok(),
                    Err(error) => CommandReply::Error(format!("{error}")),
                }
            }
            "REPLICA" if frame.args.len() == 2 => {
                let Some(action) = frame.arg_str(1).map(str::to_ascii_uppercase) else {
                    return CommandReply::Error("DEBUG REPLICA action must be valid UTF-8".to_owned());
                };
                match action.as_str() {
                    "PAUSE" => {
                        self.pause_replication(true).await;
                        CommandReply::ok()
                    }
                    "RESUME" => {
                        self.pause_replication(false).await;
                        CommandReply::ok()
                    }
                    _ => unknown_sub_cmd(&action, "DEBUG REPLICA"),
                }
            }
            _ => unknown_sub_cmd(&sub_cmd, "DEBUG"),
        }
    }

    pub(crate) fn execute_lastsave(&self) -> CommandReply {
        CommandReply::Integer(i64::try_from(self.last_save_info().save_time).unwrap_or(i64::MAX))
    }

    pub(crate) fn execute_latency(frame: &CommandFrame) -> CommandReply {
        let Some(sub_cmd) = frame.arg_str(0).map(str::to_ascii_uppercase) else {
            return CommandReply::Error("LATENCY subcommand must be valid UTF-8".to_owned());
        };
        if sub_cmd == "LATEST" {
            return CommandReply::Array(Vec::new());
        }
        debug!(sub_cmd = %sub_cmd, "unsupported LATENCY subcommand");
        CommandReply::Error("syntax error".to_owned())
    }

    pub(crate) async fn execute_memory(&self, db: u16, frame: &CommandFrame) -> CommandReply {
        let Some(sub_cmd) = frame.arg_str(0).map(str::to_ascii_uppercase) else {
            return CommandReply::Error("MEMORY subcommand must be valid UTF-8".to_owned());
        };
        if sub_cmd != "USAGE" || frame.args.len() != 2 {
            return unknown_sub_cmd(&sub_cmd, "MEMORY");
        }

        let key = frame.args[1].clone();
        let shard = self.coordinator.resolver().shard_for_key(&key);
        let usage = self
            .coordinator
            .shard_set()
            .run_on_shard(shard, move |engine_shard| {
                engine_shard
                    .db_slice()
                    .get(db, &key, super::unix_time_ms())
                    .map(|entry| key.len() + entry.value.len())
            })
            .await;
        match usage {
            Ok(Some(bytes)) => CommandReply::Integer(i64::try_from(bytes).unwrap_or(i64::MAX)),
            Ok(None) => CommandReply::Null,
            Err(error) => CommandReply::Error(format!("{error}")),
        }
    }

    pub(crate) async fn execute_hello(
        &self,
        cntx: &ConnectionContext,
        frame: &CommandFrame,
    ) -> CommandReply {
        // Only protover 2 exists; anything else degrades to unknown-command
        // so clients fall back to RESP2 and explicit AUTH.
        if !frame.args.is_empty() {
            let proto = frame.arg_str(0).unwrap_or_default();
            if proto != "2" || frame.args.len() > 1 {
                return CommandReply::Error(format!(
                    "unknown command 'HELLO' with args beginning with: {proto}"
                ));
            }
        }

        let is_master = ServerState::with_tlocal(|state| state.is_master);
        CommandReply::Array(vec![
            CommandReply::BulkString(b"server".to_vec()),
            CommandReply::BulkString(b"redis".to_vec()),
            CommandReply::BulkString(b"version".to_vec()),
            CommandReply::BulkString(env!("CARGO_PKG_VERSION").as_bytes().to_vec()),
            CommandReply::BulkString(b"proto".to_vec()),
            CommandReply::Integer(2),
            CommandReply::BulkString(b"id".to_vec()),
            CommandReply::Integer(i64::try_from(cntx.client_id).unwrap_or(i64::MAX)),
            CommandReply::BulkString(b"mode".to_vec()),
            CommandReply::BulkString(b"standalone".to_vec()),
            CommandReply::BulkString(b"role".to_vec()),
            CommandReply::BulkString(if is_master { b"master".to_vec() } else { b"slave".to_vec() }),
        ])
    }

    pub(crate) fn execute_replconf(
        &self,
        cntx: &mut ConnectionContext,
        frame: &CommandFrame,
    ) -> Option<CommandReply> {
        if frame.args.len() % 2 != 0 {
            return Some(CommandReply::Error("syntax error".to_owned()));
        }

        // `CAPA dragonfly` as the sole option reserves a native sync session.
        if frame.args.len() == 2
            && frame.args[0].eq_ignore_ascii_case(b"CAPA")
            && frame.args[1].eq_ignore_ascii_case(b"dragonfly")
        {
            let shard_count = self.coordinator.shard_set().size();
            let sync_id = self.dfly_cmd.allocate_session(shard_count.as_usize());
            cntx.replica_conn = true;
            cntx.name = format!("repl_ctrl_{}", sync_id.trim_start_matches("SYNC"));
            return Some(CommandReply::Array(vec![
                CommandReply::SimpleString(self.dfly_cmd.master_replid()),
                CommandReply::SimpleString(sync_id),
                CommandReply::Integer(i64::from(shard_count.get())),
            ]));
        }

        for pair in frame.args.chunks_exact(2) {
            if pair[0].eq_ignore_ascii_case(b"ACK") {
                // Ack replies would interleave with the journal stream.
                return None;
            }
            debug!(
                option = %String::from_utf8_lossy(&pair[0]),
                value = %String::from_utf8_lossy(&pair[1]),
                "replconf option recorded"
            );
        }
        Some(CommandReply::ok())
    }

    pub(crate) async fn execute_role(&self) -> CommandReply {
        let is_master = ServerState::with_tlocal(|state| state.is_master);
        if is_master {
            return CommandReply::Array(vec![
                CommandReply::BulkString(b"master".to_vec()),
                CommandReply::Integer(0),
                CommandReply::Array(Vec::new()),
            ]);
        }

        let replica = self.replica.lock().await.clone();
        match replica {
            Some(replica) => {
                let link = replica.get_info();
                CommandReply::Array(vec![
                    CommandReply::BulkString(b"slave".to_vec()),
                    CommandReply::BulkString(link.host.into_bytes()),
                    CommandReply::Integer(i64::from(link.port)),
                    CommandReply::BulkString(
                        if link.master_link_established {
                            b"connected".to_vec()
                        } else {
                            b"connect".to_vec()
                        },
                    ),
                ])
            }
            None => CommandReply::Array(vec![
                CommandReply::BulkString(b"master".to_vec()),
                CommandReply::Integer(0),
                CommandReply::Array(Vec::new()),
            ]),
        }
    }

    pub(crate) fn execute_script(&self, frame: &CommandFrame) -> CommandReply {
        let Some(sub_cmd) = frame.arg_str(0).map(str::to_ascii_uppercase) else {
            return CommandReply::Error("SCRIPT subcommand must be valid UTF-8".to_owned());
        };

        match sub_cmd.as_str() {
            "LOAD" if frame.args.len() == 2 => {
                let Some(body) = frame.arg_str(1) else {
                    return CommandReply::Error("SCRIPT LOAD body must be valid UTF-8".to_owned());
                };
                CommandReply::BulkString(self.script_mgr.load(body).into_bytes())
            }
            "EXISTS" if frame.args.len() >= 2 => {
                let replies = frame.args[1..]
                    .iter()
                    .map(|raw| {
                        let known = std::str::from_utf8(raw)
                            .is_ok_and(|id| self.script_mgr.exists(id));
                        CommandReply::Integer(i64::from(known))
                    })
                    .collect();
                CommandReply::Array(replies)
            }
            _ => unknown_sub_cmd(&sub_cmd, "SCRIPT"),
        }
    }

    /// `INFO [section]`.
    pub(crate) async fn execute_info(&self, frame: &CommandFrame) -> CommandReply {
        if frame.args.len() > 1 {
            return CommandReply::Error("syntax error".to_owned());
        }
        let section = frame
            .arg_str(0)
            .map(str::to_ascii_uppercase)
            .unwrap_or_default();

        let metrics = self.get_metrics().await;
        let mut output = String::new();
        let should_enter = |name: &str, hidden: bool, output: &mut String| {
            let entered =
                (!hidden && section.is_empty()) || section == "ALL" || section == name;
            if entered && !output.is_empty() {
                output.push_str("\r\n");
            }
            entered
        };
        let append = |output: &mut String, key: &str, value: &dyn std::fmt::Display| {
            let _ = write!(output, "{key}:{value}\r\n");
        };

        if should_enter("SERVER", false, &mut output) {
            output.push_str("# Server\r\n");
            append(&mut output, "redis_version", &env!("CARGO_PKG_VERSION"));
            append(&mut output, "redis_mode", &"standalone");
            append(&mut output, "arch_bits", &64);
            append(&mut output, "tcp_port", &self.config.port);
            append(&mut output, "uptime_in_seconds", &metrics.uptime_secs);
            append(
                &mut output,
                "uptime_in_days",
                &(metrics.uptime_secs / (3600 * 24)),
            );
        }

        if should_enter("CLIENTS", false, &mut output) {
            output.push_str("# Clients\r\n");
            append(&mut output, "connected_clients", &metrics.conn_stats.num_conns);
        }

        if should_enter("MEMORY", false, &mut output) {
            output.push_str("# Memory\r\n");
            append(&mut output, "used_memory", &metrics.heap_used_bytes);
            append(
                &mut output,
                "used_memory_cached",
                &self.used_mem_current.load(Ordering::Relaxed),
            );
            append(&mut output, "used_memory_peak", &self.used_mem_peak());
            append(
                &mut output,
                "cache_mode",
                &if self.config.cache_mode { "cache" } else { "store" },
            );
        }

        if should_enter("STATS", false, &mut output) {
            output.push_str("# Stats\r\n");
            append(&mut output, "instantaneous_ops_per_sec", &metrics.qps);
            append(
                &mut output,
                "total_commands_processed",
                &metrics.conn_stats.command_count,
            );
            append(
                &mut output,
                "total_net_input_bytes",
                &metrics.conn_stats.io_read_bytes,
            );
            append(
                &mut output,
                "total_net_output_bytes",
                &metrics.conn_stats.io_write_bytes,
            );
            append(&mut output, "expired_keys", &metrics.expired_keys);
            append(
                &mut output,
                "parser_err_count",
                &metrics.conn_stats.parser_err_count,
            );
        }

        if should_enter("PERSISTENCE", true, &mut output) {
            output.push_str("# PERSISTENCE\r\n");
            let loading = i32::from(self.global_state() == crate::server_state::GlobalState::Loading);
            append(&mut output, "loading", &loading);
            let save_info = self.last_save_info();
            append(&mut output, "last_save", &save_info.save_time);
            append(&mut output, "last_save_file", &save_info.file_name);
            for (type_name, count) in &save_info.freq_map {
                append(&mut output, &format!("rdb_{type_name}"), count);
            }
        }

        if should_enter("REPLICATION", false, &mut output) {
            output.push_str("# Replication\r\n");
            let is_master = ServerState::with_tlocal(|state| state.is_master);
            if is_master {
                append(&mut output, "role", &"master");
                append(&mut output, "master_replid", &self.dfly_cmd.master_replid());
            } else {
                append(&mut output, "role", &"slave");
                let replica = self.replica.lock().await.clone();
                if let Some(replica) = replica {
                    let link = replica.get_info();
                    append(&mut output, "master_host", &link.host);
                    append(&mut output, "master_port", &link.port);
                    append(
                        &mut output,
                        "master_link_status",
                        &if link.master_link_established { "up" } else { "down" },
                    );
                    append(
                        &mut output,
                        "master_last_io_seconds_ago",
                        &link.master_last_io_sec,
                    );
                    append(
                        &mut output,
                        "master_sync_in_progress",
                        &u8::from(link.sync_in_progress),
                    );
                }
            }
        }

        if should_enter("KEYSPACE", false, &mut output) {
            output.push_str("# Keyspace\r\n");
            for (index, stats) in metrics.db.iter().enumerate() {
                if index == 0 || stats.key_count > 0 {
                    let _ = write!(
                        output,
                        "db{index}:keys={},expires={},avg_ttl=-1\r\n",
                        stats.key_count, stats.expire_count
                    );
                }
            }
        }

        CommandReply::BulkString(output.into_bytes())
    }
}
