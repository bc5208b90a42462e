use std::sync::Arc;
use std::time::Duration;

use darter_common::config::RuntimeConfig;
use darter_common::ids::ShardCount;
use darter_engine::shard_set::EngineShardSet;
use darter_facade::connection::ConnectionContext;
use darter_facade::proactor::ProactorPool;
use darter_transaction::coordinator::TxCoordinator;
use googletest::prelude::*;
use rstest::rstest;

use crate::server_state::GlobalState;

use super::{CommandExecution, ServerFamily};
use darter_core::command::CommandFrame;

struct TestServer {
    family: Arc<ServerFamily>,
    runtime: tokio::runtime::Runtime,
    _data_dir: tempfile::TempDir,
}

fn test_server(shards: u16) -> TestServer {
    test_server_with_config(shards, |_| {})
}

fn test_server_with_config(shards: u16, adjust: impl FnOnce(&mut RuntimeConfig)) -> TestServer {
    let data_dir = tempfile::tempdir().expect("tempdir must create");
    let mut config = RuntimeConfig {
        shard_count: ShardCount::new(shards).expect("literal is valid"),
        dir: data_dir.path().to_string_lossy().into_owned(),
        ..RuntimeConfig::default()
    };
    adjust(&mut config);

    let pool = Arc::new(ProactorPool::new(shards + 1));
    let shard_set =
        Arc::new(EngineShardSet::new(pool, config.shard_count).expect("shard set must install"));
    let coordinator = Arc::new(TxCoordinator::new(shard_set));
    let family = ServerFamily::new(config, coordinator);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime must build");
    TestServer {
        family,
        runtime,
        _data_dir: data_dir,
    }
}

fn frame(name: &str, args: &[&str]) -> CommandFrame {
    CommandFrame::new(
        name.to_ascii_uppercase(),
        args.iter().map(|arg| arg.as_bytes().to_vec()).collect(),
    )
}

impl TestServer {
    fn exec(&self, cntx: &mut ConnectionContext, name: &str, args: &[&str]) -> Vec<u8> {
        let execution = self
            .runtime
            .block_on(self.family.execute_command(cntx, frame(name, args)));
        match execution {
            CommandExecution::Reply(Some(bytes)) => bytes,
            CommandExecution::Reply(None) => Vec::new(),
            CommandExecution::StartDflyFlow { .. } => panic!("unexpected flow handover"),
        }
    }

    fn exec_default(&self, name: &str, args: &[&str]) -> Vec<u8> {
        let mut cntx = ConnectionContext::default();
        self.exec(&mut cntx, name, args)
    }

    fn snapshot_files(&self, extension: &str) -> Vec<String> {
        let mut names = std::fs::read_dir(self._data_dir.path())
            .expect("data dir must list")
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(extension))
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

#[rstest]
fn set_get_round_trip_through_dispatch() {
    let server = test_server(4);
    assert_that!(
        server.exec_default("SET", &["k", "v"]),
        eq(&b"+OK\r\n".to_vec())
    );
    assert_that!(
        server.exec_default("GET", &["k"]),
        eq(&b"$1\r\nv\r\n".to_vec())
    );
    assert_that!(
        server.exec_default("GET", &["missing"]),
        eq(&b"$-1\r\n".to_vec())
    );
}

#[rstest]
fn unknown_command_and_wrong_arity_are_reported() {
    let server = test_server(2);
    assert_that!(
        server.exec_default("NOSUCH", &[]),
        eq(&b"-ERR unknown command 'NOSUCH'\r\n".to_vec())
    );
    assert_that!(
        server.exec_default("GET", &[]),
        eq(&b"-ERR wrong number of arguments for 'GET' command\r\n".to_vec())
    );
}

#[rstest]
fn select_switches_logical_database() {
    let server = test_server(2);
    let mut cntx = ConnectionContext::default();
    let _ = server.exec(&mut cntx, "SET", &["k", "one"]);

    assert_that!(server.exec(&mut cntx, "SELECT", &["3"]), eq(&b"+OK\r\n".to_vec()));
    assert_that!(cntx.db_index, eq(3_u16));
    assert_that!(server.exec(&mut cntx, "GET", &["k"]), eq(&b"$-1\r\n".to_vec()));

    let _ = server.exec(&mut cntx, "SELECT", &["0"]);
    assert_that!(server.exec(&mut cntx, "GET", &["k"]), eq(&b"$3\r\none\r\n".to_vec()));

    assert_that!(
        server.exec(&mut cntx, "SELECT", &["99"]),
        eq(&b"-ERR DB index is out of range\r\n".to_vec())
    );
}

#[rstest]
fn mget_preserves_key_order_across_shards() {
    let server = test_server(4);
    for index in 0..8 {
        let key = format!("key:{index}");
        let value = format!("value:{index}");
        let _ = server.exec_default("SET", &[&key, &value]);
    }

    let keys = (0..8).map(|index| format!("key:{index}")).collect::<Vec<_>>();
    let key_refs = keys.iter().map(String::as_str).collect::<Vec<_>>();
    let reply = server.exec_default("MGET", &key_refs);

    let mut expected = b"*8\r\n".to_vec();
    for index in 0..8 {
        let value = format!("value:{index}");
        expected.extend_from_slice(format!("${}\r\n{value}\r\n", value.len()).as_bytes());
    }
    assert_that!(reply, eq(&expected));
}

#[rstest]
fn del_sums_removed_keys_across_shards() {
    let server = test_server(4);
    for index in 0..6 {
        let key = format!("key:{index}");
        let _ = server.exec_default("SET", &[&key, "x"]);
    }
    let reply = server.exec_default(
        "DEL",
        &["key:0", "key:1", "key:2", "key:3", "key:4", "key:5", "missing"],
    );
    assert_that!(reply, eq(&b":6\r\n".to_vec()));
}

#[rstest]
fn dbsize_counts_keys_across_shards() {
    let server = test_server(4);
    for index in 0..10 {
        let key = format!("key:{index}");
        let _ = server.exec_default("SET", &[&key, "x"]);
    }
    assert_that!(server.exec_default("DBSIZE", &[]), eq(&b":10\r\n".to_vec()));
}

#[rstest]
fn flushall_wipes_every_shard_and_database() {
    let server = test_server(4);
    let mut cntx = ConnectionContext::default();
    let _ = server.exec(&mut cntx, "SET", &["a", "1"]);
    let _ = server.exec(&mut cntx, "SELECT", &["2"]);
    let _ = server.exec(&mut cntx, "SET", &["b", "2"]);

    assert_that!(server.exec(&mut cntx, "FLUSHALL", &[]), eq(&b"+OK\r\n".to_vec()));
    assert_that!(server.exec(&mut cntx, "DBSIZE", &[]), eq(&b":0\r\n".to_vec()));
    let _ = server.exec(&mut cntx, "SELECT", &["0"]);
    assert_that!(server.exec(&mut cntx, "DBSIZE", &[]), eq(&b":0\r\n".to_vec()));
}

#[rstest]
fn auth_without_configured_password_returns_documented_error() {
    let server = test_server(2);
    let reply = server.exec_default("AUTH", &["hunter2"]);
    let text = String::from_utf8(reply).expect("reply must be UTF-8");
    assert_that!(
        text.contains("called without any password configured"),
        eq(true)
    );
}

#[rstest]
fn auth_gates_commands_until_password_matches() {
    let server = test_server_with_config(2, |config| {
        config.requirepass = "sekrit".to_owned();
    });
    let mut cntx = ConnectionContext::new(true);

    let blocked = server.exec(&mut cntx, "GET", &["k"]);
    assert_that!(
        blocked,
        eq(&b"-ERR NOAUTH Authentication required.\r\n".to_vec())
    );

    let rejected = server.exec(&mut cntx, "AUTH", &["wrong"]);
    let text = String::from_utf8(rejected).expect("reply must be UTF-8");
    assert_that!(text.contains("WRONGPASS"), eq(true));

    assert_that!(
        server.exec(&mut cntx, "AUTH", &["sekrit"]),
        eq(&b"+OK\r\n".to_vec())
    );
    assert_that!(server.exec(&mut cntx, "GET", &["k"]), eq(&b"$-1\r\n".to_vec()));
}

#[rstest]
fn hello_rejects_unsupported_protover() {
    let server = test_server(2);
    let reply = server.exec_default("HELLO", &["3"]);
    let text = String::from_utf8(reply).expect("reply must be UTF-8");
    assert_that!(text.starts_with("-ERR unknown command 'HELLO'"), eq(true));

    let accepted = server.exec_default("HELLO", &["2"]);
    assert_that!(accepted.starts_with(b"*12\r\n"), eq(true));
}

#[rstest]
fn replconf_with_odd_argc_returns_syntax_error() {
    let server = test_server(2);
    assert_that!(
        server.exec_default("REPLCONF", &["CAPA"]),
        eq(&b"-ERR syntax error\r\n".to_vec())
    );
}

#[rstest]
fn replconf_capa_dragonfly_reserves_native_session() {
    let server = test_server(4);
    let mut cntx = ConnectionContext::default();
    let reply = server.exec(&mut cntx, "REPLCONF", &["CAPA", "dragonfly"]);
    let text = String::from_utf8(reply).expect("reply must be UTF-8");

    assert_that!(text.starts_with("*3\r\n"), eq(true));
    assert_that!(text.contains("+SYNC1\r\n"), eq(true));
    assert_that!(text.ends_with(":4\r\n"), eq(true));
    assert_that!(cntx.replica_conn, eq(true));

    let replid_line = text
        .lines()
        .nth(1)
        .expect("reply must carry the master id line");
    assert_that!(replid_line.len(), eq(41_usize));
}

#[rstest]
fn replconf_ack_is_consumed_silently() {
    let server = test_server(2);
    assert_that!(server.exec_default("REPLCONF", &["ACK", "128"]), eq(&Vec::new()));
}

#[rstest]
fn save_produces_timestamped_rdb_and_updates_lastsave() {
    let server = test_server(2);
    let startup_reply = server.exec_default("LASTSAVE", &[]);
    let _ = server.exec_default("SET", &["k", "v"]);

    assert_that!(server.exec_default("SAVE", &[]), eq(&b"+OK\r\n".to_vec()));

    let files = server.snapshot_files(".rdb");
    assert_that!(files.len(), eq(1_usize));
    assert_that!(files[0].starts_with("dump-"), eq(true));

    let save_info = server.family.last_save_info();
    assert_that!(save_info.file_name.ends_with(&files[0]), eq(true));
    let startup_secs = String::from_utf8(startup_reply)
        .expect("reply must be UTF-8")
        .trim_start_matches(':')
        .trim()
        .parse::<u64>()
        .expect("LASTSAVE must be an integer");
    assert_that!(save_info.save_time >= startup_secs, eq(true));
}

#[rstest]
fn save_df_produces_one_file_per_shard_with_one_timestamp() {
    let server = test_server(4);
    let _ = server.exec_default("SET", &["k", "v"]);
    assert_that!(server.exec_default("SAVE", &["DF"]), eq(&b"+OK\r\n".to_vec()));

    let files = server.snapshot_files(".dfs");
    assert_that!(files.len(), eq(4_usize));
    for (index, name) in files.iter().enumerate() {
        assert_that!(name.ends_with(&format!("-{index:04}.dfs")), eq(true));
    }
    let timestamp_of = |name: &str| name.trim_end_matches(".dfs").rsplit_once('-').map(|(prefix, _)| prefix.to_owned());
    let first_ts = timestamp_of(&files[0]);
    for name in &files {
        assert_that!(&timestamp_of(name), eq(&first_ts));
    }
}

#[rstest]
fn save_is_rejected_while_another_save_is_running() {
    let server = test_server(2);
    let observed = server
        .family
        .global_state
        .switch_state(GlobalState::Active, GlobalState::Saving);
    assert_that!(observed, eq(GlobalState::Saving));

    let reply = server.exec_default("SAVE", &[]);
    assert_that!(
        reply,
        eq(&b"-ERR SAVING - can not save database\r\n".to_vec())
    );

    let _ = server
        .family
        .global_state
        .switch_state(GlobalState::Saving, GlobalState::Active);
}

#[rstest]
fn save_df_then_flush_then_load_restores_the_keyspace() {
    let server = test_server(4);
    for index in 0..16 {
        let key = format!("key:{index}");
        let value = format!("value:{index}");
        let _ = server.exec_default("SET", &[&key, &value]);
    }
    assert_that!(server.exec_default("SAVE", &["DF"]), eq(&b"+OK\r\n".to_vec()));
    let _ = server.exec_default("FLUSHALL", &[]);
    assert_that!(server.exec_default("DBSIZE", &[]), eq(&b":0\r\n".to_vec()));

    let source = darter_storage::files::infer_load_file(&server.family.data_dir(), "dump")
        .expect("saved shard set must be discoverable");
    let stats = server
        .runtime
        .block_on(server.family.load_rdb(source))
        .expect("load must pass");
    assert_that!(stats.keys_loaded, eq(16_u64));

    assert_that!(server.exec_default("DBSIZE", &[]), eq(&b":16\r\n".to_vec()));
    assert_that!(
        server.exec_default("GET", &["key:7"]),
        eq(&b"$7\r\nvalue:7\r\n".to_vec())
    );
}

#[rstest]
fn replicaof_no_one_when_master_is_a_noop_ok() {
    let server = test_server(2);
    assert_that!(
        server.exec_default("REPLICAOF", &["NO", "ONE"]),
        eq(&b"+OK\r\n".to_vec())
    );
    let _ = server.exec_default("SET", &["still", "master"]);
    assert_that!(
        server.exec_default("GET", &["still"]),
        eq(&b"$6\r\nmaster\r\n".to_vec())
    );
}

#[rstest]
fn lastsave_is_loading_tolerant_while_data_commands_are_gated() {
    let server = test_server(2);
    let observed = server
        .family
        .global_state
        .switch_state(GlobalState::Active, GlobalState::Loading);
    assert_that!(observed, eq(GlobalState::Loading));

    let gated = server.exec_default("SET", &["k", "v"]);
    let text = String::from_utf8(gated).expect("reply must be UTF-8");
    assert_that!(text.contains("LOADING"), eq(true));

    let allowed = server.exec_default("LASTSAVE", &[]);
    assert_that!(allowed.starts_with(b":"), eq(true));

    let _ = server
        .family
        .global_state
        .switch_state(GlobalState::Loading, GlobalState::Active);
}

#[rstest]
fn master_replica_native_full_sync_end_to_end() {
    let master = test_server(2);
    for index in 0..12 {
        let key = format!("key:{index}");
        let value = format!("value:{index}");
        let _ = master.exec_default("SET", &[&key, &value]);
    }

    let bound = crate::network::bind_listener(std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener must bind");
    let master_port = bound.local_addr().expect("listener addr").port();
    let _listener = crate::network::start_listener(Arc::clone(&master.family), bound)
        .expect("listener fiber must start");

    let replica = test_server(3);
    let port_text = master_port.to_string();
    let attach = replica.exec_default("REPLICAOF", &["127.0.0.1", &port_text]);
    assert_that!(attach, eq(&b"+OK\r\n".to_vec()));

    // Full sync completes asynchronously; poll the replica's keyspace.
    let mut synced = false;
    for _ in 0..400 {
        let reply = replica.exec_default("DBSIZE", &[]);
        if reply == b":12\r\n".to_vec() {
            synced = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_that!(synced, eq(true));
    assert_that!(
        replica.exec_default("GET", &["key:3"]),
        eq(&b"$7\r\nvalue:3\r\n".to_vec())
    );

    assert_that!(
        replica.exec_default("REPLICAOF", &["NO", "ONE"]),
        eq(&b"+OK\r\n".to_vec())
    );
    master.family.shutdown_signal().fire();
}
