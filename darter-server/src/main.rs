//! Binary entrypoint for `darter-server`.

mod dflycmd;
mod family;
mod metrics;
mod network;
mod script;
mod server_state;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use darter_common::config::RuntimeConfig;
use darter_common::error::{DarterError, DarterResult};
use darter_common::ids::ShardCount;
use darter_engine::shard_set::EngineShardSet;
use darter_facade::proactor::ProactorPool;
use darter_transaction::coordinator::TxCoordinator;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::family::ServerFamily;

/// A sharded, Redis-wire-compatible in-memory key/value server.
#[derive(Debug, Parser)]
#[command(name = "darter-server", version, about)]
struct Flags {
    /// Working directory for snapshot files.
    #[arg(long, default_value = "")]
    dir: String,

    /// The filename to save/load the DB.
    #[arg(long, default_value = "dump")]
    dbfilename: String,

    /// Password for AUTH authentication.
    #[arg(long, default_value = "")]
    requirepass: String,

    /// Glob spec for the UTC time to save a snapshot, matching HH:MM 24h time.
    #[arg(long, default_value = "")]
    save_schedule: String,

    /// Main RESP listener port.
    #[arg(long, default_value_t = 6379)]
    port: u16,

    /// Base frequency for background tasks.
    #[arg(long, default_value_t = 100)]
    hz: u32,

    /// Run in cache mode.
    #[arg(long, default_value_t = false)]
    cache_mode: bool,

    /// Number of engine shards (defaults to available parallelism).
    #[arg(long)]
    proactor_threads: Option<u16>,

    /// Optional Prometheus /metrics port.
    #[arg(long)]
    metrics_port: Option<u16>,
}

impl Flags {
    fn into_config(self) -> DarterResult<RuntimeConfig> {
        let shard_count = match self.proactor_threads {
            Some(count) => ShardCount::new(count)
                .ok_or(DarterError::InvalidConfig("proactor_threads must be positive"))?,
            None => {
                let available = std::thread::available_parallelism()
                    .map(|count| u16::try_from(count.get()).unwrap_or(u16::MAX))
                    .unwrap_or(4);
                ShardCount::new(available.max(1))
                    .ok_or(DarterError::InvalidConfig("could not derive a shard count"))?
            }
        };
        Ok(RuntimeConfig {
            shard_count,
            port: self.port,
            metrics_port: self.metrics_port,
            dir: self.dir,
            dbfilename: self.dbfilename,
            requirepass: self.requirepass,
            save_schedule: self.save_schedule,
            hz: self.hz.max(1),
            cache_mode: self.cache_mode,
        })
    }
}

fn run_server(config: RuntimeConfig) -> DarterResult<()> {
    // One reactor per shard plus one auxiliary reactor for the acceptor and
    // background fibers.
    let pool = Arc::new(ProactorPool::new(config.shard_count.get() + 1));
    let shard_set = Arc::new(EngineShardSet::new(Arc::clone(&pool), config.shard_count)?);
    let coordinator = Arc::new(TxCoordinator::new(Arc::clone(&shard_set)));
    let family = ServerFamily::new(config.clone(), coordinator);

    family.init()?;

    let resp_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let bound = network::bind_listener(resp_addr)?;
    let listener = network::start_listener(Arc::clone(&family), bound)?;
    let metrics_listener = match config.metrics_port {
        Some(port) => Some(network::start_metrics_listener(
            Arc::clone(&family),
            SocketAddr::from(([0, 0, 0, 0], port)),
        )?),
        None => None,
    };
    info!(
        shards = config.shard_count.get(),
        port = config.port,
        "darter-server started"
    );

    // Park the main thread until SHUTDOWN fires, then tear down in order.
    let control = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|runtime_error| DarterError::Io(runtime_error.to_string()))?;
    control.block_on(family.shutdown_signal().wait());

    info!("shutting down");
    listener.join_blocking();
    if let Some(handle) = metrics_listener {
        handle.join_blocking();
    }
    family.shutdown();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info")
        }))
        .init();

    let flags = Flags::parse();
    let config = match flags.into_config() {
        Ok(config) => config,
        Err(config_error) => {
            eprintln!("invalid configuration: {config_error}");
            std::process::exit(2);
        }
    };

    if let Err(run_error) = run_server(config) {
        eprintln!("failed to start darter-server: {run_error}");
        std::process::exit(1);
    }
}
