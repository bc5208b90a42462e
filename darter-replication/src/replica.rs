//! Replica-side replication state machine.
//!
//! A replica keeps one control link to its master. The supervisor fiber walks
//! the phases dial → greet → sync → stream and falls back on failure with a
//! 500 ms reconnect backoff. Against a legacy Redis master the sync phase is
//! `PSYNC`; against a native master it fans out one flow connection per
//! master shard and coordinates them with `DFLY SYNC`.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use darter_common::error::{DarterError, DarterResult};
use darter_core::db_slice::SliceRecord;
use darter_facade::notify::Done;
use darter_facade::proactor::{FiberHandle, ProactorPool};
use darter_facade::protocol::{ParsedCommand, RespParser};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::wire::{ReplyReader, RespValue, SnapshotStreamReader, send_command};

/// Byte length of the RDB end-of-file token.
pub const RDB_EOF_TOKEN_LEN: usize = 40;

const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const ACK_BYTES_THRESHOLD: u64 = 1024;
const ACK_INTERVAL: Duration = Duration::from_secs(5);
/// Redis masters may silently drop an `ACK 0` that races their transition to
/// the streaming state; a short delay shrinks that window.
const PSYNC_ACK_RACE_DELAY: Duration = Duration::from_millis(50);
const MAX_FLOW_COUNT: i64 = 1024;
const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Identity of the master this replica follows.
#[derive(Debug, Clone, Default)]
pub struct MasterContext {
    /// Master hostname as configured by `REPLICAOF`.
    pub host: String,
    /// Master port.
    pub port: u16,
    /// Resolved IPv4 endpoint.
    pub endpoint: Option<SocketAddr>,
    /// 40-character master replication id learned during handshake.
    pub master_repl_id: String,
    /// Native sync session id; empty against a legacy Redis master.
    pub dfly_session_id: String,
    /// Flow id when this instance is one subordinate flow connection.
    pub flow_id: u32,
}

/// Connection phase of the replica link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPhase {
    /// Waiting to (re)connect.
    Dial,
    /// TCP established, handshake in progress.
    Greet,
    /// Full sync in progress.
    Syncing,
    /// Consuming the replication stream.
    Streaming,
    /// Supervisor exited.
    Stopped,
}

/// Point-in-time link summary for `INFO replication`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    /// Master hostname.
    pub host: String,
    /// Master port.
    pub port: u16,
    /// Whether the TCP link is currently up.
    pub master_link_established: bool,
    /// Whether a full sync is in progress.
    pub sync_in_progress: bool,
    /// Seconds since the last byte moved on the link.
    pub master_last_io_sec: u64,
}

/// Local future type used by the sink trait so implementations can touch
/// reactor-local state.
pub type LocalApplyFuture<'a> = Pin<Box<dyn std::future::Future<Output = ()> + 'a>>;

/// Where replicated data lands: the local command service.
///
/// Commands are applied with replication semantics (no reply is produced) and
/// snapshot records go straight into the owning shards.
pub trait ReplicationSink: Send + Sync {
    /// Applies one streamed command.
    fn apply_command(&self, frame: ParsedCommand) -> LocalApplyFuture<'_>;

    /// Applies one full-sync keyspace record.
    fn apply_snapshot_record(&self, record: SliceRecord) -> LocalApplyFuture<'_>;
}

/// One established master connection with its parse state.
struct MasterLink {
    stream: TcpStream,
    reader: ReplyReader,
    greeted: bool,
    sync_ok: bool,
    /// Unconsumed bytes carried from the sync phase into streaming.
    carry: Vec<u8>,
}

impl MasterLink {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            reader: ReplyReader::new(),
            greeted: false,
            sync_ok: false,
            carry: Vec::new(),
        }
    }
}

enum FullSyncKind {
    Diskless(Vec<u8>),
    Disk(u64),
    /// `+CONTINUE`: treated as a zero-length full sync.
    Continue,
}

/// Outbound replication client (control link or one subordinate flow).
pub struct Replica {
    sink: Arc<dyn ReplicationSink>,
    pool: Arc<ProactorPool>,
    ctx: Mutex<MasterContext>,
    enabled: AtomicBool,
    tcp_connected: AtomicBool,
    phase: Mutex<ReplicaPhase>,
    paused: AtomicBool,
    num_df_flows: AtomicU32,
    repl_offs: AtomicU64,
    ack_offs: AtomicU64,
    last_io_ms: AtomicU64,
    stop_signal: Done,
    supervisor: Mutex<Option<FiberHandle>>,
    shard_flows: Mutex<Vec<Arc<Replica>>>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ctx = self.ctx_snapshot();
        f.debug_struct("Replica")
            .field("host", &ctx.host)
            .field("port", &ctx.port)
            .field("flow_id", &ctx.flow_id)
            .field("enabled", &self.is_enabled())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Replica {
    /// Creates the control-link replica for one master address.
    #[must_use]
    pub fn new(
        host: String,
        port: u16,
        sink: Arc<dyn ReplicationSink>,
        pool: Arc<ProactorPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            pool,
            ctx: Mutex::new(MasterContext {
                host,
                port,
                ..MasterContext::default()
            }),
            enabled: AtomicBool::new(false),
            tcp_connected: AtomicBool::new(false),
            phase: Mutex::new(ReplicaPhase::Dial),
            paused: AtomicBool::new(false),
            num_df_flows: AtomicU32::new(0),
            repl_offs: AtomicU64::new(0),
            ack_offs: AtomicU64::new(0),
            last_io_ms: AtomicU64::new(0),
            stop_signal: Done::new(),
            supervisor: Mutex::new(None),
            shard_flows: Mutex::new(Vec::new()),
        })
    }

    /// Creates one subordinate flow bound to an established master context.
    ///
    /// The child copies the context by value; it never points back at its
    /// parent.
    #[must_use]
    pub fn new_flow(
        context: &MasterContext,
        flow_id: u32,
        sink: Arc<dyn ReplicationSink>,
        pool: Arc<ProactorPool>,
    ) -> Arc<Self> {
        let replica = Self::new(context.host.clone(), context.port, sink, pool);
        {
            let mut ctx = replica.ctx.lock().unwrap_or_else(PoisonError::into_inner);
            *ctx = context.clone();
            ctx.flow_id = flow_id;
        }
        replica
    }

    fn ctx_snapshot(&self) -> MasterContext {
        self.ctx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the supervisor wants the link up.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Current link phase.
    #[must_use]
    pub fn phase(&self) -> ReplicaPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: ReplicaPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    fn note_io(&self) {
        self.last_io_ms.store(unix_time_ms(), Ordering::Relaxed);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Number of flows a native master announced during greet.
    #[must_use]
    pub fn num_df_flows(&self) -> u32 {
        self.num_df_flows.load(Ordering::Acquire)
    }

    /// Threadsafe link summary for `INFO replication`.
    #[must_use]
    pub fn get_info(&self) -> ReplicaInfo {
        let ctx = self.ctx_snapshot();
        let last_io_ms = self.last_io_ms.load(Ordering::Relaxed);
        ReplicaInfo {
            host: ctx.host,
            port: ctx.port,
            master_link_established: self.tcp_connected.load(Ordering::Acquire),
            sync_in_progress: self.phase() == ReplicaPhase::Syncing,
            master_last_io_sec: unix_time_ms().saturating_sub(last_io_ms) / 1000,
        }
    }

    /// Pauses or resumes the reconnect path.
    ///
    /// Existing fibers keep running; a paused replica merely refuses to dial.
    pub fn pause(&self, pause: bool) {
        self.paused.store(pause, Ordering::Release);
    }

    /// Connects and greets the master, then hands the link to the supervisor
    /// fiber on `supervisor_reactor`.
    ///
    /// # Errors
    ///
    /// Returns resolver, socket, or handshake errors; the caller decides
    /// whether to keep the replica object.
    pub async fn run(self: &Arc<Self>, supervisor_reactor: u16) -> DarterResult<()> {
        let mut link = MasterLink::new(self.connect_socket().await?);
        self.enabled.store(true, Ordering::Release);
        self.tcp_connected.store(true, Ordering::Release);
        self.note_io();

        self.greet(&mut link).await?;
        link.greeted = true;

        let this = Arc::clone(self);
        let handle = self.pool.launch_fiber_on(supervisor_reactor, move || {
            Box::pin(async move {
                this.replicate_fb(Some(link)).await;
            })
        })?;
        *self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Disables the link, cancels in-flight I/O, joins the supervisor, and
    /// stops all subordinate flows.
    pub async fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
        self.stop_signal.fire();

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            handle.join().await;
        }

        let flows = std::mem::take(
            &mut *self
                .shard_flows
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for flow in flows {
            Box::pin(flow.stop()).await;
        }
        self.set_phase(ReplicaPhase::Stopped);
    }

    /// Blocking twin of [`Replica::stop`] for non-reactor threads.
    pub fn stop_blocking(&self) {
        self.enabled.store(false, Ordering::Release);
        self.stop_signal.fire();

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            handle.join_blocking();
        }

        let flows = std::mem::take(
            &mut *self
                .shard_flows
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for flow in flows {
            flow.stop_blocking();
        }
        self.set_phase(ReplicaPhase::Stopped);
    }

    async fn with_stop<T>(
        &self,
        work: impl std::future::Future<Output = DarterResult<T>>,
    ) -> DarterResult<T> {
        tokio::select! {
            result = work => result,
            () = self.stop_signal.wait() => {
                Err(DarterError::InvalidState("replica link stopped"))
            }
        }
    }

    async fn connect_socket(&self) -> DarterResult<TcpStream> {
        let (host, port) = {
            let ctx = self.ctx_snapshot();
            (ctx.host, ctx.port)
        };
        let endpoint = resolve_ipv4(&host, port).await?;
        self.ctx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .endpoint = Some(endpoint);

        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|err| DarterError::Io(format!("could not connect to master: {err}")))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Supervisor loop: keeps the link alive while enabled.
    async fn replicate_fb(self: Arc<Self>, initial: Option<MasterLink>) {
        let mut link = initial;
        while self.is_enabled() {
            let mut active = match link.take() {
                Some(active) => active,
                None => {
                    self.set_phase(ReplicaPhase::Dial);
                    self.tcp_connected.store(false, Ordering::Release);
                    if self.stop_signal.wait_for(RECONNECT_BACKOFF).await {
                        break;
                    }
                    if self.is_paused() {
                        continue;
                    }
                    match self.with_stop(self.connect_socket()).await {
                        Ok(stream) => {
                            debug!("replica socket connected");
                            self.tcp_connected.store(true, Ordering::Release);
                            link = Some(MasterLink::new(stream));
                        }
                        Err(err) => error!(error = %err, "error connecting to master"),
                    }
                    continue;
                }
            };

            if !active.greeted {
                self.set_phase(ReplicaPhase::Greet);
                if let Err(err) = self.with_stop(self.greet(&mut active)).await {
                    info!(error = %err, "error greeting master");
                    continue;
                }
                active.greeted = true;
            }

            if !active.sync_ok {
                self.set_phase(ReplicaPhase::Syncing);
                let legacy = self.ctx_snapshot().dfly_session_id.is_empty();
                let sync_result = if legacy {
                    let result = self.with_stop(self.initiate_psync(&mut active)).await;
                    let _ = self.stop_signal.wait_for(PSYNC_ACK_RACE_DELAY).await;
                    result
                } else {
                    self.with_stop(self.initiate_dfly_sync(&mut active)).await
                };
                if let Err(err) = sync_result {
                    warn!(error = %err, "error syncing with master");
                    continue;
                }
                active.sync_ok = true;
            }

            self.set_phase(ReplicaPhase::Streaming);
            let legacy = self.ctx_snapshot().dfly_session_id.is_empty();
            let stream_result = if legacy {
                self.consume_redis_stream(&mut active).await
            } else {
                self.consume_dfly_stream(&mut active).await
            };
            if let Err(err) = stream_result {
                if self.is_enabled() {
                    error!(error = %err, "replica socket error");
                }
            }
            active.sync_ok = false;
            link = Some(active);
        }
        self.set_phase(ReplicaPhase::Stopped);
        debug!("replication fiber finished");
    }

    /// Handshake: PING, capability announcement, master-kind detection.
    async fn greet(&self, link: &mut MasterLink) -> DarterResult<()> {
        send_command(&mut link.stream, "PING").await?;
        let pong = link.reader.read_reply(&mut link.stream).await?;
        self.note_io();
        if pong.as_text().as_deref() != Some("PONG") {
            return Err(DarterError::bad_message("bad PONG response"));
        }

        send_command(&mut link.stream, "REPLCONF capa eof capa psync2").await?;
        let capa = link.reader.read_reply(&mut link.stream).await?;
        if capa.as_text().as_deref() != Some("OK") {
            return Err(DarterError::bad_message("bad REPLCONF response"));
        }

        // Announce ourselves as a dragonfly-capable client. A legacy master
        // answers OK; a native master answers <replid, sync_id, num_flows>.
        send_command(&mut link.stream, "REPLCONF capa dragonfly").await?;
        let kind = link.reader.read_reply(&mut link.stream).await?;
        self.note_io();
        match kind {
            RespValue::Simple(ok) if ok == "OK" => {
                let mut ctx = self.ctx.lock().unwrap_or_else(PoisonError::into_inner);
                ctx.dfly_session_id.clear();
            }
            RespValue::Array(members) if members.len() == 3 => {
                let Some(master_repl_id) = members[0].as_text() else {
                    return Err(DarterError::bad_message("bad master id in greet response"));
                };
                if master_repl_id.len() != RDB_EOF_TOKEN_LEN {
                    return Err(DarterError::bad_message("bad master id in greet response"));
                }
                let Some(sync_id) = members[1].as_text() else {
                    return Err(DarterError::bad_message("bad sync id in greet response"));
                };
                let RespValue::Integer(flow_count) = members[2] else {
                    return Err(DarterError::bad_message("bad flow count in greet response"));
                };
                if flow_count <= 0 || flow_count > MAX_FLOW_COUNT {
                    return Err(DarterError::bad_message(format!(
                        "invalid flow count {flow_count}"
                    )));
                }

                let mut ctx = self.ctx.lock().unwrap_or_else(PoisonError::into_inner);
                ctx.master_repl_id = master_repl_id;
                ctx.dfly_session_id = sync_id.clone();
                drop(ctx);
                self.num_df_flows
                    .store(u32::try_from(flow_count).unwrap_or(0), Ordering::Release);
                debug!(sync_id = %sync_id, flow_count, "greeted native master");
            }
            _ => return Err(DarterError::bad_message("bad greet response")),
        }
        Ok(())
    }

    /// Legacy full sync against a Redis master.
    async fn initiate_psync(&self, link: &mut MasterLink) -> DarterResult<()> {
        let ctx = self.ctx_snapshot();
        let (id, offs) = if ctx.master_repl_id.is_empty() {
            ("?".to_owned(), -1)
        } else {
            (
                ctx.master_repl_id.clone(),
                i64::try_from(self.repl_offs.load(Ordering::Acquire)).unwrap_or(-1),
            )
        };
        send_command(&mut link.stream, &format!("PSYNC {id} {offs}")).await?;

        let kind = self.parse_replication_header(link).await?;
        self.note_io();

        match kind {
            FullSyncKind::Continue => {}
            FullSyncKind::Diskless(eof_token) => {
                let mut body = SnapshotStreamReader::new(link.reader.take_buffered());
                self.load_snapshot_body(link, &mut body).await?;

                let received = body
                    .read_exact_chained(&mut link.stream, eof_token.len())
                    .await?;
                if received != eof_token {
                    return Err(DarterError::bad_message("rdb eof token mismatch"));
                }
                link.carry = body.leftover().to_vec();
                debug!(keys = body.keys_loaded(), "diskless full sync completed");
            }
            FullSyncKind::Disk(snapshot_size) => {
                let mut body = SnapshotStreamReader::new(link.reader.take_buffered());
                body.set_limit(snapshot_size);
                self.load_snapshot_body(link, &mut body).await?;
                link.carry = body.leftover().to_vec();
                debug!(keys = body.keys_loaded(), "disk-based full sync completed");
            }
        }
        self.note_io();
        Ok(())
    }

    async fn load_snapshot_body(
        &self,
        link: &mut MasterLink,
        body: &mut SnapshotStreamReader,
    ) -> DarterResult<()> {
        while let Some(record) = body.next_record(&mut link.stream).await? {
            self.sink.apply_snapshot_record(record).await;
        }
        Ok(())
    }

    /// Parses `+FULLRESYNC <id> <offset>` plus its `$EOF:<token>` / `$<size>`
    /// continuation, or `+CONTINUE`.
    async fn parse_replication_header(&self, link: &mut MasterLink) -> DarterResult<FullSyncKind> {
        let header = link.reader.read_line(&mut link.stream).await?;
        if let Some(rest) = header.strip_prefix("+FULLRESYNC ") {
            let Some((master_id, offset_text)) = rest.split_once(' ') else {
                return Err(DarterError::bad_message(format!(
                    "bad replication header: {header}"
                )));
            };
            let Ok(offset) = offset_text.parse::<u64>() else {
                return Err(DarterError::bad_message(format!(
                    "bad replication header: {header}"
                )));
            };
            {
                let mut ctx = self.ctx.lock().unwrap_or_else(PoisonError::into_inner);
                ctx.master_repl_id = master_id.to_owned();
            }
            self.repl_offs.store(offset, Ordering::Release);

            let size_line = link.reader.read_line(&mut link.stream).await?;
            let Some(token_or_size) = size_line.strip_prefix('$') else {
                return Err(DarterError::bad_message(format!(
                    "bad replication header: {size_line}"
                )));
            };
            if let Some(token) = token_or_size.strip_prefix("EOF:") {
                if token.len() != RDB_EOF_TOKEN_LEN {
                    return Err(DarterError::bad_message("bad rdb eof token length"));
                }
                return Ok(FullSyncKind::Diskless(token.as_bytes().to_vec()));
            }
            let Ok(size) = token_or_size.parse::<u64>() else {
                return Err(DarterError::bad_message(format!(
                    "bad replication header: {size_line}"
                )));
            };
            return Ok(FullSyncKind::Disk(size));
        }
        if header.starts_with("+CONTINUE") {
            // Partial sync is not modeled yet; resume streaming directly.
            return Ok(FullSyncKind::Continue);
        }
        Err(DarterError::bad_message(format!(
            "bad replication header: {header}"
        )))
    }

    /// Native full sync: one flow connection per master shard.
    async fn initiate_dfly_sync(self: &Arc<Self>, link: &mut MasterLink) -> DarterResult<()> {
        let ctx = self.ctx_snapshot();
        let flow_count = self.num_df_flows();
        if flow_count == 0 {
            return Err(DarterError::InvalidState(
                "native sync requires an announced flow count",
            ));
        }
        let started_at = Instant::now();
        let reactor_count = self.pool.size();

        let (handshake_tx, mut handshake_rx) =
            tokio::sync::mpsc::unbounded_channel::<DarterResult<()>>();
        let mut flows = Vec::with_capacity(flow_count as usize);
        for flow_id in 0..flow_count {
            let flow = Replica::new_flow(&ctx, flow_id, Arc::clone(&self.sink), Arc::clone(&self.pool));
            let reactor = u16::try_from(flow_id % u32::from(reactor_count)).unwrap_or(0);
            let fiber_flow = Arc::clone(&flow);
            let fiber_tx = handshake_tx.clone();
            let handle = self.pool.launch_fiber_on(reactor, move || {
                Box::pin(async move {
                    fiber_flow.run_flow(fiber_tx).await;
                })
            })?;
            *flow
                .supervisor
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(handle);
            flows.push(flow);
        }
        drop(handshake_tx);
        *self
            .shard_flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = flows.clone();

        let mut first_error: Option<DarterError> = None;
        for _ in 0..flow_count {
            match handshake_rx.recv().await {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                None => {
                    if first_error.is_none() {
                        first_error =
                            Some(DarterError::InvalidState("flow fiber exited prematurely"));
                    }
                    break;
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        // Master waits for this command before sending data on the flows.
        send_command(
            &mut link.stream,
            &format!("DFLY SYNC {}", ctx.dfly_session_id),
        )
        .await?;
        let reply = link.reader.read_reply(&mut link.stream).await?;
        if reply.as_text().as_deref() != Some("OK") {
            return Err(DarterError::bad_message("sync failed"));
        }

        for flow in &flows {
            let handle = flow
                .supervisor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                handle.join().await;
            }
        }

        info!(
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            flows = flow_count,
            "full sync finished"
        );
        Ok(())
    }

    /// One flow's lifetime: handshake, signal readiness, load the shard body.
    async fn run_flow(self: Arc<Self>, handshake: tokio::sync::mpsc::UnboundedSender<DarterResult<()>>) {
        match self.with_stop(self.start_flow()).await {
            Ok((mut stream, mut body, eof_token)) => {
                let _ = handshake.send(Ok(()));
                if let Err(err) = self
                    .with_stop(self.load_flow_body(&mut stream, &mut body, &eof_token))
                    .await
                {
                    error!(flow_id = self.ctx_snapshot().flow_id, error = %err, "flow load failed");
                }
            }
            Err(err) => {
                let _ = handshake.send(Err(err));
            }
        }
    }

    async fn start_flow(&self) -> DarterResult<(TcpStream, SnapshotStreamReader, Vec<u8>)> {
        let ctx = self.ctx_snapshot();
        let Some(endpoint) = ctx.endpoint else {
            return Err(DarterError::InvalidState(
                "flow requires a resolved master endpoint",
            ));
        };
        let mut stream = TcpStream::connect(endpoint)
            .await
            .map_err(|err| DarterError::Io(format!("could not connect flow socket: {err}")))?;
        let _ = stream.set_nodelay(true);

        send_command(
            &mut stream,
            &format!(
                "DFLY FLOW {} {} {}",
                ctx.master_repl_id, ctx.dfly_session_id, ctx.flow_id
            ),
        )
        .await?;

        let mut reader = ReplyReader::new();
        let reply = reader.read_reply(&mut stream).await?;
        let RespValue::Array(members) = reply else {
            return Err(DarterError::bad_message("bad FLOW response"));
        };
        if members.len() < 2 {
            return Err(DarterError::bad_message("bad FLOW response"));
        }
        if members[0].as_text().as_deref() != Some("FULL") {
            return Err(DarterError::bad_message("bad FLOW response"));
        }
        let eof_token = match &members[1] {
            RespValue::Bulk(bytes) => bytes.clone(),
            RespValue::Simple(text) => text.clone().into_bytes(),
            _ => return Err(DarterError::bad_message("bad FLOW eof token")),
        };

        self.enabled.store(true, Ordering::Release);
        self.tcp_connected.store(true, Ordering::Release);
        self.note_io();

        // The reply buffer may already hold body bytes; chain them in front
        // of the socket.
        let body = SnapshotStreamReader::new(reader.take_buffered());
        Ok((stream, body, eof_token))
    }

    async fn load_flow_body(
        &self,
        stream: &mut TcpStream,
        body: &mut SnapshotStreamReader,
        eof_token: &[u8],
    ) -> DarterResult<()> {
        self.set_phase(ReplicaPhase::Syncing);
        while let Some(record) = body.next_record(stream).await? {
            self.sink.apply_snapshot_record(record).await;
        }
        if !eof_token.is_empty() {
            let received = body.read_exact_chained(stream, eof_token.len()).await?;
            if received != eof_token {
                return Err(DarterError::bad_message("flow eof token mismatch"));
            }
        }
        self.note_io();
        self.set_phase(ReplicaPhase::Streaming);
        debug!(
            flow_id = self.ctx_snapshot().flow_id,
            keys = body.keys_loaded(),
            "flow body loaded"
        );
        Ok(())
    }

    /// Streams replicated commands from a legacy Redis master.
    async fn consume_redis_stream(&self, link: &mut MasterLink) -> DarterResult<()> {
        let mut parser = RespParser::new();
        let carry = std::mem::take(&mut link.carry);
        parser.feed_bytes(&carry);

        // Master waits for the first ack before it starts streaming.
        send_command(&mut link.stream, "REPLCONF ACK 0").await?;
        let mut last_ack = Instant::now();
        let mut chunk = [0_u8; READ_CHUNK_BYTES];

        loop {
            while let Some(frame) = parser.try_pop_command()? {
                self.sink.apply_command(frame).await;
            }

            let read_len = tokio::select! {
                read = link.stream.read(&mut chunk) => {
                    read.map_err(|error| DarterError::io(&error))?
                }
                () = self.stop_signal.wait() => {
                    return Err(DarterError::InvalidState("replica link stopped"));
                }
            };
            if read_len == 0 {
                return Err(DarterError::Io("master connection closed".to_owned()));
            }
            self.note_io();
            let repl_offs = self
                .repl_offs
                .fetch_add(read_len as u64, Ordering::AcqRel)
                .saturating_add(read_len as u64);

            let ack_offs = self.ack_offs.load(Ordering::Acquire);
            if repl_offs > ack_offs + ACK_BYTES_THRESHOLD || last_ack.elapsed() > ACK_INTERVAL {
                send_command(&mut link.stream, &format!("REPLCONF ACK {repl_offs}")).await?;
                self.ack_offs.store(repl_offs, Ordering::Release);
                last_ack = Instant::now();
            }

            parser.feed_bytes(&chunk[..read_len]);
        }
    }

    /// Native streaming phase.
    ///
    /// The stable-sync wire protocol is not implemented yet; the link says
    /// goodbye and disables itself.
    async fn consume_dfly_stream(&self, link: &mut MasterLink) -> DarterResult<()> {
        send_command(&mut link.stream, "QUIT").await?;
        self.enabled.store(false, Ordering::Release);

        let mut scratch = [0_u8; 128];
        let _ = link.stream.read(&mut scratch).await;
        Ok(())
    }
}

/// Resolves one host to an IPv4 endpoint.
///
/// IPv6 records are noted and skipped.
async fn resolve_ipv4(host: &str, port: u16) -> DarterResult<SocketAddr> {
    let addresses = tokio::net::lookup_host((host, port))
        .await
        .map_err(|err| DarterError::HostUnreachable(format!("{host}: {err}")))?;
    let mut saw_v6 = false;
    for address in addresses {
        match address {
            SocketAddr::V4(_) => return Ok(address),
            SocketAddr::V6(_) => saw_v6 = true,
        }
    }
    if saw_v6 {
        warn!(host, "only IPv6 addresses resolved; IPv4 is required");
    }
    Err(DarterError::HostUnreachable(format!(
        "{host}: no IPv4 address"
    )))
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

#[cfg(test)]
mod tests {
    use super::{MasterContext, Replica, ReplicaPhase, ReplicationSink};
    use darter_core::db_slice::SliceRecord;
    use darter_facade::proactor::ProactorPool;
    use darter_facade::protocol::ParsedCommand;
    use darter_storage::rdb::{encode_entry, encode_eof, encode_header};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, Default)]
    struct RecordingSink {
        commands: Mutex<Vec<ParsedCommand>>,
        records: Mutex<Vec<SliceRecord>>,
    }

    impl ReplicationSink for RecordingSink {
        fn apply_command(&self, frame: ParsedCommand) -> super::LocalApplyFuture<'_> {
            Box::pin(async move {
                self.commands.lock().expect("sink mutex").push(frame);
            })
        }

        fn apply_snapshot_record(&self, record: SliceRecord) -> super::LocalApplyFuture<'_> {
            Box::pin(async move {
                self.records.lock().expect("sink mutex").push(record);
            })
        }
    }

    async fn read_master_line(stream: &mut tokio::net::TcpStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0_u8; 1];
        loop {
            let read = stream.read(&mut byte).await.expect("master read");
            if read == 0 || byte[0] == b'\n' {
                break;
            }
            if byte[0] != b'\r' {
                line.push(byte[0]);
            }
        }
        String::from_utf8(line).expect("line must be UTF-8")
    }

    fn snapshot_body() -> Vec<u8> {
        let mut body = encode_header(&[]);
        body.extend_from_slice(&encode_entry(&SliceRecord {
            db: 0,
            key: b"boot".to_vec(),
            value: b"strap".to_vec(),
            expire_at_ms: None,
        }));
        body.extend_from_slice(&encode_eof());
        body
    }

    /// Scripted legacy master: greets, serves a diskless full sync, then
    /// streams one SET command.
    async fn scripted_legacy_master(listener: TcpListener, eof_token: [u8; 40]) {
        let (mut stream, _) = listener.accept().await.expect("master accept");

        assert_eq!(read_master_line(&mut stream).await, "PING");
        stream.write_all(b"+PONG\r\n").await.expect("master write");
        assert_eq!(
            read_master_line(&mut stream).await,
            "REPLCONF capa eof capa psync2"
        );
        stream.write_all(b"+OK\r\n").await.expect("master write");
        assert_eq!(read_master_line(&mut stream).await, "REPLCONF capa dragonfly");
        stream.write_all(b"+OK\r\n").await.expect("master write");

        let psync = read_master_line(&mut stream).await;
        assert_eq!(psync, "PSYNC ? -1");
        let mut full_sync = Vec::new();
        full_sync.extend_from_slice(b"+FULLRESYNC 0123456789012345678901234567890123456789 1234\r\n");
        full_sync.extend_from_slice(b"$EOF:");
        full_sync.extend_from_slice(&eof_token);
        full_sync.extend_from_slice(b"\r\n");
        full_sync.extend_from_slice(&snapshot_body());
        full_sync.extend_from_slice(&eof_token);
        stream.write_all(&full_sync).await.expect("master write");

        assert_eq!(read_master_line(&mut stream).await, "REPLCONF ACK 0");
        stream
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .await
            .expect("master write");

        // Hold the socket open until the replica is stopped.
        let mut scratch = [0_u8; 64];
        let _ = stream.read(&mut scratch).await;
    }

    #[rstest]
    fn legacy_full_sync_loads_snapshot_and_streams_commands() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime must build");
        let pool = Arc::new(ProactorPool::new(2));
        let sink = Arc::new(RecordingSink::default());

        runtime.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("master bind");
            let port = listener.local_addr().expect("master addr").port();
            let master = tokio::spawn(scripted_legacy_master(listener, [b'a'; 40]));

            let replica = Replica::new("127.0.0.1".to_owned(), port, sink.clone(), pool);
            replica.run(1).await.expect("replica run must pass");

            // Wait for the streamed command to arrive.
            for _ in 0..200 {
                if !sink.commands.lock().expect("sink mutex").is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            let records = sink.records.lock().expect("sink mutex").clone();
            assert_that!(records.len(), eq(1_usize));
            assert_that!(&records[0].key, eq(&b"boot".to_vec()));

            let commands = sink.commands.lock().expect("sink mutex").clone();
            assert_that!(commands.len(), eq(1_usize));
            assert_that!(commands[0].name.as_str(), eq("SET"));

            assert_that!(replica.phase(), eq(ReplicaPhase::Streaming));
            replica.stop().await;
            assert_that!(replica.phase(), eq(ReplicaPhase::Stopped));
            master.abort();
        });
    }

    #[rstest]
    fn run_reports_connection_failure_to_caller() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime must build");
        let pool = Arc::new(ProactorPool::new(1));
        let sink = Arc::new(RecordingSink::default());

        runtime.block_on(async {
            // Bind-then-drop gives a port with nothing listening.
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("probe bind");
            let port = listener.local_addr().expect("probe addr").port();
            drop(listener);

            let replica = Replica::new("127.0.0.1".to_owned(), port, sink, pool);
            let result = replica.run(0).await;
            assert_that!(result.is_err(), eq(true));
            assert_that!(replica.is_enabled(), eq(false));
        });
    }

    #[rstest]
    fn new_flow_copies_context_by_value() {
        let pool = Arc::new(ProactorPool::new(1));
        let sink: Arc<dyn ReplicationSink> = Arc::new(RecordingSink::default());
        let context = MasterContext {
            host: "example".to_owned(),
            port: 6379,
            master_repl_id: "x".repeat(40),
            dfly_session_id: "SYNC7".to_owned(),
            ..MasterContext::default()
        };

        let flow = Replica::new_flow(&context, 2, sink, pool);
        let flow_ctx = flow.ctx_snapshot();
        assert_that!(flow_ctx.flow_id, eq(2_u32));
        assert_that!(flow_ctx.dfly_session_id.as_str(), eq("SYNC7"));
        assert_that!(flow_ctx.master_repl_id.len(), eq(40_usize));
    }

    #[rstest]
    fn pause_blocks_only_the_dial_path() {
        let pool = Arc::new(ProactorPool::new(1));
        let sink: Arc<dyn ReplicationSink> = Arc::new(RecordingSink::default());
        let replica = Replica::new("127.0.0.1".to_owned(), 1, sink, pool);

        replica.pause(true);
        assert_that!(replica.get_info().master_link_established, eq(false));
        replica.pause(false);
    }
}
