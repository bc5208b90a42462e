//! TCP ingress: the acceptor fiber and one connection fiber per client.

use std::net::SocketAddr;
use std::sync::Arc;

use darter_common::error::{DarterError, DarterResult};
use darter_core::command::{CommandFrame, CommandReply};
use darter_facade::connection::ConnectionContext;
use darter_facade::proactor::FiberHandle;
use darter_facade::protocol::RespParser;
use darter_storage::rdb::{RdbSaver, RdbTypeFreqMap};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::dflycmd::FlowTicket;
use crate::family::{ClientInfo, CommandExecution, ServerFamily};
use crate::metrics::{http_metrics_response, render_prometheus_metrics};
use crate::server_state::ServerState;

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Binds the RESP listener socket.
///
/// # Errors
///
/// Returns `DarterError::Io` when the address cannot be bound.
pub fn bind_listener(addr: SocketAddr) -> DarterResult<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)
        .map_err(|bind_error| DarterError::Io(format!("bind {addr} failed: {bind_error}")))?;
    listener
        .set_nonblocking(true)
        .map_err(|socket_error| DarterError::io(&socket_error))?;
    Ok(listener)
}

/// Runs the acceptor fiber over a pre-bound listener until shutdown.
///
/// # Errors
///
/// Returns reactor dispatch failures.
pub fn start_listener(
    family: Arc<ServerFamily>,
    bound: std::net::TcpListener,
) -> DarterResult<FiberHandle> {
    let pool = Arc::clone(family.coordinator().shard_set().pool());
    let aux = family.aux_reactor();
    pool.launch_fiber_on(aux, move || {
        Box::pin(async move {
            let listener = match TcpListener::from_std(bound) {
                Ok(listener) => listener,
                Err(register_error) => {
                    error!(error = %register_error, "failed to register RESP listener");
                    family.shutdown_signal().fire();
                    return;
                }
            };
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "listening");
            }
            accept_loop(family, listener).await;
        })
    })
}

async fn accept_loop(family: Arc<ServerFamily>, listener: TcpListener) {
    let pool = Arc::clone(family.coordinator().shard_set().pool());
    let mut next_id = 1_u64;
    let mut next_reactor = 0_u16;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let id = next_id;
                        next_id += 1;
                        let reactor = next_reactor % pool.size();
                        next_reactor = next_reactor.wrapping_add(1);

                        let conn_family = Arc::clone(&family);
                        let launched = pool.launch_fiber_on(reactor, move || {
                            Box::pin(async move {
                                connection_fiber(conn_family, stream, id, peer).await;
                            })
                        });
                        if let Err(dispatch_error) = launched {
                            warn!(error = %dispatch_error, "failed to place connection fiber");
                        }
                    }
                    Err(accept_error) => warn!(error = %accept_error, "accept failed"),
                }
            }
            // Stopping the acceptor is what prevents new connections during
            // shutdown; established clients are not individually cancelled.
            () = family.shutdown_signal().wait() => break,
        }
    }
}

async fn connection_fiber(
    family: Arc<ServerFamily>,
    mut stream: TcpStream,
    id: u64,
    peer: SocketAddr,
) {
    let _ = stream.set_nodelay(true);
    family.register_connection(ClientInfo {
        id,
        addr: peer.to_string(),
        name: String::new(),
    });
    ServerState::with_tlocal(|state| state.connection_stats.num_conns += 1);

    let mut cntx = ConnectionContext::new(!family.config().requirepass.is_empty());
    cntx.client_id = id;
    let mut parser = RespParser::new();
    let mut chunk = [0_u8; READ_CHUNK_BYTES];

    'io: loop {
        loop {
            match parser.try_pop_command() {
                Ok(Some(parsed)) => {
                    let frame = CommandFrame::new(parsed.name, parsed.args);
                    let closes_connection =
                        frame.name == "SHUTDOWN" || frame.name == "QUIT";
                    match family.execute_command(&mut cntx, frame).await {
                        CommandExecution::Reply(Some(bytes)) => {
                            ServerState::with_tlocal(|state| {
                                state.connection_stats.io_write_bytes += bytes.len() as u64;
                            });
                            if stream.write_all(&bytes).await.is_err() {
                                break 'io;
                            }
                        }
                        CommandExecution::Reply(None) => {}
                        CommandExecution::StartDflyFlow {
                            sync_id,
                            flow_id,
                            ticket,
                        } => {
                            serve_dfly_flow(&family, &mut stream, &sync_id, flow_id, ticket).await;
                            break 'io;
                        }
                    }
                    if closes_connection {
                        break 'io;
                    }
                }
                Ok(None) => break,
                Err(parse_error) => {
                    ServerState::with_tlocal(|state| {
                        state.connection_stats.parser_err_count += 1;
                    });
                    let reply = CommandReply::Error(format!("{parse_error}")).to_resp_bytes();
                    let _ = stream.write_all(&reply).await;
                    break 'io;
                }
            }
        }

        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break 'io,
            Ok(read_len) => {
                ServerState::with_tlocal(|state| {
                    state.connection_stats.io_read_bytes += read_len as u64;
                });
                parser.feed_bytes(&chunk[..read_len]);
            }
        }
    }

    ServerState::with_tlocal(|state| {
        state.connection_stats.num_conns = state.connection_stats.num_conns.saturating_sub(1);
    });
    family.unregister_connection(id);
    debug!(id, %peer, "connection closed");
}

/// Turns one accepted connection into a replication flow socket.
///
/// The flow replies `["FULL", <token>]`, waits for its session to start,
/// then streams the shard's captured body terminated by the token.
async fn serve_dfly_flow(
    family: &Arc<ServerFamily>,
    stream: &mut TcpStream,
    sync_id: &str,
    flow_id: usize,
    ticket: FlowTicket,
) {
    let accepted = CommandReply::Array(vec![
        CommandReply::SimpleString("FULL".to_owned()),
        CommandReply::SimpleString(ticket.eof_token.clone()),
    ]);
    if stream.write_all(&accepted.to_resp_bytes()).await.is_err() {
        return;
    }

    ticket.started.wait().await;
    let Some(records) = family.dfly_cmd().take_capture(sync_id, flow_id) else {
        warn!(sync_id, flow_id, "flow has no captured body");
        return;
    };

    let mut saver = RdbSaver::new(Vec::new(), true);
    if let Err(header_error) = saver.save_header(&family.script_mgr().scripts()) {
        warn!(sync_id, flow_id, error = %header_error, "flow header serialization failed");
        return;
    }
    saver.capture(records);
    let mut freq_map = RdbTypeFreqMap::new();
    if let Err(body_error) = saver.save_body(&mut freq_map) {
        warn!(sync_id, flow_id, error = %body_error, "flow body serialization failed");
        return;
    }

    let body = saver.into_sink();
    if stream.write_all(&body).await.is_err() {
        return;
    }
    if stream.write_all(ticket.eof_token.as_bytes()).await.is_err() {
        return;
    }
    info!(sync_id, flow_id, bytes = body.len(), "flow body streamed");

    // Stable-phase streaming is not modeled yet; hold the socket until the
    // replica says goodbye.
    let mut scratch = [0_u8; 128];
    let _ = stream.read(&mut scratch).await;
}

/// Binds the Prometheus endpoint when a metrics port is configured.
///
/// # Errors
///
/// Returns reactor dispatch failures.
pub fn start_metrics_listener(
    family: Arc<ServerFamily>,
    addr: SocketAddr,
) -> DarterResult<FiberHandle> {
    let pool = Arc::clone(family.coordinator().shard_set().pool());
    let aux = family.aux_reactor();
    pool.launch_fiber_on(aux, move || {
        Box::pin(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(bind_error) => {
                    error!(%addr, error = %bind_error, "failed to bind metrics listener");
                    return;
                }
            };
            info!(%addr, "metrics endpoint listening");

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((mut stream, _)) = accepted else { continue };
                        let mut request = [0_u8; 1024];
                        let _ = stream.read(&mut request).await;

                        let metrics = family.get_metrics().await;
                        let body = render_prometheus_metrics(&metrics, family.used_mem_peak());
                        let _ = stream.write_all(&http_metrics_response(&body)).await;
                    }
                    () = family.shutdown_signal().wait() => break,
                }
            }
        })
    })
}
