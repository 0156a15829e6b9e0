// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Multi-client TCP ingest listener.
//!
//! One accept task, one reader task and one writer task per
//! connection. Readers frame LF-terminated lines out of a byte buffer
//! and push them into the shared drop-oldest queue; writers drain a
//! per-connection command channel so command submission never blocks
//! the caller. A parse problem on one connection never disturbs
//! another; only a bind failure at startup is fatal.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use bytes::BytesMut;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::{Instant, sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    metrics::Metrics,
    packet_log::PacketLog,
    server::{
        conn::{CMD_CHANNEL_DEPTH, ConnState},
        queue::{PacketQueue, RawLine},
    },
    thermal::CalibrationStore,
    wire::packet::{CMD_PERIOD_ON, CMD_PERIODIC_ON},
};

/// Called with the client IP after a connection is torn down.
pub type DisconnectHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Shared services the listener needs; constructed once at boot.
#[derive(Clone)]
pub struct IngestDeps {
    pub metrics: Arc<Metrics>,
    pub calibration: Arc<CalibrationStore>,
    pub packet_log: Arc<PacketLog>,
}

/// Cloneable handle to a running ingest listener.
#[derive(Clone)]
pub struct ServerHandle {
    conns: Arc<DashMap<String, Arc<ConnState>>>,
    queue: Arc<PacketQueue>,
    deps: IngestDeps,
    cancel: CancellationToken,
    local_addr: SocketAddr,
    read_timeout: Duration,
    disconnect_hook: Arc<OnceCell<DisconnectHook>>,
}

/// Binds `0.0.0.0:<tcp_port>` and starts the accept loop.
pub async fn start(cfg: &Config, deps: IngestDeps) -> Result<ServerHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], cfg.tcp_port).into();
    start_with_addr(cfg, deps, addr).await
}

/// Binds an explicit address (tests use an ephemeral port).
pub async fn start_with_addr(
    cfg: &Config,
    deps: IngestDeps,
    addr: SocketAddr,
) -> Result<ServerHandle> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind ingest listener on {addr}"))?;
    let local_addr = listener.local_addr().context("listener has no local addr")?;

    let handle = ServerHandle {
        conns: Arc::new(DashMap::new()),
        queue: Arc::new(PacketQueue::new(cfg.tcp_max_queue)),
        deps,
        cancel: CancellationToken::new(),
        local_addr,
        read_timeout: Duration::from_secs(cfg.tcp_read_timeout_secs.max(1)),
        disconnect_hook: Arc::new(OnceCell::new()),
    };

    info!("ingest listener started on {local_addr}");
    let accept_handle = handle.clone();
    tokio::spawn(async move {
        accept_loop(listener, accept_handle).await;
    });

    Ok(handle)
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    pub fn deps(&self) -> &IngestDeps {
        &self.deps
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn active_connections(&self) -> usize {
        self.conns.len()
    }

    /// Registers the hook invoked after each connection close. One
    /// consumer, set at boot; later calls are ignored.
    pub fn set_disconnect_hook(&self, hook: DisconnectHook) {
        let _ = self.disconnect_hook.set(hook);
    }

    /// Stops the accept loop and asks every connection task to wind
    /// down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Queues a command line toward the device at `ip`.
    ///
    /// Thread-safe and non-blocking: the line is posted onto the
    /// connection's writer task. When `ip` has no registered writer
    /// but exactly one client is connected, that client is substituted
    /// (devices behind NAT or loopback rewrites present a different
    /// address than the one configured) and the substitution is
    /// logged.
    pub fn send_command(&self, ip: &str, cmd: &str) -> Result<()> {
        let state = match self.conns.get(ip) {
            Some(entry) => Arc::clone(entry.value()),
            None if self.conns.len() == 1 => {
                let entry = self
                    .conns
                    .iter()
                    .next()
                    .ok_or_else(|| anyhow!("no active connection for ip {ip}"))?;
                warn!(
                    "ip mismatch: configured={ip}, actual={}; \
                     substituting the single active client",
                    entry.key()
                );
                self.deps.packet_log.log_raw(
                    &format!("SUBSTITUTED_TARGET {ip} -> {}", entry.key()),
                    entry.key(),
                );
                Arc::clone(entry.value())
            },
            None => {
                bail!(
                    "no active connection for ip {ip} ({} clients connected)",
                    self.conns.len()
                );
            },
        };

        state
            .cmd_tx
            .try_send(cmd.to_string())
            .map_err(|e| anyhow!("command queue for {} unavailable: {e}", state.client_ip))
    }
}

async fn accept_loop(listener: TcpListener, handle: ServerHandle) {
    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => {
                info!("ingest listener stopping");
                break;
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => spawn_connection(&handle, stream, peer),
                Err(e) => {
                    warn!("accept error: {e}");
                    // Brief pause so fd exhaustion does not spin the loop.
                    sleep(Duration::from_millis(100)).await;
                },
            },
        }
    }
}

fn spawn_connection(handle: &ServerHandle, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {peer}: {e}");
    }
    let client_ip = peer.ip().to_string();
    let (read_half, write_half) = stream.into_split();

    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(CMD_CHANNEL_DEPTH);
    let state = Arc::new(ConnState::new(client_ip.clone(), cmd_tx));
    if let Some(replaced) = handle.conns.insert(client_ip.clone(), Arc::clone(&state))
    {
        // A reconnect from the same address supersedes the old
        // connection; wind its tasks down now instead of waiting for
        // the read timeout.
        debug!("replacing stale connection state for {client_ip}");
        remove_conn(handle, &replaced);
    }
    let active = handle.deps.metrics.connection_opened();
    info!("device connected from {client_ip} ({active} active)");

    // New connection, new calibration session: re-arm the EEPROM gates
    // but keep the cached offset.
    handle.deps.calibration.reset_for_new_connection();

    // One-shot streaming start; the writer marks the gate once the
    // bytes actually left.
    if state.cmd_tx.try_send(CMD_PERIOD_ON.to_string()).is_err() {
        warn!("could not queue {CMD_PERIOD_ON} for {client_ip}");
    }

    let writer_handle = handle.clone();
    let writer_state = Arc::clone(&state);
    tokio::spawn(async move {
        writer_loop(write_half, cmd_rx, writer_state, writer_handle).await;
    });

    let reader_handle = handle.clone();
    tokio::spawn(async move {
        reader_loop(read_half, state, reader_handle).await;
    });
}

/// Drains the per-connection command channel onto the socket.
async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut cmd_rx: mpsc::Receiver<String>,
    state: Arc<ConnState>,
    handle: ServerHandle,
) {
    let ip = state.client_ip.clone();
    loop {
        let cmd = tokio::select! {
            _ = handle.cancel.cancelled() => break,
            _ = state.closed.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        let line = format!("{cmd}\n");
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            handle
                .deps
                .packet_log
                .log_error(&format!("command send failed: {e}"), &cmd, &ip);
            warn!("command send to {ip} failed: {e}");
            // A dead writer means a dead device connection.
            remove_conn(&handle, &state);
            break;
        }
        if cmd == CMD_PERIOD_ON || cmd == CMD_PERIODIC_ON {
            state.mark_periodic_on_sent();
        }
        handle.deps.packet_log.log_raw(&format!("SENT_CMD {cmd}"), &ip);
        debug!("sent command {cmd} to {ip}");
    }
    let _ = write_half.shutdown().await;
}

/// Reads LF-framed lines and feeds the shared queue until EOF, error,
/// timeout or shutdown.
async fn reader_loop(
    mut read_half: OwnedReadHalf,
    state: Arc<ConnState>,
    handle: ServerHandle,
) {
    use tokio::io::AsyncReadExt;

    let ip = state.client_ip.clone();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut first_frame_seen = false;

    loop {
        // Flush complete lines before reading more.
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line_bytes = buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line_bytes[..pos]);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            handle.deps.packet_log.log_raw(line, &ip);

            // Failsafe: the device is clearly streaming, but the
            // initial PERIOD_ON was never confirmed on the wire. Retry
            // exactly once, on the first frame only.
            if !first_frame_seen && line.starts_with("#frame") {
                first_frame_seen = true;
                if !state.periodic_on_sent() {
                    let _ = state.cmd_tx.try_send(CMD_PERIOD_ON.to_string());
                    handle.deps.metrics.record_periodic_on_failsafe();
                    debug!("PERIOD_ON failsafe fired for {ip}");
                }
            }

            let evicted = handle.queue.push(RawLine {
                line: line.to_string(),
                client_ip: ip.clone(),
                enqueued_at: Instant::now(),
            });
            if evicted {
                handle
                    .deps
                    .metrics
                    .set_queue_dropped_total(handle.queue.dropped_total());
            }
        }

        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            _ = state.closed.cancelled() => break,
            read = timeout(handle.read_timeout, read_half.read_buf(&mut buf)) => {
                match read {
                    Err(_) => {
                        info!("reaping silent client {ip}");
                        break;
                    },
                    Ok(Ok(0)) => {
                        info!("device disconnected: {ip}");
                        break;
                    },
                    Ok(Ok(_)) => {},
                    Ok(Err(e)) => {
                        handle.deps.packet_log.log_error(
                            &format!("client read error: {e}"),
                            "(stream)",
                            &ip,
                        );
                        handle.deps.metrics.record_error(&ip);
                        break;
                    },
                }
            },
        }
    }

    remove_conn(&handle, &state);
}

/// Tears one connection down exactly once: cancel its tasks, drop its
/// table entry (unless a newer connection already took the slot), fix
/// the gauge, fire the hook.
fn remove_conn(handle: &ServerHandle, state: &Arc<ConnState>) {
    if !state.begin_teardown() {
        return;
    }
    state.closed.cancel();
    handle
        .conns
        .remove_if(&state.client_ip, |_, current| Arc::ptr_eq(current, state));
    let active = handle.deps.metrics.connection_closed();
    debug!("connection state cleared for {} ({active} active)", state.client_ip);
    if let Some(hook) = handle.disconnect_hook.get() {
        hook(&state.client_ip);
    }
}
