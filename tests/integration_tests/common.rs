// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared harness: a full ingest stack on an ephemeral localhost port
//! plus a scripted device client.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use pfds_sensor_rs::{
    cfg::config::Config,
    metrics::Metrics,
    packet_log::PacketLog,
    server::{BatchParser, IngestDeps, IngestEvent, IngestSink, ServerHandle, ingest},
    store::LocResolver,
    thermal::{CalibrationStore, frame::EMBEDDED_WORDS},
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub handle: ServerHandle,
    pub events: mpsc::UnboundedReceiver<IngestEvent>,
    pub metrics: Arc<Metrics>,
    pub calibration: Arc<CalibrationStore>,
    _dir: TempDir,
}

impl TestServer {
    /// Boots listener + batch parser with isolated state directories.
    pub async fn start(cfg: Config) -> Result<Self> {
        let dir = TempDir::new().context("tempdir")?;
        let metrics = Arc::new(Metrics::new());
        let packet_log = Arc::new(PacketLog::new(dir.path().join("logs")));
        let calibration =
            Arc::new(CalibrationStore::new(cfg.thermal_calibration.offset));
        let resolver = Arc::new(LocResolver::new(
            dir.path().join("ip_loc_map.db"),
            dir.path().join("ip_loc_map.json"),
        ));

        let addr: SocketAddr = "127.0.0.1:0".parse().context("addr")?;
        let handle = ingest::start_with_addr(
            &cfg,
            IngestDeps {
                metrics: Arc::clone(&metrics),
                calibration: Arc::clone(&calibration),
                packet_log,
            },
            addr,
        )
        .await?;

        let (tx, events) = mpsc::unbounded_channel();
        let sink: IngestSink = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        BatchParser::new(
            handle.clone(),
            resolver,
            sink,
            cfg.tcp_batch_interval_ms,
            cfg.tcp_batch_max,
            cfg.thermal_use_eeprom,
        )
        .spawn();

        Ok(Self { handle, events, metrics, calibration, _dir: dir })
    }

    pub async fn next_event(&mut self) -> Result<IngestEvent> {
        timeout(WAIT, self.events.recv())
            .await
            .context("timed out waiting for event")?
            .ok_or_else(|| anyhow!("event channel closed"))
    }

    /// Next event matching `pred`, skipping others.
    pub async fn next_event_where<F>(&mut self, mut pred: F) -> Result<IngestEvent>
    where F: FnMut(&IngestEvent) -> bool {
        loop {
            let event = self.next_event().await?;
            if pred(&event) {
                return Ok(event);
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

/// A scripted device on the other end of the socket.
pub struct TestDevice {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestDevice {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("device connect")?;
        let (r, w) = stream.into_split();
        Ok(Self { reader: BufReader::new(r), writer: w })
    }

    /// Sends one record line (LF appended).
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    /// Reads the next command issued by the server.
    pub async fn expect_command(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .context("timed out waiting for command")??;
        if n == 0 {
            return Err(anyhow!("server closed the connection"));
        }
        Ok(line.trim().to_string())
    }

    /// Asserts that no further command arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<()> {
        let mut line = String::new();
        match timeout(window, self.reader.read_line(&mut line)).await {
            Err(_) => Ok(()),
            Ok(Ok(0)) => Err(anyhow!("server closed the connection")),
            Ok(Ok(_)) => Err(anyhow!("unexpected command {:?}", line.trim())),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

/// Embedded segment whose first word is `word0`, padded with enough
/// non-zero words to validate.
pub fn embedded_segment(word0: &str) -> String {
    let mut s = String::with_capacity(EMBEDDED_WORDS * 4);
    s.push_str(word0);
    for i in 1..EMBEDDED_WORDS {
        s.push_str(if i < 10 { "0001" } else { "0000" });
    }
    s
}

/// Full 3336-char frame payload from one repeated grid word.
pub fn frame_payload(grid_word: &str, embedded: &str) -> String {
    let mut s = grid_word.repeat(768);
    s.push_str(embedded);
    s
}

/// 3328-char EEPROM1 payload with the given offset word.
pub fn eeprom1_payload(word0: &str) -> String {
    format!("{word0}{}", "0001".repeat(831))
}

/// Config tuned for fast tests.
pub fn test_config() -> Config {
    Config {
        tcp_batch_interval_ms: 10,
        thermal_use_eeprom: true,
        ..Config::default()
    }
}
