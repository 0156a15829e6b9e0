// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-connection command channel depth. Commands are rare
/// (`PERIOD_ON`, `REQUEST1`, `EEPROM1`); backpressure here means the
/// device stopped reading.
pub const CMD_CHANNEL_DEPTH: usize = 32;

/// State attached to one accepted device connection.
///
/// Created on accept, removed on close. `periodic_on_sent` is a
/// one-shot gate: it flips false to true exactly once per connection
/// (after the writer observed a successful `PERIOD_ON` write) and
/// disappears with the connection itself.
#[derive(Debug)]
pub struct ConnState {
    pub client_ip: String,
    pub connected_at: DateTime<Utc>,
    periodic_on_sent: AtomicBool,
    /// Writer handle: lines queued here are written by the
    /// connection's writer task with a trailing LF.
    pub cmd_tx: mpsc::Sender<String>,
    /// Cancelled exactly once on teardown; both per-connection tasks
    /// watch it.
    pub closed: CancellationToken,
    torn_down: AtomicBool,
}

impl ConnState {
    pub fn new(client_ip: String, cmd_tx: mpsc::Sender<String>) -> Self {
        Self {
            client_ip,
            connected_at: Utc::now(),
            periodic_on_sent: AtomicBool::new(false),
            cmd_tx,
            closed: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        }
    }

    /// First caller wins; teardown bookkeeping must run exactly once
    /// even though both per-connection tasks can reach it.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }

    pub fn periodic_on_sent(&self) -> bool {
        self.periodic_on_sent.load(Ordering::SeqCst)
    }

    pub fn mark_periodic_on_sent(&self) {
        self.periodic_on_sent.store(true, Ordering::SeqCst);
    }
}
