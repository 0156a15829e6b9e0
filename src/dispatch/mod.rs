// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Periodic device polling scheduler.
//!
//! Ticks once a second over the registry: Continuous devices get one
//! `PERIOD_ON` per process lifetime (an explicit [`Dispatcher::reset`]
//! re-arms them), every device gets `REQUEST1` on its own poll
//! interval. Command delivery goes through the injected
//! [`CommandSender`] so the scheduler tests without live sockets and
//! the listener never learns the scheduler exists.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use tokio::{
    task::JoinHandle,
    time::{Instant, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::enums::DeviceMode,
    server::ingest::ServerHandle,
    store::{DeviceRecord, DeviceRegistry},
    wire::packet::{CMD_PERIOD_ON, CMD_REQUEST1},
};

/// Command submission seam between the scheduler and the transport.
pub trait CommandSender: Send + Sync {
    fn dispatch(&self, cmd: &str, device: &DeviceRecord) -> Result<()>;
}

impl CommandSender for ServerHandle {
    fn dispatch(&self, cmd: &str, device: &DeviceRecord) -> Result<()> {
        self.send_command(&device.ip, cmd)
    }
}

pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    sender: Arc<dyn CommandSender>,
    sent_period_on: HashSet<i64>,
    last_sent: HashMap<i64, Instant>,
}

impl Dispatcher {
    pub fn new(registry: Arc<DeviceRegistry>, sender: Arc<dyn CommandSender>) -> Self {
        Self {
            registry,
            sender,
            sent_period_on: HashSet::new(),
            last_sent: HashMap::new(),
        }
    }

    /// Forgets all one-shot and cadence state, as if the process had
    /// just started.
    pub fn reset(&mut self) {
        self.sent_period_on.clear();
        self.last_sent.clear();
    }

    /// One scheduler pass at time `now`.
    pub fn tick(&mut self, now: Instant) {
        let devices = match self.registry.list() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("device registry read failed: {e}");
                return;
            },
        };

        for device in &devices {
            if device.mode == DeviceMode::Continuous
                && !self.sent_period_on.contains(&device.id)
            {
                self.dispatch(device, CMD_PERIOD_ON);
                self.sent_period_on.insert(device.id);
            }

            let poll = Duration::from_secs(u64::from(device.poll_seconds.max(1)));
            let due = match self.last_sent.get(&device.id) {
                Some(last) => now.duration_since(*last) >= poll,
                None => true,
            };
            if due {
                self.dispatch(device, CMD_REQUEST1);
                self.last_sent.insert(device.id, now);
            }
        }
    }

    fn dispatch(&self, device: &DeviceRecord, cmd: &str) {
        match self.sender.dispatch(cmd, device) {
            Ok(()) => debug!("dispatched {cmd} to {} ({})", device.name, device.ip),
            Err(e) => {
                warn!("dispatch {cmd} to {} ({}) failed: {e}", device.name, device.ip)
            },
        }
    }

    /// Runs the 1 s tick loop until `cancel` fires.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("dispatcher stopped");
                        break;
                    },
                    _ = tick.tick() => self.tick(Instant::now()),
                }
            }
        })
    }
}
