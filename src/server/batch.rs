// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Timer-driven queue drain: decode, calibrate, gate EEPROM requests,
//! hand structured events to the boot-registered consumer.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::interval};
use tracing::{debug, info, warn};

use crate::{
    server::{ingest::ServerHandle, queue::RawLine},
    store::LocResolver,
    thermal::{ThermalGrid, frame},
    wire::{self, Packet, Reading, packet::CMD_EEPROM1},
};

/// Structured event handed to the downstream consumer (fusion layer,
/// display wall, recorders).
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    SerialNo {
        serial: String,
        client_ip: String,
    },
    LocId {
        loc_id: String,
        client_ip: String,
    },
    Frame {
        loc_id: String,
        client_ip: String,
        grid: ThermalGrid,
        thermal_max: f32,
        /// Whether a device-provided calibration backed this grid.
        calibrated: bool,
        offset_celsius: f32,
    },
    Sensor {
        loc_id: String,
        client_ip: String,
        readings: BTreeMap<String, Reading>,
    },
    EepromLoaded {
        frame_id: String,
        client_ip: String,
        offset_celsius: f32,
    },
}

impl IngestEvent {
    pub fn loc_id(&self) -> &str {
        match self {
            IngestEvent::SerialNo { client_ip, .. }
            | IngestEvent::EepromLoaded { client_ip, .. } => client_ip,
            IngestEvent::LocId { loc_id, .. }
            | IngestEvent::Frame { loc_id, .. }
            | IngestEvent::Sensor { loc_id, .. } => loc_id,
        }
    }
}

/// Consumer registered at boot; invoked inline on the batch task.
pub type IngestSink = Arc<dyn Fn(IngestEvent) + Send + Sync>;

pub struct BatchParser {
    handle: ServerHandle,
    resolver: Arc<LocResolver>,
    sink: IngestSink,
    tick_period: Duration,
    batch_max: usize,
    use_embedded_eeprom: bool,
}

impl BatchParser {
    pub fn new(
        handle: ServerHandle,
        resolver: Arc<LocResolver>,
        sink: IngestSink,
        tick_period_ms: u64,
        batch_max: usize,
        use_embedded_eeprom: bool,
    ) -> Self {
        Self {
            handle,
            resolver,
            sink,
            tick_period: Duration::from_millis(tick_period_ms.max(1)),
            batch_max: batch_max.max(1),
            use_embedded_eeprom,
        }
    }

    /// Spawns the batch task; it drains one final batch on shutdown.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let cancel = self.handle.cancel_token();
        let mut tick = interval(self.tick_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.process_batch();
                    debug!("batch parser stopped");
                    break;
                },
                _ = tick.tick() => self.process_batch(),
            }
        }
    }

    fn process_batch(&self) {
        let metrics = &self.handle.deps().metrics;
        let items = self.handle.queue().drain(self.batch_max);
        metrics.set_queue_depth(self.handle.queue().len());
        metrics.set_queue_dropped_total(self.handle.queue().dropped_total());
        for item in items {
            self.handle_line(item);
        }
    }

    fn handle_line(&self, item: RawLine) {
        let deps = self.handle.deps();
        let ip = item.client_ip.as_str();
        match wire::decode(&item.line, ip) {
            Err(err) => {
                deps.packet_log.log_error(&err.to_string(), &item.line, ip);
                deps.metrics.record_error(ip);
            },
            Ok(packet) => {
                let loc_id = self.effective_loc(&packet);
                if let Some(event) = self.to_event(packet, &loc_id, &item.line) {
                    (self.sink)(event);
                    let latency_us = item.enqueued_at.elapsed().as_micros() as u64;
                    deps.metrics.record_packet(&loc_id, latency_us);
                }
            },
        }
    }

    /// Location fallback chain: wire-carried id, then the persisted
    /// IP mapping, then the client address itself.
    fn effective_loc(&self, packet: &Packet) -> String {
        if let Some(loc) = packet.wire_loc_id() {
            return loc.to_string();
        }
        self.resolver
            .get(packet.client_ip())
            .unwrap_or_else(|| packet.client_ip().to_string())
    }

    fn to_event(&self, packet: Packet, loc_id: &str, raw: &str) -> Option<IngestEvent> {
        let deps = self.handle.deps();
        match packet {
            Packet::SerialNo { serial, client_ip } => {
                Some(IngestEvent::SerialNo { serial, client_ip })
            },
            Packet::LocId { loc_id, client_ip } => {
                // Device association: remember which location this
                // address reports as.
                self.resolver.set(&client_ip, &loc_id);
                Some(IngestEvent::LocId { loc_id, client_ip })
            },
            Packet::Eeprom { frame_id, client_ip, payload } => {
                match frame::apply_eeprom1(&payload, &deps.calibration) {
                    Ok(offset) => {
                        info!(
                            "EEPROM1 calibration loaded from {client_ip}: \
                             offset {offset:.2} C"
                        );
                        Some(IngestEvent::EepromLoaded {
                            frame_id,
                            client_ip,
                            offset_celsius: offset,
                        })
                    },
                    Err(e) => {
                        deps.packet_log.log_error(&e.to_string(), raw, loc_id);
                        deps.metrics.record_error(loc_id);
                        None
                    },
                }
            },
            Packet::Frame { client_ip, payload, .. } => {
                let decoded = match frame::decode_frame(
                    &payload,
                    &deps.calibration,
                    self.use_embedded_eeprom,
                ) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        deps.packet_log.log_error(&e.to_string(), raw, loc_id);
                        deps.metrics.record_error(loc_id);
                        return None;
                    },
                };

                // The embedded segment did not yield calibration; ask
                // the device for the authoritative record. The gate
                // flips regardless of the send result: at most one
                // EEPROM1 per connection, never a retry.
                if !decoded.embedded_valid && deps.calibration.needs_request() {
                    deps.calibration.mark_request_sent();
                    deps.metrics.record_eeprom_request();
                    match self.handle.send_command(&client_ip, CMD_EEPROM1) {
                        Ok(()) => info!("requested EEPROM1 from {client_ip}"),
                        Err(e) => warn!("EEPROM1 request to {client_ip} failed: {e}"),
                    }
                }

                let thermal_max = decoded.grid.max();
                Some(IngestEvent::Frame {
                    loc_id: loc_id.to_string(),
                    client_ip,
                    grid: decoded.grid,
                    thermal_max,
                    calibrated: deps.calibration.has_device_calibration(),
                    offset_celsius: decoded.offset_celsius,
                })
            },
            Packet::Sensor { client_ip, readings, .. } => Some(IngestEvent::Sensor {
                loc_id: loc_id.to_string(),
                client_ip,
                readings,
            }),
        }
    }
}
