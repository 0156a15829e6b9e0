// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use pfds_sensor_rs::{
    cfg::{
        config::{Config, DEFAULT_CONFIG_PATH, resolve_config_path},
        logger::init_logger,
    },
    dispatch::Dispatcher,
    fusion::{FusionEngine, FusionFeed},
    metrics::Metrics,
    packet_log::PacketLog,
    server::{BatchParser, IngestDeps, IngestSink, ingest},
    store::{DeviceRegistry, LocResolver, devices::DEVICES_DB},
    thermal::CalibrationStore,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config_arg = std::env::args().nth(1);
    let config_path =
        resolve_config_path(config_arg.as_deref().unwrap_or(DEFAULT_CONFIG_PATH))?;
    let cfg = Config::load_or_default(&config_path)
        .with_context(|| format!("failed to load config {config_path:?}"))?;

    let _logger_guard = init_logger(&cfg.log)?;
    info!("starting sensor core (config {config_path:?})");

    let metrics = Arc::new(Metrics::new());
    let packet_log = Arc::new(PacketLog::new(&cfg.packet_log_dir));
    let calibration = Arc::new(CalibrationStore::new(cfg.thermal_calibration.offset));
    let resolver = Arc::new(LocResolver::new("ip_loc_map.db", "ip_loc_map.json"));
    let registry =
        Arc::new(DeviceRegistry::open(DEVICES_DB).context("failed to open registry")?);

    let fusion = Arc::new(FusionFeed::new(
        FusionEngine::new(cfg.fusion.clone()),
        cfg.thermal_allow_uncalibrated,
        Arc::clone(&metrics),
    ));

    let handle = ingest::start(&cfg, IngestDeps {
        metrics: Arc::clone(&metrics),
        calibration: Arc::clone(&calibration),
        packet_log: Arc::clone(&packet_log),
    })
    .await
    .context("failed to start ingest listener")?;

    let sink: IngestSink = {
        let fusion = Arc::clone(&fusion);
        Arc::new(move |event| {
            if let Some(verdict) = fusion.apply(&event) {
                if verdict.alarm {
                    warn!(
                        "ALARM at {}: confidence {:.2}, sources {:?}, max {:.1} C",
                        event.loc_id(),
                        verdict.confidence_clamped(),
                        verdict.sources,
                        verdict.thermal_max,
                    );
                }
            }
        })
    };

    let batch = BatchParser::new(
        handle.clone(),
        Arc::clone(&resolver),
        sink,
        cfg.tcp_batch_interval_ms,
        cfg.tcp_batch_max,
        cfg.thermal_use_eeprom,
    )
    .spawn();

    let dispatcher = Dispatcher::new(registry, Arc::new(handle.clone()))
        .spawn(handle.cancel_token());

    tokio::signal::ctrl_c().await.context("signal wait failed")?;
    info!("shutdown requested");
    handle.shutdown();
    let _ = batch.await;
    let _ = dispatcher.await;

    let snapshot = metrics.snapshot();
    info!(
        "stopped: {} packets, {} errors, {} dropped",
        snapshot.packets_total, snapshot.errors_total, snapshot.queue_dropped_total
    );
    Ok(())
}
