// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A well-behaved device announces itself, reports its location and
//! streams one calibrated frame.

use anyhow::Result;
use pfds_sensor_rs::server::IngestEvent;

use super::common::{
    TestDevice, TestServer, embedded_segment, frame_payload, test_config,
};

#[tokio::test]
async fn device_announcement_and_calibrated_frame() -> Result<()> {
    let mut server = TestServer::start(test_config()).await?;
    let mut device = TestDevice::connect(server.handle.local_addr()).await?;

    // Streaming is switched on exactly once, right after accept.
    assert_eq!(device.expect_command().await?, "PERIOD_ON");

    device.send_line("#serialno:SIM1!").await?;
    device.send_line("#locid:room1!").await?;

    let event = server.next_event().await?;
    assert_eq!(event, IngestEvent::SerialNo {
        serial: "SIM1".to_string(),
        client_ip: "127.0.0.1".to_string(),
    });
    let event = server.next_event().await?;
    assert_eq!(event, IngestEvent::LocId {
        loc_id: "room1".to_string(),
        client_ip: "127.0.0.1".to_string(),
    });

    // Frame with a valid embedded segment carrying offset 0xFFB0 =
    // -0.80 C; the frame itself carries no location, so the mapping
    // recorded by #locid supplies it.
    let payload = frame_payload("FFB0", &embedded_segment("FFB0"));
    device.send_line(&format!("#frame:{payload}!")).await?;

    let event = server
        .next_event_where(|e| matches!(e, IngestEvent::Frame { .. }))
        .await?;
    let IngestEvent::Frame { loc_id, grid, calibrated, offset_celsius, .. } = event
    else {
        unreachable!();
    };
    assert_eq!(loc_id, "room1");
    assert!(calibrated);
    assert!((offset_celsius - (-0.80)).abs() < 1e-4);
    assert!(grid.max() - grid.min() >= 0.0);
    // 0xFFB0 grid word with the embedded offset applied: 25.40 C.
    assert!((grid.get(0, 0) - 25.40).abs() < 1e-4);
    assert!((server.calibration.offset_celsius() - (-0.80)).abs() < 1e-4);

    let snapshot = server.metrics.snapshot();
    assert_eq!(snapshot.packets_total, 3);
    assert_eq!(snapshot.errors_total, 0);
    assert_eq!(snapshot.active_connections, 1);
    assert_eq!(snapshot.packets_per_loc.get("room1"), Some(&2));
    Ok(())
}
