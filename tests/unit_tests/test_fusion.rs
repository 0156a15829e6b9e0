// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::BTreeMap, sync::Arc};

use pfds_sensor_rs::{
    cfg::config::FusionConfig,
    fusion::{FusionEngine, FusionFeed, FusionInputs, FusionSource},
    metrics::Metrics,
    server::IngestEvent,
    thermal::ThermalGrid,
    wire::Reading,
};

fn grid_with_hotspot(background: f32, hot: f32, at: (usize, usize)) -> ThermalGrid {
    let mut grid = ThermalGrid::default();
    for row in grid.0.iter_mut() {
        row.fill(background);
    }
    grid.0[at.0][at.1] = hot;
    grid
}

fn engine() -> FusionEngine {
    FusionEngine::new(FusionConfig::default())
}

#[test]
fn quorum_of_two_sources_raises_alarm() {
    // Thermal (65 over the 50 C threshold) and flame agree; gas stays
    // below its threshold.
    let grid = grid_with_hotspot(30.0, 65.0, (3, 17));
    let verdict = engine().fuse(FusionInputs {
        thermal: Some(&grid),
        gas_ppm: Some(100.0),
        flame: Some(1),
        ..FusionInputs::default()
    });

    assert_eq!(verdict.sources, vec![FusionSource::Thermal, FusionSource::Flame]);
    assert!((verdict.confidence - 0.6).abs() < 1e-6);
    assert!(verdict.alarm, "two agreeing sources must alarm");
    assert_eq!(verdict.hot_cells, vec![(3, 17)]);
    assert!((verdict.thermal_max - 65.0).abs() < 1e-6);
    assert!((verdict.gas_ppm - 100.0).abs() < 1e-6);
}

#[test]
fn single_source_below_confidence_does_not_alarm() {
    let grid = grid_with_hotspot(20.0, 80.0, (0, 0));
    let verdict = engine().fuse(FusionInputs {
        thermal: Some(&grid),
        ..FusionInputs::default()
    });
    assert_eq!(verdict.sources, vec![FusionSource::Thermal]);
    assert!(!verdict.alarm);
}

#[test]
fn high_confidence_alone_raises_alarm() {
    // Vision (0.5) + flame (0.2) = 0.7 with only min_sources=2 ...
    // but also a lone vision + gas combination reaches quorum; check
    // the pure-confidence path with min_sources raised out of reach.
    let cfg = FusionConfig { min_sources: 4, ..FusionConfig::default() };
    let engine = FusionEngine::new(cfg);
    let grid = grid_with_hotspot(20.0, 90.0, (1, 1));
    let verdict = engine.fuse(FusionInputs {
        thermal: Some(&grid),
        vision_score: Some(0.95),
        ..FusionInputs::default()
    });
    // 0.4 + 0.5 = 0.9 >= 0.7 even though only two of four sources.
    assert_eq!(verdict.sources.len(), 2);
    assert!(verdict.alarm);
    assert!((verdict.confidence - 0.9).abs() < 1e-6);
    assert!(verdict.confidence_clamped() <= 1.0);
}

#[test]
fn absent_inputs_contribute_nothing() {
    let verdict = engine().fuse(FusionInputs::default());
    assert!(verdict.sources.is_empty());
    assert_eq!(verdict.confidence, 0.0);
    assert!(!verdict.alarm);
    assert_eq!(verdict.gas_ppm, 0.0);
    assert!(verdict.hot_cells.is_empty());
}

#[test]
fn event_log_is_bounded_drop_oldest() {
    let cfg = FusionConfig { event_log_capacity: 3, ..FusionConfig::default() };
    let engine = FusionEngine::new(cfg);
    for ppm in 0..5 {
        engine.fuse(FusionInputs {
            gas_ppm: Some(ppm as f32),
            ..FusionInputs::default()
        });
    }
    let log = engine.event_log();
    assert_eq!(log.len(), 3);
    let ppms: Vec<f32> = log.iter().map(|v| v.gas_ppm).collect();
    assert_eq!(ppms, vec![2.0, 3.0, 4.0]);
}

#[test]
fn extras_are_echoed_into_the_verdict() {
    let mut extras = BTreeMap::new();
    extras.insert("ADC1".to_string(), Reading::Int(592));
    let verdict = engine().fuse(FusionInputs { extras, ..FusionInputs::default() });
    assert_eq!(verdict.extras.get("ADC1"), Some(&Reading::Int(592)));
}

fn frame_event(loc: &str, grid: ThermalGrid, calibrated: bool) -> IngestEvent {
    let thermal_max = grid.max();
    IngestEvent::Frame {
        loc_id: loc.to_string(),
        client_ip: "10.0.0.9".to_string(),
        grid,
        thermal_max,
        calibrated,
        offset_celsius: 0.0,
    }
}

fn sensor_event(loc: &str, pairs: &[(&str, Reading)]) -> IngestEvent {
    IngestEvent::Sensor {
        loc_id: loc.to_string(),
        client_ip: "10.0.0.9".to_string(),
        readings: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    }
}

#[test]
fn feed_withholds_uncalibrated_frames_unless_permitted() {
    let metrics = Arc::new(Metrics::new());
    let feed = FusionFeed::new(engine(), false, Arc::clone(&metrics));

    let grid = grid_with_hotspot(20.0, 90.0, (2, 2));
    assert!(feed.apply(&frame_event("room1", grid.clone(), false)).is_none());
    assert_eq!(metrics.snapshot().frames_withheld_total, 1);

    // Calibrated frames classify.
    assert!(feed.apply(&frame_event("room1", grid.clone(), true)).is_some());

    // With the explicit config permission, offset-0 frames pass too.
    let permissive = FusionFeed::new(engine(), true, Arc::new(Metrics::new()));
    assert!(permissive.apply(&frame_event("room1", grid, false)).is_some());
}

#[test]
fn feed_combines_latest_signals_per_location() {
    let metrics = Arc::new(Metrics::new());
    let feed = FusionFeed::new(engine(), false, metrics);

    // Gas first: alone it trips one source, no alarm.
    let verdict = feed
        .apply(&sensor_event("room1", &[
            ("MPY30", Reading::Int(800)),
            ("ADC1", Reading::Int(592)),
        ]))
        .expect("sensor classifies");
    assert_eq!(verdict.sources, vec![FusionSource::Gas]);
    assert!(!verdict.alarm);
    assert_eq!(verdict.extras.get("ADC1"), Some(&Reading::Int(592)));

    // A hot calibrated frame for the same location completes the
    // quorum with the remembered gas reading.
    let verdict = feed
        .apply(&frame_event(
            "room1",
            grid_with_hotspot(25.0, 70.0, (9, 9)),
            true,
        ))
        .expect("frame classifies");
    assert_eq!(verdict.sources, vec![FusionSource::Thermal, FusionSource::Gas]);
    assert!(verdict.alarm);

    // A different location shares nothing.
    let verdict = feed
        .apply(&frame_event(
            "room2",
            grid_with_hotspot(25.0, 70.0, (9, 9)),
            true,
        ))
        .expect("frame classifies");
    assert_eq!(verdict.sources, vec![FusionSource::Thermal]);
    assert!(!verdict.alarm);
}

#[test]
fn feed_flame_key_and_vision_scorer_contribute() {
    let feed = FusionFeed::new(engine(), false, Arc::new(Metrics::new()))
        .with_vision_scorer(Box::new(|loc| (loc == "dock").then_some(0.92)));

    let verdict = feed
        .apply(&sensor_event("dock", &[("FLAME", Reading::Int(1))]))
        .expect("sensor classifies");
    // Flame (0.2) + vision (0.5) = quorum of two.
    assert_eq!(verdict.sources, vec![FusionSource::Flame, FusionSource::Vision]);
    assert!(verdict.alarm);
}
