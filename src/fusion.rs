// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Weighted quorum fusion of heterogeneous hazard signals.
//!
//! Each available source contributes a fixed confidence weight when it
//! trips its threshold; an alarm is raised when enough sources agree
//! or the summed confidence is high enough on its own. The classifier
//! itself is a pure function over its inputs; the bounded verdict log
//! is the only retained state.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};

use crate::{
    cfg::config::FusionConfig,
    metrics::Metrics,
    server::batch::IngestEvent,
    thermal::ThermalGrid,
    wire::Reading,
};

const THERMAL_WEIGHT: f32 = 0.4;
const GAS_WEIGHT: f32 = 0.3;
const FLAME_WEIGHT: f32 = 0.2;
const VISION_WEIGHT: f32 = 0.5;
/// Confidence at which a single strong source may raise the alarm.
const CONFIDENCE_ALARM: f32 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FusionSource {
    Thermal,
    Gas,
    Flame,
    Vision,
}

/// Inputs for one classification pass; any subset may be present.
#[derive(Debug, Default, Clone)]
pub struct FusionInputs<'a> {
    pub thermal: Option<&'a ThermalGrid>,
    pub gas_ppm: Option<f32>,
    pub flame: Option<i64>,
    pub vision_score: Option<f32>,
    /// Auxiliary readings echoed into the verdict unchanged.
    pub extras: BTreeMap<String, Reading>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionVerdict {
    pub alarm: bool,
    /// Raw confidence sum, kept unclamped for diagnostics.
    pub confidence: f32,
    pub sources: Vec<FusionSource>,
    pub hot_cells: Vec<(usize, usize)>,
    pub thermal_max: f32,
    pub gas_ppm: f32,
    pub timestamp: DateTime<Utc>,
    pub extras: BTreeMap<String, Reading>,
}

impl FusionVerdict {
    /// Confidence clamped to [0, 1] for consumers.
    pub fn confidence_clamped(&self) -> f32 {
        self.confidence.clamp(0.0, 1.0)
    }
}

pub struct FusionEngine {
    cfg: FusionConfig,
    event_log: Mutex<VecDeque<FusionVerdict>>,
}

impl FusionEngine {
    pub fn new(cfg: FusionConfig) -> Self {
        Self { cfg, event_log: Mutex::new(VecDeque::new()) }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.cfg
    }

    /// Classifies one input set and appends the verdict to the bounded
    /// log.
    pub fn fuse(&self, inputs: FusionInputs<'_>) -> FusionVerdict {
        let mut sources = Vec::new();
        let mut confidence = 0.0f32;
        let mut hot_cells = Vec::new();
        let mut thermal_max = 0.0f32;

        if let Some(grid) = inputs.thermal {
            let max = grid.max();
            thermal_max = max;
            if max >= self.cfg.temp_threshold {
                sources.push(FusionSource::Thermal);
                confidence += THERMAL_WEIGHT;
                hot_cells = grid.cells_at_or_above(self.cfg.temp_threshold);
            }
        }

        if let Some(ppm) = inputs.gas_ppm {
            if ppm >= self.cfg.gas_ppm_threshold {
                sources.push(FusionSource::Gas);
                confidence += GAS_WEIGHT;
            }
        }

        if let Some(flame) = inputs.flame {
            if flame == self.cfg.flame_active_value {
                sources.push(FusionSource::Flame);
                confidence += FLAME_WEIGHT;
            }
        }

        if let Some(score) = inputs.vision_score {
            if score >= self.cfg.vision_threshold {
                sources.push(FusionSource::Vision);
                confidence += VISION_WEIGHT;
            }
        }

        let alarm =
            sources.len() >= self.cfg.min_sources || confidence >= CONFIDENCE_ALARM;

        let verdict = FusionVerdict {
            alarm,
            confidence,
            sources,
            hot_cells,
            thermal_max,
            gas_ppm: inputs.gas_ppm.unwrap_or(0.0),
            timestamp: Utc::now(),
            extras: inputs.extras,
        };

        self.log_verdict(verdict.clone());
        verdict
    }

    /// Copy of the retained verdict history, oldest first.
    pub fn event_log(&self) -> Vec<FusionVerdict> {
        lock(&self.event_log).iter().cloned().collect()
    }

    fn log_verdict(&self, verdict: FusionVerdict) {
        let mut log = lock(&self.event_log);
        if log.len() >= self.cfg.event_log_capacity {
            log.pop_front();
        }
        log.push_back(verdict);
    }
}

/// Latest signals seen for one location.
#[derive(Debug, Default, Clone)]
struct LocationState {
    grid: Option<ThermalGrid>,
    gas_ppm: Option<f32>,
    flame: Option<i64>,
    extras: BTreeMap<String, Reading>,
}

/// Bridges ingest events into the fusion engine.
///
/// Keeps the latest thermal grid and sensor readings per location
/// (latest wins, keyed by loc-id) and classifies on every update.
/// Uncalibrated frames are withheld from fusion unless configuration
/// explicitly permits running with offset 0; an optional pluggable
/// vision scorer contributes the fourth source.
pub struct FusionFeed {
    engine: FusionEngine,
    allow_uncalibrated: bool,
    metrics: Arc<Metrics>,
    state: Mutex<HashMap<String, LocationState>>,
    vision_score: Option<VisionScoreFn>,
}

/// Pluggable vision hook: returns the current detector score for a
/// location, in [0, 1].
pub type VisionScoreFn = Box<dyn Fn(&str) -> Option<f32> + Send + Sync>;

impl FusionFeed {
    pub fn new(
        engine: FusionEngine,
        allow_uncalibrated: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            engine,
            allow_uncalibrated,
            metrics,
            state: Mutex::new(HashMap::new()),
            vision_score: None,
        }
    }

    pub fn with_vision_scorer(mut self, scorer: VisionScoreFn) -> Self {
        self.vision_score = Some(scorer);
        self
    }

    pub fn engine(&self) -> &FusionEngine {
        &self.engine
    }

    /// Applies one ingest event; returns a verdict when the event
    /// produced a classification pass.
    pub fn apply(&self, event: &IngestEvent) -> Option<FusionVerdict> {
        let loc_id = match event {
            IngestEvent::Frame { loc_id, grid, calibrated, .. } => {
                if !calibrated && !self.allow_uncalibrated {
                    self.metrics.record_frame_withheld();
                    return None;
                }
                let mut state = lock(&self.state);
                state.entry(loc_id.clone()).or_default().grid = Some(grid.clone());
                loc_id.clone()
            },
            IngestEvent::Sensor { loc_id, readings, .. } => {
                let cfg = self.engine.config();
                let mut state = lock(&self.state);
                let entry = state.entry(loc_id.clone()).or_default();
                if let Some(gas) = readings.get(&cfg.gas_key) {
                    entry.gas_ppm = Some(gas.as_f64() as f32);
                }
                if let Some(flame) = readings.get(&cfg.flame_key) {
                    entry.flame = Some(flame.as_i64());
                }
                for (k, v) in readings {
                    if *k != cfg.gas_key && *k != cfg.flame_key {
                        entry.extras.insert(k.clone(), v.clone());
                    }
                }
                loc_id.clone()
            },
            _ => return None,
        };

        let state = lock(&self.state);
        let loc = state.get(&loc_id)?;
        let vision = self
            .vision_score
            .as_ref()
            .and_then(|scorer| scorer(&loc_id));
        let inputs = FusionInputs {
            thermal: loc.grid.as_ref(),
            gas_ppm: loc.gas_ppm,
            flame: loc.flame,
            vision_score: vision,
            extras: loc.extras.clone(),
        };
        Some(self.engine.fuse(inputs))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
