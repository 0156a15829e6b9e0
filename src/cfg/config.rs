// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::TcpMode;

/// Default path of the single JSON configuration document, relative to
/// the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "stream_config.json";

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Listener port for device connections.
    pub tcp_port: u16,
    /// Transport scheduling model (only `async` is implemented).
    pub tcp_mode: TcpMode,
    /// Capacity of the shared raw-line queue; the oldest entry is
    /// dropped on overflow.
    pub tcp_max_queue: usize,
    /// Batch parser tick period in milliseconds.
    pub tcp_batch_interval_ms: u64,
    /// Maximum lines drained from the queue per batch tick.
    pub tcp_batch_max: usize,
    /// Per-connection read timeout; silent clients are reaped after
    /// this many seconds.
    pub tcp_read_timeout_secs: u64,
    /// Permit applying the embedded 66-word EEPROM segment from frames
    /// when it validates.
    pub thermal_use_eeprom: bool,
    /// Permit forwarding frames to the fusion layer before any
    /// calibration source has been established (offset 0).
    pub thermal_allow_uncalibrated: bool,
    pub thermal_calibration: CalibrationConfig,
    pub fusion: FusionConfig,
    pub log: LogConfig,
    /// Directory for the rotating raw/error packet capture files.
    pub packet_log_dir: PathBuf,
    /// Stream definitions for the display layer; opaque to the core.
    pub streams: serde_json::Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_port: 9001,
            tcp_mode: TcpMode::Async,
            tcp_max_queue: 10_000,
            tcp_batch_interval_ms: 50,
            tcp_batch_max: 2_000,
            tcp_read_timeout_secs: 30,
            thermal_use_eeprom: false,
            thermal_allow_uncalibrated: false,
            thermal_calibration: CalibrationConfig::default(),
            fusion: FusionConfig::default(),
            log: LogConfig::default(),
            packet_log_dir: PathBuf::from("logs"),
            streams: serde_json::Value::Null,
        }
    }
}

/// Initial thermal calibration, applied until a device-provided offset
/// (embedded segment or `EEPROM1`) supersedes it.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Offset in degrees Celsius, added after the centi-degree
    /// conversion.
    pub offset: f32,
    /// Multiplier from the pre-centi-degree protocol; parsed for
    /// compatibility, no longer applied.
    pub scale: Option<f32>,
    /// Signedness flag from the pre-centi-degree protocol; parsed for
    /// compatibility, no longer applied.
    pub signed: Option<bool>,
}

/// Thresholds for the multi-source alarm classifier.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct FusionConfig {
    /// Thermal activation threshold, degrees Celsius after calibration.
    pub temp_threshold: f32,
    pub gas_ppm_threshold: f32,
    /// Reading value that counts as a flame detection.
    pub flame_active_value: i64,
    pub vision_threshold: f32,
    /// Sources required to raise an alarm regardless of confidence.
    pub min_sources: usize,
    /// In-memory verdict history bound; oldest entries are discarded.
    pub event_log_capacity: usize,
    /// Sensor reading key carrying the gas concentration in PPM.
    pub gas_key: String,
    /// Sensor reading key carrying the digital flame flag.
    pub flame_key: String,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            temp_threshold: 50.0,
            gas_ppm_threshold: 400.0,
            flame_active_value: 1,
            vision_threshold: 0.7,
            min_sources: 2,
            event_log_capacity: 1_000,
            gas_key: "MPY30".to_string(),
            flame_key: "FLAME".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    File,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct LogConfig {
    /// Tracing filter directive, e.g. `"info"` or
    /// `"pfds_sensor_rs=debug"`.
    pub level: String,
    pub output: LogOutput,
    /// Log file path; required when `output` is `file`.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), output: LogOutput::Stdout, file: None }
    }
}

impl Config {
    /// Loads the configuration from a JSON document, validates it, and
    /// returns the ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config {:?}", path.as_ref())
        })?;
        let mut cfg: Config =
            serde_json::from_str(&s).context("failed to parse config JSON")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Loads the config if the file exists; a missing file yields the
    /// documented defaults so a bare deployment still starts.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.tcp_port != 0, "tcp_port must be non-zero");
        ensure!(self.tcp_max_queue >= 1, "tcp_max_queue must be >= 1");
        ensure!(self.tcp_batch_max >= 1, "tcp_batch_max must be >= 1");
        if self.tcp_batch_interval_ms == 0 {
            self.tcp_batch_interval_ms = 50;
        }
        ensure!(
            (-100.0..=100.0).contains(&self.thermal_calibration.offset),
            "thermal_calibration.offset must lie in [-100, +100] degrees C"
        );
        ensure!(self.fusion.min_sources >= 1, "fusion.min_sources must be >= 1");
        ensure!(
            self.fusion.event_log_capacity >= 1,
            "fusion.event_log_capacity must be >= 1"
        );
        Ok(())
    }
}

/// Resolves a config path given on the command line: absolute paths are
/// taken as-is, relative paths are anchored at the working directory.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);
    if p.is_absolute() {
        return Ok(p.to_path_buf());
    }
    let cwd = std::env::current_dir().context("cannot get current working dir")?;
    Ok(cwd.join(p))
}
