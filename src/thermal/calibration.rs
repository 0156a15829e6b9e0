// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Where the calibration offset active this session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationSource {
    /// No device-provided calibration this session.
    None,
    /// Offset taken from a validated embedded frame segment.
    Embedded,
    /// Offset taken from a full `EEPROM1` response (authoritative).
    Eeprom1,
}

/// Process-wide thermal calibration state.
///
/// Shared by the frame decoder (reads the offset on every cell), the
/// batch parser (EEPROM request gating) and the listener (reset on
/// accept). Readers may observe a slightly stale offset between frames;
/// each field is an independent atomic, single writer at a time.
#[derive(Debug)]
pub struct CalibrationStore {
    /// Offset in degrees Celsius, stored as f32 bits.
    offset_bits: AtomicU32,
    /// Session gate: `EEPROM1` answered on the current connection.
    eeprom1_loaded: AtomicBool,
    /// Session gate: embedded segment applied on the current connection.
    embedded_applied: AtomicBool,
    /// Session gate: `EEPROM1` already issued on the current connection.
    request_sent: AtomicBool,
    /// Sticky across reconnects, like the offset itself: some
    /// device-provided calibration has been accepted at least once.
    device_calibrated: AtomicBool,
}

impl CalibrationStore {
    pub fn new(initial_offset: f32) -> Self {
        Self {
            offset_bits: AtomicU32::new(initial_offset.to_bits()),
            eeprom1_loaded: AtomicBool::new(false),
            embedded_applied: AtomicBool::new(false),
            request_sent: AtomicBool::new(false),
            device_calibrated: AtomicBool::new(false),
        }
    }

    pub fn offset_celsius(&self) -> f32 {
        f32::from_bits(self.offset_bits.load(Ordering::SeqCst))
    }

    pub fn set_offset(&self, offset: f32) {
        self.offset_bits.store(offset.to_bits(), Ordering::SeqCst);
    }

    pub fn eeprom1_loaded(&self) -> bool {
        self.eeprom1_loaded.load(Ordering::SeqCst)
    }

    pub fn mark_eeprom1_loaded(&self) {
        self.eeprom1_loaded.store(true, Ordering::SeqCst);
        self.device_calibrated.store(true, Ordering::SeqCst);
    }

    pub fn mark_embedded_applied(&self) {
        self.embedded_applied.store(true, Ordering::SeqCst);
        self.device_calibrated.store(true, Ordering::SeqCst);
    }

    pub fn mark_request_sent(&self) {
        self.request_sent.store(true, Ordering::SeqCst);
    }

    /// Whether an `EEPROM1` command should be issued: nothing
    /// authoritative loaded this session and no request in flight.
    pub fn needs_request(&self) -> bool {
        !self.eeprom1_loaded.load(Ordering::SeqCst)
            && !self.request_sent.load(Ordering::SeqCst)
    }

    /// Provenance of the offset within the current session.
    pub fn source(&self) -> CalibrationSource {
        if self.eeprom1_loaded.load(Ordering::SeqCst) {
            CalibrationSource::Eeprom1
        } else if self.embedded_applied.load(Ordering::SeqCst) {
            CalibrationSource::Embedded
        } else {
            CalibrationSource::None
        }
    }

    /// True once any device-provided calibration has ever been
    /// accepted; survives reconnects together with the cached offset.
    pub fn has_device_calibration(&self) -> bool {
        self.device_calibrated.load(Ordering::SeqCst)
    }

    /// Clears the per-session gates on a fresh device connection.
    ///
    /// The cached offset (and the fact that the fleet has been
    /// calibrated) survives so a transient drop does not flap frames
    /// through uncalibrated values while the EEPROM round-trip repeats.
    pub fn reset_for_new_connection(&self) {
        self.eeprom1_loaded.store(false, Ordering::SeqCst);
        self.embedded_applied.store(false, Ordering::SeqCst);
        self.request_sent.store(false, Ordering::SeqCst);
    }
}
