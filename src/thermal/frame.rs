// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Thermal frame structure and calibration record decoding.
//!
//! A full frame payload is 834 hex words (4 chars each, 3336 chars):
//! the first 768 words are the 24x32 grid in row-major order, the
//! trailing 66 words are the embedded EEPROM segment. Legacy firmware
//! sends the 768 grid words alone (3072 chars). The standalone
//! `EEPROM1` response carries 832 words (3328 chars) whose first word
//! is the authoritative offset.
//!
//! Grid words are big-endian two's-complement centi-degrees relative
//! to a 27 degree C baseline: `0xFFB0` = -80 centi = 26.20 C at zero
//! offset.

use thiserror::Error;

use crate::thermal::calibration::CalibrationStore;

pub const GRID_ROWS: usize = 24;
pub const GRID_COLS: usize = 32;
pub const GRID_WORDS: usize = GRID_ROWS * GRID_COLS; // 768
pub const CHARS_PER_WORD: usize = 4;
pub const GRID_CHARS: usize = GRID_WORDS * CHARS_PER_WORD; // 3072

pub const EMBEDDED_WORDS: usize = 66;
pub const EMBEDDED_CHARS: usize = EMBEDDED_WORDS * CHARS_PER_WORD; // 264
/// Minimum non-zero words for an embedded segment to count as real
/// data rather than a device echoing zeros.
pub const EMBEDDED_MIN_NONZERO_WORDS: usize = 7;

pub const FRAME_WORDS: usize = GRID_WORDS + EMBEDDED_WORDS; // 834
pub const FRAME_CHARS: usize = FRAME_WORDS * CHARS_PER_WORD; // 3336

pub const EEPROM1_WORDS: usize = 832;
pub const EEPROM1_CHARS: usize = EEPROM1_WORDS * CHARS_PER_WORD; // 3328

/// Calibration offsets outside this band are rejected as implausible.
pub const OFFSET_RANGE_C: (f32, f32) = (-100.0, 100.0);

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("frame payload length {got} (expected {GRID_CHARS} or {FRAME_CHARS})")]
    BadFrameLength { got: usize },
    #[error("EEPROM1 payload length {got} (expected {EEPROM1_CHARS})")]
    BadEepromLength { got: usize },
    #[error("non-hex word {word:?} at index {index}")]
    BadWord { index: usize, word: String },
    #[error("calibration offset {offset} degrees C outside plausible range")]
    OffsetOutOfRange { offset: f32 },
}

/// Dense 24x32 temperature grid, degrees Celsius. Heap-backed; the
/// event types that carry grids stay pointer-sized.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalGrid(pub Box<[[f32; GRID_COLS]; GRID_ROWS]>);

impl Default for ThermalGrid {
    fn default() -> Self {
        Self(Box::new([[0.0; GRID_COLS]; GRID_ROWS]))
    }
}

impl ThermalGrid {
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.0[row][col]
    }

    /// Hottest cell value in the grid.
    pub fn max(&self) -> f32 {
        self.0
            .iter()
            .flatten()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn min(&self) -> f32 {
        self.0.iter().flatten().copied().fold(f32::INFINITY, f32::min)
    }

    /// Coordinates of every cell at or above `threshold`, row-major.
    pub fn cells_at_or_above(&self, threshold: f32) -> Vec<(usize, usize)> {
        let mut cells = Vec::new();
        for (r, row) in self.0.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                if *v >= threshold {
                    cells.push((r, c));
                }
            }
        }
        cells
    }
}

/// One decoded frame: calibrated grid plus the raw embedded segment
/// (empty for legacy grid-only payloads).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub grid: ThermalGrid,
    pub embedded_eeprom: String,
    /// Whether the embedded segment passed validation this frame.
    pub embedded_valid: bool,
    /// Offset that was applied while converting this grid.
    pub offset_celsius: f32,
}

/// Converts one raw 16-bit grid word to degrees Celsius.
pub fn raw_to_celsius(raw: u16, offset_c: f32) -> f32 {
    // Reinterpret as two's complement before scaling.
    let signed = raw as i16;
    (signed as f32) / 100.0 + 27.0 + offset_c
}

/// Validates an embedded EEPROM segment lifted from a frame: exact
/// length, hex-decodable, and enough non-zero words to be real data.
pub fn is_embedded_eeprom_valid(eeprom_hex: &str) -> bool {
    if eeprom_hex.len() != EMBEDDED_CHARS {
        return false;
    }
    if hex::decode(eeprom_hex).is_err() {
        return false;
    }
    let non_zero = eeprom_hex
        .as_bytes()
        .chunks(CHARS_PER_WORD)
        .filter(|w| *w != b"0000")
        .count();
    non_zero >= EMBEDDED_MIN_NONZERO_WORDS
}

/// Decodes a frame payload into a calibrated grid.
///
/// Calibration selection per frame: an `EEPROM1`-loaded offset always
/// wins; otherwise a validated embedded segment updates the store when
/// `use_embedded` is configured and its first-word offset is
/// plausible; otherwise the store is left untouched.
pub fn decode_frame(
    payload: &str,
    calibration: &CalibrationStore,
    use_embedded: bool,
) -> Result<DecodedFrame, FrameError> {
    let (grid_hex, embedded) = match payload.len() {
        FRAME_CHARS => payload.split_at(GRID_CHARS),
        GRID_CHARS => (payload, ""),
        got => return Err(FrameError::BadFrameLength { got }),
    };

    let embedded_valid = is_embedded_eeprom_valid(embedded);
    if !calibration.eeprom1_loaded() && embedded_valid && use_embedded {
        if let Some(offset) = first_word_offset(embedded) {
            calibration.set_offset(offset);
            calibration.mark_embedded_applied();
        }
    }

    let offset_c = calibration.offset_celsius();
    let mut grid = ThermalGrid::default();
    for (idx, word) in grid_hex.as_bytes().chunks(CHARS_PER_WORD).enumerate() {
        let raw = parse_word(word, idx)?;
        grid.0[idx / GRID_COLS][idx % GRID_COLS] = raw_to_celsius(raw, offset_c);
    }

    Ok(DecodedFrame {
        grid,
        embedded_eeprom: embedded.to_string(),
        embedded_valid,
        offset_celsius: offset_c,
    })
}

/// Applies a full `EEPROM1` calibration record.
///
/// The first word is the authoritative offset (signed centi-degrees);
/// an implausible offset leaves the previous calibration in place and
/// the session unloaded, so a retry on the next connection is possible.
pub fn apply_eeprom1(
    payload: &str,
    calibration: &CalibrationStore,
) -> Result<f32, FrameError> {
    if payload.len() != EEPROM1_CHARS {
        return Err(FrameError::BadEepromLength { got: payload.len() });
    }
    let raw = parse_word(&payload.as_bytes()[..CHARS_PER_WORD], 0)?;
    let offset = (raw as i16 as f32) / 100.0;
    if !(OFFSET_RANGE_C.0..=OFFSET_RANGE_C.1).contains(&offset) {
        return Err(FrameError::OffsetOutOfRange { offset });
    }
    calibration.set_offset(offset);
    calibration.mark_eeprom1_loaded();
    Ok(offset)
}

/// Offset encoded in the first word of an embedded segment, if it lies
/// in the plausible band.
fn first_word_offset(embedded: &str) -> Option<f32> {
    let raw = u16::from_str_radix(embedded.get(..CHARS_PER_WORD)?, 16).ok()?;
    let offset = (raw as i16 as f32) / 100.0;
    (OFFSET_RANGE_C.0..=OFFSET_RANGE_C.1)
        .contains(&offset)
        .then_some(offset)
}

fn parse_word(word: &[u8], index: usize) -> Result<u16, FrameError> {
    let text = std::str::from_utf8(word).map_err(|_| FrameError::BadWord {
        index,
        word: String::from_utf8_lossy(word).into_owned(),
    })?;
    u16::from_str_radix(text, 16).map_err(|_| FrameError::BadWord {
        index,
        word: text.to_string(),
    })
}
