// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod calibration;
pub mod frame;

pub use calibration::{CalibrationSource, CalibrationStore};
pub use frame::{DecodedFrame, FrameError, ThermalGrid};
