// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod packet;
pub mod sensor;

pub use packet::{Packet, WireError, decode, encode};
pub use sensor::Reading;
