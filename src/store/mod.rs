// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod devices;
pub mod loc_resolver;

pub use devices::{DeviceRecord, DeviceRegistry};
pub use loc_resolver::LocResolver;
