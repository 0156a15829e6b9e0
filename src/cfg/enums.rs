// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Device polling policy.
///
/// `Continuous` devices are told once to stream on their own
/// (`PERIOD_ON`); `OnDemand` devices are polled with `REQUEST1` on the
/// configured interval. The registry persists the legacy string forms
/// `"Continuous"` and `"On Demand"`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    #[serde(rename = "Continuous", alias = "continuous", alias = "CONTINUOUS")]
    Continuous,
    #[serde(
        rename = "On Demand",
        alias = "OnDemand",
        alias = "on demand",
        alias = "on-demand"
    )]
    OnDemand,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceMode::Continuous => "Continuous",
            DeviceMode::OnDemand => "On Demand",
        })
    }
}

impl DeviceMode {
    /// Parses the persisted string form, tolerating the spellings the
    /// fleet tooling has produced over time.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Continuous" | "continuous" | "CONTINUOUS" => Some(Self::Continuous),
            "On Demand" | "OnDemand" | "on demand" | "on-demand" => {
                Some(Self::OnDemand)
            },
            _ => None,
        }
    }
}

/// Transport scheduling model for the ingest listener.
///
/// Only the cooperative (`async`) model is implemented; the variant
/// exists so configs written for older thread-per-connection builds
/// still deserialize.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TcpMode {
    #[default]
    Async,
}
