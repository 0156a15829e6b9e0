// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::BTreeMap, fmt};

use crate::wire::packet::WireError;

/// One auxiliary sensor reading.
///
/// A value containing `.` parses as a float, everything else as an
/// integer; the key set is open (`ADC1`, `ADC2`, `MPY30`, ...), so
/// readings stay in a small ordered map instead of a fixed struct.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Int(i64),
    Float(f64),
}

impl Reading {
    pub fn as_f64(&self) -> f64 {
        match self {
            Reading::Int(v) => *v as f64,
            Reading::Float(v) => *v,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Reading::Int(v) => *v,
            Reading::Float(v) => *v as i64,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Int(v) => write!(f, "{v}"),
            // Keep the decimal point so the value re-parses as a float.
            Reading::Float(v) if v.fract() == 0.0 => write!(f, "{v:.1}"),
            Reading::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Parses the comma-separated `KEY=VALUE` body of a `#Sensor` record.
///
/// One trailing `:` is stripped from keys (some firmware emits
/// `ADC3:=905`); segments without `=` are skipped.
pub fn parse_readings(data: &str) -> Result<BTreeMap<String, Reading>, WireError> {
    let mut readings = BTreeMap::new();
    for part in data.split(',') {
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let k = k.strip_suffix(':').unwrap_or(k);
        let v = v.trim();
        if k.is_empty() {
            continue;
        }
        let reading = if v.contains('.') {
            v.parse::<f64>().map(Reading::Float).map_err(|_| ())
        } else {
            v.parse::<i64>().map(Reading::Int).map_err(|_| ())
        };
        match reading {
            Ok(r) => {
                readings.insert(k.to_string(), r);
            },
            Err(_) => {
                return Err(WireError::BadReading {
                    key: k.to_string(),
                    value: v.to_string(),
                });
            },
        }
    }
    Ok(readings)
}
