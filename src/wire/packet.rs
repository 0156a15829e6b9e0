// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Line-framed ASCII records exchanged with the sensor devices.
//!
//! Every record is one LF-terminated line of the shape
//!
//! ```text
//! #<prefix>:<payload>!
//! ```
//!
//! with exactly one `:` separating the prefix from the payload. The
//! prefix selects the record kind and may carry an embedded location
//! id (`#frame<loc>` / `#Sensor<loc>`); alternatively the location id
//! appears as an extra payload segment (`#frame:<loc>:<hex>`), or is
//! absent and falls back to the client address.

use std::{collections::BTreeMap, fmt};

use thiserror::Error;

use crate::wire::sensor::{Reading, parse_readings};

/// Hex characters in a full frame payload (768 grid + 66 embedded
/// EEPROM words, 4 chars each).
pub const FRAME_CHARS: usize = 3336;
/// Hex characters in a grid-only legacy frame payload.
pub const FRAME_LEGACY_CHARS: usize = 3072;
/// Hex characters in an `EEPROM1` response payload (832 words).
pub const EEPROM1_CHARS: usize = 3328;

/// Command starting continuous streaming on a device.
pub const CMD_PERIOD_ON: &str = "PERIOD_ON";
/// Synonym some firmware revisions expect.
pub const CMD_PERIODIC_ON: &str = "PERIODIC_ON";
/// Command requesting a single frame.
pub const CMD_REQUEST1: &str = "REQUEST1";
/// Command requesting the full 832-word calibration record.
pub const CMD_EEPROM1: &str = "EEPROM1";

/// Decode failures; these are logged and dropped, never raised across
/// the ingest path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("record has no ':' separator")]
    NoColon,
    #[error("payload length {got} (expected {expected})")]
    LengthMismatch { expected: &'static str, got: usize },
    #[error("payload contains non-hex characters")]
    BadHex,
    #[error("unknown record type")]
    UnknownType,
    #[error("unreadable sensor value {value:?} for key {key:?}")]
    BadReading { key: String, value: String },
}

/// One decoded wire record.
///
/// `loc_id` is `None` when the record carried no location of its own;
/// the ingest path then consults the IP mapping store and finally falls
/// back to `client_ip`.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    SerialNo {
        serial: String,
        client_ip: String,
    },
    LocId {
        loc_id: String,
        client_ip: String,
    },
    Frame {
        loc_id: Option<String>,
        client_ip: String,
        /// Raw hex payload, `FRAME_CHARS` or `FRAME_LEGACY_CHARS` long.
        payload: String,
    },
    Sensor {
        loc_id: Option<String>,
        client_ip: String,
        readings: BTreeMap<String, Reading>,
    },
    Eeprom {
        frame_id: String,
        client_ip: String,
        /// Raw hex payload, exactly `EEPROM1_CHARS` long.
        payload: String,
    },
}

impl Packet {
    /// Location id as present on the wire, if any.
    pub fn wire_loc_id(&self) -> Option<&str> {
        match self {
            Packet::LocId { loc_id, .. } => Some(loc_id),
            Packet::Frame { loc_id, .. } | Packet::Sensor { loc_id, .. } => {
                loc_id.as_deref()
            },
            _ => None,
        }
    }

    pub fn client_ip(&self) -> &str {
        match self {
            Packet::SerialNo { client_ip, .. }
            | Packet::LocId { client_ip, .. }
            | Packet::Frame { client_ip, .. }
            | Packet::Sensor { client_ip, .. }
            | Packet::Eeprom { client_ip, .. } => client_ip,
        }
    }
}

impl fmt::Display for Packet {
    /// Canonical wire form of the record, without the trailing LF.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::SerialNo { serial, .. } => write!(f, "#serialno:{serial}!"),
            Packet::LocId { loc_id, .. } => write!(f, "#locid:{loc_id}!"),
            Packet::Frame { loc_id, payload, .. } => match loc_id {
                Some(loc) => write!(f, "#frame{loc}:{payload}!"),
                None => write!(f, "#frame:{payload}!"),
            },
            Packet::Sensor { loc_id, readings, .. } => {
                match loc_id {
                    Some(loc) => write!(f, "#Sensor{loc}:")?,
                    None => write!(f, "#Sensor:")?,
                }
                let mut first = true;
                for (k, v) in readings {
                    if !first {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}={v}")?;
                    first = false;
                }
                write!(f, "!")
            },
            Packet::Eeprom { frame_id, payload, .. } => {
                write!(f, "#EEPROM{frame_id}:{payload}!")
            },
        }
    }
}

/// Encodes a packet into its canonical wire line (no LF).
pub fn encode(packet: &Packet) -> String {
    packet.to_string()
}

/// Decodes one wire line received from `client_ip`.
///
/// Leading/trailing whitespace (including `\r`) is stripped; a missing
/// trailing `!` is tolerated, matching what deployed firmware emits
/// under retransmission.
pub fn decode(line: &str, client_ip: &str) -> Result<Packet, WireError> {
    let line = line.trim();
    let content = line.strip_prefix('#').ok_or(WireError::UnknownType)?;
    let content = content.strip_suffix('!').unwrap_or(content);

    if let Some(rest) = content.strip_prefix("serialno:") {
        return Ok(Packet::SerialNo {
            serial: rest.trim().to_string(),
            client_ip: client_ip.to_string(),
        });
    }
    if let Some(rest) = content.strip_prefix("locid:") {
        return Ok(Packet::LocId {
            loc_id: rest.trim().to_string(),
            client_ip: client_ip.to_string(),
        });
    }
    if let Some(rest) = content.strip_prefix("EEPROM") {
        let (frame_id, payload) = rest.split_once(':').ok_or(WireError::NoColon)?;
        let payload = payload.trim();
        if payload.len() != EEPROM1_CHARS {
            return Err(WireError::LengthMismatch {
                expected: "3328",
                got: payload.len(),
            });
        }
        ensure_hex(payload)?;
        return Ok(Packet::Eeprom {
            frame_id: frame_id.to_string(),
            client_ip: client_ip.to_string(),
            payload: payload.to_string(),
        });
    }
    if content.starts_with("frame") {
        let (loc_id, payload) = split_loc_and_data(content, "frame")?;
        let payload = payload.trim();
        if payload.len() != FRAME_CHARS && payload.len() != FRAME_LEGACY_CHARS {
            return Err(WireError::LengthMismatch {
                expected: "3072 or 3336",
                got: payload.len(),
            });
        }
        ensure_hex(payload)?;
        return Ok(Packet::Frame {
            loc_id,
            client_ip: client_ip.to_string(),
            payload: payload.to_string(),
        });
    }
    if content.starts_with("Sensor") {
        let (loc_id, data) = split_loc_and_data(content, "Sensor")?;
        let readings = parse_readings(data.trim())?;
        return Ok(Packet::Sensor {
            loc_id,
            client_ip: client_ip.to_string(),
            readings,
        });
    }

    Err(WireError::UnknownType)
}

/// Splits `<kind>[loc]:<data>` or `<kind>:<loc>:<data>` or
/// `<kind>:<data>` into the optional location id and the data segment.
fn split_loc_and_data<'a>(
    content: &'a str,
    kind: &str,
) -> Result<(Option<String>, &'a str), WireError> {
    let (prefix, data) = content.split_once(':').ok_or(WireError::NoColon)?;
    if prefix.len() > kind.len() {
        // Suffix form: the id rides on the prefix itself.
        return Ok((Some(prefix[kind.len()..].to_string()), data));
    }
    if let Some((loc, rest)) = data.split_once(':') {
        return Ok((Some(loc.trim().to_string()), rest));
    }
    Ok((None, data))
}

fn ensure_hex(payload: &str) -> Result<(), WireError> {
    if payload.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(WireError::BadHex)
    }
}
