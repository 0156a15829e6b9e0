// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Rotating capture files for the raw wire traffic.
//!
//! `tcp_debug.log` records every raw line (and outbound command) with
//! a UTC timestamp and location id; `tcp_errors.log` records parse and
//! validation failures with the reason and a truncated copy of the
//! offending line. Both rotate at 5 MB keeping three generations.
//! Nothing here ever raises: a capture failure must not touch the
//! packet path.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};
use tracing::warn;

const MAX_SIZE_BYTES: u64 = 5 * 1024 * 1024;
const ROTATE_KEEP: u32 = 3;
/// Raw text in error entries is cut here to keep the log line bounded.
const ERROR_RAW_MAX: usize = 120;

pub const DEBUG_LOG_NAME: &str = "tcp_debug.log";
pub const ERROR_LOG_NAME: &str = "tcp_errors.log";

#[derive(Debug, Clone)]
pub struct PacketLog {
    debug_path: PathBuf,
    error_path: PathBuf,
}

impl PacketLog {
    /// Creates the capture directory (best effort) and returns the log
    /// handle.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        if let Err(e) = fs::create_dir_all(dir) {
            warn!("could not create packet log dir {dir:?}: {e}");
        }
        Self {
            debug_path: dir.join(DEBUG_LOG_NAME),
            error_path: dir.join(ERROR_LOG_NAME),
        }
    }

    /// Records one raw inbound line (or outbound command) for a
    /// location.
    pub fn log_raw(&self, raw: &str, loc_id: &str) {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        write_line(&self.debug_path, &format!("{ts}\t{loc_id}\tRAW\t{raw}"));
    }

    /// Records a parse/validation failure with a truncated raw copy.
    pub fn log_error(&self, reason: &str, raw: &str, loc_id: &str) {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let raw = truncate(raw, ERROR_RAW_MAX);
        write_line(
            &self.error_path,
            &format!("{ts}\t{loc_id}\tERROR\t{reason}\t{raw}"),
        );
    }

    pub fn debug_path(&self) -> &Path {
        &self.debug_path
    }

    pub fn error_path(&self) -> &Path {
        &self.error_path
    }
}

fn truncate(raw: &str, max: usize) -> &str {
    if raw.len() <= max {
        return raw;
    }
    // Cut on a char boundary at or below the byte limit.
    let mut end = max;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    &raw[..end]
}

fn write_line(path: &Path, line: &str) {
    rotate_if_needed(path);
    let file = OpenOptions::new().create(true).append(true).open(path);
    match file {
        Ok(mut f) => {
            let _ = writeln!(f, "{line}");
        },
        Err(_) => {
            // Swallowed: capture must never fail the packet path.
        },
    }
}

fn rotate_if_needed(path: &Path) {
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    if meta.len() < MAX_SIZE_BYTES {
        return;
    }
    // Shift .1 -> .2 -> .3, discarding the oldest generation.
    for i in (1..=ROTATE_KEEP).rev() {
        let src = numbered(path, i);
        if i == ROTATE_KEEP {
            let _ = fs::remove_file(&src);
        } else {
            let _ = fs::rename(&src, numbered(path, i + 1));
        }
    }
    let _ = fs::rename(path, numbered(path, 1));
}

fn numbered(path: &Path, i: u32) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(format!(".{i}"));
    PathBuf::from(p)
}
