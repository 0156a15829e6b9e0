// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Persisted registry of known polling devices.

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use anyhow::{Context, Result, anyhow, ensure};
use rusqlite::{Connection, params};

use crate::cfg::enums::DeviceMode;

/// Default registry file in the working directory.
pub const DEVICES_DB: &str = "pfds_devices.db";

const SCHEMA_SQL: &str = "\
CREATE TABLE IF NOT EXISTS pfds_devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    ip TEXT NOT NULL,
    location_id TEXT,
    mode TEXT NOT NULL,
    poll_seconds INTEGER NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

/// One configured device. Identity is `id`; `ip` is unique in practice
/// but not enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: i64,
    pub name: String,
    pub ip: String,
    pub location_id: Option<String>,
    pub mode: DeviceMode,
    pub poll_seconds: u32,
}

pub struct DeviceRegistry {
    conn: Mutex<Connection>,
}

impl DeviceRegistry {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open {:?}", path.as_ref()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        conn.execute(SCHEMA_SQL, [])
            .context("failed to create pfds_devices table")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn add(
        &self,
        name: &str,
        ip: &str,
        location_id: Option<&str>,
        mode: DeviceMode,
        poll_seconds: u32,
    ) -> Result<i64> {
        ensure!(!name.is_empty(), "device name must not be empty");
        ensure!(!ip.is_empty(), "device ip must not be empty");
        ensure!(poll_seconds >= 1, "poll_seconds must be >= 1");
        let conn = self.lock();
        conn.execute(
            "INSERT INTO pfds_devices (name, ip, location_id, mode, poll_seconds) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, ip, location_id, mode.to_string(), poll_seconds],
        )
        .context("failed to insert device")?;
        Ok(conn.last_insert_rowid())
    }

    /// Every configured device, newest first.
    pub fn list(&self) -> Result<Vec<DeviceRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, ip, location_id, mode, poll_seconds \
             FROM pfds_devices ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut devices = Vec::new();
        for row in rows {
            let (id, name, ip, location_id, mode, poll) = row?;
            let mode = DeviceMode::parse(&mode)
                .ok_or_else(|| anyhow!("device {id} has unknown mode {mode:?}"))?;
            devices.push(DeviceRecord {
                id,
                name,
                ip,
                location_id,
                mode,
                poll_seconds: poll.max(1) as u32,
            });
        }
        Ok(devices)
    }

    pub fn update(&self, device: &DeviceRecord) -> Result<()> {
        ensure!(device.poll_seconds >= 1, "poll_seconds must be >= 1");
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE pfds_devices \
             SET name = ?1, ip = ?2, location_id = ?3, mode = ?4, poll_seconds = ?5 \
             WHERE id = ?6",
            params![
                device.name,
                device.ip,
                device.location_id,
                device.mode.to_string(),
                device.poll_seconds,
                device.id
            ],
        )?;
        ensure!(changed == 1, "no device with id {}", device.id);
        Ok(())
    }

    pub fn remove(&self, id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM pfds_devices WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}
