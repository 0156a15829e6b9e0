// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-IP to location-id mapping with dual-backend persistence.
//!
//! SQLite is the primary store; any SQL failure (open, prepare,
//! execute) drops the call through to a JSON object file with the same
//! semantics, so a locked or corrupted database never loses the
//! mapping function. Every entry point serializes on one process-wide
//! mutex across both backends.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result, ensure};
use rusqlite::{Connection, params};
use tracing::{debug, warn};

const CREATE_SQL: &str =
    "CREATE TABLE IF NOT EXISTS mappings (ip TEXT PRIMARY KEY, loc_id TEXT)";

pub struct LocResolver {
    inner: Mutex<ResolverInner>,
}

struct ResolverInner {
    db_path: PathBuf,
    json_path: PathBuf,
    /// Lazily-loaded JSON fallback contents.
    cache: Option<BTreeMap<String, String>>,
}

impl LocResolver {
    pub fn new<P: AsRef<Path>>(db_path: P, json_path: P) -> Self {
        Self {
            inner: Mutex::new(ResolverInner {
                db_path: db_path.as_ref().to_path_buf(),
                json_path: json_path.as_ref().to_path_buf(),
                cache: None,
            }),
        }
    }

    /// Persists a mapping; idempotent, last write wins.
    pub fn set(&self, ip: &str, loc_id: &str) {
        if ip.is_empty() || loc_id.is_empty() {
            return;
        }
        let mut inner = lock(&self.inner);
        if let Some(conn) = inner.open_db() {
            let res = conn.execute(
                "INSERT OR REPLACE INTO mappings (ip, loc_id) VALUES (?1, ?2)",
                params![ip, loc_id],
            );
            match res {
                Ok(_) => return,
                Err(e) => warn!("mapping insert failed, using JSON fallback: {e}"),
            }
        }
        inner.json_entries_mut().insert(ip.to_string(), loc_id.to_string());
        inner.json_save();
    }

    /// Resolves the location id mapped to `ip`, if any. Side-effect
    /// free.
    pub fn get(&self, ip: &str) -> Option<String> {
        if ip.is_empty() {
            return None;
        }
        let mut inner = lock(&self.inner);
        if let Some(conn) = inner.open_db() {
            let res = conn.query_row(
                "SELECT loc_id FROM mappings WHERE ip = ?1",
                params![ip],
                |row| row.get::<_, String>(0),
            );
            match res {
                Ok(loc) => return Some(loc),
                Err(rusqlite::Error::QueryReturnedNoRows) => return None,
                Err(e) => warn!("mapping lookup failed, using JSON fallback: {e}"),
            }
        }
        inner.json_entries_mut().get(ip).cloned()
    }

    /// Removes the mapping for `ip`, in whichever backend holds it.
    pub fn clear(&self, ip: &str) {
        if ip.is_empty() {
            return;
        }
        let mut inner = lock(&self.inner);
        if let Some(conn) = inner.open_db() {
            match conn.execute("DELETE FROM mappings WHERE ip = ?1", params![ip]) {
                Ok(_) => return,
                Err(e) => warn!("mapping delete failed, using JSON fallback: {e}"),
            }
        }
        if inner.json_entries_mut().remove(ip).is_some() {
            inner.json_save();
        }
    }

    /// Snapshot of every mapping, ordered by IP.
    pub fn all(&self) -> BTreeMap<String, String> {
        let mut inner = lock(&self.inner);
        if let Some(conn) = inner.open_db() {
            if let Ok(map) = read_all(&conn) {
                return map;
            }
        }
        inner.json_entries_mut().clone()
    }

    pub fn export_json<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let data = self.all();
        let text = serde_json::to_string_pretty(&data)?;
        fs::write(&path, text)
            .with_context(|| format!("failed to write {:?}", path.as_ref()))?;
        Ok(data.len())
    }

    /// Imports a JSON object file; existing keys are overwritten.
    pub fn import_json<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {:?}", path.as_ref()))?;
        let data: BTreeMap<String, String> =
            serde_json::from_str(&text).context("mapping import is not a JSON object")?;
        let rows: Vec<(String, String)> = data
            .into_iter()
            .filter(|(ip, loc)| !ip.is_empty() && !loc.is_empty())
            .collect();
        self.import_rows(&rows);
        Ok(rows.len())
    }

    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let data = self.all();
        let mut out = String::from("ip,loc_id\n");
        for (ip, loc) in &data {
            out.push_str(ip);
            out.push(',');
            out.push_str(loc);
            out.push('\n');
        }
        fs::write(&path, out)
            .with_context(|| format!("failed to write {:?}", path.as_ref()))?;
        Ok(data.len())
    }

    /// Imports `ip,loc_id` rows; a header line is tolerated and
    /// skipped, later rows win over earlier ones.
    pub fn import_csv<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {:?}", path.as_ref()))?;
        let mut rows: Vec<(String, String)> = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || (i == 0 && line.to_lowercase().starts_with("ip,")) {
                continue;
            }
            let mut parts = line.split(',').map(str::trim);
            if let (Some(ip), Some(loc)) = (parts.next(), parts.next()) {
                if !ip.is_empty() && !loc.is_empty() {
                    rows.push((ip.to_string(), loc.to_string()));
                }
            }
        }
        ensure!(!rows.is_empty(), "no usable rows in {:?}", path.as_ref());
        let imported = rows.len();
        self.import_rows(&rows);
        Ok(imported)
    }

    /// Persists a batch of mappings as one unit: a single SQL
    /// transaction over one connection, or (if that transaction fails
    /// as a whole) the JSON fallback updated and saved once. A partial
    /// import is never left behind.
    fn import_rows(&self, rows: &[(String, String)]) {
        let mut inner = lock(&self.inner);
        if let Some(mut conn) = inner.open_db() {
            match insert_rows_tx(&mut conn, rows) {
                Ok(()) => return,
                Err(e) => {
                    warn!("mapping import transaction failed, using JSON fallback: {e}")
                },
            }
        }
        let entries = inner.json_entries_mut();
        for (ip, loc) in rows {
            entries.insert(ip.clone(), loc.clone());
        }
        inner.json_save();
    }
}

impl ResolverInner {
    /// Opens (and initializes) the SQLite backend; `None` means fall
    /// back to JSON for this call.
    fn open_db(&self) -> Option<Connection> {
        let conn = match Connection::open(&self.db_path) {
            Ok(c) => c,
            Err(e) => {
                debug!("mapping db open failed: {e}");
                return None;
            },
        };
        if let Err(e) = conn.execute(CREATE_SQL, []) {
            debug!("mapping table init failed: {e}");
            return None;
        }
        Some(conn)
    }

    fn json_entries_mut(&mut self) -> &mut BTreeMap<String, String> {
        let json_path = &self.json_path;
        self.cache.get_or_insert_with(|| {
            fs::read_to_string(json_path)
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
                .unwrap_or_default()
        })
    }

    fn json_save(&mut self) {
        let Some(cache) = &self.cache else {
            return;
        };
        match serde_json::to_string_pretty(cache) {
            Ok(text) => {
                if let Err(e) = fs::write(&self.json_path, text) {
                    warn!("mapping JSON save failed: {e}");
                }
            },
            Err(e) => warn!("mapping JSON encode failed: {e}"),
        }
    }
}

fn insert_rows_tx(
    conn: &mut Connection,
    rows: &[(String, String)],
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for (ip, loc) in rows {
        tx.execute(
            "INSERT OR REPLACE INTO mappings (ip, loc_id) VALUES (?1, ?2)",
            params![ip, loc],
        )?;
    }
    tx.commit()
}

fn read_all(conn: &Connection) -> rusqlite::Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare("SELECT ip, loc_id FROM mappings")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut map = BTreeMap::new();
    for row in rows {
        let (ip, loc) = row?;
        map.insert(ip, loc);
    }
    Ok(map)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A poisoned lock only means another thread panicked mid-write;
    // the mapping data itself is consistent per operation.
    m.lock().unwrap_or_else(|e| e.into_inner())
}
