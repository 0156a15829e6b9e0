// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fs;

use pfds_sensor_rs::{
    cfg::enums::DeviceMode,
    packet_log::PacketLog,
    store::{DeviceRegistry, LocResolver},
};
use tempfile::TempDir;

fn resolver_in(dir: &TempDir) -> LocResolver {
    LocResolver::new(dir.path().join("ip_loc_map.db"), dir.path().join("ip_loc_map.json"))
}

#[test]
fn set_get_clear_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let resolver = resolver_in(&dir);

    assert_eq!(resolver.get("10.0.0.1"), None);
    resolver.set("10.0.0.1", "room1");
    assert_eq!(resolver.get("10.0.0.1"), Some("room1".to_string()));

    // Last write wins.
    resolver.set("10.0.0.1", "room2");
    assert_eq!(resolver.get("10.0.0.1"), Some("room2".to_string()));

    resolver.clear("10.0.0.1");
    assert_eq!(resolver.get("10.0.0.1"), None);
}

#[test]
fn mappings_survive_reopen() {
    let dir = TempDir::new().expect("tempdir");
    resolver_in(&dir).set("10.0.0.2", "boiler");
    let reopened = resolver_in(&dir);
    assert_eq!(reopened.get("10.0.0.2"), Some("boiler".to_string()));
}

#[test]
fn falls_back_to_json_when_sql_backend_is_unusable() {
    let dir = TempDir::new().expect("tempdir");
    // A directory at the database path makes every SQL open fail.
    let db_path = dir.path().join("ip_loc_map.db");
    fs::create_dir(&db_path).expect("block db path");

    let resolver =
        LocResolver::new(db_path.clone(), dir.path().join("ip_loc_map.json"));
    resolver.set("10.0.0.3", "dock");
    assert_eq!(resolver.get("10.0.0.3"), Some("dock".to_string()));

    // The mapping really landed in the JSON file.
    let text = fs::read_to_string(dir.path().join("ip_loc_map.json")).expect("json");
    assert!(text.contains("dock"));
}

#[test]
fn json_and_csv_import_export_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let resolver = resolver_in(&dir);
    resolver.set("10.0.0.1", "room1");
    resolver.set("10.0.0.2", "room2");

    let json_path = dir.path().join("export.json");
    assert_eq!(resolver.export_json(&json_path).expect("export json"), 2);
    let csv_path = dir.path().join("export.csv");
    assert_eq!(resolver.export_csv(&csv_path).expect("export csv"), 2);
    let csv = fs::read_to_string(&csv_path).expect("csv");
    assert!(csv.starts_with("ip,loc_id\n"));

    // Import into a fresh store; existing keys are overwritten.
    let dir2 = TempDir::new().expect("tempdir");
    let other = resolver_in(&dir2);
    other.set("10.0.0.1", "stale");
    assert_eq!(other.import_json(&json_path).expect("import json"), 2);
    assert_eq!(other.get("10.0.0.1"), Some("room1".to_string()));
    assert_eq!(other.get("10.0.0.2"), Some("room2".to_string()));

    let dir3 = TempDir::new().expect("tempdir");
    let third = resolver_in(&dir3);
    assert_eq!(third.import_csv(&csv_path).expect("import csv"), 2);
    assert_eq!(third.get("10.0.0.2"), Some("room2".to_string()));
}

#[test]
fn import_lands_wholly_in_json_when_sql_backend_is_unusable() {
    let dir = TempDir::new().expect("tempdir");
    let db_path = dir.path().join("ip_loc_map.db");
    fs::create_dir(&db_path).expect("block db path");
    let resolver =
        LocResolver::new(db_path.clone(), dir.path().join("ip_loc_map.json"));

    let import_path = dir.path().join("import.json");
    fs::write(&import_path, r#"{"10.0.0.1": "room1", "10.0.0.2": "room2"}"#)
        .expect("write import");
    assert_eq!(resolver.import_json(&import_path).expect("import"), 2);

    // Both rows went to the fallback file together.
    let text = fs::read_to_string(dir.path().join("ip_loc_map.json")).expect("json");
    assert!(text.contains("room1") && text.contains("room2"));
    assert_eq!(resolver.get("10.0.0.2"), Some("room2".to_string()));
}

#[test]
fn csv_import_rejects_empty_files() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("empty.csv");
    fs::write(&path, "ip,loc_id\n").expect("write");
    assert!(resolver_in(&dir).import_csv(&path).is_err());
}

#[test]
fn registry_crud_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let registry =
        DeviceRegistry::open(dir.path().join("pfds_devices.db")).expect("open");

    let a = registry
        .add("north hall", "10.0.0.1", Some("hall-n"), DeviceMode::Continuous, 5)
        .expect("add a");
    let b = registry
        .add("dock", "10.0.0.2", None, DeviceMode::OnDemand, 30)
        .expect("add b");
    assert!(b > a);

    // Newest first.
    let devices = registry.list().expect("list");
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].name, "dock");
    assert_eq!(devices[1].location_id.as_deref(), Some("hall-n"));
    assert_eq!(devices[1].mode, DeviceMode::Continuous);

    let mut dock = devices[0].clone();
    dock.poll_seconds = 10;
    dock.mode = DeviceMode::Continuous;
    registry.update(&dock).expect("update");
    let devices = registry.list().expect("list after update");
    assert_eq!(devices[0].poll_seconds, 10);
    assert_eq!(devices[0].mode, DeviceMode::Continuous);

    registry.remove(a).expect("remove");
    assert_eq!(registry.list().expect("list after remove").len(), 1);
}

#[test]
fn registry_rejects_bad_rows() {
    let dir = TempDir::new().expect("tempdir");
    let registry =
        DeviceRegistry::open(dir.path().join("pfds_devices.db")).expect("open");
    assert!(registry.add("", "10.0.0.1", None, DeviceMode::OnDemand, 5).is_err());
    assert!(registry.add("x", "10.0.0.1", None, DeviceMode::OnDemand, 0).is_err());
}

#[test]
fn packet_log_rotates_and_truncates() {
    let dir = TempDir::new().expect("tempdir");
    let log = PacketLog::new(dir.path());

    log.log_raw("#serialno:SIM1!", "room1");
    let long_raw = "#frame:".to_string() + &"F".repeat(500);
    log.log_error("frame length 500", &long_raw, "room1");

    let debug = fs::read_to_string(log.debug_path()).expect("debug log");
    assert!(debug.contains("\troom1\tRAW\t#serialno:SIM1!"));

    let errors = fs::read_to_string(log.error_path()).expect("error log");
    let line = errors.lines().next().expect("one error line");
    assert!(line.contains("\tERROR\tframe length 500\t"));
    // The raw copy is truncated, never the whole payload.
    assert!(line.len() < 220);
}
