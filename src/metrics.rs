// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ingest counters and gauges. Everything is a plain atomic so the
//! packet path never blocks on instrumentation.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct Metrics {
    packets_total: AtomicU64,
    errors_total: AtomicU64,
    packets_per_loc: DashMap<String, AtomicU64>,
    errors_per_loc: DashMap<String, AtomicU64>,
    queue_depth: AtomicU64,
    queue_dropped_total: AtomicU64,
    active_connections: AtomicU64,
    eeprom_requests_total: AtomicU64,
    periodic_on_failsafe_fired_total: AtomicU64,
    frames_withheld_total: AtomicU64,
    latency_us_sum: AtomicU64,
    latency_count: AtomicU64,
    latency_us_max: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet(&self, loc_id: &str, latency_us: u64) {
        self.packets_total.fetch_add(1, Ordering::Relaxed);
        bump(&self.packets_per_loc, loc_id);
        self.latency_us_sum.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_us_max.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn record_error(&self, loc_id: &str) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        bump(&self.errors_per_loc, loc_id);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn set_queue_dropped_total(&self, dropped: u64) {
        self.queue_dropped_total.store(dropped, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) -> u64 {
        self.active_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connection_closed(&self) -> u64 {
        self.active_connections.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn record_eeprom_request(&self) {
        self.eeprom_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_periodic_on_failsafe(&self) {
        self.periodic_on_failsafe_fired_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_withheld(&self) {
        self.frames_withheld_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter, for status surfaces and
    /// tests.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_total: self.packets_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            packets_per_loc: collect(&self.packets_per_loc),
            errors_per_loc: collect(&self.errors_per_loc),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_dropped_total: self.queue_dropped_total.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            eeprom_requests_total: self.eeprom_requests_total.load(Ordering::Relaxed),
            periodic_on_failsafe_fired_total: self
                .periodic_on_failsafe_fired_total
                .load(Ordering::Relaxed),
            frames_withheld_total: self.frames_withheld_total.load(Ordering::Relaxed),
            latency_us_sum: self.latency_us_sum.load(Ordering::Relaxed),
            latency_count: self.latency_count.load(Ordering::Relaxed),
            latency_us_max: self.latency_us_max.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_total: u64,
    pub errors_total: u64,
    pub packets_per_loc: BTreeMap<String, u64>,
    pub errors_per_loc: BTreeMap<String, u64>,
    pub queue_depth: u64,
    pub queue_dropped_total: u64,
    pub active_connections: u64,
    pub eeprom_requests_total: u64,
    pub periodic_on_failsafe_fired_total: u64,
    pub frames_withheld_total: u64,
    pub latency_us_sum: u64,
    pub latency_count: u64,
    pub latency_us_max: u64,
}

impl MetricsSnapshot {
    pub fn mean_latency_us(&self) -> f64 {
        if self.latency_count == 0 {
            return 0.0;
        }
        self.latency_us_sum as f64 / self.latency_count as f64
    }
}

fn bump(map: &DashMap<String, AtomicU64>, key: &str) {
    if let Some(counter) = map.get(key) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    map.entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn collect(map: &DashMap<String, AtomicU64>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect()
}
