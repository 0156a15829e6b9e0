// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bounded drop-oldest line queue between the reader tasks and the
//! batch parser.
//!
//! Overflow evicts the OLDEST entry: under sustained overload fresh
//! frames displace stale ones and latency stays bounded. No await ever
//! happens inside the critical section.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::time::Instant;

/// One raw line waiting to be parsed.
#[derive(Debug, Clone)]
pub struct RawLine {
    pub line: String,
    pub client_ip: String,
    /// Enqueue time, for the enqueue-to-handled latency metric.
    pub enqueued_at: Instant,
}

#[derive(Debug)]
pub struct PacketQueue {
    inner: Mutex<VecDeque<RawLine>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues a line, evicting the oldest entry when full. Returns
    /// true when an eviction happened.
    pub fn push(&self, item: RawLine) -> bool {
        let mut q = lock(&self.inner);
        let mut evicted = false;
        if q.len() >= self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            evicted = true;
        }
        q.push_back(item);
        evicted
    }

    /// Removes up to `max` entries from the front, oldest first.
    pub fn drain(&self, max: usize) -> Vec<RawLine> {
        let mut q = lock(&self.inner);
        let n = q.len().min(max);
        q.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
