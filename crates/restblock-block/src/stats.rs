//! Per-device I/O statistics
//!
//! Counters are updated lock-free by the worker threads and read as a
//! [`IoStatsSnapshot`] by the control surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::request::Direction;

/// Bucket upper bounds in microseconds
///
/// Range requests are network round trips, so the buckets start at 100us and
/// reach into seconds for retried requests.
const BUCKET_BOUNDARIES_US: [u64; 16] = [
    100,        // 0: 0-100us
    250,        // 1: 100-250us
    500,        // 2: 250-500us
    1_000,      // 3: 500us-1ms
    2_500,      // 4: 1-2.5ms
    5_000,      // 5: 2.5-5ms
    10_000,     // 6: 5-10ms
    25_000,     // 7: 10-25ms
    50_000,     // 8: 25-50ms
    100_000,    // 9: 50-100ms
    250_000,    // 10: 100-250ms
    500_000,    // 11: 250-500ms
    1_000_000,  // 12: 500ms-1s
    5_000_000,  // 13: 1-5s
    30_000_000, // 14: 5-30s
    u64::MAX,   // 15: 30s+
];

/// Latency histogram with fixed logarithmic buckets
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 16],
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl LatencyHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Record a latency sample in microseconds
    pub fn record(&self, latency_us: u64) {
        let bucket_idx = BUCKET_BOUNDARIES_US
            .iter()
            .position(|&boundary| latency_us < boundary)
            .unwrap_or(15);

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(latency_us, Ordering::Relaxed);
        self.max.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Average latency in microseconds
    pub fn avg(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        self.sum.load(Ordering::Relaxed) / count
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket holding the given percentile (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percentile(&self, percentile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let target = ((total as f64) * percentile).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return BUCKET_BOUNDARIES_US[i];
            }
        }
        BUCKET_BOUNDARIES_US[15]
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency summary in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub avg: u64,
    pub max: u64,
    pub p50: u64,
    pub p99: u64,
}

impl LatencySummary {
    fn from_histogram(histogram: &LatencyHistogram) -> Self {
        Self {
            avg: histogram.avg(),
            max: histogram.max(),
            p50: histogram.percentile(0.50),
            p99: histogram.percentile(0.99),
        }
    }
}

/// I/O counters for one device
#[derive(Debug, Default)]
pub struct IoStats {
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    /// Range operations that failed after all attempts
    failed_ops: AtomicU64,
    read_latency: LatencyHistogram,
    write_latency: LatencyHistogram,
}

impl IoStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one served request
    pub fn record(&self, direction: Direction, bytes: usize, latency: Duration, ok: bool) {
        let latency_us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let bytes = bytes as u64;
        match direction {
            Direction::Read => {
                self.read_ops.fetch_add(1, Ordering::Relaxed);
                self.read_latency.record(latency_us);
                if ok {
                    self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
                }
            }
            Direction::Write => {
                self.write_ops.fetch_add(1, Ordering::Relaxed);
                self.write_latency.record(latency_us);
                if ok {
                    self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
                }
            }
        }
        if !ok {
            self.failed_ops.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn read_ops(&self) -> u64 {
        self.read_ops.load(Ordering::Relaxed)
    }

    pub fn write_ops(&self) -> u64 {
        self.write_ops.load(Ordering::Relaxed)
    }

    pub fn failed_ops(&self) -> u64 {
        self.failed_ops.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            read_ops: self.read_ops(),
            write_ops: self.write_ops(),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            failed_ops: self.failed_ops(),
            read_latency_us: LatencySummary::from_histogram(&self.read_latency),
            write_latency_us: LatencySummary::from_histogram(&self.write_latency),
        }
    }

    pub fn reset(&self) {
        self.read_ops.store(0, Ordering::Relaxed);
        self.write_ops.store(0, Ordering::Relaxed);
        self.read_bytes.store(0, Ordering::Relaxed);
        self.write_bytes.store(0, Ordering::Relaxed);
        self.failed_ops.store(0, Ordering::Relaxed);
        self.read_latency.reset();
        self.write_latency.reset();
    }
}

/// Point-in-time copy of [`IoStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoStatsSnapshot {
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub failed_ops: u64,
    pub read_latency_us: LatencySummary,
    pub write_latency_us: LatencySummary,
}
