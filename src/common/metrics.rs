//! Process-wide metrics in Prometheus text format
//!
//! Counters and gauges are plain atomics. Write latency is tracked in a
//! fixed-bucket histogram (milliseconds).

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const LATENCY_BUCKETS: [f64; 10] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

#[derive(Debug)]
pub struct Histogram {
    boundaries: &'static [f64],
    buckets: Vec<AtomicU64>,
    /// Sum in microseconds
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            boundaries: &LATENCY_BUCKETS,
            buckets: (0..=LATENCY_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let idx = self
            .boundaries
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(upper bound, count)` pairs, ending with `+Inf`
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            running += bucket.load(Ordering::Relaxed);
            let bound = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            out.push((bound, running));
        }
        out
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_ms(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    pub writes_total: Counter,
    pub writes_not_leader: Counter,
    pub apply_timeouts: Counter,
    pub entries_applied: Counter,
    pub conf_changes_applied: Counter,
    pub snapshots_created: Counter,
    pub snapshots_restored: Counter,
    pub snapshot_failures: Counter,
    pub apply_halted: Gauge,
    pub membership_events: Counter,
    pub ring_members: Gauge,
    pub write_latency: Histogram,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            writes_total: Counter::default(),
            writes_not_leader: Counter::default(),
            apply_timeouts: Counter::default(),
            entries_applied: Counter::default(),
            conf_changes_applied: Counter::default(),
            snapshots_created: Counter::default(),
            snapshots_restored: Counter::default(),
            snapshot_failures: Counter::default(),
            apply_halted: Gauge::default(),
            membership_events: Counter::default(),
            ring_members: Gauge::default(),
            write_latency: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let scalars: [(&str, &str, &str, u64); 12] = [
            ("writes_total", "counter", "Writes accepted by this node", self.writes_total.get()),
            ("writes_not_leader_total", "counter", "Writes rejected because this node is not leader", self.writes_not_leader.get()),
            ("apply_timeouts_total", "counter", "Writes that timed out waiting for commit", self.apply_timeouts.get()),
            ("entries_applied_total", "counter", "Commands applied to the state machine", self.entries_applied.get()),
            ("conf_changes_applied_total", "counter", "Membership changes applied", self.conf_changes_applied.get()),
            ("snapshots_created_total", "counter", "Snapshots taken", self.snapshots_created.get()),
            ("snapshots_restored_total", "counter", "Snapshots restored", self.snapshots_restored.get()),
            ("snapshot_failures_total", "counter", "Snapshot persist or restore failures", self.snapshot_failures.get()),
            ("apply_halted", "gauge", "1 if the apply loop stopped on a fatal error", self.apply_halted.get()),
            ("membership_events_total", "counter", "Membership events consumed by the ring", self.membership_events.get()),
            ("ring_members", "gauge", "Members currently on the hash ring", self.ring_members.get()),
            ("uptime_seconds", "gauge", "Process uptime in seconds", self.uptime_seconds()),
        ];

        for (name, kind, help, value) in scalars {
            let _ = writeln!(out, "# HELP kvmesh_{} {}", name, help);
            let _ = writeln!(out, "# TYPE kvmesh_{} {}", name, kind);
            let _ = writeln!(out, "kvmesh_{} {}", name, value);
        }

        out.push_str("# HELP kvmesh_write_duration_ms Write latency until applied\n");
        out.push_str("# TYPE kvmesh_write_duration_ms histogram\n");
        for (le, count) in self.write_latency.cumulative() {
            let le = if le.is_infinite() {
                "+Inf".to_string()
            } else {
                le.to_string()
            };
            let _ = writeln!(out, "kvmesh_write_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
        }
        let _ = writeln!(out, "kvmesh_write_duration_ms_sum {}", self.write_latency.sum_ms());
        let _ = writeln!(out, "kvmesh_write_duration_ms_count {}", self.write_latency.count());

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
